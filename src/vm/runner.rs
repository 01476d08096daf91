use crate::types::MatchClass;
use crate::vm::instruction::{opcode, operand_a, operand_b, operand_c, Instruction, Opcode};
use crate::vm::program::Program;
use crate::vm::runtime::{Params, Runtime, Value};

/// Negative quota disables the ceiling.
pub type Quota = i64;
pub const NO_QUOTA: Quota = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Inactive,
    Completed,
    QuotaExceeded,
    Fatal,
}

pub type TraceLogger<'a> = Box<dyn FnMut(Instruction, usize, usize) + 'a>;

/// Executes one handler: a value stack, the handler's register file,
/// an instruction pointer and an optional instruction quota. The
/// dispatch loop is a plain match per opcode.
pub struct Runner<'a> {
    program: &'a Program,
    runtime: &'a Runtime,
    handler: usize,
    globals: &'a mut Vec<Value>,
    quota: Quota,
    status: RunStatus,
    trace: Option<TraceLogger<'a>>,
    stack: Vec<Value>,
    registers: Vec<Value>,
    regex_groups: Vec<String>,
}

impl<'a> Runner<'a> {
    pub fn new(
        program: &'a Program,
        runtime: &'a Runtime,
        handler: usize,
        globals: &'a mut Vec<Value>,
        quota: Quota,
    ) -> Runner<'a> {
        Runner {
            program,
            runtime,
            handler,
            globals,
            quota,
            status: RunStatus::Inactive,
            trace: None,
            stack: Vec::new(),
            registers: Vec::new(),
            regex_groups: Vec::new(),
        }
    }

    pub fn set_trace(&mut self, trace: TraceLogger<'a>) {
        self.trace = Some(trace);
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Void)
    }

    fn pop2(&mut self) -> (Value, Value) {
        let b = self.pop();
        let a = self.pop();
        (a, b)
    }

    fn fatal(&mut self) -> bool {
        self.status = RunStatus::Fatal;
        false
    }

    /// Runs the handler to completion, error or quota exhaustion. The
    /// boolean result is the handler's policy decision.
    pub fn run(&mut self) -> bool {
        let handler = self.program.handler(self.handler);
        let code = &handler.code;
        let pool = &self.program.pool;

        self.registers = vec![Value::Void; handler.stack_size];
        if self.globals.len() < self.program.globals_count {
            self.globals
                .resize(self.program.globals_count, Value::Void);
        }

        let mut ip = 0usize;
        loop {
            let instr = match code.get(ip) {
                Some(instr) => *instr,
                None => return self.fatal(),
            };

            if self.quota >= 0 {
                if self.quota == 0 {
                    self.status = RunStatus::QuotaExceeded;
                    return false;
                }
                self.quota -= 1;
            }

            if let Some(trace) = &mut self.trace {
                trace(instr, ip, self.stack.len());
            }

            let op = match opcode(instr) {
                Some(op) => op,
                None => return self.fatal(),
            };
            let a = operand_a(instr);
            let b = operand_b(instr);
            let c = operand_c(instr);

            match op {
                Opcode::Nop => {}

                // control
                Opcode::Exit => {
                    self.status = RunStatus::Completed;
                    return a != 0;
                }
                Opcode::Ret => {
                    let result = self.pop();
                    self.status = RunStatus::Completed;
                    return result.as_boolean();
                }
                Opcode::Br => {
                    ip = a;
                    continue;
                }
                Opcode::CondBr => {
                    let cond = self.pop();
                    ip = if cond.as_boolean() { a } else { b };
                    continue;
                }
                Opcode::Match => {
                    let subject = self.pop();
                    let subject = subject.as_str();
                    let def = pool.get_match_def(a);

                    let mut target = def.else_pc;
                    for case in &def.cases {
                        let hit = match def.class {
                            MatchClass::Same => pool.get_string(case.label) == subject,
                            MatchClass::Head => subject.starts_with(pool.get_string(case.label)),
                            MatchClass::Tail => subject.ends_with(pool.get_string(case.label)),
                            MatchClass::RegExp => {
                                match pool.get_regexp(case.label).captures(subject) {
                                    Some(groups) => {
                                        self.regex_groups = groups;
                                        true
                                    }
                                    None => false,
                                }
                            }
                        };
                        if hit {
                            target = case.pc;
                            break;
                        }
                    }
                    ip = target;
                    continue;
                }

                // register file
                Opcode::Load => self.stack.push(self.registers[a].clone()),
                Opcode::Store => self.registers[a] = self.pop(),
                Opcode::GLoad => self.stack.push(self.globals[a].clone()),
                Opcode::GStore => self.globals[a] = self.pop(),

                // constants
                Opcode::ILoad => self.stack.push(Value::Number(a as i64)),
                Opcode::NConst => self.stack.push(Value::Number(pool.get_integer(a))),
                Opcode::SConst => self
                    .stack
                    .push(Value::String(pool.get_string(a).to_string())),
                Opcode::PConst => self.stack.push(Value::IP(pool.get_ipaddress(a))),
                Opcode::CConst => self.stack.push(Value::Cidr(*pool.get_cidr(a))),
                Opcode::RConst => self.stack.push(Value::RegExp(pool.get_regexp(a).clone())),
                Opcode::ITConst => self
                    .stack
                    .push(Value::IntArray(pool.get_integer_array(a).to_vec())),
                Opcode::STConst => self
                    .stack
                    .push(Value::StringArray(pool.get_string_array(a).to_vec())),
                Opcode::PTConst => self
                    .stack
                    .push(Value::IPAddrArray(pool.get_ipaddr_array(a).to_vec())),
                Opcode::CTConst => self
                    .stack
                    .push(Value::CidrArray(pool.get_cidr_array(a).to_vec())),

                // numeric
                Opcode::NNeg => {
                    let v = self.pop().as_number();
                    self.stack.push(Value::Number(v.wrapping_neg()));
                }
                Opcode::NNot => {
                    let v = self.pop().as_number();
                    self.stack.push(Value::Number(!v));
                }
                Opcode::NAdd => self.num_binop(|x, y| x.wrapping_add(y)),
                Opcode::NSub => self.num_binop(|x, y| x.wrapping_sub(y)),
                Opcode::NMul => self.num_binop(|x, y| x.wrapping_mul(y)),
                Opcode::NDiv => self.num_binop(|x, y| x.checked_div(y).unwrap_or(0)),
                Opcode::NRem => self.num_binop(|x, y| x.checked_rem(y).unwrap_or(0)),
                Opcode::NPow => self.num_binop(|x, y| {
                    if y < 0 {
                        0
                    } else {
                        x.wrapping_pow(y.min(u32::MAX as i64) as u32)
                    }
                }),
                Opcode::NShl => self.num_binop(|x, y| x.wrapping_shl(y as u32)),
                Opcode::NShr => self.num_binop(|x, y| x.wrapping_shr(y as u32)),
                Opcode::NAnd => self.num_binop(|x, y| x & y),
                Opcode::NOr => self.num_binop(|x, y| x | y),
                Opcode::NXor => self.num_binop(|x, y| x ^ y),
                Opcode::NCmpZ => {
                    let v = self.pop().as_number();
                    self.stack.push(Value::Boolean(v == 0));
                }
                Opcode::NCmpEq => self.num_cmp(|x, y| x == y),
                Opcode::NCmpNe => self.num_cmp(|x, y| x != y),
                Opcode::NCmpLe => self.num_cmp(|x, y| x <= y),
                Opcode::NCmpGe => self.num_cmp(|x, y| x >= y),
                Opcode::NCmpLt => self.num_cmp(|x, y| x < y),
                Opcode::NCmpGt => self.num_cmp(|x, y| x > y),

                // boolean
                Opcode::BNot => {
                    let v = self.pop().as_boolean();
                    self.stack.push(Value::Boolean(!v));
                }
                Opcode::BAnd => self.bool_binop(|x, y| x && y),
                Opcode::BOr => self.bool_binop(|x, y| x || y),
                Opcode::BXor => self.bool_binop(|x, y| x ^ y),

                // string
                Opcode::SAdd => {
                    let (x, y) = self.pop2();
                    self.stack
                        .push(Value::String(format!("{}{}", x.as_str(), y.as_str())));
                }
                Opcode::SLen => {
                    let v = self.pop();
                    self.stack.push(Value::Number(v.as_str().len() as i64));
                }
                Opcode::SIsEmpty => {
                    let v = self.pop();
                    self.stack.push(Value::Boolean(v.as_str().is_empty()));
                }
                Opcode::SCmpEq => self.str_cmp(|x, y| x == y),
                Opcode::SCmpNe => self.str_cmp(|x, y| x != y),
                Opcode::SCmpLe => self.str_cmp(|x, y| x <= y),
                Opcode::SCmpGe => self.str_cmp(|x, y| x >= y),
                Opcode::SCmpLt => self.str_cmp(|x, y| x < y),
                Opcode::SCmpGt => self.str_cmp(|x, y| x > y),
                Opcode::SCmpBeg => self.str_cmp(|x, y| x.starts_with(y)),
                Opcode::SCmpEnd => self.str_cmp(|x, y| x.ends_with(y)),
                Opcode::SContains => self.str_cmp(|x, y| y.contains(x)),
                Opcode::SRegMatch => {
                    let (subject, pattern) = self.pop2();
                    let matched = match pattern {
                        Value::RegExp(re) => match re.captures(subject.as_str()) {
                            Some(groups) => {
                                self.regex_groups = groups;
                                true
                            }
                            None => false,
                        },
                        _ => false,
                    };
                    self.stack.push(Value::Boolean(matched));
                }
                Opcode::SRegGroup => {
                    let group = self.regex_groups.get(a).cloned().unwrap_or_default();
                    self.stack.push(Value::String(group));
                }

                // ip / cidr
                Opcode::PCmpEq => {
                    let (x, y) = self.pop2();
                    self.stack.push(Value::Boolean(x == y));
                }
                Opcode::PCmpNe => {
                    let (x, y) = self.pop2();
                    self.stack.push(Value::Boolean(x != y));
                }
                Opcode::PInCidr => {
                    let (ip, cidr) = self.pop2();
                    let inside = match (ip, cidr) {
                        (Value::IP(ip), Value::Cidr(cidr)) => cidr.contains(&ip),
                        _ => false,
                    };
                    self.stack.push(Value::Boolean(inside));
                }

                // casts
                Opcode::N2S => {
                    let v = self.pop().as_number();
                    self.stack.push(Value::String(v.to_string()));
                }
                Opcode::S2N => {
                    let v = self.pop();
                    let n = v.as_str().trim().parse().unwrap_or(0);
                    self.stack.push(Value::Number(n));
                }
                Opcode::B2S => {
                    let v = self.pop().as_boolean();
                    self.stack.push(Value::String(v.to_string()));
                }
                Opcode::P2S | Opcode::C2S | Opcode::R2S => {
                    let v = self.pop();
                    self.stack.push(Value::String(v.to_string()));
                }

                // native dispatch
                Opcode::Call => {
                    let slot = match self.program.native_function_slot(a) {
                        Some(slot) => slot,
                        None => return self.fatal(),
                    };
                    let mut args = Vec::with_capacity(b);
                    for _ in 0..b {
                        args.push(self.pop());
                    }
                    args.reverse();
                    let mut params = Params::new(args);
                    self.runtime.callback(slot).invoke(&mut params);
                    if c != 0 {
                        self.stack.push(params.result().clone());
                    }
                }
                Opcode::Handler => {
                    let slot = match self.program.native_handler_slot(a) {
                        Some(slot) => slot,
                        None => return self.fatal(),
                    };
                    let mut args = Vec::with_capacity(b);
                    for _ in 0..b {
                        args.push(self.pop());
                    }
                    args.reverse();
                    let mut params = Params::new(args);
                    self.runtime.callback(slot).invoke(&mut params);
                    if params.result().as_boolean() {
                        self.status = RunStatus::Completed;
                        return true;
                    }
                }
            }

            ip += 1;
        }
    }

    fn num_binop(&mut self, f: impl Fn(i64, i64) -> i64) {
        let (x, y) = self.pop2();
        self.stack
            .push(Value::Number(f(x.as_number(), y.as_number())));
    }

    fn num_cmp(&mut self, f: impl Fn(i64, i64) -> bool) {
        let (x, y) = self.pop2();
        self.stack
            .push(Value::Boolean(f(x.as_number(), y.as_number())));
    }

    fn bool_binop(&mut self, f: impl Fn(bool, bool) -> bool) {
        let (x, y) = self.pop2();
        self.stack
            .push(Value::Boolean(f(x.as_boolean(), y.as_boolean())));
    }

    fn str_cmp(&mut self, f: impl Fn(&str, &str) -> bool) {
        let (x, y) = self.pop2();
        self.stack.push(Value::Boolean(f(x.as_str(), y.as_str())));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::instruction::make_instr;
    use crate::vm::program::{ConstantPool, Handler};

    fn program_with(code: Vec<Instruction>, pool: ConstantPool) -> Program {
        Program::new(
            pool,
            vec![Handler {
                name: "main".to_string(),
                stack_size: 4,
                code,
            }],
            0,
        )
    }

    fn run(program: &Program, runtime: &Runtime, quota: Quota) -> (bool, RunStatus) {
        let mut globals = Vec::new();
        let mut runner = Runner::new(program, runtime, 0, &mut globals, quota);
        let result = runner.run();
        (result, runner.status())
    }

    #[test]
    fn arithmetic_and_ret() {
        let code = vec![
            make_instr(Opcode::ILoad, 2, 0, 0),
            make_instr(Opcode::ILoad, 3, 0, 0),
            make_instr(Opcode::ILoad, 4, 0, 0),
            make_instr(Opcode::NMul, 0, 0, 0),
            make_instr(Opcode::NAdd, 0, 0, 0),
            make_instr(Opcode::ILoad, 14, 0, 0),
            make_instr(Opcode::NCmpEq, 0, 0, 0),
            make_instr(Opcode::Ret, 0, 0, 0),
        ];
        let program = program_with(code, ConstantPool::default());
        let runtime = Runtime::new();
        let (result, status) = run(&program, &runtime, NO_QUOTA);
        assert!(result);
        assert_eq!(status, RunStatus::Completed);
    }

    #[test]
    fn quota_bounds_execution_exactly() {
        use std::cell::Cell;
        use std::rc::Rc;

        // BR 0 loops forever
        let code = vec![make_instr(Opcode::Br, 0, 0, 0)];
        let program = program_with(code, ConstantPool::default());
        let runtime = Runtime::new();

        let mut globals = Vec::new();
        let dispatched = Rc::new(Cell::new(0usize));
        let counter = dispatched.clone();

        let mut runner = Runner::new(&program, &runtime, 0, &mut globals, 1000);
        runner.set_trace(Box::new(move |_, _, _| counter.set(counter.get() + 1)));
        let result = runner.run();
        assert!(!result);
        assert_eq!(runner.status(), RunStatus::QuotaExceeded);
        assert_eq!(dispatched.get(), 1000);
    }

    #[test]
    fn malformed_opcode_is_fatal() {
        let code = vec![0xFFFF_u64];
        let program = program_with(code, ConstantPool::default());
        let runtime = Runtime::new();
        let (result, status) = run(&program, &runtime, NO_QUOTA);
        assert!(!result);
        assert_eq!(status, RunStatus::Fatal);
    }

    #[test]
    fn registers_round_trip() {
        let code = vec![
            make_instr(Opcode::ILoad, 7, 0, 0),
            make_instr(Opcode::Store, 2, 0, 0),
            make_instr(Opcode::Load, 2, 0, 0),
            make_instr(Opcode::ILoad, 7, 0, 0),
            make_instr(Opcode::NCmpEq, 0, 0, 0),
            make_instr(Opcode::Ret, 0, 0, 0),
        ];
        let program = program_with(code, ConstantPool::default());
        let runtime = Runtime::new();
        let (result, _) = run(&program, &runtime, NO_QUOTA);
        assert!(result);
    }

    #[test]
    fn match_head_first_declared_wins() {
        let mut pool = ConstantPool::default();
        let subject = pool.make_string("/static/js/app.js");
        let broad = pool.make_string("/");
        let narrow = pool.make_string("/static/");
        let def = pool.make_match_def(crate::vm::program::MatchDef {
            class: MatchClass::Head,
            cases: vec![
                crate::vm::program::MatchCaseDef {
                    label: broad,
                    pc: 2,
                },
                crate::vm::program::MatchCaseDef {
                    label: narrow,
                    pc: 3,
                },
            ],
            else_pc: 4,
        });

        let code = vec![
            make_instr(Opcode::SConst, subject, 0, 0),
            make_instr(Opcode::Match, def, 0, 0),
            make_instr(Opcode::Exit, 1, 0, 0), // broad: both match, first wins
            make_instr(Opcode::Exit, 0, 0, 0), // narrow
            make_instr(Opcode::Exit, 0, 0, 0), // else
        ];
        let program = program_with(code, pool);
        let runtime = Runtime::new();
        let (result, _) = run(&program, &runtime, NO_QUOTA);
        assert!(result, "first declared case must win");
    }

    #[test]
    fn native_handler_true_stops_run() {
        let mut runtime = Runtime::new();
        runtime
            .register_handler("stop")
            .bind(|params| params.set_result(true));

        let mut pool = ConstantPool::default();
        let stop = pool.make_native_handler("stop()");
        let code = vec![
            make_instr(Opcode::Handler, stop, 0, 0),
            make_instr(Opcode::Exit, 0, 0, 0),
        ];
        let mut program = program_with(code, pool);
        let mut report = crate::diagnostics::Report::buffered();
        assert!(program.link(&runtime, &mut report));

        let (result, status) = run(&program, &runtime, NO_QUOTA);
        assert!(result);
        assert_eq!(status, RunStatus::Completed);
    }

    #[test]
    fn determinism_same_trace_twice() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let code = vec![
            make_instr(Opcode::ILoad, 1, 0, 0),
            make_instr(Opcode::ILoad, 2, 0, 0),
            make_instr(Opcode::NAdd, 0, 0, 0),
            make_instr(Opcode::Ret, 0, 0, 0),
        ];
        let program = program_with(code, ConstantPool::default());
        let runtime = Runtime::new();

        let trace_of = |program: &Program, runtime: &Runtime| {
            let trace = Rc::new(RefCell::new(Vec::new()));
            let collector = trace.clone();
            let mut globals = Vec::new();
            let mut runner = Runner::new(program, runtime, 0, &mut globals, 100);
            runner.set_trace(Box::new(move |instr, ip, sp| {
                collector.borrow_mut().push((instr, ip, sp))
            }));
            let result = runner.run();
            let trace = trace.borrow().clone();
            (result, trace)
        };

        let (r1, t1) = trace_of(&program, &runtime);
        let (r2, t2) = trace_of(&program, &runtime);
        assert_eq!(r1, r2);
        assert_eq!(t1, t2);
    }
}
