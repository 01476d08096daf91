use std::collections::{BTreeSet, HashMap};

use crate::codegen::regalloc::{allocate, Interval};
use crate::ir::model::{BlockId, Constant, IRHandler, IRProgram, InstrId, InstrKind, ValueId};
use crate::types::MatchClass;
use crate::vm::instruction::{make_instr, Instruction, Opcode};
use crate::vm::program::{ConstantPool, Handler, MatchCaseDef, MatchDef, Program};

/// Lowers optimized IR into flat bytecode: virtual registers by linear
/// scan, constants interned into the pool, branch targets patched to
/// absolute instruction indices, and a final `EXIT` on every handler.
pub struct TargetCodeGenerator {
    pool: ConstantPool,
}

impl TargetCodeGenerator {
    pub fn new() -> TargetCodeGenerator {
        TargetCodeGenerator {
            pool: ConstantPool::default(),
        }
    }

    pub fn generate(mut self, ir: &IRProgram) -> Program {
        self.pool.set_modules(ir.modules.clone());
        for native in &ir.native_functions {
            self.pool.make_native_function(native.signature.clone());
        }
        for native in &ir.native_handlers {
            self.pool.make_native_handler(native.signature.clone());
        }

        let handlers: Vec<Handler> = ir
            .handlers
            .iter()
            .map(|handler| self.generate_handler(handler, &ir.constants))
            .collect();

        Program::new(self.pool, handlers, ir.globals.len())
    }

    fn generate_handler(&mut self, handler: &IRHandler, constants: &[Constant]) -> Handler {
        // creation-order layout keeps loop bodies contiguous, which the
        // linear-scan intervals below rely on
        let reachable: BTreeSet<BlockId> = handler.reachable_blocks().into_iter().collect();
        let layout: Vec<BlockId> = handler
            .block_ids()
            .into_iter()
            .filter(|block| reachable.contains(block))
            .collect();

        // linearize for live intervals
        let mut position: HashMap<InstrId, usize> = HashMap::new();
        let mut order: Vec<InstrId> = Vec::new();
        for block in &layout {
            for id in &handler.block(*block).instrs {
                position.insert(*id, order.len());
                order.push(*id);
            }
        }

        let mut intervals = Vec::new();
        for id in &order {
            let instr = handler.instr(*id);
            let produces_value = instr.ty != crate::types::LiteralType::Void;
            if !produces_value {
                continue;
            }
            let def = position[id];
            let end = if matches!(instr.kind, InstrKind::Alloca) {
                // variables stay live for the whole handler
                usize::MAX
            } else {
                instr
                    .users
                    .iter()
                    .filter_map(|user| position.get(user).copied())
                    .max()
                    .unwrap_or(def)
            };
            intervals.push(Interval { id: *id, def, end });
        }
        let (registers, stack_size) = allocate(&intervals);

        // emission
        let mut code: Vec<Instruction> = Vec::new();
        let mut block_start: HashMap<BlockId, usize> = HashMap::new();
        let mut branch_fixups: Vec<(usize, BlockId, bool)> = Vec::new(); // (pc, block, is_b_operand)
        let mut match_fixups: Vec<(usize, Vec<BlockId>, BlockId)> = Vec::new();

        for block in &layout {
            block_start.insert(*block, code.len());
            for id in &handler.block(*block).instrs {
                self.emit_instr(
                    handler,
                    constants,
                    &registers,
                    *id,
                    &mut code,
                    &mut branch_fixups,
                    &mut match_fixups,
                );
            }
        }
        code.push(make_instr(Opcode::Exit, 0, 0, 0));

        // resolve branch targets to absolute instruction indices
        for (pc, block, is_b) in branch_fixups {
            let target = block_start[&block];
            let instr = code[pc];
            code[pc] = if is_b {
                instr | ((target as u64) << 32)
            } else {
                instr | ((target as u64) << 16)
            };
        }
        for (def_id, case_blocks, else_block) in match_fixups {
            let def = self.pool.match_def_mut(def_id);
            for (case, block) in def.cases.iter_mut().zip(case_blocks) {
                case.pc = block_start[&block];
            }
            def.else_pc = block_start[&else_block];
        }

        Handler {
            name: handler.name.clone(),
            stack_size,
            code,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_instr(
        &mut self,
        handler: &IRHandler,
        constants: &[Constant],
        registers: &HashMap<InstrId, usize>,
        id: InstrId,
        code: &mut Vec<Instruction>,
        branch_fixups: &mut Vec<(usize, BlockId, bool)>,
        match_fixups: &mut Vec<(usize, Vec<BlockId>, BlockId)>,
    ) {
        let instr = handler.instr(id);
        match &instr.kind {
            InstrKind::Alloca => {
                // register reserved by the allocator; no code
            }
            InstrKind::Load => {
                self.emit_push(handler, constants, registers, code, instr.operands[0]);
                code.push(make_instr(Opcode::Store, registers[&id], 0, 0));
            }
            InstrKind::Store => {
                self.emit_push(handler, constants, registers, code, instr.operands[1]);
                let slot = match instr.operands[0] {
                    ValueId::Instr(alloca) => registers[&alloca],
                    _ => unreachable!("store target must be an alloca"),
                };
                code.push(make_instr(Opcode::Store, slot, 0, 0));
            }
            InstrKind::LoadGlobal(slot) => {
                code.push(make_instr(Opcode::GLoad, *slot, 0, 0));
                code.push(make_instr(Opcode::Store, registers[&id], 0, 0));
            }
            InstrKind::StoreGlobal(slot) => {
                self.emit_push(handler, constants, registers, code, instr.operands[0]);
                code.push(make_instr(Opcode::GStore, *slot, 0, 0));
            }
            InstrKind::Unary(op) | InstrKind::Cast(op) => {
                self.emit_push(handler, constants, registers, code, instr.operands[0]);
                code.push(make_instr(*op, 0, 0, 0));
                code.push(make_instr(Opcode::Store, registers[&id], 0, 0));
            }
            InstrKind::Binary(op) => {
                self.emit_push(handler, constants, registers, code, instr.operands[0]);
                self.emit_push(handler, constants, registers, code, instr.operands[1]);
                code.push(make_instr(*op, 0, 0, 0));
                code.push(make_instr(Opcode::Store, registers[&id], 0, 0));
            }
            InstrKind::RegExpGroup => {
                let group = match instr.operands[0] {
                    ValueId::Const(c) => match constants[c] {
                        Constant::Number(n) => n as usize,
                        _ => unreachable!("regexp group id must be numeric"),
                    },
                    _ => unreachable!("regexp group id must be constant"),
                };
                code.push(make_instr(Opcode::SRegGroup, group, 0, 0));
                code.push(make_instr(Opcode::Store, registers[&id], 0, 0));
            }
            InstrKind::CallFunction => {
                let native = match instr.operands[0] {
                    ValueId::NativeFunction(n) => n,
                    _ => unreachable!("call target must be a native function"),
                };
                for arg in &instr.operands[1..] {
                    self.emit_push(handler, constants, registers, code, *arg);
                }
                let argc = instr.operands.len() - 1;
                let has_result = instr.ty != crate::types::LiteralType::Void;
                code.push(make_instr(Opcode::Call, native, argc, has_result as usize));
                if has_result {
                    code.push(make_instr(Opcode::Store, registers[&id], 0, 0));
                }
            }
            InstrKind::InvokeHandler => {
                let native = match instr.operands[0] {
                    ValueId::NativeHandler(n) => n,
                    _ => unreachable!("invoke target must be a native handler"),
                };
                for arg in &instr.operands[1..] {
                    self.emit_push(handler, constants, registers, code, *arg);
                }
                let argc = instr.operands.len() - 1;
                code.push(make_instr(Opcode::Handler, native, argc, 0));
            }
            InstrKind::Br => {
                let target = match instr.operands[0] {
                    ValueId::Block(b) => b,
                    _ => unreachable!("branch target must be a block"),
                };
                branch_fixups.push((code.len(), target, false));
                code.push(make_instr(Opcode::Br, 0, 0, 0));
            }
            InstrKind::CondBr => {
                self.emit_push(handler, constants, registers, code, instr.operands[0]);
                let then_block = match instr.operands[1] {
                    ValueId::Block(b) => b,
                    _ => unreachable!(),
                };
                let else_block = match instr.operands[2] {
                    ValueId::Block(b) => b,
                    _ => unreachable!(),
                };
                branch_fixups.push((code.len(), then_block, false));
                branch_fixups.push((code.len(), else_block, true));
                code.push(make_instr(Opcode::CondBr, 0, 0, 0));
            }
            InstrKind::Match(class) => {
                self.emit_push(handler, constants, registers, code, instr.operands[0]);

                let else_block = match instr.operands[1] {
                    ValueId::Block(b) => b,
                    _ => unreachable!(),
                };
                let mut cases = Vec::new();
                let mut case_blocks = Vec::new();
                for pair in instr.operands[2..].chunks(2) {
                    let label = match pair[0] {
                        ValueId::Const(c) => self.intern_match_label(*class, &constants[c]),
                        _ => unreachable!("match label must be constant"),
                    };
                    let block = match pair[1] {
                        ValueId::Block(b) => b,
                        _ => unreachable!("match case target must be a block"),
                    };
                    cases.push(MatchCaseDef { label, pc: 0 });
                    case_blocks.push(block);
                }

                let def = self.pool.make_match_def(MatchDef {
                    class: *class,
                    cases,
                    else_pc: 0,
                });
                match_fixups.push((def, case_blocks, else_block));
                code.push(make_instr(Opcode::Match, def, 0, 0));
            }
            InstrKind::Ret => match instr.operands[0] {
                ValueId::Const(c) => {
                    let result = match &constants[c] {
                        Constant::Boolean(b) => *b as usize,
                        Constant::Number(n) => (*n != 0) as usize,
                        _ => unreachable!("handler result must be boolean"),
                    };
                    code.push(make_instr(Opcode::Exit, result, 0, 0));
                }
                value => {
                    self.emit_push(handler, constants, registers, code, value);
                    code.push(make_instr(Opcode::Ret, 0, 0, 0));
                }
            },
        }
    }

    fn intern_match_label(&mut self, class: MatchClass, constant: &Constant) -> usize {
        match (class, constant) {
            (MatchClass::RegExp, Constant::RegExp(re)) => self.pool.make_regexp(re.clone()),
            (_, Constant::String(s)) => self.pool.make_string(s.clone()),
            _ => unreachable!("match label type mismatch survived the parser"),
        }
    }

    /// Pushes one operand value onto the VM stack.
    fn emit_push(
        &mut self,
        _handler: &IRHandler,
        constants: &[Constant],
        registers: &HashMap<InstrId, usize>,
        code: &mut Vec<Instruction>,
        value: ValueId,
    ) {
        match value {
            ValueId::Instr(id) => code.push(make_instr(Opcode::Load, registers[&id], 0, 0)),
            ValueId::Const(id) => match &constants[id] {
                Constant::Boolean(b) => code.push(make_instr(Opcode::ILoad, *b as usize, 0, 0)),
                Constant::Number(n) => {
                    if (0..=0xFFFF).contains(n) {
                        code.push(make_instr(Opcode::ILoad, *n as usize, 0, 0));
                    } else {
                        let id = self.pool.make_integer(*n);
                        code.push(make_instr(Opcode::NConst, id, 0, 0));
                    }
                }
                Constant::String(s) => {
                    let id = self.pool.make_string(s.clone());
                    code.push(make_instr(Opcode::SConst, id, 0, 0));
                }
                Constant::IP(ip) => {
                    let id = self.pool.make_ipaddress(*ip);
                    code.push(make_instr(Opcode::PConst, id, 0, 0));
                }
                Constant::Cidr(cidr) => {
                    let id = self.pool.make_cidr(*cidr);
                    code.push(make_instr(Opcode::CConst, id, 0, 0));
                }
                Constant::RegExp(re) => {
                    let id = self.pool.make_regexp(re.clone());
                    code.push(make_instr(Opcode::RConst, id, 0, 0));
                }
                Constant::Array(ty, elements) => {
                    let opcode = match ty {
                        crate::types::LiteralType::IntArray => {
                            let values = elements
                                .iter()
                                .map(|e| match &constants[*e] {
                                    Constant::Number(n) => *n,
                                    _ => unreachable!("mixed array survived the parser"),
                                })
                                .collect();
                            make_instr(Opcode::ITConst, self.pool.make_integer_array(values), 0, 0)
                        }
                        crate::types::LiteralType::StringArray => {
                            let values = elements
                                .iter()
                                .map(|e| match &constants[*e] {
                                    Constant::String(s) => s.clone(),
                                    _ => unreachable!("mixed array survived the parser"),
                                })
                                .collect();
                            make_instr(Opcode::STConst, self.pool.make_string_array(values), 0, 0)
                        }
                        crate::types::LiteralType::IPAddrArray => {
                            let values = elements
                                .iter()
                                .map(|e| match &constants[*e] {
                                    Constant::IP(ip) => *ip,
                                    _ => unreachable!("mixed array survived the parser"),
                                })
                                .collect();
                            make_instr(Opcode::PTConst, self.pool.make_ipaddr_array(values), 0, 0)
                        }
                        crate::types::LiteralType::CidrArray => {
                            let values = elements
                                .iter()
                                .map(|e| match &constants[*e] {
                                    Constant::Cidr(c) => *c,
                                    _ => unreachable!("mixed array survived the parser"),
                                })
                                .collect();
                            make_instr(Opcode::CTConst, self.pool.make_cidr_array(values), 0, 0)
                        }
                        _ => unreachable!("not an array type"),
                    };
                    code.push(opcode);
                }
            },
            ValueId::Block(_) | ValueId::NativeFunction(_) | ValueId::NativeHandler(_) => {
                unreachable!("not a pushable operand")
            }
        }
    }
}

impl Default for TargetCodeGenerator {
    fn default() -> TargetCodeGenerator {
        TargetCodeGenerator::new()
    }
}
