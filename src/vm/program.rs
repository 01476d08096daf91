use std::fmt::Write as _;
use std::net::IpAddr;

use crate::diagnostics::Report;
use crate::types::{FlowNumber, MatchClass};
use crate::util::cidr::Cidr;
use crate::util::regexp::RegExp;
use crate::vm::instruction::{disassemble_one, Instruction};
use crate::vm::runtime::Runtime;

/// One `match` table: operator class, labeled jump targets in
/// declaration order (first match wins) and the else target.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchDef {
    pub class: MatchClass,
    pub cases: Vec<MatchCaseDef>,
    pub else_pc: usize,
}

/// The label indexes the string table, or the regexp table for `=~`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCaseDef {
    pub label: usize,
    pub pc: usize,
}

/// Flat per-type constant tables. Instruction immediates index into
/// these; `make_*` deduplicates on insert.
#[derive(Debug, Default)]
pub struct ConstantPool {
    numbers: Vec<FlowNumber>,
    strings: Vec<String>,
    ipaddrs: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
    regexps: Vec<RegExp>,

    int_arrays: Vec<Vec<FlowNumber>>,
    string_arrays: Vec<Vec<String>>,
    ipaddr_arrays: Vec<Vec<IpAddr>>,
    cidr_arrays: Vec<Vec<Cidr>>,

    match_defs: Vec<MatchDef>,
    native_function_signatures: Vec<String>,
    native_handler_signatures: Vec<String>,
    modules: Vec<(String, String)>,
}

fn intern<T: PartialEq>(table: &mut Vec<T>, value: T) -> usize {
    if let Some(id) = table.iter().position(|v| *v == value) {
        return id;
    }
    table.push(value);
    table.len() - 1
}

impl ConstantPool {
    pub fn make_integer(&mut self, value: FlowNumber) -> usize {
        intern(&mut self.numbers, value)
    }

    pub fn make_string(&mut self, value: impl Into<String>) -> usize {
        intern(&mut self.strings, value.into())
    }

    pub fn make_ipaddress(&mut self, value: IpAddr) -> usize {
        intern(&mut self.ipaddrs, value)
    }

    pub fn make_cidr(&mut self, value: Cidr) -> usize {
        intern(&mut self.cidrs, value)
    }

    pub fn make_regexp(&mut self, value: RegExp) -> usize {
        intern(&mut self.regexps, value)
    }

    pub fn make_integer_array(&mut self, value: Vec<FlowNumber>) -> usize {
        intern(&mut self.int_arrays, value)
    }

    pub fn make_string_array(&mut self, value: Vec<String>) -> usize {
        intern(&mut self.string_arrays, value)
    }

    pub fn make_ipaddr_array(&mut self, value: Vec<IpAddr>) -> usize {
        intern(&mut self.ipaddr_arrays, value)
    }

    pub fn make_cidr_array(&mut self, value: Vec<Cidr>) -> usize {
        intern(&mut self.cidr_arrays, value)
    }

    pub fn make_match_def(&mut self, def: MatchDef) -> usize {
        self.match_defs.push(def);
        self.match_defs.len() - 1
    }

    pub fn make_native_function(&mut self, signature: impl Into<String>) -> usize {
        intern(&mut self.native_function_signatures, signature.into())
    }

    pub fn make_native_handler(&mut self, signature: impl Into<String>) -> usize {
        intern(&mut self.native_handler_signatures, signature.into())
    }

    pub fn set_modules(&mut self, modules: Vec<(String, String)>) {
        self.modules = modules;
    }

    pub fn get_integer(&self, id: usize) -> FlowNumber {
        self.numbers[id]
    }

    pub fn get_string(&self, id: usize) -> &str {
        &self.strings[id]
    }

    pub fn get_ipaddress(&self, id: usize) -> IpAddr {
        self.ipaddrs[id]
    }

    pub fn get_cidr(&self, id: usize) -> &Cidr {
        &self.cidrs[id]
    }

    pub fn get_regexp(&self, id: usize) -> &RegExp {
        &self.regexps[id]
    }

    pub fn get_integer_array(&self, id: usize) -> &[FlowNumber] {
        &self.int_arrays[id]
    }

    pub fn get_string_array(&self, id: usize) -> &[String] {
        &self.string_arrays[id]
    }

    pub fn get_ipaddr_array(&self, id: usize) -> &[IpAddr] {
        &self.ipaddr_arrays[id]
    }

    pub fn get_cidr_array(&self, id: usize) -> &[Cidr] {
        &self.cidr_arrays[id]
    }

    pub fn get_match_def(&self, id: usize) -> &MatchDef {
        &self.match_defs[id]
    }

    pub fn match_def_mut(&mut self, id: usize) -> &mut MatchDef {
        &mut self.match_defs[id]
    }

    pub fn native_function_signatures(&self) -> &[String] {
        &self.native_function_signatures
    }

    pub fn native_handler_signatures(&self) -> &[String] {
        &self.native_handler_signatures
    }

    pub fn modules(&self) -> &[(String, String)] {
        &self.modules
    }
}

/// A compiled handler: its code stream plus the register-file size the
/// code generator computed for it.
#[derive(Debug, Clone)]
pub struct Handler {
    pub name: String,
    pub stack_size: usize,
    pub code: Vec<Instruction>,
}

impl Handler {
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, ".handler {} ; registers={}", self.name, self.stack_size);
        for (pc, instr) in self.code.iter().enumerate() {
            let _ = writeln!(out, "  {:>4}: {}", pc, disassemble_one(*instr));
        }
        out
    }
}

/// An executable program: constant pool, compiled handlers and the
/// native link table. Read-only after `link`.
#[derive(Debug, Default)]
pub struct Program {
    pub pool: ConstantPool,
    pub handlers: Vec<Handler>,
    pub globals_count: usize,
    native_functions: Vec<Option<usize>>,
    native_handlers: Vec<Option<usize>>,
    linked: bool,
}

impl Program {
    pub fn new(pool: ConstantPool, handlers: Vec<Handler>, globals_count: usize) -> Program {
        Program {
            pool,
            handlers,
            globals_count,
            native_functions: Vec::new(),
            native_handlers: Vec::new(),
            linked: false,
        }
    }

    pub fn find_handler(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name == name)
    }

    pub fn handler(&self, id: usize) -> &Handler {
        &self.handlers[id]
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn native_function_slot(&self, id: usize) -> Option<usize> {
        self.native_functions.get(id).copied().flatten()
    }

    pub fn native_handler_slot(&self, id: usize) -> Option<usize> {
        self.native_handlers.get(id).copied().flatten()
    }

    /// Resolves every native signature against the runtime. Missing or
    /// rejected signatures are link errors; the program then stays
    /// unlinked and must not be run.
    pub fn link(&mut self, runtime: &Runtime, report: &mut Report) -> bool {
        let mut ok = true;

        self.native_functions = self
            .pool
            .native_function_signatures
            .iter()
            .map(|signature| match runtime.find(signature, false) {
                Some(slot) => {
                    let native = runtime.callback(slot);
                    if !native.verify(&native.signature()) {
                        report.link_error(format!(
                            "Verification failed for builtin function {}.",
                            signature
                        ));
                        ok = false;
                        return None;
                    }
                    Some(slot)
                }
                None => {
                    report.link_error(format!(
                        "Unknown builtin function signature {}.",
                        signature
                    ));
                    ok = false;
                    None
                }
            })
            .collect();

        self.native_handlers = self
            .pool
            .native_handler_signatures
            .iter()
            .map(|signature| match runtime.find(signature, true) {
                Some(slot) => {
                    let native = runtime.callback(slot);
                    if !native.verify(&native.signature()) {
                        report.link_error(format!(
                            "Verification failed for builtin handler {}.",
                            signature
                        ));
                        ok = false;
                        return None;
                    }
                    Some(slot)
                }
                None => {
                    report.link_error(format!(
                        "Unknown builtin handler signature {}.",
                        signature
                    ));
                    ok = false;
                    None
                }
            })
            .collect();

        self.linked = ok;
        ok
    }

    pub fn dump(&self) -> String {
        let mut out = String::from("; Program\n");
        for handler in &self.handlers {
            out.push_str(&handler.disassemble());
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::LiteralType;

    #[test]
    fn pool_deduplicates_per_type() {
        let mut pool = ConstantPool::default();
        assert_eq!(pool.make_integer(42), pool.make_integer(42));
        assert_ne!(pool.make_integer(42), pool.make_integer(7));
        assert_eq!(pool.make_string("x"), pool.make_string("x"));
        assert_eq!(
            pool.make_integer_array(vec![1, 2]),
            pool.make_integer_array(vec![1, 2])
        );
    }

    #[test]
    fn link_reports_missing_signatures() {
        let mut pool = ConstantPool::default();
        pool.make_native_function("nosuch(int)");
        let mut program = Program::new(pool, Vec::new(), 0);

        let runtime = Runtime::new();
        let mut report = Report::buffered();
        assert!(!program.link(&runtime, &mut report));
        assert!(!program.is_linked());
        assert!(report.contains_failures());
    }

    #[test]
    fn link_resolves_registered_signatures() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("sum", LiteralType::Number)
            .param("x", LiteralType::Number)
            .param("y", LiteralType::Number);

        let mut pool = ConstantPool::default();
        pool.make_native_function("sum(int, int)");
        let mut program = Program::new(pool, Vec::new(), 0);

        let mut report = Report::buffered();
        assert!(program.link(&runtime, &mut report));
        assert!(program.is_linked());
        assert_eq!(program.native_function_slot(0), Some(0));
    }
}
