use std::collections::HashMap;

use crate::diagnostics::SharedReport;
use crate::ir::model::{
    BlockId, Constant, IRHandler, IRProgram, InstrId, InstrKind, ValueId,
};
use crate::location::SourceLocation;
use crate::parser::ast::{
    ArrayExpr, AssignStmt, BinaryExpr, Callee, CallExpr, CompoundStmt, CondStmt, Expr,
    HandlerSym, LiteralValue, MatchStmt, Stmt, Symbol, SymbolId, UnitSym, VariableSym, WhileStmt,
    GLOBAL_SCOPE,
};
use crate::types::LiteralType;
use crate::vm::instruction::Opcode;
use crate::vm::runtime::Signature;

pub const GLOBAL_INIT_NAME: &str = "@__global_init__";

/// Where a source variable lives at IR level.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Local(InstrId),
    Global(usize),
}

/// One pass over the AST. Builder state (current handler, insertion
/// block) follows the factory style the code generator expects.
pub struct IRGenerator<'u> {
    report: SharedReport,
    unit: &'u UnitSym,
    exports: Vec<String>,
    program: IRProgram,
    handler: Option<usize>,
    insert_point: Option<BlockId>,
    scope: HashMap<SymbolId, Slot>,
    handler_stack: Vec<SymbolId>,
    name_store: HashMap<String, usize>,
    errors: usize,
}

impl<'u> IRGenerator<'u> {
    pub fn new(report: SharedReport, unit: &'u UnitSym) -> IRGenerator<'u> {
        IRGenerator {
            report,
            unit,
            exports: Vec::new(),
            program: IRProgram::new(),
            handler: None,
            insert_point: None,
            scope: HashMap::new(),
            handler_stack: Vec::new(),
            name_store: HashMap::new(),
            errors: 0,
        }
    }

    /// Restricts generation to the named handlers (plus whatever they
    /// inline); an empty list exports everything.
    pub fn with_exports(mut self, exports: Vec<String>) -> IRGenerator<'u> {
        self.exports = exports;
        self
    }

    pub fn generate(mut self) -> Option<IRProgram> {
        self.program.modules = self.unit.imports.clone();

        for id in self.unit.scope_symbols(GLOBAL_SCOPE).to_vec() {
            match self.unit.symbol(id).clone() {
                Symbol::Variable(var) => self.gen_global_decl(id, &var),
                Symbol::Handler(handler) => {
                    if handler.body.is_none() {
                        // a forward declaration that never got a body is
                        // diagnosed at its call sites
                        continue;
                    }
                    if !self.exports.is_empty() && !self.exports.contains(&handler.name) {
                        continue;
                    }
                    self.gen_handler(id, &handler);
                }
                Symbol::BuiltinFunction(_) | Symbol::BuiltinHandler(_) => {}
            }
        }

        // finalize the global initializer, if any declaration created it
        if let Some(init) = self.program.find_handler(GLOBAL_INIT_NAME) {
            self.handler = Some(init);
            self.insert_point = self.program.handlers[init].entry();
            let f = self.program.get_boolean(false);
            self.append(InstrKind::Ret, LiteralType::Void, "ret", vec![ValueId::Const(f)]);
        }

        if self.errors > 0 {
            return None;
        }
        Some(self.program)
    }

    // {{{ builder plumbing

    fn handler_mut(&mut self) -> &mut IRHandler {
        let id = self.handler.expect("no current handler");
        &mut self.program.handlers[id]
    }

    fn make_name(&mut self, name: &str) -> String {
        let count = self.name_store.entry(name.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            name.to_string()
        } else {
            format!("{}{}", name, *count - 1)
        }
    }

    fn create_block(&mut self, name: &str) -> BlockId {
        let name = self.make_name(name);
        self.handler_mut().create_block(name)
    }

    fn set_insert_point(&mut self, block: BlockId) {
        self.insert_point = Some(block);
    }

    fn append(
        &mut self,
        kind: InstrKind,
        ty: LiteralType,
        name: &str,
        operands: Vec<ValueId>,
    ) -> InstrId {
        let block = self.insert_point.expect("no insertion block");
        let name = if ty == LiteralType::Void {
            name.to_string()
        } else {
            self.make_name(name)
        };
        self.handler_mut().append(block, kind, ty, name, operands)
    }

    fn type_error(&mut self, location: &SourceLocation, text: String) {
        self.errors += 1;
        self.report.borrow_mut().type_error(location.clone(), text);
    }

    // }}}
    // {{{ declarations

    /// Global `var` declarations initialize in declaration order inside
    /// the synthetic `@__global_init__` handler.
    fn gen_global_decl(&mut self, id: SymbolId, var: &VariableSym) {
        let init = self.program.get_handler(GLOBAL_INIT_NAME);
        self.handler = Some(init);
        let entry = match self.program.handlers[init].entry() {
            Some(entry) => entry,
            None => self.program.handlers[init].create_block("EntryPoint"),
        };
        self.set_insert_point(entry);

        let slot = self.program.add_global(var.name.clone(), var.ty);
        self.scope.insert(id, Slot::Global(slot));

        if let Some(value) = self.gen_expr(&var.initializer.clone()) {
            self.append(
                InstrKind::StoreGlobal(slot),
                LiteralType::Void,
                "gstore",
                vec![value],
            );
        }
    }

    fn gen_handler(&mut self, id: SymbolId, handler: &HandlerSym) {
        debug_assert!(self.handler_stack.is_empty());

        let index = self.program.get_handler(&handler.name);
        self.handler = Some(index);
        self.name_store.clear();
        let entry = self.create_block("EntryPoint");
        self.set_insert_point(entry);

        self.gen_inline(id, &handler.location);

        let f = self.program.get_boolean(false);
        self.append(InstrKind::Ret, LiteralType::Void, "ret", vec![ValueId::Const(f)]);

        if self.errors == 0 {
            if let Err(e) = self.program.handlers[index].verify() {
                unreachable!("IR generator produced invalid IR: {}", e);
            }
        }
    }

    /// Expands a source handler's body into the current handler. A
    /// handler already on the stack means a recursive call chain.
    fn gen_inline(&mut self, id: SymbolId, location: &SourceLocation) {
        let handler = match self.unit.symbol(id) {
            Symbol::Handler(h) => h.clone(),
            _ => unreachable!("inline target is not a handler"),
        };

        if self.handler_stack.contains(&id) {
            self.type_error(
                location,
                format!("Cannot recursively call handler {}.", handler.name),
            );
            return;
        }
        self.handler_stack.push(id);

        // local variable declarations of the handler's scope
        if let Some(scope) = handler.scope {
            for sym_id in self.unit.scope_symbols(scope).to_vec() {
                if let Symbol::Variable(var) = self.unit.symbol(sym_id).clone() {
                    self.gen_local_decl(sym_id, &var);
                }
            }
        }

        match &handler.body {
            Some(body) => self.gen_stmt(&body.clone()),
            None => self.type_error(
                location,
                format!(
                    "Forward declared handler '{}' is missing implementation.",
                    handler.name
                ),
            ),
        }

        self.handler_stack.pop();
    }

    fn gen_local_decl(&mut self, id: SymbolId, var: &VariableSym) {
        let one = self.program.get_number(1);
        let alloca = self.append(
            InstrKind::Alloca,
            var.ty,
            &var.name.clone(),
            vec![ValueId::Const(one)],
        );
        self.scope.insert(id, Slot::Local(alloca));

        if let Some(value) = self.gen_expr(&var.initializer.clone()) {
            self.append(
                InstrKind::Store,
                LiteralType::Void,
                "store",
                vec![ValueId::Instr(alloca), value],
            );
        }
    }

    // }}}
    // {{{ expressions

    fn get_literal(&mut self, value: &LiteralValue) -> ValueId {
        let constant = match value {
            LiteralValue::Boolean(b) => Constant::Boolean(*b),
            LiteralValue::Number(n) => Constant::Number(*n),
            LiteralValue::String(s) => Constant::String(s.clone()),
            LiteralValue::IP(ip) => Constant::IP(*ip),
            LiteralValue::Cidr(cidr) => Constant::Cidr(*cidr),
            LiteralValue::RegExp(re) => Constant::RegExp(re.clone()),
        };
        ValueId::Const(self.program.get_constant(constant))
    }

    fn gen_expr(&mut self, expr: &Expr) -> Option<ValueId> {
        match expr {
            Expr::Literal(e) => Some(self.get_literal(&e.value)),
            Expr::Unary(e) => {
                let sub = self.gen_expr(&e.expr)?;
                let kind = match e.op {
                    Opcode::N2S
                    | Opcode::S2N
                    | Opcode::B2S
                    | Opcode::P2S
                    | Opcode::C2S
                    | Opcode::R2S => InstrKind::Cast(e.op),
                    op => InstrKind::Unary(op),
                };
                Some(ValueId::Instr(self.append(
                    kind,
                    e.op.result_type(),
                    "t",
                    vec![sub],
                )))
            }
            Expr::Binary(e) => self.gen_binary(e),
            Expr::Variable(e) => match self.scope.get(&e.symbol).copied() {
                Some(Slot::Local(alloca)) => Some(ValueId::Instr(self.append(
                    InstrKind::Load,
                    e.ty,
                    &format!("{}.load", e.name),
                    vec![ValueId::Instr(alloca)],
                ))),
                Some(Slot::Global(slot)) => Some(ValueId::Instr(self.append(
                    InstrKind::LoadGlobal(slot),
                    e.ty,
                    &format!("{}.load", e.name),
                    vec![],
                ))),
                None => {
                    self.type_error(
                        &e.location,
                        format!("Use of unbound variable '{}'.", e.name),
                    );
                    None
                }
            },
            Expr::HandlerRef(e) => {
                self.type_error(
                    &e.location,
                    format!("Handler reference '{}' is not usable as a value.", e.name),
                );
                None
            }
            Expr::Call(e) => self.gen_call(e),
            Expr::RegExpGroup(e) => {
                let group = self.program.get_number(e.group);
                Some(ValueId::Instr(self.append(
                    InstrKind::RegExpGroup,
                    LiteralType::String,
                    "group",
                    vec![ValueId::Const(group)],
                )))
            }
            Expr::Array(e) => self.gen_array(e),
        }
    }

    fn gen_binary(&mut self, e: &BinaryExpr) -> Option<ValueId> {
        if e.op == Opcode::BOr {
            // (lhs || rhs) as a control-flow diamond around a slot
            let one = self.program.get_number(1);
            let result = self.append(
                InstrKind::Alloca,
                LiteralType::Boolean,
                "bor",
                vec![ValueId::Const(one)],
            );

            let lhs = self.gen_expr(&e.lhs)?;
            let bor_left = self.create_block("bor.left");
            let bor_right = self.create_block("bor.right");
            let bor_cont = self.create_block("bor.cont");
            self.append(
                InstrKind::CondBr,
                LiteralType::Void,
                "condbr",
                vec![lhs, ValueId::Block(bor_left), ValueId::Block(bor_right)],
            );

            self.set_insert_point(bor_left);
            self.append(
                InstrKind::Store,
                LiteralType::Void,
                "bor.left",
                vec![ValueId::Instr(result), lhs],
            );
            self.append(
                InstrKind::Br,
                LiteralType::Void,
                "br",
                vec![ValueId::Block(bor_cont)],
            );

            self.set_insert_point(bor_right);
            let rhs = self.gen_expr(&e.rhs)?;
            self.append(
                InstrKind::Store,
                LiteralType::Void,
                "bor.right",
                vec![ValueId::Instr(result), rhs],
            );
            self.append(
                InstrKind::Br,
                LiteralType::Void,
                "br",
                vec![ValueId::Block(bor_cont)],
            );

            self.set_insert_point(bor_cont);
            return Some(ValueId::Instr(result));
        }

        let lhs = self.gen_expr(&e.lhs)?;
        let rhs = self.gen_expr(&e.rhs)?;
        Some(ValueId::Instr(self.append(
            InstrKind::Binary(e.op),
            e.op.result_type(),
            "t",
            vec![lhs, rhs],
        )))
    }

    fn gen_call(&mut self, call: &CallExpr) -> Option<ValueId> {
        match call.callee {
            Callee::Handler(id) => {
                self.gen_inline(id, &call.location);
                // an inlined handler call yields no value
                Some(ValueId::Const(self.program.get_boolean(false)))
            }
            Callee::BuiltinFunction(_) => {
                let mut args = Vec::with_capacity(call.args.len() + 1);
                let signature =
                    Signature::new(call.name.as_str(), call.args.values.iter().map(|a| a.ty()).collect());
                let native = self
                    .program
                    .get_native_function(&call.name, signature.to_string());
                args.push(ValueId::NativeFunction(native));
                for arg in &call.args.values {
                    args.push(self.gen_expr(arg)?);
                }
                Some(ValueId::Instr(self.append(
                    InstrKind::CallFunction,
                    call.ret,
                    &call.name.clone(),
                    args,
                )))
            }
            Callee::BuiltinHandler(_) => {
                let mut args = Vec::with_capacity(call.args.len() + 1);
                let signature =
                    Signature::new(call.name.as_str(), call.args.values.iter().map(|a| a.ty()).collect());
                let native = self
                    .program
                    .get_native_handler(&call.name, signature.to_string());
                args.push(ValueId::NativeHandler(native));
                for arg in &call.args.values {
                    args.push(self.gen_expr(arg)?);
                }
                Some(ValueId::Instr(self.append(
                    InstrKind::InvokeHandler,
                    LiteralType::Void,
                    &call.name.clone(),
                    args,
                )))
            }
        }
    }

    /// Arrays must be constant: every element folds to a pool entry.
    fn gen_array(&mut self, e: &ArrayExpr) -> Option<ValueId> {
        let mut elements = Vec::with_capacity(e.elements.len());
        for element in &e.elements {
            match self.gen_expr(element)? {
                ValueId::Const(id) => elements.push(id),
                _ => {
                    self.type_error(&e.location, "Variable array elements not allowed.".into());
                    return None;
                }
            }
        }
        Some(ValueId::Const(
            self.program.get_constant(Constant::Array(e.ty, elements)),
        ))
    }

    // }}}
    // {{{ statements

    fn gen_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(s) => {
                self.gen_expr(&s.expr);
            }
            Stmt::Compound(s) => self.gen_compound(s),
            Stmt::Cond(s) => self.gen_cond(s),
            Stmt::While(s) => self.gen_while(s),
            Stmt::Match(s) => self.gen_match(s),
            Stmt::Assign(s) => self.gen_assign(s),
        }
    }

    fn gen_compound(&mut self, s: &CompoundStmt) {
        for stmt in &s.stmts {
            self.gen_stmt(stmt);
        }
    }

    fn gen_cond(&mut self, s: &CondStmt) {
        let cond = match self.gen_expr(&s.condition) {
            Some(cond) => cond,
            None => return,
        };

        let true_block = self.create_block("trueBlock");
        let false_block = self.create_block("falseBlock");
        let cont_block = self.create_block("contBlock");

        self.append(
            InstrKind::CondBr,
            LiteralType::Void,
            "condbr",
            vec![cond, ValueId::Block(true_block), ValueId::Block(false_block)],
        );

        self.set_insert_point(true_block);
        self.gen_stmt(&s.then_stmt);
        self.append(
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(cont_block)],
        );

        self.set_insert_point(false_block);
        if let Some(else_stmt) = &s.else_stmt {
            self.gen_stmt(else_stmt);
        }
        self.append(
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(cont_block)],
        );

        self.set_insert_point(cont_block);
    }

    fn gen_while(&mut self, s: &WhileStmt) {
        let body_block = self.create_block("while.body");
        let cond_block = self.create_block("while.cond");
        let done_block = self.create_block("while.done");

        self.append(
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(cond_block)],
        );

        self.set_insert_point(body_block);
        self.gen_stmt(&s.body);
        self.append(
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(cond_block)],
        );

        self.set_insert_point(cond_block);
        let cond = match self.gen_expr(&s.condition) {
            Some(cond) => cond,
            None => return,
        };
        self.append(
            InstrKind::CondBr,
            LiteralType::Void,
            "condbr",
            vec![cond, ValueId::Block(body_block), ValueId::Block(done_block)],
        );

        self.set_insert_point(done_block);
    }

    fn gen_match(&mut self, s: &MatchStmt) {
        let cond = match self.gen_expr(&s.condition) {
            Some(cond) => cond,
            None => return,
        };

        let cont_block = self.create_block("match.cont");
        let match_instr = self.append(
            InstrKind::Match(s.op),
            LiteralType::Void,
            "match",
            vec![cond, ValueId::Block(cont_block)],
        );

        for case in &s.cases {
            let case_block = self.create_block("match.case");
            self.set_insert_point(case_block);
            self.gen_stmt(&case.body);
            self.append(
                InstrKind::Br,
                LiteralType::Void,
                "br",
                vec![ValueId::Block(cont_block)],
            );

            for label in &case.labels {
                let constant = match label {
                    Expr::Literal(lit) => self.get_literal(&lit.value),
                    other => {
                        self.type_error(
                            other.location(),
                            format!(
                                "Invalid (unsupported) literal type <{}> in match case.",
                                other.ty()
                            ),
                        );
                        continue;
                    }
                };
                let handler = self.handler_mut();
                handler.add_operand(match_instr, constant);
                handler.add_operand(match_instr, ValueId::Block(case_block));
            }
        }

        if let Some(else_stmt) = &s.else_stmt {
            let else_block = self.create_block("match.else");
            self.set_insert_point(else_block);
            self.gen_stmt(else_stmt);
            self.append(
                InstrKind::Br,
                LiteralType::Void,
                "br",
                vec![ValueId::Block(cont_block)],
            );
            self.handler_mut()
                .set_operand(match_instr, 1, ValueId::Block(else_block));
        }

        self.set_insert_point(cont_block);
    }

    fn gen_assign(&mut self, s: &AssignStmt) {
        let value = match self.gen_expr(&s.expr) {
            Some(value) => value,
            None => return,
        };
        match self.scope.get(&s.variable).copied() {
            Some(Slot::Local(alloca)) => {
                self.append(
                    InstrKind::Store,
                    LiteralType::Void,
                    "assignment",
                    vec![ValueId::Instr(alloca), value],
                );
            }
            Some(Slot::Global(slot)) => {
                self.append(
                    InstrKind::StoreGlobal(slot),
                    LiteralType::Void,
                    "assignment",
                    vec![value],
                );
            }
            None => {
                self.type_error(&s.location, format!("Use of unbound variable '{}'.", s.name));
            }
        }
    }

    // }}}
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::diagnostics::{shared, Report, SharedReport};
    use crate::parser::recursive_descent::Parser;
    use crate::types::Feature;
    use crate::vm::runtime::Runtime;

    fn test_runtime() -> Runtime {
        let mut runtime = Runtime::new();
        runtime
            .register_function("assert", LiteralType::Number)
            .param("condition", LiteralType::Boolean)
            .param_with_default("description", LiteralType::String, "");
        runtime.register_handler("stop");
        runtime
    }

    fn generate(source: &str) -> (Option<IRProgram>, SharedReport) {
        let runtime = test_runtime();
        let report = shared(Report::buffered());
        let mut parser = Parser::new(
            vec![Feature::GlobalScope, Feature::WhileLoop],
            report.clone(),
            Some(&runtime),
        );
        parser.open_string(source);
        let unit = parser.parse();
        assert!(
            !report.borrow().contains_failures(),
            "parse failed: {:?}",
            report.borrow().messages()
        );
        let program = IRGenerator::new(report.clone(), &unit).generate();
        (program, report)
    }

    #[test]
    fn minimal_handler_generates_verified_ir() {
        let (program, _) = generate("handler main {}");
        let program = program.unwrap();
        let main = &program.handlers[program.find_handler("main").unwrap()];
        assert!(main.verify().is_ok());
        assert_eq!(main.block_ids().len(), 1);
    }

    #[test]
    fn if_statement_builds_diamond() {
        let (program, _) = generate("handler main { if true then stop; }");
        let program = program.unwrap();
        let main = &program.handlers[program.find_handler("main").unwrap()];
        assert!(main.verify().is_ok());
        // EntryPoint, trueBlock, falseBlock, contBlock
        assert_eq!(main.block_ids().len(), 4);
        let entry = main.entry().unwrap();
        assert_eq!(main.block(entry).succs.len(), 2);
    }

    #[test]
    fn while_loop_shape() {
        let (program, _) = generate("handler main { while true { } }");
        let program = program.unwrap();
        let main = &program.handlers[program.find_handler("main").unwrap()];
        assert!(main.verify().is_ok());
        assert_eq!(main.block_ids().len(), 4);
    }

    #[test]
    fn global_variables_get_init_handler_in_order() {
        let (program, _) = generate("var a = 1;\nvar b = 2;\nhandler main { if a == b then stop; }");
        let program = program.unwrap();
        assert_eq!(program.globals.len(), 2);
        assert_eq!(program.globals[0].name, "a");
        assert_eq!(program.globals[1].name, "b");

        let init = &program.handlers[program.find_handler(GLOBAL_INIT_NAME).unwrap()];
        assert!(init.verify().is_ok());

        // initializers stored in declaration order
        let entry = init.entry().unwrap();
        let stores: Vec<usize> = init
            .block(entry)
            .instrs
            .iter()
            .filter_map(|id| match init.instr(*id).kind {
                InstrKind::StoreGlobal(slot) => Some(slot),
                _ => None,
            })
            .collect();
        assert_eq!(stores, vec![0, 1]);
    }

    #[test]
    fn recursive_handler_call_is_rejected() {
        let runtime = test_runtime();
        let report = shared(Report::buffered());
        let mut parser = Parser::new(vec![], report.clone(), Some(&runtime));
        parser.open_string("handler a { b; }\nhandler b { a; }");
        let unit = parser.parse();
        let program = IRGenerator::new(report.clone(), &unit).generate();
        assert!(program.is_none());
        assert!(report
            .borrow()
            .messages()
            .iter()
            .any(|m| m.text.contains("recursively")));
    }

    #[test]
    fn handler_call_inlines_callee_body() {
        let (program, _) = generate("handler helper { stop; }\nhandler main { helper; }");
        let program = program.unwrap();
        let main = &program.handlers[program.find_handler("main").unwrap()];
        let entry = main.entry().unwrap();
        let has_invoke = main
            .block(entry)
            .instrs
            .iter()
            .any(|id| matches!(main.instr(*id).kind, InstrKind::InvokeHandler));
        assert!(has_invoke, "helper body was not inlined into main");
    }

    #[test]
    fn constant_array_folds_into_pool() {
        let runtime = {
            let mut runtime = test_runtime();
            runtime
                .register_function("allow", LiteralType::Void)
                .param("nets", LiteralType::CidrArray);
            runtime
        };
        let report = shared(Report::buffered());
        let mut parser = Parser::new(vec![], report.clone(), Some(&runtime));
        parser.open_string("handler main { allow([10.0.0.0/8, 192.168.0.0/16]); }");
        let unit = parser.parse();
        assert!(!report.borrow().contains_failures());

        let program = IRGenerator::new(report.clone(), &unit).generate().unwrap();
        let array = program
            .constants
            .iter()
            .find(|c| matches!(c, Constant::Array(LiteralType::CidrArray, _)));
        assert!(array.is_some());
    }

    #[test]
    fn match_instruction_carries_cases_and_else() {
        let (program, _) = generate(
            "handler main { match \"x\" =^ { on \"a\" stop; on \"b\" stop; else stop; } }",
        );
        let program = program.unwrap();
        let main = &program.handlers[program.find_handler("main").unwrap()];
        assert!(main.verify().is_ok());

        let entry = main.entry().unwrap();
        let match_id = *main.block(entry).instrs.last().unwrap();
        let instr = main.instr(match_id);
        assert!(matches!(instr.kind, InstrKind::Match(crate::types::MatchClass::Head)));
        // cond, else block, then (label, block) per case label
        assert_eq!(instr.operands.len(), 2 + 2 * 2);
    }

    #[test]
    fn or_expression_builds_diamond_with_slot() {
        let (program, _) = generate("handler main { if true or false then stop; }");
        let program = program.unwrap();
        let main = &program.handlers[program.find_handler("main").unwrap()];
        assert!(main.verify().is_ok());
        let entry = main.entry().unwrap();
        let has_alloca = main
            .block(entry)
            .instrs
            .iter()
            .any(|id| matches!(main.instr(*id).kind, InstrKind::Alloca));
        assert!(has_alloca);
    }
}
