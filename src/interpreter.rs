use std::cell::{Cell, RefCell};
use std::path::Path;

use anyhow::Result;

use crate::codegen::gen::TargetCodeGenerator;
use crate::diagnostics::SharedReport;
use crate::ir::gen::{IRGenerator, GLOBAL_INIT_NAME};
use crate::ir::model::IRProgram;
use crate::ir::pass_manager::PassManager;
use crate::parser::ast::UnitSym;
use crate::parser::recursive_descent::Parser;
use crate::types::Feature;
use crate::vm::program::Program;
use crate::vm::runner::{Quota, RunStatus, Runner, TraceLogger, NO_QUOTA};
use crate::vm::runtime::{Runtime, Value};

/// Compiles and runs Flow scripts against a host runtime. Each stage
/// refuses to advance once the report carries a failure. Global
/// variable storage lives here and is initialized lazily, once, before
/// the first handler run.
pub struct Interpreter {
    runtime: Runtime,
    features: Vec<Feature>,
    program_ir: Option<IRProgram>,
    program: Option<Program>,
    globals: RefCell<Vec<Value>>,
    initialized: Cell<bool>,
    last_status: Cell<RunStatus>,
}

impl Interpreter {
    pub fn new(runtime: Runtime) -> Interpreter {
        Interpreter {
            runtime,
            features: vec![Feature::GlobalScope, Feature::WhileLoop],
            program_ir: None,
            program: None,
            globals: RefCell::new(Vec::new()),
            initialized: Cell::new(false),
            last_status: Cell::new(RunStatus::Inactive),
        }
    }

    pub fn with_features(mut self, features: Vec<Feature>) -> Interpreter {
        self.features = features;
        self
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    pub fn program_ir(&self) -> Option<&IRProgram> {
        self.program_ir.as_ref()
    }

    pub fn compile_string(
        &mut self,
        source: &str,
        report: &SharedReport,
        optimization_level: i32,
    ) -> bool {
        let unit = {
            let mut parser =
                Parser::new(self.features.clone(), report.clone(), Some(&self.runtime));
            parser.open_string(source);
            parser.parse()
        };
        self.compile(unit, report, optimization_level)
    }

    pub fn compile_file(
        &mut self,
        path: impl AsRef<Path>,
        report: &SharedReport,
        optimization_level: i32,
    ) -> Result<bool> {
        let mut parser = Parser::new(self.features.clone(), report.clone(), Some(&self.runtime));
        parser.open_file(path)?;
        let unit = parser.parse();
        Ok(self.compile(unit, report, optimization_level))
    }

    fn compile(&mut self, unit: UnitSym, report: &SharedReport, optimization_level: i32) -> bool {
        if report.borrow().contains_failures() {
            return false;
        }

        let mut ir = match IRGenerator::new(report.clone(), &unit).generate() {
            Some(ir) => ir,
            None => return false,
        };

        if optimization_level > 0 {
            PassManager::standard().run(&mut ir);
        }

        let mut program = TargetCodeGenerator::new().generate(&ir);
        program.link(&self.runtime, &mut report.borrow_mut());
        if report.borrow().contains_failures() {
            return false;
        }

        self.program_ir = Some(ir);
        self.program = Some(program);
        self.initialized.set(false);
        self.globals.replace(Vec::new());
        true
    }

    pub fn run(&self, handler: &str) -> bool {
        self.run_with(handler, NO_QUOTA, None)
    }

    /// Runs one handler with an optional quota and trace. The boolean
    /// result is the handler's decision; out-of-band state is available
    /// through `last_status`.
    pub fn run_with<'a>(
        &'a self,
        handler: &str,
        quota: Quota,
        trace: Option<TraceLogger<'a>>,
    ) -> bool {
        let program = match &self.program {
            Some(program) if program.is_linked() => program,
            _ => return false,
        };

        if !self.initialized.get() {
            self.initialized.set(true);
            if let Some(init) = program.find_handler(GLOBAL_INIT_NAME) {
                let mut globals = self.globals.borrow_mut();
                Runner::new(program, &self.runtime, init, &mut globals, NO_QUOTA).run();
            }
        }

        let handler = match program.find_handler(handler) {
            Some(handler) => handler,
            None => return false,
        };

        let mut globals = self.globals.borrow_mut();
        let mut runner = Runner::new(program, &self.runtime, handler, &mut globals, quota);
        if let Some(trace) = trace {
            runner.set_trace(trace);
        }
        let result = runner.run();
        self.last_status.set(runner.status());
        result
    }

    pub fn last_status(&self) -> RunStatus {
        self.last_status.get()
    }
}
