use crate::ir::model::{Constant, IRHandler, IRProgram};
use crate::optimizer::empty_block_elimination::empty_block_elimination;
use crate::optimizer::instruction_elimination::{
    eliminate_linear_br, eliminate_unused_instr, fold_constant_condbr, rewrite_br_to_exit,
    rewrite_cond_br_to_same_branches,
};
use crate::optimizer::merge_blocks::merge_same_blocks;
use crate::optimizer::unused_blocks::eliminate_unused_blocks;

pub type HandlerPass = fn(&mut IRHandler, &[Constant]) -> bool;

/// Runs registered passes round-robin until a whole round leaves every
/// handler untouched. The handler is re-verified after each mutating
/// pass; a failure there is a bug in the pass, not an input error.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<(String, HandlerPass)>,
}

impl PassManager {
    pub fn new() -> PassManager {
        PassManager::default()
    }

    /// The full optimization suite in its usual registration order.
    pub fn standard() -> PassManager {
        let mut pm = PassManager::new();
        pm.register_pass("eliminate-empty-blocks", empty_block_elimination);
        pm.register_pass("eliminate-linear-br", eliminate_linear_br);
        pm.register_pass("eliminate-unused-blocks", eliminate_unused_blocks);
        pm.register_pass("eliminate-unused-instr", eliminate_unused_instr);
        pm.register_pass("fold-constant-condbr", fold_constant_condbr);
        pm.register_pass("rewrite-br-to-exit", rewrite_br_to_exit);
        pm.register_pass(
            "rewrite-cond-br-to-same-branches",
            rewrite_cond_br_to_same_branches,
        );
        pm.register_pass("merge-same-blocks", merge_same_blocks);
        pm
    }

    pub fn register_pass(&mut self, name: impl Into<String>, pass: HandlerPass) {
        self.passes.push((name.into(), pass));
    }

    pub fn run(&self, program: &mut IRProgram) {
        let IRProgram {
            handlers,
            constants,
            ..
        } = program;
        for handler in handlers.iter_mut() {
            log_debug(&format!("optimizing handler {}", handler.name));
            self.run_handler(handler, constants);
        }
    }

    pub fn run_handler(&self, handler: &mut IRHandler, constants: &[Constant]) {
        loop {
            let mut changes = 0;
            for (name, pass) in &self.passes {
                log_debug(&format!("executing pass {}:", name));
                if pass(handler, constants) {
                    log_debug(&format!("pass {}: changes detected", name));
                    if let Err(e) = handler.verify() {
                        unreachable!("pass {} broke IR invariants: {}", name, e);
                    }
                    changes += 1;
                }
            }
            log_debug(&format!("{} changes detected", changes));
            if changes == 0 {
                break;
            }
        }
    }
}

fn log_debug(msg: &str) {
    if std::env::var("FLOW_DEBUG_TRANSFORMS").as_deref() == Ok("1") {
        eprintln!("PassManager: {}", msg);
    }
}
