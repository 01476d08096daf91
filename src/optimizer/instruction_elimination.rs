use crate::ir::model::{Constant, IRHandler, InstrKind, ValueId};
use crate::types::LiteralType;

/// Merges a block into its single successor when that successor has no
/// other way to be reached.
pub fn eliminate_linear_br(handler: &mut IRHandler, _constants: &[Constant]) -> bool {
    let mut changed = false;

    for block in handler.block_ids() {
        let term = match handler.terminator(block) {
            Some(term) => term,
            None => continue,
        };
        if !matches!(handler.instr(term).kind, InstrKind::Br) {
            continue;
        }
        let target = match handler.instr(term).operands[0] {
            ValueId::Block(target) => target,
            _ => continue,
        };
        if target == block || Some(target) == handler.entry() {
            continue;
        }
        if handler.block(target).preds != vec![block] {
            continue;
        }
        if handler.users_of(ValueId::Block(target)).len() != 1 {
            continue;
        }

        handler.erase_instr(term);
        handler.move_instrs(target, block);
        handler.remove_block(target);
        changed = true;
    }

    changed
}

/// Removes pure instructions whose result nobody reads.
pub fn eliminate_unused_instr(handler: &mut IRHandler, _constants: &[Constant]) -> bool {
    let mut changed = false;

    for block in handler.block_ids() {
        for id in handler.block(block).instrs.clone().into_iter().rev() {
            let instr = handler.instr(id);
            if instr.kind.has_side_effects() {
                continue;
            }
            if !instr.users.is_empty() {
                continue;
            }
            handler.erase_instr(id);
            changed = true;
        }
    }

    changed
}

/// `condbr true, a, b` becomes `br a`; likewise for `false`.
pub fn fold_constant_condbr(handler: &mut IRHandler, constants: &[Constant]) -> bool {
    let mut changed = false;

    for block in handler.block_ids() {
        let term = match handler.terminator(block) {
            Some(term) => term,
            None => continue,
        };
        if !matches!(handler.instr(term).kind, InstrKind::CondBr) {
            continue;
        }
        let cond = match handler.instr(term).operands[0] {
            ValueId::Const(id) => id,
            _ => continue,
        };
        let value = match constants[cond] {
            Constant::Boolean(value) => value,
            _ => continue,
        };

        let target = match handler.instr(term).operands[if value { 1 } else { 2 }] {
            ValueId::Block(target) => target,
            _ => continue,
        };
        handler.erase_instr(term);
        handler.append(
            block,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(target)],
        );
        changed = true;
    }

    changed
}

/// A branch to a block holding nothing but `ret <const>` is rewritten
/// to a direct ret in the predecessor.
pub fn rewrite_br_to_exit(handler: &mut IRHandler, _constants: &[Constant]) -> bool {
    let mut changed = false;

    for block in handler.block_ids() {
        let term = match handler.terminator(block) {
            Some(term) => term,
            None => continue,
        };
        if !matches!(handler.instr(term).kind, InstrKind::Br) {
            continue;
        }
        let target = match handler.instr(term).operands[0] {
            ValueId::Block(target) => target,
            _ => continue,
        };
        if target == block || handler.block(target).instrs.len() != 1 {
            continue;
        }
        let ret = handler.block(target).instrs[0];
        if !matches!(handler.instr(ret).kind, InstrKind::Ret) {
            continue;
        }
        let result = match handler.instr(ret).operands[0] {
            ValueId::Const(id) => ValueId::Const(id),
            _ => continue,
        };

        handler.erase_instr(term);
        handler.append(block, InstrKind::Ret, LiteralType::Void, "ret", vec![result]);
        changed = true;
    }

    changed
}

/// A conditional branch whose arms agree needs no condition at all.
pub fn rewrite_cond_br_to_same_branches(
    handler: &mut IRHandler,
    _constants: &[Constant],
) -> bool {
    let mut changed = false;

    for block in handler.block_ids() {
        let term = match handler.terminator(block) {
            Some(term) => term,
            None => continue,
        };
        if !matches!(handler.instr(term).kind, InstrKind::CondBr) {
            continue;
        }
        let then_block = handler.instr(term).operands[1];
        let else_block = handler.instr(term).operands[2];
        if then_block != else_block {
            continue;
        }

        handler.erase_instr(term);
        handler.append(
            block,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![then_block],
        );
        changed = true;
    }

    changed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::model::IRProgram;

    fn ret_const(program: &mut IRProgram, handler: &mut IRHandler, block: usize, value: bool) {
        let c = program.get_boolean(value);
        handler.append(
            block,
            InstrKind::Ret,
            LiteralType::Void,
            "ret",
            vec![ValueId::Const(c)],
        );
    }

    #[test]
    fn linear_branch_merges_blocks() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let tail = handler.create_block("tail");

        let one = program.get_number(1);
        handler.append(
            entry,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(tail)],
        );
        handler.append(
            tail,
            InstrKind::Alloca,
            LiteralType::Number,
            "x",
            vec![ValueId::Const(one)],
        );
        ret_const(&mut program, &mut handler, tail, false);

        assert!(eliminate_linear_br(&mut handler, &program.constants));
        assert!(handler.verify().is_ok());
        assert_eq!(handler.reachable_blocks(), vec![entry]);
        assert_eq!(handler.block(entry).instrs.len(), 2);
    }

    #[test]
    fn unused_pure_instruction_is_removed() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");

        let a = program.get_number(2);
        let b = program.get_number(3);
        handler.append(
            entry,
            InstrKind::Binary(crate::vm::instruction::Opcode::NAdd),
            LiteralType::Number,
            "t",
            vec![ValueId::Const(a), ValueId::Const(b)],
        );
        ret_const(&mut program, &mut handler, entry, false);

        assert!(eliminate_unused_instr(&mut handler, &program.constants));
        assert!(handler.verify().is_ok());
        assert_eq!(handler.block(entry).instrs.len(), 1);
    }

    #[test]
    fn stores_survive_unused_instruction_elimination() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");

        let one = program.get_number(1);
        let alloca = handler.append(
            entry,
            InstrKind::Alloca,
            LiteralType::Number,
            "x",
            vec![ValueId::Const(one)],
        );
        handler.append(
            entry,
            InstrKind::Store,
            LiteralType::Void,
            "store",
            vec![ValueId::Instr(alloca), ValueId::Const(one)],
        );
        ret_const(&mut program, &mut handler, entry, false);

        assert!(!eliminate_unused_instr(&mut handler, &program.constants));
        assert_eq!(handler.block(entry).instrs.len(), 3);
    }

    #[test]
    fn constant_condbr_folds_to_branch() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let yes = handler.create_block("yes");
        let no = handler.create_block("no");

        let t = program.get_boolean(true);
        handler.append(
            entry,
            InstrKind::CondBr,
            LiteralType::Void,
            "condbr",
            vec![ValueId::Const(t), ValueId::Block(yes), ValueId::Block(no)],
        );
        ret_const(&mut program, &mut handler, yes, true);
        ret_const(&mut program, &mut handler, no, false);

        assert!(fold_constant_condbr(&mut handler, &program.constants));
        assert!(handler.verify().is_ok());
        assert_eq!(handler.block(entry).succs, vec![yes]);
    }

    #[test]
    fn branch_to_ret_block_becomes_ret() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let exit = handler.create_block("exit");

        handler.append(
            entry,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(exit)],
        );
        ret_const(&mut program, &mut handler, exit, false);

        assert!(rewrite_br_to_exit(&mut handler, &program.constants));
        assert!(handler.verify().is_ok());
        let term = handler.terminator(entry).unwrap();
        assert!(matches!(handler.instr(term).kind, InstrKind::Ret));
    }

    #[test]
    fn condbr_with_equal_targets_becomes_branch() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let next = handler.create_block("next");

        let t = program.get_boolean(true);
        handler.append(
            entry,
            InstrKind::CondBr,
            LiteralType::Void,
            "condbr",
            vec![ValueId::Const(t), ValueId::Block(next), ValueId::Block(next)],
        );
        ret_const(&mut program, &mut handler, next, false);

        assert!(rewrite_cond_br_to_same_branches(&mut handler, &program.constants));
        assert!(handler.verify().is_ok());
        assert_eq!(handler.block(entry).succs, vec![next]);
    }
}
