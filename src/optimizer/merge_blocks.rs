use crate::ir::model::{Constant, IRHandler, InstrKind, ValueId};
use crate::types::LiteralType;

type BlockShape = Vec<(InstrKind, LiteralType, Vec<ValueId>)>;

fn shape_of(handler: &IRHandler, block: usize) -> BlockShape {
    handler
        .block(block)
        .instrs
        .iter()
        .map(|id| {
            let instr = handler.instr(*id);
            (instr.kind.clone(), instr.ty, instr.operands.clone())
        })
        .collect()
}

/// Coalesces structurally identical blocks: same instruction sequence,
/// same operands, hence same successors. Typical victims are the many
/// `ret false` exit blocks left over by earlier rewrites.
pub fn merge_same_blocks(handler: &mut IRHandler, _constants: &[Constant]) -> bool {
    let mut changed = false;
    let blocks = handler.block_ids();

    let mut groups: Vec<(BlockShape, Vec<usize>)> = Vec::new();
    for block in blocks {
        let shape = shape_of(handler, block);
        // blocks whose instructions reference their own results never
        // compare equal across copies; skip shapes with instr operands
        if shape
            .iter()
            .any(|(_, _, ops)| ops.iter().any(|op| matches!(op, ValueId::Instr(_))))
        {
            continue;
        }
        match groups.iter_mut().find(|(s, _)| *s == shape) {
            Some((_, members)) => members.push(block),
            None => groups.push((shape, vec![block])),
        }
    }

    for (_, members) in groups {
        if members.len() < 2 {
            continue;
        }
        let kept = members[0];
        for dup in &members[1..] {
            if handler.entry() == Some(*dup) {
                continue;
            }
            handler.replace_all_uses(ValueId::Block(*dup), ValueId::Block(kept));
            handler.remove_block(*dup);
            changed = true;
        }
    }

    changed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::model::IRProgram;

    #[test]
    fn identical_exit_blocks_are_coalesced() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let exit_a = handler.create_block("exit_a");
        let exit_b = handler.create_block("exit_b");

        let t = program.get_boolean(true);
        let f = program.get_boolean(false);
        handler.append(
            entry,
            InstrKind::CondBr,
            LiteralType::Void,
            "condbr",
            vec![
                ValueId::Const(t),
                ValueId::Block(exit_a),
                ValueId::Block(exit_b),
            ],
        );
        handler.append(
            exit_a,
            InstrKind::Ret,
            LiteralType::Void,
            "ret",
            vec![ValueId::Const(f)],
        );
        handler.append(
            exit_b,
            InstrKind::Ret,
            LiteralType::Void,
            "ret",
            vec![ValueId::Const(f)],
        );

        assert!(merge_same_blocks(&mut handler, &program.constants));
        assert!(handler.verify().is_ok());
        assert_eq!(handler.block(entry).succs, vec![exit_a, exit_a]);
        assert_eq!(handler.reachable_blocks().len(), 2);
    }

    #[test]
    fn different_blocks_stay_apart() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let exit_a = handler.create_block("exit_a");
        let exit_b = handler.create_block("exit_b");

        let t = program.get_boolean(true);
        let f = program.get_boolean(false);
        handler.append(
            entry,
            InstrKind::CondBr,
            LiteralType::Void,
            "condbr",
            vec![
                ValueId::Const(t),
                ValueId::Block(exit_a),
                ValueId::Block(exit_b),
            ],
        );
        handler.append(
            exit_a,
            InstrKind::Ret,
            LiteralType::Void,
            "ret",
            vec![ValueId::Const(t)],
        );
        handler.append(
            exit_b,
            InstrKind::Ret,
            LiteralType::Void,
            "ret",
            vec![ValueId::Const(f)],
        );

        assert!(!merge_same_blocks(&mut handler, &program.constants));
        assert_eq!(handler.reachable_blocks().len(), 3);
    }
}
