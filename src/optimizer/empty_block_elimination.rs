use crate::ir::model::{Constant, IRHandler, InstrKind, ValueId};

/// Eliminates blocks that do nothing but jump to the next block: every
/// predecessor is retargeted to the jump target, then the block goes.
pub fn empty_block_elimination(handler: &mut IRHandler, _constants: &[Constant]) -> bool {
    let mut changed = false;

    for block in handler.block_ids() {
        if handler.block(block).instrs.len() != 1 {
            continue;
        }
        let only = handler.block(block).instrs[0];
        if !matches!(handler.instr(only).kind, InstrKind::Br) {
            continue;
        }
        let target = match handler.instr(only).operands[0] {
            ValueId::Block(target) => target,
            _ => continue,
        };
        if target == block {
            continue;
        }

        handler.replace_all_uses(ValueId::Block(block), ValueId::Block(target));
        if handler.entry() == Some(block) {
            handler.set_entry(target);
        }
        handler.remove_block(block);
        changed = true;
    }

    changed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::model::IRProgram;
    use crate::types::LiteralType;

    #[test]
    fn forwarding_block_is_removed() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let hop = handler.create_block("hop");
        let exit = handler.create_block("exit");

        handler.append(
            entry,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(hop)],
        );
        handler.append(
            hop,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(exit)],
        );
        let f = program.get_boolean(false);
        handler.append(
            exit,
            InstrKind::Ret,
            LiteralType::Void,
            "ret",
            vec![ValueId::Const(f)],
        );

        assert!(empty_block_elimination(&mut handler, &program.constants));
        assert!(handler.verify().is_ok());
        assert_eq!(handler.block(entry).succs, vec![exit]);
        assert_eq!(handler.reachable_blocks().len(), 2);

        // second run has nothing left to do on the remaining direct hop
        assert!(empty_block_elimination(&mut handler, &program.constants));
        assert!(handler.verify().is_ok());
    }
}
