use std::collections::BTreeSet;

use crate::ir::model::{Constant, IRHandler};

/// Removes blocks the handler entry can no longer reach. Instructions
/// go first so cross-references among dead blocks unlink cleanly.
pub fn eliminate_unused_blocks(handler: &mut IRHandler, _constants: &[Constant]) -> bool {
    let reachable: BTreeSet<usize> = handler.reachable_blocks().into_iter().collect();
    let unreachable: Vec<usize> = handler
        .block_ids()
        .into_iter()
        .filter(|id| !reachable.contains(id))
        .collect();

    if unreachable.is_empty() {
        return false;
    }

    for block in &unreachable {
        for instr in handler.block(*block).instrs.clone() {
            handler.erase_instr(instr);
        }
    }
    for block in unreachable {
        handler.remove_block(block);
    }

    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::model::{IRProgram, InstrKind, ValueId};
    use crate::types::LiteralType;

    #[test]
    fn unreachable_cycle_is_removed() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let orphan_a = handler.create_block("orphan_a");
        let orphan_b = handler.create_block("orphan_b");

        let f = program.get_boolean(false);
        handler.append(
            entry,
            InstrKind::Ret,
            LiteralType::Void,
            "ret",
            vec![ValueId::Const(f)],
        );
        // two dead blocks referencing each other
        handler.append(
            orphan_a,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(orphan_b)],
        );
        handler.append(
            orphan_b,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(orphan_a)],
        );

        assert!(eliminate_unused_blocks(&mut handler, &program.constants));
        assert!(handler.verify().is_ok());
        assert_eq!(handler.block_ids(), vec![entry]);
        assert!(!eliminate_unused_blocks(&mut handler, &program.constants));
    }
}
