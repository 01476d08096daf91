use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::net::IpAddr;

use crate::types::{FlowNumber, LiteralType, MatchClass};
use crate::util::cidr::Cidr;
use crate::util::regexp::RegExp;
use crate::vm::instruction::Opcode;

pub type InstrId = usize;
pub type BlockId = usize;
pub type ConstId = usize;

/// A constant pool entry. Structural equality drives deduplication:
/// no table ever holds two equal constants of the same type.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Boolean(bool),
    Number(FlowNumber),
    String(String),
    IP(IpAddr),
    Cidr(Cidr),
    RegExp(RegExp),
    Array(LiteralType, Vec<ConstId>),
}

impl Constant {
    pub fn ty(&self) -> LiteralType {
        match self {
            Constant::Boolean(_) => LiteralType::Boolean,
            Constant::Number(_) => LiteralType::Number,
            Constant::String(_) => LiteralType::String,
            Constant::IP(_) => LiteralType::IPAddress,
            Constant::Cidr(_) => LiteralType::Cidr,
            Constant::RegExp(_) => LiteralType::RegExp,
            Constant::Array(ty, _) => *ty,
        }
    }
}

/// Anything an instruction can take as operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueId {
    Instr(InstrId),
    Const(ConstId),
    Block(BlockId),
    NativeFunction(usize),
    NativeHandler(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    Alloca,
    Load,
    Store,
    LoadGlobal(usize),
    StoreGlobal(usize),
    Unary(Opcode),
    Binary(Opcode),
    Cast(Opcode),
    RegExpGroup,
    CallFunction,
    InvokeHandler,
    Br,
    CondBr,
    Match(MatchClass),
    Ret,
}

impl InstrKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstrKind::Br | InstrKind::CondBr | InstrKind::Match(_) | InstrKind::Ret
        )
    }

    /// Instructions that must survive even when their result is unused.
    pub fn has_side_effects(&self) -> bool {
        self.is_terminator()
            || matches!(
                self,
                InstrKind::Store
                    | InstrKind::StoreGlobal(_)
                    | InstrKind::CallFunction
                    | InstrKind::InvokeHandler
            )
    }
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub kind: InstrKind,
    pub ty: LiteralType,
    pub name: String,
    pub operands: Vec<ValueId>,
    pub users: BTreeSet<InstrId>,
    pub block: Option<BlockId>,
    pub erased: bool,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub name: String,
    pub instrs: Vec<InstrId>,
    /// Successors/predecessors, derived from terminator operands;
    /// multiplicity matters (a condbr may target one block twice).
    pub succs: Vec<BlockId>,
    pub preds: Vec<BlockId>,
    pub users: BTreeSet<InstrId>,
    pub dead: bool,
}

/// A per-handler basic-block graph. Blocks and instructions live in
/// arenas owned by the handler; operands are ids into them.
#[derive(Debug, Default)]
pub struct IRHandler {
    pub name: String,
    instrs: Vec<Instr>,
    blocks: Vec<BasicBlock>,
    entry: Option<BlockId>,
    const_users: BTreeMap<ConstId, BTreeSet<InstrId>>,
    native_users: BTreeMap<(bool, usize), BTreeSet<InstrId>>,
}

impl IRHandler {
    pub fn new(name: impl Into<String>) -> IRHandler {
        IRHandler {
            name: name.into(),
            ..IRHandler::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| b.dead)
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub fn set_entry(&mut self, block: BlockId) {
        self.entry = Some(block);
    }

    pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
        self.blocks.push(BasicBlock {
            name: name.into(),
            instrs: Vec::new(),
            succs: Vec::new(),
            preds: Vec::new(),
            users: BTreeSet::new(),
            dead: false,
        });
        let id = self.blocks.len() - 1;
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id]
    }

    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id]
    }

    /// All live blocks, entry first, then in creation order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids = Vec::new();
        if let Some(entry) = self.entry {
            if !self.blocks[entry].dead {
                ids.push(entry);
            }
        }
        for (id, block) in self.blocks.iter().enumerate() {
            if !block.dead && Some(id) != self.entry {
                ids.push(id);
            }
        }
        ids
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstrId> {
        self.blocks[block]
            .instrs
            .last()
            .copied()
            .filter(|id| self.instrs[*id].kind.is_terminator())
    }

    // {{{ use-def and successor maintenance

    fn users_entry(&mut self, value: ValueId) -> Option<&mut BTreeSet<InstrId>> {
        match value {
            ValueId::Instr(id) => Some(&mut self.instrs[id].users),
            ValueId::Block(id) => Some(&mut self.blocks[id].users),
            ValueId::Const(id) => Some(self.const_users.entry(id).or_default()),
            ValueId::NativeFunction(id) => Some(self.native_users.entry((false, id)).or_default()),
            ValueId::NativeHandler(id) => Some(self.native_users.entry((true, id)).or_default()),
        }
    }

    pub fn users_of(&self, value: ValueId) -> BTreeSet<InstrId> {
        match value {
            ValueId::Instr(id) => self.instrs[id].users.clone(),
            ValueId::Block(id) => self.blocks[id].users.clone(),
            ValueId::Const(id) => self.const_users.get(&id).cloned().unwrap_or_default(),
            ValueId::NativeFunction(id) => self
                .native_users
                .get(&(false, id))
                .cloned()
                .unwrap_or_default(),
            ValueId::NativeHandler(id) => self
                .native_users
                .get(&(true, id))
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn add_use(&mut self, value: ValueId, user: InstrId) {
        if let Some(users) = self.users_entry(value) {
            users.insert(user);
        }
    }

    /// Drops `user` from `value`'s user set, but only when no operand
    /// occurrence of `value` remains in that instruction.
    fn remove_use(&mut self, value: ValueId, user: InstrId) {
        if self.instrs[user].operands.contains(&value) {
            return;
        }
        if let Some(users) = self.users_entry(value) {
            users.remove(&user);
        }
    }

    fn link_successor(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    fn unlink_successor(&mut self, from: BlockId, to: BlockId) {
        if let Some(pos) = self.blocks[from].succs.iter().position(|s| *s == to) {
            self.blocks[from].succs.remove(pos);
        }
        if let Some(pos) = self.blocks[to].preds.iter().position(|p| *p == from) {
            self.blocks[to].preds.remove(pos);
        }
    }

    /// Appends a new instruction to `block`, wiring use-def edges and,
    /// for block operands, the successor/predecessor links.
    pub fn append(
        &mut self,
        block: BlockId,
        kind: InstrKind,
        ty: LiteralType,
        name: impl Into<String>,
        operands: Vec<ValueId>,
    ) -> InstrId {
        self.instrs.push(Instr {
            kind,
            ty,
            name: name.into(),
            operands: operands.clone(),
            users: BTreeSet::new(),
            block: Some(block),
            erased: false,
        });
        let id = self.instrs.len() - 1;

        for op in operands {
            self.add_use(op, id);
            if let ValueId::Block(target) = op {
                self.link_successor(block, target);
            }
        }

        self.blocks[block].instrs.push(id);
        id
    }

    pub fn add_operand(&mut self, instr: InstrId, value: ValueId) {
        self.instrs[instr].operands.push(value);
        self.add_use(value, instr);
        if let (ValueId::Block(target), Some(block)) = (value, self.instrs[instr].block) {
            self.link_successor(block, target);
        }
    }

    pub fn set_operand(&mut self, instr: InstrId, index: usize, value: ValueId) {
        let old = self.instrs[instr].operands[index];
        if old == value {
            return;
        }
        let block = self.instrs[instr].block;

        self.instrs[instr].operands[index] = value;
        self.remove_use(old, instr);
        self.add_use(value, instr);

        if let Some(block) = block {
            if let ValueId::Block(target) = old {
                self.unlink_successor(block, target);
            }
            if let ValueId::Block(target) = value {
                self.link_successor(block, target);
            }
        }
    }

    /// Rewrites every operand occurrence of `old` to `new`, across all
    /// users. Returns how many operands changed.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) -> usize {
        let mut count = 0;
        for user in self.users_of(old) {
            let indices: Vec<usize> = self.instrs[user]
                .operands
                .iter()
                .enumerate()
                .filter(|(_, op)| **op == old)
                .map(|(i, _)| i)
                .collect();
            for index in indices {
                self.set_operand(user, index, new);
                count += 1;
            }
        }
        count
    }

    pub fn erase_instr(&mut self, id: InstrId) {
        let operands = std::mem::take(&mut self.instrs[id].operands);
        let block = self.instrs[id].block;

        for op in &operands {
            self.remove_use(*op, id);
            if let (ValueId::Block(target), Some(block)) = (op, block) {
                self.unlink_successor(block, *target);
            }
        }

        if let Some(block) = block {
            self.blocks[block].instrs.retain(|i| *i != id);
        }

        let instr = &mut self.instrs[id];
        instr.block = None;
        instr.erased = true;
    }

    /// Removes a block that no instruction references anymore.
    pub fn remove_block(&mut self, id: BlockId) {
        debug_assert!(self.blocks[id].users.is_empty());
        for instr in self.blocks[id].instrs.clone() {
            self.erase_instr(instr);
        }
        self.blocks[id].dead = true;
    }

    /// Moves all instructions of `from` to the end of `to`, keeping the
    /// successor links consistent. `from` is left empty.
    pub fn move_instrs(&mut self, from: BlockId, to: BlockId) {
        let moved = std::mem::take(&mut self.blocks[from].instrs);
        for id in &moved {
            let block_targets: Vec<BlockId> = self.instrs[*id]
                .operands
                .iter()
                .filter_map(|op| match op {
                    ValueId::Block(t) => Some(*t),
                    _ => None,
                })
                .collect();
            for target in block_targets {
                self.unlink_successor(from, target);
                self.link_successor(to, target);
            }
            self.instrs[*id].block = Some(to);
            self.blocks[to].instrs.push(*id);
        }
    }

    // }}}
    // {{{ verification

    /// Checks the structural invariants: every reachable block ends in
    /// exactly one terminator, use-def edges are symmetric, and the
    /// successor lists mirror the terminator operands.
    pub fn verify(&self) -> Result<(), String> {
        for block_id in self.reachable_blocks() {
            let block = &self.blocks[block_id];
            match block.instrs.last() {
                None => return Err(format!("{}: block %{} is empty", self.name, block.name)),
                Some(last) => {
                    if !self.instrs[*last].kind.is_terminator() {
                        return Err(format!(
                            "{}: block %{} does not end in a terminator",
                            self.name, block.name
                        ));
                    }
                }
            }
            for id in &block.instrs[..block.instrs.len() - 1] {
                if self.instrs[*id].kind.is_terminator() {
                    return Err(format!(
                        "{}: terminator in the middle of block %{}",
                        self.name, block.name
                    ));
                }
            }

            let mut expected: Vec<BlockId> = Vec::new();
            for id in &block.instrs {
                for op in &self.instrs[*id].operands {
                    if let ValueId::Block(t) = op {
                        expected.push(*t);
                    }
                }
            }
            let mut actual = block.succs.clone();
            expected.sort_unstable();
            actual.sort_unstable();
            if expected != actual {
                return Err(format!(
                    "{}: successor links of %{} out of sync",
                    self.name, block.name
                ));
            }
        }

        for (id, instr) in self.instrs.iter().enumerate() {
            if instr.erased {
                continue;
            }
            for op in &instr.operands {
                if !self.users_of(*op).contains(&id) {
                    return Err(format!(
                        "{}: instr %{} missing from users of its operand",
                        self.name, instr.name
                    ));
                }
            }
            for user in &instr.users {
                if self.instrs[*user].erased
                    || !self.instrs[*user].operands.contains(&ValueId::Instr(id))
                {
                    return Err(format!(
                        "{}: stale user entry on instr %{}",
                        self.name, instr.name
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn reachable_blocks(&self) -> Vec<BlockId> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut stack = match self.entry {
            Some(entry) if !self.blocks[entry].dead => vec![entry],
            _ => Vec::new(),
        };
        while let Some(block) = stack.pop() {
            if !seen.insert(block) {
                continue;
            }
            order.push(block);
            for succ in &self.blocks[block].succs {
                if !seen.contains(succ) {
                    stack.push(*succ);
                }
            }
        }
        order
    }

    // }}}

    pub fn dump(&self, constants: &[Constant]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "handler {} {{", self.name);
        for block_id in self.block_ids() {
            let block = &self.blocks[block_id];
            let _ = writeln!(out, "  %{}:", block.name);
            for id in &block.instrs {
                let instr = &self.instrs[*id];
                let mut line = String::new();
                if instr.ty != LiteralType::Void {
                    let _ = write!(line, "%{} = ", instr.name);
                }
                let _ = write!(line, "{}", kind_mnemonic(&instr.kind));
                for (i, op) in instr.operands.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    match op {
                        ValueId::Instr(v) => {
                            let _ = write!(line, "{}%{}", sep, self.instrs[*v].name);
                        }
                        ValueId::Block(b) => {
                            let _ = write!(line, "{}%{}", sep, self.blocks[*b].name);
                        }
                        ValueId::Const(c) => {
                            let _ = write!(line, "{}{}", sep, format_constant(constants, *c));
                        }
                        ValueId::NativeFunction(n) => {
                            let _ = write!(line, "{}@fn#{}", sep, n);
                        }
                        ValueId::NativeHandler(n) => {
                            let _ = write!(line, "{}@handler#{}", sep, n);
                        }
                    }
                }
                let _ = writeln!(out, "    {}", line);
            }
        }
        let _ = writeln!(out, "}}");
        out
    }
}

fn kind_mnemonic(kind: &InstrKind) -> String {
    match kind {
        InstrKind::Alloca => "alloca".into(),
        InstrKind::Load => "load".into(),
        InstrKind::Store => "store".into(),
        InstrKind::LoadGlobal(slot) => format!("gload {}", slot),
        InstrKind::StoreGlobal(slot) => format!("gstore {}", slot),
        InstrKind::Unary(op) | InstrKind::Binary(op) | InstrKind::Cast(op) => {
            op.mnemonic().to_ascii_lowercase()
        }
        InstrKind::RegExpGroup => "reggroup".into(),
        InstrKind::CallFunction => "call".into(),
        InstrKind::InvokeHandler => "invoke".into(),
        InstrKind::Br => "br".into(),
        InstrKind::CondBr => "condbr".into(),
        InstrKind::Match(class) => format!("match.{}", class),
        InstrKind::Ret => "ret".into(),
    }
}

pub fn format_constant(constants: &[Constant], id: ConstId) -> String {
    match &constants[id] {
        Constant::Boolean(b) => b.to_string(),
        Constant::Number(n) => n.to_string(),
        Constant::String(s) => format!("\"{}\"", s),
        Constant::IP(ip) => ip.to_string(),
        Constant::Cidr(cidr) => cidr.to_string(),
        Constant::RegExp(re) => re.to_string(),
        Constant::Array(_, elements) => {
            let inner: Vec<String> = elements
                .iter()
                .map(|e| format_constant(constants, *e))
                .collect();
            format!("[{}]", inner.join(", "))
        }
    }
}

/// A native function or handler referenced from IR; resolved against
/// the runtime at link time via its signature text.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeRef {
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVar {
    pub name: String,
    pub ty: LiteralType,
}

/// The compiled IR of one unit: deduplicated constants, native
/// references, global slots and one graph per handler.
#[derive(Debug, Default)]
pub struct IRProgram {
    pub modules: Vec<(String, String)>,
    pub constants: Vec<Constant>,
    pub native_functions: Vec<NativeRef>,
    pub native_handlers: Vec<NativeRef>,
    pub globals: Vec<GlobalVar>,
    pub handlers: Vec<IRHandler>,
}

impl IRProgram {
    pub fn new() -> IRProgram {
        IRProgram::default()
    }

    /// Interns a constant; structurally equal constants share an entry.
    pub fn get_constant(&mut self, constant: Constant) -> ConstId {
        for (id, existing) in self.constants.iter().enumerate() {
            if *existing == constant {
                return id;
            }
        }
        self.constants.push(constant);
        self.constants.len() - 1
    }

    pub fn get_boolean(&mut self, value: bool) -> ConstId {
        self.get_constant(Constant::Boolean(value))
    }

    pub fn get_number(&mut self, value: FlowNumber) -> ConstId {
        self.get_constant(Constant::Number(value))
    }

    pub fn get_string(&mut self, value: impl Into<String>) -> ConstId {
        self.get_constant(Constant::String(value.into()))
    }

    pub fn get_native_function(&mut self, name: &str, signature: String) -> usize {
        if let Some(id) = self
            .native_functions
            .iter()
            .position(|n| n.signature == signature)
        {
            return id;
        }
        self.native_functions.push(NativeRef {
            name: name.to_string(),
            signature,
        });
        self.native_functions.len() - 1
    }

    pub fn get_native_handler(&mut self, name: &str, signature: String) -> usize {
        if let Some(id) = self
            .native_handlers
            .iter()
            .position(|n| n.signature == signature)
        {
            return id;
        }
        self.native_handlers.push(NativeRef {
            name: name.to_string(),
            signature,
        });
        self.native_handlers.len() - 1
    }

    pub fn add_global(&mut self, name: impl Into<String>, ty: LiteralType) -> usize {
        self.globals.push(GlobalVar {
            name: name.into(),
            ty,
        });
        self.globals.len() - 1
    }

    /// Fetches the handler with the given name, creating it on demand.
    pub fn get_handler(&mut self, name: &str) -> usize {
        if let Some(id) = self.find_handler(name) {
            return id;
        }
        self.handlers.push(IRHandler::new(name));
        self.handlers.len() - 1
    }

    pub fn find_handler(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name == name)
    }

    pub fn dump(&self) -> String {
        let mut out = String::from("; IRProgram\n");
        for handler in &self.handlers {
            out.push_str(&handler.dump(&self.constants));
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ret_false(program: &mut IRProgram, handler: &mut IRHandler, block: BlockId) -> InstrId {
        let f = program.get_boolean(false);
        handler.append(
            block,
            InstrKind::Ret,
            LiteralType::Void,
            "ret",
            vec![ValueId::Const(f)],
        )
    }

    #[test]
    fn constants_deduplicate_structurally() {
        let mut program = IRProgram::new();
        let a = program.get_number(42);
        let b = program.get_number(42);
        let c = program.get_number(7);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let s1 = program.get_string("x");
        let s2 = program.get_string("x");
        assert_eq!(s1, s2);

        // same spelling, different type tables never collide
        assert_ne!(program.constants[a].ty(), program.constants[s1].ty());
    }

    #[test]
    fn append_maintains_use_def_and_successors() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let exit = handler.create_block("exit");

        let br = handler.append(
            entry,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(exit)],
        );
        ret_false(&mut program, &mut handler, exit);

        assert_eq!(handler.block(entry).succs, vec![exit]);
        assert_eq!(handler.block(exit).preds, vec![entry]);
        assert!(handler.users_of(ValueId::Block(exit)).contains(&br));
        assert!(handler.verify().is_ok());
    }

    #[test]
    fn set_operand_relinks_successors() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let a = handler.create_block("a");
        let b = handler.create_block("b");

        let br = handler.append(
            entry,
            InstrKind::Br,
            LiteralType::Void,
            "br",
            vec![ValueId::Block(a)],
        );
        ret_false(&mut program, &mut handler, a);
        ret_false(&mut program, &mut handler, b);

        handler.set_operand(br, 0, ValueId::Block(b));
        assert_eq!(handler.block(entry).succs, vec![b]);
        assert!(handler.block(a).preds.is_empty());
        assert!(handler.users_of(ValueId::Block(a)).is_empty());
        assert!(handler.users_of(ValueId::Block(b)).contains(&br));
        assert!(handler.verify().is_ok());
    }

    #[test]
    fn erase_instr_unlinks_everything() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let one = program.get_number(1);

        let alloca = handler.append(
            entry,
            InstrKind::Alloca,
            LiteralType::Number,
            "i",
            vec![ValueId::Const(one)],
        );
        let load = handler.append(
            entry,
            InstrKind::Load,
            LiteralType::Number,
            "i.load",
            vec![ValueId::Instr(alloca)],
        );

        assert!(handler.users_of(ValueId::Instr(alloca)).contains(&load));
        handler.erase_instr(load);
        assert!(handler.users_of(ValueId::Instr(alloca)).is_empty());
        assert!(!handler.block(entry).instrs.contains(&load));
    }

    #[test]
    fn verify_rejects_missing_terminator() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let one = program.get_number(1);
        handler.append(
            entry,
            InstrKind::Alloca,
            LiteralType::Number,
            "i",
            vec![ValueId::Const(one)],
        );
        assert!(handler.verify().is_err());
    }

    #[test]
    fn condbr_to_same_block_keeps_multiplicity() {
        let mut program = IRProgram::new();
        let mut handler = IRHandler::new("t");
        let entry = handler.create_block("entry");
        let target = handler.create_block("target");
        let cond = program.get_boolean(true);

        handler.append(
            entry,
            InstrKind::CondBr,
            LiteralType::Void,
            "condbr",
            vec![
                ValueId::Const(cond),
                ValueId::Block(target),
                ValueId::Block(target),
            ],
        );
        ret_false(&mut program, &mut handler, target);

        assert_eq!(handler.block(entry).succs, vec![target, target]);
        assert_eq!(handler.block(target).preds, vec![entry, entry]);
        assert!(handler.verify().is_ok());
    }
}
