use std::net::IpAddr;

use crate::location::SourceLocation;
use crate::types::{FlowNumber, LiteralType, MatchClass};
use crate::util::cidr::Cidr;
use crate::util::regexp::RegExp;
use crate::vm::instruction::Opcode;

pub type SymbolId = usize;
pub type ScopeId = usize;

// {{{ expressions

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Boolean(bool),
    Number(FlowNumber),
    String(String),
    IP(IpAddr),
    Cidr(Cidr),
    RegExp(RegExp),
}

impl LiteralValue {
    pub fn ty(&self) -> LiteralType {
        match self {
            LiteralValue::Boolean(_) => LiteralType::Boolean,
            LiteralValue::Number(_) => LiteralType::Number,
            LiteralValue::String(_) => LiteralType::String,
            LiteralValue::IP(_) => LiteralType::IPAddress,
            LiteralValue::Cidr(_) => LiteralType::Cidr,
            LiteralValue::RegExp(_) => LiteralType::RegExp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiteralExpr {
    pub value: LiteralValue,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub op: Opcode,
    pub expr: Box<Expr>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: Opcode,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableExpr {
    pub symbol: SymbolId,
    pub name: String,
    pub ty: LiteralType,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRefExpr {
    pub symbol: SymbolId,
    pub name: String,
    pub location: SourceLocation,
}

/// Who a call expression dispatches to, decided during parsing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Callee {
    /// A source-level handler, inlined at IR generation time.
    Handler(SymbolId),
    /// Index into the runtime's builtin registry.
    BuiltinFunction(usize),
    BuiltinHandler(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub callee: Callee,
    pub name: String,
    pub ret: LiteralType,
    pub args: ParamList,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegExpGroupExpr {
    pub group: FlowNumber,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayExpr {
    pub elements: Vec<Expr>,
    pub ty: LiteralType,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(LiteralExpr),
    Unary(UnaryExpr),
    Binary(BinaryExpr),
    Variable(VariableExpr),
    HandlerRef(HandlerRefExpr),
    Call(CallExpr),
    RegExpGroup(RegExpGroupExpr),
    Array(ArrayExpr),
}

impl Expr {
    pub fn ty(&self) -> LiteralType {
        match self {
            Expr::Literal(e) => e.value.ty(),
            Expr::Unary(e) => e.op.result_type(),
            Expr::Binary(e) => e.op.result_type(),
            Expr::Variable(e) => e.ty,
            Expr::HandlerRef(_) => LiteralType::Handler,
            Expr::Call(e) => e.ret,
            Expr::RegExpGroup(_) => LiteralType::String,
            Expr::Array(e) => e.ty,
        }
    }

    pub fn location(&self) -> &SourceLocation {
        match self {
            Expr::Literal(e) => &e.location,
            Expr::Unary(e) => &e.location,
            Expr::Binary(e) => &e.location,
            Expr::Variable(e) => &e.location,
            Expr::HandlerRef(e) => &e.location,
            Expr::Call(e) => &e.location,
            Expr::RegExpGroup(e) => &e.location,
            Expr::Array(e) => &e.location,
        }
    }
}

/// Call arguments; `names` is empty for positional calls and parallel
/// to `values` for named-parameter calls.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamList {
    pub names: Vec<String>,
    pub values: Vec<Expr>,
}

impl ParamList {
    pub fn is_named(&self) -> bool {
        !self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, name: Option<String>, value: Expr) {
        if let Some(name) = name {
            self.names.push(name);
        }
        self.values.push(value);
    }
}

// }}}
// {{{ statements

#[derive(Debug, Clone, PartialEq)]
pub struct ExprStmt {
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompoundStmt {
    pub stmts: Vec<Stmt>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CondStmt {
    pub condition: Expr,
    pub then_stmt: Box<Stmt>,
    pub else_stmt: Option<Box<Stmt>>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhileStmt {
    pub condition: Expr,
    pub body: Box<Stmt>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub labels: Vec<Expr>,
    pub body: Stmt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchStmt {
    pub condition: Expr,
    pub op: MatchClass,
    pub cases: Vec<MatchCase>,
    pub else_stmt: Option<Box<Stmt>>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignStmt {
    pub variable: SymbolId,
    pub name: String,
    pub expr: Expr,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(ExprStmt),
    Compound(CompoundStmt),
    Cond(CondStmt),
    While(WhileStmt),
    Match(MatchStmt),
    Assign(AssignStmt),
}

// }}}
// {{{ symbols and scopes

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSym {
    pub name: String,
    pub ty: LiteralType,
    pub initializer: Expr,
    pub global: bool,
    pub location: SourceLocation,
}

/// A source-level handler. Forward declarations leave `body` empty; the
/// symbol id stays stable when the implementation arrives later, so
/// call sites never re-bind.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSym {
    pub name: String,
    pub scope: Option<ScopeId>,
    pub body: Option<Stmt>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinSym {
    pub name: String,
    pub callback: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    Variable(VariableSym),
    Handler(HandlerSym),
    BuiltinFunction(BuiltinSym),
    BuiltinHandler(BuiltinSym),
}

impl Symbol {
    pub fn name(&self) -> &str {
        match self {
            Symbol::Variable(s) => &s.name,
            Symbol::Handler(s) => &s.name,
            Symbol::BuiltinFunction(s) => &s.name,
            Symbol::BuiltinHandler(s) => &s.name,
        }
    }
}

/// Lookup mode: the starting table only, or the whole outer chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    OwnScope,
    All,
}

/// One lexical scope. Symbol order is insertion order; global-scope
/// initialization depends on it.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTable {
    pub name: String,
    pub outer: Option<ScopeId>,
    pub symbols: Vec<SymbolId>,
}

/// The parsed unit: the symbol and scope arenas plus import records.
/// Scope 0 is the global scope.
#[derive(Debug)]
pub struct UnitSym {
    pub imports: Vec<(String, String)>,
    symbols: Vec<Symbol>,
    scopes: Vec<SymbolTable>,
}

pub const GLOBAL_SCOPE: ScopeId = 0;

impl UnitSym {
    pub fn new() -> UnitSym {
        UnitSym {
            imports: Vec::new(),
            symbols: Vec::new(),
            scopes: vec![SymbolTable {
                name: "global".to_string(),
                outer: None,
                symbols: Vec::new(),
            }],
        }
    }

    pub fn add_scope(&mut self, name: impl Into<String>, outer: ScopeId) -> ScopeId {
        self.scopes.push(SymbolTable {
            name: name.into(),
            outer: Some(outer),
            symbols: Vec::new(),
        });
        self.scopes.len() - 1
    }

    pub fn add_symbol(&mut self, scope: ScopeId, symbol: Symbol) -> SymbolId {
        self.symbols.push(symbol);
        let id = self.symbols.len() - 1;
        self.scopes[scope].symbols.push(id);
        id
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }

    pub fn scope(&self, id: ScopeId) -> &SymbolTable {
        &self.scopes[id]
    }

    pub fn scope_symbols(&self, id: ScopeId) -> &[SymbolId] {
        &self.scopes[id].symbols
    }

    /// Finds `name` starting at `scope`. Walks the outer chain in `All`
    /// mode and returns every match from the innermost table that has
    /// any, so overloads stay together while nested declarations shadow
    /// outer ones.
    pub fn lookup(&self, scope: ScopeId, name: &str, mode: Lookup) -> Vec<SymbolId> {
        let mut current = Some(scope);
        while let Some(table_id) = current {
            let table = &self.scopes[table_id];
            let matches: Vec<SymbolId> = table
                .symbols
                .iter()
                .copied()
                .filter(|id| self.symbols[*id].name() == name)
                .collect();
            if !matches.is_empty() {
                return matches;
            }
            current = match mode {
                Lookup::OwnScope => None,
                Lookup::All => table.outer,
            };
        }
        Vec::new()
    }
}

impl Default for UnitSym {
    fn default() -> UnitSym {
        UnitSym::new()
    }
}

// }}}

#[cfg(test)]
mod test {
    use super::*;
    use crate::location::SourceLocation;

    fn variable(name: &str) -> Symbol {
        Symbol::Variable(VariableSym {
            name: name.to_string(),
            ty: LiteralType::Number,
            initializer: Expr::Literal(LiteralExpr {
                value: LiteralValue::Number(0),
                location: SourceLocation::default(),
            }),
            global: false,
            location: SourceLocation::default(),
        })
    }

    #[test]
    fn lookup_walks_outer_chain() {
        let mut unit = UnitSym::new();
        let inner = unit.add_scope("handler-main", GLOBAL_SCOPE);
        let id = unit.add_symbol(GLOBAL_SCOPE, variable("x"));

        assert_eq!(unit.lookup(inner, "x", Lookup::All), vec![id]);
        assert!(unit.lookup(inner, "x", Lookup::OwnScope).is_empty());
    }

    #[test]
    fn inner_declaration_shadows_outer() {
        let mut unit = UnitSym::new();
        let inner = unit.add_scope("handler-main", GLOBAL_SCOPE);
        let outer_x = unit.add_symbol(GLOBAL_SCOPE, variable("x"));
        let inner_x = unit.add_symbol(inner, variable("x"));

        assert_eq!(unit.lookup(inner, "x", Lookup::All), vec![inner_x]);
        assert_eq!(unit.lookup(GLOBAL_SCOPE, "x", Lookup::All), vec![outer_x]);
    }

    #[test]
    fn overloads_in_one_scope_stay_together() {
        let mut unit = UnitSym::new();
        let a = unit.add_symbol(
            GLOBAL_SCOPE,
            Symbol::BuiltinFunction(BuiltinSym {
                name: "log".to_string(),
                callback: 0,
            }),
        );
        let b = unit.add_symbol(
            GLOBAL_SCOPE,
            Symbol::BuiltinFunction(BuiltinSym {
                name: "log".to_string(),
                callback: 1,
            }),
        );

        assert_eq!(unit.lookup(GLOBAL_SCOPE, "log", Lookup::All), vec![a, b]);
    }

    #[test]
    fn symbol_order_is_insertion_order() {
        let mut unit = UnitSym::new();
        unit.add_symbol(GLOBAL_SCOPE, variable("a"));
        unit.add_symbol(GLOBAL_SCOPE, variable("b"));
        unit.add_symbol(GLOBAL_SCOPE, variable("c"));

        let names: Vec<&str> = unit
            .scope_symbols(GLOBAL_SCOPE)
            .iter()
            .map(|id| unit.symbol(*id).name())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
