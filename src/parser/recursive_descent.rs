use lazy_static::lazy_static;

use crate::diagnostics::SharedReport;
use crate::lexer::lex::Lexer;
use crate::lexer::token::Token;
use crate::location::SourceLocation;
use crate::parser::ast::*;
use crate::types::{Feature, LiteralType, MatchClass};
use crate::util::regexp::RegExp;
use crate::vm::instruction::Opcode;
use crate::vm::runtime::{Runtime, Signature, Value};

use anyhow::Result;

lazy_static! {
    /// Numeric unit suffixes: (ident, nominator, denominator). Plural
    /// forms (trailing 's') are accepted as well.
    static ref UNITS: Vec<(&'static str, i64, i64)> = vec![
        ("byte", 1, 1),
        ("kbyte", 1 << 10, 1),
        ("mbyte", 1 << 20, 1),
        ("gbyte", 1 << 30, 1),
        ("tbyte", 1i64 << 40, 1),
        ("bit", 1, 8),
        ("kbit", 1 << 10, 8),
        ("mbit", 1 << 20, 8),
        ("gbit", 1 << 30, 8),
        ("tbit", 1i64 << 40, 8),
        ("sec", 1, 1),
        ("min", 60, 1),
        ("hour", 60 * 60, 1),
        ("day", 60 * 60 * 24, 1),
        ("week", 60 * 60 * 24 * 7, 1),
        ("month", 60 * 60 * 24 * 30, 1),
        ("year", 60 * 60 * 24 * 365, 1),
    ];
}

// {{{ operator selection

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpSig {
    BoolBool,
    NumNum,
    StringString,
    StringRegexp,
    IpIp,
    IpCidr,
    CidrCidr,
}

fn operand_signature(lhs: LiteralType, rhs: LiteralType) -> Option<OpSig> {
    use LiteralType::*;
    match (lhs, rhs) {
        (Boolean, Boolean) => Some(OpSig::BoolBool),
        (Number, Number) => Some(OpSig::NumNum),
        (String, String) => Some(OpSig::StringString),
        (String, RegExp) => Some(OpSig::StringRegexp),
        (IPAddress, IPAddress) => Some(OpSig::IpIp),
        (IPAddress, Cidr) => Some(OpSig::IpCidr),
        (Cidr, Cidr) => Some(OpSig::CidrCidr),
        _ => None,
    }
}

/// Picks the opcode for a binary operation, or None when the operand
/// signature does not support the operator. `(cidr, cidr)` comparisons
/// are a recognized signature with no executable operation behind it.
fn make_binary_operator(token: &Token, lhs: LiteralType, rhs: LiteralType) -> Option<Opcode> {
    let sig = operand_signature(lhs, rhs)?;
    match (sig, token) {
        (OpSig::BoolBool, Token::Equal) => Some(Opcode::NCmpEq),
        (OpSig::BoolBool, Token::UnEqual) => Some(Opcode::NCmpNe),
        (OpSig::BoolBool, Token::And) => Some(Opcode::BAnd),
        (OpSig::BoolBool, Token::Or) => Some(Opcode::BOr),
        (OpSig::BoolBool, Token::Xor) => Some(Opcode::BXor),

        (OpSig::NumNum, Token::Plus) => Some(Opcode::NAdd),
        (OpSig::NumNum, Token::Minus) => Some(Opcode::NSub),
        (OpSig::NumNum, Token::Mul) => Some(Opcode::NMul),
        (OpSig::NumNum, Token::Div) => Some(Opcode::NDiv),
        (OpSig::NumNum, Token::Mod) => Some(Opcode::NRem),
        (OpSig::NumNum, Token::Pow) => Some(Opcode::NPow),
        (OpSig::NumNum, Token::Shl) => Some(Opcode::NShl),
        (OpSig::NumNum, Token::Shr) => Some(Opcode::NShr),
        (OpSig::NumNum, Token::BitAnd) => Some(Opcode::NAnd),
        (OpSig::NumNum, Token::BitOr) => Some(Opcode::NOr),
        (OpSig::NumNum, Token::BitXor) => Some(Opcode::NXor),
        (OpSig::NumNum, Token::Equal) => Some(Opcode::NCmpEq),
        (OpSig::NumNum, Token::UnEqual) => Some(Opcode::NCmpNe),
        (OpSig::NumNum, Token::LessOrEqual) => Some(Opcode::NCmpLe),
        (OpSig::NumNum, Token::GreaterOrEqual) => Some(Opcode::NCmpGe),
        (OpSig::NumNum, Token::Less) => Some(Opcode::NCmpLt),
        (OpSig::NumNum, Token::Greater) => Some(Opcode::NCmpGt),

        (OpSig::StringString, Token::Plus) => Some(Opcode::SAdd),
        (OpSig::StringString, Token::Equal) => Some(Opcode::SCmpEq),
        (OpSig::StringString, Token::UnEqual) => Some(Opcode::SCmpNe),
        (OpSig::StringString, Token::LessOrEqual) => Some(Opcode::SCmpLe),
        (OpSig::StringString, Token::GreaterOrEqual) => Some(Opcode::SCmpGe),
        (OpSig::StringString, Token::Less) => Some(Opcode::SCmpLt),
        (OpSig::StringString, Token::Greater) => Some(Opcode::SCmpGt),
        (OpSig::StringString, Token::PrefixMatch) => Some(Opcode::SCmpBeg),
        (OpSig::StringString, Token::SuffixMatch) => Some(Opcode::SCmpEnd),
        (OpSig::StringString, Token::In) => Some(Opcode::SContains),

        (OpSig::StringRegexp, Token::RegexMatch) => Some(Opcode::SRegMatch),

        (OpSig::IpIp, Token::Equal) => Some(Opcode::PCmpEq),
        (OpSig::IpIp, Token::UnEqual) => Some(Opcode::PCmpNe),

        (OpSig::IpCidr, Token::In) => Some(Opcode::PInCidr),

        // cidr-to-cidr comparison is recognized but unsupported
        (OpSig::CidrCidr, _) => None,

        _ => None,
    }
}

/// Cast table: source type plus target token (or unary operator token)
/// to the converting opcode. `Nop` marks the identity cast.
fn make_cast_operator(target: &Token, source: LiteralType) -> Option<Opcode> {
    use LiteralType::*;
    match (source, target) {
        (Number, Token::Not) => Some(Opcode::NCmpZ),
        (Number, Token::BitNot) => Some(Opcode::NNot),
        (Number, Token::Minus) => Some(Opcode::NNeg),
        (Number, Token::StringType) => Some(Opcode::N2S),
        (Number, Token::BoolType) => Some(Opcode::NCmpZ),
        (Number, Token::NumberType) => Some(Opcode::Nop),

        (Boolean, Token::Not) => Some(Opcode::BNot),
        (Boolean, Token::BoolType) => Some(Opcode::Nop),
        (Boolean, Token::StringType) => Some(Opcode::B2S),

        (String, Token::Not) => Some(Opcode::SIsEmpty),
        (String, Token::NumberType) => Some(Opcode::S2N),
        (String, Token::StringType) => Some(Opcode::Nop),

        (IPAddress, Token::StringType) => Some(Opcode::P2S),
        (Cidr, Token::StringType) => Some(Opcode::C2S),
        (RegExp, Token::StringType) => Some(Opcode::R2S),

        _ => None,
    }
}

// }}}

pub type ImportHandler<'r> = Box<dyn FnMut(&str, &str) -> bool + 'r>;

/// Recursive-descent parser. Symbol resolution, type checking and
/// opcode selection happen during the descent; the produced tree
/// carries no unresolved names and no untyped expressions.
pub struct Parser<'r> {
    features: Vec<Feature>,
    report: SharedReport,
    lexer: Lexer,
    runtime: Option<&'r Runtime>,
    import_handler: Option<ImportHandler<'r>>,
    unit: UnitSym,
    scope_stack: Vec<ScopeId>,
    lambda_count: usize,
}

impl<'r> Parser<'r> {
    pub fn new(features: Vec<Feature>, report: SharedReport, runtime: Option<&'r Runtime>) -> Parser<'r> {
        Parser {
            features,
            report: report.clone(),
            lexer: Lexer::new(report),
            runtime,
            import_handler: None,
            unit: UnitSym::new(),
            scope_stack: vec![GLOBAL_SCOPE],
            lambda_count: 0,
        }
    }

    pub fn set_import_handler(&mut self, handler: ImportHandler<'r>) {
        self.import_handler = Some(handler);
    }

    pub fn open_string(&mut self, source: &str) {
        self.lexer.open_string(source);
    }

    pub fn open_file(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.lexer.open_file(path)
    }

    fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    // {{{ token plumbing

    fn token(&self) -> &Token {
        self.lexer.token()
    }

    fn next_token(&mut self) {
        self.lexer.next_token();
    }

    fn location(&self) -> SourceLocation {
        self.lexer.location().clone()
    }

    fn last_location(&self) -> SourceLocation {
        self.lexer.last_location().clone()
    }

    fn end(&self) -> crate::location::FilePos {
        self.lexer.end()
    }

    fn expect(&mut self, token: &Token) -> bool {
        if !self.token().same_kind(token) {
            let loc = self.last_location();
            let text = format!(
                "Unexpected token '{}' (expected: '{}')",
                self.token(),
                token
            );
            self.report.borrow_mut().syntax_error(loc, text);
            return false;
        }
        true
    }

    fn consume(&mut self, token: &Token) -> bool {
        if !self.expect(token) {
            return false;
        }
        self.next_token();
        true
    }

    fn consume_if(&mut self, token: &Token) -> bool {
        if self.token().same_kind(token) {
            self.next_token();
            true
        } else {
            false
        }
    }

    fn consume_until(&mut self, token: &Token) -> bool {
        loop {
            if self.token().same_kind(token) {
                self.next_token();
                return true;
            }
            if *self.token() == Token::Eof {
                return false;
            }
            self.next_token();
        }
    }

    /// Statement-boundary recovery: skip to the next `;` (consumed) or
    /// to a block end, so one error doesn't hide the rest.
    fn recover(&mut self) {
        loop {
            match self.token() {
                Token::Semicolon => {
                    self.next_token();
                    return;
                }
                Token::End | Token::Eof => return,
                _ => self.next_token(),
            }
        }
    }

    // }}}
    // {{{ scopes

    fn current_scope(&self) -> ScopeId {
        *self.scope_stack.last().unwrap()
    }

    fn enter_scope(&mut self, name: impl Into<String>) -> ScopeId {
        let outer = self.current_scope();
        let scope = self.unit.add_scope(name, outer);
        self.scope_stack.push(scope);
        scope
    }

    fn leave_scope(&mut self) -> ScopeId {
        self.scope_stack.pop().unwrap()
    }

    // }}}
    // {{{ unit & declarations

    pub fn parse(mut self) -> UnitSym {
        self.import_runtime();

        while self.token().same_kind(&Token::Import) {
            self.import_decl();
        }

        loop {
            match self.token().clone() {
                Token::Eof => break,
                Token::Var => {
                    let loc = self.location();
                    match self.var_decl(true) {
                        Some(var) => {
                            if self.has_feature(Feature::GlobalScope) {
                                self.unit.add_symbol(GLOBAL_SCOPE, Symbol::Variable(var));
                            } else {
                                self.report
                                    .borrow_mut()
                                    .syntax_error(loc, "Global-scope feature not enabled.");
                            }
                        }
                        None => self.recover(),
                    }
                }
                Token::Handler => {
                    if self.handler_decl(true).is_none() {
                        self.recover();
                    }
                }
                Token::Ident(_) => {
                    if self.handler_decl(false).is_none() {
                        self.recover();
                    }
                }
                other => {
                    let loc = self.last_location();
                    self.report.borrow_mut().syntax_error(
                        loc,
                        format!("Unexpected token {}. Expected a declaration instead.", other),
                    );
                    self.next_token();
                }
            }
        }

        self.unit
    }

    /// Declares every runtime builtin as a global-scope symbol.
    fn import_runtime(&mut self) {
        if let Some(runtime) = self.runtime {
            for (callback, native) in runtime.builtins().iter().enumerate() {
                let builtin = BuiltinSym {
                    name: native.name().to_string(),
                    callback,
                };
                let symbol = if native.is_handler() {
                    Symbol::BuiltinHandler(builtin)
                } else {
                    Symbol::BuiltinFunction(builtin)
                };
                self.unit.add_symbol(GLOBAL_SCOPE, symbol);
            }
        }
    }

    // 'import' NAME_OR_NAMELIST ['from' PATH] ';'
    fn import_decl(&mut self) -> bool {
        self.next_token(); // skip 'import'

        let mut names = Vec::new();
        if !self.import_one(&mut names) {
            self.consume_until(&Token::Semicolon);
            return false;
        }
        while self.token().same_kind(&Token::Comma) {
            self.next_token();
            if !self.import_one(&mut names) {
                self.consume_until(&Token::Semicolon);
                return false;
            }
        }

        let mut path = String::new();
        if self.consume_if(&Token::From) {
            path = match self.token() {
                Token::String(s) | Token::RawString(s) => s.clone(),
                _ => {
                    let loc = self.last_location();
                    self.report
                        .borrow_mut()
                        .syntax_error(loc, "Expected import path.");
                    self.consume_until(&Token::Semicolon);
                    return false;
                }
            };
            self.next_token();

            if !path.is_empty() && !path.starts_with('/') {
                let base = self.lexer.location().filename.clone();
                if let Some(pos) = base.rfind('/') {
                    path = format!("{}{}", &base[..pos + 1], path);
                }
            }
        }

        for name in names {
            if let Some(handler) = self.import_handler.as_mut() {
                if !handler(&name, &path) {
                    let loc = self.last_location();
                    self.report
                        .borrow_mut()
                        .syntax_error(loc, format!("Cannot import '{}'.", name));
                    return false;
                }
            }
            self.unit.imports.push((name, path.clone()));
        }

        self.consume(&Token::Semicolon);
        true
    }

    fn import_one(&mut self, names: &mut Vec<String>) -> bool {
        match self.token().clone() {
            Token::Ident(name) | Token::String(name) | Token::RawString(name) => {
                names.push(name);
                self.next_token();
                true
            }
            Token::RndOpen => {
                self.next_token();
                if !self.import_one(names) {
                    return false;
                }
                while self.token().same_kind(&Token::Comma) {
                    self.next_token();
                    if !self.import_one(names) {
                        return false;
                    }
                }
                self.consume(&Token::RndClose)
            }
            other => {
                let loc = self.last_location();
                self.report.borrow_mut().syntax_error(
                    loc,
                    format!(
                        "Syntax error in import declaration. Unexpected token {}.",
                        other
                    ),
                );
                false
            }
        }
    }

    // 'var' IDENT '=' expr ';'
    fn var_decl(&mut self, global: bool) -> Option<VariableSym> {
        let mut loc = self.location();

        if !self.consume(&Token::Var) {
            return None;
        }

        let name = match self.token() {
            Token::Ident(name) => name.clone(),
            _ => {
                self.expect(&Token::Ident(String::new()));
                return None;
            }
        };
        self.next_token();

        if !self.consume(&Token::Assign) {
            return None;
        }

        let initializer = self.expr()?;
        if matches!(initializer.ty(), LiteralType::Void | LiteralType::Handler) {
            let errloc = self.last_location();
            self.report.borrow_mut().type_error(
                errloc,
                format!(
                    "Variable initializer must produce a value, got <{}>.",
                    initializer.ty()
                ),
            );
            return None;
        }
        loc.update(initializer.location().end);
        self.consume(&Token::Semicolon);

        Some(VariableSym {
            name,
            ty: initializer.ty(),
            initializer,
            global,
            location: loc,
        })
    }

    // handlerDecl ::= ['handler'] IDENT (';' | stmt)
    fn handler_decl(&mut self, keyword: bool) -> Option<SymbolId> {
        let mut loc = self.location();

        if keyword {
            self.next_token(); // 'handler'
        }

        let name = match self.token() {
            Token::Ident(name) => name.clone(),
            _ => {
                self.expect(&Token::Ident(String::new()));
                return None;
            }
        };
        self.next_token();

        if self.consume_if(&Token::Semicolon) {
            // forward declaration
            loc.update(self.end());
            let existing = self.unit.lookup(self.current_scope(), &name, Lookup::OwnScope);
            for id in &existing {
                if matches!(self.unit.symbol(*id), Symbol::Handler(_)) {
                    return Some(*id);
                }
            }
            let id = self.unit.add_symbol(
                self.current_scope(),
                Symbol::Handler(HandlerSym {
                    name,
                    scope: None,
                    body: None,
                    location: loc,
                }),
            );
            return Some(id);
        }

        let scope = self.enter_scope(format!("handler-{}", name));
        let body = self.stmt();
        self.leave_scope();

        let body = body?;
        loc.update(self.end());

        // forward-declared or previously declared?
        let existing = self.unit.lookup(self.current_scope(), &name, Lookup::OwnScope);
        for id in existing {
            if let Symbol::Handler(handler) = self.unit.symbol(id) {
                if handler.body.is_some() {
                    let errloc = self.last_location();
                    self.report
                        .borrow_mut()
                        .type_error(errloc, format!("Redeclaring handler \"{}\"", name));
                    return None;
                }
                if let Symbol::Handler(handler) = self.unit.symbol_mut(id) {
                    handler.scope = Some(scope);
                    handler.body = Some(body);
                    handler.location = loc;
                }
                return Some(id);
            }
        }

        let id = self.unit.add_symbol(
            self.current_scope(),
            Symbol::Handler(HandlerSym {
                name,
                scope: Some(scope),
                body: Some(body),
                location: loc,
            }),
        );
        Some(id)
    }

    // }}}
    // {{{ expressions

    fn expr(&mut self) -> Option<Expr> {
        self.logic_expr()
    }

    fn binary(&mut self, binop: &Token, lhs: Expr, rhs: Expr) -> Option<Expr> {
        match make_binary_operator(binop, lhs.ty(), rhs.ty()) {
            Some(op) => {
                let mut loc = lhs.location().clone();
                loc.update(rhs.location().end);
                Some(Expr::Binary(BinaryExpr {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    location: loc,
                }))
            }
            None => {
                let loc = self.last_location();
                self.report.borrow_mut().type_error(
                    loc,
                    format!(
                        "Incompatible binary expression operands ({} {} {}).",
                        lhs.ty(),
                        binop,
                        rhs.ty()
                    ),
                );
                None
            }
        }
    }

    fn logic_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.not_expr()?;
        loop {
            match self.token() {
                Token::And | Token::Xor | Token::Or => {
                    let binop = self.token().clone();
                    self.next_token();
                    let rhs = self.not_expr()?;
                    lhs = self.binary(&binop, lhs, rhs)?;
                }
                _ => return Some(lhs),
            }
        }
    }

    fn not_expr(&mut self) -> Option<Expr> {
        let loc = self.location();
        let mut nots = 0usize;
        while self.consume_if(&Token::Not) {
            nots += 1;
        }

        let sub = self.rel_expr()?;
        if nots % 2 == 0 {
            return Some(sub);
        }

        match make_cast_operator(&Token::Not, sub.ty()) {
            Some(op) => {
                let mut loc = loc;
                loc.update(self.end());
                Some(Expr::Unary(UnaryExpr {
                    op,
                    expr: Box::new(sub),
                    location: loc,
                }))
            }
            None => {
                let errloc = self.last_location();
                self.report.borrow_mut().type_error(
                    errloc,
                    format!(
                        "Type cast error in unary 'not'-operator. Invalid source type <{}>.",
                        sub.ty()
                    ),
                );
                None
            }
        }
    }

    fn rel_expr(&mut self) -> Option<Expr> {
        let lhs = self.add_expr()?;
        if self.token().is_rel_op() {
            let binop = self.token().clone();
            self.next_token();
            let rhs = self.add_expr()?;
            return self.binary(&binop, lhs, rhs);
        }
        Some(lhs)
    }

    fn add_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.mul_expr()?;
        loop {
            match self.token() {
                Token::Plus | Token::Minus => {
                    let binop = self.token().clone();
                    self.next_token();
                    let rhs = self.mul_expr()?;
                    lhs = self.binary(&binop, lhs, rhs)?;
                }
                _ => return Some(lhs),
            }
        }
    }

    fn mul_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.pow_expr()?;
        loop {
            match self.token() {
                Token::Mul | Token::Div | Token::Mod | Token::Shl | Token::Shr => {
                    let binop = self.token().clone();
                    self.next_token();
                    let rhs = self.pow_expr()?;
                    lhs = self.binary(&binop, lhs, rhs)?;
                }
                _ => return Some(lhs),
            }
        }
    }

    // powExpr ::= negExpr ('**' powExpr)*, right-associative
    fn pow_expr(&mut self) -> Option<Expr> {
        let lhs = self.neg_expr()?;
        if self.token().same_kind(&Token::Pow) {
            self.next_token();
            let rhs = self.pow_expr()?;
            return self.binary(&Token::Pow, lhs, rhs);
        }
        Some(lhs)
    }

    fn neg_expr(&mut self) -> Option<Expr> {
        let mut loc = self.location();
        if self.consume_if(&Token::Minus) {
            let sub = self.neg_expr()?;
            match make_cast_operator(&Token::Minus, sub.ty()) {
                Some(op) => {
                    loc.update(self.end());
                    Some(Expr::Unary(UnaryExpr {
                        op,
                        expr: Box::new(sub),
                        location: loc,
                    }))
                }
                None => {
                    let errloc = self.last_location();
                    self.report.borrow_mut().type_error(
                        errloc,
                        format!(
                            "Type cast error in unary 'neg'-operator. Invalid source type <{}>.",
                            sub.ty()
                        ),
                    );
                    None
                }
            }
        } else {
            self.bit_not_expr()
        }
    }

    fn bit_not_expr(&mut self) -> Option<Expr> {
        let mut loc = self.location();
        if self.consume_if(&Token::BitNot) {
            let sub = self.bit_not_expr()?;
            match make_cast_operator(&Token::BitNot, sub.ty()) {
                Some(op) => {
                    loc.update(self.end());
                    Some(Expr::Unary(UnaryExpr {
                        op,
                        expr: Box::new(sub),
                        location: loc,
                    }))
                }
                None => {
                    let errloc = self.last_location();
                    self.report.borrow_mut().type_error(
                        errloc,
                        format!(
                            "Type cast error in unary 'not'-operator. Invalid source type <{}>.",
                            sub.ty()
                        ),
                    );
                    None
                }
            }
        } else {
            self.primary_expr()
        }
    }

    fn primary_expr(&mut self) -> Option<Expr> {
        match self.token().clone() {
            Token::String(_)
            | Token::RawString(_)
            | Token::Number(_)
            | Token::Boolean(_)
            | Token::IP(_)
            | Token::Cidr(_)
            | Token::RegExp(_)
            | Token::Div => self.literal_expr(),
            Token::RegExpGroup(_) => self.regexp_group(),
            Token::StringType | Token::NumberType | Token::BoolType => self.cast_expr(),
            Token::InterpolatedStringFragment(_) => self.interpolated_str(),
            Token::Ident(name) => self.ident_expr(name),
            Token::Begin => self.lambda_expr(),
            Token::RndOpen => {
                let mut loc = self.location();
                self.next_token();
                let e = self.expr();
                self.consume(&Token::RndClose);
                loc.update(self.end());
                e
            }
            Token::BrOpen => self.array_expr(),
            other => {
                let loc = self.last_location();
                self.report
                    .borrow_mut()
                    .syntax_error(loc, format!("Unexpected token {}", other));
                None
            }
        }
    }

    fn ident_expr(&mut self, name: String) -> Option<Expr> {
        let mut loc = self.location();
        self.next_token();

        let symbols = self.unit.lookup(self.current_scope(), &name, Lookup::All);
        if symbols.is_empty() {
            // assume a forward-declared handler defined later on
            let id = self.unit.add_symbol(
                GLOBAL_SCOPE,
                Symbol::Handler(HandlerSym {
                    name: name.clone(),
                    scope: None,
                    body: None,
                    location: loc.clone(),
                }),
            );
            return Some(Expr::HandlerRef(HandlerRefExpr {
                symbol: id,
                name,
                location: loc,
            }));
        }

        match self.unit.symbol(symbols[0]).clone() {
            Symbol::Variable(var) => Some(Expr::Variable(VariableExpr {
                symbol: symbols[0],
                name,
                ty: var.ty,
                location: loc,
            })),
            Symbol::Handler(_) => Some(Expr::HandlerRef(HandlerRefExpr {
                symbol: symbols[0],
                name,
                location: loc,
            })),
            Symbol::BuiltinFunction(_) => {
                let callables: Vec<usize> = symbols
                    .iter()
                    .filter_map(|id| match self.unit.symbol(*id) {
                        Symbol::BuiltinFunction(b) => Some(b.callback),
                        _ => None,
                    })
                    .collect();

                let mut params = ParamList::default();
                if self.token().same_kind(&Token::RndOpen) {
                    self.next_token();
                    if !self.token().same_kind(&Token::RndClose) {
                        params = self.param_list()?;
                    }
                    loc.end = self.last_location().end;
                    if !self.consume(&Token::RndClose) {
                        return None;
                    }
                } else if self.starts_param_list() {
                    params = self.param_list()?;
                    loc.update(self.end());
                }

                self.resolve_call(&name, callables, params, loc)
                    .map(Expr::Call)
            }
            _ => {
                let errloc = self.last_location();
                self.report.borrow_mut().type_error(
                    errloc,
                    format!("Unsupported symbol type of \"{}\" in expression.", name),
                );
                None
            }
        }
    }

    fn starts_param_list(&self) -> bool {
        let token = self.token();
        token.is_unary_op()
            || token.is_literal()
            || matches!(
                token,
                Token::Ident(_) | Token::BrOpen | Token::RndOpen | Token::InterpolatedStringFragment(_)
            )
    }

    /// `{ ... }` in expression position: an anonymous handler reference.
    fn lambda_expr(&mut self) -> Option<Expr> {
        self.lambda_count += 1;
        let name = format!("__lambda_{}", self.lambda_count);
        let mut loc = self.location();

        let scope = self.enter_scope(name.clone());
        let body = self.compound_stmt();
        self.leave_scope();

        let body = body?;
        loc.update(self.end());

        let id = self.unit.add_symbol(
            self.current_scope(),
            Symbol::Handler(HandlerSym {
                name: name.clone(),
                scope: Some(scope),
                body: Some(body),
                location: loc.clone(),
            }),
        );

        Some(Expr::HandlerRef(HandlerRefExpr {
            symbol: id,
            name,
            location: loc,
        }))
    }

    fn array_expr(&mut self) -> Option<Expr> {
        let mut loc = self.location();
        self.next_token(); // '['

        let mut elements = Vec::new();
        if !self.token().same_kind(&Token::BrClose) {
            elements.push(self.expr()?);
            while self.consume_if(&Token::Comma) {
                elements.push(self.expr()?);
            }
        }
        self.consume(&Token::BrClose);
        loc.update(self.end());

        if elements.is_empty() {
            let errloc = self.last_location();
            self.report.borrow_mut().type_error(
                errloc,
                "Empty arrays are not allowed. Cannot infer element type.",
            );
            return None;
        }

        let base = elements[0].ty();
        for element in &elements {
            if element.ty() != base {
                let errloc = self.last_location();
                self.report
                    .borrow_mut()
                    .type_error(errloc, "Mixed element types in array not allowed.");
                return None;
            }
        }

        let ty = match base.array_of() {
            Some(ty) => ty,
            None => {
                let errloc = self.last_location();
                self.report.borrow_mut().type_error(
                    errloc,
                    format!(
                        "Invalid array expression. Element type {} is not allowed.",
                        base
                    ),
                );
                return None;
            }
        };

        Some(Expr::Array(ArrayExpr {
            elements,
            ty,
            location: loc,
        }))
    }

    fn literal_expr(&mut self) -> Option<Expr> {
        let mut loc = self.location();

        match self.token().clone() {
            Token::Div => {
                // /REGEX/
                if self.lexer.continue_parse_regex('/') {
                    let pattern = match self.token() {
                        Token::RegExp(p) => p.clone(),
                        _ => unreachable!("continue_parse_regex sets a RegExp token"),
                    };
                    loc.update(self.end());
                    self.next_token();
                    self.regexp_literal(&pattern, loc)
                } else {
                    let errloc = self.last_location();
                    self.report
                        .borrow_mut()
                        .syntax_error(errloc, "Error parsing regular expression.");
                    None
                }
            }
            Token::Number(value) => {
                // NUMBER [UNIT]
                self.next_token();
                let mut value = value;
                if let Token::Ident(suffix) = self.token().clone() {
                    let singular = suffix.strip_suffix('s').unwrap_or(&suffix);
                    if let Some((_, nom, denom)) =
                        UNITS.iter().find(|(unit, _, _)| *unit == singular)
                    {
                        value = value * nom / denom;
                        loc.update(self.end());
                        self.next_token();
                    }
                }
                Some(Expr::Literal(LiteralExpr {
                    value: LiteralValue::Number(value),
                    location: loc,
                }))
            }
            Token::Boolean(value) => {
                self.next_token();
                Some(Expr::Literal(LiteralExpr {
                    value: LiteralValue::Boolean(value),
                    location: loc,
                }))
            }
            Token::String(value) | Token::RawString(value) => {
                self.next_token();
                Some(Expr::Literal(LiteralExpr {
                    value: LiteralValue::String(value),
                    location: loc,
                }))
            }
            Token::IP(addr) => {
                self.next_token();
                Some(Expr::Literal(LiteralExpr {
                    value: LiteralValue::IP(addr),
                    location: loc,
                }))
            }
            Token::Cidr(cidr) => {
                self.next_token();
                Some(Expr::Literal(LiteralExpr {
                    value: LiteralValue::Cidr(cidr),
                    location: loc,
                }))
            }
            Token::RegExp(pattern) => {
                self.next_token();
                self.regexp_literal(&pattern, loc)
            }
            other => {
                let errloc = self.last_location();
                self.report.borrow_mut().type_error(
                    errloc,
                    format!("Expected literal expression, but got {}.", other),
                );
                None
            }
        }
    }

    fn regexp_literal(&mut self, pattern: &str, location: SourceLocation) -> Option<Expr> {
        match RegExp::new(pattern) {
            Ok(re) => Some(Expr::Literal(LiteralExpr {
                value: LiteralValue::RegExp(re),
                location,
            })),
            Err(e) => {
                let errloc = self.last_location();
                self.report
                    .borrow_mut()
                    .syntax_error(errloc, format!("Error parsing regular expression: {}", e));
                None
            }
        }
    }

    fn regexp_group(&mut self) -> Option<Expr> {
        let mut loc = self.location();
        let group = match self.token() {
            Token::RegExpGroup(n) => *n,
            _ => unreachable!(),
        };
        self.next_token();
        loc.update(self.end());
        Some(Expr::RegExpGroup(RegExpGroupExpr {
            group,
            location: loc,
        }))
    }

    // paramList ::= namedExpr *(',' namedExpr) | expr *(',' expr)
    fn param_list(&mut self) -> Option<ParamList> {
        let mut args = ParamList::default();

        if self.token().same_kind(&Token::NamedParam(String::new())) {
            loop {
                let name = match self.token() {
                    Token::NamedParam(name) => name.clone(),
                    _ => {
                        self.expect(&Token::NamedParam(String::new()));
                        return None;
                    }
                };
                self.next_token();
                let value = self.expr()?;
                args.push(Some(name), value);

                if !self.token().same_kind(&Token::Comma) {
                    break;
                }
                self.next_token();
                if self.token().same_kind(&Token::RndClose) {
                    break;
                }
            }
        } else {
            loop {
                let value = self.expr()?;
                args.push(None, value);

                if !self.token().same_kind(&Token::Comma) {
                    break;
                }
                self.next_token();
                if self.token().same_kind(&Token::RndClose) {
                    break;
                }
            }
        }

        Some(args)
    }

    fn as_string(&mut self, expr: Expr) -> Option<Expr> {
        if expr.ty() == LiteralType::String {
            return Some(expr);
        }
        match make_cast_operator(&Token::StringType, expr.ty()) {
            Some(Opcode::Nop) => Some(expr),
            Some(op) => {
                let loc = expr.location().clone();
                Some(Expr::Unary(UnaryExpr {
                    op,
                    expr: Box::new(expr),
                    location: loc,
                }))
            }
            None => None,
        }
    }

    /// `"pre#{expr}post"` becomes a left-leaning SADD chain with
    /// implicit to-string casts on the interpolated pieces.
    fn interpolated_str(&mut self) -> Option<Expr> {
        let mut loc = self.location();
        let fragment = match self.token() {
            Token::InterpolatedStringFragment(s) => s.clone(),
            _ => unreachable!(),
        };
        let mut result = Expr::Literal(LiteralExpr {
            value: LiteralValue::String(fragment),
            location: loc.update(self.end()),
        });
        self.next_token();

        let e = self.expr()?;
        let e = match self.as_string(e) {
            Some(e) => e,
            None => {
                let errloc = self.last_location();
                self.report
                    .borrow_mut()
                    .type_error(errloc, "Cast error in string interpolation.");
                return None;
            }
        };
        result = Expr::Binary(BinaryExpr {
            op: Opcode::SAdd,
            lhs: Box::new(result),
            rhs: Box::new(e),
            location: loc.update(self.end()),
        });

        while let Token::InterpolatedStringFragment(fragment) = self.token().clone() {
            result = Expr::Binary(BinaryExpr {
                op: Opcode::SAdd,
                lhs: Box::new(result),
                rhs: Box::new(Expr::Literal(LiteralExpr {
                    value: LiteralValue::String(fragment),
                    location: loc.update(self.end()),
                })),
                location: loc.update(self.end()),
            });
            self.next_token();

            let e = self.expr()?;
            let e = match self.as_string(e) {
                Some(e) => e,
                None => {
                    let errloc = self.last_location();
                    self.report
                        .borrow_mut()
                        .type_error(errloc, "Cast error in string interpolation.");
                    return None;
                }
            };
            result = Expr::Binary(BinaryExpr {
                op: Opcode::SAdd,
                lhs: Box::new(result),
                rhs: Box::new(e),
                location: loc.update(self.end()),
            });
        }

        if !self.expect(&Token::InterpolatedStringEnd(String::new())) {
            return None;
        }
        if let Token::InterpolatedStringEnd(tail) = self.token().clone() {
            if !tail.is_empty() {
                result = Expr::Binary(BinaryExpr {
                    op: Opcode::SAdd,
                    lhs: Box::new(result),
                    rhs: Box::new(Expr::Literal(LiteralExpr {
                        value: LiteralValue::String(tail),
                        location: loc.update(self.end()),
                    })),
                    location: loc.update(self.end()),
                });
            }
        }
        self.next_token(); // skip InterpolatedStringEnd

        Some(result)
    }

    // castExpr ::= ('int' | 'string' | 'bool') '(' expr ')'
    fn cast_expr(&mut self) -> Option<Expr> {
        let mut loc = self.location();
        let target = self.token().clone();
        self.next_token();

        if !self.consume(&Token::RndOpen) {
            return None;
        }
        let e = self.expr();
        if !self.consume(&Token::RndClose) {
            return None;
        }
        let e = e?;

        match make_cast_operator(&target, e.ty()) {
            Some(Opcode::Nop) => Some(e),
            Some(op) => {
                loc.update(self.end());
                Some(Expr::Unary(UnaryExpr {
                    op,
                    expr: Box::new(e),
                    location: loc,
                }))
            }
            None => {
                let errloc = self.last_location();
                self.report.borrow_mut().type_error(
                    errloc,
                    format!(
                        "Type cast error. No cast implementation found for requested cast from {} to {}.",
                        e.ty(),
                        target
                    ),
                );
                None
            }
        }
    }

    // }}}
    // {{{ call resolution

    /// Exact match first, then a tolerant pass that fills defaults and
    /// reorders named arguments. Exactly one surviving candidate wins.
    fn resolve_call(
        &mut self,
        name: &str,
        callables: Vec<usize>,
        params: ParamList,
        location: SourceLocation,
    ) -> Option<CallExpr> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => {
                let errloc = self.last_location();
                self.report
                    .borrow_mut()
                    .type_error(errloc, "No runtime to resolve builtins against.");
                return None;
            }
        };

        let input_signature = Signature::new(
            name,
            params.values.iter().map(|v| v.ty()).collect(),
        );

        // full match first
        if !params.is_named() {
            for callback in &callables {
                let native = runtime.callback(*callback);
                let types: Vec<LiteralType> =
                    native.params().iter().map(|p| p.ty).collect();
                let given: Vec<LiteralType> = params.values.iter().map(|v| v.ty()).collect();
                if types == given {
                    return Some(self.make_call(*callback, name, params, location));
                }
            }
        }

        // tolerant match: defaults and (for named args) reordering
        let mut matches = Vec::new();
        let mut match_errors = Vec::new();
        for callback in &callables {
            match try_match(runtime, *callback, &params) {
                Ok(args) => matches.push((*callback, args)),
                Err(msg) => match_errors.push(msg),
            }
        }

        if matches.is_empty() {
            let errloc = self.last_location();
            let mut report = self.report.borrow_mut();
            report.type_error(
                errloc.clone(),
                format!("No matching signature for {}.", input_signature),
            );
            for msg in match_errors {
                report.type_error(errloc.clone(), msg);
            }
            return None;
        }

        if matches.len() > 1 {
            let errloc = self.last_location();
            self.report
                .borrow_mut()
                .type_error(errloc, "Call to builtin is ambiguous.");
            return None;
        }

        let (callback, values) = matches.into_iter().next().unwrap();
        let args = ParamList {
            names: Vec::new(),
            values,
        };
        Some(self.make_call(callback, name, args, location))
    }

    fn make_call(
        &mut self,
        callback: usize,
        name: &str,
        args: ParamList,
        location: SourceLocation,
    ) -> CallExpr {
        let native = self.runtime.unwrap().callback(callback);
        let is_handler = native.is_handler();

        if native.is_experimental() {
            let loc = self.last_location();
            self.report.borrow_mut().warning(
                loc,
                format!("Using experimental builtin API {}.", native.signature()),
            );
        }

        CallExpr {
            callee: if is_handler {
                Callee::BuiltinHandler(callback)
            } else {
                Callee::BuiltinFunction(callback)
            },
            name: name.to_string(),
            ret: native.return_type(),
            args,
            location,
        }
    }

    // }}}
    // {{{ statements

    fn stmt(&mut self) -> Option<Stmt> {
        match self.token().clone() {
            Token::If => self.if_stmt(),
            Token::While => self.while_stmt(),
            Token::Match => self.match_stmt(),
            Token::Begin => self.compound_stmt(),
            Token::Ident(name) => self.ident_stmt(name),
            Token::Semicolon => {
                let mut loc = self.location();
                self.next_token();
                loc.update(self.end());
                Some(Stmt::Compound(CompoundStmt {
                    stmts: Vec::new(),
                    location: loc,
                }))
            }
            other => {
                let loc = self.last_location();
                self.report.borrow_mut().syntax_error(
                    loc,
                    format!("Unexpected token {}. Expected a statement instead.", other),
                );
                None
            }
        }
    }

    /// Applies the only implicit condition coercion: a string condition
    /// becomes `length(s) != 0`.
    fn boolean_condition(&mut self, cond: Expr, loc: &SourceLocation) -> Option<Expr> {
        match cond.ty() {
            LiteralType::Boolean => Some(cond),
            LiteralType::String => {
                let len = Expr::Unary(UnaryExpr {
                    op: Opcode::SLen,
                    expr: Box::new(cond),
                    location: loc.clone(),
                });
                Some(Expr::Binary(BinaryExpr {
                    op: Opcode::NCmpNe,
                    lhs: Box::new(len),
                    rhs: Box::new(Expr::Literal(LiteralExpr {
                        value: LiteralValue::Number(0),
                        location: loc.clone(),
                    })),
                    location: loc.clone(),
                }))
            }
            other => {
                let errloc = self.last_location();
                self.report.borrow_mut().type_error(
                    errloc,
                    format!(
                        "If expression must be boolean type. Received type {} instead.",
                        other
                    ),
                );
                None
            }
        }
    }

    // ifStmt ::= 'if' expr ['then'] stmt ['else' stmt]
    fn if_stmt(&mut self) -> Option<Stmt> {
        let mut loc = self.location();

        self.consume(&Token::If);
        let cond = self.expr()?;
        self.consume_if(&Token::Then);

        let cond = self.boolean_condition(cond, &loc.clone())?;

        let then_stmt = self.stmt()?;
        let else_stmt = if self.consume_if(&Token::Else) {
            Some(Box::new(self.stmt()?))
        } else {
            None
        };

        loc.update(self.end());
        Some(Stmt::Cond(CondStmt {
            condition: cond,
            then_stmt: Box::new(then_stmt),
            else_stmt,
            location: loc,
        }))
    }

    // whileStmt ::= 'while' expr stmt
    fn while_stmt(&mut self) -> Option<Stmt> {
        let mut loc = self.location();

        self.consume(&Token::While);
        let cond = self.expr()?;
        let cond = self.boolean_condition(cond, &loc.clone())?;
        let body = self.stmt()?;

        if !self.has_feature(Feature::WhileLoop) {
            self.report
                .borrow_mut()
                .syntax_error(loc.clone(), "While-loop feature not enabled.");
        }

        loc.update(self.end());
        Some(Stmt::While(WhileStmt {
            condition: cond,
            body: Box::new(body),
            location: loc,
        }))
    }

    // matchStmt ::= 'match' expr [MATCH_OP] '{' *matchCase ['else' stmt] '}'
    // matchCase ::= 'on' literalExpr *(',' 'on' literalExpr) stmt
    fn match_stmt(&mut self) -> Option<Stmt> {
        let mut loc = self.location();

        if !self.consume(&Token::Match) {
            return None;
        }

        let cond = self.add_expr()?;
        let mut match_type = cond.ty();

        if match_type != LiteralType::String {
            let errloc = self.last_location();
            self.report.borrow_mut().type_error(
                errloc,
                format!(
                    "Expected match condition type <{}>, found <{}> instead.",
                    LiteralType::String,
                    match_type
                ),
            );
            return None;
        }

        let op = if self.token().is_operator() {
            let op = match self.token() {
                Token::Equal => MatchClass::Same,
                Token::PrefixMatch => MatchClass::Head,
                Token::SuffixMatch => MatchClass::Tail,
                Token::RegexMatch => MatchClass::RegExp,
                other => {
                    let errloc = self.last_location();
                    self.report.borrow_mut().type_error(
                        errloc,
                        format!("Expected match operator, found token <{}> instead.", other),
                    );
                    return None;
                }
            };
            self.next_token();
            op
        } else {
            MatchClass::Same
        };

        if op == MatchClass::RegExp {
            match_type = LiteralType::RegExp;
        }

        if !self.consume(&Token::Begin) {
            return None;
        }

        let mut cases = Vec::new();
        loop {
            if !self.consume(&Token::On) {
                return None;
            }

            let mut labels = vec![self.literal_expr()?];
            while self.consume_if(&Token::Comma) {
                if !self.consume(&Token::On) {
                    return None;
                }
                labels.push(self.literal_expr()?);
            }

            for label in &labels {
                if label.ty() != match_type {
                    let errloc = self.last_location();
                    self.report.borrow_mut().type_error(
                        errloc,
                        format!(
                            "Type mismatch in match-on statement. Expected <{}> but got <{}>.",
                            match_type,
                            label.ty()
                        ),
                    );
                    return None;
                }
            }

            let body = self.stmt()?;
            cases.push(MatchCase { labels, body });

            if !self.token().same_kind(&Token::On) {
                break;
            }
        }

        let else_stmt = if self.consume_if(&Token::Else) {
            Some(Box::new(self.stmt()?))
        } else {
            None
        };

        if !self.consume(&Token::End) {
            return None;
        }

        loc.update(self.end());
        Some(Stmt::Match(MatchStmt {
            condition: cond,
            op,
            cases,
            else_stmt,
            location: loc,
        }))
    }

    // compoundStmt ::= '{' varDecl* stmt* '}'
    fn compound_stmt(&mut self) -> Option<Stmt> {
        let mut loc = self.location();
        self.next_token(); // '{'

        while self.token().same_kind(&Token::Var) {
            match self.var_decl(false) {
                Some(var) => {
                    let scope = self.current_scope();
                    self.unit.add_symbol(scope, Symbol::Variable(var));
                }
                None => self.recover(),
            }
        }

        let mut stmts = Vec::new();
        loop {
            if self.consume_if(&Token::End) {
                loc.update(self.end());
                return Some(Stmt::Compound(CompoundStmt {
                    stmts,
                    location: loc,
                }));
            }
            if *self.token() == Token::Eof {
                let errloc = self.last_location();
                self.report
                    .borrow_mut()
                    .syntax_error(errloc, "Unexpected end of input in compound statement.");
                return None;
            }

            match self.stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.recover(),
            }
        }
    }

    // identStmt ::= NAME (assignTail | callTail) postscript?
    fn ident_stmt(&mut self, name: String) -> Option<Stmt> {
        let loc = self.location();
        self.next_token(); // IDENT

        let mut symbols = self.unit.lookup(self.current_scope(), &name, Lookup::All);
        if symbols.is_empty() {
            // assume a forward-declared handler implemented later on
            if !self.token().same_kind(&Token::Semicolon)
                && !self.token().same_kind(&Token::If)
                && !self.token().same_kind(&Token::Unless)
            {
                let errloc = self.last_location();
                self.report
                    .borrow_mut()
                    .type_error(errloc, format!("Unknown symbol '{}'.", name));
                return None;
            }
            let id = self.unit.add_symbol(
                GLOBAL_SCOPE,
                Symbol::Handler(HandlerSym {
                    name: name.clone(),
                    scope: None,
                    body: None,
                    location: loc.clone(),
                }),
            );
            symbols = vec![id];
        }

        let stmt = match self.unit.symbol(symbols[0]).clone() {
            Symbol::Variable(var) => {
                // var '=' expr ';'
                if !self.consume(&Token::Assign) {
                    return None;
                }
                let value = self.expr()?;
                if var.ty != value.ty() {
                    let errloc = self.last_location();
                    self.report.borrow_mut().type_error(
                        errloc,
                        format!(
                            "Type mismatch in assignment. Expected <{}> but got <{}>.",
                            var.ty,
                            value.ty()
                        ),
                    );
                    return None;
                }
                let mut loc = loc;
                loc.update(self.end());
                Stmt::Assign(AssignStmt {
                    variable: symbols[0],
                    name,
                    expr: value,
                    location: loc,
                })
            }
            Symbol::BuiltinFunction(_) | Symbol::BuiltinHandler(_) => {
                let call = self.call_stmt(&name, &symbols)?;
                Stmt::Expr(ExprStmt {
                    expr: Expr::Call(call),
                })
            }
            Symbol::Handler(_) => Stmt::Expr(ExprStmt {
                expr: Expr::Call(CallExpr {
                    callee: Callee::Handler(symbols[0]),
                    name,
                    ret: LiteralType::Boolean,
                    args: ParamList::default(),
                    location: loc,
                }),
            }),
        };

        if self.token().same_kind(&Token::If) || self.token().same_kind(&Token::Unless) {
            return self.postscript_stmt(stmt);
        }

        if !self.consume(&Token::Semicolon) {
            return None;
        }

        Some(stmt)
    }

    // callStmt ::= NAME ['(' paramList ')' | paramList] ';'
    fn call_stmt(&mut self, name: &str, symbols: &[SymbolId]) -> Option<CallExpr> {
        let mut callables = Vec::new();
        for id in symbols {
            match self.unit.symbol(*id) {
                Symbol::BuiltinFunction(b) | Symbol::BuiltinHandler(b) => {
                    callables.push(b.callback)
                }
                _ => {}
            }
        }

        if callables.is_empty() {
            let errloc = self.last_location();
            self.report
                .borrow_mut()
                .type_error(errloc, "Symbol is not callable.");
            return None;
        }

        let mut loc = self.location();
        let mut params = ParamList::default();

        if self.token().same_kind(&Token::RndOpen) {
            self.next_token();
            if !self.token().same_kind(&Token::RndClose) {
                params = self.param_list()?;
            }
            loc.end = self.last_location().end;
            if !self.consume(&Token::RndClose) {
                return None;
            }
        } else if !self.token().same_kind(&Token::Semicolon)
            && !self.token().same_kind(&Token::If)
            && !self.token().same_kind(&Token::Unless)
        {
            params = self.param_list()?;
            loc.update(self.end());
        }

        self.resolve_call(name, callables, params, loc)
    }

    // STMT ('if' | 'unless') EXPR ';'
    fn postscript_stmt(&mut self, base: Stmt) -> Option<Stmt> {
        let negate = self.token().same_kind(&Token::Unless);
        let mut loc = self.location();
        self.next_token(); // 'if' | 'unless'

        let cond = self.expr()?;

        let cond = if negate {
            match make_cast_operator(&Token::Not, cond.ty()) {
                Some(op) => Expr::Unary(UnaryExpr {
                    op,
                    expr: Box::new(cond),
                    location: loc.clone(),
                }),
                None => {
                    let errloc = self.last_location();
                    self.report.borrow_mut().type_error(
                        errloc,
                        format!(
                            "Type cast error. No cast implementation found for requested cast from {} to {}.",
                            cond.ty(),
                            LiteralType::Boolean
                        ),
                    );
                    return None;
                }
            }
        } else {
            self.boolean_condition(cond, &loc.clone())?
        };

        if !self.consume(&Token::Semicolon) {
            return None;
        }

        loc.update(self.end());
        Some(Stmt::Cond(CondStmt {
            condition: cond,
            then_stmt: Box::new(base),
            else_stmt: None,
            location: loc,
        }))
    }

    // }}}
}

/// Tolerant signature match: positional calls may omit defaulted
/// trailing parameters; named calls may reorder freely. Returns the
/// final positional argument list with defaults materialized.
fn try_match(
    runtime: &Runtime,
    callback: usize,
    params: &ParamList,
) -> std::result::Result<Vec<Expr>, String> {
    let native = runtime.callback(callback);
    let signature = native.signature();

    if params.is_named() {
        let mut slots: Vec<Option<Expr>> = vec![None; native.params().len()];
        for (name, value) in params.names.iter().zip(params.values.iter()) {
            let index = native
                .params()
                .iter()
                .position(|p| p.name == *name)
                .ok_or_else(|| format!("{}: no such parameter '{}'", signature, name))?;
            if slots[index].is_some() {
                return Err(format!("{}: duplicate parameter '{}'", signature, name));
            }
            if native.params()[index].ty != value.ty() {
                return Err(format!(
                    "{}: type mismatch in parameter '{}'",
                    signature, name
                ));
            }
            slots[index] = Some(value.clone());
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                Some(expr) => Ok(expr),
                None => default_expr(native.params()[index].default.as_ref()).ok_or_else(|| {
                    format!(
                        "{}: missing parameter '{}'",
                        signature,
                        native.params()[index].name
                    )
                }),
            })
            .collect()
    } else {
        if params.len() > native.params().len() {
            return Err(format!("{}: too many arguments", signature));
        }
        for (index, value) in params.values.iter().enumerate() {
            if native.params()[index].ty != value.ty() {
                return Err(format!(
                    "{}: type mismatch in parameter {}",
                    signature,
                    index + 1
                ));
            }
        }
        let mut values = params.values.clone();
        for param in &native.params()[params.len()..] {
            match default_expr(param.default.as_ref()) {
                Some(expr) => values.push(expr),
                None => {
                    return Err(format!(
                        "{}: missing parameter '{}'",
                        signature, param.name
                    ))
                }
            }
        }
        Ok(values)
    }
}

/// A default value becomes a synthetic literal at the call site.
fn default_expr(default: Option<&Value>) -> Option<Expr> {
    let value = match default? {
        Value::Boolean(b) => LiteralValue::Boolean(*b),
        Value::Number(n) => LiteralValue::Number(*n),
        Value::String(s) => LiteralValue::String(s.clone()),
        Value::IP(ip) => LiteralValue::IP(*ip),
        Value::Cidr(cidr) => LiteralValue::Cidr(*cidr),
        Value::RegExp(re) => LiteralValue::RegExp(re.clone()),
        _ => return None,
    };
    Some(Expr::Literal(LiteralExpr {
        value,
        location: SourceLocation::default(),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::diagnostics::{shared, MessageType, Report};

    fn test_runtime() -> Runtime {
        let mut runtime = Runtime::new();
        runtime
            .register_function("sum", LiteralType::Number)
            .param("x", LiteralType::Number)
            .param("y", LiteralType::Number);
        runtime
            .register_function("assert", LiteralType::Number)
            .param("condition", LiteralType::Boolean)
            .param_with_default("description", LiteralType::String, "");
        runtime
            .register_function("print", LiteralType::Void)
            .param("text", LiteralType::String);
        runtime
            .register_function("tag", LiteralType::Void)
            .param("name", LiteralType::String)
            .param_with_default("weight", LiteralType::Number, 1i64);
        runtime.register_handler("stop");
        runtime
            .register_function("probe", LiteralType::Number)
            .experimental();
        runtime
            .register_function("over", LiteralType::Void)
            .param("x", LiteralType::Number);
        runtime
            .register_function("over", LiteralType::Void)
            .param("x", LiteralType::String);
        runtime
            .register_function("twice", LiteralType::Void)
            .param_with_default("a", LiteralType::Number, 1i64)
            .param_with_default("b", LiteralType::Number, 2i64);
        runtime
            .register_function("thrice", LiteralType::Void)
            .param_with_default("a", LiteralType::Number, 1i64);
        runtime
            .register_function("thrice", LiteralType::Void)
            .param_with_default("b", LiteralType::String, "x");
        runtime
    }

    fn parse_with(runtime: &Runtime, source: &str) -> (UnitSym, SharedReport) {
        let report = shared(Report::buffered());
        let mut parser = Parser::new(
            vec![Feature::GlobalScope, Feature::WhileLoop],
            report.clone(),
            Some(runtime),
        );
        parser.open_string(source);
        (parser.parse(), report)
    }

    fn first_handler(unit: &UnitSym, name: &str) -> HandlerSym {
        for id in unit.scope_symbols(GLOBAL_SCOPE) {
            if let Symbol::Handler(h) = unit.symbol(*id) {
                if h.name == name {
                    return h.clone();
                }
            }
        }
        panic!("no handler {}", name);
    }

    fn failures(report: &SharedReport) -> Vec<String> {
        report
            .borrow()
            .messages()
            .iter()
            .filter(|m| m.ty != MessageType::Warning)
            .map(|m| m.text.clone())
            .collect()
    }

    #[test]
    fn minimal_handler() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(&runtime, "handler main {}");
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));
        let main = first_handler(&unit, "main");
        assert!(main.body.is_some());
    }

    #[test]
    fn arithmetic_types_and_opcodes() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(&runtime, "handler main { var i = 2 + 3 * 4; }");
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));

        let main = first_handler(&unit, "main");
        let scope = main.scope.unwrap();
        let var_id = unit.scope_symbols(scope)[0];
        let var = match unit.symbol(var_id) {
            Symbol::Variable(v) => v.clone(),
            other => panic!("expected variable, got {:?}", other),
        };
        assert_eq!(var.ty, LiteralType::Number);
        match &var.initializer {
            Expr::Binary(b) => {
                assert_eq!(b.op, Opcode::NAdd);
                match b.rhs.as_ref() {
                    Expr::Binary(inner) => assert_eq!(inner.op, Opcode::NMul),
                    other => panic!("expected NMUL on the right, got {:?}", other),
                }
            }
            other => panic!("expected binary initializer, got {:?}", other),
        }
    }

    #[test]
    fn unit_suffix_multiplies_literal() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(&runtime, "handler main { var t = 2 mins; var s = 4 kbyte; }");
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));

        let main = first_handler(&unit, "main");
        let scope = main.scope.unwrap();
        let values: Vec<i64> = unit
            .scope_symbols(scope)
            .iter()
            .map(|id| match unit.symbol(*id) {
                Symbol::Variable(v) => match &v.initializer {
                    Expr::Literal(LiteralExpr {
                        value: LiteralValue::Number(n),
                        ..
                    }) => *n,
                    other => panic!("expected number literal, got {:?}", other),
                },
                other => panic!("expected variable, got {:?}", other),
            })
            .collect();
        assert_eq!(values, vec![120, 4096]);
    }

    #[test]
    fn incompatible_operands_is_type_error() {
        let runtime = test_runtime();
        let (_, report) = parse_with(&runtime, "handler main { var x = 1 + \"s\"; }");
        assert!(failures(&report)
            .iter()
            .any(|m| m.contains("Incompatible binary expression")));
    }

    #[test]
    fn cidr_cidr_comparison_unsupported() {
        let runtime = test_runtime();
        let (_, report) = parse_with(
            &runtime,
            "handler main { var x = 10.0.0.0/8 == 10.0.0.0/8; }",
        );
        assert!(!failures(&report).is_empty());
    }

    #[test]
    fn string_condition_is_rewritten_to_length_check() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(&runtime, "handler main { if \"x\" then stop; }");
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));

        let main = first_handler(&unit, "main");
        let body = main.body.unwrap();
        let stmts = match body {
            Stmt::Compound(c) => c.stmts,
            other => panic!("expected compound, got {:?}", other),
        };
        match &stmts[0] {
            Stmt::Cond(c) => match &c.condition {
                Expr::Binary(b) => {
                    assert_eq!(b.op, Opcode::NCmpNe);
                    match b.lhs.as_ref() {
                        Expr::Unary(u) => assert_eq!(u.op, Opcode::SLen),
                        other => panic!("expected SLEN, got {:?}", other),
                    }
                }
                other => panic!("expected rewritten condition, got {:?}", other),
            },
            other => panic!("expected cond stmt, got {:?}", other),
        }
    }

    #[test]
    fn while_needs_feature_flag() {
        let runtime = test_runtime();
        let report = shared(Report::buffered());
        let mut parser = Parser::new(vec![Feature::GlobalScope], report.clone(), Some(&runtime));
        parser.open_string("handler main { while true { } }");
        parser.parse();
        assert!(report
            .borrow()
            .messages()
            .iter()
            .any(|m| m.text.contains("While-loop feature not enabled")));
    }

    #[test]
    fn global_scope_needs_feature_flag() {
        let runtime = test_runtime();
        let report = shared(Report::buffered());
        let mut parser = Parser::new(vec![Feature::WhileLoop], report.clone(), Some(&runtime));
        parser.open_string("var x = 1;\nhandler main { }");
        parser.parse();
        assert!(report
            .borrow()
            .messages()
            .iter()
            .any(|m| m.text.contains("Global-scope feature not enabled")));
    }

    #[test]
    fn match_requires_string_condition() {
        let runtime = test_runtime();
        let (_, report) = parse_with(&runtime, "handler main { match 42 { on \"a\" stop; } }");
        assert!(failures(&report)
            .iter()
            .any(|m| m.contains("match condition")));
    }

    #[test]
    fn match_case_label_type_must_agree() {
        let runtime = test_runtime();
        let (_, report) = parse_with(
            &runtime,
            "handler main { match \"x\" =~ { on \"notregex\" stop; } }",
        );
        assert!(failures(&report)
            .iter()
            .any(|m| m.contains("Type mismatch in match-on")));
    }

    #[test]
    fn match_regex_labels_parse() {
        let runtime = test_runtime();
        let (_, report) = parse_with(
            &runtime,
            "handler main { match \"x\" =~ { on /^x$/ stop; else stop; } }",
        );
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));
    }

    #[test]
    fn empty_array_is_rejected() {
        let runtime = test_runtime();
        let (_, report) = parse_with(&runtime, "handler main { var a = []; }");
        assert!(failures(&report)
            .iter()
            .any(|m| m.contains("Cannot infer element type")));
    }

    #[test]
    fn mixed_array_is_rejected() {
        let runtime = test_runtime();
        let (_, report) = parse_with(&runtime, "handler main { var a = [1, \"two\"]; }");
        assert!(failures(&report)
            .iter()
            .any(|m| m.contains("Mixed element types")));
    }

    #[test]
    fn call_with_default_argument() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(&runtime, "handler main { assert(true); }");
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));

        let main = first_handler(&unit, "main");
        let stmts = match main.body.unwrap() {
            Stmt::Compound(c) => c.stmts,
            other => panic!("unexpected {:?}", other),
        };
        match &stmts[0] {
            Stmt::Expr(ExprStmt {
                expr: Expr::Call(call),
            }) => {
                // the defaulted description argument is materialized
                assert_eq!(call.args.len(), 2);
                assert_eq!(call.args.values[1].ty(), LiteralType::String);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn named_arguments_are_reordered() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(
            &runtime,
            "handler main { tag(weight: 7, name: \"n\"); }",
        );
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));

        let main = first_handler(&unit, "main");
        let stmts = match main.body.unwrap() {
            Stmt::Compound(c) => c.stmts,
            other => panic!("unexpected {:?}", other),
        };
        match &stmts[0] {
            Stmt::Expr(ExprStmt {
                expr: Expr::Call(call),
            }) => {
                assert_eq!(call.args.values[0].ty(), LiteralType::String);
                assert_eq!(call.args.values[1].ty(), LiteralType::Number);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn no_matching_signature_is_reported() {
        let runtime = test_runtime();
        let (_, report) = parse_with(&runtime, "handler main { sum(1, \"x\"); }");
        assert!(failures(&report)
            .iter()
            .any(|m| m.contains("No matching signature")));
    }

    #[test]
    fn ambiguous_call_is_reported() {
        let runtime = test_runtime();
        let (_, report) = parse_with(&runtime, "handler main { thrice(); }");
        assert!(failures(&report)
            .iter()
            .any(|m| m.contains("ambiguous")));
    }

    #[test]
    fn overload_picks_exact_match() {
        let runtime = test_runtime();
        let (_, report) = parse_with(&runtime, "handler main { over(1); over(\"s\"); }");
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));
    }

    #[test]
    fn experimental_builtin_warns() {
        let runtime = test_runtime();
        let (_, report) = parse_with(&runtime, "handler main { var x = probe(); }");
        assert!(report
            .borrow()
            .messages()
            .iter()
            .any(|m| m.ty == MessageType::Warning && m.text.contains("experimental")));
    }

    #[test]
    fn forward_declared_handler_binds_later() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(
            &runtime,
            "handler main { helper; }\nhandler helper { stop; }",
        );
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));
        let helper = first_handler(&unit, "helper");
        assert!(helper.body.is_some());
    }

    #[test]
    fn redeclaring_handler_is_type_error() {
        let runtime = test_runtime();
        let (_, report) = parse_with(&runtime, "handler main {}\nhandler main {}");
        assert!(failures(&report)
            .iter()
            .any(|m| m.contains("Redeclaring handler")));
    }

    #[test]
    fn postscript_unless_negates() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(&runtime, "handler main { stop unless 1 == 2; }");
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));

        let main = first_handler(&unit, "main");
        let stmts = match main.body.unwrap() {
            Stmt::Compound(c) => c.stmts,
            other => panic!("unexpected {:?}", other),
        };
        match &stmts[0] {
            Stmt::Cond(c) => match &c.condition {
                Expr::Unary(u) => assert_eq!(u.op, Opcode::BNot),
                other => panic!("expected negated condition, got {:?}", other),
            },
            other => panic!("expected cond stmt, got {:?}", other),
        }
    }

    #[test]
    fn interpolated_string_builds_sadd_chain() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(&runtime, "handler main { print \"sum=#{1 + 2}\"; }");
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));

        let main = first_handler(&unit, "main");
        let stmts = match main.body.unwrap() {
            Stmt::Compound(c) => c.stmts,
            other => panic!("unexpected {:?}", other),
        };
        match &stmts[0] {
            Stmt::Expr(ExprStmt {
                expr: Expr::Call(call),
            }) => match &call.args.values[0] {
                Expr::Binary(b) => {
                    assert_eq!(b.op, Opcode::SAdd);
                    // the interpolated number is cast to string
                    match b.rhs.as_ref() {
                        Expr::Unary(u) => assert_eq!(u.op, Opcode::N2S),
                        other => panic!("expected N2S cast, got {:?}", other),
                    }
                }
                other => panic!("expected SADD chain, got {:?}", other),
            },
            other => panic!("expected call stmt, got {:?}", other),
        }
    }

    #[test]
    fn error_recovery_reports_multiple_errors() {
        let runtime = test_runtime();
        let (_, report) = parse_with(
            &runtime,
            "handler main { var a = 1 + \"x\"; var b = [1, \"y\"]; }",
        );
        assert!(failures(&report).len() >= 2);
    }

    #[test]
    fn import_declarations_are_recorded() {
        let runtime = test_runtime();
        let (unit, report) = parse_with(&runtime, "import acl, log from 'mods';\nhandler main {}");
        assert!(failures(&report).is_empty(), "{:?}", failures(&report));
        assert_eq!(
            unit.imports,
            vec![
                ("acl".to_string(), "mods".to_string()),
                ("log".to_string(), "mods".to_string())
            ]
        );
    }
}
