use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

use crate::diagnostics::SharedReport;
use crate::lexer::token::Token;
use crate::location::{FilePos, SourceLocation};
use crate::types::FlowNumber;
use crate::util::cidr::Cidr;

/// One input frame: a file or string being lexed. `#include` pushes a
/// frame; EOF in a non-root frame pops it and resumes the outer one.
struct Scope {
    filename: String,
    chars: Vec<char>,
    read_pos: usize,
    curr_pos: FilePos,
    next_pos: FilePos,
    backup_char: Option<char>,
}

impl Scope {
    fn new(filename: String, content: &str, backup_char: Option<char>) -> Scope {
        Scope {
            filename,
            chars: content.chars().collect(),
            read_pos: 0,
            curr_pos: FilePos::new(1, 1, 0),
            next_pos: FilePos::new(1, 1, 0),
            backup_char,
        }
    }
}

pub struct Lexer {
    report: SharedReport,
    scopes: Vec<Scope>,
    current_char: Option<char>,
    token: Token,
    last_location: SourceLocation,
    location: SourceLocation,
    interpolation_depth: usize,
}

impl Lexer {
    pub fn new(report: SharedReport) -> Lexer {
        Lexer {
            report,
            scopes: Vec::new(),
            current_char: None,
            token: Token::Eof,
            last_location: SourceLocation::default(),
            location: SourceLocation::default(),
            interpolation_depth: 0,
        }
    }

    pub fn open_string(&mut self, content: &str) {
        self.enter_scope("<string>".to_string(), content);
        self.next_token();
    }

    pub fn open_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        self.enter_scope(path.display().to_string(), &content);
        self.next_token();
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn eof(&self) -> bool {
        self.current_char.is_none()
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    pub fn last_location(&self) -> &SourceLocation {
        &self.last_location
    }

    pub fn end(&self) -> FilePos {
        self.location.end
    }

    // {{{ character stream

    fn scope(&self) -> &Scope {
        self.scopes.last().expect("lexer has no open scope")
    }

    fn enter_scope(&mut self, filename: String, content: &str) {
        let scope = Scope::new(filename, content, self.current_char);
        self.scopes.push(scope);
        self.current_char = Some('\0');
        self.next_char();
    }

    fn enter_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        self.enter_scope(path.display().to_string(), &content);
        Ok(())
    }

    fn leave_scope(&mut self) {
        let popped = self.scopes.pop().expect("scope stack underflow");
        self.current_char = popped.backup_char;
    }

    fn peek_char(&self) -> Option<char> {
        let scope = self.scope();
        scope.chars.get(scope.read_pos).copied()
    }

    fn next_char(&mut self) -> Option<char> {
        self.current_char?;

        self.location.end = self.scope().curr_pos;
        let scope = self.scopes.last_mut().unwrap();
        scope.curr_pos = scope.next_pos;

        match scope.chars.get(scope.read_pos).copied() {
            None => {
                self.current_char = None;
                if self.scopes.len() > 1 {
                    self.leave_scope();
                }
                self.current_char
            }
            Some(ch) => {
                scope.read_pos += 1;
                scope.next_pos.offset += 1;
                if ch != '\n' {
                    scope.next_pos.column += 1;
                } else {
                    scope.next_pos.column = 1;
                    scope.next_pos.line += 1;
                }
                self.current_char = Some(ch);
                self.current_char
            }
        }
    }

    fn consume(&mut self, ch: char) -> bool {
        let ok = self.current_char == Some(ch);
        self.next_char();
        ok
    }

    // }}}
    // {{{ whitespace, comments, #include

    /// Skips whitespace and comments. Returns false once EOF is reached.
    fn consume_space(&mut self) -> bool {
        loop {
            let ch = match self.current_char {
                None => return false,
                Some(ch) => ch,
            };

            if ch.is_whitespace() {
                self.next_char();
                continue;
            }

            if !ch.is_control() {
                break;
            }

            let loc = self.location.clone();
            self.report
                .borrow_mut()
                .token_error(loc, format!("invalid byte 0x{:02X}", ch as u32));
            self.next_char();
        }

        if self.current_char == Some('#') {
            let maybe_command = self.scope().curr_pos.column == 1;
            let mut line = String::new();
            self.next_char();
            loop {
                match self.current_char {
                    None => {
                        if maybe_command {
                            self.process_command(&line);
                        }
                        if self.eof() {
                            self.token = Token::Eof;
                            return false;
                        }
                        return self.consume_space();
                    }
                    Some('\n') => {
                        if maybe_command {
                            self.process_command(&line);
                        }
                        return self.consume_space();
                    }
                    Some(ch) => {
                        line.push(ch);
                        self.next_char();
                    }
                }
            }
        }

        if self.current_char == Some('/') && self.peek_char() == Some('*') {
            self.next_char();
            loop {
                match self.current_char {
                    None => {
                        self.token = Token::Eof;
                        return false;
                    }
                    Some('*') if self.peek_char() == Some('/') => {
                        self.next_char();
                        self.next_char();
                        break;
                    }
                    _ => {
                        self.next_char();
                    }
                }
            }
            return self.consume_space();
        }

        true
    }

    /// Handles `#include "glob"` lines. Matched files are pushed in
    /// reverse so they lex in sorted order.
    fn process_command(&mut self, line: &str) {
        if !line.starts_with("include") {
            return;
        }

        let beg = line.find('"');
        let end = line.rfind('"');
        let pattern = match (beg, end) {
            (Some(b), Some(e)) if e > b => &line[b + 1..e],
            _ => {
                let loc = self.last_location.clone();
                self.report
                    .borrow_mut()
                    .token_error(loc, "Malformed #include line");
                return;
            }
        };

        match expand_glob(pattern) {
            Ok(paths) if paths.is_empty() => {
                let loc = self.last_location.clone();
                self.report
                    .borrow_mut()
                    .token_error(loc, format!("glob() error: no match for \"{}\"", pattern));
            }
            Ok(paths) => {
                for path in paths.iter().rev() {
                    if let Err(e) = self.enter_file(path) {
                        let loc = self.last_location.clone();
                        self.report.borrow_mut().token_error(loc, e.to_string());
                    }
                }
            }
            Err(e) => {
                let loc = self.last_location.clone();
                self.report
                    .borrow_mut()
                    .token_error(loc, format!("glob() error: {}", e));
            }
        }
    }

    // }}}
    // {{{ token production

    pub fn next_token(&mut self) -> &Token {
        if !self.consume_space() {
            self.token = Token::Eof;
            return &self.token;
        }

        self.last_location = self.location.clone();
        self.location.filename = self.scope().filename.clone();
        self.location.begin = self.scope().curr_pos;

        let ch = self.current_char.unwrap();
        self.token = match ch {
            '~' => {
                self.next_char();
                Token::BitNot
            }
            '=' => match self.next_char() {
                Some('=') => {
                    self.next_char();
                    Token::Equal
                }
                Some('^') => {
                    self.next_char();
                    Token::PrefixMatch
                }
                Some('$') => {
                    self.next_char();
                    Token::SuffixMatch
                }
                Some('~') => {
                    self.next_char();
                    Token::RegexMatch
                }
                Some('>') => {
                    self.next_char();
                    Token::HashRocket
                }
                _ => Token::Assign,
            },
            '<' => match self.next_char() {
                Some('<') => {
                    self.next_char();
                    Token::Shl
                }
                Some('=') => {
                    self.next_char();
                    Token::LessOrEqual
                }
                _ => Token::Less,
            },
            '>' => match self.next_char() {
                Some('>') => {
                    self.next_char();
                    Token::Shr
                }
                Some('=') => {
                    self.next_char();
                    Token::GreaterOrEqual
                }
                _ => Token::Greater,
            },
            '^' => {
                self.next_char();
                Token::BitXor
            }
            '|' => match self.next_char() {
                Some('|') => {
                    self.next_char();
                    Token::Or
                }
                Some('=') => {
                    self.next_char();
                    Token::OrAssign
                }
                _ => Token::BitOr,
            },
            '&' => match self.next_char() {
                Some('&') => {
                    self.next_char();
                    Token::And
                }
                Some('=') => {
                    self.next_char();
                    Token::AndAssign
                }
                _ => Token::BitAnd,
            },
            '.' => {
                if self.next_char() == Some('.') {
                    if self.next_char() == Some('.') {
                        self.next_char();
                        Token::Ellipsis
                    } else {
                        Token::DblPeriod
                    }
                } else {
                    Token::Period
                }
            }
            ':' => {
                if self.peek_char() == Some(':') {
                    self.continue_parse_ipv6(String::new(), false)
                } else {
                    self.next_char();
                    Token::Colon
                }
            }
            ';' => {
                self.next_char();
                Token::Semicolon
            }
            ',' => {
                self.next_char();
                Token::Comma
            }
            '{' => {
                self.next_char();
                Token::Begin
            }
            '}' => {
                if self.interpolation_depth > 0 {
                    self.parse_interpolation_fragment(false)
                } else {
                    self.next_char();
                    Token::End
                }
            }
            '(' => {
                self.next_char();
                Token::RndOpen
            }
            ')' => {
                self.next_char();
                Token::RndClose
            }
            '[' => {
                self.next_char();
                Token::BrOpen
            }
            ']' => {
                self.next_char();
                Token::BrClose
            }
            '+' => {
                self.next_char();
                Token::Plus
            }
            '-' => {
                self.next_char();
                Token::Minus
            }
            '*' => match self.next_char() {
                Some('*') => {
                    self.next_char();
                    Token::Pow
                }
                _ => Token::Mul,
            },
            '/' => {
                // regular expressions are lexed only on explicit parser
                // request, via continue_parse_regex()
                self.next_char();
                Token::Div
            }
            '%' => {
                self.next_char();
                Token::Mod
            }
            '!' => match self.next_char() {
                Some('=') => {
                    self.next_char();
                    Token::UnEqual
                }
                _ => Token::Not,
            },
            '$' => {
                if self.peek_char().map_or(false, |c| c.is_ascii_digit()) {
                    self.parse_regexp_group()
                } else {
                    self.parse_env_var()
                }
            }
            '\'' => self.parse_raw_string(),
            '"' => {
                self.interpolation_depth += 1;
                self.parse_interpolation_fragment(true)
            }
            '0' => self.parse_number(8),
            '1'..='9' => self.parse_number(10),
            _ => {
                if ch.is_alphabetic() || ch == '_' {
                    self.parse_ident()
                } else {
                    let loc = self.last_location.clone();
                    self.report.borrow_mut().token_error(
                        loc,
                        format!("unknown character '{}' (0x{:02X})", ch, ch as u32),
                    );
                    self.next_char();
                    Token::Unknown
                }
            }
        };

        &self.token
    }

    fn parse_env_var(&mut self) -> Token {
        let mut name = String::new();
        self.next_char(); // skip '$'

        while let Some(ch) = self.current_char {
            if ch == '_' || ch.is_alphanumeric() {
                name.push(ch);
                self.next_char();
            } else {
                break;
            }
        }

        Token::String(std::env::var(&name).unwrap_or_default())
    }

    fn parse_regexp_group(&mut self) -> Token {
        self.next_char(); // skip '$'

        let mut group: FlowNumber = 0;
        while let Some(ch) = self.current_char {
            match ch.to_digit(10) {
                Some(d) => {
                    group = group * 10 + d as FlowNumber;
                    self.next_char();
                }
                None => break,
            }
        }

        Token::RegExpGroup(group)
    }

    fn parse_raw_string(&mut self) -> Token {
        match self.parse_delimited('\'') {
            Some(value) => Token::RawString(unescape(&value)),
            None => Token::Unknown,
        }
    }

    fn parse_delimited(&mut self, delim: char) -> Option<String> {
        let mut value = String::new();
        let mut last = None;

        self.next_char(); // skip left delimiter

        while let Some(ch) = self.current_char {
            if ch == delim && last != Some('\\') {
                break;
            }
            value.push(ch);
            last = Some(ch);
            self.next_char();
        }

        if self.current_char == Some(delim) {
            self.next_char();
            Some(value)
        } else {
            None
        }
    }

    /// Lexes one piece of a double-quoted string, stopping at either the
    /// closing quote or a `#{` interpolation marker.
    fn parse_interpolation_fragment(&mut self, start: bool) -> Token {
        let mut value = String::new();
        let mut last = None;

        // skip either '"' or '}', depending on how we entered
        self.next_char();

        loop {
            let ch = match self.current_char {
                None => return Token::Eof,
                Some(ch) => ch,
            };

            if ch == '"' && last != Some('\\') {
                self.next_char();
                self.interpolation_depth -= 1;
                return if start {
                    Token::String(value)
                } else {
                    Token::InterpolatedStringEnd(value)
                };
            }

            if ch == '\\' {
                self.next_char();
                let escaped = match self.current_char {
                    None => return Token::Eof,
                    Some(c) => c,
                };
                match escaped {
                    'r' => value.push('\r'),
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    '\\' => value.push('\\'),
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
            } else if ch == '#' {
                self.next_char();
                if self.current_char == Some('{') {
                    self.next_char();
                    return Token::InterpolatedStringFragment(value);
                }
                value.push('#');
                if let Some(c) = self.current_char {
                    value.push(c);
                }
            } else {
                value.push(ch);
            }

            last = self.current_char;
            self.next_char();
        }
    }

    fn parse_number(&mut self, base: u32) -> Token {
        let mut digits = String::new();
        let mut number: FlowNumber = 0;
        let mut overflow = false;

        while let Some(ch) = self.current_char {
            match ch.to_digit(base) {
                Some(d) => {
                    number = match number
                        .checked_mul(base as FlowNumber)
                        .and_then(|n| n.checked_add(d as FlowNumber))
                    {
                        Some(n) => n,
                        None => {
                            overflow = true;
                            0
                        }
                    };
                    digits.push(ch);
                    self.next_char();
                }
                None => break,
            }
        }

        if overflow {
            let loc = self.last_location.clone();
            self.report
                .borrow_mut()
                .token_error(loc, "number literal does not fit into 63 bits");
            return Token::Unknown;
        }

        // might be the first hex group of an IPv6 address
        if digits.len() <= 4 && self.current_char == Some(':') {
            return self.continue_parse_ipv6(digits, true);
        }
        if digits.len() < 4 && self.is_hex_char() {
            return self.continue_parse_ipv6(digits, false);
        }

        if self.current_char != Some('.') {
            return Token::Number(number);
        }

        // dotted-quad IPv4: three more digit groups
        let mut text = digits;
        for _ in 0..3 {
            if !self.consume('.') {
                return Token::Unknown;
            }
            text.push('.');
            while let Some(ch) = self.current_char {
                if ch.is_ascii_digit() {
                    text.push(ch);
                    self.next_char();
                } else {
                    break;
                }
            }
        }

        let addr: Ipv4Addr = match text.parse() {
            Ok(addr) => addr,
            Err(_) => {
                let loc = self.last_location.clone();
                self.report
                    .borrow_mut()
                    .token_error(loc, format!("invalid IPv4 literal '{}'", text));
                return Token::Unknown;
            }
        };

        if self.current_char != Some('/') {
            return Token::IP(addr.into());
        }

        self.continue_cidr(addr.into(), 32)
    }

    fn parse_ident(&mut self) -> Token {
        let mut name = String::new();
        let first = self.current_char.unwrap();
        name.push(first);
        let mut is_hex = first.is_ascii_hexdigit();

        self.next_char();

        while let Some(ch) = self.current_char {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                name.push(ch);
                if !ch.is_ascii_hexdigit() {
                    is_hex = false;
                }
                self.next_char();
            } else {
                break;
            }
        }

        if self.current_char == Some(':') && !is_hex {
            self.next_char(); // skip ':'
            return Token::NamedParam(name);
        }

        // short all-hex identifiers may actually start an IPv6 literal
        if name.len() <= 4 && is_hex && self.current_char == Some(':') {
            return self.continue_parse_ipv6(name, true);
        }

        match name.as_str() {
            "in" => Token::In,
            "var" => Token::Var,
            "match" => Token::Match,
            "on" => Token::On,
            "for" => Token::For,
            "do" => Token::Do,
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            "unless" => Token::Unless,
            "import" => Token::Import,
            "from" => Token::From,
            "handler" => Token::Handler,
            "while" => Token::While,
            "and" => Token::And,
            "or" => Token::Or,
            "xor" => Token::Xor,
            "not" => Token::Not,
            "shl" => Token::Shl,
            "shr" => Token::Shr,
            "bool" => Token::BoolType,
            "int" => Token::NumberType,
            "string" => Token::StringType,
            "true" | "yes" => Token::Boolean(true),
            "false" | "no" => Token::Boolean(false),
            _ => Token::Ident(name),
        }
    }

    // }}}
    // {{{ IPv6 continuation

    fn is_hex_char(&self) -> bool {
        self.current_char.map_or(false, |c| c.is_ascii_hexdigit())
    }

    // 1*4HEXDIGIT, `pending` digits already consumed by the caller
    fn ipv6_hex_digit4(&mut self, text: &mut String, pending: usize) -> bool {
        let mut count = pending;
        while self.is_hex_char() {
            text.push(self.current_char.unwrap());
            self.next_char();
            count += 1;
        }
        (1..=4).contains(&count)
    }

    // 1*4HEXDIGIT *(':' 1*4HEXDIGIT)
    fn ipv6_hex_seq(&mut self, text: &mut String, pending: usize) -> bool {
        if !self.ipv6_hex_digit4(text, pending) {
            return false;
        }
        while self.current_char == Some(':') && self.peek_char() != Some(':') {
            text.push(':');
            self.next_char();
            if !self.ipv6_hex_digit4(text, 0) {
                return false;
            }
        }
        true
    }

    // IPv6_HexPart ::= IPv6_HexSeq
    //                | IPv6_HexSeq "::" [IPv6_HexSeq]
    //                |             "::" [IPv6_HexSeq]
    fn ipv6_hex_part(&mut self, text: &mut String, pending: usize) -> bool {
        let mut rv;
        if self.current_char == Some(':') && self.peek_char() == Some(':') {
            text.push_str("::");
            self.next_char();
            self.next_char();
            rv = !self.is_hex_char() || self.ipv6_hex_seq(text, 0);
        } else {
            rv = self.ipv6_hex_seq(text, pending);
            if rv && self.current_char == Some(':') && self.peek_char() == Some(':') {
                text.push_str("::");
                self.next_char();
                self.next_char();
                rv = !self.is_hex_char() || self.ipv6_hex_seq(text, 0);
            }
        }

        if self
            .current_char
            .map_or(false, |c| c.is_alphanumeric() || c == ':')
        {
            rv = false;
        }

        rv
    }

    /// Continues an IPv6 literal whose first hex group (possibly
    /// incomplete) is already in `text`.
    fn continue_parse_ipv6(&mut self, text: String, first_complete: bool) -> Token {
        let mut text = text;
        let mut rv = true;

        if first_complete {
            while self.current_char == Some(':') && self.peek_char() != Some(':') {
                text.push(':');
                self.next_char();
                if !self.ipv6_hex_digit4(&mut text, 0) {
                    return Token::Unknown;
                }
            }
            if self.current_char == Some(':') && self.peek_char() == Some(':') {
                text.push_str("::");
                self.next_char();
                self.next_char();
                rv = !self.is_hex_char() || self.ipv6_hex_seq(&mut text, 0);
            }
        } else {
            let pending = text.len();
            rv = self.ipv6_hex_part(&mut text, pending);
        }

        // embedded IPv4 tail
        while self.current_char == Some('.')
            && self.peek_char().map_or(false, |c| c.is_ascii_digit())
        {
            text.push('.');
            self.next_char();
            while let Some(ch) = self.current_char {
                if ch.is_ascii_digit() {
                    text.push(ch);
                    self.next_char();
                } else {
                    break;
                }
            }
        }

        let addr: Ipv6Addr = match text.parse() {
            Ok(addr) if rv => addr,
            _ => {
                let loc = self.last_location.clone();
                self.report
                    .borrow_mut()
                    .token_error(loc, format!("invalid IPv6 literal '{}'", text));
                return Token::Unknown;
            }
        };

        if self.current_char != Some('/') {
            return Token::IP(addr.into());
        }

        self.continue_cidr(addr.into(), 128)
    }

    fn continue_cidr(&mut self, addr: std::net::IpAddr, range: u32) -> Token {
        self.next_char(); // consume '/'

        if !self.current_char.map_or(false, |c| c.is_ascii_digit()) {
            let loc = self.last_location.clone();
            self.report
                .borrow_mut()
                .token_error(loc, "CIDR prefix expected after '/'");
            return Token::Unknown;
        }

        let mut prefix: u32 = 0;
        while let Some(ch) = self.current_char {
            match ch.to_digit(10) {
                Some(d) => {
                    prefix = prefix.saturating_mul(10).saturating_add(d);
                    self.next_char();
                }
                None => break,
            }
        }

        if prefix > range {
            let loc = self.last_location.clone();
            self.report
                .borrow_mut()
                .token_error(loc, "CIDR prefix out of range.");
            return Token::Unknown;
        }

        Token::Cidr(Cidr::new(addr, prefix as u8))
    }

    // }}}

    /// Re-lexes the current `/` as a regular expression literal; only
    /// the parser knows when a regex (and not a division) is expected.
    pub fn continue_parse_regex(&mut self, delim: char) -> bool {
        let mut pattern = String::new();
        let mut last = None;

        while let Some(ch) = self.current_char {
            if ch == delim && last != Some('\\') {
                break;
            }
            pattern.push(ch);
            last = Some(ch);
            self.next_char();
        }

        if self.current_char == Some(delim) {
            self.next_char();
            self.token = Token::RegExp(pattern);
            true
        } else {
            self.token = Token::Unknown;
            false
        }
    }
}

fn unescape(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => result.push('\\'),
            Some('r') => result.push('\r'),
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some(other) => result.push(other),
            None => {}
        }
    }
    result
}

/// Expands a shell-style glob against the filesystem. Patterns without
/// wildcards pass through untouched; matches come back sorted.
fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    if !pattern.contains(['*', '?', '[']) {
        return Ok(vec![PathBuf::from(pattern)]);
    }

    let (dir, file_pattern) = match pattern.rfind('/') {
        Some(i) => (&pattern[..i], &pattern[i + 1..]),
        None => (".", pattern),
    };

    let re = glob_to_regex(file_pattern)?;
    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read directory {}", dir))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(false, |name| re.is_match(name))
        })
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    Ok(matches)
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => re.push_str("[^/]*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                for inner in chars.by_ref() {
                    re.push(inner);
                    if inner == ']' {
                        break;
                    }
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).context("bad include pattern")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::diagnostics::{shared, Report};

    fn lex_all(src: &str) -> (Vec<Token>, SharedReport) {
        let report = shared(Report::buffered());
        let mut lexer = Lexer::new(report.clone());
        lexer.open_string(src);
        let mut tokens = vec![lexer.token().clone()];
        while *lexer.token() != Token::Eof {
            tokens.push(lexer.next_token().clone());
        }
        tokens.pop(); // Eof
        (tokens, report)
    }

    #[test]
    fn operators_maximal_munch() {
        let (tokens, _) = lex_all("== =^ =$ =~ => = <= << < >= >> > != ! ** *");
        assert_eq!(
            tokens,
            vec![
                Token::Equal,
                Token::PrefixMatch,
                Token::SuffixMatch,
                Token::RegexMatch,
                Token::HashRocket,
                Token::Assign,
                Token::LessOrEqual,
                Token::Shl,
                Token::Less,
                Token::GreaterOrEqual,
                Token::Shr,
                Token::Greater,
                Token::UnEqual,
                Token::Not,
                Token::Pow,
                Token::Mul,
            ]
        );
    }

    #[test]
    fn keywords_and_identifiers() {
        let (tokens, _) = lex_all("handler main if then else unless req.path");
        assert_eq!(
            tokens,
            vec![
                Token::Handler,
                Token::Ident("main".into()),
                Token::If,
                Token::Then,
                Token::Else,
                Token::Unless,
                Token::Ident("req.path".into()),
            ]
        );
    }

    #[test]
    fn boolean_literals() {
        let (tokens, _) = lex_all("true yes false no");
        assert_eq!(
            tokens,
            vec![
                Token::Boolean(true),
                Token::Boolean(true),
                Token::Boolean(false),
                Token::Boolean(false),
            ]
        );
    }

    #[test]
    fn numbers_decimal_and_octal() {
        let (tokens, _) = lex_all("42 017");
        assert_eq!(tokens, vec![Token::Number(42), Token::Number(15)]);
    }

    #[test]
    fn max_number_literal_parses() {
        let (tokens, report) = lex_all("9223372036854775807");
        assert_eq!(tokens, vec![Token::Number(i64::MAX)]);
        assert!(!report.borrow().contains_failures());
    }

    #[test]
    fn oversized_number_literal_is_token_error() {
        let (tokens, report) = lex_all("9223372036854775808");
        assert_eq!(tokens, vec![Token::Unknown]);
        assert!(report.borrow().contains_failures());
    }

    #[test]
    fn ipv4_and_cidr() {
        let (tokens, _) = lex_all("10.0.0.5 10.0.0.0/24 127.0.0.1/32");
        assert_eq!(
            tokens,
            vec![
                Token::IP("10.0.0.5".parse().unwrap()),
                Token::Cidr(Cidr::new("10.0.0.0".parse().unwrap(), 24)),
                Token::Cidr(Cidr::new("127.0.0.1".parse().unwrap(), 32)),
            ]
        );
    }

    #[test]
    fn ipv4_cidr_prefix_out_of_range() {
        let (tokens, report) = lex_all("10.0.0.0/33");
        assert_eq!(tokens, vec![Token::Unknown]);
        assert!(report.borrow().contains_failures());
    }

    #[test]
    fn ipv6_literals() {
        let (tokens, _) = lex_all("::1 fe80::1 2001:db8::/32 ::ffff:127.0.0.1");
        assert_eq!(
            tokens,
            vec![
                Token::IP("::1".parse().unwrap()),
                Token::IP("fe80::1".parse().unwrap()),
                Token::Cidr(Cidr::new("2001:db8::".parse().unwrap(), 32)),
                Token::IP("::ffff:127.0.0.1".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn ipv6_cidr_prefix_boundary() {
        let (tokens, report) = lex_all("::1/128");
        assert_eq!(
            tokens,
            vec![Token::Cidr(Cidr::new("::1".parse().unwrap(), 128))]
        );
        assert!(!report.borrow().contains_failures());

        let (tokens, report) = lex_all("::1/129");
        assert_eq!(tokens, vec![Token::Unknown]);
        assert!(report.borrow().contains_failures());
    }

    #[test]
    fn raw_string_unescapes() {
        let (tokens, _) = lex_all(r"'a\tb\\c'");
        assert_eq!(tokens, vec![Token::RawString("a\tb\\c".into())]);
    }

    #[test]
    fn plain_double_quoted_string() {
        let (tokens, _) = lex_all(r#""hello\nworld""#);
        assert_eq!(tokens, vec![Token::String("hello\nworld".into())]);
    }

    #[test]
    fn interpolated_string_fragments() {
        let (tokens, _) = lex_all(r#""sum=#{1 + 2} done""#);
        assert_eq!(
            tokens,
            vec![
                Token::InterpolatedStringFragment("sum=".into()),
                Token::Number(1),
                Token::Plus,
                Token::Number(2),
                Token::InterpolatedStringEnd(" done".into()),
            ]
        );
    }

    #[test]
    fn named_param_token() {
        let (tokens, _) = lex_all("limit: 10");
        assert_eq!(
            tokens,
            vec![Token::NamedParam("limit".into()), Token::Number(10)]
        );
    }

    #[test]
    fn env_var_substitution() {
        std::env::set_var("FLOWC_LEX_TEST", "hello");
        let (tokens, _) = lex_all("$FLOWC_LEX_TEST $FLOWC_LEX_UNSET_TEST");
        assert_eq!(
            tokens,
            vec![Token::String("hello".into()), Token::String(String::new())]
        );
    }

    #[test]
    fn regexp_group_token() {
        let (tokens, _) = lex_all("$1");
        assert_eq!(tokens, vec![Token::RegExpGroup(1)]);
    }

    #[test]
    fn comments_are_skipped() {
        let (tokens, _) = lex_all("1 # line comment\n/* block\ncomment */ 2");
        assert_eq!(tokens, vec![Token::Number(1), Token::Number(2)]);
    }

    #[test]
    fn include_pushes_scope() {
        let dir = std::env::temp_dir().join("flowc_lex_include_test");
        std::fs::create_dir_all(&dir).unwrap();
        let included = dir.join("part.flow");
        std::fs::write(&included, "42").unwrap();

        let src = format!("#include \"{}\"\n7", included.display());
        let (tokens, report) = lex_all(&src);
        assert_eq!(tokens, vec![Token::Number(42), Token::Number(7)]);
        assert!(!report.borrow().contains_failures());
    }

    #[test]
    fn parser_requested_regex() {
        let report = shared(Report::buffered());
        let mut lexer = Lexer::new(report);
        lexer.open_string("/ab+c/ ;");
        assert_eq!(*lexer.token(), Token::Div);
        assert!(lexer.continue_parse_regex('/'));
        assert_eq!(*lexer.token(), Token::RegExp("ab+c".into()));
        assert_eq!(*lexer.next_token(), Token::Semicolon);
    }
}
