use std::fmt;

/// Numbers in Flow are 64-bit signed integers.
pub type FlowNumber = i64;

/// The closed set of value types a Flow expression can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LiteralType {
    Void,
    Boolean,
    Number,
    String,
    IPAddress,
    Cidr,
    RegExp,
    Handler,
    IntArray,
    StringArray,
    IPAddrArray,
    CidrArray,
}

impl LiteralType {
    pub fn is_array(self) -> bool {
        matches!(
            self,
            LiteralType::IntArray
                | LiteralType::StringArray
                | LiteralType::IPAddrArray
                | LiteralType::CidrArray
        )
    }

    /// Array type whose elements have this type, if one exists.
    pub fn array_of(self) -> Option<LiteralType> {
        match self {
            LiteralType::Number => Some(LiteralType::IntArray),
            LiteralType::String => Some(LiteralType::StringArray),
            LiteralType::IPAddress => Some(LiteralType::IPAddrArray),
            LiteralType::Cidr => Some(LiteralType::CidrArray),
            _ => None,
        }
    }
}

impl fmt::Display for LiteralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LiteralType::Void => "void",
            LiteralType::Boolean => "bool",
            LiteralType::Number => "int",
            LiteralType::String => "string",
            LiteralType::IPAddress => "ip",
            LiteralType::Cidr => "cidr",
            LiteralType::RegExp => "regex",
            LiteralType::Handler => "handler",
            LiteralType::IntArray => "int[]",
            LiteralType::StringArray => "string[]",
            LiteralType::IPAddrArray => "ip[]",
            LiteralType::CidrArray => "cidr[]",
        };
        f.write_str(s)
    }
}

/// Operator class of a `match` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchClass {
    Same,
    Head,
    Tail,
    RegExp,
}

impl fmt::Display for MatchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchClass::Same => "==",
            MatchClass::Head => "=^",
            MatchClass::Tail => "=$",
            MatchClass::RegExp => "=~",
        };
        f.write_str(s)
    }
}

/// Opt-in language features a host may enable per parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    GlobalScope,
    WhileLoop,
}
