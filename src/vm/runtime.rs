use std::fmt;
use std::net::IpAddr;

use crate::types::{FlowNumber, LiteralType};
use crate::util::cidr::Cidr;
use crate::util::regexp::RegExp;

/// A runtime value as seen by the VM and by native callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Boolean(bool),
    Number(FlowNumber),
    String(String),
    IP(IpAddr),
    Cidr(Cidr),
    RegExp(RegExp),
    IntArray(Vec<FlowNumber>),
    StringArray(Vec<String>),
    IPAddrArray(Vec<IpAddr>),
    CidrArray(Vec<Cidr>),
}

impl Value {
    pub fn ty(&self) -> LiteralType {
        match self {
            Value::Void => LiteralType::Void,
            Value::Boolean(_) => LiteralType::Boolean,
            Value::Number(_) => LiteralType::Number,
            Value::String(_) => LiteralType::String,
            Value::IP(_) => LiteralType::IPAddress,
            Value::Cidr(_) => LiteralType::Cidr,
            Value::RegExp(_) => LiteralType::RegExp,
            Value::IntArray(_) => LiteralType::IntArray,
            Value::StringArray(_) => LiteralType::StringArray,
            Value::IPAddrArray(_) => LiteralType::IPAddrArray,
            Value::CidrArray(_) => LiteralType::CidrArray,
        }
    }

    pub fn as_boolean(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0,
            _ => false,
        }
    }

    pub fn as_number(&self) -> FlowNumber {
        match self {
            Value::Number(n) => *n,
            Value::Boolean(b) => *b as FlowNumber,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Value::String(s) => s,
            _ => "",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Boolean(v)
    }
}

impl From<FlowNumber> for Value {
    fn from(v: FlowNumber) -> Value {
        Value::Number(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "(void)"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::IP(ip) => write!(f, "{}", ip),
            Value::Cidr(cidr) => write!(f, "{}", cidr),
            Value::RegExp(re) => write!(f, "{}", re),
            Value::IntArray(xs) => write!(f, "{:?}", xs),
            Value::StringArray(xs) => write!(f, "{:?}", xs),
            Value::IPAddrArray(xs) => {
                write!(f, "[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", x)?;
                }
                write!(f, "]")
            }
            Value::CidrArray(xs) => {
                write!(f, "[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", x)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A callable's name plus its argument types. The textual form is the
/// key the linker resolves against the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: String,
    pub args: Vec<LiteralType>,
}

impl Signature {
    pub fn new(name: impl Into<String>, args: Vec<LiteralType>) -> Signature {
        Signature {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// The slot view handed to a native callback: slot 0 is reserved for
/// the result, slots 1..=N hold the arguments in order.
pub struct Params {
    values: Vec<Value>,
}

impl Params {
    pub fn new(args: Vec<Value>) -> Params {
        let mut values = Vec::with_capacity(args.len() + 1);
        values.push(Value::Void);
        values.extend(args);
        Params { values }
    }

    pub fn count(&self) -> usize {
        self.values.len() - 1
    }

    pub fn value(&self, slot: usize) -> &Value {
        &self.values[slot]
    }

    pub fn get_bool(&self, slot: usize) -> bool {
        self.values[slot].as_boolean()
    }

    pub fn get_int(&self, slot: usize) -> FlowNumber {
        self.values[slot].as_number()
    }

    pub fn get_string(&self, slot: usize) -> &str {
        self.values[slot].as_str()
    }

    pub fn get_ip(&self, slot: usize) -> Option<IpAddr> {
        match &self.values[slot] {
            Value::IP(ip) => Some(*ip),
            _ => None,
        }
    }

    pub fn get_cidr(&self, slot: usize) -> Option<&Cidr> {
        match &self.values[slot] {
            Value::Cidr(cidr) => Some(cidr),
            _ => None,
        }
    }

    pub fn set_result(&mut self, value: impl Into<Value>) {
        self.values[0] = value.into();
    }

    pub fn result(&self) -> &Value {
        &self.values[0]
    }
}

pub type NativeFn = Box<dyn Fn(&mut Params)>;
pub type VerifierFn = Box<dyn Fn(&Signature) -> bool>;

pub struct NativeParam {
    pub name: String,
    pub ty: LiteralType,
    pub default: Option<Value>,
}

/// A host-registered builtin: a function (typed result) or a handler
/// (implicit boolean result that can stop the run).
pub struct NativeCallback {
    name: String,
    is_handler: bool,
    return_type: LiteralType,
    params: Vec<NativeParam>,
    function: Option<NativeFn>,
    verifier: Option<VerifierFn>,
    experimental: bool,
}

impl NativeCallback {
    fn new(name: String, is_handler: bool, return_type: LiteralType) -> NativeCallback {
        NativeCallback {
            name,
            is_handler,
            return_type,
            params: Vec::new(),
            function: None,
            verifier: None,
            experimental: false,
        }
    }

    pub fn bind(&mut self, f: impl Fn(&mut Params) + 'static) -> &mut Self {
        self.function = Some(Box::new(f));
        self
    }

    pub fn param(&mut self, name: impl Into<String>, ty: LiteralType) -> &mut Self {
        self.params.push(NativeParam {
            name: name.into(),
            ty,
            default: None,
        });
        self
    }

    pub fn param_with_default(
        &mut self,
        name: impl Into<String>,
        ty: LiteralType,
        default: impl Into<Value>,
    ) -> &mut Self {
        self.params.push(NativeParam {
            name: name.into(),
            ty,
            default: Some(default.into()),
        });
        self
    }

    pub fn verifier(&mut self, f: impl Fn(&Signature) -> bool + 'static) -> &mut Self {
        self.verifier = Some(Box::new(f));
        self
    }

    pub fn experimental(&mut self) -> &mut Self {
        self.experimental = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_handler(&self) -> bool {
        self.is_handler
    }

    pub fn return_type(&self) -> LiteralType {
        self.return_type
    }

    pub fn params(&self) -> &[NativeParam] {
        &self.params
    }

    pub fn is_experimental(&self) -> bool {
        self.experimental
    }

    pub fn signature(&self) -> Signature {
        Signature::new(
            self.name.clone(),
            self.params.iter().map(|p| p.ty).collect(),
        )
    }

    /// Link-time verification hook; absent hooks accept everything.
    pub fn verify(&self, signature: &Signature) -> bool {
        match &self.verifier {
            Some(v) => v(signature),
            None => true,
        }
    }

    pub fn invoke(&self, params: &mut Params) {
        if let Some(f) = &self.function {
            f(params);
        }
    }
}

/// Registry of the host's native callbacks. Registration order is the
/// order builtins are imported into the parser's global scope.
#[derive(Default)]
pub struct Runtime {
    builtins: Vec<NativeCallback>,
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime::default()
    }

    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        return_type: LiteralType,
    ) -> &mut NativeCallback {
        self.builtins
            .push(NativeCallback::new(name.into(), false, return_type));
        self.builtins.last_mut().unwrap()
    }

    pub fn register_handler(&mut self, name: impl Into<String>) -> &mut NativeCallback {
        self.builtins
            .push(NativeCallback::new(name.into(), true, LiteralType::Boolean));
        self.builtins.last_mut().unwrap()
    }

    pub fn builtins(&self) -> &[NativeCallback] {
        &self.builtins
    }

    pub fn callback(&self, index: usize) -> &NativeCallback {
        &self.builtins[index]
    }

    /// Resolves a signature's textual form to a callback slot.
    pub fn find(&self, signature_text: &str, is_handler: bool) -> Option<usize> {
        self.builtins.iter().position(|cb| {
            cb.is_handler == is_handler && cb.signature().to_string() == signature_text
        })
    }
}
