use std::fmt;
use std::sync::Arc;

use crate::bytecode::BytecodeImage;
use crate::interpreter::ContinuationResult;

/// Callback type for host functions invoked from bytecode.
pub type HostFn = Arc<dyn Fn(Vec<Value>) -> Value + Send + Sync>;

/// A named host function that guest code can `Invoke`.
#[derive(Clone)]
pub struct HostFunction {
    name: Arc<str>,
    func: HostFn,
}

impl HostFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, args: Vec<Value>) -> Value {
        (self.func)(args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.name)
    }
}

/// A guest value.
///
/// Values are cheap to clone: functions and images are shared by `Arc`, and
/// a suspended continuation owns its snapshot outright.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// A finished root, callable through `Invoke`.
    Function(Arc<BytecodeImage>),
    Host(HostFunction),
    /// The result of invoking a function that suspended at a yield.
    Continuation(Box<ContinuationResult>),
}

impl Value {
    /// Wrap a Rust closure as a host function value.
    pub fn host<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Value + Send + Sync + 'static,
    {
        Value::Host(HostFunction {
            name: Arc::from(name.into()),
            func: Arc::new(f),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::Function(_) => "function",
            Value::Host(_) => "host function",
            Value::Continuation(_) => "continuation",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Function(_) | Value::Host(_) | Value::Continuation(_) => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_continuation(&self) -> Option<&ContinuationResult> {
        match self {
            Value::Continuation(c) => Some(c),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    /// Scalars compare by value; functions compare by identity.
    /// Continuations never compare equal.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Host(a), Value::Host(b)) => Arc::ptr_eq(&a.func, &b.func),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Function(image) => write!(f, "<function {}>", image.name()),
            Value::Host(h) => write!(f, "<host {}>", h.name()),
            Value::Continuation(c) => write!(f, "<continuation yielding {}>", c.result()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<Arc<BytecodeImage>> for Value {
    fn from(image: Arc<BytecodeImage>) -> Self {
        Value::Function(image)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
