//! Run-time value universe for the Teal Virtual Machine.
//!
//! Every datum a Teal program manipulates is a [`Value`]. Futures are
//! first-class values, but only the VM's future opcodes may observe them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a future within a session.
pub type FutureId = u32;

/// Identifies a thread within a session.
pub type ThreadId = u32;

/// Represents a value in the Teal VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// The nil value.
    Nil,

    /// A boolean value.
    Bool(bool),

    /// A fixed-width integer.
    Int(i64),

    /// A double-precision float.
    Float(f64),

    /// An immutable string.
    Str(String),

    /// An interned symbol.
    Symbol(String),

    /// An ordered sequence of values.
    List(Vec<Value>),

    /// A reference to a named function in the executable's symbol table.
    Function(String),

    /// A reference to a session future.
    Future(FutureId),
}

impl Value {
    /// Creates a list value.
    pub fn list<T: Into<Vec<Value>>>(items: T) -> Self {
        Value::List(items.into())
    }

    /// Returns true if the value is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns true if the value is a future reference.
    pub fn is_future(&self) -> bool {
        matches!(self, Value::Future(_))
    }

    /// Returns the future id if the value is a future reference.
    pub fn as_future(&self) -> Option<FutureId> {
        match self {
            Value::Future(id) => Some(*id),
            _ => None,
        }
    }

    /// Truthiness: nil and false are falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Returns the integer if the value is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the name of the value's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::List(_) => "list",
            Value::Function(_) => "function",
            Value::Future(_) => "future",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Value::Function(name) => write!(f, "#<function {name}>"),
            Value::Future(id) => write!(f, "#<future {id}>"),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Str(String::new()).is_truthy());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "(1 2)"
        );
        assert_eq!(Value::Future(3).to_string(), "#<future 3>");
    }

    #[test]
    fn test_serde_round_trip() {
        let value = Value::List(vec![
            Value::Int(1),
            Value::Str("two".into()),
            Value::Future(3),
        ]);
        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_future_accessors() {
        assert_eq!(Value::Future(7).as_future(), Some(7));
        assert_eq!(Value::Int(7).as_future(), None);
        assert!(Value::Future(7).is_future());
    }
}
