use std::fmt;

use itertools::Itertools;
use knotd_store::{Guid, Timestamp};
use smol_str::SmolStr;

/// Reply value tree. Lists render with their own parentheses; a sequence
/// renders as its elements joined by spaces, so a set-level list wrapping
/// a sequence of per-primitive lists comes out as `((a) (b) …)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(u64),
    String(SmolStr),
    Guid(Guid),
    Timestamp(Timestamp),
    List(Vec<Value>),
    Sequence(Vec<Value>),
}

impl Value {
    pub fn string(s: impl Into<SmolStr>) -> Value {
        Value::String(s.into())
    }

    pub fn opt_string(s: Option<&str>) -> Value {
        s.map_or(Value::Null, Value::string)
    }

    pub fn opt_guid(g: Option<Guid>) -> Value {
        g.map_or(Value::Null, Value::Guid)
    }

}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            _ => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(true) => f.write_str("true"),
            Value::Bool(false) => f.write_str("false"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write_quoted(f, s),
            Value::Guid(g) => write!(f, "{g}"),
            Value::Timestamp(t) => write!(f, "{t}"),
            Value::List(items) => write!(f, "({})", items.iter().format(" ")),
            Value::Sequence(items) => write!(f, "{}", items.iter().format(" ")),
        }
    }
}
