use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use bytes::Bytes;

use crate::proxy::Proxy;

/// Dynamically typed argument or result of a resource operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Proxy(Proxy),
}

impl Value {
    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Byte view of the value, text is accepted as its UTF-8 encoding.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn into_proxy(self) -> Option<Proxy> {
        match self {
            Value::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Value::List(list) => {
                f.write_str("[")?;
                for (i, value) in list.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
            Value::Proxy(proxy) => write!(f, "<proxy {} #{}>", proxy.type_name(), proxy.id()),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b.into())
    }
}

impl From<&'static [u8]> for Value {
    fn from(b: &'static [u8]) -> Self {
        Value::Bytes(Bytes::from_static(b))
    }
}

impl From<Vec<Value>> for Value {
    fn from(list: Vec<Value>) -> Self {
        Value::List(list)
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Value::Proxy(proxy)
    }
}

/// Positional and keyword arguments passed through to the underlying call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keyword(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    /// Looks up the positional argument at `index`, falling back to the keyword `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.keyword.get(name))
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

impl<V: Into<Value>> FromIterator<V> for Args {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self {
            positional: iter.into_iter().map(Into::into).collect(),
            keyword: BTreeMap::new(),
        }
    }
}

impl Display for Args {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for value in &self.positional {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{value}")?;
        }
        for (name, value) in &self.keyword {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{name}={value}")?;
        }

        Ok(())
    }
}
