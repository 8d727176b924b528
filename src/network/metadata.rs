use bytes::Bytes;

/// A small tagged value for the per-connection metadata store.
///
/// Applications attach state to a connection's lifetime under string keys
/// (an identity, a room name, a flag). A closed set of variants keeps the
/// store typed without downcasts.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Bytes),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        assert_eq!(MetaValue::from("alice").as_str(), Some("alice"));
        assert_eq!(MetaValue::from(42i64).as_int(), Some(42));
        assert_eq!(MetaValue::from(true).as_bool(), Some(true));
        assert_eq!(MetaValue::from("alice").as_int(), None);
    }
}
