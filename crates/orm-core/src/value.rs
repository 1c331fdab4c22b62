//! Dynamic column values.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A dynamically-typed column value.
///
/// Property state, identifiers and versions are all carried as `Value`s.
/// Entity references and collections are not values; they are resolved into
/// identifiers when state is disassembled for a persister or the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values; also the disassembled form of a component
    Array(Vec<Value>),

    /// Placeholder identifier for an identity insert that has not executed yet.
    ///
    /// Never written to a persister; replaced by the generated key once the
    /// insert runs.
    Generated(u64),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value is a delayed-identity placeholder.
    pub const fn is_generated_placeholder(&self) -> bool {
        matches!(self, Value::Generated(_))
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
            Value::Generated(_) => "GENERATED",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) | Value::Timestamp(v) => Some(*v),
            Value::Date(v) => Some(i64::from(*v)),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to get the elements of an array value.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Numeric comparison used for version ordering.
    ///
    /// Returns `None` when either side is not an integer-like value.
    pub fn compare_numeric(&self, other: &Value) -> Option<std::cmp::Ordering> {
        Some(self.as_i64()?.cmp(&other.as_i64()?))
    }

    /// Feed this value into a hasher, tagging each variant.
    pub fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            // Int and BigInt hash identically so that keys built from either
            // width land in the same bucket; equality is still exact.
            Value::Int(i) => {
                2u8.hash(hasher);
                i64::from(*i).hash(hasher);
            }
            Value::BigInt(i) => {
                2u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Double(f) => {
                3u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                4u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                5u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                6u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Date(d) => {
                7u8.hash(hasher);
                d.hash(hasher);
            }
            Value::Timestamp(t) => {
                8u8.hash(hasher);
                t.hash(hasher);
            }
            Value::Uuid(u) => {
                9u8.hash(hasher);
                u.hash(hasher);
            }
            Value::Json(j) => {
                10u8.hash(hasher);
                j.to_string().hash(hasher);
            }
            Value::Array(values) => {
                11u8.hash(hasher);
                values.len().hash(hasher);
                for v in values {
                    v.hash_into(hasher);
                }
            }
            Value::Generated(n) => {
                12u8.hash(hasher);
                n.hash(hasher);
            }
        }
    }

    /// Compute a standalone hash of this value.
    pub fn hash_code(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    /// Equality used for identifiers: integer widths compare by value.
    pub fn same_identifier(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_) | Value::BigInt(_), Value::Int(_) | Value::BigInt(_)) => {
                self.as_i64() == other.as_i64()
            }
            _ => self == other,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(i) | Value::Timestamp(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Decimal(s) | Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => write!(f, "{d}"),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{j}"),
            Value::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Generated(n) => write!(f, "<generated #{n}>"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_across_int_widths() {
        assert_eq!(Value::Int(7).hash_code(), Value::BigInt(7).hash_code());
        assert!(Value::Int(7).same_identifier(&Value::BigInt(7)));
        assert_ne!(Value::Int(7), Value::BigInt(7));
    }

    #[test]
    fn test_hash_distinguishes_variants() {
        assert_ne!(
            Value::Text("1".into()).hash_code(),
            Value::BigInt(1).hash_code()
        );
        assert_ne!(Value::Null.hash_code(), Value::Bool(false).hash_code());
    }

    #[test]
    fn test_double_hash_uses_bits() {
        assert_eq!(Value::Double(1.5).hash_code(), Value::Double(1.5).hash_code());
        assert_ne!(Value::Double(0.0).hash_code(), Value::Double(-0.0).hash_code());
    }

    #[test]
    fn test_compare_numeric() {
        use std::cmp::Ordering;
        assert_eq!(
            Value::Int(1).compare_numeric(&Value::BigInt(2)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Text("x".into()).compare_numeric(&Value::Int(1)), None);
    }

    #[test]
    fn test_display_array() {
        let v = Value::Array(vec![Value::Int(1), Value::Text("a".into()), Value::Null]);
        assert_eq!(v.to_string(), "[1, a, null]");
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3_i64)), Value::BigInt(3));
    }
}
