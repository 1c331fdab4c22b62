//! Optimistic-locking version types.

use crate::{Error, Result, Value};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// How a version property is seeded and incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionType {
    /// Integer counter starting at 0.
    Integer,
    /// Timestamp in microseconds since the epoch.
    Timestamp,
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

fn now_micros() -> i64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX));
    // Strictly increasing even when the clock does not advance.
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = micros.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

impl VersionType {
    /// Initial version for a newly inserted row.
    pub fn seed(self) -> Value {
        match self {
            VersionType::Integer => Value::BigInt(0),
            VersionType::Timestamp => Value::Timestamp(now_micros()),
        }
    }

    /// Version following `current`.
    pub fn next(self, current: &Value) -> Result<Value> {
        match self {
            VersionType::Integer => match current {
                Value::Null => Ok(Value::BigInt(0)),
                Value::Int(v) => Ok(Value::Int(v + 1)),
                Value::BigInt(v) => Ok(Value::BigInt(v + 1)),
                other => Err(Error::Mapping(format!(
                    "integer version property holds a {} value",
                    other.type_name()
                ))),
            },
            VersionType::Timestamp => Ok(Value::Timestamp(now_micros())),
        }
    }

    /// Are two versions the same?
    pub fn is_equal(self, a: &Value, b: &Value) -> bool {
        match self {
            VersionType::Integer => a.same_identifier(b),
            VersionType::Timestamp => a == b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_versions() {
        let v0 = VersionType::Integer.seed();
        assert_eq!(v0, Value::BigInt(0));
        let v1 = VersionType::Integer.next(&v0).unwrap();
        assert_eq!(v1, Value::BigInt(1));
        assert_eq!(VersionType::Integer.next(&Value::Int(4)).unwrap(), Value::Int(5));
        assert!(VersionType::Integer.is_equal(&Value::Int(1), &Value::BigInt(1)));
    }

    #[test]
    fn test_integer_version_rejects_text() {
        assert!(VersionType::Integer.next(&Value::Text("x".into())).is_err());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let a = VersionType::Timestamp.seed();
        let b = VersionType::Timestamp.next(&a).unwrap();
        assert_eq!(a.compare_numeric(&b), Some(std::cmp::Ordering::Less));
    }
}
