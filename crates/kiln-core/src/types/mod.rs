//! Data type representations for stored values.
//!
//! [`Value`] is the tagged union over every type the server stores.
//! Tokens arriving from clients are typed adaptively on ingest: a
//! token that parses as a base-10 integer becomes `Int`, else a token
//! that parses as a finite double becomes `Float`, else it stays a
//! binary-safe string.

pub mod sorted_set;

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;

pub use sorted_set::SortedSet;

/// A scalar stored inside a hash field (or parsed from a token).
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Binary-safe string data.
    Str(Bytes),
    /// 64-bit signed integer.
    Int(i64),
    /// Finite double.
    Float(f64),
}

impl Scalar {
    /// Adaptive typing on ingest: integer, then finite float, then string.
    pub fn parse(token: &Bytes) -> Scalar {
        if let Ok(s) = std::str::from_utf8(token) {
            if let Ok(n) = s.parse::<i64>() {
                return Scalar::Int(n);
            }
            if let Ok(f) = s.parse::<f64>() {
                if f.is_finite() {
                    return Scalar::Float(f);
                }
            }
        }
        Scalar::Str(token.clone())
    }

    /// Renders this scalar as client-facing bytes.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Scalar::Str(data) => data.clone(),
            Scalar::Int(n) => {
                let mut buf = itoa::Buffer::new();
                Bytes::copy_from_slice(buf.format(*n).as_bytes())
            }
            Scalar::Float(f) => Bytes::from(format_float(*f)),
        }
    }

    /// Byte length of the client-facing representation.
    pub fn strlen(&self) -> usize {
        match self {
            Scalar::Str(data) => data.len(),
            _ => self.to_bytes().len(),
        }
    }

    /// Estimated heap cost of this scalar.
    pub(crate) fn heap_size(&self) -> usize {
        match self {
            Scalar::Str(data) => data.len(),
            Scalar::Int(_) | Scalar::Float(_) => 8,
        }
    }
}

/// A stored value in the keyspace.
///
/// Each variant maps to a Redis-like data type. `PartialEq` is manual
/// because `SortedSet` needs order-aware comparison.
#[derive(Debug, Clone)]
pub enum Value {
    /// Binary-safe string data.
    String(Bytes),

    /// String that parsed as a base-10 integer on ingest.
    Int(i64),

    /// String that parsed as a finite double on ingest.
    Float(f64),

    /// Field → scalar mapping.
    Hash(AHashMap<String, Scalar>),

    /// Unordered set of unique string members.
    Set(AHashSet<String>),

    /// Sorted set ordered by (score, member).
    SortedSet(SortedSet),

    /// Ordered list of binary-safe elements. `VecDeque` gives O(1)
    /// push/pop at both ends.
    List(VecDeque<Bytes>),
}

impl Value {
    /// Adaptive typing for a freshly-ingested token.
    pub fn from_token(token: &Bytes) -> Value {
        match Scalar::parse(token) {
            Scalar::Int(n) => Value::Int(n),
            Scalar::Float(f) => Value::Float(f),
            Scalar::Str(data) => Value::String(data),
        }
    }

    /// Returns the client-facing string representation of a scalar
    /// value, or `None` for container types.
    pub fn as_string_repr(&self) -> Option<Bytes> {
        match self {
            Value::String(data) => Some(data.clone()),
            Value::Int(n) => {
                let mut buf = itoa::Buffer::new();
                Some(Bytes::copy_from_slice(buf.format(*n).as_bytes()))
            }
            Value::Float(f) => Some(Bytes::from(format_float(*f))),
            _ => None,
        }
    }

    /// Returns `true` for the scalar variants (string, int, float).
    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::String(_) | Value::Int(_) | Value::Float(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Hash(a), Value::Hash(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::SortedSet(a), Value::SortedSet(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((m1, s1), (m2, s2))| m1 == m2 && s1 == s2)
            }
            _ => false,
        }
    }
}

/// Returns the type name for a value, matching Redis TYPE output.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) | Value::Int(_) | Value::Float(_) => "string",
        Value::Hash(_) => "hash",
        Value::Set(_) => "set",
        Value::SortedSet(_) => "zset",
        Value::List(_) => "list",
    }
}

/// Converts Redis-style indices (supporting negative values) to a
/// clamped `(start, stop)` pair.
///
/// Negative indices count back from `len` (e.g. -1 = last element).
/// Out-of-bounds stop is clamped to `len - 1`; out-of-bounds negative
/// stop clamps to -1 so the caller sees `start > stop` (empty range).
/// Returns `(0, -1)` for empty collections.
pub fn normalize_range(start: i64, stop: i64, len: i64) -> (i64, i64) {
    if len == 0 {
        return (0, -1);
    }

    let s = if start < 0 {
        (len + start).max(0)
    } else {
        start
    };

    let e = if stop < 0 {
        (len + stop).max(-1)
    } else {
        stop.min(len - 1)
    };

    (s, e)
}

/// Formats a float value matching Redis behavior.
///
/// Integer-valued floats render without a decimal point; everything
/// else uses the shortest representation that round-trips.
pub fn format_float(val: f64) -> String {
    if val == 0.0 {
        return "0".into();
    }
    if val.is_infinite() {
        return if val > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if val == val.trunc() && val >= i64::MIN as f64 && val <= i64::MAX as f64 {
        format!("{}", val as i64)
    } else {
        format!("{val}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_parse_integer() {
        assert_eq!(Scalar::parse(&Bytes::from("42")), Scalar::Int(42));
        assert_eq!(Scalar::parse(&Bytes::from("-7")), Scalar::Int(-7));
        assert_eq!(Scalar::parse(&Bytes::from("0")), Scalar::Int(0));
    }

    #[test]
    fn scalar_parse_float() {
        assert_eq!(Scalar::parse(&Bytes::from("3.5")), Scalar::Float(3.5));
        assert_eq!(Scalar::parse(&Bytes::from("-0.25")), Scalar::Float(-0.25));
    }

    #[test]
    fn scalar_parse_string_fallback() {
        assert_eq!(
            Scalar::parse(&Bytes::from("hello")),
            Scalar::Str(Bytes::from("hello"))
        );
        // infinities don't count as finite doubles
        assert_eq!(
            Scalar::parse(&Bytes::from("inf")),
            Scalar::Str(Bytes::from("inf"))
        );
        // binary data stays a string
        let bin = Bytes::from_static(&[0xff, 0x00]);
        assert_eq!(Scalar::parse(&bin), Scalar::Str(bin.clone()));
    }

    #[test]
    fn scalar_to_bytes() {
        assert_eq!(Scalar::Int(42).to_bytes(), Bytes::from("42"));
        assert_eq!(Scalar::Float(3.5).to_bytes(), Bytes::from("3.5"));
        assert_eq!(
            Scalar::Str(Bytes::from("x")).to_bytes(),
            Bytes::from("x")
        );
    }

    #[test]
    fn value_from_token_adaptive() {
        assert_eq!(Value::from_token(&Bytes::from("10")), Value::Int(10));
        assert_eq!(Value::from_token(&Bytes::from("1.5")), Value::Float(1.5));
        assert_eq!(
            Value::from_token(&Bytes::from("abc")),
            Value::String(Bytes::from("abc"))
        );
    }

    #[test]
    fn value_string_repr() {
        assert_eq!(Value::Int(5).as_string_repr(), Some(Bytes::from("5")));
        assert_eq!(
            Value::Float(67.77).as_string_repr(),
            Some(Bytes::from("67.77"))
        );
        assert_eq!(Value::Hash(AHashMap::new()).as_string_repr(), None);
    }

    #[test]
    fn type_names() {
        assert_eq!(type_name(&Value::Int(1)), "string");
        assert_eq!(type_name(&Value::Float(1.0)), "string");
        assert_eq!(type_name(&Value::String(Bytes::new())), "string");
        assert_eq!(type_name(&Value::Hash(AHashMap::new())), "hash");
        assert_eq!(type_name(&Value::Set(AHashSet::new())), "set");
        assert_eq!(type_name(&Value::SortedSet(SortedSet::new())), "zset");
        assert_eq!(type_name(&Value::List(VecDeque::new())), "list");
    }

    #[test]
    fn normalize_range_basics() {
        assert_eq!(normalize_range(0, -1, 3), (0, 2));
        assert_eq!(normalize_range(1, 1, 3), (1, 1));
        assert_eq!(normalize_range(-2, -1, 3), (1, 2));
        assert_eq!(normalize_range(0, 100, 3), (0, 2));
        assert_eq!(normalize_range(0, -1, 0), (0, -1));
        assert_eq!(normalize_range(0, -100, 3), (0, -1));
    }

    #[test]
    fn format_float_matches_redis() {
        assert_eq!(format_float(0.0), "0");
        assert_eq!(format_float(10.0), "10");
        assert_eq!(format_float(3.5), "3.5");
        assert_eq!(format_float(-3.5), "-3.5");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(f64::NEG_INFINITY), "-inf");
    }
}
