use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use rust_decimal::{Decimal, prelude::FromPrimitive};

/// A JSON value used throughout the Sorrel query core.
///
/// This type represents all valid JSON types with a distinction between
/// integers and floats (unlike standard JSON which only has "number").
/// The distinction is preserved through evaluation; mixed comparisons go
/// through high-precision decimals so `1` and `1.0` compare equal without
/// floating-point surprises.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON null
    Null,

    /// JSON boolean (true/false)
    Boolean(bool),

    /// Integer number (preserved separately from floats)
    Integer(i64),

    /// Floating-point number
    Float(f64),

    /// UTF-8 string
    String(String),

    /// Array of values (homogeneous or heterogeneous)
    Array(Vec<Value>),

    /// Object with string keys
    Object(HashMap<String, Value>),
}

impl Value {
    /// Check if the value is truthy (for conditions)
    pub fn is_truthy(&self) -> bool {
        use Value::*;
        match self {
            Null => false,
            Boolean(b) => *b,
            Integer(n) => *n > 0,
            Float(n) => *n > 0.0,
            String(s) => !s.is_empty(),
            Array(arr) => !arr.is_empty(),
            Object(obj) => !obj.is_empty(),
        }
    }

    /// Convert to boolean for conditions
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            _ => self.is_truthy(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get as float
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Human-readable type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Numeric-aware equality: integers and floats representing the same
    /// number are equal; everything else falls back to structural equality.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                match (Decimal::from_i64(*a), Decimal::from_f64(*b)) {
                    (Some(ad), Some(bd)) => ad == bd,
                    _ => false,
                }
            }
            (a, b) => a == b,
        }
    }

    /// Ordering over comparable values. `None` when the two types cannot
    /// be compared (e.g. string vs. number).
    pub fn partial_cmp_values(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => cmp_int_float(*a, *b),
            (Value::Float(a), Value::Integer(b)) => {
                cmp_int_float(*b, *a).map(Ordering::reverse)
            }
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Exact mixed-numeric ordering through decimals, so it agrees with
/// [`Value::loose_eq`] on integers above 2^53 where an `as f64` cast would
/// round. Falls back to float comparison for NaN and infinities, which
/// decimals cannot represent.
fn cmp_int_float(a: i64, b: f64) -> Option<Ordering> {
    match (Decimal::from_i64(a), Decimal::from_f64(b)) {
        (Some(ad), Some(bd)) => Some(ad.cmp(&bd)),
        _ => (a as f64).partial_cmp(&b),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self))
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Value::from(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(serde_json::Value::from).collect())
            }
            Value::Object(obj) => serde_json::Value::Object(
                obj.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// A hashable normalization of a [`Value`] used to bucket equi-join rows.
///
/// Whole floats normalize to integers so `1` and `1.0` land in the same
/// bucket, matching [`Value::loose_eq`]. NaN keys never compare equal and
/// therefore never match anything.
#[derive(Debug, Clone)]
pub struct JoinKey(Value);

impl JoinKey {
    pub fn new(value: Value) -> Self {
        JoinKey(Self::normalize(value))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    fn normalize(value: Value) -> Value {
        match value {
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Value::Integer(f as i64)
            }
            Value::Array(arr) => Value::Array(arr.into_iter().map(Self::normalize).collect()),
            Value::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, Self::normalize(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl PartialEq for JoinKey {
    fn eq(&self, other: &Self) -> bool {
        key_eq(&self.0, &other.0)
    }
}

impl Eq for JoinKey {}

fn key_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x == y, // NaN != NaN, as intended
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| key_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| key_eq(v, w)))
        }
        (a, b) => a == b,
    }
}

impl Hash for JoinKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_value(&self.0, state);
    }
}

fn hash_value<H: Hasher>(v: &Value, state: &mut H) {
    match v {
        Value::Null => state.write_u8(0),
        Value::Boolean(b) => {
            state.write_u8(1);
            b.hash(state);
        }
        Value::Integer(n) => {
            state.write_u8(2);
            n.hash(state);
        }
        Value::Float(f) => {
            state.write_u8(3);
            f.to_bits().hash(state);
        }
        Value::String(s) => {
            state.write_u8(4);
            s.hash(state);
        }
        Value::Array(arr) => {
            state.write_u8(5);
            state.write_usize(arr.len());
            for item in arr {
                hash_value(item, state);
            }
        }
        Value::Object(obj) => {
            // Order-independent: xor the per-entry hashes.
            state.write_u8(6);
            state.write_usize(obj.len());
            let mut acc: u64 = 0;
            for (k, v) in obj {
                let mut h = std::collections::hash_map::DefaultHasher::new();
                k.hash(&mut h);
                hash_value(v, &mut h);
                acc ^= h.finish();
            }
            state.write_u64(acc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(k: &JoinKey) -> u64 {
        let mut h = DefaultHasher::new();
        k.hash(&mut h);
        h.finish()
    }

    #[test]
    fn whole_float_keys_match_integers() {
        let a = JoinKey::new(Value::Integer(2));
        let b = JoinKey::new(Value::Float(2.0));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn nan_key_never_matches() {
        let a = JoinKey::new(Value::Float(f64::NAN));
        let b = JoinKey::new(Value::Float(f64::NAN));
        assert_ne!(a, b);
    }

    #[test]
    fn composite_array_keys() {
        let a = JoinKey::new(Value::Array(vec![
            Value::Integer(1),
            Value::String("x".into()),
        ]));
        let b = JoinKey::new(Value::Array(vec![
            Value::Float(1.0),
            Value::String("x".into()),
        ]));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn loose_numeric_equality() {
        assert!(Value::Integer(3).loose_eq(&Value::Float(3.0)));
        assert!(!Value::Integer(3).loose_eq(&Value::Float(3.5)));
    }

    #[test]
    fn ordering_agrees_with_equality_beyond_float_precision() {
        // 2^53 + 1 rounds to 2^53 as an f64; the exact comparison must not.
        let big = Value::Integer((1 << 53) + 1);
        let close = Value::Float((1u64 << 53) as f64);
        assert!(!big.loose_eq(&close));
        assert_eq!(big.partial_cmp_values(&close), Some(Ordering::Greater));
        assert_eq!(close.partial_cmp_values(&big), Some(Ordering::Less));
    }

    #[test]
    fn json_round_trip() {
        let v = Value::from(serde_json::json!({"a": [1, 2.5, "x", null]}));
        let back = serde_json::Value::from(&v);
        assert_eq!(back, serde_json::json!({"a": [1, 2.5, "x", null]}));
    }
}
