// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Heterogeneous record fields and nested object bodies are carried as a
// tagged value tree so the clean/normalize/diff algorithms can match
// exhaustively instead of probing dynamic dictionaries.
// ============================================================================

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value as JsonValue};

/// Ordered map used for every object-like value.
pub type ValueMap = BTreeMap<String, Value>;

/// A dynamically typed field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Numeric view. Strings holding a number are coerced, since tabular
    /// sources deliver every cell as text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => {
                let t = s.trim();
                if t.is_empty() {
                    return None;
                }
                match t.to_ascii_lowercase().as_str() {
                    "+inf" | "inf" | "infinity" => Some(f64::INFINITY),
                    "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                    "nan" => None,
                    _ => t.parse::<f64>().ok(),
                }
            }
            _ => None,
        }
    }

    /// Map lookup; `None` for non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Nested map lookup along `path`.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let mut current = self;
        for segment in path {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// String at a nested path, ignoring empty strings.
    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        self.get_path(path)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Equality tolerant of the number-as-text representation of tabular data.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (Value::Number(a), Value::String(_)) => other.as_f64() == Some(*a),
            (Value::String(_), Value::Number(b)) => self.as_f64() == Some(*b),
            (Value::Bool(a), Value::String(s)) | (Value::String(s), Value::Bool(a)) => {
                s.eq_ignore_ascii_case(if *a { "true" } else { "false" })
            }
            _ => false,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::List(_) => 4,
            Value::Map(_) => 5,
        }
    }

    /// Total order across variants: null < bool < number < string < list < map.
    /// Numeric strings sort numerically and ahead of other strings.
    pub fn cmp_total(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => match (self.as_f64(), other.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => a.cmp(b),
            },
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.cmp_total(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.cmp_total(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Plain text rendering (strings unquoted) used for group keys and sentences.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }

    /// Convert to a `serde_json::Value`; integral numbers become integers.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(l) => JsonValue::Array(l.iter().map(Value::to_json).collect()),
            Value::Map(m) => JsonValue::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
        }
    }
}

fn number_to_json(n: f64) -> JsonValue {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.0e15 {
        JsonValue::Number(Number::from(n as i64))
    } else if n.is_finite() {
        Number::from_f64(n).map(JsonValue::Number).unwrap_or(JsonValue::Null)
    } else if n.is_nan() {
        JsonValue::Null
    } else if n > 0.0 {
        JsonValue::String("inf".into())
    } else {
        JsonValue::String("-inf".into())
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            JsonValue::Object(o) => Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(Value::from)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod value_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_roundtrip_keeps_integers() {
        let v = Value::from(json!({"a": 3, "b": [1.5, "x", null], "c": {"d": true}}));
        assert_eq!(v.to_json(), json!({"a": 3, "b": [1.5, "x", null], "c": {"d": true}}));
    }

    #[test]
    fn test_numeric_coercion_from_text() {
        assert_eq!(Value::from("42.5").as_f64(), Some(42.5));
        assert_eq!(Value::from("+Inf").as_f64(), Some(f64::INFINITY));
        assert_eq!(Value::from("abc").as_f64(), None);
        assert_eq!(Value::from("").as_f64(), None);
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::from("3").loosely_equals(&Value::Number(3.0)));
        assert!(Value::Bool(true).loosely_equals(&Value::from("True")));
        assert!(!Value::from("firing").loosely_equals(&Value::from("resolved")));
    }

    #[test]
    fn test_total_order_across_variants() {
        let mut values = vec![
            Value::from("b"),
            Value::Number(2.0),
            Value::Null,
            Value::from("a"),
            Value::Number(-1.0),
        ];
        values.sort_by(|a, b| a.cmp_total(b));
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Number(-1.0),
                Value::Number(2.0),
                Value::from("a"),
                Value::from("b"),
            ]
        );
    }

    #[test]
    fn test_nested_lookup() {
        let v = Value::from(json!({"metadata": {"name": "cart", "namespace": ""}}));
        assert_eq!(v.str_at(&["metadata", "name"]), Some("cart"));
        assert_eq!(v.str_at(&["metadata", "namespace"]), None);
        assert!(v.get_path(&["spec", "replicas"]).is_none());
    }
}
