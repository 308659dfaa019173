/*!
 * Core data types for Device Connect.
 *
 * Identifiers, the loosely typed parameter value carried by request and
 * response envelopes, and the parameter map built on it.
 */
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a device/service within one plugin
///
/// Typically a hardware serial or MAC address, a vendor resource id, or a
/// composite such as `bridgeIp:lightId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a service id from a string
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the id
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty or whitespace only
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ServiceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A random unique identifier, used for client sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

/// A request/response parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Null value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
    /// Array of values
    Array(Vec<Value>),
    /// Map of string keys to values
    Object(HashMap<String, Value>),
}

impl Value {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if *f == (*f as i64) as f64 => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get a float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get an array value
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Try to get an object value
    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Numeric value, also accepting numbers sent as strings
    ///
    /// Query parameters arrive as text, so `"0.5"` is read as `0.5`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            other => other.as_float(),
        }
    }

    /// Boolean value, also accepting `"true"`/`"false"` strings
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            other => other.as_bool(),
        }
    }

    /// Convert from a JSON value
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from_json).collect()),
            serde_json::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }

    /// Convert into a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(a) => serde_json::Value::Array(a.iter().map(Value::to_json).collect()),
            Value::Object(o) => serde_json::Value::Object(
                o.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
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

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::Array(a)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(o: HashMap<String, Value>) -> Self {
        Value::Object(o)
    }
}

/// Named request parameters or response payload fields
pub type Params = HashMap<String, Value>;

/// A key-value pair of device metadata
pub type Metadata = HashMap<String, Value>;

/// Convert a JSON object into parameters; non-objects yield an empty map
pub fn params_from_json(json: serde_json::Value) -> Params {
    match Value::from_json(json) {
        Value::Object(o) => o,
        _ => Params::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id() {
        let id = ServiceId::new("192.168.0.2:1");
        assert_eq!(id.as_str(), "192.168.0.2:1");
        assert_eq!(format!("{}", id), "192.168.0.2:1");
        assert!(!id.is_empty());
        assert!(ServiceId::new("  ").is_empty());

        let id: ServiceId = "sphero-1".into();
        assert_eq!(id, ServiceId::from(String::from("sphero-1")));
    }

    #[test]
    fn test_id_creation() {
        let a = Id::new();
        let b = Id::new();
        assert_ne!(a, b);
        assert_eq!(Id::from_string("client").as_str(), "client");
    }

    #[test]
    fn test_lenient_accessors() {
        assert_eq!(Value::from("0.5").as_number(), Some(0.5));
        assert_eq!(Value::from(360).as_number(), Some(360.0));
        assert_eq!(Value::from("abc").as_number(), None);
        assert_eq!(Value::from("NaN").as_number(), None);
        assert_eq!(Value::from("TRUE").as_flag(), Some(true));
        assert_eq!(Value::from(false).as_flag(), Some(false));
        assert_eq!(Value::Null.as_flag(), None);
    }

    #[test]
    fn test_value_as_methods() {
        let v = Value::Float(3.0);
        assert_eq!(v.as_integer(), Some(3));

        let v = Value::Float(3.14);
        assert_eq!(v.as_integer(), None);
        assert_eq!(v.as_float(), Some(3.14));

        let v = Value::String("hello".to_string());
        assert_eq!(v.as_str(), Some("hello"));
        assert_eq!(v.as_bool(), None);
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"on": true, "brightness": 0.5, "ids": [1, 2], "name": "desk"});
        let params = params_from_json(json.clone());
        assert_eq!(params.get("on"), Some(&Value::Bool(true)));
        assert_eq!(params.get("brightness"), Some(&Value::Float(0.5)));
        assert_eq!(Value::Object(params).to_json(), json);

        assert!(params_from_json(serde_json::json!([1, 2])).is_empty());
    }

    #[test]
    fn test_untagged_serde() {
        let v: Value = serde_json::from_str(r#"{"a": null, "b": 1, "c": "x"}"#).unwrap();
        let o = v.as_object().unwrap();
        assert!(o["a"].is_null());
        assert_eq!(o["b"], Value::Integer(1));
        assert_eq!(o["c"].as_str(), Some("x"));
    }
}
