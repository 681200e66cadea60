//! ---
//! ems_section: "02-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Immutable value envelope and declared attribute value types."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Tagged union carried by attributes, meta items and events.
///
/// Objects keep insertion order so a value serialises back exactly as it was read.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
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

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integral view of a number, `None` for fractions and non-numbers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueType::Boolean),
            Value::Number(_) => Some(ValueType::Number),
            Value::String(_) => Some(ValueType::String),
            Value::Array(_) => Some(ValueType::Array),
            Value::Object(_) => Some(ValueType::Object),
        }
    }

    /// Text form used for placeholder substitution and converter keys.
    ///
    /// Strings render raw, integral numbers without a fraction, containers as JSON.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "null".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => self.to_json_string(),
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_owned())
    }

    /// Parse JSON text into a value.
    pub fn parse_json(text: &str) -> Option<Value> {
        serde_json::from_str(text).ok()
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(value: IndexMap<String, Value>) -> Self {
        Value::Object(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Largest magnitude an `f64` holds without losing integer precision.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            // Integral numbers become JSON integers so they read back into integer fields.
            Value::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_EXACT_INTEGER => {
                serde_json::Value::Number(serde_json::Number::from(n as i64))
            }
            Value::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, value.into()))
                    .collect(),
            ),
        }
    }
}

/// Declared type of an attribute slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl ValueType {
    /// Coerce `value` into this type, `None` when no sensible conversion exists.
    ///
    /// `Null` is accepted by every type.
    pub fn coerce(self, value: Value) -> Option<Value> {
        if value.is_null() || self == ValueType::Any {
            return Some(value);
        }
        match (self, value) {
            (ValueType::String, Value::String(s)) => Some(Value::String(s)),
            (ValueType::String, other) => Some(Value::String(other.to_display_string())),
            (ValueType::Number, Value::Number(n)) => Some(Value::Number(n)),
            (ValueType::Number, Value::Bool(b)) => Some(Value::Number(if b { 1.0 } else { 0.0 })),
            (ValueType::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(Value::Number),
            (ValueType::Boolean, Value::Bool(b)) => Some(Value::Bool(b)),
            (ValueType::Boolean, Value::Number(n)) => Some(Value::Bool(n != 0.0)),
            (ValueType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str()
            {
                "true" | "on" | "1" => Some(Value::Bool(true)),
                "false" | "off" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            (ValueType::Object, Value::Object(map)) => Some(Value::Object(map)),
            (ValueType::Object, Value::String(s)) => {
                Value::parse_json(&s).filter(|v| matches!(v, Value::Object(_)))
            }
            (ValueType::Array, Value::Array(items)) => Some(Value::Array(items)),
            (ValueType::Array, Value::String(s)) => {
                Value::parse_json(&s).filter(|v| matches!(v, Value::Array(_)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_json_shapes() {
        let value: Value =
            serde_json::from_str(r#"{"b": [1, true, null], "a": "x"}"#).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(
            object["b"],
            Value::Array(vec![Value::Number(1.0), Value::Bool(true), Value::Null])
        );
        assert_eq!(value.to_json_string(), r#"{"b":[1.0,true,null],"a":"x"}"#);
    }

    #[test]
    fn integral_numbers_convert_to_json_integers() {
        let json: serde_json::Value =
            Value::Array(vec![Value::Number(2.0), Value::Number(2.5), Value::Number(-0.0)]).into();
        assert_eq!(json.to_string(), "[2,2.5,0]");
        let index: usize = serde_json::from_value(Value::Number(4.0).into()).unwrap();
        assert_eq!(index, 4);
    }

    #[test]
    fn display_strings() {
        assert_eq!(Value::Number(21.0).to_display_string(), "21");
        assert_eq!(Value::Number(21.5).to_display_string(), "21.5");
        assert_eq!(Value::from("on").to_display_string(), "on");
        assert_eq!(Value::Null.to_display_string(), "null");
    }

    #[test]
    fn coercion_rules() {
        assert_eq!(
            ValueType::Number.coerce(Value::from(" 22.5 ")),
            Some(Value::Number(22.5))
        );
        assert_eq!(ValueType::Number.coerce(Value::from("warm")), None);
        assert_eq!(
            ValueType::Boolean.coerce(Value::from("ON")),
            Some(Value::Bool(true))
        );
        assert_eq!(
            ValueType::String.coerce(Value::Number(3.0)),
            Some(Value::from("3"))
        );
        assert_eq!(ValueType::Object.coerce(Value::from("[1]")), None);
        assert_eq!(ValueType::Number.coerce(Value::Null), Some(Value::Null));
    }

    #[test]
    fn value_type_names() {
        assert_eq!(ValueType::Boolean.to_string(), "BOOLEAN");
        assert_eq!("NUMBER".parse::<ValueType>().unwrap(), ValueType::Number);
    }
}
