//! Typed access to loosely typed request data.

use crate::error::{PkiError, Result};
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Bool,
    Int,
    /// Integer seconds or a humantime string such as `72h`.
    Duration,
    /// JSON array of strings, or a comma-joined string.
    CommaStringSlice,
    Map,
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldType,
}

impl Field {
    pub const fn new(name: &'static str, kind: FieldType) -> Self {
        Self { name, kind }
    }
}

/// Request data checked against a path's declared fields.
#[derive(Debug, Clone, Default)]
pub struct FieldData {
    raw: Map<String, Value>,
}

impl FieldData {
    /// Rejects unknown fields and values that cannot be coerced.
    pub fn new(raw: Map<String, Value>, schema: &[Field]) -> Result<Self> {
        for (name, value) in &raw {
            let field = schema
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| PkiError::user(format!("unknown field: {name}")))?;
            check_coercible(field, value)?;
        }
        Ok(Self { raw })
    }

    pub fn from_pairs(pairs: &[(&str, Value)], schema: &[Field]) -> Result<Self> {
        let raw = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Self::new(raw, schema)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.raw.get(name).map(|v| !v.is_null()).unwrap_or(false)
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn string(&self, name: &str) -> Result<Option<String>> {
        self.value(name).map(|v| coerce_string(name, v)).transpose()
    }

    pub fn string_or(&self, name: &str, default: &str) -> Result<String> {
        Ok(self.string(name)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn bool(&self, name: &str) -> Result<Option<bool>> {
        self.value(name).map(|v| coerce_bool(name, v)).transpose()
    }

    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        Ok(self.bool(name)?.unwrap_or(default))
    }

    pub fn int(&self, name: &str) -> Result<Option<i64>> {
        self.value(name).map(|v| coerce_int(name, v)).transpose()
    }

    pub fn duration(&self, name: &str) -> Result<Option<Duration>> {
        self.value(name).map(|v| coerce_duration(name, v)).transpose()
    }

    pub fn string_list(&self, name: &str) -> Result<Option<Vec<String>>> {
        self.value(name).map(|v| coerce_string_list(name, v)).transpose()
    }

    pub fn string_list_or_empty(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.string_list(name)?.unwrap_or_default())
    }

    fn value(&self, name: &str) -> Option<&Value> {
        self.raw.get(name).filter(|v| !v.is_null())
    }
}

fn check_coercible(field: &Field, value: &Value) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    match field.kind {
        FieldType::String => coerce_string(field.name, value).map(|_| ()),
        FieldType::Bool => coerce_bool(field.name, value).map(|_| ()),
        FieldType::Int => coerce_int(field.name, value).map(|_| ()),
        FieldType::Duration => coerce_duration(field.name, value).map(|_| ()),
        FieldType::CommaStringSlice => coerce_string_list(field.name, value).map(|_| ()),
        FieldType::Map => match value {
            Value::Object(_) => Ok(()),
            _ => Err(type_error(field.name, "map")),
        },
    }
}

fn type_error(name: &str, expected: &str) -> PkiError {
    PkiError::user(format!("error converting input for field {name:?}: expected {expected}"))
}

fn coerce_string(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(type_error(name, "string")),
    }
}

fn coerce_bool(name: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" | "1" | "t" => Ok(true),
            "false" | "0" | "f" | "" => Ok(false),
            _ => Err(type_error(name, "bool")),
        },
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(type_error(name, "bool")),
        },
        _ => Err(type_error(name, "bool")),
    }
}

fn coerce_int(name: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| type_error(name, "int")),
        Value::String(s) => s.trim().parse().map_err(|_| type_error(name, "int")),
        _ => Err(type_error(name, "int")),
    }
}

fn coerce_duration(name: &str, value: &Value) -> Result<Duration> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| type_error(name, "duration")),
        Value::String(s) => parse_duration(s)
            .map_err(|_| PkiError::user(format!("invalid duration for field {name:?}: {s}"))),
        _ => Err(type_error(name, "duration")),
    }
}

fn coerce_string_list(name: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items.iter().map(|v| coerce_string(name, v)).collect(),
        Value::String(s) => Ok(split_comma_list(s)),
        _ => Err(type_error(name, "comma-separated string or array")),
    }
}

pub fn split_comma_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Bare integers are seconds; anything else goes through humantime.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Duration::ZERO);
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| PkiError::user(format!("invalid duration {s:?}: {e}")))
}

/// Serde helper storing durations as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &[Field] = &[
        Field::new("common_name", FieldType::String),
        Field::new("ttl", FieldType::Duration),
        Field::new("exclude_cn_from_sans", FieldType::Bool),
        Field::new("alt_names", FieldType::CommaStringSlice),
        Field::new("key_bits", FieldType::Int),
    ];

    #[test]
    fn test_unknown_field_rejected() {
        let err = FieldData::from_pairs(&[("bogus", json!(1))], SCHEMA).unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_coercions() {
        let data = FieldData::from_pairs(
            &[
                ("common_name", json!("example.com")),
                ("ttl", json!("72h")),
                ("exclude_cn_from_sans", json!("true")),
                ("alt_names", json!("a.example.com, b.example.com,,")),
                ("key_bits", json!("384")),
            ],
            SCHEMA,
        )
        .unwrap();
        assert_eq!(data.string("common_name").unwrap().as_deref(), Some("example.com"));
        assert_eq!(data.duration("ttl").unwrap(), Some(Duration::from_secs(72 * 3600)));
        assert!(data.bool_or("exclude_cn_from_sans", false).unwrap());
        assert_eq!(
            data.string_list_or_empty("alt_names").unwrap(),
            vec!["a.example.com", "b.example.com"]
        );
        assert_eq!(data.int("key_bits").unwrap(), Some(384));
        assert!(!data.contains("missing"));
    }

    #[test]
    fn test_bad_values_rejected_at_entry() {
        assert!(FieldData::from_pairs(&[("ttl", json!("soon"))], SCHEMA).is_err());
        assert!(FieldData::from_pairs(&[("key_bits", json!("many"))], SCHEMA).is_err());
        assert!(FieldData::from_pairs(&[("exclude_cn_from_sans", json!("maybe"))], SCHEMA).is_err());
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
        assert!(parse_duration("-5s").is_err());
    }
}
