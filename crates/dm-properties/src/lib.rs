#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `Properties` is a container for a set of key-value pairs attached to a
//! registered service or a service dependency filter. It's used to pass the
//! `service.id`/`service.ranking`/`objectClass`/`component.uuid` style
//! metadata the registry and the dependency manager exchange.

use std::collections::HashMap;

pub mod keys;

/// Values that can be used as the `value` field of a `Properties` map.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// A boolean value.
    Bool(bool),
    /// A u64 value.
    U64(u64),
    /// A i64 value.
    I64(i64),
    /// A f64 value.
    F64(f64),
    /// A string value.
    String(String),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::U64(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// A map of key-value pairs carried by a provided interface or matched
/// against by a service dependency's filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    values: HashMap<String, Value>,
}

impl Properties {
    /// Creates an empty property map.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets a property, overwriting any previous value under the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let _ = self.values.insert(key.into(), value.into());
        self
    }

    /// Gets a property by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Gets a property, falling back to `default` if absent or not
    /// convertible to `V`.
    pub fn get_value<V: TryFrom<Value>>(&self, key: &str, default: V) -> V {
        match self.get(key) {
            Some(v) => V::try_from(v.clone()).unwrap_or(default),
            None => default,
        }
    }

    /// Iterates over the key-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Returns the number of properties.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if there are no properties.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A generic conversion error for the `TryFrom<Value>` implementations below.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("value cannot be converted to the requested type")]
pub struct TryFromError {}

impl TryFrom<Value> for u8 {
    type Error = TryFromError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::U64(v) => u8::try_from(v).map_err(|_| TryFromError {}),
            Value::I64(v) => u8::try_from(v).map_err(|_| TryFromError {}),
            _ => Err(TryFromError {}),
        }
    }
}

impl TryFrom<Value> for u16 {
    type Error = TryFromError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::U64(v) => u16::try_from(v).map_err(|_| TryFromError {}),
            Value::I64(v) => u16::try_from(v).map_err(|_| TryFromError {}),
            _ => Err(TryFromError {}),
        }
    }
}

impl TryFrom<Value> for u32 {
    type Error = TryFromError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::U64(v) => u32::try_from(v).map_err(|_| TryFromError {}),
            Value::I64(v) => u32::try_from(v).map_err(|_| TryFromError {}),
            _ => Err(TryFromError {}),
        }
    }
}

impl TryFrom<Value> for u64 {
    type Error = TryFromError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::U64(v) => Ok(v),
            Value::I64(v) => u64::try_from(v).map_err(|_| TryFromError {}),
            _ => Err(TryFromError {}),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = TryFromError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::U64(v) => i64::try_from(v).map_err(|_| TryFromError {}),
            Value::I64(v) => Ok(v),
            _ => Err(TryFromError {}),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = TryFromError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::U64(v) => Ok(v as f64),
            Value::I64(v) => Ok(v as f64),
            Value::F64(v) => Ok(v),
            _ => Err(TryFromError {}),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = TryFromError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(v) => Ok(v),
            Value::String(v) => match v.to_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(TryFromError {}),
            },
            _ => Err(TryFromError {}),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = TryFromError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::U64(v) => Ok(v.to_string()),
            Value::I64(v) => Ok(v.to_string()),
            Value::F64(v) => Ok(v.to_string()),
            Value::Bool(v) => Ok(v.to_string()),
            Value::String(v) => Ok(v),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let mut props = Properties::new();
        props.set("key", 1u64);
        assert_eq!(props.get("key"), Some(&Value::U64(1)));
    }

    #[test]
    fn missing_key_returns_none() {
        let mut props = Properties::new();
        props.set("key", 1u64);
        assert_eq!(props.get("key2"), None);
    }

    #[test]
    fn get_value_converts_and_falls_back() {
        let mut props = Properties::new();
        props.set("ranking", 5u64);
        assert_eq!(props.get_value::<u64>("ranking", 0), 5);
        assert_eq!(props.get_value::<i64>("ranking", 0), 5);
        assert_eq!(props.get_value::<f64>("ranking", 0.0), 5.0);
        assert_eq!(props.get_value::<u64>("missing", 42), 42);

        props.set("enabled", true);
        assert_eq!(props.get_value::<bool>("enabled", false), true);

        props.set("name", "foo");
        assert_eq!(props.get_value::<String>("name", "bar".into()), "foo");
    }
}
