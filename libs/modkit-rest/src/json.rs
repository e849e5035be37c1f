//! JSON tree bodies.
//!
//! [`Json`] wraps a `serde_json::Value` so a body can be inspected as a tree
//! or converted to typed values later:
//!
//! ```ignore
//! let tree = client.get("/users").as_json()?.body()?;
//! let users: Vec<User> = tree.as_list_of()?;
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::RestError;

/// JSON tree view of a response body.
///
/// An empty or whitespace-only body parses as an empty object.
#[derive(Debug, Clone, PartialEq)]
pub struct Json {
    value: Value,
}

impl Json {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Mapping`] on malformed input.
    pub fn parse(text: &str) -> Result<Self, RestError> {
        if text.trim().is_empty() {
            return Ok(Self {
                value: Value::Object(Map::new()),
            });
        }
        Ok(Self {
            value: serde_json::from_str(text)?,
        })
    }

    /// Wraps an already parsed value.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        Self { value }
    }

    #[must_use]
    pub fn is_array(&self) -> bool {
        self.value.is_array()
    }

    /// Members of an object document, `None` for arrays and scalars.
    #[must_use]
    pub fn object(&self) -> Option<&Map<String, Value>> {
        self.value.as_object()
    }

    /// Array elements; a non-array document is returned as a single element.
    #[must_use]
    pub fn array(&self) -> Vec<Value> {
        match &self.value {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Deserializes the whole tree.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Mapping`] if the tree does not match `T`.
    pub fn as_type<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        T::deserialize(&self.value).map_err(RestError::from)
    }

    /// Deserializes every element of [`Json::array`].
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Mapping`] if any element does not match `T`.
    pub fn as_list_of<T: DeserializeOwned>(&self) -> Result<Vec<T>, RestError> {
        match &self.value {
            Value::Array(_) => self.as_type(),
            single => Ok(vec![T::deserialize(single)?]),
        }
    }

    /// # Errors
    ///
    /// Returns [`RestError::Mapping`] if the document is not an object.
    pub fn as_map(&self) -> Result<Map<String, Value>, RestError> {
        self.as_type()
    }
}

impl From<Value> for Json {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

impl fmt::Display for Json {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    #[test]
    fn test_empty_body_is_empty_object() {
        let json = Json::parse("  \n").unwrap();
        assert!(!json.is_array());
        assert!(json.object().unwrap().is_empty());
    }

    #[test]
    fn test_object_wrapped_as_single_element_array() {
        let json = Json::parse(r#"{"id":1}"#).unwrap();
        assert_eq!(json.array(), vec![json!({"id": 1})]);
        assert_eq!(json.as_list_of::<Item>().unwrap(), vec![Item { id: 1 }]);
    }

    #[test]
    fn test_array_conversions() {
        let json = Json::parse(r#"[{"id":1},{"id":2}]"#).unwrap();
        assert!(json.is_array());
        assert!(json.object().is_none());
        assert_eq!(
            json.as_list_of::<Item>().unwrap(),
            vec![Item { id: 1 }, Item { id: 2 }]
        );
        assert!(json.as_map().is_err());
    }

    #[test]
    fn test_display_is_compact_json() {
        let json = Json::from(json!({"a": [1, 2]}));
        assert_eq!(json.to_string(), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_malformed_input() {
        assert!(Json::parse("{not json").is_err());
    }
}
