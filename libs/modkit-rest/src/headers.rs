//! Case-insensitive header multimap shared by requests, responses and client
//! defaults.
//!
//! [`Headers`] keeps names as first written and values in arrival order,
//! which is what callers see when they inspect a response. It converts to and
//! from [`http::HeaderMap`] at the transport boundary.
//!
//! In configuration files a header maps to one value or a list:
//!
//! ```yaml
//! default_headers:
//!   Accept: application/json
//!   X-Feature: [beta, metrics]
//! ```

use std::fmt;

use http::{HeaderMap, HeaderName, HeaderValue};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::RestError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderEntry {
    name: String,
    values: Vec<String>,
}

/// Ordered, case-insensitive header multimap.
///
/// A name keeps the casing it was first inserted with; later insertions under
/// a different casing append to the same entry. Values keep insertion order
/// and duplicates, which matters for headers such as `Set-Cookie`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<HeaderEntry>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Appends a value under `name`.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(idx) => self.entries[idx].values.push(value),
            None => self.entries.push(HeaderEntry {
                name: name.trim().to_owned(),
                values: vec![value],
            }),
        }
    }

    /// Replaces every value under `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(idx) => self.entries[idx].values = vec![value],
            None => self.entries.push(HeaderEntry {
                name: name.trim().to_owned(),
                values: vec![value],
            }),
        }
    }

    #[must_use]
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|idx| self.entries[idx].values.first())
            .map(String::as_str)
    }

    /// All values for `name`, empty when the header is absent.
    #[must_use]
    pub fn get_all(&self, name: &str) -> &[String] {
        match self.position(name) {
            Some(idx) => &self.entries[idx].values,
            None => &[],
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name)
            .map(|idx| self.entries.remove(idx).values)
    }

    /// Header name as first inserted.
    #[must_use]
    pub fn original_name(&self, name: &str) -> Option<&str> {
        self.position(name)
            .map(|idx| self.entries[idx].name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.values.as_slice()))
    }

    /// Number of distinct header names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Captures every header of a wire response, duplicates included.
    #[must_use]
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map {
            headers.add(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        headers
    }

    /// Converts into a wire header map.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::InvalidHeaderName`] or [`RestError::InvalidHeaderValue`]
    /// when a name or value is not valid on the wire.
    pub fn to_header_map(&self) -> Result<HeaderMap, RestError> {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for entry in &self.entries {
            let name = HeaderName::try_from(entry.name.as_str())?;
            for value in &entry.values {
                map.append(name.clone(), HeaderValue::try_from(value.as_str())?);
            }
        }
        Ok(map)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.add(name.as_ref(), value);
        }
        headers
    }
}

impl<K: AsRef<str>, V: Into<String>> Extend<(K, V)> for Headers {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.add(name.as_ref(), value);
        }
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            match entry.values.as_slice() {
                [single] => map.serialize_entry(&entry.name, single)?,
                values => map.serialize_entry(&entry.name, values)?,
            }
        }
        map.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

struct HeadersVisitor;

impl<'de> Visitor<'de> for HeadersVisitor {
    type Value = Headers;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of header names to a value or a list of values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
        let mut headers = Headers::new();
        while let Some((name, values)) = access.next_entry::<String, OneOrMany>()? {
            match values {
                OneOrMany::One(value) => headers.add(&name, value),
                OneOrMany::Many(values) => {
                    for value in values {
                        headers.add(&name, value);
                    }
                }
            }
        }
        Ok(headers)
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(HeadersVisitor)
    }
}
