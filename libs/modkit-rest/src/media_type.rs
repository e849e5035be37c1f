//! Structured `Content-Type` values with wildcard compatibility.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::RestError;

/// Wildcard token for type or subtype.
pub const WILDCARD: &str = "*";

/// A media type such as `text/html; charset=UTF-8`.
///
/// Type and subtype compare case-insensitively. Parameter names are stored
/// lowercased, so they are unique regardless of the casing they arrived in;
/// parameter values are kept verbatim.
#[derive(Debug, Clone)]
pub struct MediaType {
    kind: Cow<'static, str>,
    subtype: Cow<'static, str>,
    parameters: BTreeMap<String, String>,
}

impl MediaType {
    pub const WILDCARD: MediaType = MediaType::from_static(WILDCARD, WILDCARD);
    pub const APPLICATION_JSON: MediaType = MediaType::from_static("application", "json");
    pub const APPLICATION_XML: MediaType = MediaType::from_static("application", "xml");
    pub const APPLICATION_FORM_URLENCODED: MediaType =
        MediaType::from_static("application", "x-www-form-urlencoded");
    pub const APPLICATION_OCTET_STREAM: MediaType =
        MediaType::from_static("application", "octet-stream");
    pub const MULTIPART_FORM_DATA: MediaType = MediaType::from_static("multipart", "form-data");
    pub const TEXT_PLAIN: MediaType = MediaType::from_static("text", "plain");
    pub const TEXT_HTML: MediaType = MediaType::from_static("text", "html");
    pub const TEXT_XML: MediaType = MediaType::from_static("text", "xml");

    /// Media type without parameters, usable in `const` context.
    #[must_use]
    pub const fn from_static(kind: &'static str, subtype: &'static str) -> Self {
        Self {
            kind: Cow::Borrowed(kind),
            subtype: Cow::Borrowed(subtype),
            parameters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn new(kind: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            kind: Cow::Owned(kind.into()),
            subtype: Cow::Owned(subtype.into()),
            parameters: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) a parameter. The name is matched case-insensitively.
    #[must_use]
    pub fn with_parameter(mut self, name: &str, value: impl Into<String>) -> Self {
        self.parameters
            .insert(name.trim().to_ascii_lowercase(), value.into());
        self
    }

    /// Parses a media type string.
    ///
    /// A bare token without `/` (for example `json` or `png`) is treated as a
    /// file extension and resolved through the mime table. Everything else
    /// follows the RFC 7231 grammar, quoted parameter values included.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::InvalidMediaType`] when the value does not match
    /// the grammar or is a bare token unknown to the mime table.
    pub fn parse(value: &str) -> Result<Self, RestError> {
        let invalid = || RestError::InvalidMediaType {
            value: value.to_owned(),
        };

        let trimmed = value.trim();
        if !trimmed.contains(['/', ';']) {
            return mime_for_extension(trimmed)
                .ok_or_else(invalid)
                .and_then(Self::parse);
        }

        let parsed: mime::Mime = trimmed.parse().map_err(|_| invalid())?;
        // essence keeps a structured-syntax suffix such as `+json` on the subtype
        let (kind, subtype) = parsed
            .essence_str()
            .split_once('/')
            .ok_or_else(invalid)?;

        let mut media_type = Self::new(kind, subtype);
        for (name, val) in parsed.params() {
            media_type = media_type.with_parameter(name.as_str(), unquote(val.as_str()));
        }
        Ok(media_type)
    }

    /// Media type for a file extension, `application/octet-stream` if unknown.
    #[must_use]
    pub fn for_extension(extension: &str) -> Self {
        mime_for_extension(extension)
            .and_then(|raw| Self::parse(raw).ok())
            .unwrap_or(Self::APPLICATION_OCTET_STREAM)
    }

    /// Media type for a file name, `application/octet-stream` if unknown.
    #[must_use]
    pub fn for_file_name(name: &str) -> Self {
        match name.rsplit_once('.') {
            Some((_, extension)) => Self::for_extension(extension),
            None => Self::APPLICATION_OCTET_STREAM,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Parameter value by case-insensitive name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    #[must_use]
    pub fn charset(&self) -> Option<&str> {
        self.parameter("charset")
    }

    #[must_use]
    pub fn is_wildcard_type(&self) -> bool {
        self.kind == WILDCARD
    }

    #[must_use]
    pub fn is_wildcard_subtype(&self) -> bool {
        self.subtype == WILDCARD
    }

    /// Compatibility check, commutative and parameter-agnostic.
    ///
    /// Two media types are compatible when either has a wildcard type, when
    /// they share a type and either has a wildcard subtype, or when type and
    /// subtype are equal.
    #[must_use]
    pub fn is_compatible(&self, other: &MediaType) -> bool {
        if self.is_wildcard_type() || other.is_wildcard_type() {
            return true;
        }
        if !self.kind.eq_ignore_ascii_case(&other.kind) {
            return false;
        }
        self.is_wildcard_subtype()
            || other.is_wildcard_subtype()
            || self.subtype.eq_ignore_ascii_case(&other.subtype)
    }

    /// Same type and subtype, parameters ignored.
    #[must_use]
    pub fn essence_eq(&self, other: &MediaType) -> bool {
        self.kind.eq_ignore_ascii_case(&other.kind)
            && self.subtype.eq_ignore_ascii_case(&other.subtype)
    }
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_owned(),
    }
}

fn mime_for_extension(extension: &str) -> Option<&'static str> {
    let extension = extension.trim().trim_start_matches('.');
    if extension.is_empty() {
        return None;
    }
    new_mime_guess::from_ext(extension).first_raw()
}

impl PartialEq for MediaType {
    fn eq(&self, other: &Self) -> bool {
        self.essence_eq(other) && self.parameters == other.parameters
    }
}

impl Eq for MediaType {}

impl Hash for MediaType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.to_ascii_lowercase().hash(state);
        self.subtype.to_ascii_lowercase().hash(state);
        self.parameters.hash(state);
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)?;
        for (name, value) in &self.parameters {
            write!(f, "; {name}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for MediaType {
    type Err = RestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
