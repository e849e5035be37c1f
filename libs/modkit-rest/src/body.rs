//! Request body encoders.
//!
//! Every body turns into an [`Entity`]: the bytes to put on the wire plus the
//! content type the body itself dictates, if any. Form and multipart bodies
//! own their `Content-Type` ([`Body::implies_content_type`]); raw bodies rely
//! on whatever the caller set.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::Value;

use crate::error::RestError;
use crate::media_type::MediaType;

pub(crate) const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const TEXT_PART_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";
const BOUNDARY_LEN: usize = 30;

/// Encoded request entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Request body.
#[derive(Debug)]
pub enum Body {
    Raw(RawBody),
    Form(FormBody),
    Multipart(MultipartBody),
}

impl Body {
    /// `true` when the body dictates its own `Content-Type`.
    #[must_use]
    pub fn implies_content_type(&self) -> bool {
        match self {
            Self::Raw(_) => false,
            Self::Form(_) | Self::Multipart(_) => true,
        }
    }

    /// Encodes the body into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::BodyEncode`] or [`RestError::Io`] when a form
    /// cannot be encoded or a multipart file or stream cannot be read.
    pub fn into_entity(self) -> Result<Entity, RestError> {
        match self {
            Self::Raw(raw) => Ok(raw.into_entity()),
            Self::Form(form) => form.into_entity(),
            Self::Multipart(multipart) => multipart.into_entity(),
        }
    }
}

impl From<RawBody> for Body {
    fn from(value: RawBody) -> Self {
        Self::Raw(value)
    }
}

impl From<FormBody> for Body {
    fn from(value: FormBody) -> Self {
        Self::Form(value)
    }
}

impl From<MultipartBody> for Body {
    fn from(value: MultipartBody) -> Self {
        Self::Multipart(value)
    }
}

/// Fixed bytes sent as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBody {
    bytes: Bytes,
}

impl RawBody {
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    fn into_entity(self) -> Entity {
        Entity {
            content_type: None,
            bytes: self.bytes,
        }
    }
}

/// Scalar form field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormValue(String);

impl FormValue {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FormValue {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for FormValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&String> for FormValue {
    fn from(value: &String) -> Self {
        Self(value.clone())
    }
}

impl<T: Into<FormValue>> From<Option<T>> for FormValue {
    fn from(value: Option<T>) -> Self {
        value.map_or_else(|| Self(String::new()), Into::into)
    }
}

macro_rules! form_value_from_display {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for FormValue {
            fn from(value: $ty) -> Self {
                Self(value.to_string())
            }
        })*
    };
}

form_value_from_display!(bool, char, i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

/// `application/x-www-form-urlencoded` body.
///
/// Fields are emitted sorted by name; repeated values of one name keep their
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormBody {
    fields: BTreeMap<String, Vec<String>>,
}

impl FormBody {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one value under `name`.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FormValue>) -> Self {
        self.push(name.into(), value.into());
        self
    }

    /// Appends every value under `name`.
    #[must_use]
    pub fn field_values<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FormValue>,
    {
        let name = name.into();
        for value in values {
            self.push(name.clone(), value.into());
        }
        self
    }

    pub(crate) fn push(&mut self, name: String, value: FormValue) {
        self.fields.entry(name).or_default().push(value.0);
    }

    /// Adds every member of a JSON object.
    ///
    /// Scalars become one value, arrays of scalars become repeated values,
    /// `null` becomes an empty value.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::InvalidFormValue`] when `fields` is not an object
    /// or a member is a nested object or array.
    pub fn fields_json(mut self, fields: &Value) -> Result<Self, RestError> {
        let Value::Object(map) = fields else {
            return Err(RestError::InvalidFormValue {
                name: String::new(),
                reason: "form fields must be a JSON object".to_owned(),
            });
        };
        for (name, value) in map {
            match value {
                Value::Array(items) => {
                    for item in items {
                        let scalar = scalar_to_form_value(name, item)?;
                        self.push(name.clone(), scalar);
                    }
                }
                other => {
                    let scalar = scalar_to_form_value(name, other)?;
                    self.push(name.clone(), scalar);
                }
            }
        }
        Ok(self)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// URL-encoded form, for example `x=X&y=Y&z=Z`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::BodyEncode`] if encoding fails.
    pub fn encode(&self) -> Result<String, RestError> {
        let pairs: Vec<(&str, &str)> = self
            .fields
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
            .collect();
        Ok(serde_urlencoded::to_string(pairs)?)
    }

    fn into_entity(self) -> Result<Entity, RestError> {
        Ok(Entity {
            content_type: Some(FORM_CONTENT_TYPE.to_owned()),
            bytes: Bytes::from(self.encode()?),
        })
    }
}

fn scalar_to_form_value(name: &str, value: &Value) -> Result<FormValue, RestError> {
    match value {
        Value::Null => Ok(FormValue(String::new())),
        Value::Bool(b) => Ok(FormValue::from(*b)),
        Value::Number(n) => Ok(FormValue(n.to_string())),
        Value::String(s) => Ok(FormValue(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(RestError::InvalidFormValue {
            name: name.to_owned(),
            reason: "only scalar values are supported".to_owned(),
        }),
    }
}

/// Content of one multipart part.
pub enum PartContent {
    Text(String),
    File(PathBuf),
    Stream(Box<dyn Read + Send>),
    Bytes(Bytes),
}

impl fmt::Debug for PartContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
        }
    }
}

/// One named part of a multipart body.
#[derive(Debug)]
pub struct Part {
    name: String,
    content: PartContent,
    content_type: String,
    filename: Option<String>,
}

impl Part {
    /// Inline text, `text/plain; charset=UTF-8` unless overridden.
    #[must_use]
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: PartContent::Text(value.into()),
            content_type: TEXT_PART_CONTENT_TYPE.to_owned(),
            filename: None,
        }
    }

    /// File contents; type inferred from the extension, file name taken from the path.
    #[must_use]
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let content_type = path
            .extension()
            .map_or(MediaType::APPLICATION_OCTET_STREAM, |ext| {
                MediaType::for_extension(&ext.to_string_lossy())
            })
            .to_string();
        Self {
            name: name.into(),
            content: PartContent::File(path),
            content_type,
            filename,
        }
    }

    /// Reader drained at encode time, sent as `application/octet-stream`.
    #[must_use]
    pub fn stream(
        name: impl Into<String>,
        reader: impl Read + Send + 'static,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            content: PartContent::Stream(Box::new(reader)),
            content_type: MediaType::APPLICATION_OCTET_STREAM.to_string(),
            filename: Some(filename.into()),
        }
    }

    /// Raw bytes, sent as `application/octet-stream`.
    #[must_use]
    pub fn bytes(
        name: impl Into<String>,
        bytes: impl Into<Bytes>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            content: PartContent::Bytes(bytes.into()),
            content_type: MediaType::APPLICATION_OCTET_STREAM.to_string(),
            filename: Some(filename.into()),
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    fn read_content(self) -> Result<Bytes, RestError> {
        match self.content {
            PartContent::Text(text) => Ok(Bytes::from(text)),
            PartContent::Bytes(bytes) => Ok(bytes),
            PartContent::File(path) => Ok(Bytes::from(std::fs::read(&path)?)),
            PartContent::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// `multipart/form-data` body. Parts are written in insertion order.
#[derive(Debug, Default)]
pub struct MultipartBody {
    parts: Vec<Part>,
    boundary: Option<String>,
}

impl MultipartBody {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub(crate) fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    /// Fixes the boundary instead of generating a random one.
    #[must_use]
    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }

    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    fn into_entity(self) -> Result<Entity, RestError> {
        let boundary = self.boundary.unwrap_or_else(generate_boundary);
        let mut out = BytesMut::new();

        for part in self.parts {
            out.put_slice(b"--");
            out.put_slice(boundary.as_bytes());
            out.put_slice(b"\r\n");

            let mut disposition = format!(
                "Content-Disposition: form-data; name=\"{}\"",
                escape_quoted(&part.name)
            );
            if let Some(filename) = &part.filename {
                disposition.push_str("; filename=\"");
                disposition.push_str(&escape_quoted(filename));
                disposition.push('"');
            }
            out.put_slice(disposition.as_bytes());
            out.put_slice(b"\r\nContent-Type: ");
            out.put_slice(part.content_type.as_bytes());
            out.put_slice(b"\r\n\r\n");
            out.put_slice(&part.read_content()?);
            out.put_slice(b"\r\n");
        }

        out.put_slice(b"--");
        out.put_slice(boundary.as_bytes());
        out.put_slice(b"--\r\n");

        Ok(Entity {
            content_type: Some(format!("multipart/form-data; boundary={boundary}")),
            bytes: out.freeze(),
        })
    }
}

fn generate_boundary() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(BOUNDARY_LEN)
        .map(char::from)
        .collect()
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
