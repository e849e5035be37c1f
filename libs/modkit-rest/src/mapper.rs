//! Content-type driven (de)serialization.
//!
//! An [`ObjectMapper`] converts between wire text and a [`serde_json::Value`]
//! tree; typed values go through `serde` on top of that tree, so one mapper
//! serves every `T: Serialize + DeserializeOwned`.

use std::sync::{Arc, Once};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RestError;
use crate::media_type::MediaType;

/// Serializer/deserializer bound to one or more media types.
pub trait ObjectMapper: Send + Sync {
    /// Parses wire text into a value tree.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Mapping`] when the text is not valid for this format.
    fn read_value(&self, body: &str) -> Result<Value, RestError>;

    /// Renders a value tree as wire text.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Mapping`] when the value cannot be represented.
    fn write_value(&self, value: &Value) -> Result<String, RestError>;
}

/// Deserializes `body` into `T` through `mapper`.
///
/// # Errors
///
/// Returns [`RestError::Mapping`] if parsing or conversion fails.
pub fn read_as<T: DeserializeOwned>(mapper: &dyn ObjectMapper, body: &str) -> Result<T, RestError> {
    let value = mapper.read_value(body)?;
    serde_json::from_value(value).map_err(RestError::from)
}

/// Serializes `value` through `mapper`.
///
/// # Errors
///
/// Returns [`RestError::Mapping`] if conversion or rendering fails.
pub fn write_from<T: Serialize + ?Sized>(
    mapper: &dyn ObjectMapper,
    value: &T,
) -> Result<String, RestError> {
    let tree = serde_json::to_value(value)?;
    mapper.write_value(&tree)
}

/// `application/json` mapper backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMapper;

impl ObjectMapper for JsonMapper {
    fn read_value(&self, body: &str) -> Result<Value, RestError> {
        serde_json::from_str(body).map_err(RestError::from)
    }

    fn write_value(&self, value: &Value) -> Result<String, RestError> {
        serde_json::to_string(value).map_err(RestError::from)
    }
}

/// `text/plain` mapper.
///
/// Writing renders strings verbatim and any other value through its JSON
/// form. Reading yields a JSON string, so only `String`-like targets
/// deserialize from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextPlainMapper;

impl ObjectMapper for TextPlainMapper {
    fn read_value(&self, body: &str) -> Result<Value, RestError> {
        Ok(Value::String(body.to_owned()))
    }

    fn write_value(&self, value: &Value) -> Result<String, RestError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Ok(other.to_string()),
        }
    }
}

type MapperEntry = (MediaType, Arc<dyn ObjectMapper>);

/// Media type to mapper table.
///
/// Lookup tries the exact key first, then the first registered key that is
/// compatible with the requested type, in registration order. The text/plain
/// and application/json defaults are inserted on first use, exactly once, and
/// never override a mapper registered earlier for the same key.
pub struct MapperRegistry {
    mappers: RwLock<Vec<MapperEntry>>,
    defaults: Once,
}

impl std::fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self
            .mappers
            .read()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect();
        f.debug_struct("MapperRegistry")
            .field("media_types", &keys)
            .finish_non_exhaustive()
    }
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MapperRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mappers: RwLock::new(Vec::new()),
            defaults: Once::new(),
        }
    }

    fn ensure_defaults(&self) {
        self.defaults.call_once(|| {
            let mut mappers = self.mappers.write();
            insert_if_absent(&mut mappers, MediaType::TEXT_PLAIN, Arc::new(TextPlainMapper));
            insert_if_absent(&mut mappers, MediaType::APPLICATION_JSON, Arc::new(JsonMapper));
            tracing::debug!("default object mappers registered");
        });
    }

    /// Registers `mapper` for `media_type`, replacing any mapper under the same key.
    pub fn register(&self, media_type: MediaType, mapper: Arc<dyn ObjectMapper>) {
        self.ensure_defaults();
        let mut mappers = self.mappers.write();
        if let Some(entry) = mappers.iter_mut().find(|(k, _)| *k == media_type) {
            entry.1 = mapper;
        } else {
            mappers.push((media_type, mapper));
        }
    }

    /// Resolves the mapper for `media_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::NoMapperFound`] when no registered key is equal or
    /// compatible.
    pub fn resolve(&self, media_type: &MediaType) -> Result<Arc<dyn ObjectMapper>, RestError> {
        self.ensure_defaults();
        let mappers = self.mappers.read();
        mappers
            .iter()
            .find(|(k, _)| k == media_type)
            .or_else(|| mappers.iter().find(|(k, _)| k.is_compatible(media_type)))
            .map(|(_, m)| Arc::clone(m))
            .ok_or_else(|| RestError::NoMapperFound {
                media_type: media_type.to_string(),
            })
    }

    /// Removes every mapper, defaults included.
    pub fn clear(&self) {
        self.ensure_defaults();
        self.mappers.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ensure_defaults();
        self.mappers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn insert_if_absent(mappers: &mut Vec<MapperEntry>, key: MediaType, mapper: Arc<dyn ObjectMapper>) {
    if !mappers.iter().any(|(k, _)| *k == key) {
        mappers.push((key, mapper));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct User {
        name: String,
        age: u32,
    }

    struct CountingMapper(AtomicUsize);

    impl ObjectMapper for CountingMapper {
        fn read_value(&self, body: &str) -> Result<Value, RestError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            JsonMapper.read_value(body)
        }

        fn write_value(&self, value: &Value) -> Result<String, RestError> {
            JsonMapper.write_value(value)
        }
    }

    #[test]
    fn test_defaults_registered_lazily() {
        let registry = MapperRegistry::new();
        assert_eq!(registry.len(), 2);
        assert!(registry.resolve(&MediaType::TEXT_PLAIN).is_ok());
        assert!(registry.resolve(&MediaType::APPLICATION_JSON).is_ok());
    }

    #[test]
    fn test_defaults_registered_once_under_concurrency() {
        let registry = Arc::new(MapperRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.resolve(&MediaType::APPLICATION_JSON).is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_resolve_falls_back_to_compatible_key() {
        let registry = MapperRegistry::new();
        let with_charset = MediaType::parse("application/json; charset=utf-8").unwrap();
        let mapper = registry.resolve(&with_charset).unwrap();

        let user: User = read_as(mapper.as_ref(), r#"{"name":"ann","age":3}"#).unwrap();
        assert_eq!(
            user,
            User {
                name: "ann".into(),
                age: 3
            }
        );
    }

    #[test]
    fn test_resolve_fails_without_compatible_key() {
        let registry = MapperRegistry::new();
        let err = registry
            .resolve(&MediaType::from_static("image", "png"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NoMapperFound);
        assert!(err.to_string().contains("image/png"));
    }

    #[test]
    fn test_register_replaces_default() {
        let registry = MapperRegistry::new();
        let counting = Arc::new(CountingMapper(AtomicUsize::new(0)));
        registry.register(MediaType::APPLICATION_JSON, counting.clone());

        let mapper = registry.resolve(&MediaType::APPLICATION_JSON).unwrap();
        let _: Value = read_as(mapper.as_ref(), "{}").unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_clear_removes_defaults() {
        let registry = MapperRegistry::new();
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.resolve(&MediaType::APPLICATION_JSON).is_err());
    }

    #[test]
    fn test_text_plain_mapper() {
        let text = TextPlainMapper;
        assert_eq!(write_from(&text, "hello").unwrap(), "hello");
        assert_eq!(write_from(&text, &42).unwrap(), "42");

        let s: String = read_as(&text, "hello").unwrap();
        assert_eq!(s, "hello");
        assert!(read_as::<User>(&text, "hello").is_err());
    }
}
