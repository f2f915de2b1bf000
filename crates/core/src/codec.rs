//! Property blob encoding.

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::properties::PropertiesMap;

/// Encodes and decodes property maps to and from their stored blob form.
pub trait PropertyCodec: Send + Sync {
    fn encode(&self, properties: &PropertiesMap) -> Result<String>;

    fn decode(&self, blob: &str) -> Result<PropertiesMap>;

    /// Decodes an optional blob. Missing blobs decode to an empty map.
    fn decode_optional(&self, blob: Option<&str>) -> Result<PropertiesMap> {
        match blob {
            Some(blob) => self.decode(blob),
            None => Ok(PropertiesMap::new()),
        }
    }
}

/// JSON object codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PropertyCodec for JsonCodec {
    fn encode(&self, properties: &PropertiesMap) -> Result<String> {
        Ok(serde_json::to_string(properties)?)
    }

    fn decode(&self, blob: &str) -> Result<PropertiesMap> {
        if blob.trim().is_empty() {
            return Ok(PropertiesMap::new());
        }

        match serde_json::from_str::<Value>(blob)? {
            Value::Object(map) => Ok(map),
            Value::Null => {
                debug!("Null property blob decoded as an empty map");
                Ok(PropertiesMap::new())
            }
            other => Err(Error::malformed(format!(
                "expected a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
