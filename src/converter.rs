//! Turning payloads into bytes and back.
//!
//! Clients and servers only ever talk to a [`MessageConverter`], so the wire format can be
//! swapped without touching transport code. [`JsonConverter`] is the default.
use serde_json::Value;

/// Error returned by a [`MessageConverter`].
#[derive(thiserror::Error, Debug)]
pub enum ConversionError {
    #[error("The message body is malformed")]
    MalformedMessage(#[source] anyhow::Error),
    #[error("The payload cannot be encoded")]
    Encode(#[source] anyhow::Error),
}

/// Encodes payloads for transport and decodes them on the way back.
///
/// Implementations must be pure: no side effects, same input same output.
pub trait MessageConverter: Send + Sync + 'static {
    /// The `content_type` tag attached to every message this converter produces.
    fn content_type(&self) -> &str;

    fn encode(&self, payload: &Value) -> Result<Vec<u8>, ConversionError>;

    /// Fails with [`ConversionError::MalformedMessage`] on invalid input.
    fn decode(&self, bytes: &[u8]) -> Result<Value, ConversionError>;
}

/// JSON on the wire, `application/json` as content type.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverter;

impl MessageConverter for JsonConverter {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn encode(&self, payload: &Value) -> Result<Vec<u8>, ConversionError> {
        serde_json::to_vec(payload).map_err(|e| ConversionError::Encode(e.into()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, ConversionError> {
        // An empty body carries no arguments.
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_slice(bytes).map_err(|e| ConversionError::MalformedMessage(e.into()))
    }
}
