//! Payload codec for the producer -> broker -> worker boundary.
//!
//! The broker transports envelopes as JSON, so image bytes are encoded as
//! base64 text. Decoding is deliberately dual-path: a producer running in a
//! different runtime context may hand the broker a raw buffer that its client
//! library serializes as a tagged structural form (`{"type": "Buffer",
//! "data": [..]}`) instead of base64 text. Both forms must reconstruct the
//! exact original byte sequence.

use base64::Engine;
use serde_json::{json, Value};

/// The unit of work carried by a job envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPayload {
    pub image_bytes: Vec<u8>,
    pub mime_type: String,
    pub original_file_name: String,
    pub user_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload corrupt: {0}")]
    PayloadCorrupt(String),
}

/// Serialize a payload into its JSON wire form.
pub fn encode(payload: &JobPayload) -> Value {
    json!({
        "image": base64::engine::general_purpose::STANDARD.encode(&payload.image_bytes),
        "mime_type": payload.mime_type,
        "original_file_name": payload.original_file_name,
        "user_id": payload.user_id,
    })
}

/// Reconstruct a payload from its wire form, byte-exact.
pub fn decode(wire: &Value) -> Result<JobPayload, CodecError> {
    let obj = wire
        .as_object()
        .ok_or_else(|| CodecError::PayloadCorrupt("wire form is not an object".into()))?;

    let image_bytes = decode_image_field(
        obj.get("image")
            .ok_or_else(|| CodecError::PayloadCorrupt("missing image field".into()))?,
    )?;

    let mime_type = require_str(obj.get("mime_type"), "mime_type")?;
    let original_file_name = require_str(obj.get("original_file_name"), "original_file_name")?;

    let user_id = match obj.get("user_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(CodecError::PayloadCorrupt(format!(
                "user_id is not a string: {other}"
            )))
        }
    };

    Ok(JobPayload {
        image_bytes,
        mime_type,
        original_file_name,
        user_id,
    })
}

/// Dual-path byte decoding: native base64 text, or the tagged
/// array-of-bytes form a foreign producer's client library emits.
fn decode_image_field(value: &Value) -> Result<Vec<u8>, CodecError> {
    match value {
        Value::String(b64) => base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| CodecError::PayloadCorrupt(format!("invalid base64 image: {e}"))),
        Value::Object(map) => {
            let tag = map.get("type").and_then(Value::as_str);
            if tag != Some("Buffer") {
                return Err(CodecError::PayloadCorrupt(
                    "tagged image form has no Buffer tag".into(),
                ));
            }
            let data = map
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| CodecError::PayloadCorrupt("tagged image form has no data array".into()))?;
            data.iter()
                .map(|v| {
                    v.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or_else(|| {
                            CodecError::PayloadCorrupt(format!("byte out of range: {v}"))
                        })
                })
                .collect()
        }
        other => Err(CodecError::PayloadCorrupt(format!(
            "image is neither base64 text nor a tagged byte array: {}",
            kind_of(other)
        ))),
    }
}

fn require_str(value: Option<&Value>, field: &str) -> Result<String, CodecError> {
    value
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| CodecError::PayloadCorrupt(format!("missing or non-string {field}")))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
