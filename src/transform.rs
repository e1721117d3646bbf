//! Request envelope and per-model payload rewrites applied before dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::GatewayError;

/// Decoded-size ceiling for one inline base64 image.
pub const MAX_INLINE_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// A chat-completion body owned by one inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    body: Map<String, Value>,
}

impl RequestEnvelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|_| GatewayError::BadRequest("invalid JSON body".to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, GatewayError> {
        let Value::Object(body) = value else {
            return Err(GatewayError::BadRequest(
                "request body must be a JSON object".to_string(),
            ));
        };
        if !body.get("model").is_some_and(Value::is_string) {
            return Err(GatewayError::BadRequest(
                "missing required field: model".to_string(),
            ));
        }
        Ok(Self { body })
    }

    pub fn model(&self) -> &str {
        self.body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn set_model(&mut self, upstream_model_id: &str) {
        self.body
            .insert("model".to_string(), Value::String(upstream_model_id.to_string()));
    }

    pub fn is_stream(&self) -> bool {
        self.body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn messages_mut(&mut self) -> Option<&mut Value> {
        self.body.get_mut("messages")
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.body)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("image too large: estimated {estimated_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    ImageTooLarge { estimated_bytes: u64, limit_bytes: u64 },

    #[error("unsupported image encoding: {0}")]
    UnsupportedImage(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

pub trait RequestTransform: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn apply(&self, envelope: RequestEnvelope) -> Result<RequestEnvelope, TransformError>;
}

#[derive(Debug, Default)]
pub struct Identity;

impl RequestTransform for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn apply(&self, envelope: RequestEnvelope) -> Result<RequestEnvelope, TransformError> {
        Ok(envelope)
    }
}

/// Keeps only `image_url` segments and flattens each `{url}` object into a bare
/// string, unwrapping base64 data URIs to their raw payload.
///
/// Applying it to its own output is a no-op.
#[derive(Debug)]
pub struct ImageOnly {
    max_image_bytes: u64,
}

impl Default for ImageOnly {
    fn default() -> Self {
        Self {
            max_image_bytes: MAX_INLINE_IMAGE_BYTES,
        }
    }
}

impl ImageOnly {
    pub fn with_limit(max_image_bytes: u64) -> Self {
        Self { max_image_bytes }
    }

    fn rewrite_message(&self, message: &mut Value) -> Result<(), TransformError> {
        let Some(message) = message.as_object_mut() else {
            return Err(TransformError::Malformed(
                "each message must be an object".to_string(),
            ));
        };
        // Plain string content has no segments to filter.
        let Some(Value::Array(segments)) = message.get_mut("content") else {
            return Ok(());
        };

        let mut kept = Vec::with_capacity(segments.len());
        for mut segment in segments.drain(..) {
            if segment.get("type").and_then(Value::as_str) != Some("image_url") {
                continue;
            }
            let image = segment
                .get_mut("image_url")
                .ok_or_else(|| TransformError::Malformed("image_url segment has no image_url".to_string()))?;
            let uri = match &*image {
                Value::String(uri) => uri.as_str(),
                Value::Object(fields) => fields
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        TransformError::Malformed("image_url.url must be a string".to_string())
                    })?,
                other => {
                    return Err(TransformError::UnsupportedImage(format!(
                        "image_url must be an object or string, got {}",
                        json_type(other)
                    )));
                }
            };
            let flattened = self.flatten_image_uri(uri)?;
            *image = Value::String(flattened);
            kept.push(segment);
        }
        *segments = kept;
        Ok(())
    }

    fn flatten_image_uri(&self, uri: &str) -> Result<String, TransformError> {
        if uri.starts_with("gs://") || uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(uri.to_string());
        }

        let payload = if uri.starts_with("data:") {
            match uri.split_once("base64,") {
                Some((_, payload)) => payload,
                None => return Ok(uri.to_string()),
            }
        } else {
            // Already a raw base64 payload.
            uri
        };

        let estimated_bytes = (payload.len() as f64 * 0.75) as u64;
        if estimated_bytes > self.max_image_bytes {
            return Err(TransformError::ImageTooLarge {
                estimated_bytes,
                limit_bytes: self.max_image_bytes,
            });
        }
        Ok(payload.to_string())
    }
}

impl RequestTransform for ImageOnly {
    fn name(&self) -> &'static str {
        "image-only"
    }

    fn apply(&self, mut envelope: RequestEnvelope) -> Result<RequestEnvelope, TransformError> {
        match envelope.messages_mut() {
            None => {}
            Some(Value::Array(messages)) => {
                for message in messages.iter_mut() {
                    self.rewrite_message(message)?;
                }
            }
            Some(other) => {
                return Err(TransformError::Malformed(format!(
                    "messages must be an array, got {}",
                    json_type(other)
                )));
            }
        }
        Ok(envelope)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Transform names accepted in the pool table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformKind {
    #[default]
    Identity,
    ImageOnly,
}

impl TransformKind {
    pub fn build(self) -> Arc<dyn RequestTransform> {
        match self {
            Self::Identity => Arc::new(Identity),
            Self::ImageOnly => Arc::new(ImageOnly::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformRegistry {
    by_model: HashMap<String, Arc<dyn RequestTransform>>,
    fallback: Arc<dyn RequestTransform>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self {
            by_model: HashMap::new(),
            fallback: Arc::new(Identity),
        }
    }
}

impl TransformRegistry {
    pub fn register(&mut self, model_id: impl Into<String>, transform: Arc<dyn RequestTransform>) {
        self.by_model.insert(model_id.into(), transform);
    }

    pub fn for_model(&self, model_id: &str) -> &dyn RequestTransform {
        &**self.by_model.get(model_id).unwrap_or(&self.fallback)
    }
}
