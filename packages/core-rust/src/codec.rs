//! Serialization seam between raw transport bytes and typed messages.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Serialize;

use crate::descriptor::MessageTypeDescriptor;
use crate::envelope::{headers, IncomingMessage, RawMessage};

/// Errors raised while encoding or decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("message {message_id} carries no enclosed message type header")]
    MissingMessageType { message_id: String },
    #[error("unsupported content type `{actual}`, expected `{expected}`")]
    ContentType {
        expected: &'static str,
        actual: String,
    },
    #[error("malformed message body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Converts raw transport messages into typed messages and back.
///
/// The endpoint runtime never inspects body bytes itself; everything goes
/// through this trait.
pub trait Serializer: Send + Sync {
    /// MIME type written to the content type header.
    fn content_type(&self) -> &'static str;

    /// Decodes a raw message into its descriptor and body.
    ///
    /// # Errors
    ///
    /// Returns `SerializationError` for missing type information, foreign
    /// content types, or malformed bodies.
    fn deserialize(&self, raw: &RawMessage) -> Result<IncomingMessage, SerializationError>;

    /// Encodes a body for the given message type into a new raw message.
    ///
    /// # Errors
    ///
    /// Returns `SerializationError` when the body cannot be encoded.
    fn serialize(
        &self,
        descriptor: &MessageTypeDescriptor,
        body: &serde_json::Value,
    ) -> Result<RawMessage, SerializationError>;
}

/// JSON codec. The message type travels in a header, the body is plain JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const CONTENT_TYPE: &'static str = "application/json";

    /// Encodes any serializable value as a message of the given type.
    ///
    /// # Errors
    ///
    /// Returns `SerializationError::Body` if `message` fails to serialize.
    pub fn encode<T: Serialize>(
        &self,
        descriptor: &MessageTypeDescriptor,
        message: &T,
    ) -> Result<RawMessage, SerializationError> {
        self.serialize(descriptor, &serde_json::to_value(message)?)
    }
}

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn deserialize(&self, raw: &RawMessage) -> Result<IncomingMessage, SerializationError> {
        if let Some(actual) = raw.header(headers::CONTENT_TYPE) {
            if actual != Self::CONTENT_TYPE {
                return Err(SerializationError::ContentType {
                    expected: Self::CONTENT_TYPE,
                    actual: actual.to_string(),
                });
            }
        }

        let descriptor = raw
            .enclosed_type()
            .ok_or_else(|| SerializationError::MissingMessageType {
                message_id: raw.message_id.clone(),
            })?;
        let body = serde_json::from_slice(&raw.body)?;

        Ok(IncomingMessage {
            message_id: raw.message_id.clone(),
            descriptor,
            headers: raw.headers.clone(),
            body,
        })
    }

    fn serialize(
        &self,
        descriptor: &MessageTypeDescriptor,
        body: &serde_json::Value,
    ) -> Result<RawMessage, SerializationError> {
        let mut hdrs = BTreeMap::new();
        hdrs.insert(
            headers::ENCLOSED_MESSAGE_TYPE.to_string(),
            descriptor.full_name(),
        );
        hdrs.insert(headers::CONTENT_TYPE.to_string(), Self::CONTENT_TYPE.to_string());
        let bytes = serde_json::to_vec(body)?;
        Ok(RawMessage::with_random_id(hdrs, Bytes::from(bytes)))
    }
}
