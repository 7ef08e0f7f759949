//! Transport-level message envelope and well-known header names.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::descriptor::MessageTypeDescriptor;

/// Well-known header keys.
pub mod headers {
    pub const MESSAGE_ID: &str = "Missive.MessageId";
    pub const CORRELATION_ID: &str = "Missive.CorrelationId";
    pub const ENCLOSED_MESSAGE_TYPE: &str = "Missive.EnclosedMessageType";
    pub const CONTENT_TYPE: &str = "Missive.ContentType";
    pub const ORIGINATING_ENDPOINT: &str = "Missive.OriginatingEndpoint";

    // Delivery metadata added on audit.
    pub const PROCESSING_ENDPOINT: &str = "Missive.ProcessingEndpoint";
    pub const PROCESSING_STARTED: &str = "Missive.ProcessingStarted";
    pub const PROCESSING_ENDED: &str = "Missive.ProcessingEnded";

    // Retry bookkeeping carried across requeues of an unfinished delivery.
    pub const IMMEDIATE_RETRIES: &str = "Missive.Retries.Immediate";
    pub const DELAYED_RETRIES: &str = "Missive.Retries.Delayed";
    pub const FIRST_SEEN: &str = "Missive.Retries.FirstSeen";

    /// Keys a receiving endpoint resumes a delivery from.
    pub const RETRY_STATE: [&str; 3] = [IMMEDIATE_RETRIES, DELAYED_RETRIES, FIRST_SEEN];

    // Attempt counts reported on audit and error copies. Informational only.
    pub const DELIVERY_IMMEDIATE_RETRIES: &str = "Missive.Delivery.ImmediateRetries";
    pub const DELIVERY_DELAYED_RETRIES: &str = "Missive.Delivery.DelayedRetries";
    pub const DELIVERY_ATTEMPTS: &str = "Missive.Delivery.Attempts";
    pub const DELIVERY_FIRST_SEEN: &str = "Missive.Delivery.FirstSeen";

    // Failure metadata added on dead-lettering.
    pub const FAILED_QUEUE: &str = "Missive.FailedQ";
    pub const EXCEPTION_MESSAGE: &str = "Missive.ExceptionInfo.Message";
    pub const EXCEPTION_KIND: &str = "Missive.ExceptionInfo.Kind";
    pub const TIME_OF_FAILURE: &str = "Missive.TimeOfFailure";
}

/// A message as the transport sees it: headers plus opaque body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RawMessage {
    /// Creates a raw message. The id is mirrored into the headers.
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        mut headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> Self {
        let message_id = message_id.into();
        headers.insert(headers::MESSAGE_ID.to_string(), message_id.clone());
        Self {
            message_id,
            headers,
            body,
        }
    }

    /// Creates a raw message with a fresh random id.
    #[must_use]
    pub fn with_random_id(headers: BTreeMap<String, String>, body: Bytes) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), headers, body)
    }

    /// Looks up a header value.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Parses a numeric header, treating absent or malformed values as `None`.
    #[must_use]
    pub fn header_u64(&self, key: &str) -> Option<u64> {
        self.header(key).and_then(|v| v.parse().ok())
    }

    /// Sets a header, returning the message.
    #[must_use]
    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    /// Removes a header, returning the message.
    #[must_use]
    pub fn without_header(mut self, key: &str) -> Self {
        self.headers.remove(key);
        self
    }

    /// The message type named in the headers, if any.
    #[must_use]
    pub fn enclosed_type(&self) -> Option<MessageTypeDescriptor> {
        self.header(headers::ENCLOSED_MESSAGE_TYPE)
            .filter(|v| !v.is_empty())
            .map(MessageTypeDescriptor::parse)
    }
}

/// A deserialized inbound message handed to handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub message_id: String,
    pub descriptor: MessageTypeDescriptor,
    pub headers: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

impl IncomingMessage {
    /// Deserializes the body into a concrete message type.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the body does not match `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }

    /// Looks up a header value.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The correlation id header, falling back to the message id.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        self.header(headers::CORRELATION_ID).unwrap_or(&self.message_id)
    }
}
