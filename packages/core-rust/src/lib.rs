//! Missive Core — message type descriptors, naming conventions, envelopes and codecs.

pub mod codec;
pub mod convention;
pub mod descriptor;
pub mod envelope;

pub use codec::{JsonSerializer, SerializationError, Serializer};
pub use convention::{
    AmbiguousClassification, ClassificationRule, ConventionError, ConventionSettings,
    Conventions, PatternRuleSettings,
};
pub use descriptor::{MessageCategory, MessageTypeDescriptor};
pub use envelope::{headers, IncomingMessage, RawMessage};

