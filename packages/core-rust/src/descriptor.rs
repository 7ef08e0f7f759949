//! Message type identity and the category derived from it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a message type by its namespace and short name.
///
/// An empty namespace is normalized to `None` so that "no namespace" has a
/// single representation. Descriptors are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageTypeDescriptor {
    namespace: Option<String>,
    name: String,
}

impl MessageTypeDescriptor {
    /// Creates a descriptor from a namespace and short name.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: (!namespace.is_empty()).then_some(namespace),
            name: name.into(),
        }
    }

    /// Creates a descriptor for a type declared outside any namespace.
    #[must_use]
    pub fn without_namespace(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Splits a namespace-qualified name on its last `.`.
    ///
    /// `"Orders.Commands.PlaceOrderCommand"` yields namespace
    /// `"Orders.Commands"` and name `"PlaceOrderCommand"`. A name with no dot
    /// has no namespace.
    #[must_use]
    pub fn parse(full_name: &str) -> Self {
        match full_name.rsplit_once('.') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::without_namespace(full_name),
        }
    }

    /// The namespace, if the type has one.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The short type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace-qualified name used on the wire and in diagnostics.
    #[must_use]
    pub fn full_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MessageTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Category of a message type, derived from conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageCategory {
    /// An instruction to perform an action. Exactly one handler.
    Command,
    /// A fact that occurred. Zero or more handlers.
    Event,
    /// Matched no convention. Cannot be routed.
    Unclassified,
}

impl MessageCategory {
    /// Whether messages of this category may have handlers at all.
    #[must_use]
    pub const fn is_routable(self) -> bool {
        !matches!(self, Self::Unclassified)
    }

    /// Lowercase label used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_last_dot() {
        let d = MessageTypeDescriptor::parse("Orders.Commands.PlaceOrderCommand");
        assert_eq!(d.namespace(), Some("Orders.Commands"));
        assert_eq!(d.name(), "PlaceOrderCommand");
        assert_eq!(d.full_name(), "Orders.Commands.PlaceOrderCommand");
    }

    #[test]
    fn parse_without_dot_has_no_namespace() {
        let d = MessageTypeDescriptor::parse("Heartbeat");
        assert_eq!(d.namespace(), None);
        assert_eq!(d.full_name(), "Heartbeat");
    }

    #[test]
    fn empty_namespace_normalizes_to_none() {
        let d = MessageTypeDescriptor::new("", "Helper");
        assert_eq!(d, MessageTypeDescriptor::without_namespace("Helper"));
    }

    #[test]
    fn only_unclassified_is_unroutable() {
        assert!(MessageCategory::Command.is_routable());
        assert!(MessageCategory::Event.is_routable());
        assert!(!MessageCategory::Unclassified.is_routable());
    }
}
