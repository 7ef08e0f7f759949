//! Routing table: message type descriptor to the handlers that accept it.
//!
//! Registration happens on a [`RoutingTableBuilder`] during startup. `build()`
//! consumes the builder, so the resulting [`RoutingTable`] cannot be mutated
//! while messages are being processed and needs no locking.

use std::collections::HashMap;
use std::sync::Arc;

use missive_core::{Conventions, MessageCategory, MessageTypeDescriptor};

use crate::error::ConfigurationError;
use crate::handler::HandlerRef;

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Route {
    category: MessageCategory,
    handlers: Vec<HandlerRef>,
}

// ---------------------------------------------------------------------------
// RoutingTableBuilder
// ---------------------------------------------------------------------------

/// Collects handler registrations and validates them against the conventions.
pub struct RoutingTableBuilder {
    conventions: Arc<Conventions>,
    routes: HashMap<MessageTypeDescriptor, Route>,
}

impl RoutingTableBuilder {
    /// Empty builder that classifies registrations with `conventions`.
    #[must_use]
    pub fn new(conventions: Arc<Conventions>) -> Self {
        Self {
            conventions,
            routes: HashMap::new(),
        }
    }

    /// Registers a handler for a message type, inferring the category from
    /// the conventions. Returns the category the descriptor resolved to.
    ///
    /// # Errors
    ///
    /// - `AmbiguousClassification` if the type matches both a command and an
    ///   event rule.
    /// - `UnclassifiedHandlerTarget` if it matches neither.
    /// - `DuplicateCommandHandler` for a second handler of the same command.
    pub fn register(
        &mut self,
        descriptor: MessageTypeDescriptor,
        handler: HandlerRef,
    ) -> Result<MessageCategory, ConfigurationError> {
        let category = self.conventions.check(&descriptor)?;

        match category {
            MessageCategory::Unclassified => {
                return Err(ConfigurationError::UnclassifiedHandlerTarget {
                    full_name: descriptor.full_name(),
                });
            }
            MessageCategory::Command => {
                if let Some(existing) = self
                    .routes
                    .get(&descriptor)
                    .and_then(|route| route.handlers.first())
                {
                    return Err(ConfigurationError::DuplicateCommandHandler {
                        full_name: descriptor.full_name(),
                        existing: existing.name().to_string(),
                        attempted: handler.name().to_string(),
                    });
                }
            }
            MessageCategory::Event => {}
        }

        tracing::debug!(
            message_type = %descriptor,
            category = %category,
            handler = handler.name(),
            "handler registered"
        );

        self.routes
            .entry(descriptor)
            .or_insert_with(|| Route {
                category,
                handlers: Vec::new(),
            })
            .handlers
            .push(handler);

        Ok(category)
    }

    /// Registers the single handler of a command.
    ///
    /// # Errors
    ///
    /// Everything [`register`](Self::register) rejects, plus
    /// `CategoryMismatch` when the descriptor classifies as an event.
    pub fn register_command_handler(
        &mut self,
        descriptor: MessageTypeDescriptor,
        handler: HandlerRef,
    ) -> Result<(), ConfigurationError> {
        self.register_expecting(MessageCategory::Command, descriptor, handler)
    }

    /// Adds a subscriber to an event. Subscribers run in registration order.
    ///
    /// # Errors
    ///
    /// Everything [`register`](Self::register) rejects, plus
    /// `CategoryMismatch` when the descriptor classifies as a command.
    pub fn register_event_handler(
        &mut self,
        descriptor: MessageTypeDescriptor,
        handler: HandlerRef,
    ) -> Result<(), ConfigurationError> {
        self.register_expecting(MessageCategory::Event, descriptor, handler)
    }

    fn register_expecting(
        &mut self,
        expected: MessageCategory,
        descriptor: MessageTypeDescriptor,
        handler: HandlerRef,
    ) -> Result<(), ConfigurationError> {
        let actual = self.conventions.check(&descriptor)?;
        if actual.is_routable() && actual != expected {
            return Err(ConfigurationError::CategoryMismatch {
                full_name: descriptor.full_name(),
                expected,
                actual,
            });
        }
        self.register(descriptor, handler).map(|_| ())
    }

    /// Freezes the registrations.
    #[must_use]
    pub fn build(self) -> RoutingTable {
        RoutingTable {
            conventions: self.conventions,
            routes: self.routes,
        }
    }
}

// ---------------------------------------------------------------------------
// RoutingTable
// ---------------------------------------------------------------------------

/// Immutable descriptor-to-handlers lookup.
#[derive(Clone)]
pub struct RoutingTable {
    conventions: Arc<Conventions>,
    routes: HashMap<MessageTypeDescriptor, Route>,
}

impl RoutingTable {
    /// Category of a message type under the endpoint's conventions.
    #[must_use]
    pub fn classify(&self, descriptor: &MessageTypeDescriptor) -> MessageCategory {
        self.conventions.classify(descriptor)
    }

    /// Handlers for a message type in registration order. Empty when none
    /// are registered.
    #[must_use]
    pub fn resolve(&self, descriptor: &MessageTypeDescriptor) -> &[HandlerRef] {
        self.routes
            .get(descriptor)
            .map_or(&[][..], |route| route.handlers.as_slice())
    }

    /// Handler names for a message type, in invocation order.
    #[must_use]
    pub fn handler_names(&self, descriptor: &MessageTypeDescriptor) -> Vec<&str> {
        self.resolve(descriptor).iter().map(|h| h.name()).collect()
    }

    /// Registered message types with their categories.
    pub fn message_types(&self) -> impl Iterator<Item = (&MessageTypeDescriptor, MessageCategory)> {
        self.routes.iter().map(|(d, route)| (d, route.category))
    }

    /// Number of registered message types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (descriptor, route) in &self.routes {
            let names: Vec<&str> = route.handlers.iter().map(|h| h.name()).collect();
            map.entry(&descriptor.full_name(), &names);
        }
        map.finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
