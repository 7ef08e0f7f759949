//! Message handler trait and the context handed to each invocation.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use missive_core::IncomingMessage;

use crate::error::HandlerError;
use crate::persistence::SagaStore;

// ---------------------------------------------------------------------------
// MessageHandler trait
// ---------------------------------------------------------------------------

/// User code invoked for a message type.
///
/// Implementations should be idempotent: delivery is at-least-once and a
/// handler may run again for the same message after a retry or a requeue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stable identity used in logs, metrics and configuration errors.
    fn name(&self) -> &str;

    /// Handles one message.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError` to hand the delivery to the recoverability policy.
    async fn handle(&self, message: &IncomingMessage, ctx: &HandlerContext)
        -> Result<(), HandlerError>;
}

/// Shared handle to a registered handler.
pub type HandlerRef = Arc<dyn MessageHandler>;

// ---------------------------------------------------------------------------
// HandlerContext
// ---------------------------------------------------------------------------

/// Per-attempt information available to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    endpoint_name: Arc<str>,
    message_id: String,
    immediate_retries: u32,
    delayed_retries: u32,
    persistence: Arc<dyn SagaStore>,
}

impl HandlerContext {
    /// Context for one invocation; retry counts are those already spent.
    #[must_use]
    pub fn new(
        endpoint_name: Arc<str>,
        message_id: impl Into<String>,
        immediate_retries: u32,
        delayed_retries: u32,
        persistence: Arc<dyn SagaStore>,
    ) -> Self {
        Self {
            endpoint_name,
            message_id: message_id.into(),
            immediate_retries,
            delayed_retries,
            persistence,
        }
    }

    #[must_use]
    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Immediate retries already spent on this delivery.
    #[must_use]
    pub fn immediate_retries(&self) -> u32 {
        self.immediate_retries
    }

    /// Delayed retries already spent on this delivery.
    #[must_use]
    pub fn delayed_retries(&self) -> u32 {
        self.delayed_retries
    }

    /// `true` on the first invocation of a delivery.
    #[must_use]
    pub fn is_first_attempt(&self) -> bool {
        self.immediate_retries == 0 && self.delayed_retries == 0
    }

    /// Saga state store shared by all handlers of the endpoint.
    #[must_use]
    pub fn persistence(&self) -> &dyn SagaStore {
        self.persistence.as_ref()
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("endpoint_name", &self.endpoint_name)
            .field("message_id", &self.message_id)
            .field("immediate_retries", &self.immediate_retries)
            .field("delayed_retries", &self.delayed_retries)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Closure handlers
// ---------------------------------------------------------------------------

/// Handler backed by an async closure over an owned message.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wraps an async closure as a [`MessageHandler`].
///
/// Handlers that need the [`HandlerContext`] implement the trait instead.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        message: &IncomingMessage,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        (self.f)(message.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use missive_core::MessageTypeDescriptor;

    use super::*;
    use crate::persistence::InMemorySagaStore;

    fn context(immediate: u32, delayed: u32) -> HandlerContext {
        HandlerContext::new(
            Arc::from("Divergent.Customers"),
            "m-1",
            immediate,
            delayed,
            Arc::new(InMemorySagaStore::new()),
        )
    }

    fn message() -> IncomingMessage {
        IncomingMessage {
            message_id: "m-1".to_string(),
            descriptor: MessageTypeDescriptor::new("Orders.Commands", "PlaceOrderCommand"),
            headers: BTreeMap::new(),
            body: serde_json::json!({ "order_id": 1 }),
        }
    }

    #[tokio::test]
    async fn closure_handler_receives_message() {
        let handler = handler_fn("echo", |msg: IncomingMessage| async move {
            if msg.body["order_id"] == 1 {
                Ok(())
            } else {
                Err(HandlerError::permanent("unexpected body"))
            }
        });

        assert_eq!(handler.name(), "echo");
        handler.handle(&message(), &context(0, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn context_exposes_persistence() {
        let ctx = context(0, 0);
        ctx.persistence()
            .store("order-1", serde_json::json!({ "placed": true }))
            .await
            .unwrap();
        assert_eq!(
            ctx.persistence().load("order-1").await.unwrap(),
            Some(serde_json::json!({ "placed": true }))
        );
    }

    #[test]
    fn first_attempt_detection() {
        assert!(context(0, 0).is_first_attempt());
        assert!(!context(1, 0).is_first_attempt());
        assert!(!context(0, 2).is_first_attempt());
        assert_eq!(context(3, 2).message_id(), "m-1");
    }
}
