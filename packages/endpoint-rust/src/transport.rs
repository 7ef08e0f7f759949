//! Transport seam: receiving, acknowledging and dispatching raw messages.
//!
//! The endpoint only talks to queues through [`Transport`]. The connection
//! string from configuration is handed to the transport unchanged.
//! [`InMemoryTransport`] keeps named queues in process memory and is used by
//! tests and the demo host.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use missive_core::RawMessage;
use parking_lot::Mutex;
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Opaque token identifying one received, not yet completed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message taken off a queue together with its receipt.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub receipt: Receipt,
    pub message: RawMessage,
}

/// How a received message is completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Processing reached a terminal state; remove the message.
    Ack,
    /// Make the message available again, stamping `retry_headers` on it.
    Requeue {
        retry_headers: Vec<(&'static str, String)>,
    },
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Queueing infrastructure used by the endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Creates the named queues if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the infrastructure rejects the request.
    async fn install(&self, queues: &[&str]) -> anyhow::Result<()>;

    /// Waits for the next message on `queue`. `Ok(None)` means the transport
    /// was closed.
    ///
    /// Must be cancellation safe: dropping the future before it resolves
    /// must not lose a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is unknown or unreachable.
    async fn receive(&self, queue: &str) -> anyhow::Result<Option<ReceivedMessage>>;

    /// Completes a received message.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown receipts or transport failures.
    async fn complete(&self, receipt: Receipt, ack: Acknowledgement) -> anyhow::Result<()>;

    /// Sends a message to a queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is unknown or unreachable.
    async fn dispatch(&self, queue: &str, message: RawMessage) -> anyhow::Result<()>;

    /// Stops handing out messages. Pending `receive` calls return `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to shut down cleanly.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<RawMessage>>,
    available: Notify,
}

impl MemoryQueue {
    fn push(&self, message: RawMessage) {
        self.messages.lock().push_back(message);
        self.available.notify_one();
    }
}

/// Process-local transport with named FIFO queues.
///
/// Queues must be created (by installers or [`create_queue`](Self::create_queue))
/// before they can be used; sending to a missing queue fails, like a broker
/// without the queue provisioned.
pub struct InMemoryTransport {
    connection: String,
    queues: DashMap<String, Arc<MemoryQueue>>,
    pending: DashMap<Receipt, (String, RawMessage)>,
    next_receipt: AtomicU64,
    acknowledged: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryTransport {
    /// Transport with no queues. `connection` is kept for diagnostics only.
    #[must_use]
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            queues: DashMap::new(),
            pending: DashMap::new(),
            next_receipt: AtomicU64::new(1),
            acknowledged: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The connection string this transport was created with.
    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection
    }

    /// Creates `name` if it does not exist yet.
    pub fn create_queue(&self, name: &str) {
        self.queues.entry(name.to_string()).or_default();
    }

    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Messages currently waiting in `queue`, oldest first.
    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<RawMessage> {
        self.queues
            .get(queue)
            .map(|q| q.messages.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes and returns everything waiting in `queue`.
    #[must_use]
    pub fn take(&self, queue: &str) -> Vec<RawMessage> {
        self.queues
            .get(queue)
            .map(|q| q.messages.lock().drain(..).collect())
            .unwrap_or_default()
    }

    /// Messages waiting in `queue`; zero for unknown queues.
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| q.messages.lock().len())
    }

    /// Received messages not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Total messages completed with [`Acknowledgement::Ack`].
    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    fn queue(&self, name: &str) -> anyhow::Result<Arc<MemoryQueue>> {
        self.queues
            .get(name)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| anyhow::anyhow!("queue `{name}` does not exist"))
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new("")
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn install(&self, queues: &[&str]) -> anyhow::Result<()> {
        for name in queues {
            self.create_queue(name);
        }
        tracing::debug!(queues = ?queues, "in-memory queues installed");
        Ok(())
    }

    async fn receive(&self, queue: &str) -> anyhow::Result<Option<ReceivedMessage>> {
        let queue_ref = self.queue(queue)?;
        loop {
            // Registered before the checks so a push or close in between
            // still wakes us.
            let notified = queue_ref.available.notified();
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            let next = queue_ref.messages.lock().pop_front();
            if let Some(message) = next {
                let receipt = Receipt::new(format!(
                    "{queue}#{}",
                    self.next_receipt.fetch_add(1, Ordering::Relaxed)
                ));
                self.pending
                    .insert(receipt.clone(), (queue.to_string(), message.clone()));
                return Ok(Some(ReceivedMessage { receipt, message }));
            }
            notified.await;
        }
    }

    async fn complete(&self, receipt: Receipt, ack: Acknowledgement) -> anyhow::Result<()> {
        let (_, (queue, mut message)) = self
            .pending
            .remove(&receipt)
            .ok_or_else(|| anyhow::anyhow!("unknown receipt `{receipt}`"))?;

        match ack {
            Acknowledgement::Ack => {
                self.acknowledged.fetch_add(1, Ordering::Relaxed);
            }
            Acknowledgement::Requeue { retry_headers } => {
                for (key, value) in retry_headers {
                    message = message.with_header(key, value);
                }
                self.queue(&queue)?.push(message);
            }
        }
        Ok(())
    }

    async fn dispatch(&self, queue: &str, message: RawMessage) -> anyhow::Result<()> {
        self.queue(queue)?.push(message);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::Release);
        for queue in &self.queues {
            queue.value().available.notify_waiters();
        }
        Ok(())
    }
}
