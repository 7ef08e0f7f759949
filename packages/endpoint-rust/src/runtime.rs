//! Endpoint runtime: takes one received message to a terminal state.
//!
//! Per message: deserialize, classify, resolve handlers, invoke them through
//! the handler pipeline, apply the recoverability policy, then either forward
//! to audit/error and acknowledge, or requeue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures_util::future::join_all;
use missive_core::{
    IncomingMessage, MessageCategory, MessageTypeDescriptor, RawMessage, Serializer,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::config::{EndpointConfig, FanOutMode, UnroutedPolicy};
use crate::handler::{HandlerContext, HandlerRef};
use crate::middleware::{build_handler_pipeline, HandlerInvocation, HandlerPipeline};
use crate::persistence::SagaStore;
use crate::recoverability::{
    unix_millis, DeliveryAttempt, FailureInfo, RecoverabilityAction, RecoverabilityPolicy,
};
use crate::routing::RoutingTable;
use crate::shutdown::{stopped, DeliveryGuard, ShutdownController};
use crate::transport::{Acknowledgement, Receipt, ReceivedMessage, Transport};

pub const MESSAGES_TOTAL: &str = "missive_messages_total";
pub const RETRIES_TOTAL: &str = "missive_retries_total";

/// Pause before requeueing a message whose audit or error copy could not be
/// forwarded.
pub const FORWARD_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Asks the pump to hand over the permit it holds while waiting to receive.
pub(crate) type PermitRequest = oneshot::Sender<OwnedSemaphorePermit>;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Handled; forwarded to audit when auditing is enabled.
    Succeeded,
    /// Forwarded to the error queue.
    DeadLettered,
    /// Unrouted and dropped under `UnroutedPolicy::Acknowledge`.
    Discarded,
}

impl Terminal {
    /// Label used for the `outcome` metric.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::DeadLettered => "dead_lettered",
            Self::Discarded => "discarded",
        }
    }
}

/// Result of one delivery round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Completed(Terminal),
    /// A delayed retry is due after the given backoff.
    RetryAfter(Duration),
}

/// How a received message was handed back to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Acknowledged(Terminal),
    Requeued,
}

/// External services the runtime talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub serializer: Arc<dyn Serializer>,
    pub persistence: Arc<dyn SagaStore>,
}

// ---------------------------------------------------------------------------
// EndpointRuntime
// ---------------------------------------------------------------------------

/// Processes received messages against the routing table and the
/// recoverability policy. Shared by the pump and its delivery tasks.
pub struct EndpointRuntime {
    config: Arc<EndpointConfig>,
    endpoint_name: Arc<str>,
    routing: Arc<RoutingTable>,
    policy: RecoverabilityPolicy,
    collaborators: Collaborators,
    pipeline: HandlerPipeline,
    workers: Arc<Semaphore>,
    permit_requests: mpsc::UnboundedSender<PermitRequest>,
    permit_requests_rx: Mutex<Option<mpsc::UnboundedReceiver<PermitRequest>>>,
    shutdown: Arc<ShutdownController>,
}

impl EndpointRuntime {
    /// Wires the pipeline and sizes the worker pool from `config`.
    #[must_use]
    pub fn new(
        config: Arc<EndpointConfig>,
        routing: RoutingTable,
        collaborators: Collaborators,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        let (permit_requests, permit_requests_rx) = mpsc::unbounded_channel();
        Self {
            endpoint_name: Arc::from(config.endpoint_name.as_str()),
            policy: RecoverabilityPolicy::new(&config.recoverability),
            workers: Arc::new(Semaphore::new(config.worker_count as usize)),
            routing: Arc::new(routing),
            pipeline: build_handler_pipeline(),
            permit_requests,
            permit_requests_rx: Mutex::new(Some(permit_requests_rx)),
            config,
            collaborators,
            shutdown,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// The frozen routing table.
    #[must_use]
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.collaborators.transport
    }

    /// Stop signal and in-flight tracking shared with the pump.
    #[must_use]
    pub fn shutdown(&self) -> &Arc<ShutdownController> {
        &self.shutdown
    }

    /// Worker permits. A delivery holds one while its handlers run.
    #[must_use]
    pub fn workers(&self) -> &Arc<Semaphore> {
        &self.workers
    }

    /// Receiving end of permit requests from delayed retries. Only the first
    /// caller gets it.
    pub(crate) fn take_permit_requests(&self) -> Option<mpsc::UnboundedReceiver<PermitRequest>> {
        self.permit_requests_rx.lock().take()
    }

    /// Acquires a worker permit for a delayed round. A pump parked in
    /// `receive` holds a permit, so it is asked to hand it over as well.
    async fn acquire_worker(&self) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() {
            return Some(permit);
        }
        let (tx, rx) = oneshot::channel();
        // No pump is running when the receiver is gone.
        let _ = self.permit_requests.send(tx);
        tokio::select! {
            Ok(permit) = rx => Some(permit),
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
        }
    }

    /// Takes a received message to a terminal state, waiting out delayed
    /// retries, and completes it with the transport.
    pub async fn on_message_received(&self, received: ReceivedMessage) -> Completion {
        let guard = self.shutdown.delivery_guard();
        self.deliver(received, None, guard).await
    }

    pub(crate) async fn deliver(
        &self,
        received: ReceivedMessage,
        mut permit: Option<OwnedSemaphorePermit>,
        _guard: DeliveryGuard,
    ) -> Completion {
        let ReceivedMessage { receipt, message } = received;
        let mut attempt = DeliveryAttempt::from_headers(&message, unix_millis());
        let mut stop = self.shutdown.stop_receiver();

        loop {
            let held = match permit.take() {
                Some(held) => held,
                None => match self.acquire_worker().await {
                    Some(held) => held,
                    None => return self.requeue(receipt, &attempt).await,
                },
            };
            let outcome = self.process(&message, &mut attempt).await;
            drop(held);

            match outcome {
                Ok(ProcessingOutcome::Completed(terminal)) => {
                    self.finish(receipt, Acknowledgement::Ack).await;
                    return Completion::Acknowledged(terminal);
                }
                Ok(ProcessingOutcome::RetryAfter(delay)) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = stopped(&mut stop) => {
                            info!(
                                message_id = %attempt.message_id,
                                delayed_retries = attempt.delayed_retries,
                                "stopping; releasing delayed retry to the transport"
                            );
                            return self.requeue(receipt, &attempt).await;
                        }
                    }
                }
                Err(err) => {
                    error!(
                        message_id = %attempt.message_id,
                        error = %format!("{err:#}"),
                        "forwarding failed; message will be redelivered"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(FORWARD_FAILURE_BACKOFF) => {}
                        () = stopped(&mut stop) => {}
                    }
                    return self.requeue(receipt, &attempt).await;
                }
            }
        }
    }

    /// Runs one delivery round: the initial or delayed attempt plus its
    /// immediate retries.
    ///
    /// # Errors
    ///
    /// Returns an error only when forwarding to the audit or error queue
    /// fails. The caller should requeue the message.
    pub async fn process(
        &self,
        raw: &RawMessage,
        attempt: &mut DeliveryAttempt,
    ) -> anyhow::Result<ProcessingOutcome> {
        let started_ms = unix_millis();

        let message = match self.collaborators.serializer.deserialize(raw) {
            Ok(message) => Arc::new(message),
            Err(err) => {
                warn!(
                    message_id = %raw.message_id,
                    error = %err,
                    "message could not be deserialized"
                );
                self.policy
                    .on_failure(attempt, FailureInfo::from_serialization(&err));
                return self.dead_letter(raw, attempt).await;
            }
        };

        let handlers = self.routing.resolve(&message.descriptor);
        if handlers.is_empty() {
            return self.unrouted(raw, attempt, &message.descriptor).await;
        }

        loop {
            attempt.handling_attempts += 1;
            let failure = match self.invoke_handlers(handlers, &message, attempt).await {
                Ok(()) => {
                    self.policy.on_success(attempt);
                    return self.audit(raw, attempt, started_ms).await;
                }
                Err(failure) => failure,
            };

            match self.policy.on_failure(attempt, failure) {
                RecoverabilityAction::ImmediateRetry => {
                    metrics::counter!(RETRIES_TOTAL, "kind" => "immediate").increment(1);
                    debug!(
                        message_id = %attempt.message_id,
                        immediate_retries = attempt.immediate_retries,
                        "immediate retry"
                    );
                }
                RecoverabilityAction::DelayedRetry { delay } => {
                    metrics::counter!(RETRIES_TOTAL, "kind" => "delayed").increment(1);
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = delay.as_millis() as u64;
                    warn!(
                        message_id = %attempt.message_id,
                        delayed_retries = attempt.delayed_retries,
                        delay_ms,
                        "immediate retries exhausted; scheduling delayed retry"
                    );
                    return Ok(ProcessingOutcome::RetryAfter(delay));
                }
                RecoverabilityAction::MoveToError => return self.dead_letter(raw, attempt).await,
            }
        }
    }

    async fn invoke_handlers(
        &self,
        handlers: &[HandlerRef],
        message: &Arc<IncomingMessage>,
        attempt: &DeliveryAttempt,
    ) -> Result<(), FailureInfo> {
        let ctx = HandlerContext::new(
            Arc::clone(&self.endpoint_name),
            message.message_id.clone(),
            attempt.immediate_retries,
            attempt.delayed_retries,
            Arc::clone(&self.collaborators.persistence),
        );

        match self.config.fan_out {
            FanOutMode::Sequential => {
                for handler in handlers {
                    self.invoke(handler, message, &ctx).await?;
                }
                Ok(())
            }
            FanOutMode::Concurrent => join_all(
                handlers
                    .iter()
                    .map(|handler| self.invoke(handler, message, &ctx)),
            )
            .await
            .into_iter()
            .collect(),
        }
    }

    async fn invoke(
        &self,
        handler: &HandlerRef,
        message: &Arc<IncomingMessage>,
        ctx: &HandlerContext,
    ) -> Result<(), FailureInfo> {
        let invocation = HandlerInvocation {
            handler: Arc::clone(handler),
            message: Arc::clone(message),
            context: ctx.clone(),
            timeout_ms: self.config.handler_timeout_ms,
        };
        self.pipeline
            .clone()
            .oneshot(invocation)
            .await
            .map_err(|err| FailureInfo::from_handler(handler.name(), &err))
    }

    async fn unrouted(
        &self,
        raw: &RawMessage,
        attempt: &mut DeliveryAttempt,
        descriptor: &MessageTypeDescriptor,
    ) -> anyhow::Result<ProcessingOutcome> {
        let category = self.routing.classify(descriptor);
        if category == MessageCategory::Unclassified {
            warn!(
                message_id = %raw.message_id,
                message_type = %descriptor,
                "message type matches no convention"
            );
        } else {
            warn!(
                message_id = %raw.message_id,
                message_type = %descriptor,
                category = %category,
                "no handler registered for message type"
            );
        }

        match self.config.unrouted_policy {
            UnroutedPolicy::Acknowledge => {
                record_terminal(Terminal::Discarded);
                Ok(ProcessingOutcome::Completed(Terminal::Discarded))
            }
            UnroutedPolicy::MoveToError => {
                self.policy
                    .on_failure(attempt, FailureInfo::unrouted(&descriptor.full_name()));
                self.dead_letter(raw, attempt).await
            }
        }
    }

    async fn audit(
        &self,
        raw: &RawMessage,
        attempt: &DeliveryAttempt,
        started_ms: u64,
    ) -> anyhow::Result<ProcessingOutcome> {
        let settings = self.policy.settings();
        if settings.audit_enabled {
            let copy = self.policy.audit_message(
                raw,
                attempt,
                &self.endpoint_name,
                started_ms,
                unix_millis(),
            );
            self.collaborators
                .transport
                .dispatch(&settings.audit_queue, copy)
                .await
                .with_context(|| format!("forwarding to audit queue `{}`", settings.audit_queue))?;
        }

        debug!(
            message_id = %attempt.message_id,
            attempts = attempt.handling_attempts,
            "message handled"
        );
        record_terminal(Terminal::Succeeded);
        Ok(ProcessingOutcome::Completed(Terminal::Succeeded))
    }

    async fn dead_letter(
        &self,
        raw: &RawMessage,
        attempt: &DeliveryAttempt,
    ) -> anyhow::Result<ProcessingOutcome> {
        let error_queue = &self.policy.settings().error_queue;
        let copy = self
            .policy
            .dead_letter_message(raw, attempt, &self.endpoint_name, unix_millis());
        self.collaborators
            .transport
            .dispatch(error_queue, copy)
            .await
            .with_context(|| format!("forwarding to error queue `{error_queue}`"))?;

        error!(
            message_id = %attempt.message_id,
            immediate_retries = attempt.immediate_retries,
            delayed_retries = attempt.delayed_retries,
            failure = attempt.last_failure.as_ref().map_or("", |f| f.summary.as_str()),
            error_queue = %error_queue,
            "message moved to error queue"
        );
        record_terminal(Terminal::DeadLettered);
        Ok(ProcessingOutcome::Completed(Terminal::DeadLettered))
    }

    async fn requeue(&self, receipt: Receipt, attempt: &DeliveryAttempt) -> Completion {
        metrics::counter!(MESSAGES_TOTAL, "outcome" => "requeued").increment(1);
        self.finish(
            receipt,
            Acknowledgement::Requeue {
                retry_headers: attempt.retry_headers(),
            },
        )
        .await;
        Completion::Requeued
    }

    async fn finish(&self, receipt: Receipt, ack: Acknowledgement) {
        if let Err(err) = self
            .collaborators
            .transport
            .complete(receipt.clone(), ack)
            .await
        {
            error!(
                receipt = %receipt,
                error = %format!("{err:#}"),
                "transport failed to complete message"
            );
        }
    }
}

fn record_terminal(terminal: Terminal) {
    metrics::counter!(MESSAGES_TOTAL, "outcome" => terminal.as_str()).increment(1);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use missive_core::{headers, ConventionSettings, Conventions, JsonSerializer};

    use super::*;
    use crate::config::RecoverabilitySettings;
    use crate::error::HandlerError;
    use crate::handler::handler_fn;
    use crate::persistence::InMemorySagaStore;
    use crate::routing::RoutingTableBuilder;
    use crate::transport::InMemoryTransport;

    const INPUT: &str = "Orders";

    fn place_order() -> MessageTypeDescriptor {
        MessageTypeDescriptor::new("Orders.Commands", "PlaceOrderCommand")
    }

    fn order_placed() -> MessageTypeDescriptor {
        MessageTypeDescriptor::new("Orders.Events", "OrderPlacedEvent")
    }

    fn config(immediate: u32) -> EndpointConfig {
        EndpointConfig {
            recoverability: RecoverabilitySettings {
                max_immediate_retries: immediate,
                delayed_retry_enabled: false,
                ..RecoverabilitySettings::default()
            },
            ..EndpointConfig::named(INPUT)
        }
    }

    /// Handler that fails its first `failures` calls and counts every call.
    fn flaky(name: &str, failures: u32, calls: &Arc<AtomicU32>) -> HandlerRef {
        let calls = Arc::clone(calls);
        Arc::new(handler_fn(name, move |_msg: IncomingMessage| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(HandlerError::transient(format!("failure {}", n + 1)))
                } else {
                    Ok(())
                }
            }
        }))
    }

    struct Harness {
        runtime: EndpointRuntime,
        transport: Arc<InMemoryTransport>,
    }

    async fn harness(
        config: EndpointConfig,
        register: impl FnOnce(&mut RoutingTableBuilder),
    ) -> Harness {
        let transport = Arc::new(InMemoryTransport::default());
        transport.install(&[INPUT, "error", "audit"]).await.unwrap();

        let conventions = Conventions::from_settings(&ConventionSettings::default()).unwrap();
        let mut routing = RoutingTableBuilder::new(Arc::new(conventions));
        register(&mut routing);

        let runtime = EndpointRuntime::new(
            Arc::new(config),
            routing.build(),
            Collaborators {
                transport: transport.clone(),
                serializer: Arc::new(JsonSerializer),
                persistence: Arc::new(InMemorySagaStore::new()),
            },
            Arc::new(ShutdownController::new()),
        );
        Harness { runtime, transport }
    }

    fn raw(descriptor: &MessageTypeDescriptor) -> RawMessage {
        JsonSerializer
            .serialize(descriptor, &serde_json::json!({ "order_id": 42 }))
            .unwrap()
    }

    #[tokio::test]
    async fn always_failing_handler_runs_one_plus_immediate_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(config(3), |r| {
            r.register(place_order(), flaky("place", u32::MAX, &calls)).unwrap();
        })
        .await;

        let message = raw(&place_order());
        let mut attempt = DeliveryAttempt::new(&message.message_id, 0);
        let outcome = h.runtime.process(&message, &mut attempt).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::Completed(Terminal::DeadLettered));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(attempt.handling_attempts, 4);

        let errors = h.transport.take("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].body, message.body);
        assert_eq!(errors[0].header(headers::DELIVERY_IMMEDIATE_RETRIES), Some("3"));
        assert!(h.transport.messages("audit").is_empty());
    }

    #[tokio::test]
    async fn recovery_after_two_failures_audits_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(config(2), |r| {
            r.register(place_order(), flaky("place", 2, &calls)).unwrap();
        })
        .await;

        let message = raw(&place_order());
        let mut attempt = DeliveryAttempt::new(&message.message_id, 0);
        let outcome = h.runtime.process(&message, &mut attempt).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::Completed(Terminal::Succeeded));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.transport.queue_len("audit"), 1);
        assert_eq!(h.transport.queue_len("error"), 0);
    }

    #[tokio::test]
    async fn delayed_retry_is_returned_to_the_caller() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut cfg = config(1);
        cfg.recoverability.delayed_retry_enabled = true;
        cfg.recoverability.max_delayed_retries = 1;
        cfg.recoverability.delayed_backoff.jitter_factor = 0.0;
        cfg.recoverability.delayed_backoff.base_delay_ms = 500;
        let h = harness(cfg, |r| {
            r.register(place_order(), flaky("place", u32::MAX, &calls)).unwrap();
        })
        .await;

        let message = raw(&place_order());
        let mut attempt = DeliveryAttempt::new(&message.message_id, 0);

        let first = h.runtime.process(&message, &mut attempt).await.unwrap();
        assert_eq!(first, ProcessingOutcome::RetryAfter(Duration::from_millis(500)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Immediate budget stays spent, so the delayed round is one call.
        let second = h.runtime.process(&message, &mut attempt).await.unwrap();
        assert_eq!(second, ProcessingOutcome::Completed(Terminal::DeadLettered));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sequential_fan_out_stops_at_first_failure() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let third = Arc::new(AtomicU32::new(0));
        let h = harness(config(0), |r| {
            r.register(order_placed(), flaky("billing", 0, &first)).unwrap();
            r.register(order_placed(), flaky("shipping", u32::MAX, &second)).unwrap();
            r.register(order_placed(), flaky("crm", 0, &third)).unwrap();
        })
        .await;

        let message = raw(&order_placed());
        let mut attempt = DeliveryAttempt::new(&message.message_id, 0);
        let outcome = h.runtime.process(&message, &mut attempt).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::Completed(Terminal::DeadLettered));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
        let dead = h.transport.take("error");
        assert!(dead[0]
            .header(headers::EXCEPTION_MESSAGE)
            .unwrap()
            .contains("shipping"));
    }

    #[tokio::test]
    async fn concurrent_fan_out_runs_every_handler() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let mut cfg = config(1);
        cfg.fan_out = FanOutMode::Concurrent;
        let h = harness(cfg, |r| {
            r.register(order_placed(), flaky("billing", 0, &first)).unwrap();
            r.register(order_placed(), flaky("shipping", 1, &second)).unwrap();
        })
        .await;

        let message = raw(&order_placed());
        let mut attempt = DeliveryAttempt::new(&message.message_id, 0);
        let outcome = h.runtime.process(&message, &mut attempt).await.unwrap();

        // The whole fan-out re-runs on retry.
        assert_eq!(outcome, ProcessingOutcome::Completed(Terminal::Succeeded));
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn undecodable_message_is_dead_lettered_without_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(config(5), |r| {
            r.register(place_order(), flaky("place", 0, &calls)).unwrap();
        })
        .await;

        let mut message = raw(&place_order());
        message.body = bytes::Bytes::from_static(b"{broken");
        let mut attempt = DeliveryAttempt::new(&message.message_id, 0);
        let outcome = h.runtime.process(&message, &mut attempt).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::Completed(Terminal::DeadLettered));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let dead = h.transport.take("error");
        assert_eq!(dead[0].header(headers::EXCEPTION_KIND), Some("serialization"));
    }

    #[tokio::test]
    async fn unrouted_message_follows_policy() {
        let h = harness(config(0), |_| {}).await;
        let message = raw(&MessageTypeDescriptor::new("Orders.Utils", "Helper"));
        let mut attempt = DeliveryAttempt::new(&message.message_id, 0);
        let outcome = h.runtime.process(&message, &mut attempt).await.unwrap();
        assert_eq!(outcome, ProcessingOutcome::Completed(Terminal::DeadLettered));
        assert_eq!(
            h.transport.take("error")[0].header(headers::EXCEPTION_KIND),
            Some("unrouted")
        );

        let mut cfg = config(0);
        cfg.unrouted_policy = UnroutedPolicy::Acknowledge;
        let h = harness(cfg, |_| {}).await;
        let mut attempt = DeliveryAttempt::new(&message.message_id, 0);
        let outcome = h.runtime.process(&message, &mut attempt).await.unwrap();
        assert_eq!(outcome, ProcessingOutcome::Completed(Terminal::Discarded));
        assert_eq!(h.transport.queue_len("error"), 0);
    }

    #[tokio::test]
    async fn audit_can_be_disabled() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut cfg = config(0);
        cfg.recoverability.audit_enabled = false;
        let h = harness(cfg, |r| {
            r.register(place_order(), flaky("place", 0, &calls)).unwrap();
        })
        .await;

        let message = raw(&place_order());
        let mut attempt = DeliveryAttempt::new(&message.message_id, 0);
        let outcome = h.runtime.process(&message, &mut attempt).await.unwrap();
        assert_eq!(outcome, ProcessingOutcome::Completed(Terminal::Succeeded));
        assert_eq!(h.transport.queue_len("audit"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_forward_requeues_instead_of_acknowledging() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut cfg = config(0);
        cfg.recoverability.audit_queue = "missing-audit".to_string();
        let h = harness(cfg, |r| {
            r.register(place_order(), flaky("place", 0, &calls)).unwrap();
        })
        .await;

        h.transport.dispatch(INPUT, raw(&place_order())).await.unwrap();
        let received = h.transport.receive(INPUT).await.unwrap().unwrap();
        let started = tokio::time::Instant::now();
        let completion = h.runtime.on_message_received(received).await;

        assert_eq!(completion, Completion::Requeued);
        assert!(started.elapsed() >= FORWARD_FAILURE_BACKOFF);
        assert_eq!(h.transport.acknowledged(), 0);
        assert_eq!(h.transport.queue_len(INPUT), 1);
    }

    #[tokio::test]
    async fn received_message_is_acknowledged_after_terminal_state() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(config(1), |r| {
            r.register(place_order(), flaky("place", 1, &calls)).unwrap();
        })
        .await;

        h.transport.dispatch(INPUT, raw(&place_order())).await.unwrap();
        let received = h.transport.receive(INPUT).await.unwrap().unwrap();
        let completion = h.runtime.on_message_received(received).await;

        assert_eq!(completion, Completion::Acknowledged(Terminal::Succeeded));
        assert_eq!(h.transport.acknowledged(), 1);
        assert_eq!(h.transport.in_flight(), 0);
        assert_eq!(h.runtime.shutdown().in_flight_count(), 0);
    }
}
