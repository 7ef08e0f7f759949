//! Recoverability policy: decides what happens after a failed delivery.
//!
//! A delivery moves through
//! `Received -> ImmediateRetry(n) -> DelayedRetry(m) -> {Succeeded | DeadLettered}`.
//! Immediate retries re-invoke the handlers straight away; delayed retries
//! wait for an exponential backoff first. When both budgets are spent the
//! message is forwarded to the error queue with failure metadata.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use missive_core::{headers, RawMessage, SerializationError};
use rand::Rng;

use crate::config::{BackoffSettings, RecoverabilitySettings};
use crate::error::HandlerError;

// ---------------------------------------------------------------------------
// FailureInfo
// ---------------------------------------------------------------------------

/// Summary of why the latest attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub kind: &'static str,
    pub summary: String,
    pub retryable: bool,
}

impl FailureInfo {
    #[must_use]
    pub fn from_handler(handler: &str, err: &HandlerError) -> Self {
        Self {
            kind: err.kind(),
            summary: format!("handler `{handler}` failed: {err}"),
            retryable: err.is_retryable(),
        }
    }

    /// Undecodable messages never become decodable; always final.
    #[must_use]
    pub fn from_serialization(err: &SerializationError) -> Self {
        Self {
            kind: "serialization",
            summary: err.to_string(),
            retryable: false,
        }
    }

    #[must_use]
    pub fn unrouted(full_name: &str) -> Self {
        Self {
            kind: "unrouted",
            summary: format!("no handler accepts message type `{full_name}`"),
            retryable: false,
        }
    }
}

// ---------------------------------------------------------------------------
// DeliveryAttempt
// ---------------------------------------------------------------------------

/// Where a delivery is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    ImmediateRetry(u32),
    DelayedRetry(u32),
    Succeeded,
    DeadLettered,
}

/// Retry bookkeeping for one message, owned by the task processing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub message_id: String,
    pub immediate_retries: u32,
    pub delayed_retries: u32,
    /// Unix millis of the first receipt.
    pub first_seen_ms: u64,
    /// Handler invocation rounds run by this process for the message.
    pub handling_attempts: u32,
    pub state: DeliveryState,
    pub last_failure: Option<FailureInfo>,
}

impl DeliveryAttempt {
    /// A fresh delivery with empty retry budgets.
    #[must_use]
    pub fn new(message_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            message_id: message_id.into(),
            immediate_retries: 0,
            delayed_retries: 0,
            first_seen_ms: now_ms,
            handling_attempts: 0,
            state: DeliveryState::Received,
            last_failure: None,
        }
    }

    /// Starts a delivery, continuing the retry counters stamped on a requeued
    /// copy. A message without retry headers is a fresh attempt.
    #[must_use]
    pub fn from_headers(raw: &RawMessage, now_ms: u64) -> Self {
        let counter = |key: &str| {
            raw.header_u64(key)
                .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX))
        };
        Self {
            immediate_retries: counter(headers::IMMEDIATE_RETRIES),
            delayed_retries: counter(headers::DELAYED_RETRIES),
            first_seen_ms: raw.header_u64(headers::FIRST_SEEN).unwrap_or(now_ms),
            ..Self::new(raw.message_id.clone(), now_ms)
        }
    }

    /// Headers that let a later receipt of this message resume the budget.
    #[must_use]
    pub fn retry_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (headers::IMMEDIATE_RETRIES, self.immediate_retries.to_string()),
            (headers::DELAYED_RETRIES, self.delayed_retries.to_string()),
            (headers::FIRST_SEEN, self.first_seen_ms.to_string()),
        ]
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            DeliveryState::Succeeded | DeliveryState::DeadLettered
        )
    }
}

// ---------------------------------------------------------------------------
// RecoverabilityPolicy
// ---------------------------------------------------------------------------

/// Decision taken after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverabilityAction {
    ImmediateRetry,
    DelayedRetry { delay: Duration },
    MoveToError,
}

/// Applies [`RecoverabilitySettings`] to delivery attempts.
#[derive(Debug, Clone)]
pub struct RecoverabilityPolicy {
    settings: RecoverabilitySettings,
}

impl RecoverabilityPolicy {
    /// Policy over a copy of `settings`.
    #[must_use]
    pub fn new(settings: &RecoverabilitySettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RecoverabilitySettings {
        &self.settings
    }

    /// Records a failure and decides the next step, updating the counters
    /// and state of `attempt`.
    pub fn on_failure(
        &self,
        attempt: &mut DeliveryAttempt,
        failure: FailureInfo,
    ) -> RecoverabilityAction {
        let retryable = failure.retryable;
        attempt.last_failure = Some(failure);

        if retryable && attempt.immediate_retries < self.settings.max_immediate_retries {
            attempt.immediate_retries += 1;
            attempt.state = DeliveryState::ImmediateRetry(attempt.immediate_retries);
            return RecoverabilityAction::ImmediateRetry;
        }

        if retryable
            && self.settings.delayed_retry_enabled
            && attempt.delayed_retries < self.settings.max_delayed_retries
        {
            attempt.delayed_retries += 1;
            if self.settings.reset_immediate_retries_per_delayed_round {
                attempt.immediate_retries = 0;
            }
            attempt.state = DeliveryState::DelayedRetry(attempt.delayed_retries);
            return RecoverabilityAction::DelayedRetry {
                delay: backoff_delay(attempt.delayed_retries, &self.settings.delayed_backoff),
            };
        }

        attempt.state = DeliveryState::DeadLettered;
        RecoverabilityAction::MoveToError
    }

    /// Marks the delivery handled. The caller forwards the audit copy.
    pub fn on_success(&self, attempt: &mut DeliveryAttempt) {
        attempt.state = DeliveryState::Succeeded;
    }

    /// Copy of `raw` bound for the error queue, carrying failure metadata.
    #[must_use]
    pub fn dead_letter_message(
        &self,
        raw: &RawMessage,
        attempt: &DeliveryAttempt,
        endpoint: &str,
        failed_at_ms: u64,
    ) -> RawMessage {
        let mut message = terminal_copy(raw, attempt)
            .with_header(headers::FAILED_QUEUE, endpoint)
            .with_header(headers::PROCESSING_ENDPOINT, endpoint)
            .with_header(headers::TIME_OF_FAILURE, failed_at_ms.to_string());
        if let Some(failure) = &attempt.last_failure {
            message = message
                .with_header(headers::EXCEPTION_KIND, failure.kind)
                .with_header(headers::EXCEPTION_MESSAGE, failure.summary.clone());
        }
        message
    }

    /// Copy of `raw` bound for the audit queue, carrying processing metadata.
    #[must_use]
    pub fn audit_message(
        &self,
        raw: &RawMessage,
        attempt: &DeliveryAttempt,
        endpoint: &str,
        started_ms: u64,
        ended_ms: u64,
    ) -> RawMessage {
        terminal_copy(raw, attempt)
            .with_header(headers::PROCESSING_ENDPOINT, endpoint)
            .with_header(headers::PROCESSING_STARTED, started_ms.to_string())
            .with_header(headers::PROCESSING_ENDED, ended_ms.to_string())
    }
}

/// Copy of a message whose delivery ended. Attempt counts move to the
/// informational `Delivery.*` keys so that replaying the copy starts over.
fn terminal_copy(raw: &RawMessage, attempt: &DeliveryAttempt) -> RawMessage {
    let mut copy = raw.clone();
    for key in headers::RETRY_STATE {
        copy = copy.without_header(key);
    }
    copy.with_header(
        headers::DELIVERY_IMMEDIATE_RETRIES,
        attempt.immediate_retries.to_string(),
    )
    .with_header(
        headers::DELIVERY_DELAYED_RETRIES,
        attempt.delayed_retries.to_string(),
    )
    .with_header(headers::DELIVERY_ATTEMPTS, attempt.handling_attempts.to_string())
    .with_header(headers::DELIVERY_FIRST_SEEN, attempt.first_seen_ms.to_string())
}

/// Delay before the `delayed_retry`-th delayed retry (1-indexed):
/// `min(base * 2^(n-1), max)` randomized by ±`jitter_factor`.
#[must_use]
pub fn backoff_delay(delayed_retry: u32, backoff: &BackoffSettings) -> Duration {
    let exponent = delayed_retry.saturating_sub(1);
    let delay = if exponent >= 63 {
        backoff.max_delay_ms
    } else {
        backoff
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(backoff.max_delay_ms)
    };

    if backoff.jitter_factor <= 0.0 || delay == 0 {
        return Duration::from_millis(delay);
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let jittered = {
        let range = (delay as f64) * backoff.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        ((delay as f64) + jitter).max(0.0) as u64
    };
    Duration::from_millis(jittered)
}

/// Current wall-clock time as unix millis.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;

    fn settings(immediate: u32, delayed_enabled: bool, delayed: u32) -> RecoverabilitySettings {
        RecoverabilitySettings {
            max_immediate_retries: immediate,
            delayed_retry_enabled: delayed_enabled,
            max_delayed_retries: delayed,
            delayed_backoff: BackoffSettings {
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                jitter_factor: 0.0,
            },
            ..RecoverabilitySettings::default()
        }
    }

    fn transient() -> FailureInfo {
        FailureInfo::from_handler("h", &HandlerError::transient("boom"))
    }

    /// Runs an always-failing delivery to its end, returning every action.
    fn exhaust(policy: &RecoverabilityPolicy) -> (DeliveryAttempt, Vec<RecoverabilityAction>) {
        let mut attempt = DeliveryAttempt::new("m-1", 0);
        let mut actions = Vec::new();
        loop {
            let action = policy.on_failure(&mut attempt, transient());
            actions.push(action);
            if action == RecoverabilityAction::MoveToError {
                return (attempt, actions);
            }
        }
    }

    #[test]
    fn three_immediate_retries_means_four_attempts() {
        let policy = RecoverabilityPolicy::new(&settings(3, false, 0));
        let (attempt, actions) = exhaust(&policy);

        // One initial attempt plus one per retry action.
        assert_eq!(actions.len(), 4);
        assert_eq!(
            &actions[..3],
            &[RecoverabilityAction::ImmediateRetry; 3]
        );
        assert_eq!(attempt.state, DeliveryState::DeadLettered);
        assert_eq!(attempt.immediate_retries, 3);
    }

    #[test]
    fn zero_budgets_dead_letter_after_first_attempt() {
        let policy = RecoverabilityPolicy::new(&settings(0, false, 5));
        let (attempt, actions) = exhaust(&policy);
        assert_eq!(actions, vec![RecoverabilityAction::MoveToError]);
        assert_eq!(attempt.immediate_retries, 0);
        assert_eq!(attempt.delayed_retries, 0);
    }

    #[test]
    fn delayed_retries_follow_exhausted_immediate_budget() {
        let policy = RecoverabilityPolicy::new(&settings(1, true, 2));
        let (attempt, actions) = exhaust(&policy);

        assert_eq!(
            actions,
            vec![
                RecoverabilityAction::ImmediateRetry,
                RecoverabilityAction::DelayedRetry {
                    delay: Duration::from_millis(1_000)
                },
                RecoverabilityAction::DelayedRetry {
                    delay: Duration::from_millis(2_000)
                },
                RecoverabilityAction::MoveToError,
            ]
        );
        assert_eq!(attempt.delayed_retries, 2);
    }

    #[test]
    fn reset_flag_reruns_immediate_budget_each_delayed_round() {
        let mut s = settings(2, true, 2);
        s.reset_immediate_retries_per_delayed_round = true;
        let policy = RecoverabilityPolicy::new(&s);
        let (_, actions) = exhaust(&policy);

        // (1 + 2 immediate) per round, three rounds.
        assert_eq!(actions.len(), 9);
        let delayed = actions
            .iter()
            .filter(|a| matches!(a, RecoverabilityAction::DelayedRetry { .. }))
            .count();
        assert_eq!(delayed, 2);
    }

    #[test]
    fn permanent_failure_skips_remaining_budget() {
        let policy = RecoverabilityPolicy::new(&settings(5, true, 5));
        let mut attempt = DeliveryAttempt::new("m-1", 0);
        let action = policy.on_failure(
            &mut attempt,
            FailureInfo::from_handler("h", &HandlerError::permanent("invalid order")),
        );
        assert_eq!(action, RecoverabilityAction::MoveToError);
        assert_eq!(attempt.state, DeliveryState::DeadLettered);
        assert_eq!(attempt.last_failure.unwrap().kind, "permanent");
    }

    #[test]
    fn counters_resume_from_headers() {
        let raw = RawMessage::new("m-9", BTreeMap::new(), Bytes::new())
            .with_header(headers::IMMEDIATE_RETRIES, "2")
            .with_header(headers::DELAYED_RETRIES, "1")
            .with_header(headers::FIRST_SEEN, "1234");
        let attempt = DeliveryAttempt::from_headers(&raw, 9_999);
        assert_eq!(attempt.immediate_retries, 2);
        assert_eq!(attempt.delayed_retries, 1);
        assert_eq!(attempt.first_seen_ms, 1234);
        assert_eq!(attempt.state, DeliveryState::Received);

        let fresh = DeliveryAttempt::from_headers(
            &RawMessage::new("m-10", BTreeMap::new(), Bytes::new()),
            9_999,
        );
        assert_eq!(fresh, DeliveryAttempt::new("m-10", 9_999));
    }

    #[test]
    fn dead_letter_copy_keeps_original_and_adds_failure_metadata() {
        let policy = RecoverabilityPolicy::new(&settings(0, false, 0));
        let raw = RawMessage::new("m-1", BTreeMap::new(), Bytes::from_static(b"{\"a\":1}"))
            .with_header("Custom", "kept");
        let mut attempt = DeliveryAttempt::new("m-1", 100);
        policy.on_failure(&mut attempt, transient());

        let copy = policy.dead_letter_message(&raw, &attempt, "Divergent.Customers", 200);
        assert_eq!(copy.body, raw.body);
        assert_eq!(copy.message_id, "m-1");
        assert_eq!(copy.header("Custom"), Some("kept"));
        assert_eq!(copy.header(headers::FAILED_QUEUE), Some("Divergent.Customers"));
        assert_eq!(copy.header(headers::EXCEPTION_KIND), Some("transient"));
        assert_eq!(copy.header(headers::EXCEPTION_MESSAGE), Some("handler `h` failed: boom"));
        assert_eq!(copy.header(headers::TIME_OF_FAILURE), Some("200"));
        assert_eq!(copy.header(headers::DELIVERY_FIRST_SEEN), Some("100"));
        assert_eq!(copy.header(headers::DELIVERY_IMMEDIATE_RETRIES), Some("0"));
    }

    #[test]
    fn replayed_dead_letter_copy_is_a_fresh_delivery() {
        let policy = RecoverabilityPolicy::new(&settings(3, false, 0));
        // Requeued once before it was dead-lettered.
        let raw = RawMessage::new("m-1", BTreeMap::new(), Bytes::new())
            .with_header(headers::IMMEDIATE_RETRIES, "2")
            .with_header(headers::FIRST_SEEN, "100");
        let mut attempt = DeliveryAttempt::from_headers(&raw, 500);
        attempt.handling_attempts = 2;
        while policy.on_failure(&mut attempt, transient()) != RecoverabilityAction::MoveToError {
            attempt.handling_attempts += 1;
        }

        let copy = policy.dead_letter_message(&raw, &attempt, "Divergent.Customers", 900);
        for key in headers::RETRY_STATE {
            assert_eq!(copy.header(key), None, "{key} must not survive dead-lettering");
        }
        assert_eq!(copy.header(headers::DELIVERY_IMMEDIATE_RETRIES), Some("3"));
        assert_eq!(copy.header(headers::DELIVERY_ATTEMPTS), Some("3"));
        assert_eq!(copy.header(headers::DELIVERY_FIRST_SEEN), Some("100"));

        let replay = DeliveryAttempt::from_headers(&copy, 1_000);
        assert_eq!(replay, DeliveryAttempt::new("m-1", 1_000));
    }

    #[test]
    fn audit_copy_carries_processing_window() {
        let policy = RecoverabilityPolicy::new(&settings(0, false, 0));
        let raw = RawMessage::new("m-1", BTreeMap::new(), Bytes::new());
        let attempt = DeliveryAttempt::new("m-1", 100);

        let copy = policy.audit_message(&raw, &attempt, "Divergent.Customers", 150, 175);
        assert_eq!(copy.header(headers::PROCESSING_ENDPOINT), Some("Divergent.Customers"));
        assert_eq!(copy.header(headers::PROCESSING_STARTED), Some("150"));
        assert_eq!(copy.header(headers::PROCESSING_ENDED), Some("175"));
        assert!(copy.header(headers::EXCEPTION_MESSAGE).is_none());
        assert!(copy.header(headers::IMMEDIATE_RETRIES).is_none());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = BackoffSettings {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter_factor: 0.0,
        };
        let delays: Vec<u64> = (1..=5)
            .map(|n| u64::try_from(backoff_delay(n, &backoff).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
        assert_eq!(backoff_delay(200, &backoff), Duration::from_millis(5_000));
    }

    proptest! {
        #[test]
        fn jittered_backoff_stays_within_bounds(n in 1u32..20, jitter in 0.0f64..=1.0) {
            let backoff = BackoffSettings {
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                jitter_factor: jitter,
            };
            let exact = backoff_delay(
                n,
                &BackoffSettings {
                    jitter_factor: 0.0,
                    ..backoff.clone()
                },
            );
            let jittered = backoff_delay(n, &backoff);

            let exact_ms = exact.as_millis();
            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            let spread = ((exact_ms as f64) * jitter).ceil() as u128 + 1;
            prop_assert!(jittered.as_millis() + spread >= exact_ms);
            prop_assert!(jittered.as_millis() <= exact_ms + spread);
        }

        #[test]
        fn total_attempts_never_exceed_budget(
            immediate in 0u32..6,
            delayed in 0u32..4,
            enabled in any::<bool>(),
        ) {
            let policy = RecoverabilityPolicy::new(&settings(immediate, enabled, delayed));
            let (attempt, actions) = exhaust(&policy);
            let delayed_budget = if enabled { delayed } else { 0 };
            let attempts = u32::try_from(actions.len()).unwrap();
            prop_assert_eq!(attempts, 1 + immediate + delayed_budget);
            prop_assert!(attempt.is_terminal());
        }
    }
}
