//! Endpoint lifecycle state and in-flight delivery tracking for graceful stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// Lifecycle of an endpoint: `Starting -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Installers and registration; nothing is received yet.
    Starting,
    /// The pump is receiving and processing messages.
    Running,
    /// No new messages are received; in-flight deliveries are finishing.
    Stopping,
    /// Every delivery reached a terminal state or was requeued.
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    drained: Notify,
}

/// Coordinates a graceful stop.
///
/// The pump and every delivery task hold a receiver from
/// [`stop_receiver`](Self::stop_receiver). `trigger_stop()` flips it, after
/// which `wait_for_drain()` resolves once every [`DeliveryGuard`] is dropped.
#[derive(Debug)]
pub struct ShutdownController {
    stop_signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
    state: ArcSwap<EndpointState>,
}

impl ShutdownController {
    /// Controller in the `Starting` state with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            stop_signal: tx,
            in_flight: Arc::new(InFlight::default()),
            state: ArcSwap::from_pointee(EndpointState::Starting),
        }
    }

    /// Marks the endpoint as receiving. Called once startup completes.
    pub fn set_running(&self) {
        self.state.store(Arc::new(EndpointState::Running));
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EndpointState {
        **self.state.load()
    }

    /// Receiver flipped to `true` when stopping begins.
    #[must_use]
    pub fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.stop_signal.subscribe()
    }

    /// `true` once `trigger_stop` has been called.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.stop_signal.borrow()
    }

    /// Moves to `Stopping` and signals every receiver.
    pub fn trigger_stop(&self) {
        self.state.store(Arc::new(EndpointState::Stopping));
        // send_replace updates the value even with no receivers subscribed.
        self.stop_signal.send_replace(true);
    }

    /// Tracks one delivery until the guard is dropped.
    #[must_use]
    pub fn delivery_guard(&self) -> DeliveryGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        DeliveryGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Deliveries whose guard is still alive.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no delivery is in flight, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` on a full drain; returns `false`
    /// and stays `Stopping` when the timeout expires first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drain = async {
            loop {
                let notified = self.in_flight.drained.notified();
                if self.in_flight.count.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(timeout, drain).await.is_ok() {
            self.state.store(Arc::new(EndpointState::Stopped));
            true
        } else {
            false
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `rx` observes a stop. Also resolves if the controller is gone.
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *rx.borrow_and_update();
        if stopping || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Decrements the in-flight count on drop, including during unwinding.
#[derive(Debug)]
pub struct DeliveryGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), EndpointState::Starting);

        controller.set_running();
        assert_eq!(controller.state(), EndpointState::Running);
        assert!(!controller.is_stopping());

        controller.trigger_stop();
        assert_eq!(controller.state(), EndpointState::Stopping);
        assert!(controller.is_stopping());
    }

    #[test]
    fn guards_track_in_flight_deliveries() {
        let controller = ShutdownController::new();
        let a = controller.delivery_guard();
        let b = controller.delivery_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(a);
        assert_eq!(controller.in_flight_count(), 1);
        drop(b);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn stop_receiver_observes_trigger() {
        let controller = ShutdownController::new();
        let mut rx = controller.stop_receiver();
        assert!(!*rx.borrow());

        controller.trigger_stop();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn stopped_resolves_after_trigger() {
        let controller = Arc::new(ShutdownController::new());
        let mut rx = controller.stop_receiver();

        let waiter = tokio::spawn(async move { stopped(&mut rx).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        controller.trigger_stop();
        waiter.await.unwrap();

        // Already stopped: returns straight away.
        stopped(&mut controller.stop_receiver()).await;
    }

    #[tokio::test]
    async fn drain_with_nothing_in_flight_is_immediate() {
        let controller = ShutdownController::new();
        controller.trigger_stop();
        assert!(controller.wait_for_drain(Duration::from_secs(1)).await);
        assert_eq!(controller.state(), EndpointState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_last_guard() {
        let controller = ShutdownController::new();
        let guard = controller.delivery_guard();
        controller.trigger_stop();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(5)).await);
        assert_eq!(controller.state(), EndpointState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_while_guard_is_held() {
        let controller = ShutdownController::new();
        let _guard = controller.delivery_guard();
        controller.trigger_stop();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.state(), EndpointState::Stopping);
    }
}
