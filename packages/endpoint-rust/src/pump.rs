//! Message pump: receives from the input queue and hands each message to a
//! delivery task, bounded by the runtime's worker permits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::runtime::{EndpointRuntime, PermitRequest};
use crate::shutdown::stopped;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Handle to the running receive loop.
#[derive(Debug)]
pub struct MessagePump {
    handle: JoinHandle<()>,
}

impl MessagePump {
    /// Spawns the receive loop. It runs until the runtime's shutdown
    /// controller signals a stop or the transport closes.
    #[must_use]
    pub fn start(runtime: Arc<EndpointRuntime>) -> Self {
        Self {
            handle: tokio::spawn(run(runtime)),
        }
    }

    /// Waits for the receive loop to exit. Delivery tasks it spawned may
    /// still be running; track those with the shutdown controller.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            error!(error = %err, "message pump task failed");
        }
    }
}

async fn run(runtime: Arc<EndpointRuntime>) {
    let transport = Arc::clone(runtime.transport());
    let workers = Arc::clone(runtime.workers());
    let queue = runtime.config().input_queue().to_string();
    let mut stop = runtime.shutdown().stop_receiver();
    let mut requests = runtime.take_permit_requests();
    let mut held = None;

    info!(
        queue = %queue,
        workers = runtime.config().worker_count,
        "message pump started"
    );

    loop {
        // Wait for a free worker before taking a message off the queue.
        let permit = match held.take() {
            Some(permit) => permit,
            None => tokio::select! {
                biased;
                () = stopped(&mut stop) => break,
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => break,
                },
            },
        };

        // Delayed retries waiting for a worker take precedence over new
        // messages.
        let received = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            request = next_request(&mut requests) => {
                if let Err(permit) = request.send(permit) {
                    held = Some(permit);
                } else {
                    debug!(queue = %queue, "worker handed to a delayed retry");
                }
                continue;
            }
            received = transport.receive(&queue) => received,
        };

        match received {
            Ok(Some(received)) => {
                let guard = runtime.shutdown().delivery_guard();
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move {
                    runtime.deliver(received, Some(permit), guard).await;
                });
            }
            Ok(None) => {
                info!(queue = %queue, "transport closed");
                break;
            }
            Err(err) => {
                drop(permit);
                warn!(queue = %queue, error = %format!("{err:#}"), "receive failed; backing off");
                tokio::select! {
                    biased;
                    () = stopped(&mut stop) => break,
                    () = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    info!(queue = %queue, "message pump stopped");
}

async fn next_request(requests: &mut Option<UnboundedReceiver<PermitRequest>>) -> PermitRequest {
    if let Some(rx) = requests {
        if let Some(request) = rx.recv().await {
            return request;
        }
        // Unreachable while the runtime holds the sender.
        *requests = None;
    }
    std::future::pending().await
}
