//! Endpoint assembly: configuration, handler registration, start and stop.

use std::sync::Arc;
use std::time::Duration;

use missive_core::{
    Conventions, JsonSerializer, MessageCategory, MessageTypeDescriptor, RawMessage, Serializer,
};
use tracing::{info, warn};

use crate::config::EndpointConfig;
use crate::error::{ConfigurationError, EndpointError};
use crate::handler::{HandlerRef, MessageHandler};
use crate::persistence::{InMemorySagaStore, SagaStore};
use crate::pump::MessagePump;
use crate::routing::RoutingTableBuilder;
use crate::runtime::{Collaborators, EndpointRuntime};
use crate::shutdown::{EndpointState, ShutdownController};
use crate::transport::{InMemoryTransport, Transport};

// ---------------------------------------------------------------------------
// EndpointBuilder
// ---------------------------------------------------------------------------

/// Collects configuration, collaborators and handlers before start.
///
/// Handlers can only be registered here; a started endpoint has a frozen
/// routing table.
pub struct EndpointBuilder {
    config: EndpointConfig,
    routing: RoutingTableBuilder,
    transport: Option<Arc<dyn Transport>>,
    serializer: Arc<dyn Serializer>,
    persistence: Arc<dyn SagaStore>,
}

impl std::fmt::Debug for EndpointBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EndpointBuilder {
    /// Validates the configuration and builds the conventions.
    ///
    /// Defaults: an [`InMemoryTransport`] over the configured connection
    /// string, [`JsonSerializer`] and [`InMemorySagaStore`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for invalid settings or conventions.
    pub fn new(config: EndpointConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let conventions = Conventions::from_settings(&config.conventions)?;
        Ok(Self {
            routing: RoutingTableBuilder::new(Arc::new(conventions)),
            config,
            transport: None,
            serializer: Arc::new(JsonSerializer),
            persistence: Arc::new(InMemorySagaStore::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Replaces the transport built from the connection string.
    pub fn with_transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the default JSON serializer.
    pub fn with_serializer(&mut self, serializer: Arc<dyn Serializer>) -> &mut Self {
        self.serializer = serializer;
        self
    }

    /// Replaces the default in-memory saga store.
    pub fn with_persistence(&mut self, persistence: Arc<dyn SagaStore>) -> &mut Self {
        self.persistence = persistence;
        self
    }

    /// Registers the handler of a command.
    ///
    /// # Errors
    ///
    /// See [`RoutingTableBuilder::register_command_handler`].
    pub fn register_command_handler<H>(
        &mut self,
        descriptor: MessageTypeDescriptor,
        handler: H,
    ) -> Result<&mut Self, ConfigurationError>
    where
        H: MessageHandler + 'static,
    {
        self.routing
            .register_command_handler(descriptor, Arc::new(handler))?;
        Ok(self)
    }

    /// Adds a subscriber to an event.
    ///
    /// # Errors
    ///
    /// See [`RoutingTableBuilder::register_event_handler`].
    pub fn register_event_handler<H>(
        &mut self,
        descriptor: MessageTypeDescriptor,
        handler: H,
    ) -> Result<&mut Self, ConfigurationError>
    where
        H: MessageHandler + 'static,
    {
        self.routing
            .register_event_handler(descriptor, Arc::new(handler))?;
        Ok(self)
    }

    /// Registers a handler, inferring command or event from the conventions.
    ///
    /// # Errors
    ///
    /// See [`RoutingTableBuilder::register`].
    pub fn register_handler(
        &mut self,
        descriptor: MessageTypeDescriptor,
        handler: HandlerRef,
    ) -> Result<MessageCategory, ConfigurationError> {
        self.routing.register(descriptor, handler)
    }

    /// Runs installers and starts the message pump.
    ///
    /// # Errors
    ///
    /// Returns `EndpointError::Installation` when queue creation fails.
    pub async fn start(self) -> Result<RunningEndpoint, EndpointError> {
        let config = Arc::new(self.config);
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(InMemoryTransport::new(config.transport_connection.clone())),
        };

        if config.enable_installers {
            let recoverability = &config.recoverability;
            let mut queues = vec![config.input_queue(), recoverability.error_queue.as_str()];
            if recoverability.audit_enabled {
                queues.push(recoverability.audit_queue.as_str());
            }
            transport
                .install(&queues)
                .await
                .map_err(EndpointError::Installation)?;
            info!(queues = ?queues, "installers ran");
        }

        let routing = self.routing.build();
        for (descriptor, category) in routing.message_types() {
            info!(
                message_type = %descriptor,
                category = %category,
                handlers = ?routing.handler_names(descriptor),
                "route registered"
            );
        }

        let shutdown = Arc::new(ShutdownController::new());
        let runtime = Arc::new(EndpointRuntime::new(
            Arc::clone(&config),
            routing,
            Collaborators {
                transport,
                serializer: self.serializer,
                persistence: self.persistence,
            },
            Arc::clone(&shutdown),
        ));

        let pump = MessagePump::start(Arc::clone(&runtime));
        shutdown.set_running();
        info!(
            endpoint = %config.endpoint_name,
            workers = config.worker_count,
            "endpoint started"
        );

        Ok(RunningEndpoint { runtime, pump })
    }
}

// ---------------------------------------------------------------------------
// RunningEndpoint
// ---------------------------------------------------------------------------

/// A started endpoint. Dropping it without `stop()` leaves the pump running
/// until the tokio runtime shuts down.
pub struct RunningEndpoint {
    runtime: Arc<EndpointRuntime>,
    pump: MessagePump,
}

impl RunningEndpoint {
    /// Runtime shared with the pump, for inspection.
    #[must_use]
    pub fn runtime(&self) -> &Arc<EndpointRuntime> {
        &self.runtime
    }

    #[must_use]
    pub fn state(&self) -> EndpointState {
        self.runtime.shutdown().state()
    }

    /// Puts a message on this endpoint's own input queue.
    ///
    /// # Errors
    ///
    /// Returns the transport's dispatch error.
    pub async fn send_local(&self, message: RawMessage) -> anyhow::Result<()> {
        let queue = self.runtime.config().input_queue();
        self.runtime.transport().dispatch(queue, message).await
    }

    /// Stops receiving, lets in-flight deliveries finish (parked delayed
    /// retries are requeued), then closes the transport.
    ///
    /// Returns `true` if every delivery finished within `shutdown_grace_ms`.
    ///
    /// # Errors
    ///
    /// Returns `EndpointError::Transport` if closing the transport fails.
    pub async fn stop(self) -> Result<bool, EndpointError> {
        let shutdown = Arc::clone(self.runtime.shutdown());
        info!(endpoint = %self.runtime.config().endpoint_name, "stopping endpoint");

        shutdown.trigger_stop();
        self.pump.join().await;

        let grace = Duration::from_millis(self.runtime.config().shutdown_grace_ms);
        let drained = shutdown.wait_for_drain(grace).await;
        if !drained {
            warn!(
                in_flight = shutdown.in_flight_count(),
                grace_ms = self.runtime.config().shutdown_grace_ms,
                "grace period elapsed with deliveries in flight"
            );
        }

        self.runtime
            .transport()
            .close()
            .await
            .map_err(EndpointError::Transport)?;
        info!(drained, "endpoint stopped");
        Ok(drained)
    }
}
