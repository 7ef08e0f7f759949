//! Missive Endpoint — convention-based routing, recoverability and a
//! bounded message pump on tokio.
//!
//! An endpoint is assembled with [`EndpointBuilder`]: handlers are registered
//! against message types whose command or event category is decided by the
//! configured [`Conventions`](missive_core::Conventions), then
//! [`EndpointBuilder::start`] runs installers and starts receiving.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod logging;
pub mod middleware;
pub mod persistence;
pub mod pump;
pub mod recoverability;
pub mod routing;
pub mod runtime;
pub mod shutdown;
pub mod transport;

pub use config::{
    BackoffSettings, EndpointConfig, FanOutMode, RecoverabilitySettings, UnroutedPolicy,
};
pub use endpoint::{EndpointBuilder, RunningEndpoint};
pub use error::{ConfigurationError, EndpointError, HandlerError};
pub use handler::{handler_fn, FnHandler, HandlerContext, HandlerRef, MessageHandler};
pub use logging::{init_tracing, LogFormat};
pub use persistence::{InMemorySagaStore, SagaStore};
pub use recoverability::{
    DeliveryAttempt, DeliveryState, FailureInfo, RecoverabilityAction, RecoverabilityPolicy,
};
pub use routing::{RoutingTable, RoutingTableBuilder};
pub use runtime::{Completion, EndpointRuntime, ProcessingOutcome, Terminal};
pub use shutdown::{EndpointState, ShutdownController};
pub use transport::{Acknowledgement, InMemoryTransport, Receipt, ReceivedMessage, Transport};

pub use missive_core::{
    headers, ConventionSettings, IncomingMessage, JsonSerializer, MessageCategory,
    MessageTypeDescriptor, RawMessage, Serializer,
};
