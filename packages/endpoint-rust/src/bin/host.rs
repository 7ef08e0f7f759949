//! Demo host: runs the `Divergent.Customers` endpoint on the in-memory
//! transport until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use missive_endpoint::{
    ConventionSettings, EndpointBuilder, EndpointConfig, HandlerContext, HandlerError,
    IncomingMessage, JsonSerializer, LogFormat, MessageHandler, MessageTypeDescriptor,
    RecoverabilitySettings,
};
use serde::{Deserialize, Serialize};
use tracing::info;

const COMMANDS_NAMESPACE: &str = "Divergent.Customers.Messages.Commands";
const EVENTS_NAMESPACE: &str = "Divergent.Customers.Messages.Events";

#[derive(Debug, Parser)]
#[command(name = "missive-host", about = "Runs a Missive endpoint")]
struct Args {
    /// JSON endpoint configuration. Built-in demo settings when omitted.
    #[arg(long, env = "MISSIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the endpoint (and input queue) name.
    #[arg(long, env = "MISSIVE_ENDPOINT_NAME")]
    endpoint_name: Option<String>,

    #[arg(long, env = "MISSIVE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "MISSIVE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Number of `CreateCustomerCommand` messages sent at startup.
    #[arg(long, default_value_t = 3)]
    demo_messages: u32,
}

// ---------------------------------------------------------------------------
// Demo messages and handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CreateCustomerCommand {
    customer_id: u32,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CustomerCreatedEvent {
    customer_id: u32,
}

struct CreateCustomerHandler;

#[async_trait]
impl MessageHandler for CreateCustomerHandler {
    fn name(&self) -> &str {
        "create-customer"
    }

    async fn handle(
        &self,
        message: &IncomingMessage,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let command: CreateCustomerCommand = message.body_as()?;
        let key = format!("customer/{}", command.customer_id);
        ctx.persistence()
            .store(&key, serde_json::json!({ "name": command.name }))
            .await?;
        info!(
            customer_id = command.customer_id,
            attempt = ctx.immediate_retries() + 1,
            "customer created"
        );
        Ok(())
    }
}

struct WelcomeMailHandler;

#[async_trait]
impl MessageHandler for WelcomeMailHandler {
    fn name(&self) -> &str {
        "welcome-mail"
    }

    async fn handle(
        &self,
        message: &IncomingMessage,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let event: CustomerCreatedEvent = message.body_as()?;
        info!(customer_id = event.customer_id, "welcome mail queued");
        Ok(())
    }
}

fn demo_config() -> EndpointConfig {
    EndpointConfig {
        transport_connection: "deadLetter=false;journal=false".to_string(),
        recoverability: RecoverabilitySettings {
            delayed_retry_enabled: false,
            max_delayed_retries: 0,
            ..RecoverabilitySettings::default()
        },
        conventions: ConventionSettings::with_root_prefix("Divergent"),
        ..EndpointConfig::named("Divergent.Customers")
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    missive_endpoint::init_tracing(args.log_format)?;

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let mut config = match &args.config {
        Some(path) => EndpointConfig::from_json_file(path)?,
        None => demo_config(),
    };
    if let Some(name) = args.endpoint_name {
        config.endpoint_name = name;
    }

    let create_customer = MessageTypeDescriptor::new(COMMANDS_NAMESPACE, "CreateCustomerCommand");
    let customer_created = MessageTypeDescriptor::new(EVENTS_NAMESPACE, "CustomerCreatedEvent");

    let mut builder = EndpointBuilder::new(config)?;
    builder
        .register_command_handler(create_customer.clone(), CreateCustomerHandler)?
        .register_event_handler(customer_created.clone(), WelcomeMailHandler)?;

    let endpoint = builder.start().await?;

    for customer_id in 1..=args.demo_messages {
        let command = CreateCustomerCommand {
            customer_id,
            name: format!("Customer {customer_id}"),
        };
        endpoint
            .send_local(JsonSerializer.encode(&create_customer, &command)?)
            .await?;
        let event = CustomerCreatedEvent { customer_id };
        endpoint
            .send_local(JsonSerializer.encode(&customer_created, &event)?)
            .await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    let drained = endpoint.stop().await?;
    info!(drained, "host exiting");
    Ok(())
}
