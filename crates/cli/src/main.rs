//! Runs an in-process greeter mesh and drives a client against it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use waypoint_bootable::Bootable;
use waypoint_broker::{Broker, Event, Subscription, SubscriptionHandler, SubscriptionHandlerError};
use waypoint_broker_memory::MemoryBroker;
use waypoint_client::{Client, Context, TraceWrapper};
use waypoint_codec::{AnyCodec, Codec};
use waypoint_registry::ServiceInstance;
use waypoint_registry_memory::MemoryRegistry;
use waypoint_selector::{RegistrySelector, SelectorConfig, Strategy};
use waypoint_server::{HandlerError, Server, ServerStream};
use waypoint_transport::header;
use waypoint_transport_memory::{MemoryNetwork, MemoryTransport};

const SERVICE: &str = "greeter";

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A component failed to start or stop
    #[error("{0} failed: {1}")]
    Boot(String, String),

    /// Broker error
    #[error(transparent)]
    Broker(#[from] waypoint_broker_memory::Error),

    /// Client error
    #[error(transparent)]
    Client(#[from] waypoint_client::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Greeter nodes to run
    #[arg(long, default_value_t = 3, env = "WAYPOINT_NODES")]
    nodes: usize,

    /// How many of the nodes are registered but unreachable
    #[arg(long, default_value_t = 1, env = "WAYPOINT_UNREACHABLE")]
    unreachable: usize,

    /// Unary calls to make
    #[arg(long, default_value_t = 10, env = "WAYPOINT_CALLS")]
    calls: usize,

    /// Retries after the first attempt
    #[arg(long, default_value_t = 1, env = "WAYPOINT_RETRIES")]
    retries: u32,

    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 5000, env = "WAYPOINT_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: u64,

    /// Node selection strategy
    #[arg(
        long,
        value_enum,
        default_value_t = StrategyArg::RoundRobin,
        env = "WAYPOINT_STRATEGY"
    )]
    strategy: StrategyArg,

    /// Body encoding
    #[arg(long, value_enum, default_value_t = CodecArg::Cbor, env = "WAYPOINT_CODEC")]
    codec: CodecArg,

    /// Messages sent on the demo stream
    #[arg(long, default_value_t = 3, env = "WAYPOINT_STREAM_MESSAGES")]
    stream_messages: u64,

    /// Topic for the demo event
    #[arg(long, default_value = "greetings", env = "WAYPOINT_TOPIC")]
    topic: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    RoundRobin,
    Random,
    LeastFailures,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::RoundRobin => Self::RoundRobin,
            StrategyArg::Random => Self::Random,
            StrategyArg::LeastFailures => Self::LeastFailures,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CodecArg {
    Cbor,
    Json,
}

impl From<CodecArg> for AnyCodec {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Cbor => Self::Cbor,
            CodecArg::Json => Self::Json,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("undecodable event: {0}")]
struct UndecodableEvent(String);

impl SubscriptionHandlerError for UndecodableEvent {}

#[derive(Clone, Debug)]
struct LogEvents;

#[async_trait]
impl SubscriptionHandler for LogEvents {
    type Error = UndecodableEvent;

    async fn handle(&self, topic: String, event: Event) -> Result<(), Self::Error> {
        let codec = event
            .header
            .get(header::CONTENT_TYPE)
            .map_or(Ok(AnyCodec::default()), |ct| AnyCodec::for_content_type(ct))
            .map_err(|e| UndecodableEvent(e.to_string()))?;
        let text: String = codec
            .decode(&event.body)
            .map_err(|e| UndecodableEvent(e.to_string()))?;

        info!(%topic, "Received event: {}", text);
        Ok(())
    }
}

fn greeter(
    transport: &MemoryTransport,
    registry: &MemoryRegistry,
    address: &str,
) -> Server<MemoryTransport, MemoryRegistry> {
    let server = Server::new(
        transport.clone(),
        registry.clone(),
        ServiceInstance::new(SERVICE, address).with_id(address),
    );

    let me = address.to_string();
    server.handle("Hello", move |name: String| {
        let me = me.clone();
        async move {
            if name.is_empty() {
                return Err(HandlerError::bad_request("name is required"));
            }
            Ok(format!("Hello {name}, from {me}"))
        }
    });

    // Replies with the running total of everything received.
    server.handle_stream("Sum", |mut stream: ServerStream| async move {
        let mut total = 0_u64;
        while let Some(n) = stream.recv::<u64>().await? {
            total += n;
            stream.send(&total).await?;
        }
        Ok::<(), HandlerError>(())
    });

    server
}

async fn boot(component: &impl Bootable) -> Result<(), Error> {
    component
        .start()
        .await
        .map_err(|e| Error::Boot(component.bootable_name().to_string(), e.to_string()))
}

async fn stop(component: &impl Bootable) {
    if let Err(e) = component.shutdown().await {
        warn!("Failed to stop {}: {}", component.bootable_name(), e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let network = MemoryNetwork::new();
    let transport = MemoryTransport::new(network.clone());
    let registry = MemoryRegistry::new();
    let broker = MemoryBroker::new();

    let mut servers = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let address = format!("{SERVICE}-{i}");
        let server = greeter(&transport, &registry, &address);
        boot(&server).await?;

        if i < args.unreachable {
            network.set_unreachable(&address, true);
            warn!("{} is registered but unreachable", address);
        }
        servers.push(server);
    }

    let selector = RegistrySelector::with_config(
        registry.clone(),
        SelectorConfig {
            strategy: args.strategy.into(),
            ..SelectorConfig::default()
        },
    );
    boot(&selector).await?;

    let client = Client::builder(selector.clone(), transport.clone(), broker.clone())
        .retries(args.retries)
        .request_timeout(Duration::from_millis(args.request_timeout_ms))
        .codec(args.codec.into())
        .wrap(TraceWrapper)
        .build();
    boot(&client).await?;

    let subscription = broker.subscribe(&args.topic, LogEvents).await?;
    let ctx = Context::new().with_metadata("x-request-source", "waypoint-cli");

    for i in 0..args.calls {
        let request = client.new_request(SERVICE, "Hello", &format!("caller-{i}"))?;
        match client.call(&ctx, request).await {
            Ok(response) => info!("{}", response.decode::<String>()?),
            Err(e) => warn!("Call {} failed: {}", i, e),
        }
    }

    let mut stream = client.stream(&ctx, SERVICE, "Sum").await?;
    info!("Streaming to {}", stream.node());
    for n in 1..=args.stream_messages {
        stream.send(&n).await?;
        if let Some(total) = stream.recv::<u64>().await? {
            info!(n, total, "Running total");
        }
    }
    stream.close_send().await?;
    while stream.recv::<u64>().await?.is_some() {}
    stream.close().await?;

    client
        .publish(&ctx, &args.topic, "hello from waypoint")
        .await?;

    // Give the subscriber a moment to log the event.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = client.stats();
    info!(
        calls = stats.calls,
        attempts = stats.attempts,
        retries = stats.retries,
        failures = stats.failures,
        streams = stats.streams,
        publishes = stats.publishes,
        "Client stats"
    );
    for node in selector.health(SERVICE) {
        info!(
            address = %node.address,
            score = node.score,
            successes = node.successes,
            failures = node.failures,
            "Node health"
        );
    }

    subscription.unsubscribe().await;
    stop(&client).await;
    stop(&selector).await;
    for server in &servers {
        stop(server).await;
    }

    Ok(())
}
