//! End-to-end dispatch against in-memory backends

use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};
use waypoint_bootable::Bootable;
use waypoint_broker::{Broker, Event, SubscriptionHandler, SubscriptionHandlerError};
use waypoint_broker_memory::MemoryBroker;
use waypoint_client::{
    CallFn, Client, ConstantBackoff, Context, Error, TraceWrapper, call_fn,
};
use waypoint_codec::{AnyCodec, Codec};
use waypoint_registry::{Registry, ServiceInstance};
use waypoint_registry_memory::MemoryRegistry;
use waypoint_selector::{NodeGenerator, RegistrySelector, SelectOptions, Selector, SelectorError};
use waypoint_server::{HandlerError, Server, ServerStream};
use waypoint_transport::header;
use waypoint_transport::{Message, Transport};
use waypoint_transport_memory::{MemoryNetwork, MemoryTransport};

const GREETER: &str = "greeter";

/// Delegates to a registry selector and records every mark.
#[derive(Debug)]
struct RecordingSelector {
    inner: RegistrySelector<MemoryRegistry>,
    marks: Mutex<Vec<(String, bool)>>,
}

impl RecordingSelector {
    fn new(registry: MemoryRegistry) -> Arc<Self> {
        Arc::new(Self {
            inner: RegistrySelector::new(registry),
            marks: Mutex::new(Vec::new()),
        })
    }

    /// `(address, failed)` per mark, in order.
    fn marks(&self) -> Vec<(String, bool)> {
        self.marks.lock().clone()
    }
}

#[async_trait]
impl Selector for RecordingSelector {
    async fn select(
        &self,
        service: &str,
        options: &SelectOptions,
    ) -> Result<NodeGenerator, SelectorError> {
        self.inner.select(service, options).await
    }

    fn mark(&self, service: &str, node: &ServiceInstance, error: Option<&dyn StdError>) {
        self.marks
            .lock()
            .push((node.address().to_string(), error.is_some()));
        self.inner.mark(service, node, error);
    }

    fn reset(&self, service: &str) {
        self.inner.reset(service);
    }
}

type TestClient = Client<Arc<RecordingSelector>, MemoryTransport, MemoryBroker>;

struct Harness {
    network: MemoryNetwork,
    transport: MemoryTransport,
    registry: MemoryRegistry,
    broker: MemoryBroker,
    selector: Arc<RecordingSelector>,
}

impl Harness {
    /// `unreachable` nodes are registered without anything listening.
    fn new(unreachable: &[&str]) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let network = MemoryNetwork::new();
        let registry = MemoryRegistry::new().with_instances(
            unreachable
                .iter()
                .map(|address| ServiceInstance::new(GREETER, *address).with_id(*address)),
        );

        Self {
            transport: MemoryTransport::new(network.clone()),
            network,
            selector: RecordingSelector::new(registry.clone()),
            registry,
            broker: MemoryBroker::new(),
        }
    }

    fn client(&self) -> TestClient {
        Client::builder(
            self.selector.clone(),
            self.transport.clone(),
            self.broker.clone(),
        )
        .build()
    }

    async fn serve(&self, address: &str) -> Server<MemoryTransport, MemoryRegistry> {
        let server = Server::new(
            self.transport.clone(),
            self.registry.clone(),
            ServiceInstance::new(GREETER, address).with_id(address),
        );

        server.handle("Hello", |name: String| async move { Ok(format!("Hello, {name}")) });
        server.handle("Fail", |_: String| async move {
            Err::<String, _>(HandlerError::new(409, "already greeted"))
        });
        server.handle("Slow", |name: String| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(name)
        });
        server.handle_message("Trace", |message: Message| async move {
            let trace = message.header("X-Trace-Id").unwrap_or_default().to_string();
            let body = AnyCodec::Cbor
                .encode(&trace)
                .map_err(|e| HandlerError::internal(e.to_string()))?;
            Ok::<_, HandlerError>(
                Message::new(body).with_header(header::CONTENT_TYPE, waypoint_codec::CBOR),
            )
        });
        server.handle_stream("Double", |mut stream: ServerStream| async move {
            while let Some(n) = stream.recv::<u32>().await? {
                stream.send(&(n * 2)).await?;
            }
            Ok::<(), HandlerError>(())
        });

        server.start().await.unwrap();
        server
    }
}

#[tokio::test]
async fn test_failing_node_is_retried_on_next_node() {
    let harness = Harness::new(&["a"]);
    let _server = harness.serve("b").await;
    let client = harness.client();

    let ctx = Context::new();
    let request = client.new_request(GREETER, "Hello", "Ada").unwrap();
    let options = client
        .options()
        .retries(1)
        .backoff(ConstantBackoff(Duration::ZERO));

    let response = client.call_with(&ctx, request, options).await.unwrap();
    assert_eq!(response.decode::<String>().unwrap(), "Hello, Ada");

    assert_eq!(
        harness.selector.marks(),
        vec![("a".to_string(), true), ("b".to_string(), false)]
    );

    let stats = client.stats();
    assert_eq!(stats.attempts, 2);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn test_unknown_service_makes_no_attempts() {
    let harness = Harness::new(&[]);
    let client = harness.client();

    let request = client.new_request("ghost", "Hello", "Ada").unwrap();
    let err = client.call(&Context::new(), request).await.unwrap_err();

    assert!(matches!(err, Error::NotFound(ref service) if service == "ghost"));
    assert_eq!(client.stats().attempts, 0);
    assert!(harness.selector.marks().is_empty());
}

#[tokio::test]
async fn test_attempts_equal_retries_plus_one() {
    for retries in 0..=4_u32 {
        let harness = Harness::new(&["a", "b"]);
        let client = harness.client();

        let request = client.new_request(GREETER, "Hello", "Ada").unwrap();
        let options = client
            .options()
            .retries(retries)
            .backoff(ConstantBackoff(Duration::ZERO));

        let err = client
            .call_with(&Context::new(), request, options)
            .await
            .unwrap_err();

        match err {
            Error::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, retries + 1);
                assert!(matches!(*source, Error::Dial { .. }), "{source}");
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }

        let expected = usize::try_from(retries + 1).unwrap();
        assert_eq!(harness.selector.marks().len(), expected);
        assert!(harness.selector.marks().iter().all(|(_, failed)| *failed));
        assert_eq!(client.stats().attempts, u64::from(retries + 1));
    }
}

#[tokio::test]
async fn test_application_error_is_not_retried() {
    let harness = Harness::new(&[]);
    let _b = harness.serve("b").await;
    let _c = harness.serve("c").await;
    let client = harness.client();

    let request = client.new_request(GREETER, "Fail", "Ada").unwrap();
    let options = client.options().retries(3);
    let err = client
        .call_with(&Context::new(), request, options)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Application { code: 409, .. }), "{err}");
    assert_eq!(client.stats().attempts, 1);
    assert_eq!(harness.selector.marks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_returns_promptly() {
    let harness = Harness::new(&["a"]);
    let client = harness.client();

    let ctx = Context::new();
    let request = client.new_request(GREETER, "Hello", "Ada").unwrap();
    let options = client
        .options()
        .retries(1)
        .no_timeout()
        .backoff(ConstantBackoff(Duration::from_secs(60)));

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = client.call_with(&ctx, request, options).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled), "{err}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.stats().attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_bounds_the_call() {
    let harness = Harness::new(&[]);
    let _server = harness.serve("b").await;
    let client = harness.client();

    let request = client.new_request(GREETER, "Slow", "Ada").unwrap();
    let options = client.options().request_timeout(Duration::from_secs(1));

    let err = client
        .call_with(&Context::new(), request, options)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DeadlineExceeded), "{err}");
    assert_eq!(harness.selector.marks(), vec![("b".to_string(), true)]);
}

#[tokio::test]
async fn test_metadata_reaches_the_handler() {
    let harness = Harness::new(&[]);
    let _server = harness.serve("b").await;
    let client = harness.client();

    let ctx = Context::new().with_metadata("x-trace-id", "trace-1");
    let request = client.new_request(GREETER, "Trace", &()).unwrap();
    let response = client.call(&ctx, request).await.unwrap();

    assert_eq!(response.decode::<String>().unwrap(), "trace-1");
}

#[tokio::test]
async fn test_pinned_address_bypasses_registry() {
    let harness = Harness::new(&[]);
    let server = Server::new(
        harness.transport.clone(),
        MemoryRegistry::new(),
        ServiceInstance::new(GREETER, "hidden"),
    );
    server.handle("Hello", |name: String| async move { Ok(format!("Hi {name}")) });
    server.start().await.unwrap();

    let client = harness.client();
    let request = client.new_request(GREETER, "Hello", "Bo").unwrap();
    let options = client.options().address("hidden");

    let response = client
        .call_with(&Context::new(), request, options)
        .await
        .unwrap();
    assert_eq!(response.decode::<String>().unwrap(), "Hi Bo");
}

#[tokio::test]
async fn test_connections_are_reused_across_calls() {
    let harness = Harness::new(&[]);
    let _server = harness.serve("b").await;
    let client = harness.client();

    for _ in 0..3 {
        let request = client.new_request(GREETER, "Hello", "Ada").unwrap();
        client.call(&Context::new(), request).await.unwrap();
    }

    assert_eq!(harness.network.dial_count("b"), 1);
    assert_eq!(client.pool().idle("b"), 1);
    assert_eq!(client.pool().in_use("b"), 0);
}

#[tokio::test]
async fn test_stream_round_trip() {
    let harness = Harness::new(&[]);
    let _server = harness.serve("b").await;
    let client = harness.client();

    let mut stream = client
        .stream(&Context::new(), GREETER, "Double")
        .await
        .unwrap();
    assert_eq!(stream.node().address(), "b");

    for n in 1..=3_u32 {
        stream.send(&n).await.unwrap();
        assert_eq!(stream.recv::<u32>().await.unwrap(), Some(n * 2));
    }

    stream.close_send().await.unwrap();
    assert_eq!(stream.recv::<u32>().await.unwrap(), None);
    stream.close().await.unwrap();

    assert_eq!(harness.selector.marks(), vec![("b".to_string(), false)]);
    assert_eq!(client.pool().idle("b"), 1);
    assert_eq!(client.stats().streams, 1);
}

#[tokio::test]
async fn test_stream_failure_is_not_rebound() {
    let harness = Harness::new(&[]);

    // "a" answers one frame, then drops the connection when told to.
    harness
        .registry
        .register(ServiceInstance::new(GREETER, "a").with_id("a"))
        .await
        .unwrap();
    let listener = harness.transport.listen("a").await.unwrap();
    let (fail_tx, fail_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let open = conn.recv().await.unwrap();
        let id = open.header(header::ID).unwrap().to_string();

        let frame = Message::new(AnyCodec::Cbor.encode(&7_u32).unwrap())
            .with_header(header::ID, id)
            .with_header(header::CONTENT_TYPE, waypoint_codec::CBOR);
        conn.send(frame).await.unwrap();

        let _ = fail_rx.await;
        conn.close().await.unwrap();
    });

    let _b = harness.serve("b").await;
    let client = harness.client();

    let mut stream = client
        .stream(&Context::new(), GREETER, "Double")
        .await
        .unwrap();
    assert_eq!(stream.node().address(), "a");
    assert_eq!(stream.recv::<u32>().await.unwrap(), Some(7));

    fail_tx.send(()).unwrap();
    let err = stream.recv::<u32>().await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
    assert!(stream.recv::<u32>().await.is_err());

    assert_eq!(harness.network.dial_count("b"), 0);
    assert_eq!(harness.selector.marks(), vec![("a".to_string(), true)]);
}

#[tokio::test]
async fn test_dropped_stream_leaves_health_alone() {
    let harness = Harness::new(&[]);
    let _server = harness.serve("b").await;
    let client = harness.client();

    let mut stream = client
        .stream(&Context::new(), GREETER, "Double")
        .await
        .unwrap();
    stream.send(&21_u32).await.unwrap();
    drop(stream);

    assert!(harness.selector.marks().is_empty());
    assert!(harness.selector.inner.health(GREETER).is_empty());
    assert_eq!(client.pool().in_use("b"), 0);
    assert_eq!(client.pool().idle("b"), 0);
}

#[tokio::test]
async fn test_reply_sent_before_hangup_is_delivered() {
    let harness = Harness::new(&[]);
    harness
        .registry
        .register(ServiceInstance::new(GREETER, "a").with_id("a"))
        .await
        .unwrap();

    // "a" answers one request and hangs up straight away.
    let listener = harness.transport.listen("a").await.unwrap();
    tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let request = conn.recv().await.unwrap();
        let id = request.header(header::ID).unwrap().to_string();

        let reply = Message::new(AnyCodec::Cbor.encode("Hello, Ada").unwrap())
            .with_header(header::ID, id)
            .with_header(header::CONTENT_TYPE, waypoint_codec::CBOR);
        conn.send(reply).await.unwrap();
    });

    let client = harness.client();
    let request = client.new_request(GREETER, "Hello", "Ada").unwrap();
    let options = client.options().retries(0);

    let response = client
        .call_with(&Context::new(), request, options)
        .await
        .unwrap();
    assert_eq!(response.decode::<String>().unwrap(), "Hello, Ada");
    assert_eq!(harness.selector.marks(), vec![("a".to_string(), false)]);
}

#[tokio::test]
async fn test_no_matching_node_uses_no_retry_budget() {
    let harness = Harness::new(&[]);
    let _b = harness.serve("b").await;
    let _c = harness.serve("c").await;
    let client = harness.client();

    let request = client.new_request(GREETER, "Hello", "Ada").unwrap();
    let options = client
        .options()
        .retries(3)
        .select_options(SelectOptions::new().version("9.9.9"));

    let err = client
        .call_with(&Context::new(), request, options)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoneAvailable(ref service) if service == GREETER), "{err}");
    assert_eq!(client.stats().attempts, 0);
    assert!(harness.selector.marks().is_empty());
}

#[tokio::test]
async fn test_exhausted_pool_moves_to_next_node() {
    let harness = Harness::new(&[]);
    let _b = harness.serve("b").await;
    let _c = harness.serve("c").await;
    let client = Client::builder(
        harness.selector.clone(),
        harness.transport.clone(),
        harness.broker.clone(),
    )
    .pool_size(1)
    .build();

    let held = client
        .pool()
        .acquire("b", Duration::from_secs(1))
        .await
        .unwrap();

    let request = client.new_request(GREETER, "Hello", "Ada").unwrap();
    let options = client
        .options()
        .retries(1)
        .dial_timeout(Duration::from_millis(50))
        .backoff(ConstantBackoff(Duration::ZERO));

    let response = client
        .call_with(&Context::new(), request, options)
        .await
        .unwrap();
    assert_eq!(response.decode::<String>().unwrap(), "Hello, Ada");

    assert_eq!(
        harness.selector.marks(),
        vec![("b".to_string(), true), ("c".to_string(), false)]
    );
    assert_eq!(client.stats().attempts, 2);
    assert_eq!(harness.network.dial_count("b"), 1);

    held.release(true);
}

#[derive(Debug, thiserror::Error)]
#[error("receiver gone")]
struct ReceiverGone;

impl SubscriptionHandlerError for ReceiverGone {}

#[derive(Clone, Debug)]
struct Forward(mpsc::UnboundedSender<Event>);

#[async_trait]
impl SubscriptionHandler for Forward {
    type Error = ReceiverGone;

    async fn handle(&self, _topic: String, event: Event) -> Result<(), Self::Error> {
        self.0.send(event).map_err(|_| ReceiverGone)
    }
}

#[tokio::test]
async fn test_publish_carries_metadata_and_content_type() {
    let harness = Harness::new(&[]);
    let client = harness.client();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = harness
        .broker
        .subscribe("greetings", Forward(tx))
        .await
        .unwrap();

    let ctx = Context::new().with_metadata("x-trace-id", "trace-2");
    client.publish(&ctx, "greetings", "hello").await.unwrap();

    let event = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event.header.get("X-Trace-Id").map(String::as_str),
        Some("trace-2")
    );
    assert_eq!(
        event.header.get(header::CONTENT_TYPE).map(String::as_str),
        Some(waypoint_codec::CBOR)
    );
    let body: String = AnyCodec::Cbor.decode(&event.body).unwrap();
    assert_eq!(body, "hello");

    assert_eq!(client.stats().publishes, 1);
    assert!(harness.selector.marks().is_empty());
}

#[tokio::test]
async fn test_wrappers_see_every_attempt() {
    let harness = Harness::new(&["a"]);
    let _server = harness.serve("b").await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let client = Client::builder(
        harness.selector.clone(),
        harness.transport.clone(),
        harness.broker.clone(),
    )
    .wrap(move |next: CallFn| -> CallFn {
        let counter = counter.clone();
        call_fn(move |ctx, node, request, options| {
            counter.fetch_add(1, Ordering::SeqCst);
            next(ctx, node, request, options)
        })
    })
    .wrap(TraceWrapper)
    .backoff(waypoint_client::BackoffConfig {
        base: Duration::ZERO,
        max: Duration::ZERO,
        jitter: 0.0,
    })
    .build();

    let request = client.new_request(GREETER, "Hello", "Ada").unwrap();
    client.call(&Context::new(), request).await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_calls_after_shutdown_fail() {
    let harness = Harness::new(&[]);
    let _server = harness.serve("b").await;
    let client = harness.client();

    client.start().await.unwrap();
    client.shutdown().await.unwrap();

    let request = client.new_request(GREETER, "Hello", "Ada").unwrap();
    let err = client.call(&Context::new(), request).await.unwrap_err();
    assert!(matches!(err, Error::Shutdown));
}
