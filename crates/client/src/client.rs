use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;
use waypoint_bootable::{Bootable, BootableError};
use waypoint_broker::{Broker, Event};
use waypoint_codec::{AnyCodec, Codec};
use waypoint_pool::{ConnectionPool, PoolConfig, PooledConnection};
use waypoint_registry::ServiceInstance;
use waypoint_selector::{NodeGenerator, Selector};
use waypoint_transport::header::{self, ErrorDetail};
use waypoint_transport::{Transport, TransportError};

use crate::backoff::BackoffConfig;
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::options::CallOptions;
use crate::request::{Request, Response};
use crate::stats::{Counters, Stats};
use crate::stream::{MarkFn, Stream};
use crate::wrapper::{CallFn, CallWrapper, call_fn, chain};

struct ClientInner<S, T, B>
where
    T: Transport,
{
    config: ClientConfig,
    selector: S,
    pool: ConnectionPool<T>,
    broker: B,
    call: CallFn,
    counters: Counters,
}

/// Dispatches requests to services.
///
/// Every call resolves the service through the selector, borrows a pooled
/// connection to the chosen node and retries on other nodes according to
/// the call's [`CallOptions`]. Clones share all state.
pub struct Client<S, T, B>
where
    S: Selector,
    T: Transport,
    B: Broker,
{
    inner: Arc<ClientInner<S, T, B>>,
}

impl<S, T, B> Clone for Client<S, T, B>
where
    S: Selector,
    T: Transport,
    B: Broker,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, T, B> std::fmt::Debug for Client<S, T, B>
where
    S: Selector,
    T: Transport,
    B: Broker,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("selector", &self.inner.selector)
            .field("pool", &self.inner.pool)
            .field("broker", &self.inner.broker)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder<S, T, B> {
    selector: S,
    transport: T,
    broker: B,
    config: ClientConfig,
    wrappers: Vec<Arc<dyn CallWrapper>>,
}

impl<S, T, B> ClientBuilder<S, T, B>
where
    S: Selector,
    T: Transport,
    B: Broker,
{
    /// Replace the whole configuration.
    #[must_use]
    pub const fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Default retries after the first attempt.
    #[must_use]
    pub const fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Default total time for one call.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Default time to obtain a connection per attempt.
    #[must_use]
    pub const fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    /// Maximum connections in use per address.
    #[must_use]
    pub const fn pool_size(mut self, size: usize) -> Self {
        self.config.pool.size = size;
        self
    }

    /// Idle time after which pooled connections are not reused.
    #[must_use]
    pub const fn pool_ttl(mut self, ttl: Duration) -> Self {
        self.config.pool.ttl = ttl;
        self
    }

    /// Full pool configuration.
    #[must_use]
    pub const fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Default backoff between attempts.
    #[must_use]
    pub const fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Encoding for request bodies and events.
    #[must_use]
    pub const fn codec(mut self, codec: AnyCodec) -> Self {
        self.config.codec = codec;
        self
    }

    /// Add a call wrapper. The first wrapper added is outermost.
    #[must_use]
    pub fn wrap(mut self, wrapper: impl CallWrapper) -> Self {
        self.wrappers.push(Arc::new(wrapper));
        self
    }

    /// Build the client.
    pub fn build(self) -> Client<S, T, B> {
        let pool = ConnectionPool::new(self.transport, self.config.pool);
        let call = chain(&self.wrappers, attempt_fn(pool.clone()));

        Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                selector: self.selector,
                pool,
                broker: self.broker,
                call,
                counters: Counters::default(),
            }),
        }
    }
}

/// The innermost call function: one request/reply exchange on a pooled
/// connection.
fn attempt_fn<T>(pool: ConnectionPool<T>) -> CallFn
where
    T: Transport,
{
    call_fn(move |ctx, node, request, options| {
        let pool = pool.clone();
        async move { unary_attempt(&pool, &ctx, &node, &request, &options).await }
    })
}

async fn unary_attempt<T>(
    pool: &ConnectionPool<T>,
    ctx: &Context,
    node: &ServiceInstance,
    request: &Request,
    options: &CallOptions,
) -> Result<Response>
where
    T: Transport,
{
    let conn = pool.acquire(node.address(), options.dial_timeout).await?;
    let id = Uuid::new_v4().to_string();

    if let Err(e) = conn.send(request.to_message(&id, ctx.metadata())).await {
        conn.release(false);
        return Err(e.into());
    }

    let reply = match conn.recv().await {
        Ok(reply) => reply,
        Err(e) => {
            conn.release(false);
            return Err(e.into());
        }
    };

    if reply.header(header::ID) != Some(id.as_str()) {
        conn.release(false);
        return Err(TransportError::Protocol(format!("reply does not match request {id}")).into());
    }

    conn.release(true);

    if let Some(value) = reply.header(header::ERROR) {
        let detail = ErrorDetail::from_header(value);
        return Err(Error::Application {
            code: detail.code,
            detail: detail.detail,
        });
    }

    Ok(Response::from(reply))
}

async fn open_attempt<T>(
    pool: &ConnectionPool<T>,
    ctx: &Context,
    node: &ServiceInstance,
    request: &Request,
    dial_timeout: Duration,
) -> Result<(PooledConnection, String)>
where
    T: Transport,
{
    let conn = pool.acquire(node.address(), dial_timeout).await?;
    let id = Uuid::new_v4().to_string();

    let open = request
        .to_message(&id, ctx.metadata())
        .with_header(header::STREAM, "true");

    if let Err(e) = conn.send(open).await {
        conn.release(false);
        return Err(e.into());
    }

    Ok((conn, id))
}

impl<S, T, B> Client<S, T, B>
where
    S: Selector,
    T: Transport,
    B: Broker,
{
    /// Start building a client.
    pub fn builder(selector: S, transport: T, broker: B) -> ClientBuilder<S, T, B> {
        ClientBuilder {
            selector,
            transport,
            broker,
            config: ClientConfig::default(),
            wrappers: Vec::new(),
        }
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The selector used for node selection.
    pub fn selector(&self) -> &S {
        &self.inner.selector
    }

    /// The connection pool.
    pub fn pool(&self) -> &ConnectionPool<T> {
        &self.inner.pool
    }

    /// Activity counters.
    pub fn stats(&self) -> Stats {
        self.inner.counters.snapshot()
    }

    /// Call options carrying this client's defaults.
    pub fn options(&self) -> CallOptions {
        CallOptions::new(&self.inner.config)
    }

    /// Encode `body` with the client's codec into a request.
    ///
    /// # Errors
    ///
    /// [`Error::Codec`] if the body cannot be encoded.
    pub fn new_request<Q>(&self, service: &str, endpoint: &str, body: &Q) -> Result<Request>
    where
        Q: Serialize + ?Sized,
    {
        let codec = self.inner.config.codec;
        Ok(Request::new(
            service,
            endpoint,
            codec.content_type(),
            codec.encode(body)?,
        ))
    }

    /// Call with the client's default options.
    ///
    /// # Errors
    ///
    /// See [`Client::call_with`].
    pub async fn call(&self, ctx: &Context, request: Request) -> Result<Response> {
        self.call_with(ctx, request, self.options()).await
    }

    /// Make a unary call.
    ///
    /// At most `retries + 1` attempts are made, each against the next node
    /// of a single selection, and every attempt is reported to the selector.
    /// The whole call, backoff included, is bounded by the request timeout
    /// and by `ctx`.
    ///
    /// # Errors
    ///
    /// Discovery and selection failures, non-retryable attempt errors and
    /// caller cancellation are returned as-is. When the budget runs out the
    /// last attempt's error is wrapped in [`Error::RetriesExhausted`].
    #[instrument(skip_all, fields(service = %request.service(), endpoint = %request.endpoint()))]
    pub async fn call_with(
        &self,
        ctx: &Context,
        request: Request,
        options: CallOptions,
    ) -> Result<Response> {
        if self.inner.pool.is_closed() {
            return Err(Error::Shutdown);
        }
        Counters::incr(&self.inner.counters.calls);

        let ctx = options
            .request_timeout
            .map_or_else(|| ctx.child(), |timeout| ctx.with_timeout(timeout));
        let options = Arc::new(options);
        let call = self.inner.call.clone();

        let result = self
            .attempts(&ctx, request.service(), &options, true, |node| {
                call(ctx.clone(), node, request.clone(), options.clone())
            })
            .await
            .map(|(response, _)| response);

        if let Err(e) = &result {
            Counters::incr(&self.inner.counters.failures);
            debug!("Call failed: {}", e);
        }

        result
    }

    /// Open a stream with the client's default options.
    ///
    /// # Errors
    ///
    /// See [`Client::stream_with`].
    pub async fn stream(&self, ctx: &Context, service: &str, endpoint: &str) -> Result<Stream> {
        self.stream_with(ctx, service, endpoint, self.options())
            .await
    }

    /// Open a bidirectional stream.
    ///
    /// Opening follows the same selection and retry rules as a unary call
    /// and is bounded by the request timeout. Once open, the stream is bound
    /// to its node until it ends; it lives as long as `ctx` allows.
    ///
    /// # Errors
    ///
    /// The same errors as [`Client::call_with`], for the opening exchange.
    #[instrument(skip(self, ctx, options))]
    pub async fn stream_with(
        &self,
        ctx: &Context,
        service: &str,
        endpoint: &str,
        options: CallOptions,
    ) -> Result<Stream> {
        if self.inner.pool.is_closed() {
            return Err(Error::Shutdown);
        }

        let codec = self.inner.config.codec;
        let request = Request::new(service, endpoint, codec.content_type(), Bytes::new());
        let open_ctx = options
            .request_timeout
            .map_or_else(|| ctx.child(), |timeout| ctx.with_timeout(timeout));
        let dial_timeout = options.dial_timeout;
        let pool = &self.inner.pool;

        let opened = self
            .attempts(&open_ctx, service, &options, false, |node| {
                let ctx = open_ctx.clone();
                let request = request.clone();
                let pool = pool.clone();
                async move { open_attempt(&pool, &ctx, &node, &request, dial_timeout).await }
            })
            .await;

        let ((conn, id), node) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                Counters::incr(&self.inner.counters.failures);
                return Err(e);
            }
        };

        Counters::incr(&self.inner.counters.streams);
        debug!("Stream {} bound to {}", id, node);

        let client = self.clone();
        let mark_service = service.to_string();
        let mark_node = node.clone();
        let mark: MarkFn = Box::new(move |error: Option<&Error>| {
            client.inner.selector.mark(
                &mark_service,
                &mark_node,
                error.map(|e| e as &dyn std::error::Error),
            );
        });

        Ok(Stream::new(
            id,
            node,
            endpoint.to_string(),
            ctx.child(),
            codec,
            conn,
            mark,
        ))
    }

    /// Publish `value` to `topic` through the broker.
    ///
    /// Publishing bypasses selection and is never retried. Request metadata
    /// travels in the event header.
    ///
    /// # Errors
    ///
    /// [`Error::Codec`] if encoding fails, [`Error::Broker`] if the broker
    /// rejects the event, or a cancellation error from `ctx`.
    #[instrument(skip(self, ctx, value))]
    pub async fn publish<Q>(&self, ctx: &Context, topic: &str, value: &Q) -> Result<()>
    where
        Q: Serialize + ?Sized,
    {
        let codec = self.inner.config.codec;
        let mut event = Event::new(codec.encode(value)?);

        for (key, value) in ctx.metadata() {
            event.header.insert(key.clone(), value.clone());
        }
        event
            .header
            .insert(header::CONTENT_TYPE.to_string(), codec.content_type().to_string());

        ctx.run(self.inner.broker.publish(topic, event))
            .await?
            .map_err(|e| Error::Broker(e.to_string()))?;

        Counters::incr(&self.inner.counters.publishes);
        Ok(())
    }

    async fn resolve(
        &self,
        ctx: &Context,
        service: &str,
        options: &CallOptions,
    ) -> Result<NodeGenerator> {
        if !options.addresses.is_empty() {
            return Ok(NodeGenerator::from_instances(options.addresses.iter().map(
                |address| ServiceInstance::new(service, address.as_str()).with_id(address.as_str()),
            )));
        }

        ctx.run(self.inner.selector.select(service, &options.select))
            .await?
            .map_err(Error::from)
    }

    /// Run `attempt` against successive nodes until it succeeds, fails
    /// terminally or the budget is spent.
    ///
    /// Every failed attempt is marked on the selector. A successful attempt
    /// is marked only when `mark_success` is set; streams report their
    /// outcome when they end instead.
    async fn attempts<R, F, Fut>(
        &self,
        ctx: &Context,
        service: &str,
        options: &CallOptions,
        mark_success: bool,
        mut attempt: F,
    ) -> Result<(R, ServiceInstance)>
    where
        F: FnMut(ServiceInstance) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut nodes = self.resolve(ctx, service, options).await?;
        let max_attempts = options.max_attempts();
        let mut index: u32 = 0;

        loop {
            if index > 0 {
                Counters::incr(&self.inner.counters.retries);
                let delay = options.backoff.delay(index - 1);
                debug!(attempt = index + 1, ?delay, "Backing off before retry");
                ctx.sleep(delay).await?;
            }

            let Some(node) = nodes.next() else {
                return Err(Error::NoneAvailable(service.to_string()));
            };

            Counters::incr(&self.inner.counters.attempts);
            let result = ctx
                .run(attempt(node.clone()))
                .await
                .and_then(std::convert::identity);

            let err = match result {
                Ok(value) => {
                    if mark_success {
                        self.inner.selector.mark(service, &node, None);
                    }
                    return Ok((value, node));
                }
                Err(err) => err,
            };

            self.inner
                .selector
                .mark(service, &node, Some(&err as &dyn std::error::Error));

            if err.is_caller_driven() || !options.retry.should_retry(&err, index) {
                return Err(err);
            }

            index += 1;
            if index >= max_attempts {
                return Err(Error::RetriesExhausted {
                    attempts: index,
                    source: Box::new(err),
                });
            }

            debug!("Attempt {} against {} failed: {}", index, node, err);
        }
    }
}

#[async_trait]
impl<S, T, B> Bootable for Client<S, T, B>
where
    S: Selector,
    T: Transport,
    B: Broker,
{
    fn bootable_name(&self) -> &str {
        "client"
    }

    async fn start(&self) -> std::result::Result<(), BootableError> {
        self.inner.pool.start().await
    }

    async fn shutdown(&self) -> std::result::Result<(), BootableError> {
        self.inner.pool.shutdown().await
    }

    async fn wait(&self) {
        self.inner.pool.wait().await;
    }
}
