use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use waypoint_bootable::{BackgroundTask, Bootable, BootableError, DEFAULT_STOP_GRACE};
use waypoint_registry::{Registry, ServiceInstance};
use waypoint_transport::header::{self, ErrorDetail};
use waypoint_transport::{Connection, Listener, Message, Transport, TransportError};

use crate::error::Error;
use crate::handler::{self, HandlerError, Route};
use crate::stream::{self, ServerStream};

struct ServerInner<T, R> {
    transport: T,
    registry: R,
    instance: ServiceInstance,
    routes: DashMap<String, Route>,
    accept_task: BackgroundTask,
    connections: TaskTracker,
    shutdown: CancellationToken,
    started: AtomicBool,
}

/// Serves one service instance.
///
/// Handlers are registered per endpoint. Starting the server binds the
/// instance's address and registers the instance; shutting it down
/// deregisters it and drains open connections.
pub struct Server<T, R>
where
    T: Transport,
    R: Registry,
{
    inner: Arc<ServerInner<T, R>>,
}

impl<T, R> Clone for Server<T, R>
where
    T: Transport,
    R: Registry,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, R> std::fmt::Debug for Server<T, R>
where
    T: Transport,
    R: Registry,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("instance", &self.inner.instance)
            .field("endpoints", &self.endpoints())
            .finish_non_exhaustive()
    }
}

impl<T, R> Server<T, R>
where
    T: Transport,
    R: Registry,
{
    /// Create a server for `instance`.
    pub fn new(transport: T, registry: R, instance: ServiceInstance) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                transport,
                registry,
                instance,
                routes: DashMap::new(),
                accept_task: BackgroundTask::new("server-accept"),
                connections: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// The instance this server registers.
    pub fn instance(&self) -> &ServiceInstance {
        &self.inner.instance
    }

    /// Registered endpoints, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .inner
            .routes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    /// Open connections.
    pub fn connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Serve `endpoint` with a typed request/response handler. The reply is
    /// encoded with the request's content type.
    pub fn handle<Req, Resp, F, Fut>(&self, endpoint: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        self.route(endpoint, Route::Unary(handler::typed(handler)));
    }

    /// Serve `endpoint` with a handler that sees the whole request message,
    /// headers included.
    pub fn handle_message<F, Fut>(&self, endpoint: &str, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Message, HandlerError>> + Send + 'static,
    {
        self.route(endpoint, Route::Unary(handler::raw(handler)));
    }

    /// Serve `endpoint` with a streaming handler.
    pub fn handle_stream<F, Fut>(&self, endpoint: &str, handler: F)
    where
        F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.route(endpoint, Route::Stream(handler::stream(handler)));
    }

    fn route(&self, endpoint: &str, route: Route) {
        if self
            .inner
            .routes
            .insert(endpoint.to_string(), route)
            .is_some()
        {
            warn!("Replacing handler for {}", endpoint);
        }
    }

    async fn accept_loop(self, listener: Box<dyn Listener>, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        let server = self.clone();
                        self.inner.connections.spawn(async move {
                            server.serve(Arc::from(conn)).await;
                        });
                    }
                    Err(e) => {
                        warn!("Listener on {} stopped accepting: {}", listener.address(), e);
                        break;
                    }
                },
            }
        }

        if let Err(e) = listener.close().await {
            warn!("Failed to close listener on {}: {}", listener.address(), e);
        }
    }

    async fn serve(&self, conn: Arc<dyn Connection>) {
        debug!("Serving connection from {}", conn.remote());

        loop {
            let message = tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => break,
                received = conn.recv() => match received {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("Connection from {} ended: {}", conn.remote(), e);
                        break;
                    }
                },
            };

            // Trailing frames of a finished stream carry no endpoint.
            let Some(endpoint) = message.header(header::ENDPOINT).map(str::to_string) else {
                continue;
            };
            let Some(id) = message.header(header::ID).map(str::to_string) else {
                warn!("Dropping request for {} without an id", endpoint);
                continue;
            };

            let dispatched = tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => break,
                result = self.dispatch(&conn, id, endpoint, message) => result,
            };

            if let Err(e) = dispatched {
                debug!("Failed to reply on {}: {}", conn.remote(), e);
                break;
            }
        }

        if let Err(e) = conn.close().await {
            debug!("Failed to close connection from {}: {}", conn.remote(), e);
        }
    }

    async fn dispatch(
        &self,
        conn: &Arc<dyn Connection>,
        id: String,
        endpoint: String,
        message: Message,
    ) -> Result<(), TransportError> {
        let route = self.inner.routes.get(&endpoint).map(|route| route.clone());

        if message.flag(header::STREAM) {
            let outcome = match route {
                Some(Route::Stream(handler)) => {
                    match ServerStream::open(id.clone(), endpoint, message, conn.clone()) {
                        Ok(stream) => handler(stream).await,
                        Err(e) => Err(e.into()),
                    }
                }
                Some(Route::Unary(_)) => Err(HandlerError::bad_request(format!(
                    "{endpoint} does not accept streams"
                ))),
                None => Err(HandlerError::not_found(format!("no endpoint {endpoint}"))),
            };

            if let Err(e) = &outcome {
                debug!("Stream {} on {} failed: {}", id, self.inner.instance, e);
            }
            return stream::finish(conn.as_ref(), &id, outcome).await;
        }

        let reply = match route {
            Some(Route::Unary(handler)) => handler(message).await,
            Some(Route::Stream(_)) => Err(HandlerError::bad_request(format!(
                "{endpoint} is a streaming endpoint"
            ))),
            None => Err(HandlerError::not_found(format!("no endpoint {endpoint}"))),
        };

        let reply = reply.unwrap_or_else(|e| {
            debug!("Handler for {} failed: {}", endpoint, e);
            Message::default().with_header(header::ERROR, ErrorDetail::from(e).to_header())
        });

        conn.send(reply.with_header(header::ID, id)).await
    }
}

#[async_trait]
impl<T, R> Bootable for Server<T, R>
where
    T: Transport,
    R: Registry,
{
    fn bootable_name(&self) -> &str {
        "server"
    }

    async fn start(&self) -> Result<(), BootableError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Box::new(Error::AlreadyStarted));
        }

        let address = self.inner.instance.address();
        let listener = self
            .inner
            .transport
            .listen(address)
            .await
            .map_err(|source| Error::Listen {
                address: address.to_string(),
                source,
            })?;

        if let Err(e) = self
            .inner
            .registry
            .register(self.inner.instance.clone())
            .await
        {
            let _ = listener.close().await;
            return Err(Box::new(Error::Registry(e.to_string())));
        }

        let server = self.clone();
        self.inner
            .accept_task
            .spawn(move |token| server.accept_loop(listener, token));

        info!("Serving {} on {}", self.inner.instance.name(), address);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BootableError> {
        if let Err(e) = self.inner.registry.deregister(&self.inner.instance).await {
            warn!("Failed to deregister {}: {}", self.inner.instance, e);
        }

        self.inner.accept_task.stop(DEFAULT_STOP_GRACE).await;
        self.inner.shutdown.cancel();
        self.inner.connections.close();

        if tokio::time::timeout(DEFAULT_STOP_GRACE, self.inner.connections.wait())
            .await
            .is_err()
        {
            warn!(
                "{} connections still open after {:?}",
                self.inner.connections.len(),
                DEFAULT_STOP_GRACE
            );
        }

        info!("Stopped serving {}", self.inner.instance);
        Ok(())
    }

    async fn wait(&self) {
        self.inner.accept_task.wait().await;
    }
}
