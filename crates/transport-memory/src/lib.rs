//! In-memory transport implementation for testing
//!
//! This transport routes messages between endpoints within the same process.
//! All endpoints that should see each other share one [`MemoryNetwork`],
//! which stands in for the wire.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use waypoint_transport::{Config, Connection, Listener, Message, Transport, TransportError};

#[derive(Clone)]
struct ListenerEntry {
    id: Uuid,
    incoming_tx: flume::Sender<Box<dyn Connection>>,
}

/// Shared routing table for memory transports.
///
/// Clones share the same table; transports created from different networks
/// cannot reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, ListenerEntry>>,
    unreachable: Arc<DashSet<String>>,
    dials: Arc<DashMap<String, AtomicU64>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make dials to `address` fail (or succeed again) without touching the listener.
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(address.to_string());
        } else {
            self.unreachable.remove(address);
        }
    }

    /// Addresses currently marked unreachable.
    pub fn unreachable(&self) -> HashSet<String> {
        self.unreachable.iter().map(|a| a.key().clone()).collect()
    }

    /// Whether something is listening on `address`.
    pub fn is_listening(&self, address: &str) -> bool {
        self.listeners.contains_key(address)
    }

    /// Number of successful dials made to `address`.
    pub fn dial_count(&self, address: &str) -> u64 {
        self.dials
            .get(address)
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    fn record_dial(&self, address: &str) {
        self.dials
            .entry(address.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::AcqRel);
    }
}

impl Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

/// Memory transport implementation
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    config: Config,
}

impl MemoryTransport {
    /// Create a transport attached to `network` with default configuration
    pub fn new(network: MemoryNetwork) -> Self {
        Self::with_config(network, Config::default())
    }

    /// Create a transport attached to `network`
    pub const fn with_config(network: MemoryNetwork, config: Config) -> Self {
        Self { network, config }
    }

    /// The network this transport routes through
    pub const fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, TransportError> {
        debug!("Dialing memory address {}", address);

        if self.network.unreachable.contains(address) {
            return Err(TransportError::Dial {
                address: address.to_string(),
                reason: "address unreachable".to_string(),
            });
        }

        // Clone the sender out so the map guard is not held across the await
        let listener = self
            .network
            .listeners
            .get(address)
            .map(|entry| entry.clone())
            .ok_or_else(|| TransportError::Dial {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            })?;

        let (client_to_server_tx, client_to_server_rx) = flume::bounded(self.config.buffer_size);
        let (server_to_client_tx, server_to_client_rx) = flume::bounded(self.config.buffer_size);

        let conn_id = Uuid::new_v4();
        let client_closed = CancellationToken::new();
        let server_closed = CancellationToken::new();

        let client_conn = MemoryConnection {
            id: conn_id,
            remote: address.to_string(),
            sender: client_to_server_tx,
            receiver: server_to_client_rx,
            closed: client_closed.clone(),
            peer_closed: server_closed.clone(),
            max_message_size: self.config.max_message_size,
        };

        let server_conn = MemoryConnection {
            id: conn_id,
            remote: format!("memory-client-{conn_id}"),
            sender: server_to_client_tx,
            receiver: client_to_server_rx,
            closed: server_closed,
            peer_closed: client_closed,
            max_message_size: self.config.max_message_size,
        };

        tokio::time::timeout(
            timeout,
            listener.incoming_tx.send_async(Box::new(server_conn)),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|_| TransportError::Dial {
            address: address.to_string(),
            reason: "listener closed".to_string(),
        })?;

        self.network.record_dial(address);
        debug!("Memory connection {} established to {}", conn_id, address);

        Ok(Box::new(client_conn))
    }

    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>, TransportError> {
        if address.is_empty() {
            return Err(TransportError::InvalidAddress(
                "empty listen address".to_string(),
            ));
        }

        let (incoming_tx, incoming_rx) = flume::unbounded();
        let id = Uuid::new_v4();

        match self.network.listeners.entry(address.to_string()) {
            Entry::Occupied(_) => {
                return Err(TransportError::AddressInUse(address.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(ListenerEntry { id, incoming_tx });
            }
        }

        info!("Memory listener created on {}", address);

        Ok(Box::new(MemoryListener {
            id,
            address: address.to_string(),
            incoming_rx,
            closed: CancellationToken::new(),
            network: self.network.clone(),
        }))
    }
}

/// Memory connection implementation
///
/// Each end owns its `closed` token and watches the peer's. Messages the peer
/// sent before closing stay readable until the channel is drained.
struct MemoryConnection {
    id: Uuid,
    remote: String,
    sender: flume::Sender<Message>,
    receiver: flume::Receiver<Message>,
    closed: CancellationToken,
    peer_closed: CancellationToken,
    max_message_size: usize,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn remote(&self) -> &str {
        &self.remote
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        if message.body.len() > self.max_message_size {
            return Err(TransportError::Protocol(format!(
                "message of {} bytes exceeds limit of {}",
                message.body.len(),
                self.max_message_size
            )));
        }

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            () = self.peer_closed.cancelled() => Err(TransportError::ConnectionClosed),
            result = self.sender.send_async(message) => {
                result.map_err(|_| TransportError::ConnectionClosed)
            }
        }
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            result = self.receiver.recv_async() => {
                result.map_err(|_| TransportError::ConnectionClosed)
            }
            () = self.peer_closed.cancelled() => {
                // Deliver whatever the peer sent before it closed
                self.receiver
                    .try_recv()
                    .map_err(|_| TransportError::ConnectionClosed)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("Closing memory connection {}", self.id);
        self.closed.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
            || self.peer_closed.is_cancelled()
            || self.sender.is_disconnected()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Memory listener implementation
struct MemoryListener {
    id: Uuid,
    address: String,
    incoming_rx: flume::Receiver<Box<dyn Connection>>,
    closed: CancellationToken,
    network: MemoryNetwork,
}

impl Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener")
            .field("address", &self.address)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Listener for MemoryListener {
    fn address(&self) -> &str {
        &self.address
    }

    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            result = self.incoming_rx.recv_async() => {
                result.map_err(|_| TransportError::ConnectionClosed)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("Closing memory listener on {}", self.address);
        self.closed.cancel();

        // Only remove our own registration; the address may have been reused
        self.network
            .listeners
            .remove_if(&self.address, |_, entry| entry.id == self.id);

        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.closed.cancel();
        self.network
            .listeners
            .remove_if(&self.address, |_, entry| entry.id == self.id);
    }
}
