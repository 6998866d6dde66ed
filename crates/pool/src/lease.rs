use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, warn};
use waypoint_transport::{Connection, Message, TransportError};

use crate::{AddressPool, discard};

/// A connection borrowed from the pool for one call.
///
/// Hand it back with [`PooledConnection::release`]. A lease that is dropped
/// without being released (the call was cancelled or panicked) is treated as
/// broken: its connection is closed and its slot freed.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    address: String,
    reused: bool,
    slot: Arc<AddressPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub(crate) fn new(
        conn: Box<dyn Connection>,
        address: String,
        reused: bool,
        slot: Arc<AddressPool>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            address,
            reused,
            slot,
            permit: Some(permit),
        }
    }

    /// Destination address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the connection came from the idle set rather than a fresh dial.
    pub const fn reused(&self) -> bool {
        self.reused
    }

    /// Send a message on the borrowed connection.
    ///
    /// # Errors
    ///
    /// Propagates the transport's error.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        match &self.conn {
            Some(conn) => conn.send(message).await,
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Receive a message on the borrowed connection.
    ///
    /// # Errors
    ///
    /// Propagates the transport's error.
    pub async fn recv(&self) -> Result<Message, TransportError> {
        match &self.conn {
            Some(conn) => conn.recv().await,
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Whether the underlying connection is closed.
    pub fn is_closed(&self) -> bool {
        self.conn.as_ref().is_none_or(|conn| conn.is_closed())
    }

    /// Return the connection to the pool.
    ///
    /// Healthy, open connections go back to the idle set; anything else is
    /// closed and discarded.
    pub fn release(mut self, healthy: bool) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if healthy && !conn.is_closed() && !self.slot.is_closed() {
            self.slot.idle.lock().push(crate::Idle {
                conn,
                last_used: Instant::now(),
            });
        } else {
            debug!("Discarding connection to {}", self.address);
            discard(conn);
        }

        // Free the slot only after the connection is back in the idle set.
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                "Connection to {} dropped without release, closing it",
                self.address
            );
            discard(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("address", &self.address)
            .field("reused", &self.reused)
            .field("released", &self.conn.is_none())
            .finish()
    }
}
