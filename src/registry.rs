use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionId};
use crate::error::{RelayError, Result};

struct Inner {
    connections: BTreeMap<ConnectionId, Arc<Connection>>,
    next_id: u64,
}

/// The set of live listeners.
///
/// Every mutation and every snapshot takes the same lock, and the lock is only
/// held for map operations. Fan-out iterates a [`snapshot`](Self::snapshot),
/// so pushes into listener queues happen outside the lock.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    queue_capacity: usize,
    max_listeners: Option<usize>,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize, max_listeners: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: BTreeMap::new(),
                next_id: 0,
            }),
            queue_capacity,
            max_listeners,
        }
    }

    /// Adds a new listener with a fresh identity.
    pub fn register(&self) -> Result<Arc<Connection>> {
        let mut inner = self.inner.lock();
        if let Some(max) = self.max_listeners {
            if inner.connections.len() >= max {
                warn!("Refusing listener: limit of {} reached", max);
                return Err(RelayError::RegistrationFailed(format!(
                    "listener limit of {max} reached"
                )));
            }
        }
        let id = inner.next_id;
        inner.next_id = id.checked_add(1).ok_or_else(|| {
            warn!("Refusing listener: connection ids exhausted");
            RelayError::RegistrationFailed("connection ids exhausted".into())
        })?;

        let connection = Arc::new(Connection::new(ConnectionId(id), self.queue_capacity));
        inner.connections.insert(connection.id(), connection.clone());
        info!(
            "Starting connection with id: {} ({} active)",
            id,
            inner.connections.len()
        );
        Ok(connection)
    }

    /// Removes a listener. Removing an id that is already gone is a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let removed = inner.connections.remove(&id);
        if let Some(conn) = &removed {
            info!(
                "Removing connection with id: {} after {:.1}s ({} active, {} dropped)",
                id.get(),
                conn.created_at().elapsed().as_secs_f64(),
                inner.connections.len(),
                conn.dropped()
            );
        }
        removed
    }

    /// Point-in-time copy of the registered handles, in id order.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }

    /// Fires the stop signal of every registered listener. Returns how many
    /// signals were fired by this call.
    pub fn stop_all(&self) -> usize {
        self.snapshot().iter().filter(|conn| conn.stop()).count()
    }

    /// Sum of backpressure drops over the registered listeners.
    pub fn total_dropped(&self) -> u64 {
        self.snapshot().iter().map(|conn| conn.dropped()).sum()
    }
}
