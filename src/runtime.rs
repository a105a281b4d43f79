//! The library runtime: the explicit home of what the original kept in
//! process-global state, most importantly the deferred-close queue for
//! connections whose close was requested from one of their own threads.

use crate::conn::Connection;
use crate::{FeedConfiguration, FeedResult};
use std::sync::{Arc, Mutex};

/// The entry point of the crate. Create one per process, connect through
/// it, and keep it alive for as long as connections exist.
#[derive(Clone, Debug, Default)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

#[derive(Debug, Default)]
pub(crate) struct RuntimeInner {
    deferred: Mutex<Vec<Connection>>,
}

impl RuntimeInner {
    pub(crate) fn defer_close(&self, connection: Connection) {
        if let Ok(mut deferred) = self.deferred.lock() {
            deferred.push(connection);
        }
    }

    fn drain(&self) -> usize {
        let connections = match self.deferred.lock() {
            Ok(mut deferred) => std::mem::take(&mut *deferred),
            Err(_) => return 0,
        };
        let count = connections.len();
        for connection in connections {
            connection.shutdown_now();
        }
        count
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dials the feed at `address` (see [`crate::AddressList`] for the
    /// grammar) and returns a live connection.
    ///
    /// Draining any deferred closes first keeps a close requested from a
    /// listener from being postponed indefinitely.
    pub fn connect(&self, address: &str, config: FeedConfiguration) -> FeedResult<Connection> {
        self.inner.drain();
        Connection::connect(Arc::clone(&self.inner), address, config)
    }

    /// Closes every connection whose close was deferred because it was
    /// requested from one of its own threads. Returns how many were
    /// closed.
    pub fn drain_deferred_closes(&self) -> usize {
        self.inner.drain()
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        let connections = self
            .deferred
            .get_mut()
            .map(std::mem::take)
            .unwrap_or_default();
        for connection in connections {
            connection.shutdown_now();
        }
    }
}
