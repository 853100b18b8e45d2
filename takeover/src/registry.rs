//! Live business connections, and the gate which keeps their handlers out of the way of a handoff.
//!
//! Handlers bracket each read-process-write cycle with [`ConnectionRegistry::enter`] and
//! [`ConnectionRegistry::leave`]. While the registry is frozen no handler starts a cycle, so once
//! [`ConnectionRegistry::freeze`] returns, no handler consumes another byte and every connection
//! can be sent to a successor with all unread bytes still queued in the kernel.

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace};

/// Prefix of the label of every connection.
pub const LABEL_PREFIX: &str = "conn#";

/// Identifier of a connection within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);
impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{LABEL_PREFIX}{}", self.0)
    }
}

/// A live business connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    /// The connection, shared with its handler. The socket closes when both let go.
    pub stream: Arc<UnixStream>,
    /// Application identifier, kept across handoffs.
    pub label: String,
    /// When the handler last served a request.
    pub last_activity: Instant,
}

/// What a handler may do when it asks to start a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Read, process and write, then [`ConnectionRegistry::leave`].
    Proceed,
    /// The connection belongs to another process (or no longer exists), the handler must stop
    /// without touching the socket.
    Relinquished,
}

/// How a cycle ended, see [`ConnectionRegistry::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// A request was served.
    Served,
    /// Nothing arrived.
    Idle,
    /// The connection is done, its record is removed.
    Closed,
}

/// Error type for [`ConnectionRegistry::freeze`].
#[derive(Debug, thiserror::Error)]
pub enum FreezeError {
    /// Handlers were still mid-cycle when the timeout elapsed.
    #[error("{active} handlers were still mid-cycle after {timeout:?}.")]
    Busy {
        /// Number of handlers mid-cycle.
        active: usize,
        /// The timeout which elapsed.
        timeout: Duration,
    },
    /// The registry was already frozen or relinquished.
    #[error("The registry was already frozen or relinquished.")]
    NotServing,
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<ConnectionId, ConnectionRecord>,
    next_id: u64,
    /// Handlers between `enter` and `leave`.
    active: usize,
    frozen: bool,
    relinquished: bool,
}

/// The connections of this process.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl ConnectionRegistry {
    /// Constructs an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Handlers never panic while holding the lock, the data is consistent regardless.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a freshly accepted connection, labelling it with a new identifier.
    pub fn insert(&self, stream: UnixStream) -> (ConnectionId, Arc<UnixStream>) {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = ConnectionId(inner.next_id);
        let stream = Arc::new(stream);
        inner.records.insert(
            id,
            ConnectionRecord {
                stream: Arc::clone(&stream),
                label: id.to_string(),
                last_activity: Instant::now(),
            },
        );
        trace!("inserted {}", id);
        (id, stream)
    }

    /// Registers a connection taken over from another process, keeping its label.
    ///
    /// A `conn#N` label keeps `N` as its identifier when `N` is not taken yet, and identifiers
    /// handed out afterwards never collide with it.
    pub fn adopt(&self, label: String, stream: UnixStream) -> (ConnectionId, Arc<UnixStream>) {
        let mut inner = self.lock();
        match label
            .strip_prefix(LABEL_PREFIX)
            .and_then(|n| n.parse::<u64>().ok())
        {
            Some(n) if n > inner.next_id => inner.next_id = n,
            _ => inner.next_id += 1,
        }
        let id = ConnectionId(inner.next_id);
        let stream = Arc::new(stream);
        debug!("adopted {} as {}", label, id);
        inner.records.insert(
            id,
            ConnectionRecord {
                stream: Arc::clone(&stream),
                label,
                last_activity: Instant::now(),
            },
        );
        (id, stream)
    }

    /// Removes connection `id` without a handler cycle, for connections whose handler never ran.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let record = self.lock().records.remove(&id);
        self.changed.notify_all();
        record
    }

    /// Label of the connection `id`.
    #[must_use]
    pub fn label(&self, id: ConnectionId) -> Option<String> {
        self.lock().records.get(&id).map(|record| record.label.clone())
    }

    /// Asks to start a cycle on connection `id`, waiting while the registry is frozen.
    pub fn enter(&self, id: ConnectionId) -> Admission {
        let mut inner = self.lock();
        while inner.frozen && !inner.relinquished {
            inner = self
                .changed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if inner.relinquished || !inner.records.contains_key(&id) {
            return Admission::Relinquished;
        }
        inner.active += 1;
        Admission::Proceed
    }

    /// Ends a cycle started with [`ConnectionRegistry::enter`].
    pub fn leave(&self, id: ConnectionId, activity: Activity) {
        let mut inner = self.lock();
        inner.active = inner.active.saturating_sub(1);
        match activity {
            Activity::Served => {
                if let Some(record) = inner.records.get_mut(&id) {
                    record.last_activity = Instant::now();
                }
            }
            Activity::Idle => {}
            Activity::Closed => {
                inner.records.remove(&id);
                trace!("removed {}", id);
            }
        }
        drop(inner);
        self.changed.notify_all();
    }

    /// Stops handlers from starting new cycles and waits, up to `timeout`, for running cycles to
    /// end.
    ///
    /// # Errors
    ///
    /// When handlers are still mid-cycle after `timeout`, the registry is thawed again.
    pub fn freeze(&self, timeout: Duration) -> Result<(), FreezeError> {
        let mut inner = self.lock();
        if inner.frozen || inner.relinquished {
            return Err(FreezeError::NotServing);
        }
        inner.frozen = true;
        let (mut inner, result) = self
            .changed
            .wait_timeout_while(inner, timeout, |inner| inner.active > 0)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && inner.active > 0 {
            let active = inner.active;
            inner.frozen = false;
            drop(inner);
            self.changed.notify_all();
            return Err(FreezeError::Busy { active, timeout });
        }
        debug!("frozen with {} connections", inner.records.len());
        Ok(())
    }

    /// Lets handlers continue after [`ConnectionRegistry::freeze`].
    pub fn thaw(&self) {
        self.lock().frozen = false;
        self.changed.notify_all();
    }

    /// Whether the registry is frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    /// The connections, in identifier order, with their labels.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Arc<UnixStream>)> {
        self.lock()
            .records
            .values()
            .map(|record| (record.label.clone(), Arc::clone(&record.stream)))
            .collect()
    }

    /// Removes every connection and tells their handlers to stop, returning the removed records.
    ///
    /// Called once the connections belong to another process. Dropping the returned records and
    /// the handlers' references closes this process' copies of the sockets.
    pub fn relinquish(&self) -> Vec<ConnectionRecord> {
        let mut inner = self.lock();
        inner.relinquished = true;
        inner.frozen = false;
        let records = std::mem::take(&mut inner.records);
        drop(inner);
        self.changed.notify_all();
        debug!("relinquished {} connections", records.len());
        records.into_values().collect()
    }

    /// Number of connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether there are no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels of the connections, in identifier order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.lock()
            .records
            .values()
            .map(|record| record.label.clone())
            .collect()
    }
}
