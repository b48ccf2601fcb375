//! Publisher connections and the fixed-capacity slot array holding them.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// A live publisher link, shared between the pool and the callers currently publishing on it.
pub struct Connection<L> {
    /// Unique per dial: a slot reused by a later dial never carries the same id.
    id: u64,
    link: L,
    published: AtomicU64,
}

impl<L> Connection<L> {
    pub(super) fn new(id: u64, link: L) -> Self {
        Self {
            id,
            link,
            published: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying transport link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Number of messages successfully published on this connection.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub(super) fn record_publish(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }
}

/// A [`Connection`] handed out by [`ConnectionPool::get_connection`].
///
/// It remembers the slot it was taken from, so that a failure can be reported back to the pool
/// without risking to flag whatever connection took its place in the meantime.
///
/// [`ConnectionPool::get_connection`]: super::ConnectionPool::get_connection
pub struct PooledConnection<L> {
    pub(super) slot: usize,
    pub(super) connection: Arc<Connection<L>>,
}

impl<L> Clone for PooledConnection<L> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot,
            connection: Arc::clone(&self.connection),
        }
    }
}

impl<L> std::ops::Deref for PooledConnection<L> {
    type Target = Connection<L>;

    fn deref(&self) -> &Connection<L> {
        &self.connection
    }
}

pub(super) struct Entry<L> {
    pub(super) connection: Arc<Connection<L>>,
    pub(super) idle_deadline: Instant,
}

pub(super) enum Slot<L> {
    Vacant,
    /// Reserved by a caller that is dialing a new connection.
    Dialing,
    Live(Entry<L>),
}

/// A connection flagged for removal, waiting for in-flight publishes to drain.
pub(super) struct Retiring<L> {
    pub(super) connection: Arc<Connection<L>>,
    pub(super) flagged_at: Instant,
}

/// Fixed-capacity slot array with an explicit free list.
///
/// Removing a connection never shifts the others: indices held by callers stay valid.
pub(super) struct Slots<L> {
    entries: Vec<Slot<L>>,
    /// Vacant indices; the lowest index is at the end so that it gets reused first.
    free: Vec<usize>,
}

impl<L> Slots<L> {
    pub(super) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| Slot::Vacant).collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    pub(super) fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Slots that are live or being dialed.
    pub(super) fn occupied(&self) -> usize {
        self.capacity() - self.free.len()
    }

    pub(super) fn live(&self) -> usize {
        self.entries
            .iter()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub(super) fn entry_mut(&mut self, index: usize) -> Option<&mut Entry<L>> {
        match self.entries.get_mut(index) {
            Some(Slot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Reserve a vacant slot for a connection that is about to be dialed.
    pub(super) fn reserve(&mut self) -> Option<usize> {
        let index = self.free.pop()?;
        self.entries[index] = Slot::Dialing;
        Some(index)
    }

    /// Install a freshly dialed connection in a reserved slot.
    pub(super) fn fill(&mut self, index: usize, entry: Entry<L>) {
        self.entries[index] = Slot::Live(entry);
    }

    /// Give back a reserved slot whose dial failed or was abandoned.
    pub(super) fn release(&mut self, index: usize) {
        if matches!(self.entries[index], Slot::Dialing) {
            self.entries[index] = Slot::Vacant;
            self.free.push(index);
        }
    }

    /// Take the connection out of `index` if it is still the one identified by `id`.
    pub(super) fn take(&mut self, index: usize, id: u64) -> Option<Arc<Connection<L>>> {
        match self.entries.get(index) {
            Some(Slot::Live(entry)) if entry.connection.id() == id => {}
            _ => return None,
        }
        match std::mem::replace(&mut self.entries[index], Slot::Vacant) {
            Slot::Live(entry) => {
                self.free.push(index);
                Some(entry.connection)
            }
            _ => None,
        }
    }

    /// The first live slot at or after `cursor`, wrapping around.
    pub(super) fn next_live(&self, cursor: usize) -> Option<usize> {
        let capacity = self.capacity();
        if capacity == 0 {
            return None;
        }
        (0..capacity)
            .map(|step| (cursor % capacity + step) % capacity)
            .find(|&index| matches!(self.entries[index], Slot::Live(_)))
    }

    /// Empty every slot, returning the live connections.
    pub(super) fn drain(&mut self) -> Vec<Arc<Connection<L>>> {
        let capacity = self.capacity();
        let connections = self
            .entries
            .iter_mut()
            .filter_map(|slot| match std::mem::replace(slot, Slot::Vacant) {
                Slot::Live(entry) => Some(entry.connection),
                _ => None,
            })
            .collect();
        self.free = (0..capacity).rev().collect();
        connections
    }
}
