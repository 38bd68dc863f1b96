use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, trace};

use crate::sample::TelemetrySample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The subscriber is gone. The handle must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The outbox was full and its oldest sample was dropped to make room.
    Evicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Disconnected,
    DeliveryFailed,
    Shutdown,
}

/// Sending half of one subscriber's outbox.
///
/// The outbox is a ring: when it is full the oldest queued sample is
/// overwritten, so the newest sample always reaches the subscriber.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    capacity: usize,
    outbox: broadcast::Sender<Arc<TelemetrySample>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `sample` without waiting. Fails only once the subscriber has
    /// gone away.
    pub fn deliver(&self, sample: &Arc<TelemetrySample>) -> Result<Delivery, Closed> {
        let full = self.outbox.len() >= self.capacity;
        self.outbox.send(sample.clone()).map_err(|_| Closed)?;
        Ok(if full {
            Delivery::Evicted
        } else {
            Delivery::Queued
        })
    }
}

/// The set of live subscribers.
///
/// Handles live in a sharded concurrent map. Broadcast passes work on a
/// [`Registry::snapshot`], so connects and disconnects never disturb a pass
/// that is already running, and removal is a single atomic map operation.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    handles: DashMap<ConnectionId, ConnectionHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber whose outbox holds up to `capacity` samples.
    pub fn register(self: &Arc<Self>, capacity: usize) -> Subscription {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // the ring is allocated in powers of two
        let capacity = capacity.max(1).next_power_of_two();
        let (outbox, rx) = broadcast::channel(capacity);
        self.handles.insert(
            id,
            ConnectionHandle {
                id,
                capacity,
                outbox,
            },
        );
        debug!(%id, subscribers = self.handles.len(), "subscriber registered");
        Subscription {
            id,
            rx: Some(rx),
            registry: self.clone(),
        }
    }

    /// Removes a handle. Returns false if it was already removed.
    pub fn remove(&self, id: ConnectionId, reason: RemovalReason) -> bool {
        let removed = self.handles.remove(&id).is_some();
        if removed {
            debug!(%id, ?reason, subscribers = self.handles.len(), "subscriber removed");
        }
        removed
    }

    pub fn handle(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.handles.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.handles.contains_key(&id)
    }

    /// Copies the current handle set.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drops every handle, closing all outboxes.
    pub fn clear(&self, reason: RemovalReason) -> usize {
        let ids: Vec<_> = self.handles.iter().map(|entry| *entry.key()).collect();
        let count = ids
            .into_iter()
            .filter(|id| self.remove(*id, reason))
            .count();
        if count > 0 {
            info!(count, ?reason, "removed all subscribers");
        }
        count
    }
}

/// Receiving half of a subscriber's outbox.
///
/// Dropping the subscription is an explicit disconnect and removes the
/// handle from the registry.
pub struct Subscription {
    id: ConnectionId,
    rx: Option<broadcast::Receiver<Arc<TelemetrySample>>>,
    registry: Arc<Registry>,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Waits for the next sample. Returns `None` once the handle has been
    /// removed and the outbox is drained. Samples evicted while the
    /// subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<Arc<TelemetrySample>> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(sample) => return Some(sample),
                Err(RecvError::Lagged(skipped)) => {
                    trace!(id = %self.id, skipped, "subscriber lagged")
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<TelemetrySample>> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(sample) => return Some(sample),
                Err(TryRecvError::Lagged(skipped)) => {
                    trace!(id = %self.id, skipped, "subscriber lagged")
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registry.contains(self.id)
    }

    /// Closes the outbox while leaving the handle registered, like a peer
    /// that vanished before its disconnect was processed.
    #[cfg(test)]
    pub(crate) fn close(&mut self) {
        self.rx = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(self.id, RemovalReason::Disconnected);
    }
}
