//! Pending request management.
//!
//! Tracks outgoing calls awaiting a correlated response. Each registration
//! hands back a [`PendingSlot`]; dropping the slot (the call returned, timed
//! out, or its future was dropped) removes the entry, so a late response for
//! an abandoned id is silently discarded.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    error::{TransportError, TransportResult},
    transport::RpcResponse,
};

/// Default bound on concurrently pending calls.
pub const DEFAULT_MAX_PENDING: usize = 1000;

type Delivery = oneshot::Sender<TransportResult<RpcResponse>>;

struct Entry {
    token: u64,
    tx: Delivery,
}

struct Inner {
    slots: RwLock<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    next_token: AtomicU64,
    capacity: usize,
}

/// Store for pending requests, shared between callers and the reader task.
#[derive(Clone)]
pub struct PendingRequests {
    inner: Arc<Inner>,
}

impl PendingRequests {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_token: AtomicU64::new(0),
                capacity,
            }),
        }
    }

    /// Next generated request id. Never returns 0.
    pub fn next_id(&self) -> u64 {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register a slot for `id`.
    pub fn register(&self, id: u64) -> TransportResult<PendingSlot> {
        let (tx, rx) = oneshot::channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut slots = self.inner.slots.write();
            if slots.len() >= self.inner.capacity {
                return Err(TransportError::capacity_exceeded(format!(
                    "{} requests already pending",
                    slots.len()
                )));
            }
            if slots.contains_key(&id) {
                return Err(TransportError::DuplicateRequestId { id });
            }
            slots.insert(id, Entry { token, tx });
        }

        Ok(PendingSlot {
            id,
            token,
            rx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Deliver `response` to the waiting call.
    ///
    /// Returns `false` when no call is waiting for the id.
    pub fn resolve(&self, response: RpcResponse) -> bool {
        let id = response.id;
        let Some(entry) = self.inner.slots.write().remove(&id) else {
            debug!(id, "dropping response without pending request");
            return false;
        };
        // Receiver may have gone away between the lookup and the send.
        entry.tx.send(Ok(response)).is_ok()
    }

    /// Fail every pending call. Returns how many were waiting.
    pub fn clear_with_error<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> TransportError,
    {
        let drained: Vec<Entry> = {
            let mut slots = self.inner.slots.write();
            slots.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(make_error()));
        }
        count
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.slots.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("pending", &self.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// Receiving half of a registration. Removes its entry when dropped.
pub struct PendingSlot {
    id: u64,
    token: u64,
    rx: oneshot::Receiver<TransportResult<RpcResponse>>,
    inner: Arc<Inner>,
}

impl PendingSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the correlated response.
    pub async fn wait(mut self) -> TransportResult<RpcResponse> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::connection_lost("pending request dropped")),
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        let mut slots = self.inner.slots.write();
        // The id may already belong to a newer registration.
        if slots.get(&self.id).is_some_and(|e| e.token == self.token) {
            slots.remove(&self.id);
        }
    }
}
