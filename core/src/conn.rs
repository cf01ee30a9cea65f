//! Connection handle: a cheap, cloneable reference to a client's write side.
//!
//! A connection is read by the transport's reader task, looked up by the
//! registry, and stored in every pending command targeting its agent.
//! Modelled here as shared, read-mostly ownership (`Clone` + identity
//! comparison) with exclusive write access serialized through a per
//! connection queue, per the per-connection writer-queue design.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::envelope::Envelope;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A reference to one connection's outgoing queue.
///
/// Cloning shares the same underlying channel; identity (`==`, `Hash`) is
/// based on a monotonic id assigned at construction, not on the channel
/// itself, so the registry can index connections cheaply.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    outgoing: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver a writer task should drain.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            outgoing: tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueue an envelope for delivery. Fails only if the connection's
    /// writer task has already exited.
    pub fn send(&self, envelope: Envelope) -> Result<(), Envelope> {
        self.outgoing.send(envelope).map_err(|e| e.0)
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish()
    }
}
