//! Node event stream.
//!
//! Everything observable about a node funnels through one broadcast
//! channel: each emission is delivered to the set of subscribers that
//! existed at send time, so a handler that subscribes or drops mid-emission
//! never perturbs in-flight delivery, and a slow subscriber can only lag
//! itself, never the core.

use tokio::sync::broadcast;

use crate::op::Operation;

/// Capacity of the subscriber ring buffer before a slow consumer lags.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum Event {
    /// The signaling socket is up and the room has been joined.
    Connected,
    /// Signaling is gone for good: explicit disconnect or retries exhausted.
    Disconnected,
    /// The signaling socket dropped; a reconnect attempt is scheduled.
    Reconnecting { attempt: u32 },
    /// A reconnect attempt succeeded.
    Reconnected,
    /// A peer entered the room.
    PeerJoin { peer_id: String },
    /// A peer's data channel is open and syncing.
    PeerReady { peer_id: String },
    /// A peer left, or its connection failed and was torn down.
    PeerLeave { peer_id: String },
    /// An operation was recorded: locally produced when `from_peer` is
    /// `None`, otherwise received from that peer.
    Operation {
        op: Operation,
        from_peer: Option<String>,
    },
    /// Remote operations were applied from one peer.
    Sync { count: usize, peer_id: String },
    /// A non-fatal failure the caller may want to observe.
    Error { message: String },
}

pub type EventSender = broadcast::Sender<Event>;
pub type EventReceiver = broadcast::Receiver<Event>;

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_BUFFER).0
}

/// Send without caring whether anyone is listening.
pub fn emit(tx: &EventSender, event: Event) {
    let _ = tx.send(event);
}
