//! Data channel sync protocol.
//!
//! One JSON frame per channel message. A freshly opened channel asks for the
//! tail of the peer's log past the last version exchanged with that peer;
//! after catch-up, every local operation is broadcast live as an `op` frame.
//!
//! The session itself is transport-agnostic: frames come in through
//! [`SyncSession::handle_frame`] and go out through an mpsc channel the peer
//! manager drains into the data channels. That keeps the whole protocol
//! testable against a second session with the channels crossed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::event::{emit, Event, EventSender};
use crate::op::Operation;

/// One frame on the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncFrame {
    /// Live broadcast of a single operation.
    Op { payload: Operation, version: String },
    /// Ask for every operation with version strictly greater than
    /// `from_version`; absent means the full log.
    SyncRequest {
        #[serde(
            rename = "fromVersion",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        from_version: Option<String>,
    },
    /// Reply to a request. `version` is the sender's latest log version.
    SyncResponse {
        operations: Vec<Operation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Ping,
    Pong,
}

/// A frame addressed to one peer, ready for the transport.
#[derive(Debug)]
pub struct Outbound {
    pub peer_id: String,
    pub frame: SyncFrame,
}

/// Per-node sync state across all peers.
pub struct SyncSession {
    engine: Engine,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: EventSender,
    /// Last version exchanged per peer; survives channel churn so a
    /// reconnect resumes as a delta instead of a full replay.
    cursors: HashMap<String, String>,
}

impl SyncSession {
    pub fn new(
        engine: Engine,
        outbound: mpsc::UnboundedSender<Outbound>,
        events: EventSender,
    ) -> Self {
        Self {
            engine,
            outbound,
            events,
            cursors: HashMap::new(),
        }
    }

    /// A data channel to `peer_id` just opened: ask for its tail.
    pub fn channel_open(&mut self, peer_id: &str) {
        let from_version = self.cursors.get(peer_id).cloned();
        debug!(peer_id, from_version = from_version.as_deref(), "requesting sync");
        self.send(
            peer_id,
            SyncFrame::SyncRequest { from_version },
        );
    }

    /// Process one frame received from `peer_id`.
    pub async fn handle_frame(&mut self, peer_id: &str, frame: SyncFrame) -> Result<()> {
        match frame {
            SyncFrame::Op { payload, version } => {
                self.engine.apply_remote(payload, Some(peer_id)).await?;
                self.advance_cursor(peer_id, &version);
                emit(
                    &self.events,
                    Event::Sync {
                        count: 1,
                        peer_id: peer_id.to_owned(),
                    },
                );
            }
            SyncFrame::SyncRequest { from_version } => {
                // A cursor this log has never seen degrades to a full send;
                // more bandwidth, but catch-up stays complete.
                let cursor = match from_version.as_deref() {
                    Some(v) => {
                        if self.engine.has_version(v).await? {
                            Some(v)
                        } else {
                            debug!(peer_id, cursor = v, "unknown cursor; sending full log");
                            None
                        }
                    }
                    None => None,
                };
                let operations = self.engine.ops_since(cursor).await?;
                let version = self.engine.version().await?;
                debug!(
                    peer_id,
                    from_version = from_version.as_deref(),
                    count = operations.len(),
                    "answering sync request"
                );
                self.send(
                    peer_id,
                    SyncFrame::SyncResponse {
                        operations,
                        version,
                    },
                );
            }
            SyncFrame::SyncResponse {
                mut operations,
                version,
            } => {
                // Version order within the batch makes bulk application
                // deterministic regardless of how the sender enumerated.
                operations.sort_by(|a, b| a.version().cmp(&b.version()));
                let count = operations.len();
                for op in operations {
                    let v = op.version();
                    self.engine.apply_remote(op, Some(peer_id)).await?;
                    self.advance_cursor(peer_id, &v);
                }
                if let Some(v) = version {
                    self.advance_cursor(peer_id, &v);
                }
                if count > 0 {
                    emit(
                        &self.events,
                        Event::Sync {
                            count,
                            peer_id: peer_id.to_owned(),
                        },
                    );
                }
            }
            SyncFrame::Ping => self.send(peer_id, SyncFrame::Pong),
            SyncFrame::Pong => {}
        }
        Ok(())
    }

    /// Fan a locally produced operation out to every open peer.
    pub fn broadcast(&mut self, op: &Operation, open_peers: &[String]) {
        let version = op.version();
        for peer_id in open_peers {
            self.send(
                peer_id,
                SyncFrame::Op {
                    payload: op.clone(),
                    version: version.clone(),
                },
            );
            self.advance_cursor(peer_id, &version);
        }
    }

    /// Last version exchanged with a peer, if any.
    pub fn cursor(&self, peer_id: &str) -> Option<&str> {
        self.cursors.get(peer_id).map(String::as_str)
    }

    fn advance_cursor(&mut self, peer_id: &str, version: &str) {
        let entry = self.cursors.entry(peer_id.to_owned()).or_default();
        if version > entry.as_str() {
            *entry = version.to_owned();
        }
    }

    fn send(&self, peer_id: &str, frame: SyncFrame) {
        if self
            .outbound
            .send(Outbound {
                peer_id: peer_id.to_owned(),
                frame,
            })
            .is_err()
        {
            warn!(peer_id, "sync transport is gone; frame dropped");
        }
    }
}
