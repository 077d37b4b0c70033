//! Signaling relay.
//!
//! Rooms are named by their token, and the token is the only credential:
//! whoever presents it on the upgrade query string is in. A connection is
//! unauthenticated until its `join` frame, then a room member until the
//! socket drops. The relay forwards `offer`/`answer`/`ice` frames between
//! members of the same room and nothing else; frames for unknown targets,
//! malformed JSON, and out-of-state frames are dropped silently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use battery_signal::{SignalFrame, CLOSE_TOKEN_REQUIRED, CLOSE_TOKEN_REQUIRED_REASON};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Write half of one member connection, drained by its writer task.
type Outgoing = mpsc::UnboundedSender<Message>;

/// All rooms, shared across connection tasks.
///
/// Membership changes and the broadcasts they trigger happen under one
/// lock, so a joiner's `peers` roster is always enqueued before any
/// `peer-join` it could be named in.
#[derive(Default, Clone)]
pub struct Rooms {
    inner: Arc<Mutex<HashMap<String, HashMap<String, Outgoing>>>>,
}

impl Rooms {
    /// Add a member: roster to the joiner, `peer-join` to everyone else.
    fn join(&self, token: &str, peer_id: &str, out: Outgoing) {
        let mut rooms = self.lock();
        let room = rooms.entry(token.to_owned()).or_default();
        let existing: Vec<String> = room.keys().cloned().collect();
        if let Some(text) = frame_text(&SignalFrame::PeerJoin {
            peer_id: peer_id.to_owned(),
        }) {
            for sink in room.values() {
                let _ = sink.send(Message::Text(text.clone()));
            }
        }
        if let Some(text) = frame_text(&SignalFrame::Peers { peer_ids: existing }) {
            let _ = out.send(Message::Text(text));
        }
        room.insert(peer_id.to_owned(), out);
    }

    /// Deliver a frame to one member of the room, or drop it.
    fn forward(&self, token: &str, to: &str, frame: SignalFrame) {
        let rooms = self.lock();
        let Some(sink) = rooms.get(token).and_then(|room| room.get(to)) else {
            debug!(token, to, "target not in room; frame dropped");
            return;
        };
        if let Some(text) = frame_text(&frame) {
            let _ = sink.send(Message::Text(text));
        }
    }

    /// Remove a member, tell the others, and drop the room when empty.
    ///
    /// `out` identifies the departing connection: a member that reconnected
    /// under the same id must not be evicted by its stale predecessor.
    fn leave(&self, token: &str, peer_id: &str, out: &Outgoing) {
        let mut rooms = self.lock();
        let Some(room) = rooms.get_mut(token) else {
            return;
        };
        match room.get(peer_id) {
            Some(current) if current.same_channel(out) => {
                room.remove(peer_id);
            }
            _ => return,
        }
        if room.is_empty() {
            rooms.remove(token);
            debug!(token, "room deleted");
            return;
        }
        if let Some(text) = frame_text(&SignalFrame::PeerLeave {
            peer_id: peer_id.to_owned(),
        }) {
            for sink in room.values() {
                let _ = sink.send(Message::Text(text.clone()));
            }
        }
    }

    pub fn member_count(&self, token: &str) -> usize {
        self.lock().get(token).map_or(0, HashMap::len)
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Outgoing>>> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

fn frame_text(frame: &SignalFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(error = %err, "frame serialization failed");
            None
        }
    }
}

/// Accept loop. Runs until the listener fails.
pub async fn run(listener: TcpListener) -> anyhow::Result<()> {
    let rooms = Rooms::default();
    info!(addr = %listener.local_addr()?, "relay listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        let rooms = rooms.clone();
        tokio::spawn(async move {
            handle_connection(stream, addr, rooms).await;
        });
    }
}

/// Extract the room token from the upgrade query string.
fn token_from_query(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, rooms: Rooms) {
    let mut query: Option<String> = None;
    let ws = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        query = req.uri().query().map(str::to_owned);
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(err) => {
            debug!(%addr, error = %err, "websocket upgrade failed");
            return;
        }
    };

    let Some(token) = query.as_deref().and_then(token_from_query) else {
        warn!(%addr, "upgrade without token");
        let mut ws = ws;
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_TOKEN_REQUIRED),
                reason: CLOSE_TOKEN_REQUIRED_REASON.into(),
            }))
            .await;
        return;
    };

    let (mut ws_sink, mut ws_stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Unauthenticated until the join frame names this connection.
    let mut joined: Option<String> = None;

    while let Some(incoming) = ws_stream.next().await {
        let msg = match incoming {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%addr, error = %err, "socket error");
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<SignalFrame>(&text) else {
            debug!(%addr, "malformed frame ignored");
            continue;
        };
        match frame {
            SignalFrame::Join { peer_id } if joined.is_none() => {
                info!(%addr, %peer_id, %token, "peer joined");
                rooms.join(&token, &peer_id, out_tx.clone());
                joined = Some(peer_id);
            }
            frame @ (SignalFrame::Offer { .. }
            | SignalFrame::Answer { .. }
            | SignalFrame::Ice { .. }) => {
                let target = frame.to().map(str::to_owned);
                match (joined.as_deref(), target) {
                    (Some(sender), Some(to)) => {
                        rooms.forward(&token, &to, frame.forwarded_from(sender));
                    }
                    _ => debug!(%addr, "unaddressed or unauthenticated relay frame dropped"),
                }
            }
            other => debug!(%addr, ?other, "frame dropped"),
        }
    }

    if let Some(peer_id) = joined {
        info!(%addr, %peer_id, %token, "peer left");
        rooms.leave(&token, &peer_id, &out_tx);
    }
    drop(out_tx);
    let _ = writer.await;
}
