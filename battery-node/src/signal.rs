//! Signaling client.
//!
//! Maintains the WebSocket to the relay: joins the room on every (re)open,
//! pushes outgoing handshake frames, and feeds incoming frames to the peer
//! manager. The socket task owns reconnection; everything else only ever
//! talks to it through its command channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use battery_signal::SignalFrame;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SignalingConfig;
use crate::error::{Error, Result};
use crate::event::{emit, Event, EventSender};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Instructions for the socket task.
#[derive(Debug)]
pub enum SignalCommand {
    /// Relay a frame to the room (addressed with `to`).
    Send(SignalFrame),
    /// Close the socket and stop reconnecting.
    Disconnect,
}

/// What the socket task reports upward.
#[derive(Debug)]
pub enum SignalEvent {
    /// A frame arrived from the relay.
    Frame(SignalFrame),
    /// The client is gone for good; no further frames will arrive.
    Closed,
}

#[derive(Clone)]
pub struct SignalingClient {
    cmd_tx: mpsc::UnboundedSender<SignalCommand>,
    connected: Arc<AtomicBool>,
}

impl SignalingClient {
    /// Open the signaling connection and join the room.
    ///
    /// The first connection attempt happens inline so a bad URL or an
    /// unreachable relay fails the call; later drops are retried with
    /// exponential backoff by the spawned task.
    pub async fn connect(
        url: &str,
        token: &str,
        peer_id: String,
        config: SignalingConfig,
        events: EventSender,
        frames: mpsc::UnboundedSender<SignalEvent>,
    ) -> Result<SignalingClient> {
        let endpoint = endpoint(url, token)?;
        let ws = open_and_join(&endpoint, &peer_id).await?;
        info!(%endpoint, peer_id, "signaling connected");

        let connected = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(
            ws,
            endpoint,
            peer_id,
            config,
            events,
            frames,
            cmd_rx,
            connected.clone(),
        ));
        Ok(SignalingClient { cmd_tx, connected })
    }

    pub fn send(&self, frame: SignalFrame) {
        let _ = self.cmd_tx.send(SignalCommand::Send(frame));
    }

    /// Stop the client. Suppresses reconnection.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(SignalCommand::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

fn endpoint(url: &str, token: &str) -> Result<Url> {
    if url.is_empty() {
        return Err(Error::ConfigMissing("signaling url"));
    }
    if token.is_empty() {
        return Err(Error::ConfigMissing("room token"));
    }
    let mut parsed =
        Url::parse(url).map_err(|e| Error::SignalingProtocol(format!("invalid url: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(Error::SignalingProtocol(format!(
                "unsupported scheme: {other}"
            )))
        }
    }
    parsed.query_pairs_mut().append_pair("token", token);
    Ok(parsed)
}

async fn open_and_join(endpoint: &Url, peer_id: &str) -> Result<WsStream> {
    let (mut ws, _) = connect_async(endpoint.as_str()).await?;
    let join = serde_json::to_string(&SignalFrame::Join {
        peer_id: peer_id.to_owned(),
    })?;
    ws.send(Message::Text(join)).await?;
    Ok(ws)
}

#[allow(clippy::too_many_arguments)]
async fn run(
    mut ws: WsStream,
    endpoint: Url,
    peer_id: String,
    config: SignalingConfig,
    events: EventSender,
    frames: mpsc::UnboundedSender<SignalEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<SignalCommand>,
    connected: Arc<AtomicBool>,
) {
    emit(&events, Event::Connected);

    'session: loop {
        // Pump the live socket.
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SignalCommand::Send(frame)) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "unencodable signaling frame dropped");
                                continue;
                            }
                        };
                        if let Err(err) = ws.send(Message::Text(text)).await {
                            warn!(error = %err, "signaling send failed; socket presumed dead");
                            break;
                        }
                    }
                    Some(SignalCommand::Disconnect) | None => {
                        let _ = ws.close(None).await;
                        connected.store(false, Ordering::Relaxed);
                        emit(&events, Event::Disconnected);
                        let _ = frames.send(SignalEvent::Closed);
                        return;
                    }
                },
                incoming = ws.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalFrame>(&text) {
                        Ok(frame) => {
                            let _ = frames.send(SignalEvent::Frame(frame));
                        }
                        Err(err) => {
                            // Protocol noise is dropped, never fatal.
                            debug!(error = %err, "malformed signaling frame ignored");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "signaling receive failed");
                        break;
                    }
                },
            }
        }

        connected.store(false, Ordering::Relaxed);

        // Reconnect with exponential backoff.
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > config.max_reconnect_attempts {
                warn!(attempts = config.max_reconnect_attempts, "signaling reconnect exhausted");
                emit(&events, Event::Disconnected);
                let _ = frames.send(SignalEvent::Closed);
                return;
            }
            emit(&events, Event::Reconnecting { attempt });
            let delay = config
                .reconnect_base_ms
                .saturating_mul(2u64.saturating_pow(attempt - 1))
                .min(config.reconnect_max_ms);
            let sleep = tokio::time::sleep(std::time::Duration::from_millis(delay));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(SignalCommand::Send(_)) => {
                            // Nothing to deliver it on; handshake frames are
                            // only meaningful against a live room anyway.
                            debug!("signaling frame dropped while offline");
                        }
                        Some(SignalCommand::Disconnect) | None => {
                            emit(&events, Event::Disconnected);
                            let _ = frames.send(SignalEvent::Closed);
                            return;
                        }
                    },
                }
            }
            match open_and_join(&endpoint, &peer_id).await {
                Ok(fresh) => {
                    ws = fresh;
                    connected.store(true, Ordering::Relaxed);
                    info!(attempt, "signaling reconnected");
                    emit(&events, Event::Reconnected);
                    continue 'session;
                }
                Err(err) => {
                    debug!(attempt, error = %err, "reconnect attempt failed");
                }
            }
        }
    }
}
