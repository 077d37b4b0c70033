//! Peer manager.
//!
//! One actor task owns every peer connection. Signaling frames, WebRTC
//! callback events, and outbound sync frames all funnel into its mailbox,
//! so per-peer state never needs a lock.
//!
//! Initiator rule: whoever just joined the room dials. The joiner receives
//! the `peers` list and offers to each existing member; existing members see
//! `peer-join` and wait for the newcomer's offer. For any pair exactly one
//! side creates the data channel, so glare cannot happen.

use std::collections::HashMap;
use std::sync::Arc;

use battery_signal::SignalFrame;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::RtcConfig;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::event::{emit, Event, EventSender};
use crate::signal::{SignalEvent, SignalingClient};
use crate::sync::{Outbound, SyncFrame, SyncSession};

/// Label of the single ordered reliable channel carried per peer.
pub const CHANNEL_LABEL: &str = "rtc-battery";

/// Attribute an offer/answer/ICE failure to the peer it concerns.
fn handshake_error(peer_id: &str, err: Error) -> Error {
    Error::PeerHandshake {
        peer_id: peer_id.to_owned(),
        reason: err.to_string(),
    }
}

#[derive(Debug)]
enum PeerCommand {
    Peers(oneshot::Sender<Vec<String>>),
    Disconnect,
}

/// Events surfaced by WebRTC callbacks into the actor mailbox.
enum RtcEvent {
    ChannelOpen {
        peer_id: String,
    },
    Frame {
        peer_id: String,
        text: String,
    },
    ChannelClosed {
        peer_id: String,
    },
    /// Responder side: the initiator's channel arrived.
    Incoming {
        peer_id: String,
        channel: Arc<RTCDataChannel>,
    },
    LocalCandidate {
        peer_id: String,
        candidate: RTCIceCandidateInit,
    },
    StateChanged {
        peer_id: String,
        state: RTCPeerConnectionState,
    },
}

struct Peer {
    connection: Arc<RTCPeerConnection>,
    channel: Option<Arc<RTCDataChannel>>,
    open: bool,
    initiator: bool,
}

/// Handle to the actor.
pub struct PeerManager {
    cmd_tx: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerManager {
    pub fn spawn(
        engine: Engine,
        local_peer_id: String,
        rtc_config: RtcConfig,
        signaling: SignalingClient,
        signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
        events: EventSender,
    ) -> PeerManager {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (rtc_tx, rtc_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let engine_events = engine.subscribe();
        let actor = Actor {
            session: SyncSession::new(engine, outbound_tx, events.clone()),
            api: APIBuilder::new().build(),
            rtc_config,
            peers: HashMap::new(),
            events,
            signaling,
            rtc_tx,
            local_peer_id,
        };
        tokio::spawn(run(actor, cmd_rx, signal_rx, rtc_rx, outbound_rx, engine_events));
        PeerManager { cmd_tx }
    }

    /// Ids of every peer currently tracked (connecting or ready).
    pub async fn peers(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(PeerCommand::Peers(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Close every peer connection and stop the actor.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(PeerCommand::Disconnect);
    }
}

struct Actor {
    session: SyncSession,
    api: API,
    rtc_config: RtcConfig,
    peers: HashMap<String, Peer>,
    events: EventSender,
    signaling: SignalingClient,
    rtc_tx: mpsc::UnboundedSender<RtcEvent>,
    local_peer_id: String,
}

async fn run(
    mut actor: Actor,
    mut cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
    mut signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
    mut rtc_rx: mpsc::UnboundedReceiver<RtcEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut engine_events: broadcast::Receiver<Event>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(PeerCommand::Peers(reply)) => {
                    let _ = reply.send(actor.peers.keys().cloned().collect());
                }
                Some(PeerCommand::Disconnect) | None => {
                    actor.shutdown().await;
                    return;
                }
            },
            Some(sig) = signal_rx.recv() => match sig {
                SignalEvent::Frame(frame) => actor.handle_signal_frame(frame).await,
                SignalEvent::Closed => {
                    // Established channels outlive signaling; without the
                    // relay we just cannot meet anyone new.
                    debug!("signaling closed; keeping existing peers");
                }
            },
            Some(ev) = rtc_rx.recv() => actor.handle_rtc_event(ev).await,
            Some(out) = outbound_rx.recv() => actor.deliver(out).await,
            engine_ev = engine_events.recv() => match engine_ev {
                Ok(Event::Operation { op, from_peer: None }) => {
                    let open = actor.open_peers();
                    actor.session.broadcast(&op, &open);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "engine event stream lagged; some operations were not broadcast live");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
    }
}

impl Actor {
    async fn handle_signal_frame(&mut self, frame: SignalFrame) {
        match frame {
            SignalFrame::Peers { peer_ids } => {
                // We are the newcomer: offer to everyone already in the room.
                for peer_id in peer_ids {
                    if peer_id != self.local_peer_id && !self.peers.contains_key(&peer_id) {
                        self.initiate(peer_id).await;
                    }
                }
            }
            SignalFrame::PeerJoin { peer_id } => {
                // The newcomer will dial us; nothing to set up yet.
                emit(&self.events, Event::PeerJoin { peer_id });
            }
            SignalFrame::PeerLeave { peer_id } => {
                self.teardown(&peer_id).await;
                emit(&self.events, Event::PeerLeave { peer_id });
            }
            SignalFrame::Offer {
                from: Some(from),
                sdp,
                ..
            } => {
                if let Err(err) = self.accept_offer(&from, sdp).await {
                    self.fail_peer(&from, handshake_error(&from, err)).await;
                }
            }
            SignalFrame::Answer {
                from: Some(from),
                sdp,
                ..
            } => {
                if let Err(err) = self.accept_answer(&from, sdp).await {
                    self.fail_peer(&from, handshake_error(&from, err)).await;
                }
            }
            SignalFrame::Ice {
                from: Some(from),
                candidate,
                ..
            } => {
                if let Err(err) = self.add_candidate(&from, candidate).await {
                    // Individual candidates are best effort; the pair may
                    // still connect on another one.
                    debug!(error = %handshake_error(&from, err), "ice candidate rejected");
                }
            }
            other => debug!(?other, "unexpected signaling frame ignored"),
        }
    }

    async fn handle_rtc_event(&mut self, event: RtcEvent) {
        match event {
            RtcEvent::ChannelOpen { peer_id } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.open = true;
                    info!(%peer_id, "data channel open");
                    emit(
                        &self.events,
                        Event::PeerReady {
                            peer_id: peer_id.clone(),
                        },
                    );
                    self.session.channel_open(&peer_id);
                }
            }
            RtcEvent::Frame { peer_id, text } => match serde_json::from_str::<SyncFrame>(&text) {
                Ok(frame) => {
                    if let Err(err) = self.session.handle_frame(&peer_id, frame).await {
                        warn!(%peer_id, error = %err, "sync frame handling failed");
                    }
                }
                Err(err) => debug!(%peer_id, error = %err, "malformed sync frame ignored"),
            },
            RtcEvent::ChannelClosed { peer_id } => {
                if self.teardown(&peer_id).await {
                    emit(&self.events, Event::PeerLeave { peer_id });
                }
            }
            RtcEvent::Incoming { peer_id, channel } => {
                debug!(%peer_id, label = channel.label(), "incoming data channel");
                self.wire_channel(&peer_id, &channel);
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.channel = Some(channel);
                }
            }
            RtcEvent::LocalCandidate { peer_id, candidate } => {
                match serde_json::to_value(candidate) {
                    Ok(candidate) => self.signaling.send(SignalFrame::Ice {
                        to: Some(peer_id),
                        from: None,
                        candidate,
                    }),
                    Err(err) => warn!(error = %err, "ice candidate serialization failed"),
                }
            }
            RtcEvent::StateChanged { peer_id, state } => {
                debug!(%peer_id, ?state, "connection state changed");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) && self.teardown(&peer_id).await
                {
                    emit(&self.events, Event::PeerLeave { peer_id });
                }
            }
        }
    }

    /// Create the connection and channel toward one existing member and
    /// send the offer.
    async fn initiate(&mut self, peer_id: String) {
        match self.start_initiator(&peer_id).await {
            Ok(peer) => {
                info!(%peer_id, "offer sent");
                self.peers.insert(peer_id, peer);
            }
            Err(err) => {
                let err = handshake_error(&peer_id, err);
                warn!(error = %err, "could not start connection");
                emit(
                    &self.events,
                    Event::Error {
                        message: err.to_string(),
                    },
                );
            }
        }
    }

    async fn start_initiator(&self, peer_id: &str) -> Result<Peer> {
        let connection = self.new_connection(peer_id).await?;
        let channel = connection.create_data_channel(CHANNEL_LABEL, None).await?;
        self.wire_channel(peer_id, &channel);
        let offer = connection.create_offer(None).await?;
        connection.set_local_description(offer.clone()).await?;
        self.signaling.send(SignalFrame::Offer {
            to: Some(peer_id.to_owned()),
            from: None,
            sdp: offer.sdp,
        });
        Ok(Peer {
            connection,
            channel: Some(channel),
            open: false,
            initiator: true,
        })
    }

    async fn accept_offer(&mut self, peer_id: &str, sdp: String) -> Result<()> {
        if !self.peers.contains_key(peer_id) {
            let connection = self.new_connection(peer_id).await?;
            self.peers.insert(
                peer_id.to_owned(),
                Peer {
                    connection,
                    channel: None,
                    open: false,
                    initiator: false,
                },
            );
        }
        let peer = self.peers.get(peer_id).expect("present or just inserted");
        let offer = RTCSessionDescription::offer(sdp)?;
        peer.connection.set_remote_description(offer).await?;
        let answer = peer.connection.create_answer(None).await?;
        peer.connection.set_local_description(answer.clone()).await?;
        self.signaling.send(SignalFrame::Answer {
            to: Some(peer_id.to_owned()),
            from: None,
            sdp: answer.sdp,
        });
        Ok(())
    }

    async fn accept_answer(&mut self, peer_id: &str, sdp: String) -> Result<()> {
        let Some(peer) = self.peers.get(peer_id) else {
            debug!(peer_id, "answer for unknown peer ignored");
            return Ok(());
        };
        let answer = RTCSessionDescription::answer(sdp)?;
        peer.connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_candidate(&mut self, peer_id: &str, candidate: serde_json::Value) -> Result<()> {
        let Some(peer) = self.peers.get(peer_id) else {
            debug!(peer_id, "candidate for unknown peer ignored");
            return Ok(());
        };
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        peer.connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn new_connection(&self, peer_id: &str) -> Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self
                .rtc_config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let connection = Arc::new(self.api.new_peer_connection(config).await?);

        let tx = self.rtc_tx.clone();
        let id = peer_id.to_owned();
        connection.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(RtcEvent::LocalCandidate {
                                peer_id: id,
                                candidate: init,
                            });
                        }
                        Err(err) => warn!(error = %err, "local candidate not serializable"),
                    }
                }
            })
        }));

        let tx = self.rtc_tx.clone();
        let id = peer_id.to_owned();
        connection.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let _ = tx.send(RtcEvent::StateChanged { peer_id: id, state });
            })
        }));

        let tx = self.rtc_tx.clone();
        let id = peer_id.to_owned();
        connection.on_data_channel(Box::new(move |channel| {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let _ = tx.send(RtcEvent::Incoming {
                    peer_id: id,
                    channel,
                });
            })
        }));

        Ok(connection)
    }

    fn wire_channel(&self, peer_id: &str, channel: &Arc<RTCDataChannel>) {
        let tx = self.rtc_tx.clone();
        let id = peer_id.to_owned();
        channel.on_open(Box::new(move || {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let _ = tx.send(RtcEvent::ChannelOpen { peer_id: id });
            })
        }));

        let tx = self.rtc_tx.clone();
        let id = peer_id.to_owned();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(RtcEvent::Frame { peer_id: id, text });
                    }
                    Err(_) => debug!(peer_id = %id, "non-utf8 channel message ignored"),
                }
            })
        }));

        let tx = self.rtc_tx.clone();
        let id = peer_id.to_owned();
        channel.on_close(Box::new(move || {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let _ = tx.send(RtcEvent::ChannelClosed { peer_id: id });
            })
        }));
    }

    async fn deliver(&mut self, out: Outbound) {
        let Some(peer) = self.peers.get(&out.peer_id) else {
            return;
        };
        let Some(channel) = &peer.channel else {
            return;
        };
        let text = match serde_json::to_string(&out.frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "unencodable sync frame dropped");
                return;
            }
        };
        if let Err(err) = channel.send_text(text).await {
            warn!(peer_id = %out.peer_id, error = %err, "channel send failed");
        }
    }

    fn open_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.open)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Handshake failure: tear the peer down and report it gone. Other
    /// peers are unaffected.
    async fn fail_peer(&mut self, peer_id: &str, err: Error) {
        warn!(error = %err, "peer handshake failed");
        emit(
            &self.events,
            Event::Error {
                message: err.to_string(),
            },
        );
        if self.teardown(peer_id).await {
            emit(
                &self.events,
                Event::PeerLeave {
                    peer_id: peer_id.to_owned(),
                },
            );
        }
    }

    /// Remove and close one peer. Returns whether it existed.
    async fn teardown(&mut self, peer_id: &str) -> bool {
        let Some(peer) = self.peers.remove(peer_id) else {
            return false;
        };
        if let Some(channel) = &peer.channel {
            let _ = channel.close().await;
        }
        let _ = peer.connection.close().await;
        debug!(peer_id, initiator = peer.initiator, "peer torn down");
        true
    }

    async fn shutdown(&mut self) {
        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.teardown(&peer_id).await;
        }
        self.signaling.disconnect();
        info!("peer manager stopped");
    }
}
