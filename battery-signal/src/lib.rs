//! Signaling wire protocol
//!
//! UTF-8 JSON frames exchanged over the relay WebSocket. Both sides speak the
//! same vocabulary:
//!
//! - Client -> relay: `join`, then `offer`/`answer`/`ice` addressed with `to`
//! - Relay -> client: `peers` (on join), `peer-join`/`peer-leave` (membership),
//!   and forwarded `offer`/`answer`/`ice` stamped with `from`
//!
//! The relay rewrites the addressing on the way through: it strips `to` and
//! inserts the sender's peer id as `from`. SDP and ICE payloads are carried
//! opaquely; the relay never inspects them.

use serde::{Deserialize, Serialize};

/// WebSocket close code sent when the upgrade carries no room token.
pub const CLOSE_TOKEN_REQUIRED: u16 = 4001;

/// Close reason paired with [`CLOSE_TOKEN_REQUIRED`].
pub const CLOSE_TOKEN_REQUIRED_REASON: &str = "Token required";

/// One signaling frame.
///
/// `offer`/`answer`/`ice` carry `to` when travelling client -> relay and
/// `from` when travelling relay -> client; the absent side is omitted from
/// the JSON entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalFrame {
    /// Announce membership in the room named by the connection token.
    Join {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Existing room members, sent to a joiner before any `peer-join`.
    Peers {
        #[serde(rename = "peerIds")]
        peer_ids: Vec<String>,
    },
    /// A new member entered the room.
    PeerJoin {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// A member left the room or its socket closed.
    PeerLeave {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// SDP offer for one target peer.
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: String,
    },
    /// SDP answer for one target peer.
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: String,
    },
    /// Trickled ICE candidate, forwarded verbatim.
    Ice {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        candidate: serde_json::Value,
    },
}

impl SignalFrame {
    /// Target peer id of a relayable frame, if any.
    pub fn to(&self) -> Option<&str> {
        match self {
            SignalFrame::Offer { to, .. }
            | SignalFrame::Answer { to, .. }
            | SignalFrame::Ice { to, .. } => to.as_deref(),
            _ => None,
        }
    }

    /// Rebuild a relayable frame for delivery: drop `to`, stamp `from`.
    pub fn forwarded_from(self, sender: &str) -> SignalFrame {
        match self {
            SignalFrame::Offer { sdp, .. } => SignalFrame::Offer {
                to: None,
                from: Some(sender.to_owned()),
                sdp,
            },
            SignalFrame::Answer { sdp, .. } => SignalFrame::Answer {
                to: None,
                from: Some(sender.to_owned()),
                sdp,
            },
            SignalFrame::Ice { candidate, .. } => SignalFrame::Ice {
                to: None,
                from: Some(sender.to_owned()),
                candidate,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_wire_shape() {
        let json = serde_json::to_value(SignalFrame::Join {
            peer_id: "p1".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "join", "peerId": "p1"}));
    }

    #[test]
    fn peer_join_uses_kebab_type() {
        let frame: SignalFrame =
            serde_json::from_str(r#"{"type":"peer-join","peerId":"abc"}"#).unwrap();
        assert_eq!(
            frame,
            SignalFrame::PeerJoin {
                peer_id: "abc".into()
            }
        );
    }

    #[test]
    fn offer_omits_absent_addressing() {
        let json = serde_json::to_string(&SignalFrame::Offer {
            to: Some("b".into()),
            from: None,
            sdp: "v=0".into(),
        })
        .unwrap();
        assert!(json.contains(r#""to":"b""#));
        assert!(!json.contains("from"));
    }

    #[test]
    fn forwarding_rewrites_addressing() {
        let sent = SignalFrame::Ice {
            to: Some("b".into()),
            from: None,
            candidate: serde_json::json!({"candidate": "candidate:0 1 UDP"}),
        };
        let delivered = sent.forwarded_from("a");
        match delivered {
            SignalFrame::Ice { to, from, .. } => {
                assert_eq!(to, None);
                assert_eq!(from.as_deref(), Some("a"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<SignalFrame>(r#"{"type":"nonsense"}"#).is_err());
    }
}
