//! Error kinds surfaced by the node.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A node method was called before `init()`.
    #[error("node is not initialized")]
    NotInitialized,

    /// `connect` was called without a usable URL or token.
    #[error("missing connection setting: {0}")]
    ConfigMissing(&'static str),

    /// The signaling socket failed to open, send, or receive.
    #[error("signaling transport: {0}")]
    SignalingTransport(String),

    /// A signaling frame could not be understood.
    #[error("signaling protocol: {0}")]
    SignalingProtocol(String),

    /// Offer/answer/ICE negotiation with one peer failed.
    #[error("handshake with peer {peer_id}: {reason}")]
    PeerHandshake { peer_id: String, reason: String },

    /// A serialized clock value did not parse back.
    #[error("malformed timestamp string: {0}")]
    MalformedTimestamp(String),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::SignalingTransport(err.to_string())
    }
}
