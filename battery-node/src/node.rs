//! Node surface.
//!
//! Ties the replication engine to the network stack. A node is usable
//! offline after `init`; `connect` adds the signaling client and the peer
//! manager on top, and `disconnect` removes them again without touching
//! local state.

use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::event::{EventReceiver, EventSender};
use crate::peer::PeerManager;
use crate::signal::SignalingClient;
use crate::sql::{ExecResult, SqlValue};
use crate::store::Store;

/// Meta key under which the node persists its generated identity.
const NODE_ID_KEY: &str = "node_id";

struct Net {
    signaling: SignalingClient,
    peers: PeerManager,
}

#[derive(Default)]
struct State {
    engine: Option<Engine>,
    node_id: Option<String>,
    net: Option<Net>,
}

pub struct Node {
    config: Config,
    events: EventSender,
    state: Mutex<State>,
}

impl Node {
    pub fn new(config: Config) -> Node {
        Node {
            config,
            events: crate::event::channel(),
            state: Mutex::new(State::default()),
        }
    }

    /// Open the store, restore the snapshot and log, and become ready.
    /// Idempotent.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.engine.is_some() {
            return Ok(());
        }
        let store = Store::open(&self.config.node.data_dir, &self.config.node.db_name)?;
        let node_id = match store.meta(NODE_ID_KEY)? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                store.put_meta(NODE_ID_KEY, &id)?;
                id
            }
        };
        info!(%node_id, db_name = %self.config.node.db_name, "node initialized");
        let engine = Engine::open(
            store,
            node_id.clone(),
            self.events.clone(),
            Duration::from_millis(self.config.sync.snapshot_debounce_ms),
        )?;
        state.engine = Some(engine);
        state.node_id = Some(node_id);
        Ok(())
    }

    /// Join a room: open signaling, then let the peer manager build data
    /// channels as members appear.
    pub async fn connect(&self, url: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let engine = state.engine.clone().ok_or(Error::NotInitialized)?;
        let node_id = state
            .node_id
            .clone()
            .ok_or(Error::NotInitialized)?;
        if state.net.is_some() {
            debug!("already connected; ignoring");
            return Ok(());
        }
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let signaling = SignalingClient::connect(
            url,
            token,
            node_id.clone(),
            self.config.signaling.clone(),
            self.events.clone(),
            frame_tx,
        )
        .await?;
        let peers = PeerManager::spawn(
            engine,
            node_id,
            self.config.rtc.clone(),
            signaling.clone(),
            frame_rx,
            self.events.clone(),
        );
        state.net = Some(Net { signaling, peers });
        Ok(())
    }

    /// Execute a statement, replicating mutations on synced tables.
    pub async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult> {
        self.engine().await?.exec(sql, params).await
    }

    /// Execute without producing operations.
    pub async fn exec_local(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult> {
        self.engine().await?.exec_local(sql, params).await
    }

    /// Opt a table into replication.
    pub async fn enable_sync(&self, table: &str) -> Result<()> {
        self.engine().await?.enable_sync(table).await
    }

    pub async fn node_id(&self) -> Result<String> {
        self.state
            .lock()
            .await
            .node_id
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// Latest operation version in the local log.
    pub async fn version(&self) -> Result<Option<String>> {
        self.engine().await?.version().await
    }

    pub async fn op_count(&self) -> Result<u64> {
        self.engine().await?.op_count().await
    }

    /// Peers currently tracked by the manager.
    pub async fn peers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        match &state.net {
            Some(net) => net.peers.peers().await,
            None => Vec::new(),
        }
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state
            .net
            .as_ref()
            .map_or(false, |net| net.signaling.is_connected())
    }

    /// Full binary image of the local database.
    pub async fn export(&self) -> Result<Vec<u8>> {
        self.engine().await?.export().await
    }

    /// Replace the local database with an exported image.
    pub async fn import(&self, bytes: &[u8]) -> Result<()> {
        self.engine().await?.import(bytes).await
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Leave the room and close every peer connection. Local state stays
    /// usable.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if let Some(net) = state.net.take() {
            // The manager closes its channels and then stops signaling.
            net.peers.disconnect();
        }
    }

    /// Disconnect, flush the pending snapshot, and release the store.
    pub async fn close(&self) -> Result<()> {
        self.disconnect().await;
        let mut state = self.state.lock().await;
        if let Some(engine) = state.engine.take() {
            engine.flush().await?;
        }
        state.node_id = None;
        Ok(())
    }

    async fn engine(&self) -> Result<Engine> {
        self.state
            .lock()
            .await
            .engine
            .clone()
            .ok_or(Error::NotInitialized)
    }
}
