//! Replication engine.
//!
//! The engine is the only writer of the SQL database and the store. Local
//! mutations are executed, captured as operations, and logged atomically
//! with the clock reading that stamped them; remote operations advance the
//! clock, pass the last-write-wins guard, and land in the same log.
//!
//! Convergence strategy: a per-row map of the highest applied version,
//! rebuilt from the log on startup. An incoming operation whose version is
//! not strictly greater than the row's recorded one is kept in the log but
//! not applied to SQL, which makes application order-insensitive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::{emit, Event, EventSender};
use crate::hlc::{Hlc, HlcClock};
use crate::op::Operation;
use crate::sql::{classify, extract_ops, ExecResult, SqlAdapter, SqlValue, StatementClass};
use crate::store::Store;

/// Meta key recording the log position covered by the stored snapshot.
const SNAPSHOT_VERSION_KEY: &str = "snapshot_version";

struct Core {
    clock: HlcClock,
    sql: SqlAdapter,
    store: Store,
    synced_tables: HashSet<String>,
    /// row key -> highest version applied to SQL.
    applied: HashMap<String, String>,
}

impl Core {
    fn newer_than_applied(&self, op: &Operation) -> bool {
        let version = op.version();
        self.applied
            .get(&op.row_key())
            .map_or(true, |current| version.as_str() > current.as_str())
    }

    fn record_applied(&mut self, op: &Operation) {
        let version = op.version();
        let entry = self.applied.entry(op.row_key()).or_default();
        if version.as_str() > entry.as_str() {
            *entry = version;
        }
    }

    fn exec_mutation(
        &mut self,
        sql_text: &str,
        params: &[SqlValue],
    ) -> Result<(ExecResult, Vec<Operation>)> {
        // Extraction reads the pre-state, so it must run before the SQL.
        // A failed extraction never blocks local execution.
        let ops = match extract_ops(
            &mut self.sql,
            &self.synced_tables,
            sql_text,
            params,
            &mut self.clock,
        ) {
            Ok(ops) => ops,
            Err(err) => {
                warn!(error = %err, "operation extraction failed; executing unsynced");
                Vec::new()
            }
        };
        let result = self.sql.execute(sql_text, params)?;
        for op in &ops {
            self.store.append(op)?;
            self.record_applied(op);
        }
        Ok((result, ops))
    }
}

/// Handle to the node's replication core. Cheap to clone; all clones share
/// one serialized state.
#[derive(Clone)]
pub struct Engine {
    core: Arc<Mutex<Core>>,
    events: EventSender,
    snapshot_tx: mpsc::UnboundedSender<()>,
}

impl Engine {
    /// Open the engine over a store: load the snapshot, replay the log tail
    /// past it, and seed the clock from the latest logged version.
    ///
    /// Must be called from within a tokio runtime (the debounced snapshot
    /// writer is spawned here).
    pub fn open(
        store: Store,
        node_id: String,
        events: EventSender,
        snapshot_debounce: Duration,
    ) -> Result<Engine> {
        let mut sql = SqlAdapter::open_in_memory()?;
        if let Some(image) = store.snapshot()? {
            sql.load(&image)?;
            debug!(bytes = image.len(), "snapshot restored");
        }
        let snapshot_version = store.meta(SNAPSHOT_VERSION_KEY)?;

        // One ordered pass over the log rebuilds the per-row guard; only
        // operations past the snapshot actually touch SQL.
        let mut applied: HashMap<String, String> = HashMap::new();
        let mut replayed = 0u64;
        for op in store.since(None)? {
            let key = op.row_key();
            let version = op.version();
            if let Some(current) = applied.get(&key) {
                if version.as_str() <= current.as_str() {
                    continue;
                }
            }
            let past_snapshot = snapshot_version
                .as_deref()
                .map_or(true, |sv| version.as_str() > sv);
            if past_snapshot {
                if let Err(err) = sql.apply(&op) {
                    warn!(version = %version, error = %err, "logged operation failed to replay");
                }
                replayed += 1;
            }
            applied.insert(key, version);
        }
        if replayed > 0 {
            info!(replayed, "log tail replayed over snapshot");
        }

        let mut clock = HlcClock::new(node_id);
        if let Some(latest) = store.latest_version()? {
            if let Ok(h) = Hlc::parse(&latest) {
                clock.receive(&h);
            }
        }

        let core = Arc::new(Mutex::new(Core {
            clock,
            sql,
            store,
            synced_tables: HashSet::new(),
            applied,
        }));
        let snapshot_tx = spawn_snapshot_writer(core.clone(), events.clone(), snapshot_debounce);
        Ok(Engine {
            core,
            events,
            snapshot_tx,
        })
    }

    pub fn subscribe(&self) -> crate::event::EventReceiver {
        self.events.subscribe()
    }

    pub async fn node_id(&self) -> String {
        self.core.lock().await.clock.node_id().to_owned()
    }

    /// Execute a statement and replicate it when it is a mutation on a
    /// synced table.
    pub async fn exec(&self, sql_text: &str, params: &[SqlValue]) -> Result<ExecResult> {
        let class = classify(sql_text);
        let (result, ops) = {
            let mut core = self.core.lock().await;
            match class {
                StatementClass::Insert | StatementClass::Update | StatementClass::Delete => {
                    core.exec_mutation(sql_text, params)?
                }
                StatementClass::Ddl => {
                    let result = core.sql.execute(sql_text, params)?;
                    core.sql.invalidate_schema();
                    (result, Vec::new())
                }
                StatementClass::Other => (core.sql.execute(sql_text, params)?, Vec::new()),
            }
        };
        for op in &ops {
            emit(
                &self.events,
                Event::Operation {
                    op: op.clone(),
                    from_peer: None,
                },
            );
        }
        if class != StatementClass::Other {
            self.schedule_snapshot();
        }
        Ok(result)
    }

    /// Execute without ever producing operations. Reads and private
    /// bookkeeping go through here.
    pub async fn exec_local(&self, sql_text: &str, params: &[SqlValue]) -> Result<ExecResult> {
        let mut core = self.core.lock().await;
        let result = core.sql.execute(sql_text, params)?;
        if classify(sql_text) == StatementClass::Ddl {
            core.sql.invalidate_schema();
        }
        Ok(result)
    }

    /// Merge one operation received from a peer.
    ///
    /// The operation always lands in the log; SQL only changes when the
    /// operation wins the per-row guard. An operation that fails to apply
    /// is logged and skipped, never retried.
    pub async fn apply_remote(&self, op: Operation, from_peer: Option<&str>) -> Result<()> {
        {
            let mut core = self.core.lock().await;
            core.clock.receive(op.hlc());
            if core.newer_than_applied(&op) {
                match core.sql.apply(&op) {
                    Ok(()) => core.record_applied(&op),
                    Err(err) => {
                        warn!(
                            version = %op.version(),
                            table = op.table(),
                            error = %err,
                            "remote operation failed to apply; continuing",
                        );
                    }
                }
            } else {
                debug!(version = %op.version(), "stale operation ignored by row guard");
            }
            core.store.append(&op)?;
        }
        emit(
            &self.events,
            Event::Operation {
                op,
                from_peer: from_peer.map(str::to_owned),
            },
        );
        self.schedule_snapshot();
        Ok(())
    }

    /// Mark a table as participating in replication. Tables without a
    /// declared primary key stay unsynced.
    pub async fn enable_sync(&self, table: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        match core.sql.table_schema(table)? {
            Some(schema) if !schema.pk_columns.is_empty() => {
                core.synced_tables.insert(table.to_owned());
                debug!(table, "table enabled for replication");
            }
            Some(_) => {
                warn!(table, "table has no declared primary key and will not replicate");
            }
            None => {
                warn!(table, "unknown table; nothing enabled");
            }
        }
        Ok(())
    }

    /// Latest version string in the log.
    pub async fn version(&self) -> Result<Option<String>> {
        self.core.lock().await.store.latest_version()
    }

    pub async fn op_count(&self) -> Result<u64> {
        self.core.lock().await.store.count()
    }

    /// Whether `version` names an operation in the local log.
    pub async fn has_version(&self, version: &str) -> Result<bool> {
        self.core.lock().await.store.contains(version)
    }

    /// Log tail strictly after `cursor`, in version order.
    pub async fn ops_since(&self, cursor: Option<&str>) -> Result<Vec<Operation>> {
        self.core.lock().await.store.since(cursor)
    }

    /// Full binary image of the SQL database.
    pub async fn export(&self) -> Result<Vec<u8>> {
        self.core.lock().await.sql.snapshot()
    }

    /// Replace the SQL database with an exported image.
    pub async fn import(&self, bytes: &[u8]) -> Result<()> {
        self.core.lock().await.sql.load(bytes)?;
        self.schedule_snapshot();
        Ok(())
    }

    /// Write the snapshot now, bypassing the debounce. Used on shutdown.
    pub async fn flush(&self) -> Result<()> {
        write_snapshot(&self.core).await
    }

    fn schedule_snapshot(&self) {
        let _ = self.snapshot_tx.send(());
    }
}

fn spawn_snapshot_writer(
    core: Arc<Mutex<Core>>,
    events: EventSender,
    debounce: Duration,
) -> mpsc::UnboundedSender<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Collapse a burst of schedules into a single write, restarting
            // the timer on every new signal.
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(debounce) => break,
                    again = rx.recv() => {
                        if again.is_none() {
                            break;
                        }
                    }
                }
            }
            if let Err(err) = write_snapshot(&core).await {
                warn!(error = %err, "snapshot write failed");
                emit(
                    &events,
                    Event::Error {
                        message: format!("snapshot write failed: {err}"),
                    },
                );
            }
        }
    });
    tx
}

async fn write_snapshot(core: &Arc<Mutex<Core>>) -> Result<()> {
    let core = core.lock().await;
    let bytes = core.sql.snapshot()?;
    core.store.put_snapshot(&bytes)?;
    if let Some(latest) = core.store.latest_version()? {
        core.store.put_meta(SNAPSHOT_VERSION_KEY, &latest)?;
    }
    debug!(bytes = bytes.len(), "snapshot written");
    Ok(())
}
