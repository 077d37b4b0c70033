//! battery-node: peer-to-peer replicated SQL.
//!
//! Each node holds a full local SQLite database. Mutations on synced tables
//! are captured as row-scoped operations stamped by a hybrid logical clock,
//! appended to a durable log, and broadcast to every connected peer over a
//! WebRTC data channel; incoming operations merge with last-write-wins per
//! row. Two nodes that have seen the same set of operations hold the same
//! database, whatever order the operations arrived in.
//!
//! Layers, bottom up:
//! - [`hlc`] — clock readings and their sortable string form
//! - [`op`] / [`sql`] — the operation model, the SQLite adapter, and the
//!   extractor that turns mutations into operations
//! - [`store`] — durable op log, snapshot slot, and meta map
//! - [`engine`] — local execution, remote merge, debounced snapshots
//! - [`signal`] / [`peer`] / [`sync`] — relay client, WebRTC peer manager,
//!   and the data channel sync protocol
//! - [`node`] — the public handle gluing it all together

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod hlc;
pub mod node;
pub mod op;
pub mod peer;
pub mod signal;
pub mod sql;
pub mod store;
pub mod sync;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use event::Event;
pub use hlc::{Hlc, HlcClock};
pub use node::Node;
pub use op::Operation;
pub use sql::{ExecResult, SqlValue};
pub use store::Store;
