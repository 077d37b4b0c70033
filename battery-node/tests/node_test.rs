//! Node surface tests: lifecycle, identity persistence, and guard rails.

use battery_node::{Config, Error, Node, SqlValue};
use tempfile::TempDir;

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.node.data_dir = dir.path().to_path_buf();
    config.sync.snapshot_debounce_ms = 20;
    config
}

#[tokio::test]
async fn methods_fail_fast_before_init() {
    let dir = TempDir::new().unwrap();
    let node = Node::new(config(&dir));

    assert!(matches!(
        node.exec("SELECT 1", &[]).await,
        Err(Error::NotInitialized)
    ));
    assert!(matches!(node.node_id().await, Err(Error::NotInitialized)));
    assert!(matches!(
        node.connect("ws://localhost:1", "room").await,
        Err(Error::NotInitialized)
    ));
}

#[tokio::test]
async fn init_is_idempotent_and_node_id_persists() {
    let dir = TempDir::new().unwrap();

    let node = Node::new(config(&dir));
    node.init().await.unwrap();
    node.init().await.unwrap();
    let id = node.node_id().await.unwrap();
    assert!(!id.is_empty());
    node.close().await.unwrap();

    // A fresh node over the same store keeps its identity.
    let reopened = Node::new(config(&dir));
    reopened.init().await.unwrap();
    assert_eq!(reopened.node_id().await.unwrap(), id);
}

#[tokio::test]
async fn connect_validates_settings_before_dialing() {
    let dir = TempDir::new().unwrap();
    let node = Node::new(config(&dir));
    node.init().await.unwrap();

    assert!(matches!(
        node.connect("", "room").await,
        Err(Error::ConfigMissing("signaling url"))
    ));
    assert!(matches!(
        node.connect("ws://localhost:1", "").await,
        Err(Error::ConfigMissing("room token"))
    ));
    assert!(matches!(
        node.connect("http://localhost:1", "room").await,
        Err(Error::SignalingProtocol(_))
    ));
    // Nothing reachable on the other end: the initial attempt is an error,
    // not a silent retry loop.
    assert!(matches!(
        node.connect("ws://127.0.0.1:9", "room").await,
        Err(Error::SignalingTransport(_))
    ));
    assert!(!node.is_connected().await);
    assert!(node.peers().await.is_empty());
}

#[tokio::test]
async fn data_survives_close_and_reopen() {
    let dir = TempDir::new().unwrap();

    let node = Node::new(config(&dir));
    node.init().await.unwrap();
    node.exec("CREATE TABLE notes (id TEXT PRIMARY KEY, content TEXT)", &[])
        .await
        .unwrap();
    node.enable_sync("notes").await.unwrap();
    node.exec(
        "INSERT INTO notes (id, content) VALUES (?, ?)",
        &[SqlValue::from("n1"), SqlValue::from("durable")],
    )
    .await
    .unwrap();
    let version = node.version().await.unwrap();
    assert!(version.is_some());
    node.close().await.unwrap();

    let reopened = Node::new(config(&dir));
    reopened.init().await.unwrap();
    let result = reopened
        .exec_local("SELECT content FROM notes WHERE id = ?", &[SqlValue::from("n1")])
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], SqlValue::from("durable"));
    assert_eq!(reopened.version().await.unwrap(), version);
    assert_eq!(reopened.op_count().await.unwrap(), 1);
}
