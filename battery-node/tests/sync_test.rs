//! Sync protocol tests: two full engines talking through crossed channels,
//! no WebRTC involved.

use std::time::Duration;

use battery_node::engine::Engine;
use battery_node::event::{self, Event};
use battery_node::sql::SqlValue;
use battery_node::store::Store;
use battery_node::sync::{Outbound, SyncFrame, SyncSession};
use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_millis(20);

/// One side of the conversation.
struct Side {
    engine: Engine,
    session: SyncSession,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: event::EventReceiver,
}

async fn side(node_id: &str) -> Side {
    let events_tx = event::channel();
    let engine = Engine::open(
        Store::open_in_memory().unwrap(),
        node_id.to_owned(),
        events_tx.clone(),
        DEBOUNCE,
    )
    .unwrap();
    engine
        .exec("CREATE TABLE notes (id TEXT PRIMARY KEY, content TEXT)", &[])
        .await
        .unwrap();
    engine.enable_sync("notes").await.unwrap();
    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let events = events_tx.subscribe();
    Side {
        session: SyncSession::new(engine.clone(), outbound_tx, events_tx),
        engine,
        outbound,
        events,
    }
}

async fn insert(side: &Side, id: &str, content: &str) {
    side.engine
        .exec(
            "INSERT INTO notes (id, content) VALUES (?, ?)",
            &[SqlValue::from(id), SqlValue::from(content)],
        )
        .await
        .unwrap();
}

/// Shuttle queued frames between the two sides until both queues drain.
async fn pump(a: &mut Side, a_id: &str, b: &mut Side, b_id: &str) {
    loop {
        let mut moved = false;
        while let Ok(out) = a.outbound.try_recv() {
            assert_eq!(out.peer_id, b_id);
            b.session.handle_frame(a_id, out.frame).await.unwrap();
            moved = true;
        }
        while let Ok(out) = b.outbound.try_recv() {
            assert_eq!(out.peer_id, a_id);
            a.session.handle_frame(b_id, out.frame).await.unwrap();
            moved = true;
        }
        if !moved {
            return;
        }
    }
}

async fn note_count(engine: &Engine) -> u64 {
    let result = engine
        .exec_local("SELECT count(*) FROM notes", &[])
        .await
        .unwrap();
    match result.rows[0][0] {
        SqlValue::Integer(n) => n as u64,
        ref other => panic!("unexpected count {other:?}"),
    }
}

#[tokio::test]
async fn channel_open_catches_up_the_full_log() {
    let mut a = side("a").await;
    let mut b = side("b").await;
    for i in 0..5 {
        insert(&a, &format!("n{i}"), "from a").await;
    }

    // Both sides request on open, as they would on a real channel.
    a.session.channel_open("b");
    b.session.channel_open("a");
    pump(&mut a, "a", &mut b, "b").await;

    assert_eq!(note_count(&b.engine).await, 5);
    assert_eq!(b.engine.op_count().await.unwrap(), 5);
    // The receiver's cursor lands on the sender's latest version.
    assert_eq!(
        b.session.cursor("a"),
        a.engine.version().await.unwrap().as_deref()
    );
}

#[tokio::test]
async fn reconnect_requests_only_the_tail() {
    let mut a = side("a").await;
    let mut b = side("b").await;
    for i in 0..3 {
        insert(&a, &format!("old{i}"), "before").await;
    }
    b.session.channel_open("a");
    pump(&mut a, "a", &mut b, "b").await;
    assert_eq!(note_count(&b.engine).await, 3);

    // Offline edits on a while the channel is down.
    for i in 0..5 {
        insert(&a, &format!("new{i}"), "offline").await;
    }

    // Channel re-opens; b asks from its recorded cursor.
    b.session.channel_open("a");
    let request = b.outbound.try_recv().unwrap();
    let cursor = match &request.frame {
        SyncFrame::SyncRequest { from_version } => {
            from_version.clone().expect("cursor should be recorded")
        }
        other => panic!("unexpected frame {other:?}"),
    };
    a.session.handle_frame("b", request.frame).await.unwrap();

    // The response carries exactly the five offline operations.
    let response = a.outbound.try_recv().unwrap();
    match &response.frame {
        SyncFrame::SyncResponse { operations, version } => {
            assert_eq!(operations.len(), 5);
            assert!(operations.iter().all(|op| op.version() > cursor));
            assert_eq!(
                version.as_deref(),
                a.engine.version().await.unwrap().as_deref()
            );
        }
        other => panic!("unexpected frame {other:?}"),
    }
    b.session.handle_frame("a", response.frame).await.unwrap();
    pump(&mut a, "a", &mut b, "b").await;

    assert_eq!(note_count(&b.engine).await, 8);
    assert_eq!(
        b.session.cursor("a"),
        a.engine.version().await.unwrap().as_deref()
    );
}

#[tokio::test]
async fn unknown_cursor_falls_back_to_the_full_log() {
    let mut a = side("a").await;
    for i in 0..4 {
        insert(&a, &format!("n{i}"), "x").await;
    }
    a.session
        .handle_frame(
            "b",
            SyncFrame::SyncRequest {
                from_version: Some("00000000000-00003-someone-else".into()),
            },
        )
        .await
        .unwrap();
    let response = a.outbound.try_recv().unwrap();
    match response.frame {
        SyncFrame::SyncResponse { operations, .. } => assert_eq!(operations.len(), 4),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn live_broadcast_reaches_open_peers_and_advances_cursors() {
    let mut a = side("a").await;
    let mut b = side("b").await;
    a.session.channel_open("b");
    b.session.channel_open("a");
    pump(&mut a, "a", &mut b, "b").await;

    insert(&a, "n1", "live").await;
    let op = a.engine.ops_since(None).await.unwrap().pop().unwrap();
    a.session.broadcast(&op, &["b".to_owned()]);
    assert_eq!(a.session.cursor("b"), Some(op.version()).as_deref());

    pump(&mut a, "a", &mut b, "b").await;
    assert_eq!(note_count(&b.engine).await, 1);
    assert_eq!(b.session.cursor("a"), Some(op.version()).as_deref());

    // The receiving side announces the sync.
    let mut saw_sync = false;
    while let Ok(event) = b.events.try_recv() {
        if let Event::Sync { count, peer_id } = event {
            assert_eq!(count, 1);
            assert_eq!(peer_id, "a");
            saw_sync = true;
        }
    }
    assert!(saw_sync, "sync event should fire for a live operation");
}

#[tokio::test]
async fn three_peer_late_joiner_converges_on_the_union() {
    let mut a = side("a").await;
    let mut b = side("b").await;
    // a and b build up divergent-then-shared history.
    for i in 0..6 {
        insert(&a, &format!("a{i}"), "from a").await;
    }
    for i in 0..4 {
        insert(&b, &format!("b{i}"), "from b").await;
    }
    a.session.channel_open("b");
    b.session.channel_open("a");
    pump(&mut a, "a", &mut b, "b").await;
    assert_eq!(note_count(&a.engine).await, 10);
    assert_eq!(note_count(&b.engine).await, 10);

    // c joins late with nothing and asks both for everything.
    let mut c = side("c").await;
    c.session.channel_open("a");
    pump(&mut c, "c", &mut a, "a").await;
    c.session.channel_open("b");
    pump(&mut c, "c", &mut b, "b").await;

    assert_eq!(note_count(&c.engine).await, 10);
    assert_eq!(c.engine.op_count().await.unwrap(), 10);
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let mut a = side("a").await;
    a.session.handle_frame("b", SyncFrame::Ping).await.unwrap();
    let out = a.outbound.try_recv().unwrap();
    assert_eq!(out.peer_id, "b");
    assert_eq!(out.frame, SyncFrame::Pong);
}
