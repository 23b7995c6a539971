//! Connect loop integration tests
//!
//! Tests the session's subscription lifecycle against scripted connections:
//! - Reconnect after a lost connection
//! - Giving up when reconnect is disabled
//! - Subscribing from a `connected` listener
//! - Close while connected

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{Harness, PATIENCE};
use nice_go::{ChannelError, Event, NiceGoError};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

fn ack() -> Value {
    json!({ "type": "connection_ack" })
}

/// Forward every `event` into a channel the test can await.
fn watch_event(harness: &Harness, event: &str) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    harness.session.on(event, move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            anyhow::Ok(())
        }
    });
    rx
}

fn header_of(url: &url::Url) -> Value {
    let encoded = url
        .query_pairs()
        .find(|(key, _)| key == "header")
        .map(|(_, value)| value.into_owned())
        .unwrap();
    serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap()
}

// =============================================================================
// Reconnection
// =============================================================================

#[tokio::test]
async fn test_reconnects_after_connection_lost() {
    let harness = Harness::authenticated().await;

    let first = harness.connector.push_connection();
    first.push_json(ack());
    first.close_remote();
    let second = harness.connector.push_connection();
    second.push_json(ack());

    let mut connected = watch_event(&harness, "connected");
    let mut lost = watch_event(&harness, "connection_lost");

    let runner = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.connect(true).await })
    };

    timeout(PATIENCE, connected.recv()).await.unwrap().unwrap();
    let event = timeout(PATIENCE, lost.recv()).await.unwrap().unwrap();
    assert!(matches!(
        event,
        Event::ConnectionLost(ChannelError::ConnectionClosed)
    ));
    timeout(PATIENCE, connected.recv()).await.unwrap().unwrap();

    harness.session.close().await;
    timeout(PATIENCE, runner).await.unwrap().unwrap().unwrap();

    assert_eq!(harness.connector.connect_count(), 2);
    assert_eq!(
        harness.connector.protocols(),
        vec!["graphql-ws".to_string(), "graphql-ws".to_string()]
    );
    assert!(second.is_closed());
}

#[tokio::test]
async fn test_reconnect_reuses_first_token() {
    // Known boundary: the loop never re-authenticates, so an expired id
    // token keeps being presented until the caller authenticates again.
    let harness = Harness::authenticated().await;

    let first = harness.connector.push_connection();
    first.push_json(ack());
    first.close_remote();
    let second = harness.connector.push_connection();
    second.push_json(ack());

    let mut connected = watch_event(&harness, "connected");
    let runner = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.connect(true).await })
    };

    for _ in 0..2 {
        timeout(PATIENCE, connected.recv()).await.unwrap().unwrap();
    }
    harness.session.close().await;
    timeout(PATIENCE, runner).await.unwrap().unwrap().unwrap();

    let urls = harness.connector.urls();
    assert_eq!(urls.len(), 2);
    for url in &urls {
        assert_eq!(header_of(url)["Authorization"], "test_token");
        assert_eq!(header_of(url)["host"], "127.0.0.1");
        assert_eq!(
            url.query_pairs().find(|(k, _)| k == "payload").unwrap().1,
            "e30="
        );
    }
    assert_eq!(harness.identity.password_calls(), 1);
}

#[tokio::test]
async fn test_failed_connection_attempts_are_retried() {
    let harness = Harness::authenticated().await;

    // No scripted connection: the first attempt is refused
    let mut connected = watch_event(&harness, "connected");
    let mut lost = watch_event(&harness, "connection_lost");

    let runner = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.connect(true).await })
    };

    let event = timeout(PATIENCE, lost.recv()).await.unwrap().unwrap();
    assert!(matches!(
        event,
        Event::ConnectionLost(ChannelError::Transport(_))
    ));

    let handle = harness.connector.push_connection();
    handle.push_json(ack());
    timeout(PATIENCE, connected.recv()).await.unwrap().unwrap();

    harness.session.close().await;
    timeout(PATIENCE, runner).await.unwrap().unwrap().unwrap();
    assert!(harness.connector.connect_count() >= 2);
}

#[tokio::test]
async fn test_no_reconnect_returns_error_and_closes() {
    let harness = Harness::authenticated().await;

    let only = harness.connector.push_connection();
    only.push_json(ack());
    only.close_remote();

    let mut lost = watch_event(&harness, "connection_lost");

    let err = timeout(PATIENCE, harness.session.connect(false))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(
        err,
        NiceGoError::WebSocket(ChannelError::ConnectionClosed)
    ));
    assert!(harness.session.is_closed());
    assert_eq!(harness.connector.connect_count(), 1);
    assert!(timeout(PATIENCE, lost.recv()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_connection_lost_listener_outlives_session() {
    let Harness {
        session,
        connector,
        server: _server,
        ..
    } = Harness::authenticated().await;

    let only = connector.push_connection();
    only.push_json(ack());
    only.close_remote();

    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));
    session.on("connection_lost", move |event| {
        let done_tx = Arc::clone(&done_tx);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(tx) = done_tx.lock().unwrap().take() {
                let _ = tx.send(event);
            }
            anyhow::Ok(())
        }
    });

    timeout(PATIENCE, session.connect(false))
        .await
        .unwrap()
        .unwrap_err();
    drop(session);

    let event = timeout(PATIENCE, done_rx).await.unwrap().unwrap();
    assert!(matches!(
        event,
        Event::ConnectionLost(ChannelError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_handshake_rejection_is_retried() {
    let harness = Harness::authenticated().await;

    let first = harness.connector.push_connection();
    first.push_json(json!({ "type": "connection_error" }));
    let second = harness.connector.push_connection();
    second.push_json(ack());

    let mut connected = watch_event(&harness, "connected");
    let runner = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.connect(true).await })
    };

    timeout(PATIENCE, connected.recv()).await.unwrap().unwrap();
    assert_eq!(harness.connector.connect_count(), 2);
    assert!(first.is_closed());

    harness.session.close().await;
    timeout(PATIENCE, runner).await.unwrap().unwrap().unwrap();
}

// =============================================================================
// Subscriptions through the session
// =============================================================================

#[tokio::test]
async fn test_subscribe_from_connected_listener() {
    let harness = Harness::authenticated().await;
    let mut handle = harness.connector.push_connection();
    handle.push_json(ack());

    let (ids_tx, mut ids) = mpsc::unbounded_channel();
    {
        let session = harness.session.clone();
        harness.session.on("connected", move |_| {
            let session = session.clone();
            let ids_tx = ids_tx.clone();
            async move {
                let id = session.subscribe("receiver-1").await?;
                let _ = ids_tx.send(id);
                anyhow::Ok(())
            }
        });
    }
    let mut data = watch_event(&harness, "data");

    let runner = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.connect(true).await })
    };

    assert_eq!(
        timeout(PATIENCE, handle.next_sent()).await.unwrap(),
        Some(json!({ "type": "connection_init" }))
    );
    let start = timeout(PATIENCE, handle.next_sent()).await.unwrap().unwrap();
    assert_eq!(start["type"], "start");
    assert_eq!(
        start["payload"]["extensions"]["authorization"]["Authorization"],
        "test_token"
    );
    let id = start["id"].as_str().unwrap().to_string();

    handle.push_json(json!({ "id": id, "type": "start_ack" }));
    assert_eq!(timeout(PATIENCE, ids.recv()).await.unwrap().unwrap(), id);

    handle.push_json(json!({
        "id": id,
        "type": "data",
        "payload": { "data": { "devicesStatesUpdateFeed": { "item": { "deviceId": "test_id" } } } }
    }));
    let event = timeout(PATIENCE, data.recv()).await.unwrap().unwrap();
    assert_eq!(event.device_state(), Some(&json!({ "deviceId": "test_id" })));

    harness.session.unsubscribe(&id).await.unwrap();
    assert_eq!(
        timeout(PATIENCE, handle.next_sent()).await.unwrap(),
        Some(json!({ "type": "stop", "id": id }))
    );

    harness.session.close().await;
    timeout(PATIENCE, runner).await.unwrap().unwrap().unwrap();
    assert!(handle.is_closed());
    assert!(harness.session.channel().await.is_none());
}

#[tokio::test]
async fn test_close_stops_active_subscriptions() {
    let harness = Harness::authenticated().await;
    let mut handle = harness.connector.push_connection();
    handle.push_json(ack());

    let mut connected = watch_event(&harness, "connected");
    let lost_count = Arc::new(AtomicU32::new(0));
    {
        let lost_count = Arc::clone(&lost_count);
        harness.session.on("connection_lost", move |_| {
            let lost_count = Arc::clone(&lost_count);
            async move {
                lost_count.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });
    }

    let runner = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.connect(true).await })
    };
    timeout(PATIENCE, connected.recv()).await.unwrap().unwrap();
    let _init = handle.next_sent().await;

    let subscriber = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.subscribe("receiver-1").await })
    };
    let id = timeout(PATIENCE, handle.next_sent()).await.unwrap().unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();
    handle.push_json(json!({ "id": id, "type": "start_ack" }));
    timeout(PATIENCE, subscriber).await.unwrap().unwrap().unwrap();

    harness.session.close().await;
    timeout(PATIENCE, runner).await.unwrap().unwrap().unwrap();

    assert_eq!(
        handle.next_sent().await,
        Some(json!({ "type": "stop", "id": id }))
    );
    assert!(handle.is_closed());

    harness.session.wait_for_events().await;
    assert_eq!(lost_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unsubscribe_unknown_id() {
    let harness = Harness::authenticated().await;
    let mut handle = harness.connector.push_connection();
    handle.push_json(ack());

    let mut connected = watch_event(&harness, "connected");
    let runner = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.connect(true).await })
    };
    timeout(PATIENCE, connected.recv()).await.unwrap().unwrap();
    let _init = handle.next_sent().await;

    let err = harness.session.unsubscribe("never-subscribed").await.unwrap_err();
    assert!(matches!(
        err,
        NiceGoError::WebSocket(ChannelError::UnknownSubscription(_))
    ));
    assert!(handle.try_sent().is_empty());

    harness.session.close().await;
    timeout(PATIENCE, runner).await.unwrap().unwrap().unwrap();
}
