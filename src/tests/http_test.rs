use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message as WsFrame;

use crate::clock::SystemClock;
use crate::config::SyncConfig;
use crate::events::WireMessage;
use crate::hub::BroadcastHub;
use crate::model::{Group, Note};
use crate::record_store::RecordStore;
use crate::service::MutationService;
use crate::sync::{CollectionsApi, HttpCollectionsApi, NotesFilter, SyncAgent};

async fn spawn_server() -> (String, Arc<MutationService>) {
    let store = RecordStore::open_in_memory().unwrap();
    store.create_table::<Note>().unwrap();
    store.create_table::<Group>().unwrap();
    let hub = BroadcastHub::new();
    let service = MutationService::new(store, hub, Arc::new(SystemClock));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(crate::api::serve(service.clone(), listener));
    (format!("http://{addr}"), service)
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect_ws(base: &str) -> WsClient {
    let url = format!("{}/ws", base.replacen("http://", "ws://", 1));
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    // Give the server a beat to register the channel with the hub.
    tokio::time::sleep(Duration::from_millis(50)).await;
    ws
}

async fn next_wire(ws: &mut WsClient) -> Option<WireMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .ok()??
            .ok()?;
        match frame {
            WsFrame::Text(text) => return serde_json::from_str(&text).ok(),
            WsFrame::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn wait_until(mut probe: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn created_note_signals_other_clients_and_shows_in_listings() {
    let (base, _service) = spawn_server().await;
    let api = HttpCollectionsApi::new(&base);

    let mut observer = connect_ws(&base).await;

    let note = api.create_note("hello", None, None).await.unwrap();
    assert!(!note.is_deleted);

    let wire = next_wire(&mut observer).await.expect("no change event");
    assert_eq!(wire.event, "notes:changed");
    assert_eq!(wire.payload["type"], "created");
    assert_eq!(wire.payload["note"]["title"], "hello");

    let notes = api.list_notes(&Default::default()).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].id, note.id);
}

#[tokio::test]
async fn second_agent_converges_on_anothers_change_via_realtime() {
    let (base, _service) = spawn_server().await;

    let mut cfg = SyncConfig::new(base.clone());
    cfg.poll_interval = Duration::from_millis(200);
    cfg.reconnect_delay = Duration::from_millis(50);
    let observer = SyncAgent::start(Arc::new(HttpCollectionsApi::new(&base)), cfg);

    // Let the observer's realtime channel come up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let writer_api = HttpCollectionsApi::new(&base);
    let note = writer_api.create_note("shared", None, None).await.unwrap();

    let seen = wait_until(
        || observer.projection().notes.iter().any(|n| n.id == note.id),
        Duration::from_secs(3),
    )
    .await;
    assert!(seen, "observer never converged on the new note");
}

#[tokio::test]
async fn soft_deleted_notes_move_between_listings() {
    let (base, _service) = spawn_server().await;
    let api = HttpCollectionsApi::new(&base);

    let note = api.create_note("bin me", None, None).await.unwrap();
    api.soft_delete_note(note.id).await.unwrap();

    let live = api.list_notes(&Default::default()).await.unwrap();
    assert!(live.is_empty());

    let deleted = api
        .list_notes(&NotesFilter::Deleted.server_query())
        .await
        .unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].id, note.id);
    assert!(deleted[0].is_deleted);
}

#[tokio::test]
async fn concurrent_deletes_resolve_to_one_success_one_not_found() {
    let (base, _service) = spawn_server().await;
    let api = HttpCollectionsApi::new(&base);
    let note = api.create_note("contested", None, None).await.unwrap();

    let client = reqwest::Client::new();
    let url = format!("{base}/api/notes/{}", note.id);
    let (a, b) = tokio::join!(
        client.delete(&url).send(),
        client.delete(&url).send()
    );
    let mut statuses = vec![a.unwrap().status().as_u16(), b.unwrap().status().as_u16()];
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 404]);
}

#[tokio::test]
async fn restore_and_permanent_delete_endpoints() {
    let (base, _service) = spawn_server().await;
    let api = HttpCollectionsApi::new(&base);
    let client = reqwest::Client::new();

    let note = api.create_note("cycle", None, None).await.unwrap();
    api.soft_delete_note(note.id).await.unwrap();

    let status = client
        .post(format!("{base}/api/notes/{}/restore", note.id))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 200);
    assert_eq!(api.list_notes(&Default::default()).await.unwrap().len(), 1);

    let status = client
        .delete(format!("{base}/api/notes/{}/permanent", note.id))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 200);

    // Gone means gone.
    let status = client
        .delete(format!("{base}/api/notes/{}/permanent", note.id))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 404);
}

#[tokio::test]
async fn request_validation_maps_to_400() {
    let (base, _service) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/notes"))
        .json(&json!({ "content": "no title" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let note_id = {
        let api = HttpCollectionsApi::new(&base);
        api.create_note("t", None, None).await.unwrap().id
    };
    let resp = client
        .patch(format!("{base}/api/notes/{note_id}"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .post(format!("{base}/api/notes/batch"))
        .json(&json!({ "action": "mark-done", "ids": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .post(format!("{base}/api/notes/batch"))
        .json(&json!({ "action": "explode", "ids": [note_id.to_string()] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .patch(format!("{base}/api/notes/{}", crate::record_id::RecordId::new()))
        .json(&json!({ "title": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn group_lifecycle_over_http_enforces_the_reference_guard() {
    let (base, _service) = spawn_server().await;
    let api = HttpCollectionsApi::new(&base);
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/groups"))
        .json(&json!({ "name": "work" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let group: Group =
        serde_json::from_value(resp.json::<serde_json::Value>().await.unwrap()["data"].clone())
            .unwrap();

    let resp = client
        .patch(format!("{base}/api/groups/{}", group.id))
        .json(&json!({ "color": "#123456" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let note = api
        .create_note("in group", None, Some(group.id))
        .await
        .unwrap();

    // Live member blocks deletion.
    let resp = client
        .delete(format!("{base}/api/groups/{}", group.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // A soft-deleted member does not.
    api.soft_delete_note(note.id).await.unwrap();
    let resp = client
        .delete(format!("{base}/api/groups/{}", group.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    assert!(api.list_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn client_relay_reaches_everyone_but_the_originator() {
    let (base, _service) = spawn_server().await;

    let mut origin = connect_ws(&base).await;
    let mut other = connect_ws(&base).await;

    origin
        .send(WsFrame::Text(
            serde_json::to_string(&WireMessage {
                event: "client:notes:changed".to_string(),
                payload: json!({ "type": "client" }),
            })
            .unwrap(),
        ))
        .await
        .unwrap();

    let wire = next_wire(&mut other).await.expect("relay never arrived");
    assert_eq!(wire.event, "notes:changed");
    assert_eq!(wire.payload["type"], "client");

    // The originator hears nothing back.
    let echo = tokio::time::timeout(Duration::from_millis(300), origin.next()).await;
    assert!(echo.is_err(), "originator received its own relay");
}

#[tokio::test]
async fn polling_agent_converges_with_realtime_unavailable() {
    let (base, _service) = spawn_server().await;

    let mut cfg = SyncConfig::new(base.clone());
    // Point the realtime channel somewhere dead; polling must carry it.
    cfg.ws_url = "ws://127.0.0.1:9/ws".to_string();
    cfg.poll_interval = Duration::from_millis(60);
    cfg.reconnect_delay = Duration::from_millis(20);
    cfg.max_reconnect_attempts = Some(2);
    let observer = SyncAgent::start(Arc::new(HttpCollectionsApi::new(&base)), cfg);

    let writer_api = HttpCollectionsApi::new(&base);
    let note = writer_api.create_note("polled", None, None).await.unwrap();

    let seen = wait_until(
        || observer.projection().notes.iter().any(|n| n.id == note.id),
        Duration::from_secs(3),
    )
    .await;
    assert!(seen, "fallback polling never observed the change");
}
