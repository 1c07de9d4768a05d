use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::ServiceError;
use crate::events::{WireMessage, EVENT_CLIENT_NOTES_CHANGED};
use crate::hub::{ChannelClosed, ClientChannel};
use crate::model::{lenient_group_id, GroupPatch, NotePatch};
use crate::record_id::RecordId;
use crate::service::{BatchAction, MutationService, NoteQuery};

/// Uniform response envelope, matching the wire format clients expect.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone)]
struct AppState {
    service: Arc<MutationService>,
}

pub fn router(service: Arc<MutationService>) -> Router {
    Router::new()
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/:id", patch(update_group).delete(delete_group))
        .route("/api/notes", get(list_notes).post(create_note))
        .route("/api/notes/batch", post(batch_notes))
        .route("/api/notes/:id", patch(update_note).delete(soft_delete_note))
        .route("/api/notes/:id/restore", post(restore_note))
        .route("/api/notes/:id/permanent", delete(permanent_delete_note))
        .route("/ws", get(ws_handler))
        .with_state(AppState { service })
}

pub async fn serve(
    service: Arc<MutationService>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    axum::serve(listener, router(service)).await
}

/* ──────────── response helpers ──────────── */

fn ok_data<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        ok: true,
        data: Some(data),
        message: None,
    })
    .into_response()
}

fn ok_empty() -> Response {
    Json(Envelope::<()> {
        ok: true,
        data: None,
        message: None,
    })
    .into_response()
}

fn fail(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(Envelope::<()> {
            ok: false,
            data: None,
            message: Some(message.to_string()),
        }),
    )
        .into_response()
}

/// `entity` names the operand in 404 messages ("note not found").
fn service_failure(entity: &str, err: ServiceError) -> Response {
    match err {
        ServiceError::Validation(m) => fail(StatusCode::BAD_REQUEST, &m),
        ServiceError::NotFound => fail(StatusCode::NOT_FOUND, &format!("{entity} not found")),
        ServiceError::Conflict(m) => fail(StatusCode::BAD_REQUEST, &m),
        ServiceError::Store(e) => {
            tracing::error!(error = %e, "storage failure");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/* ──────────── groups ──────────── */

#[derive(Deserialize)]
struct CreateGroupBody {
    name: Option<String>,
    color: Option<String>,
}

async fn list_groups(State(state): State<AppState>) -> Response {
    match state.service.list_groups().await {
        Ok(groups) => ok_data(groups),
        Err(e) => service_failure("group", e),
    }
}

async fn create_group(
    State(state): State<AppState>,
    Json(body): Json<CreateGroupBody>,
) -> Response {
    let Some(name) = body.name.filter(|n| !n.trim().is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "name is required");
    };
    match state.service.create_group(&name, body.color).await {
        Ok(group) => ok_data(group),
        Err(e) => service_failure("group", e),
    }
}

async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<GroupPatch>,
) -> Response {
    let Some(id) = RecordId::parse(&id) else {
        return fail(StatusCode::NOT_FOUND, "group not found");
    };
    if patch.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "no fields");
    }
    match state.service.update_group(id, &patch).await {
        Ok(group) => ok_data(group),
        Err(e) => service_failure("group", e),
    }
}

async fn delete_group(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = RecordId::parse(&id) else {
        return fail(StatusCode::NOT_FOUND, "group not found");
    };
    match state.service.delete_group(id).await {
        Ok(()) => ok_empty(),
        Err(e) => service_failure("group", e),
    }
}

/* ──────────── notes ──────────── */

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotesListQuery {
    group_id: Option<String>,
    deleted: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateNoteBody {
    title: Option<String>,
    content: Option<String>,
    #[serde(default, deserialize_with = "lenient_group_id")]
    group_id: Option<RecordId>,
}

#[derive(Deserialize)]
struct BatchBody {
    action: Option<String>,
    ids: Option<Vec<String>>,
}

async fn list_notes(
    State(state): State<AppState>,
    Query(q): Query<NotesListQuery>,
) -> Response {
    let query = NoteQuery {
        deleted: q.deleted.as_deref() == Some("true"),
        // `all`, absence, and unparseable ids all mean "no group filter".
        group_id: q
            .group_id
            .as_deref()
            .filter(|g| *g != "all")
            .and_then(RecordId::parse),
    };
    match state.service.list_notes(&query).await {
        Ok(notes) => ok_data(notes),
        Err(e) => service_failure("note", e),
    }
}

async fn create_note(
    State(state): State<AppState>,
    Json(body): Json<CreateNoteBody>,
) -> Response {
    let Some(title) = body.title.filter(|t| !t.trim().is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "title is required");
    };
    match state
        .service
        .create_note(&title, body.content, body.group_id)
        .await
    {
        Ok(note) => ok_data(note),
        Err(e) => service_failure("note", e),
    }
}

async fn update_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<NotePatch>,
) -> Response {
    let Some(id) = RecordId::parse(&id) else {
        return fail(StatusCode::NOT_FOUND, "note not found");
    };
    if patch.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "no fields");
    }
    match state.service.update_note(id, &patch).await {
        Ok(note) => ok_data(note),
        Err(e) => service_failure("note", e),
    }
}

async fn soft_delete_note(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = RecordId::parse(&id) else {
        return fail(StatusCode::NOT_FOUND, "note not found");
    };
    match state.service.soft_delete_note(id).await {
        Ok(()) => ok_empty(),
        Err(e) => service_failure("note", e),
    }
}

async fn restore_note(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = RecordId::parse(&id) else {
        return fail(StatusCode::NOT_FOUND, "note not found");
    };
    match state.service.restore_note(id).await {
        Ok(_note) => ok_empty(),
        Err(e) => service_failure("note", e),
    }
}

async fn permanent_delete_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(id) = RecordId::parse(&id) else {
        return fail(StatusCode::NOT_FOUND, "note not found");
    };
    match state.service.permanently_delete_note(id).await {
        Ok(()) => ok_empty(),
        Err(e) => service_failure("note", e),
    }
}

#[derive(Serialize, Deserialize)]
pub struct BatchResult {
    pub count: usize,
}

async fn batch_notes(State(state): State<AppState>, Json(body): Json<BatchBody>) -> Response {
    let ids = body.ids.unwrap_or_default();
    if ids.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "ids required");
    }
    let Some(action) = body.action.as_deref().and_then(BatchAction::parse) else {
        return fail(StatusCode::BAD_REQUEST, "unknown action");
    };
    let parsed: Vec<RecordId> = ids.iter().filter_map(|s| RecordId::parse(s)).collect();
    match state.service.batch_mutate(action, parsed).await {
        Ok(count) => ok_data(BatchResult { count }),
        Err(e) => service_failure("note", e),
    }
}

/* ──────────── realtime channel ──────────── */

struct WsChannel {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl ClientChannel for WsChannel {
    async fn send_text(&self, text: &str) -> Result<(), ChannelClosed> {
        self.tx
            .send(text.to_string())
            .await
            .map_err(|_| ChannelClosed)
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Register the socket as a hub channel, pump hub frames out, and relay
/// client-originated change signals back through the hub. No session
/// binding, no auth: every connected client sees every event.
async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let hub = state.service.hub().clone();
    let id = hub.register(Arc::new(WsChannel { tx }));
    info!(channel = id, "ws client connected");

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<WireMessage>(&text) {
                Ok(wire) if wire.event == EVENT_CLIENT_NOTES_CHANGED => {
                    hub.relay_from(id, wire.payload).await;
                }
                Ok(wire) => debug!(channel = id, event = %wire.event, "ignoring ws message"),
                Err(_) => debug!(channel = id, "ignoring malformed ws frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.unregister(id);
    send_task.abort();
    info!(channel = id, "ws client disconnected");
}
