use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsFrame};
use tracing::{debug, info, warn};

use crate::api::{BatchResult, Envelope};
use crate::config::SyncConfig;
use crate::events::{WireMessage, EVENT_CLIENT_NOTES_CHANGED, EVENT_GROUPS_CHANGED, EVENT_NOTES_CHANGED};
use crate::model::{GroupSummary, Note, NotePatch};
use crate::record_id::RecordId;
use crate::service::{BatchAction, NoteQuery};

/* ──────────── errors ──────────── */

#[derive(Debug, Clone)]
pub enum SyncError {
    /// Operand no longer exists server-side. For self-initiated mutations
    /// the agent absorbs this into a resync instead of surfacing it.
    NotFound,
    /// Server rejected the request (validation, conflict).
    Api(String),
    /// Could not reach the server at all.
    Transport(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotFound => write!(f, "not found"),
            SyncError::Api(m) => write!(f, "api: {m}"),
            SyncError::Transport(m) => write!(f, "transport: {m}"),
        }
    }
}
impl std::error::Error for SyncError {}

/* ──────────── collections API ──────────── */

/// What the agent needs from the server: full-collection reads plus the
/// mutations a client can initiate. Abstract so tests can drive the agent
/// against an in-memory fake.
#[async_trait]
pub trait CollectionsApi: Send + Sync + 'static {
    async fn list_notes(&self, query: &NoteQuery) -> Result<Vec<Note>, SyncError>;
    async fn list_groups(&self) -> Result<Vec<GroupSummary>, SyncError>;

    async fn create_note(
        &self,
        title: &str,
        content: Option<String>,
        group_id: Option<RecordId>,
    ) -> Result<Note, SyncError>;
    async fn update_note(&self, id: RecordId, patch: &NotePatch) -> Result<Note, SyncError>;
    async fn soft_delete_note(&self, id: RecordId) -> Result<(), SyncError>;
    async fn restore_note(&self, id: RecordId) -> Result<(), SyncError>;
    async fn permanently_delete_note(&self, id: RecordId) -> Result<(), SyncError>;
    async fn batch_mutate(&self, action: BatchAction, ids: &[RecordId])
        -> Result<usize, SyncError>;
}

/// reqwest-backed implementation against the notewire HTTP API.
pub struct HttpCollectionsApi {
    client: reqwest::Client,
    base: String,
}

impl HttpCollectionsApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn run<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<Option<T>, SyncError> {
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let status = resp.status();
        let env: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound);
        }
        if !status.is_success() || !env.ok {
            return Err(SyncError::Api(
                env.message.unwrap_or_else(|| status.to_string()),
            ));
        }
        Ok(env.data)
    }
}

#[async_trait]
impl CollectionsApi for HttpCollectionsApi {
    async fn list_notes(&self, query: &NoteQuery) -> Result<Vec<Note>, SyncError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if query.deleted {
            params.push(("deleted", "true".into()));
        }
        if let Some(gid) = query.group_id {
            params.push(("groupId", gid.to_string()));
        }
        let req = self.client.get(self.url("/api/notes")).query(&params);
        Ok(self.run::<Vec<Note>>(req).await?.unwrap_or_default())
    }

    async fn list_groups(&self) -> Result<Vec<GroupSummary>, SyncError> {
        let req = self.client.get(self.url("/api/groups"));
        Ok(self.run::<Vec<GroupSummary>>(req).await?.unwrap_or_default())
    }

    async fn create_note(
        &self,
        title: &str,
        content: Option<String>,
        group_id: Option<RecordId>,
    ) -> Result<Note, SyncError> {
        let body = json!({
            "title": title,
            "content": content,
            "groupId": group_id,
        });
        let req = self.client.post(self.url("/api/notes")).json(&body);
        self.run::<Note>(req)
            .await?
            .ok_or_else(|| SyncError::Api("empty response".into()))
    }

    async fn update_note(&self, id: RecordId, patch: &NotePatch) -> Result<Note, SyncError> {
        let req = self
            .client
            .patch(self.url(&format!("/api/notes/{id}")))
            .json(patch);
        self.run::<Note>(req)
            .await?
            .ok_or_else(|| SyncError::Api("empty response".into()))
    }

    async fn soft_delete_note(&self, id: RecordId) -> Result<(), SyncError> {
        let req = self.client.delete(self.url(&format!("/api/notes/{id}")));
        self.run::<serde_json::Value>(req).await?;
        Ok(())
    }

    async fn restore_note(&self, id: RecordId) -> Result<(), SyncError> {
        let req = self
            .client
            .post(self.url(&format!("/api/notes/{id}/restore")));
        self.run::<serde_json::Value>(req).await?;
        Ok(())
    }

    async fn permanently_delete_note(&self, id: RecordId) -> Result<(), SyncError> {
        let req = self
            .client
            .delete(self.url(&format!("/api/notes/{id}/permanent")));
        self.run::<serde_json::Value>(req).await?;
        Ok(())
    }

    async fn batch_mutate(
        &self,
        action: BatchAction,
        ids: &[RecordId],
    ) -> Result<usize, SyncError> {
        let body = json!({
            "action": action.as_str(),
            "ids": ids.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
        });
        let req = self.client.post(self.url("/api/notes/batch")).json(&body);
        Ok(self
            .run::<BatchResult>(req)
            .await?
            .map(|r| r.count)
            .unwrap_or(0))
    }
}

/* ──────────── local filtering ──────────── */

/// Client-side view filter. `Deleted` and `Group` push a server query;
/// `Ungrouped` and search text are applied to the fetched set on every
/// resync — filters are never persistent server subscriptions.
#[derive(Clone, Debug, PartialEq)]
pub enum NotesFilter {
    All,
    Ungrouped,
    Deleted,
    Group(RecordId),
}

impl NotesFilter {
    pub fn server_query(&self) -> NoteQuery {
        match self {
            NotesFilter::All | NotesFilter::Ungrouped => NoteQuery::default(),
            NotesFilter::Deleted => NoteQuery {
                deleted: true,
                group_id: None,
            },
            NotesFilter::Group(id) => NoteQuery {
                deleted: false,
                group_id: Some(*id),
            },
        }
    }
}

/// Drop markup, keep text. Good enough for substring search over rich-text
/// content.
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

pub fn apply_local_filters(notes: Vec<Note>, filter: &NotesFilter, search: &str) -> Vec<Note> {
    let search = search.trim().to_lowercase();
    notes
        .into_iter()
        .filter(|n| match filter {
            NotesFilter::Ungrouped => n.group_id.is_none(),
            _ => true,
        })
        .filter(|n| {
            if search.is_empty() {
                return true;
            }
            n.title.to_lowercase().contains(&search)
                || strip_tags(&n.content).to_lowercase().contains(&search)
        })
        .collect()
}

/* ──────────── agent ──────────── */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    Connecting,
    Connected,
}

/// The agent's disposable local view. Never authoritative: every resync
/// replaces it wholesale from a fresh fetch.
#[derive(Clone, Debug, Default)]
pub struct Projection {
    pub notes: Vec<Note>,
    pub groups: Vec<GroupSummary>,
}

struct AgentState {
    connectivity: Connectivity,
    filter: NotesFilter,
    search: String,
    notes: Vec<Note>,
    groups: Vec<GroupSummary>,
    // Highest resync ticket already applied, per collection. A slower fetch
    // holding an older ticket is discarded instead of clobbering newer data.
    notes_applied: u64,
    groups_applied: u64,
}

struct RelayLink {
    sender: Option<mpsc::UnboundedSender<String>>,
    /// Signals emitted while the channel was down, flushed on connect.
    pending: Vec<String>,
}

struct AgentShared {
    api: Arc<dyn CollectionsApi>,
    cfg: SyncConfig,
    state: Mutex<AgentState>,
    notes_ticket: AtomicU64,
    groups_ticket: AtomicU64,
    relay: Mutex<RelayLink>,
}

/// One instance per connected client. Keeps a local projection of notes
/// and groups fresh by re-fetching whole collections: on any change signal,
/// on every (re)connect, and on a fallback timer while the realtime channel
/// is down.
pub struct SyncAgent {
    shared: Arc<AgentShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncAgent {
    /// Start the agent with its realtime-channel loop and fallback poll
    /// timer. Both stop when the agent is dropped.
    pub fn start(api: Arc<dyn CollectionsApi>, cfg: SyncConfig) -> Self {
        let mut agent = Self::detached(api, cfg);
        let shared = agent.shared.clone();
        agent.tasks.push(tokio::spawn(run_realtime(shared)));
        let shared = agent.shared.clone();
        agent.tasks.push(tokio::spawn(run_poll(shared)));
        agent
    }

    /// Agent without background tasks; resyncs only when driven explicitly.
    pub fn detached(api: Arc<dyn CollectionsApi>, cfg: SyncConfig) -> Self {
        let shared = Arc::new(AgentShared {
            api,
            cfg,
            state: Mutex::new(AgentState {
                connectivity: Connectivity::Disconnected,
                filter: NotesFilter::All,
                search: String::new(),
                notes: Vec::new(),
                groups: Vec::new(),
                notes_applied: 0,
                groups_applied: 0,
            }),
            notes_ticket: AtomicU64::new(0),
            groups_ticket: AtomicU64::new(0),
            relay: Mutex::new(RelayLink {
                sender: None,
                pending: Vec::new(),
            }),
        });
        Self {
            shared,
            tasks: Vec::new(),
        }
    }

    pub fn projection(&self) -> Projection {
        let st = self.shared.state.lock().unwrap();
        Projection {
            notes: st.notes.clone(),
            groups: st.groups.clone(),
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        self.shared.state.lock().unwrap().connectivity
    }

    pub async fn resync_notes(&self) -> Result<(), SyncError> {
        self.shared.resync_notes().await
    }

    pub async fn resync_groups(&self) -> Result<(), SyncError> {
        self.shared.resync_groups().await
    }

    pub async fn resync_all(&self) -> Result<(), SyncError> {
        self.shared.resync_notes().await?;
        self.shared.resync_groups().await
    }

    /// Switch the view filter and refetch under it.
    pub async fn set_filter(&self, filter: NotesFilter) -> Result<(), SyncError> {
        self.shared.state.lock().unwrap().filter = filter;
        self.shared.resync_notes().await
    }

    /// Search is purely client-side, but the set is still refetched so the
    /// narrowed view starts from fresh data.
    pub async fn set_search(&self, search: impl Into<String>) -> Result<(), SyncError> {
        self.shared.state.lock().unwrap().search = search.into();
        self.shared.resync_notes().await
    }

    /* ── self-initiated mutations ── */

    pub async fn create_note(
        &self,
        title: &str,
        content: Option<String>,
        group_id: Option<RecordId>,
    ) -> Result<Note, SyncError> {
        let note = self.shared.api.create_note(title, content, group_id).await?;
        self.shared
            .emit_change(json!({ "type": "created", "id": note.id }));
        self.shared.resync_notes().await.ok();
        Ok(note)
    }

    pub async fn update_note(&self, id: RecordId, patch: &NotePatch) -> Result<Note, SyncError> {
        let note = self.shared.api.update_note(id, patch).await?;
        self.shared
            .emit_change(json!({ "type": "updated", "id": id }));
        self.shared.resync_notes().await.ok();
        Ok(note)
    }

    /// `NotFound` means another client got there first; that is success
    /// ("already in the target state"), reconciled by resync.
    pub async fn soft_delete_note(&self, id: RecordId) -> Result<(), SyncError> {
        self.absorbing_not_found(
            self.shared.api.soft_delete_note(id).await,
            json!({ "type": "soft-deleted", "id": id }),
        )
        .await
    }

    pub async fn restore_note(&self, id: RecordId) -> Result<(), SyncError> {
        self.absorbing_not_found(
            self.shared.api.restore_note(id).await,
            json!({ "type": "restored", "id": id }),
        )
        .await
    }

    pub async fn permanently_delete_note(&self, id: RecordId) -> Result<(), SyncError> {
        self.absorbing_not_found(
            self.shared.api.permanently_delete_note(id).await,
            json!({ "type": "permanently-deleted", "id": id }),
        )
        .await
    }

    pub async fn batch_mutate(
        &self,
        action: BatchAction,
        ids: &[RecordId],
    ) -> Result<usize, SyncError> {
        let count = self.shared.api.batch_mutate(action, ids).await?;
        self.shared.emit_change(json!({
            "type": format!("{}-batch", action.as_str()),
            "ids": ids,
        }));
        self.shared.resync_notes().await.ok();
        Ok(count)
    }

    async fn absorbing_not_found(
        &self,
        result: Result<(), SyncError>,
        signal: serde_json::Value,
    ) -> Result<(), SyncError> {
        match result {
            Ok(()) => {
                self.shared.emit_change(signal);
                self.shared.resync_notes().await.ok();
                Ok(())
            }
            Err(SyncError::NotFound) => {
                debug!("mutation target already gone; resyncing");
                self.shared.resync_notes().await.ok();
                Ok(())
            }
            // Projection stays untouched until the next resync.
            Err(e) => Err(e),
        }
    }
}

impl Drop for SyncAgent {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

impl AgentShared {
    fn set_connectivity(&self, c: Connectivity) {
        self.state.lock().unwrap().connectivity = c;
    }

    fn connectivity(&self) -> Connectivity {
        self.state.lock().unwrap().connectivity
    }

    /// Full refetch of notes under the current filter. Safe to run
    /// concurrently with itself: each run takes a ticket and only a run
    /// holding a ticket newer than the last applied one may replace the
    /// projection.
    async fn resync_notes(&self) -> Result<(), SyncError> {
        let ticket = self.notes_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let (query, filter, search) = {
            let st = self.state.lock().unwrap();
            (st.filter.server_query(), st.filter.clone(), st.search.clone())
        };
        let fetched = self.api.list_notes(&query).await?;
        let visible = apply_local_filters(fetched, &filter, &search);
        let mut st = self.state.lock().unwrap();
        if ticket > st.notes_applied {
            st.notes = visible;
            st.notes_applied = ticket;
        }
        Ok(())
    }

    async fn resync_groups(&self) -> Result<(), SyncError> {
        let ticket = self.groups_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let fetched = self.api.list_groups().await?;
        let mut st = self.state.lock().unwrap();
        if ticket > st.groups_applied {
            st.groups = fetched;
            st.groups_applied = ticket;
        }
        Ok(())
    }

    /// Queue or send a `client:notes:changed` relay signal. While the
    /// channel is down the signal waits and is flushed on the next connect.
    fn emit_change(&self, payload: serde_json::Value) {
        let text = WireMessage {
            event: EVENT_CLIENT_NOTES_CHANGED.to_string(),
            payload,
        }
        .to_json();
        let mut relay = self.relay.lock().unwrap();
        match &relay.sender {
            Some(tx) => {
                if tx.send(text.clone()).is_err() {
                    relay.sender = None;
                    relay.pending.push(text);
                }
            }
            None => relay.pending.push(text),
        }
    }

    async fn handle_signal(&self, text: &str) {
        let Ok(wire) = serde_json::from_str::<WireMessage>(text) else {
            debug!("ignoring malformed realtime frame");
            return;
        };
        // Signals are cache invalidation, not data: refetch the whole
        // affected collection, never patch from subject ids.
        match wire.event.as_str() {
            EVENT_NOTES_CHANGED => {
                if let Err(e) = self.resync_notes().await {
                    warn!(error = %e, "notes resync failed");
                }
            }
            EVENT_GROUPS_CHANGED => {
                if let Err(e) = self.resync_groups().await {
                    warn!(error = %e, "groups resync failed");
                }
            }
            other => debug!(event = other, "ignoring realtime event"),
        }
    }
}

/// Realtime channel loop: connect, resync both collections ("unknown
/// state, must refresh"), pump signals, and on loss retry with a fixed
/// delay — forever by default, bounded if configured.
async fn run_realtime(shared: Arc<AgentShared>) {
    let mut failures = 0u32;
    loop {
        shared.set_connectivity(Connectivity::Connecting);
        match connect_async(shared.cfg.ws_url.as_str()).await {
            Ok((ws, _resp)) => {
                failures = 0;
                shared.set_connectivity(Connectivity::Connected);
                info!("realtime channel connected");

                let (mut write, mut read) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                {
                    let mut relay = shared.relay.lock().unwrap();
                    for queued in relay.pending.drain(..) {
                        let _ = tx.send(queued);
                    }
                    relay.sender = Some(tx);
                }
                let writer = tokio::spawn(async move {
                    while let Some(text) = rx.recv().await {
                        if write.send(WsFrame::Text(text)).await.is_err() {
                            break;
                        }
                    }
                });

                if let Err(e) = shared.resync_notes().await {
                    warn!(error = %e, "reconnect notes resync failed");
                }
                if let Err(e) = shared.resync_groups().await {
                    warn!(error = %e, "reconnect groups resync failed");
                }

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(WsFrame::Text(text)) => shared.handle_signal(&text).await,
                        Ok(WsFrame::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }

                shared.relay.lock().unwrap().sender = None;
                writer.abort();
                shared.set_connectivity(Connectivity::Disconnected);
                warn!("realtime channel lost");
            }
            Err(e) => {
                shared.set_connectivity(Connectivity::Disconnected);
                debug!(error = %e, "realtime connect failed");
                failures += 1;
                if let Some(max) = shared.cfg.max_reconnect_attempts {
                    if failures >= max {
                        warn!(attempts = failures, "giving up on realtime channel");
                        return;
                    }
                }
            }
        }
        tokio::time::sleep(shared.cfg.reconnect_delay).await;
    }
}

/// Fallback timer: while the realtime channel is down, refetch notes every
/// tick and groups occasionally. Guarantees liveness even if the channel
/// never recovers.
async fn run_poll(shared: Arc<AgentShared>) {
    let mut ticker = tokio::time::interval(shared.cfg.poll_interval);
    loop {
        ticker.tick().await;
        if shared.connectivity() == Connectivity::Connected {
            continue;
        }
        if let Err(e) = shared.resync_notes().await {
            debug!(error = %e, "poll notes resync failed");
        }
        let roll: f64 = rand::rng().random();
        if roll < shared.cfg.group_poll_probability {
            if let Err(e) = shared.resync_groups().await {
                debug!(error = %e, "poll groups resync failed");
            }
        }
    }
}
