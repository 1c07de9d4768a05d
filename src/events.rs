use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{Group, Note};
use crate::record_id::RecordId;

pub const EVENT_NOTES_CHANGED: &str = "notes:changed";
pub const EVENT_GROUPS_CHANGED: &str = "groups:changed";
/// Client-originated relay signal; the hub rebroadcasts its payload to
/// every other channel as `notes:changed`.
pub const EVENT_CLIENT_NOTES_CHANGED: &str = "client:notes:changed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoteChangeKind {
    Created,
    Updated,
    SoftDeleted,
    Restored,
    PermanentlyDeleted,
    SoftDeletedBatch,
    RestoredBatch,
    PermanentlyDeletedBatch,
    UpdatedBatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupChangeKind {
    Created,
    Updated,
    Deleted,
}

/// A signal broadcast after a successful mutation: which entity kind
/// changed, how, and which ids were involved.
///
/// This is not a delta. Single-record note events may carry the fresh
/// record as `snapshot`, but that is an optimization only — a snapshot can
/// arrive after a later mutation's event, so subscribers always reconcile
/// by re-fetching, never by applying the snapshot in place.
#[derive(Clone, Debug)]
pub enum ChangeEvent {
    Notes {
        kind: NoteChangeKind,
        ids: Vec<RecordId>,
        snapshot: Option<Note>,
        /// `is_done` value applied by an `updated-batch` event.
        done: Option<bool>,
    },
    Groups {
        kind: GroupChangeKind,
        ids: Vec<RecordId>,
        snapshot: Option<Group>,
    },
}

impl ChangeEvent {
    pub fn note_created(note: Note) -> Self {
        ChangeEvent::Notes {
            kind: NoteChangeKind::Created,
            ids: vec![note.id],
            snapshot: Some(note),
            done: None,
        }
    }

    pub fn note_updated(note: Note) -> Self {
        ChangeEvent::Notes {
            kind: NoteChangeKind::Updated,
            ids: vec![note.id],
            snapshot: Some(note),
            done: None,
        }
    }

    pub fn note_soft_deleted(id: RecordId) -> Self {
        ChangeEvent::Notes {
            kind: NoteChangeKind::SoftDeleted,
            ids: vec![id],
            snapshot: None,
            done: None,
        }
    }

    pub fn note_restored(note: Note) -> Self {
        ChangeEvent::Notes {
            kind: NoteChangeKind::Restored,
            ids: vec![note.id],
            snapshot: Some(note),
            done: None,
        }
    }

    pub fn note_permanently_deleted(id: RecordId) -> Self {
        ChangeEvent::Notes {
            kind: NoteChangeKind::PermanentlyDeleted,
            ids: vec![id],
            snapshot: None,
            done: None,
        }
    }

    /// One event per batch, carrying the full submitted id set: batch size
    /// does not multiply broadcast volume.
    pub fn note_batch(kind: NoteChangeKind, ids: Vec<RecordId>, done: Option<bool>) -> Self {
        ChangeEvent::Notes {
            kind,
            ids,
            snapshot: None,
            done,
        }
    }

    pub fn group_created(group: Group) -> Self {
        ChangeEvent::Groups {
            kind: GroupChangeKind::Created,
            ids: vec![group.id],
            snapshot: Some(group),
        }
    }

    pub fn group_updated(group: Group) -> Self {
        ChangeEvent::Groups {
            kind: GroupChangeKind::Updated,
            ids: vec![group.id],
            snapshot: Some(group),
        }
    }

    pub fn group_deleted(id: RecordId) -> Self {
        ChangeEvent::Groups {
            kind: GroupChangeKind::Deleted,
            ids: vec![id],
            snapshot: None,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ChangeEvent::Notes { .. } => EVENT_NOTES_CHANGED,
            ChangeEvent::Groups { .. } => EVENT_GROUPS_CHANGED,
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        let payload = match self {
            ChangeEvent::Notes {
                kind,
                ids,
                snapshot,
                done,
            } => {
                let mut p = json!({ "type": kind });
                match snapshot {
                    Some(note) => p["note"] = json!(note),
                    None if ids.len() == 1 => p["id"] = json!(ids[0]),
                    None => p["ids"] = json!(ids),
                }
                if let Some(done) = done {
                    p["patch"] = json!({ "isDone": done });
                }
                p
            }
            ChangeEvent::Groups {
                kind,
                ids,
                snapshot,
            } => match snapshot {
                Some(group) => json!({ "type": kind, "group": group }),
                None => json!({ "type": kind, "id": ids[0] }),
            },
        };
        WireMessage {
            event: self.event_name().to_string(),
            payload,
        }
    }
}

/// Envelope for every message on the realtime channel, both directions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

impl WireMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
