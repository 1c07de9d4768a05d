use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{ServiceError, StoreError};
use crate::events::{ChangeEvent, NoteChangeKind};
use crate::hub::BroadcastHub;
use crate::model::{Group, GroupPatch, GroupSummary, Note, NotePatch, DEFAULT_GROUP_COLOR};
use crate::record_id::RecordId;
use crate::record_store::RecordStore;
use crate::storage_entity::StorageEntity;

/// Server-side note listing filter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NoteQuery {
    /// `false` (default) lists live notes; `true` lists only soft-deleted.
    pub deleted: bool,
    pub group_id: Option<RecordId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchAction {
    SoftDelete,
    Restore,
    PermanentDelete,
    MarkDone,
    MarkUndone,
}

impl BatchAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "soft-delete" => Some(BatchAction::SoftDelete),
            "restore" => Some(BatchAction::Restore),
            "permanent-delete" => Some(BatchAction::PermanentDelete),
            "mark-done" => Some(BatchAction::MarkDone),
            "mark-undone" => Some(BatchAction::MarkUndone),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchAction::SoftDelete => "soft-delete",
            BatchAction::Restore => "restore",
            BatchAction::PermanentDelete => "permanent-delete",
            BatchAction::MarkDone => "mark-done",
            BatchAction::MarkUndone => "mark-undone",
        }
    }
}

/// The mutation side of the system. Every operation is a short
/// request-driven unit of work against the record store, atomic per record,
/// followed by exactly one Change Event publication on success and none on
/// failure.
pub struct MutationService {
    store: Arc<RecordStore>,
    hub: Arc<BroadcastHub>,
    clock: Arc<dyn Clock>,
}

impl MutationService {
    pub fn new(store: Arc<RecordStore>, hub: Arc<BroadcastHub>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self { store, hub, clock })
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /* ──────────── queries ──────────── */

    /// Notes matching the query, newest `updated_at` first. Soft-deleted
    /// notes are excluded unless the query asks for them.
    pub async fn list_notes(&self, query: &NoteQuery) -> Result<Vec<Note>, ServiceError> {
        let mut notes: Vec<Note> = self
            .store
            .scan::<Note>()
            .await?
            .into_iter()
            .filter(|n| n.is_deleted == query.deleted)
            .filter(|n| match query.group_id {
                Some(gid) => n.group_id == Some(gid),
                None => true,
            })
            .collect();
        notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(notes)
    }

    /// Group summaries sorted by name.
    pub async fn list_groups(&self) -> Result<Vec<GroupSummary>, ServiceError> {
        let mut groups = self.store.scan::<Group>().await?;
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups.iter().map(GroupSummary::from).collect())
    }

    /* ──────────── note mutations ──────────── */

    pub async fn create_note(
        &self,
        title: &str,
        content: Option<String>,
        group_id: Option<RecordId>,
    ) -> Result<Note, ServiceError> {
        if title.trim().is_empty() {
            return Err(ServiceError::Validation("title is required".into()));
        }
        let now = self.clock.now();
        let note = Note {
            id: RecordId::new(),
            title: title.to_string(),
            content: content.unwrap_or_default(),
            group_id,
            is_done: false,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put(&note).await?;
        debug!(id = %note.id, "note created");
        self.hub.publish(&ChangeEvent::note_created(note.clone())).await;
        Ok(note)
    }

    pub async fn update_note(&self, id: RecordId, patch: &NotePatch) -> Result<Note, ServiceError> {
        if patch.is_empty() {
            return Err(ServiceError::Validation("no fields".into()));
        }
        let note = self
            .modify_note(id, |n| {
                if let Some(title) = &patch.title {
                    n.title = title.clone();
                }
                if let Some(content) = &patch.content {
                    n.content = content.clone();
                }
                if let Some(done) = patch.is_done {
                    n.is_done = done;
                }
                if let Some(group) = patch.group_id {
                    n.group_id = group;
                }
                Ok(())
            })
            .await?;
        self.hub.publish(&ChangeEvent::note_updated(note.clone())).await;
        Ok(note)
    }

    /// Soft delete. A note that is already soft-deleted counts as absent,
    /// so two racing deletes produce exactly one success and one Change
    /// Event.
    pub async fn soft_delete_note(&self, id: RecordId) -> Result<(), ServiceError> {
        let now = self.clock.now();
        self.modify_note(id, |n| {
            if n.is_deleted {
                return Err(ServiceError::NotFound);
            }
            n.is_deleted = true;
            n.deleted_at = Some(now);
            Ok(())
        })
        .await?;
        self.hub.publish(&ChangeEvent::note_soft_deleted(id)).await;
        Ok(())
    }

    pub async fn restore_note(&self, id: RecordId) -> Result<Note, ServiceError> {
        let note = self
            .modify_note(id, |n| {
                n.is_deleted = false;
                n.deleted_at = None;
                Ok(())
            })
            .await?;
        self.hub.publish(&ChangeEvent::note_restored(note.clone())).await;
        Ok(note)
    }

    pub async fn permanently_delete_note(&self, id: RecordId) -> Result<(), ServiceError> {
        self.store.delete::<Note>(id.as_ref()).await?;
        self.hub
            .publish(&ChangeEvent::note_permanently_deleted(id))
            .await;
        Ok(())
    }

    /// Apply `action` to every id that resolves; unresolved ids are
    /// silently skipped — best effort, not all-or-nothing. Returns how many
    /// ids matched. Publishes ONE Change Event carrying the full submitted
    /// id set, so batch size does not multiply message volume.
    pub async fn batch_mutate(
        &self,
        action: BatchAction,
        ids: Vec<RecordId>,
    ) -> Result<usize, ServiceError> {
        let now = self.clock.now();
        let (count, event) = match action {
            BatchAction::PermanentDelete => {
                let keys = ids.iter().map(|id| id.into_vec()).collect();
                let removed = self.store.delete_many::<Note>(keys).await?;
                (
                    removed,
                    ChangeEvent::note_batch(NoteChangeKind::PermanentlyDeletedBatch, ids, None),
                )
            }
            BatchAction::SoftDelete => {
                let n = self
                    .batch_rewrite(&ids, |note| {
                        note.is_deleted = true;
                        note.deleted_at = Some(now);
                        note.updated_at = now;
                    })
                    .await?;
                (
                    n,
                    ChangeEvent::note_batch(NoteChangeKind::SoftDeletedBatch, ids, None),
                )
            }
            BatchAction::Restore => {
                let n = self
                    .batch_rewrite(&ids, |note| {
                        note.is_deleted = false;
                        note.deleted_at = None;
                        note.updated_at = now;
                    })
                    .await?;
                (
                    n,
                    ChangeEvent::note_batch(NoteChangeKind::RestoredBatch, ids, None),
                )
            }
            BatchAction::MarkDone => {
                let n = self
                    .batch_rewrite(&ids, |note| {
                        note.is_done = true;
                        note.updated_at = now;
                    })
                    .await?;
                (
                    n,
                    ChangeEvent::note_batch(NoteChangeKind::UpdatedBatch, ids, Some(true)),
                )
            }
            BatchAction::MarkUndone => {
                let n = self
                    .batch_rewrite(&ids, |note| {
                        note.is_done = false;
                        note.updated_at = now;
                    })
                    .await?;
                (
                    n,
                    ChangeEvent::note_batch(NoteChangeKind::UpdatedBatch, ids, Some(false)),
                )
            }
        };
        self.hub.publish(&event).await;
        Ok(count)
    }

    /* ──────────── group mutations ──────────── */

    pub async fn create_group(
        &self,
        name: &str,
        color: Option<String>,
    ) -> Result<Group, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation("name is required".into()));
        }
        let now = self.clock.now();
        let group = Group {
            id: RecordId::new(),
            name: name.to_string(),
            color: color.unwrap_or_else(|| DEFAULT_GROUP_COLOR.to_string()),
            created_at: now,
            updated_at: now,
        };
        self.store.put(&group).await?;
        self.hub.publish(&ChangeEvent::group_created(group.clone())).await;
        Ok(group)
    }

    pub async fn update_group(
        &self,
        id: RecordId,
        patch: &GroupPatch,
    ) -> Result<Group, ServiceError> {
        if patch.is_empty() {
            return Err(ServiceError::Validation("no fields".into()));
        }
        let group = loop {
            let raw = self.store.get_raw::<Group>(id.as_ref()).await?;
            let mut group = Group::load_and_migrate(&raw)?;
            if let Some(name) = &patch.name {
                group.name = name.clone();
            }
            if let Some(color) = &patch.color {
                group.color = color.clone();
            }
            group.updated_at = self.clock.now();
            match self.store.put_expecting(&group, raw).await {
                Ok(()) => break group,
                Err(StoreError::WriteConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.hub.publish(&ChangeEvent::group_updated(group.clone())).await;
        Ok(group)
    }

    /// Permanent group removal, allowed only while zero live notes
    /// reference the group. Soft-deleted notes do not block it.
    pub async fn delete_group(&self, id: RecordId) -> Result<(), ServiceError> {
        let live_refs = self
            .store
            .scan::<Note>()
            .await?
            .iter()
            .filter(|n| !n.is_deleted && n.group_id == Some(id))
            .count();
        if live_refs > 0 {
            return Err(ServiceError::Conflict(
                "Group has notes. Move or delete notes first.".into(),
            ));
        }
        self.store.delete::<Group>(id.as_ref()).await?;
        self.hub.publish(&ChangeEvent::group_deleted(id)).await;
        Ok(())
    }

    /* ──────────── internals ──────────── */

    /// Read-modify-write with a conditional put. A lost race re-reads and
    /// retries, so concurrent modifications interleave record-atomically.
    async fn modify_note<F>(&self, id: RecordId, apply: F) -> Result<Note, ServiceError>
    where
        F: Fn(&mut Note) -> Result<(), ServiceError>,
    {
        loop {
            let raw = self.store.get_raw::<Note>(id.as_ref()).await?;
            let mut note = Note::load_and_migrate(&raw)?;
            apply(&mut note)?;
            note.updated_at = self.clock.now();
            match self.store.put_expecting(&note, raw).await {
                Ok(()) => return Ok(note),
                Err(StoreError::WriteConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Load every id that resolves, rewrite, and store the lot in a single
    /// multi-record write. No cross-record transaction: records may be
    /// visible mid-batch to concurrent readers.
    async fn batch_rewrite<F>(&self, ids: &[RecordId], apply: F) -> Result<usize, ServiceError>
    where
        F: Fn(&mut Note),
    {
        let mut touched = Vec::new();
        for id in ids {
            match self.store.get::<Note>(id.as_ref()).await {
                Ok(mut note) => {
                    apply(&mut note);
                    touched.push(note);
                }
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let n = touched.len();
        if n > 0 {
            self.store.put_many(&touched).await?;
        }
        Ok(n)
    }
}
