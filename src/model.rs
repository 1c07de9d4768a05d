use bincode::{Decode, Encode};
use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::record_id::RecordId;
use crate::record_store::StaticTableDef;
use crate::storage_entity::{decode_v0, StorageEntity};

static NOTES_TABLE: TableDefinition<'static, &'static [u8], Vec<u8>> =
    TableDefinition::new("notes");
static GROUPS_TABLE: TableDefinition<'static, &'static [u8], Vec<u8>> =
    TableDefinition::new("groups");

pub const DEFAULT_GROUP_COLOR: &str = "#64748b";

/// A note. Done/undone and soft-delete/restore are independent axes;
/// soft-deleted notes are hidden from default listings regardless of
/// `is_done`.
#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: RecordId,
    pub title: String,
    pub content: String,
    /// Weak reference: the group may only be removed while no live note
    /// points at it.
    pub group_id: Option<RecordId>,
    pub is_done: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl StorageEntity for Note {
    const STRUCT_VERSION: u8 = 0;

    fn primary_key(&self) -> Vec<u8> {
        self.id.into_vec()
    }

    fn table_def() -> StaticTableDef {
        &NOTES_TABLE
    }

    fn load_and_migrate(data: &[u8]) -> Result<Self, StoreError> {
        decode_v0(data)
    }
}

#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: RecordId,
    pub name: String,
    pub color: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl StorageEntity for Group {
    const STRUCT_VERSION: u8 = 0;

    fn primary_key(&self) -> Vec<u8> {
        self.id.into_vec()
    }

    fn table_def() -> StaticTableDef {
        &GROUPS_TABLE
    }

    fn load_and_migrate(data: &[u8]) -> Result<Self, StoreError> {
        decode_v0(data)
    }
}

/// The subset of group fields returned by listings and held in client
/// projections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: RecordId,
    pub name: String,
    pub color: String,
}

impl From<&Group> for GroupSummary {
    fn from(g: &Group) -> Self {
        GroupSummary {
            id: g.id,
            name: g.name.clone(),
            color: g.color.clone(),
        }
    }
}

/// Partial update for a note. Absent fields are left untouched.
///
/// `group_id` is a double option: outer `None` = untouched, `Some(None)` =
/// explicitly cleared. On the wire, `null`, `""`, or an unparseable id all
/// clear the group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_done: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_group_ref",
        serialize_with = "flatten_group_ref"
    )]
    pub group_id: Option<Option<RecordId>>,
}

impl NotePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.is_done.is_none()
            && self.group_id.is_none()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl GroupPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.color.is_none()
    }
}

/// Deserialize a present `groupId` field: string ids parse, everything else
/// (null, empty, garbage) means "clear the reference".
fn lenient_group_ref<'de, D>(de: D) -> Result<Option<Option<RecordId>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(de)?;
    Ok(Some(raw.as_deref().and_then(RecordId::parse)))
}

/// Serialize a present `groupId`: the inner option becomes a string id or
/// an explicit null (which clears the reference server-side).
fn flatten_group_ref<S>(v: &Option<Option<RecordId>>, ser: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match v {
        Some(inner) => inner.serialize(ser),
        // skip_serializing_if keeps this branch unreachable
        None => ser.serialize_none(),
    }
}

/// Same leniency for creation bodies, where the field is single-option.
pub fn lenient_group_id<'de, D>(de: D) -> Result<Option<RecordId>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.as_deref().and_then(RecordId::parse))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_round_trips_through_version_framing() {
        let note = Note {
            id: RecordId::new(),
            title: "groceries".into(),
            content: "<p>milk</p>".into(),
            group_id: Some(RecordId::new()),
            is_done: false,
            is_deleted: false,
            deleted_at: None,
            created_at: 1,
            updated_at: 2,
        };
        let bytes = note.to_bytes();
        assert_eq!(bytes[0], Note::STRUCT_VERSION);
        let back = Note::load_and_migrate(&bytes).unwrap();
        assert_eq!(back, note);
    }

    #[test]
    fn unknown_struct_version_is_rejected() {
        let note = Note {
            id: RecordId::new(),
            title: "t".into(),
            content: String::new(),
            group_id: None,
            is_done: false,
            is_deleted: false,
            deleted_at: None,
            created_at: 0,
            updated_at: 0,
        };
        let mut bytes = note.to_bytes();
        bytes[0] = 9;
        assert!(matches!(
            Note::load_and_migrate(&bytes),
            Err(StoreError::Bincode(_))
        ));
    }

    #[test]
    fn patch_group_id_distinguishes_absent_from_cleared() {
        let p: NotePatch = serde_json::from_str(r#"{"title":"x"}"#).unwrap();
        assert!(p.group_id.is_none());

        let p: NotePatch = serde_json::from_str(r#"{"groupId":null}"#).unwrap();
        assert_eq!(p.group_id, Some(None));

        let p: NotePatch = serde_json::from_str(r#"{"groupId":""}"#).unwrap();
        assert_eq!(p.group_id, Some(None));

        let id = RecordId::new();
        let p: NotePatch =
            serde_json::from_str(&format!(r#"{{"groupId":"{id}"}}"#)).unwrap();
        assert_eq!(p.group_id, Some(Some(id)));
    }

    #[test]
    fn empty_patch_is_detected() {
        let p: NotePatch = serde_json::from_str("{}").unwrap();
        assert!(p.is_empty());
        let p: GroupPatch = serde_json::from_str("{}").unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn wire_names_are_camel_case() {
        let note = Note {
            id: RecordId::new(),
            title: "t".into(),
            content: String::new(),
            group_id: None,
            is_done: true,
            is_deleted: false,
            deleted_at: None,
            created_at: 5,
            updated_at: 6,
        };
        let v = serde_json::to_value(&note).unwrap();
        assert!(v.get("isDone").is_some());
        assert!(v.get("groupId").is_some());
        assert!(v.get("createdAt").is_some());
    }
}
