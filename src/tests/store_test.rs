use crate::error::StoreError;
use crate::model::{Group, Note};
use crate::record_id::RecordId;
use crate::record_store::RecordStore;

fn sample_note(title: &str) -> Note {
    Note {
        id: RecordId::new(),
        title: title.into(),
        content: String::new(),
        group_id: None,
        is_done: false,
        is_deleted: false,
        deleted_at: None,
        created_at: 10,
        updated_at: 10,
    }
}

async fn open_store() -> std::sync::Arc<RecordStore> {
    let store = RecordStore::open_in_memory().unwrap();
    store.create_table::<Note>().unwrap();
    store.create_table::<Group>().unwrap();
    store
}

#[tokio::test]
async fn put_get_round_trip() {
    let store = open_store().await;
    let note = sample_note("a");
    store.put(&note).await.unwrap();
    let got: Note = store.get(note.id.as_ref()).await.unwrap();
    assert_eq!(got, note);
}

#[tokio::test]
async fn get_missing_is_not_found() {
    let store = open_store().await;
    let err = store.get::<Note>(RecordId::new().as_ref()).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
}

#[tokio::test]
async fn conditional_put_rejects_stale_snapshot() {
    let store = open_store().await;
    let mut note = sample_note("a");
    store.put(&note).await.unwrap();

    let snapshot = store.get_raw::<Note>(note.id.as_ref()).await.unwrap();

    // Another writer gets there first.
    note.title = "b".into();
    store.put(&note).await.unwrap();

    note.title = "c".into();
    let err = store.put_expecting(&note, snapshot).await.unwrap_err();
    assert!(matches!(err, StoreError::WriteConflict));

    let got: Note = store.get(note.id.as_ref()).await.unwrap();
    assert_eq!(got.title, "b");
}

#[tokio::test]
async fn delete_is_exactly_once() {
    let store = open_store().await;
    let note = sample_note("a");
    store.put(&note).await.unwrap();

    store.delete::<Note>(note.id.as_ref()).await.unwrap();
    let err = store.delete::<Note>(note.id.as_ref()).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
}

#[tokio::test]
async fn delete_many_skips_missing_and_reports_count() {
    let store = open_store().await;
    let a = sample_note("a");
    let b = sample_note("b");
    store.put_many(&[a.clone(), b.clone()]).await.unwrap();

    let removed = store
        .delete_many::<Note>(vec![
            a.id.into_vec(),
            b.id.into_vec(),
            RecordId::new().into_vec(),
        ])
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(store.scan::<Note>().await.unwrap().is_empty());
}

#[tokio::test]
async fn on_disk_store_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.redb");
    let store = RecordStore::open(path.to_str().unwrap()).unwrap();
    store.create_table::<Note>().unwrap();

    let note = sample_note("durable");
    store.put(&note).await.unwrap();
    let got: Note = store.get(note.id.as_ref()).await.unwrap();
    assert_eq!(got, note);
    assert_eq!(store.scan::<Note>().await.unwrap().len(), 1);
}

#[tokio::test]
async fn scan_returns_everything_in_the_table() {
    let store = open_store().await;
    for i in 0..5 {
        store.put(&sample_note(&format!("n{i}"))).await.unwrap();
    }
    assert_eq!(store.scan::<Note>().await.unwrap().len(), 5);
    assert!(store.scan::<Group>().await.unwrap().is_empty());
}
