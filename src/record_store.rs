use redb::ReadableTable;
use redb::{Database, TableDefinition};

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::StoreError;
use crate::storage_entity::StorageEntity;

pub type StaticTableDef = &'static TableDefinition<'static, &'static [u8], Vec<u8>>;

/// Condition attached to a single-record put.
pub enum Expect {
    /// Unconditional overwrite/insert.
    Any,
    /// Write only if the stored bytes still equal this snapshot; otherwise
    /// the caller lost a race and gets `WriteConflict`.
    Current(Vec<u8>),
}

pub enum WriteRequest {
    Put {
        table: StaticTableDef,
        key: Vec<u8>,
        value: Vec<u8>,
        expect: Expect,
        respond_to: oneshot::Sender<Result<(), StoreError>>,
    },
    /// Multi-record write in a single transaction. Not a cross-record
    /// guarantee toward readers: each record is independently visible once
    /// the transaction commits, and callers treat the batch as best-effort.
    PutMany {
        table: StaticTableDef,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        respond_to: oneshot::Sender<Result<(), StoreError>>,
    },
    Delete {
        table: StaticTableDef,
        key: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), StoreError>>,
    },
    DeleteMany {
        table: StaticTableDef,
        keys: Vec<Vec<u8>>,
        respond_to: oneshot::Sender<Result<usize, StoreError>>,
    },
}

/// Durable record store: a redb database with all writes funneled through a
/// single background task, so each write request is applied atomically and
/// in submission order.
pub struct RecordStore {
    db: Arc<Database>,
    write_tx: mpsc::Sender<WriteRequest>,
}

impl RecordStore {
    pub fn open(path: &str) -> Result<Arc<Self>, StoreError> {
        let db = Database::create(path).map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(Self::start(db))
    }

    /// Ephemeral store for tests and in-memory deployments.
    pub fn open_in_memory() -> Result<Arc<Self>, StoreError> {
        let db = redb::Builder::new()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(Self::start(db))
    }

    fn start(db: Database) -> Arc<Self> {
        let (write_tx, mut write_rx) = mpsc::channel(100);
        let store = Arc::new(RecordStore {
            db: Arc::new(db),
            write_tx,
        });
        let store2 = store.clone();
        tokio::spawn(async move {
            while let Some(req) = write_rx.recv().await {
                store2.handle_write(req);
            }
        });
        store
    }

    /// Create the table for an entity kind. Idempotent.
    pub fn create_table<E: StorageEntity>(&self) -> Result<(), StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        txn.open_table(*E::table_def())
            .map_err(|e| StoreError::Other(e.to_string()))?;
        txn.commit().map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(())
    }

    pub async fn get<E: StorageEntity>(&self, key: &[u8]) -> Result<E, StoreError> {
        let raw = self.get_raw::<E>(key).await?;
        E::load_and_migrate(&raw)
    }

    /// Stored bytes for a key, usable as the `Expect::Current` snapshot of a
    /// later conditional put.
    pub async fn get_raw<E: StorageEntity>(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let table = txn
            .open_table(*E::table_def())
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let val = table
            .get(key)
            .map_err(|e| StoreError::Other(e.to_string()))?;
        match val {
            Some(v) => Ok(v.value().to_vec()),
            None => Err(StoreError::NotFound),
        }
    }

    /// Full scan of an entity table. Listings at this scale filter in
    /// memory instead of maintaining secondary indexes.
    pub async fn scan<E: StorageEntity>(&self) -> Result<Vec<E>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let table = txn
            .open_table(*E::table_def())
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let mut out = Vec::new();
        for item in table.iter().map_err(|e| StoreError::Other(e.to_string()))? {
            let (_k, v) = item.map_err(|e| StoreError::Other(e.to_string()))?;
            out.push(E::load_and_migrate(&v.value())?);
        }
        Ok(out)
    }

    pub async fn put<E: StorageEntity>(&self, entity: &E) -> Result<(), StoreError> {
        self.put_with(entity, Expect::Any).await
    }

    /// Conditional put: succeeds only if the record's stored bytes still
    /// equal `current`. Lost races return `WriteConflict`.
    pub async fn put_expecting<E: StorageEntity>(
        &self,
        entity: &E,
        current: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.put_with(entity, Expect::Current(current)).await
    }

    async fn put_with<E: StorageEntity>(
        &self,
        entity: &E,
        expect: Expect,
    ) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest::Put {
                table: E::table_def(),
                key: entity.primary_key(),
                value: entity.to_bytes(),
                expect,
                respond_to: tx,
            })
            .await
            .map_err(|e| StoreError::Other(format!("Write queue dropped: {}", e)))?;
        rx.await
            .map_err(|e| StoreError::Other(format!("Write task dropped: {}", e)))?
    }

    pub async fn put_many<E: StorageEntity>(&self, entities: &[E]) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        let entries = entities
            .iter()
            .map(|e| (e.primary_key(), e.to_bytes()))
            .collect();
        self.write_tx
            .send(WriteRequest::PutMany {
                table: E::table_def(),
                entries,
                respond_to: tx,
            })
            .await
            .map_err(|e| StoreError::Other(format!("Write queue dropped: {}", e)))?;
        rx.await
            .map_err(|e| StoreError::Other(format!("Write task dropped: {}", e)))?
    }

    /// Remove one record. `NotFound` if the key is absent — checked inside
    /// the write transaction, so two racing deletes resolve to exactly one
    /// success.
    pub async fn delete<E: StorageEntity>(&self, key: &[u8]) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest::Delete {
                table: E::table_def(),
                key: key.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|e| StoreError::Other(format!("Write queue dropped: {}", e)))?;
        rx.await
            .map_err(|e| StoreError::Other(format!("Write task dropped: {}", e)))?
    }

    /// Remove many records in one transaction; absent keys are skipped.
    /// Returns how many records were actually removed.
    pub async fn delete_many<E: StorageEntity>(
        &self,
        keys: Vec<Vec<u8>>,
    ) -> Result<usize, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest::DeleteMany {
                table: E::table_def(),
                keys,
                respond_to: tx,
            })
            .await
            .map_err(|e| StoreError::Other(format!("Write queue dropped: {}", e)))?;
        rx.await
            .map_err(|e| StoreError::Other(format!("Write task dropped: {}", e)))?
    }

    // ----------- write task --------------

    fn handle_write(&self, req: WriteRequest) {
        match req {
            WriteRequest::Put {
                table,
                key,
                value,
                expect,
                respond_to,
            } => {
                let _ = respond_to.send(self.apply_put(table, &key, value, expect));
            }
            WriteRequest::PutMany {
                table,
                entries,
                respond_to,
            } => {
                let _ = respond_to.send(self.apply_put_many(table, entries));
            }
            WriteRequest::Delete {
                table,
                key,
                respond_to,
            } => {
                let _ = respond_to.send(self.apply_delete(table, &key));
            }
            WriteRequest::DeleteMany {
                table,
                keys,
                respond_to,
            } => {
                let _ = respond_to.send(self.apply_delete_many(table, keys));
            }
        }
    }

    fn apply_put(
        &self,
        table: StaticTableDef,
        key: &[u8],
        value: Vec<u8>,
        expect: Expect,
    ) -> Result<(), StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        {
            let mut t = txn
                .open_table(*table)
                .map_err(|e| StoreError::Other(e.to_string()))?;
            if let Expect::Current(snapshot) = &expect {
                let current = t.get(key).map_err(|e| StoreError::Other(e.to_string()))?;
                match current {
                    Some(v) if v.value() == snapshot.as_slice() => {}
                    _ => return Err(StoreError::WriteConflict),
                }
            }
            t.insert(key, value)
                .map_err(|e| StoreError::Other(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(())
    }

    fn apply_put_many(
        &self,
        table: StaticTableDef,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        {
            let mut t = txn
                .open_table(*table)
                .map_err(|e| StoreError::Other(e.to_string()))?;
            for (key, value) in entries {
                t.insert(key.as_slice(), value)
                    .map_err(|e| StoreError::Other(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(())
    }

    fn apply_delete(&self, table: StaticTableDef, key: &[u8]) -> Result<(), StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let removed = {
            let mut t = txn
                .open_table(*table)
                .map_err(|e| StoreError::Other(e.to_string()))?;
            let removed = t
                .remove(key)
                .map_err(|e| StoreError::Other(e.to_string()))?
                .is_some();
            removed
        };
        txn.commit().map_err(|e| StoreError::Other(e.to_string()))?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    fn apply_delete_many(
        &self,
        table: StaticTableDef,
        keys: Vec<Vec<u8>>,
    ) -> Result<usize, StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let mut removed = 0usize;
        {
            let mut t = txn
                .open_table(*table)
                .map_err(|e| StoreError::Other(e.to_string()))?;
            for key in keys {
                if t.remove(key.as_slice())
                    .map_err(|e| StoreError::Other(e.to_string()))?
                    .is_some()
                {
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(removed)
    }
}
