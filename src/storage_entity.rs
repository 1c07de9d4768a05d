use bincode::{Decode, Encode};

use crate::error::StoreError;
use crate::record_store::StaticTableDef;

/// A record kind the store can persist: bincode payload behind a leading
/// struct-version byte, keyed by an opaque primary key.
pub trait StorageEntity: Encode + Decode<()> + Sized + Send + Sync + 'static {
    const STRUCT_VERSION: u8;

    fn primary_key(&self) -> Vec<u8>;

    fn table_def() -> StaticTableDef;

    fn to_bytes(&self) -> Vec<u8> {
        let payload = bincode::encode_to_vec(self, bincode::config::standard()).unwrap();
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(Self::STRUCT_VERSION);
        buf.extend(payload);
        buf
    }

    /// Decode bytes written by any historical STRUCT_VERSION.
    fn load_and_migrate(data: &[u8]) -> Result<Self, StoreError>;
}

/// Shared decode path for entities that only have version 0.
pub fn decode_v0<E: StorageEntity>(data: &[u8]) -> Result<E, StoreError> {
    match data.first().copied() {
        Some(0) => bincode::decode_from_slice(&data[1..], bincode::config::standard())
            .map(|(v, _)| v)
            .map_err(|e| StoreError::Bincode(e.to_string())),
        Some(v) => Err(StoreError::Bincode(format!("unknown struct version {v}"))),
        None => Err(StoreError::Bincode("empty record".into())),
    }
}
