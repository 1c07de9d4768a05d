use bincode::{Decode, Encode};
use uuid::Uuid;

/// Opaque 16-byte record identifier. Raw bytes inside the store, hyphenated
/// uuid string on the JSON wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Encode, Decode)]
#[repr(transparent)]
pub struct RecordId([u8; 16]);

impl RecordId {
    pub fn new() -> Self {
        RecordId(*Uuid::new_v4().as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        RecordId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Lenient parse: `None` for anything that is not a uuid.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(|u| RecordId(*u.as_bytes()))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|u| RecordId(*u.as_bytes()))
    }
}

impl From<Uuid> for RecordId {
    fn from(u: Uuid) -> Self {
        RecordId(*u.as_bytes())
    }
}
impl From<RecordId> for Uuid {
    fn from(b: RecordId) -> Self {
        Uuid::from_bytes(b.0)
    }
}

impl AsRef<[u8]> for RecordId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl serde::Serialize for RecordId {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for RecordId {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
