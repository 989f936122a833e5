//! Identity types for cached records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Logical partition of cache and store, one per record type.
///
/// Keys are unique only within a namespace, so every cache and store
/// operation is addressed by `(Namespace, RecordKey)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// Create a namespace from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The namespace name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Namespace {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Opaque, hashable, totally ordered record identifier.
///
/// Variant order is part of the total order: every `Id` sorts before every
/// `Natural`, which sorts before every `Uuid`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKey {
    /// Surrogate numeric id
    Id(i64),
    /// Natural key such as a postal code
    Natural(String),
    /// Externally generated UUID
    Uuid(Uuid),
}

impl RecordKey {
    /// Numeric id key.
    pub fn id(id: i64) -> Self {
        Self::Id(id)
    }

    /// Natural (string) key.
    pub fn natural(key: impl Into<String>) -> Self {
        Self::Natural(key.into())
    }

    /// Fresh timestamp-sortable UUIDv7 key.
    pub fn new_uuid() -> Self {
        Self::Uuid(Uuid::now_v7())
    }

    /// The numeric id, if this is an `Id` key.
    pub fn as_id(&self) -> Option<i64> {
        match self {
            Self::Id(id) => Some(*id),
            _ => None,
        }
    }

    /// Variant tag used by binary key encodings.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Id(_) => 0,
            Self::Natural(_) => 1,
            Self::Uuid(_) => 2,
        }
    }

    /// Encode to bytes whose lexicographic order matches the key order.
    ///
    /// Format: `[tag: 1 byte][payload]`. Ids are big-endian with the sign
    /// bit flipped so negative ids sort first.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.tag()];
        match self {
            Self::Id(id) => bytes.extend_from_slice(&((*id as u64) ^ (1 << 63)).to_be_bytes()),
            Self::Natural(key) => bytes.extend_from_slice(key.as_bytes()),
            Self::Uuid(uuid) => bytes.extend_from_slice(uuid.as_bytes()),
        }
        bytes
    }

    /// Decode bytes produced by [`RecordKey::encode`].
    ///
    /// Returns `None` for an unknown tag or a malformed payload.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (tag, payload) = bytes.split_first()?;
        match tag {
            0 => {
                let raw: [u8; 8] = payload.try_into().ok()?;
                Some(Self::Id((u64::from_be_bytes(raw) ^ (1 << 63)) as i64))
            }
            1 => std::str::from_utf8(payload)
                .ok()
                .map(|s| Self::Natural(s.to_string())),
            2 => Uuid::from_slice(payload).ok().map(Self::Uuid),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Natural(key) => write!(f, "'{}'", key),
            Self::Uuid(uuid) => write!(f, "{}", uuid),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for RecordKey {
    fn from(key: &str) -> Self {
        Self::Natural(key.to_string())
    }
}

impl From<Uuid> for RecordKey {
    fn from(uuid: Uuid) -> Self {
        Self::Uuid(uuid)
    }
}
