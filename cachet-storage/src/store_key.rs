//! Namespace-scoped binary keys for ordered key/value stores.
//!
//! A `NamespacedKey` cannot be built without a namespace, so one
//! namespace's scan can never reach another namespace's rows.

use cachet_core::{Namespace, RecordKey};

/// Separator byte between namespace and record key.
///
/// Never valid inside UTF-8, so it cannot appear in a namespace name.
const SEPARATOR: u8 = 0xFF;

/// A store key scoped to one namespace.
///
/// # Binary Format
///
/// - namespace name as UTF-8 bytes
/// - separator (0xFF)
/// - record key tag byte followed by its payload (see [`RecordKey::encode`])
///
/// Keys sort by namespace first, so a prefix scan over
/// [`NamespacedKey::namespace_prefix`] visits exactly one namespace, in
/// record-key order within each key variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedKey {
    namespace: Namespace,
    key: RecordKey,
}

impl NamespacedKey {
    /// Create a key for `key` in `namespace`.
    pub fn new(namespace: Namespace, key: RecordKey) -> Self {
        Self { namespace, key }
    }

    /// Namespace of this key.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Record key.
    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Self::namespace_prefix(&self.namespace);
        bytes.extend_from_slice(&self.key.encode());
        bytes
    }

    /// Prefix shared by every key of a namespace.
    pub fn namespace_prefix(namespace: &Namespace) -> Vec<u8> {
        let name = namespace.as_str().as_bytes();
        let mut prefix = Vec::with_capacity(name.len() + 1);
        prefix.extend_from_slice(name);
        prefix.push(SEPARATOR);
        prefix
    }

    /// Decode from bytes. Returns `None` for malformed input.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let split = bytes.iter().position(|b| *b == SEPARATOR)?;
        let namespace = std::str::from_utf8(&bytes[..split]).ok()?;
        let key = RecordKey::decode(&bytes[split + 1..])?;
        Some(Self::new(Namespace::new(namespace), key))
    }
}
