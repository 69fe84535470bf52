//! Token identity.
//!
//! A [`TokenId`] is a random UUID that only ever travels inside a signed
//! bearer token. Storage sees the irreversible [`TokenHash`] instead; every
//! record type in the store crate is keyed on `TokenHash`, never `TokenId`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::hash::sha512_b64;

/// Storage form of a token id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenHash(String);

impl TokenHash {
    /// Wrap an already computed hash (e.g. read back from storage).
    pub fn from_stored(hash: impl Into<String>) -> Self {
        TokenHash(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for TokenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire form of a token id. Equality is hash equality.
#[derive(Clone)]
pub struct TokenId {
    uuid: Uuid,
    hash: OnceLock<TokenHash>,
}

impl TokenId {
    pub fn new() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            hash: OnceLock::new(),
        }
    }

    pub fn nil() -> Self {
        Self::from_uuid(Uuid::nil())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn is_valid(&self) -> bool {
        !self.uuid.is_nil()
    }

    /// Computed once, then cached.
    pub fn hash(&self) -> &TokenHash {
        self.hash
            .get_or_init(|| TokenHash(sha512_b64(self.uuid.as_bytes())))
    }

    pub fn is_hash_valid(&self) -> bool {
        self.is_valid() && !self.hash().as_str().is_empty()
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::nil()
    }
}

impl PartialEq for TokenId {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for TokenId {}

impl Hash for TokenId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        TokenId::hash(self).hash(state);
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenId")
            .field("hash", &self.hash().short())
            .finish()
    }
}

impl Serialize for TokenId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.uuid.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Uuid::deserialize(deserializer).map(TokenId::from_uuid)
    }
}
