//! Storage rows. Every token reference here is a [`TokenHash`].

use mytoken_core::{ResponseType, TokenHash, UnixTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of one shared refresh token ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretId(pub u64);

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage projection of a mytoken node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: TokenHash,
    pub seq_no: u64,
    /// `None` for roots.
    pub parent_id: Option<TokenHash>,
    pub root_id: TokenHash,
    pub secret_id: SecretId,
    pub oidc_subject: String,
    pub oidc_issuer: String,
    pub name: Option<String>,
    pub created: UnixTime,
    pub last_rotated: UnixTime,
    /// `UnixTime::UNSET` when the node never expires.
    pub expires_at: UnixTime,
    pub ip_created: Option<String>,
    #[serde(default)]
    pub restrictions: Option<serde_json::Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub rotation: Option<serde_json::Value>,
}

impl NodeRecord {
    pub fn is_root(&self) -> bool {
        match &self.parent_id {
            None => true,
            Some(parent) => *parent == self.id,
        }
    }

    pub fn is_expired(&self, now: UnixTime) -> bool {
        !self.expires_at.is_unset() && self.expires_at <= now
    }
}

/// Selects a set of nodes for [`crate::Transaction::list_nodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeFilter {
    Root(TokenHash),
    Parent(TokenHash),
    Owner { subject: String, issuer: String },
    All,
}

impl NodeFilter {
    pub fn matches(&self, node: &NodeRecord) -> bool {
        match self {
            NodeFilter::Root(root) => node.root_id == *root,
            NodeFilter::Parent(parent) => {
                node.parent_id.as_ref() == Some(parent) && node.id != *parent
            }
            NodeFilter::Owner { subject, issuer } => {
                node.oidc_subject == *subject && node.oidc_issuer == *issuer
            }
            NodeFilter::All => true,
        }
    }
}

/// A node's data key, wrapped under that node's bearer string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeyRecord {
    pub token_id: TokenHash,
    pub wrapped_key: String,
    pub secret_id: SecretId,
}

/// Usage counters for one `(token, restriction)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub token_id: TokenHash,
    pub restriction_hash: String,
    /// Canonical JSON of the restriction the hash was computed over
    pub restriction: String,
    pub usages_at: u64,
    pub usages_other: u64,
}

/// Identifies the counter a use is recorded against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageKey {
    pub token_id: TokenHash,
    pub restriction_hash: String,
    pub restriction: String,
}

impl UsageKey {
    pub(crate) fn map_key(&self) -> String {
        usage_map_key(&self.token_id, &self.restriction_hash)
    }
}

// base64 never produces '|', so the composite key is unambiguous.
pub(crate) fn usage_map_key(token: &TokenHash, restriction_hash: &str) -> String {
    format!("{}|{}", token.as_str(), restriction_hash)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    ShortToken,
    TransferCode,
    PollingCode,
}

/// Response shaping attached to transfer and polling codes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAttributes {
    pub new_mytoken: bool,
    pub response_type: ResponseType,
    pub max_token_len: Option<usize>,
}

/// A proxy token: `id` is the hash of the opaque string, `ciphertext` is the
/// payload encrypted under that string. A pending polling code has an empty
/// ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: String,
    pub kind: ProxyKind,
    pub ciphertext: String,
    pub token_id: Option<TokenHash>,
    pub created: UnixTime,
    pub expires_at: Option<UnixTime>,
    #[serde(default)]
    pub attributes: Option<TransferAttributes>,
}

impl ProxyRecord {
    pub fn is_expired(&self, now: UnixTime) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// Kinds of entries in a token's event history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEvent {
    Created,
    SubtokenCreated,
    Rotated,
    AccessTokenIssued,
    TransferCodeCreated,
    TransferCodeUsed,
}

impl fmt::Display for TokenEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenEvent::Created => "created",
            TokenEvent::SubtokenCreated => "subtoken_created",
            TokenEvent::Rotated => "rotated",
            TokenEvent::AccessTokenIssued => "access_token_issued",
            TokenEvent::TransferCodeCreated => "transfer_code_created",
            TokenEvent::TransferCodeUsed => "transfer_code_used",
        };
        f.write_str(name)
    }
}

/// One entry of a token's event history. Deleted together with the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub token_id: TokenHash,
    pub event: TokenEvent,
    #[serde(default)]
    pub comment: String,
    pub ip: Option<String>,
    pub time: UnixTime,
}
