use mytoken_core::{MytokenResult, TokenHash, UnixTime};
use mytoken_store::{NodeRecord, SecretId, Transaction};

use crate::custody::release_secrets;
use crate::token::MytokenClaims;

/// Nodes removed by a revocation, plus the refresh token ciphertexts that
/// lost their last reference with them.
#[derive(Debug, Default)]
pub struct Revoked {
    pub nodes: Vec<NodeRecord>,
    pub released_secrets: Vec<SecretId>,
}

impl Revoked {
    pub fn ids(&self) -> Vec<TokenHash> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }
}

/// Delete `id` (with `cascade`, its whole subtree) and release any shared
/// refresh token nothing points at afterwards.
pub fn revoke_lineage<T: Transaction>(
    tx: &mut T,
    id: &TokenHash,
    cascade: bool,
) -> MytokenResult<Revoked> {
    let nodes = tx.delete_node(id, cascade)?;
    let released = release_secrets(tx, nodes.iter().map(|n| n.secret_id))?;
    if !nodes.is_empty() {
        tracing::info!(
            token = id.short(),
            cascade,
            deleted = nodes.len(),
            released_secrets = released.len(),
            "mytoken revoked"
        );
    }
    Ok(Revoked {
        nodes,
        released_secrets: released,
    })
}

/// How a presented generation relates to the stored token.
#[derive(Debug)]
pub enum RevocationStatus {
    /// The latest generation.
    Current,
    /// An older generation still inside its rotation lifetime. It
    /// authenticates, but its wrapped key already belongs to the newer
    /// bearer, so nothing that needs the refresh token accepts it.
    Superseded,
    Revoked,
    /// A stale generation past its lifetime; this check revoked the lineage.
    LineageRevoked(Revoked),
}

impl RevocationStatus {
    pub fn is_revoked(&self) -> bool {
        matches!(self, Self::Revoked | Self::LineageRevoked(_))
    }
}

/// Classify the token described by `claims`.
///
/// - absent from the store: revoked
/// - sequence number ahead of the stored one: revoked
/// - sequence number behind (an older generation of a rotated token):
///   revoked, unless the token has a bounded rotation lifetime and the old
///   generation is still within it. Once the lifetime has passed and
///   auto-revoke is set, the whole lineage is revoked inside `tx`.
pub fn revocation_status<T: Transaction>(
    tx: &mut T,
    claims: &MytokenClaims,
    now: UnixTime,
) -> MytokenResult<RevocationStatus> {
    let id = claims.id();
    let Some(node) = tx.get_node(id)? else {
        return Ok(RevocationStatus::Revoked);
    };
    if claims.seq_no == node.seq_no {
        return Ok(RevocationStatus::Current);
    }
    if claims.seq_no > node.seq_no {
        tracing::warn!(
            token = id.short(),
            presented = claims.seq_no,
            stored = node.seq_no,
            "sequence number ahead of the stored one"
        );
        return Ok(RevocationStatus::Revoked);
    }

    let rotation = claims.rotation();
    let Some(lifetime) = rotation.bounded_lifetime() else {
        return Ok(RevocationStatus::Revoked);
    };
    let age = claims.iat.secs_until(now);
    if age <= lifetime {
        return Ok(RevocationStatus::Superseded);
    }
    if !rotation.auto_revoke {
        return Ok(RevocationStatus::Revoked);
    }
    tracing::warn!(
        token = id.short(),
        presented = claims.seq_no,
        stored = node.seq_no,
        "stale rotated token presented, revoking lineage"
    );
    Ok(RevocationStatus::LineageRevoked(revoke_lineage(tx, id, true)?))
}

/// Whether the token described by `claims` is no longer usable. See
/// [`revocation_status`] for the rules and the auto-revoke side effect.
pub fn is_revoked<T: Transaction>(
    tx: &mut T,
    claims: &MytokenClaims,
    now: UnixTime,
) -> MytokenResult<bool> {
    Ok(revocation_status(tx, claims, now)?.is_revoked())
}
