use mytoken_core::{MytokenResult, UnixTime};
use mytoken_store::{NodeFilter, Transaction};
use serde::Serialize;

use crate::custody::release_secrets;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub expired_tokens: usize,
    pub released_secrets: usize,
    pub expired_proxies: usize,
}

/// Delete expired tokens (one by one, not their subtrees) and expired
/// transfer and polling codes.
pub fn collect_garbage<T: Transaction>(tx: &mut T, now: UnixTime) -> MytokenResult<GcReport> {
    let expired: Vec<_> = tx
        .list_nodes(&NodeFilter::All)?
        .into_iter()
        .filter(|n| n.is_expired(now))
        .collect();

    let mut secrets = Vec::new();
    let mut expired_tokens = 0;
    for node in &expired {
        for deleted in tx.delete_node(&node.id, false)? {
            secrets.push(deleted.secret_id);
            expired_tokens += 1;
        }
    }
    let released = release_secrets(tx, secrets)?;
    let expired_proxies = tx.delete_expired_proxies(now)?;

    let report = GcReport {
        expired_tokens,
        released_secrets: released.len(),
        expired_proxies,
    };
    tracing::info!(
        expired_tokens = report.expired_tokens,
        released_secrets = report.released_secrets,
        expired_proxies = report.expired_proxies,
        "garbage collected"
    );
    Ok(report)
}
