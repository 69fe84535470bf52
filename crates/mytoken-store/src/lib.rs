//! mytoken-store: the persistence contract the credential core runs against.
//!
//! Every core operation executes inside one [`Transaction`] handed in by the
//! caller. A transaction either commits as a whole or leaves the store
//! untouched; dropping it without [`Transaction::commit`] rolls back.
//!
//! [`MemoryStore`] is the in-process reference implementation. It keeps all
//! state in memory and can persist a JSON snapshot, written atomically via
//! temp+rename on every commit.

pub mod error;
pub mod memory;
pub mod records;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, MemoryTx, StoreStats};
pub use records::{
    EventRecord, NodeFilter, NodeRecord, ProxyKind, ProxyRecord, SecretId, TokenEvent,
    TransferAttributes, UsageKey, UsageRecord, WrappedKeyRecord,
};

use mytoken_core::{Purpose, TokenHash, UnixTime};

/// A storage backend able to open transactions.
pub trait Store {
    type Tx<'a>: Transaction
    where
        Self: 'a;

    fn begin(&self) -> StoreResult<Self::Tx<'_>>;
}

/// One unit of work. All reads observe the transaction's own writes.
pub trait Transaction {
    fn commit(self) -> StoreResult<()>
    where
        Self: Sized;

    fn rollback(self) -> StoreResult<()>
    where
        Self: Sized;

    // ── nodes ──────────────────────────────────────────────────────────────

    /// Fails with [`StoreError::Conflict`] if the id is taken.
    fn insert_node(&mut self, node: NodeRecord) -> StoreResult<()>;

    fn get_node(&mut self, id: &TokenHash) -> StoreResult<Option<NodeRecord>>;

    /// Bump a node to a new sequence number. Returns false if the node is gone.
    fn update_rotation(
        &mut self,
        id: &TokenHash,
        seq_no: u64,
        rotated_at: UnixTime,
        expires_at: UnixTime,
    ) -> StoreResult<bool>;

    /// Delete a node (and with `cascade`, all its descendants) together with
    /// their wrapped keys, usage counters, proxy records and events. Shared secrets
    /// are left for the caller to release. Returns the deleted nodes.
    fn delete_node(&mut self, id: &TokenHash, cascade: bool) -> StoreResult<Vec<NodeRecord>>;

    fn list_nodes(&mut self, filter: &NodeFilter) -> StoreResult<Vec<NodeRecord>>;

    // ── usage counters ────────────────────────────────────────────────────

    /// `None` when no use was ever recorded.
    fn usage_count(
        &mut self,
        token_id: &TokenHash,
        restriction_hash: &str,
        purpose: Purpose,
    ) -> StoreResult<Option<u64>>;

    /// Add one use, returning the new count.
    fn increment_usage(&mut self, key: &UsageKey, purpose: Purpose) -> StoreResult<u64>;

    /// Add one use only if the current count is below `limit`. Check and
    /// increment happen as one operation.
    fn increment_usage_below(
        &mut self,
        key: &UsageKey,
        purpose: Purpose,
        limit: u64,
    ) -> StoreResult<bool>;

    // ── shared refresh token ciphertexts ──────────────────────────────────

    fn insert_secret(&mut self, ciphertext: String) -> StoreResult<SecretId>;

    fn get_secret(&mut self, id: SecretId) -> StoreResult<Option<String>>;

    fn update_secret(&mut self, id: SecretId, ciphertext: String) -> StoreResult<bool>;

    fn delete_secret(&mut self, id: SecretId) -> StoreResult<bool>;

    /// Number of wrapped-key records pointing at `id`.
    fn count_secret_references(&mut self, id: SecretId) -> StoreResult<usize>;

    // ── wrapped data keys ─────────────────────────────────────────────────

    /// Insert or replace the wrapped key of `record.token_id`.
    fn put_wrapped_key(&mut self, record: WrappedKeyRecord) -> StoreResult<()>;

    fn get_wrapped_key(&mut self, token_id: &TokenHash) -> StoreResult<Option<WrappedKeyRecord>>;

    fn delete_wrapped_key(&mut self, token_id: &TokenHash) -> StoreResult<bool>;

    // ── proxy tokens ──────────────────────────────────────────────────────

    /// Insert or replace.
    fn put_proxy(&mut self, record: ProxyRecord) -> StoreResult<()>;

    fn get_proxy(&mut self, id: &str) -> StoreResult<Option<ProxyRecord>>;

    fn delete_proxy(&mut self, id: &str) -> StoreResult<bool>;

    /// Atomic get-and-delete.
    fn pop_proxy(&mut self, id: &str) -> StoreResult<Option<ProxyRecord>>;

    /// Remove every proxy record whose expiry has passed.
    fn delete_expired_proxies(&mut self, now: UnixTime) -> StoreResult<usize>;

    // ── event history ─────────────────────────────────────────────────────

    fn append_event(&mut self, event: EventRecord) -> StoreResult<()>;

    /// Events of one token, oldest first.
    fn list_events(&mut self, token_id: &TokenHash) -> StoreResult<Vec<EventRecord>>;
}

/// Run `f` in a fresh transaction: commit on `Ok`, roll back on `Err`.
pub fn transact<'s, S, T, E, F>(store: &'s S, f: F) -> Result<T, E>
where
    S: Store,
    E: From<StoreError>,
    F: FnOnce(&mut S::Tx<'s>) -> Result<T, E>,
{
    transact_keeping(store, |_| false, f)
}

/// Like [`transact`], but an `Err` for which `keep` returns true is
/// committed before it is returned. Used for failures whose writes must
/// outlive the failed request.
pub fn transact_keeping<'s, S, T, E, K, F>(store: &'s S, keep: K, f: F) -> Result<T, E>
where
    S: Store,
    E: From<StoreError>,
    K: FnOnce(&E) -> bool,
    F: FnOnce(&mut S::Tx<'s>) -> Result<T, E>,
{
    let mut tx = store.begin()?;
    match f(&mut tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) if keep(&e) => {
            tx.commit()?;
            Err(e)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback() {
                tracing::warn!("rollback failed: {rb}");
            }
            Err(e)
        }
    }
}
