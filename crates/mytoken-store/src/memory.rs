//! In-process store. Transactions hold the state lock for their whole life,
//! work on a private copy, and publish it on commit.

use mytoken_core::{Purpose, TokenHash, UnixTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{StoreError, StoreResult};
use crate::records::{
    usage_map_key, EventRecord, NodeFilter, NodeRecord, ProxyRecord, SecretId, UsageKey,
    UsageRecord, WrappedKeyRecord,
};
use crate::{Store, Transaction};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreState {
    nodes: BTreeMap<TokenHash, NodeRecord>,
    wrapped_keys: BTreeMap<TokenHash, WrappedKeyRecord>,
    secrets: BTreeMap<SecretId, String>,
    next_secret_id: u64,
    proxies: BTreeMap<String, ProxyRecord>,
    usages: BTreeMap<String, UsageRecord>,
    events: Vec<EventRecord>,
}

/// Record counts, for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub nodes: usize,
    pub wrapped_keys: usize,
    pub secrets: usize,
    pub proxies: usize,
    pub usage_counters: usize,
    pub events: usize,
}

/// In-memory store with an optional JSON snapshot on disk.
///
/// Transactions are serialized by a mutex. Do not begin a second
/// transaction on the same thread while one is open.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    /// Purely in-memory store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot: None,
        }
    }

    /// Load or create a store persisted at `path`.
    /// If the file doesn't exist, starts empty.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            StoreState::default()
        };
        tracing::debug!(path = %path.display(), nodes = state.nodes.len(), "store snapshot opened");
        Ok(Self {
            state: Mutex::new(state),
            snapshot: Some(path.to_path_buf()),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let state = self.lock()?;
        Ok(StoreStats {
            nodes: state.nodes.len(),
            wrapped_keys: state.wrapped_keys.len(),
            secrets: state.secrets.len(),
            proxies: state.proxies.len(),
            usage_counters: state.usages.len(),
            events: state.events.len(),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Tx<'a> = MemoryTx<'a>;

    fn begin(&self) -> StoreResult<MemoryTx<'_>> {
        let guard = self.lock()?;
        let working = guard.clone();
        Ok(MemoryTx {
            guard,
            working,
            snapshot: self.snapshot.as_deref(),
            finished: false,
        })
    }
}

/// Atomic write: write to temp file, then rename.
fn write_snapshot(path: &Path, state: &StoreState) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub struct MemoryTx<'a> {
    guard: MutexGuard<'a, StoreState>,
    working: StoreState,
    snapshot: Option<&'a Path>,
    finished: bool,
}

impl MemoryTx<'_> {
    fn descendants(&self, id: &TokenHash) -> BTreeSet<TokenHash> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![id.clone()];
        while let Some(current) = frontier.pop() {
            for node in self.working.nodes.values() {
                let is_child = node.parent_id.as_ref() == Some(&current) && node.id != current;
                if is_child && found.insert(node.id.clone()) {
                    frontier.push(node.id.clone());
                }
            }
        }
        found
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("transaction dropped without commit, rolled back");
        }
    }
}

impl Transaction for MemoryTx<'_> {
    fn commit(mut self) -> StoreResult<()> {
        if let Some(path) = self.snapshot {
            write_snapshot(path, &self.working)?;
        }
        *self.guard = std::mem::take(&mut self.working);
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self) -> StoreResult<()> {
        self.finished = true;
        Ok(())
    }

    fn insert_node(&mut self, node: NodeRecord) -> StoreResult<()> {
        if self.working.nodes.contains_key(&node.id) {
            return Err(StoreError::Conflict(format!("node {} exists", node.id.short())));
        }
        self.working.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    fn get_node(&mut self, id: &TokenHash) -> StoreResult<Option<NodeRecord>> {
        Ok(self.working.nodes.get(id).cloned())
    }

    fn update_rotation(
        &mut self,
        id: &TokenHash,
        seq_no: u64,
        rotated_at: UnixTime,
        expires_at: UnixTime,
    ) -> StoreResult<bool> {
        match self.working.nodes.get_mut(id) {
            Some(node) => {
                node.seq_no = seq_no;
                node.last_rotated = rotated_at;
                node.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_node(&mut self, id: &TokenHash, cascade: bool) -> StoreResult<Vec<NodeRecord>> {
        if !self.working.nodes.contains_key(id) {
            return Ok(Vec::new());
        }
        let mut targets = if cascade {
            self.descendants(id)
        } else {
            BTreeSet::new()
        };
        targets.insert(id.clone());

        let mut deleted = Vec::with_capacity(targets.len());
        for target in &targets {
            if let Some(node) = self.working.nodes.remove(target) {
                deleted.push(node);
            }
            self.working.wrapped_keys.remove(target);
        }
        self.working
            .usages
            .retain(|_, usage| !targets.contains(&usage.token_id));
        self.working.proxies.retain(|_, proxy| {
            proxy
                .token_id
                .as_ref()
                .map_or(true, |token| !targets.contains(token))
        });
        self.working
            .events
            .retain(|event| !targets.contains(&event.token_id));
        Ok(deleted)
    }

    fn list_nodes(&mut self, filter: &NodeFilter) -> StoreResult<Vec<NodeRecord>> {
        let mut nodes: Vec<NodeRecord> = self
            .working
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(nodes)
    }

    fn usage_count(
        &mut self,
        token_id: &TokenHash,
        restriction_hash: &str,
        purpose: Purpose,
    ) -> StoreResult<Option<u64>> {
        let key = usage_map_key(token_id, restriction_hash);
        Ok(self.working.usages.get(&key).map(|u| match purpose {
            Purpose::AccessToken => u.usages_at,
            Purpose::Other => u.usages_other,
        }))
    }

    fn increment_usage(&mut self, key: &UsageKey, purpose: Purpose) -> StoreResult<u64> {
        let record = self
            .working
            .usages
            .entry(key.map_key())
            .or_insert_with(|| UsageRecord {
                token_id: key.token_id.clone(),
                restriction_hash: key.restriction_hash.clone(),
                restriction: key.restriction.clone(),
                usages_at: 0,
                usages_other: 0,
            });
        let counter = match purpose {
            Purpose::AccessToken => &mut record.usages_at,
            Purpose::Other => &mut record.usages_other,
        };
        *counter += 1;
        Ok(*counter)
    }

    fn increment_usage_below(
        &mut self,
        key: &UsageKey,
        purpose: Purpose,
        limit: u64,
    ) -> StoreResult<bool> {
        let current = self
            .usage_count(&key.token_id, &key.restriction_hash, purpose)?
            .unwrap_or(0);
        if current >= limit {
            return Ok(false);
        }
        self.increment_usage(key, purpose)?;
        Ok(true)
    }

    fn insert_secret(&mut self, ciphertext: String) -> StoreResult<SecretId> {
        self.working.next_secret_id += 1;
        let id = SecretId(self.working.next_secret_id);
        self.working.secrets.insert(id, ciphertext);
        Ok(id)
    }

    fn get_secret(&mut self, id: SecretId) -> StoreResult<Option<String>> {
        Ok(self.working.secrets.get(&id).cloned())
    }

    fn update_secret(&mut self, id: SecretId, ciphertext: String) -> StoreResult<bool> {
        match self.working.secrets.get_mut(&id) {
            Some(slot) => {
                *slot = ciphertext;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_secret(&mut self, id: SecretId) -> StoreResult<bool> {
        Ok(self.working.secrets.remove(&id).is_some())
    }

    fn count_secret_references(&mut self, id: SecretId) -> StoreResult<usize> {
        Ok(self
            .working
            .wrapped_keys
            .values()
            .filter(|w| w.secret_id == id)
            .count())
    }

    fn put_wrapped_key(&mut self, record: WrappedKeyRecord) -> StoreResult<()> {
        self.working
            .wrapped_keys
            .insert(record.token_id.clone(), record);
        Ok(())
    }

    fn get_wrapped_key(&mut self, token_id: &TokenHash) -> StoreResult<Option<WrappedKeyRecord>> {
        Ok(self.working.wrapped_keys.get(token_id).cloned())
    }

    fn delete_wrapped_key(&mut self, token_id: &TokenHash) -> StoreResult<bool> {
        Ok(self.working.wrapped_keys.remove(token_id).is_some())
    }

    fn put_proxy(&mut self, record: ProxyRecord) -> StoreResult<()> {
        self.working.proxies.insert(record.id.clone(), record);
        Ok(())
    }

    fn get_proxy(&mut self, id: &str) -> StoreResult<Option<ProxyRecord>> {
        Ok(self.working.proxies.get(id).cloned())
    }

    fn delete_proxy(&mut self, id: &str) -> StoreResult<bool> {
        Ok(self.working.proxies.remove(id).is_some())
    }

    fn pop_proxy(&mut self, id: &str) -> StoreResult<Option<ProxyRecord>> {
        Ok(self.working.proxies.remove(id))
    }

    fn delete_expired_proxies(&mut self, now: UnixTime) -> StoreResult<usize> {
        let before = self.working.proxies.len();
        self.working.proxies.retain(|_, p| !p.is_expired(now));
        Ok(before - self.working.proxies.len())
    }

    fn append_event(&mut self, event: EventRecord) -> StoreResult<()> {
        self.working.events.push(event);
        Ok(())
    }

    fn list_events(&mut self, token_id: &TokenHash) -> StoreResult<Vec<EventRecord>> {
        Ok(self
            .working
            .events
            .iter()
            .filter(|e| e.token_id == *token_id)
            .cloned()
            .collect())
    }
}
