//! Refresh token custody.
//!
//! Each node owns a data key wrapped under its own bearer string. Nodes that
//! share an upstream refresh token point at one ciphertext record sealed
//! under that data key, released when its last wrapped key goes away.

use mytoken_core::{MytokenError, MytokenResult, TokenHash};
use mytoken_crypto::{
    generate_data_key, open_secret, rewrap_data_key, seal_secret, unwrap_data_key,
    wrap_data_key, CryptoError, DataKey, KdfParams,
};
use mytoken_store::{SecretId, Transaction, WrappedKeyRecord};
use secrecy::SecretString;

pub(crate) fn crypto_error(e: CryptoError) -> MytokenError {
    MytokenError::Other(e.into())
}

/// A node's data key, unwrapped with its bearer string.
pub struct Unlocked {
    key: DataKey,
    secret_id: SecretId,
}

impl Unlocked {
    pub fn secret_id(&self) -> SecretId {
        self.secret_id
    }
}

impl std::fmt::Debug for Unlocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unlocked")
            .field("secret_id", &self.secret_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Custody {
    params: KdfParams,
}

impl Custody {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// Seal a fresh refresh token for a new root node.
    pub fn establish<T: Transaction>(
        &self,
        tx: &mut T,
        node: &TokenHash,
        bearer: &SecretString,
        refresh_token: &SecretString,
    ) -> MytokenResult<SecretId> {
        let key = generate_data_key();
        let ciphertext = seal_secret(refresh_token, &key).map_err(crypto_error)?;
        let secret_id = tx.insert_secret(ciphertext)?;
        let wrapped_key = wrap_data_key(&key, bearer, &self.params).map_err(crypto_error)?;
        tx.put_wrapped_key(WrappedKeyRecord {
            token_id: node.clone(),
            wrapped_key,
            secret_id,
        })?;
        tracing::debug!(token = node.short(), %secret_id, "refresh token sealed");
        Ok(secret_id)
    }

    /// Unwrap `node`'s data key. Any failure is an authentication error.
    pub fn unlock<T: Transaction>(
        &self,
        tx: &mut T,
        node: &TokenHash,
        bearer: &SecretString,
    ) -> MytokenResult<Unlocked> {
        let record = tx
            .get_wrapped_key(node)?
            .ok_or_else(|| MytokenError::authentication("no wrapped key for token"))?;
        let key = unwrap_data_key(&record.wrapped_key, bearer, &self.params).map_err(|e| {
            MytokenError::authentication(format!("data key unwrap failed: {e}"))
        })?;
        Ok(Unlocked {
            key,
            secret_id: record.secret_id,
        })
    }

    /// Give `child` its own wrap of an unlocked data key.
    pub fn share<T: Transaction>(
        &self,
        tx: &mut T,
        unlocked: &Unlocked,
        child: &TokenHash,
        child_bearer: &SecretString,
    ) -> MytokenResult<()> {
        let wrapped_key =
            wrap_data_key(&unlocked.key, child_bearer, &self.params).map_err(crypto_error)?;
        tx.put_wrapped_key(WrappedKeyRecord {
            token_id: child.clone(),
            wrapped_key,
            secret_id: unlocked.secret_id,
        })?;
        Ok(())
    }

    /// Move `node`'s wrap from its old bearer string to the new one.
    pub fn rewrap<T: Transaction>(
        &self,
        tx: &mut T,
        node: &TokenHash,
        old_bearer: &SecretString,
        new_bearer: &SecretString,
    ) -> MytokenResult<()> {
        let mut record = tx
            .get_wrapped_key(node)?
            .ok_or_else(|| MytokenError::authentication("no wrapped key for token"))?;
        record.wrapped_key =
            rewrap_data_key(&record.wrapped_key, old_bearer, new_bearer, &self.params).map_err(
                |e| match e {
                    CryptoError::Decrypt | CryptoError::Format(_) | CryptoError::KeyLength(_) => {
                        MytokenError::authentication(format!("data key unwrap failed: {e}"))
                    }
                    other => crypto_error(other),
                },
            )?;
        tx.put_wrapped_key(record)?;
        Ok(())
    }

    pub fn refresh_token<T: Transaction>(
        &self,
        tx: &mut T,
        unlocked: &Unlocked,
    ) -> MytokenResult<SecretString> {
        let ciphertext = tx.get_secret(unlocked.secret_id)?.ok_or_else(|| {
            MytokenError::Storage(format!("refresh token {} missing", unlocked.secret_id))
        })?;
        open_secret(&ciphertext, &unlocked.key).map_err(crypto_error)
    }

    /// Replace the shared refresh token in place; every node holding the
    /// same data key sees the new one.
    pub fn replace_refresh_token<T: Transaction>(
        &self,
        tx: &mut T,
        unlocked: &Unlocked,
        refresh_token: &SecretString,
    ) -> MytokenResult<()> {
        let ciphertext = seal_secret(refresh_token, &unlocked.key).map_err(crypto_error)?;
        if !tx.update_secret(unlocked.secret_id, ciphertext)? {
            return Err(MytokenError::Storage(format!(
                "refresh token {} missing",
                unlocked.secret_id
            )));
        }
        tracing::debug!(secret_id = %unlocked.secret_id, "shared refresh token replaced");
        Ok(())
    }
}

/// Delete each secret no wrapped key points at any more. Returns the ids
/// actually deleted.
pub fn release_secrets<T: Transaction>(
    tx: &mut T,
    ids: impl IntoIterator<Item = SecretId>,
) -> MytokenResult<Vec<SecretId>> {
    let mut ids: Vec<SecretId> = ids.into_iter().collect();
    ids.sort();
    ids.dedup();
    let mut released = Vec::new();
    for id in ids {
        if tx.count_secret_references(id)? == 0 && tx.delete_secret(id)? {
            released.push(id);
        }
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mytoken_store::{MemoryStore, Store};
    use secrecy::ExposeSecret;

    fn custody() -> Custody {
        Custody::new(KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        })
    }

    fn hash(s: &str) -> TokenHash {
        TokenHash::from_stored(s)
    }

    #[test]
    fn test_establish_and_unlock() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let c = custody();
        let bearer = SecretString::from("bearer-a");
        let sid = c
            .establish(&mut tx, &hash("a"), &bearer, &SecretString::from("rt-1"))
            .unwrap();

        let unlocked = c.unlock(&mut tx, &hash("a"), &bearer).unwrap();
        assert_eq!(unlocked.secret_id(), sid);
        assert_eq!(
            c.refresh_token(&mut tx, &unlocked).unwrap().expose_secret(),
            "rt-1"
        );
    }

    #[test]
    fn test_wrong_bearer_is_authentication_error() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let c = custody();
        c.establish(
            &mut tx,
            &hash("a"),
            &SecretString::from("bearer-a"),
            &SecretString::from("rt"),
        )
        .unwrap();
        let err = c
            .unlock(&mut tx, &hash("a"), &SecretString::from("bearer-b"))
            .unwrap_err();
        assert!(err.is_authentication());
        let err = c
            .unlock(&mut tx, &hash("missing"), &SecretString::from("bearer-a"))
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_shared_secret_and_replacement() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let c = custody();
        let parent = SecretString::from("bearer-parent");
        let child = SecretString::from("bearer-child");
        c.establish(&mut tx, &hash("p"), &parent, &SecretString::from("rt-1"))
            .unwrap();
        let unlocked = c.unlock(&mut tx, &hash("p"), &parent).unwrap();
        c.share(&mut tx, &unlocked, &hash("c"), &child).unwrap();
        assert_eq!(tx.count_secret_references(unlocked.secret_id()).unwrap(), 2);

        let from_child = c.unlock(&mut tx, &hash("c"), &child).unwrap();
        c.replace_refresh_token(&mut tx, &from_child, &SecretString::from("rt-2"))
            .unwrap();
        let rt = c.refresh_token(&mut tx, &unlocked).unwrap();
        assert_eq!(rt.expose_secret(), "rt-2");
    }

    #[test]
    fn test_rewrap_moves_to_new_bearer() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let c = custody();
        let v1 = SecretString::from("bearer-v1");
        let v2 = SecretString::from("bearer-v2");
        c.establish(&mut tx, &hash("a"), &v1, &SecretString::from("rt"))
            .unwrap();
        c.rewrap(&mut tx, &hash("a"), &v1, &v2).unwrap();

        assert!(c.unlock(&mut tx, &hash("a"), &v1).is_err());
        assert!(c.unlock(&mut tx, &hash("a"), &v2).is_ok());
        assert!(c.rewrap(&mut tx, &hash("a"), &v1, &v2).unwrap_err().is_authentication());
    }

    #[test]
    fn test_release_only_unreferenced() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let c = custody();
        let bearer = SecretString::from("bearer");
        let kept = c
            .establish(&mut tx, &hash("a"), &bearer, &SecretString::from("rt-a"))
            .unwrap();
        let orphan = tx.insert_secret("ciphertext".into()).unwrap();

        let released = release_secrets(&mut tx, [kept, orphan, orphan]).unwrap();
        assert_eq!(released, vec![orphan]);
        assert!(tx.get_secret(kept).unwrap().is_some());
    }
}
