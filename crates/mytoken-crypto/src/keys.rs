//! Data keys: generation, wrapping under a bearer string, and sealing the
//! shared refresh token.

use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::envelope::{
    decrypt_with_key, decrypt_with_password, encrypt_with_key, encrypt_with_password, KdfParams,
};
use crate::error::{CryptoError, CryptoResult};
use crate::KEY_SIZE;

/// A 256-bit key protecting one refresh token ciphertext. Zeroized on drop.
#[derive(Clone)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit data key.
pub fn generate_data_key() -> DataKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    DataKey::from_bytes(bytes)
}

/// Wrap a data key under a bearer string (password envelope).
pub fn wrap_data_key(
    key: &DataKey,
    bearer: &SecretString,
    params: &KdfParams,
) -> CryptoResult<String> {
    encrypt_with_password(key.as_bytes(), bearer, params)
}

/// Unwrap a data key. Only the exact bearer string used at wrap time works.
pub fn unwrap_data_key(
    wrapped: &str,
    bearer: &SecretString,
    params: &KdfParams,
) -> CryptoResult<DataKey> {
    let mut plaintext = decrypt_with_password(wrapped, bearer, params)?;
    let result = <[u8; KEY_SIZE]>::try_from(plaintext.as_slice())
        .map(DataKey::from_bytes)
        .map_err(|_| CryptoError::KeyLength(plaintext.len()));
    plaintext.zeroize();
    result
}

/// Move a wrapped data key from one bearer string to another.
pub fn rewrap_data_key(
    wrapped: &str,
    old_bearer: &SecretString,
    new_bearer: &SecretString,
    params: &KdfParams,
) -> CryptoResult<String> {
    let key = unwrap_data_key(wrapped, old_bearer, params)?;
    wrap_data_key(&key, new_bearer, params)
}

/// Encrypt a secret (the refresh token) under a data key.
pub fn seal_secret(secret: &SecretString, key: &DataKey) -> CryptoResult<String> {
    encrypt_with_key(secret.expose_secret().as_bytes(), key.as_bytes())
}

/// Inverse of [`seal_secret`].
pub fn open_secret(ciphertext: &str, key: &DataKey) -> CryptoResult<SecretString> {
    let plaintext = decrypt_with_key(ciphertext, key.as_bytes())?;
    let s = String::from_utf8(plaintext).map_err(|e| {
        let mut bytes = e.into_bytes();
        bytes.zeroize();
        CryptoError::Format("secret is not UTF-8".into())
    })?;
    Ok(SecretString::from(s))
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub fn derive_subkey(ikm: &[u8], info: &[u8]) -> CryptoResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
