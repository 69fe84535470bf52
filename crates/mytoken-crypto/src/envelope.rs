//! Password and raw-key envelopes.
//!
//! Both serialize as `-` separated standard base64 parts. A part count other
//! than the expected one is a [`CryptoError::Format`], not a decrypt failure.
//! Password envelopes derive their key with Argon2id.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, NONCE_SIZE, SALT_SIZE};

const SEPARATOR: char = '-';

/// Argon2id cost parameters of password envelopes.
///
/// They are not stored in the envelope, so every envelope written under one
/// set of parameters must be opened with the same set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 19456 = 19 MiB)
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 19456,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

fn password_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> CryptoResult<Zeroizing<[u8; KEY_SIZE]>> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key[..])
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` under a key derived from `password`.
///
/// Output: `b64(salt)-b64(nonce)-b64(ciphertext)`
pub fn encrypt_with_password(
    plaintext: &[u8],
    password: &SecretString,
    params: &KdfParams,
) -> CryptoResult<String> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = password_key(password, &salt, params)?;
    let sealed = seal(&key, plaintext)?;
    Ok(format!("{}{SEPARATOR}{sealed}", STANDARD.encode(salt)))
}

/// Inverse of [`encrypt_with_password`].
pub fn decrypt_with_password(
    envelope: &str,
    password: &SecretString,
    params: &KdfParams,
) -> CryptoResult<Vec<u8>> {
    let parts = split_parts::<3>(envelope)?;
    let salt: [u8; SALT_SIZE] = decode_part(parts[0], "salt")?
        .try_into()
        .map_err(|v: Vec<u8>| CryptoError::Format(format!("salt has {} bytes", v.len())))?;
    let nonce = decode_nonce(parts[1])?;
    let ciphertext = decode_part(parts[2], "ciphertext")?;
    let key = password_key(password, &salt, params)?;
    open(&key, &nonce, &ciphertext)
}

/// Encrypt `plaintext` under a caller-supplied key.
///
/// Output: `b64(nonce)-b64(ciphertext)`
pub fn encrypt_with_key(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> CryptoResult<String> {
    seal(key, plaintext)
}

/// Inverse of [`encrypt_with_key`].
pub fn decrypt_with_key(envelope: &str, key: &[u8; KEY_SIZE]) -> CryptoResult<Vec<u8>> {
    let parts = split_parts::<2>(envelope)?;
    let nonce = decode_nonce(parts[0])?;
    let ciphertext = decode_part(parts[1], "ciphertext")?;
    open(key, &nonce, &ciphertext)
}

fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> CryptoResult<String> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    Ok(format!(
        "{}{SEPARATOR}{}",
        STANDARD.encode(nonce_bytes),
        STANDARD.encode(ciphertext)
    ))
}

fn open(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

// base64's standard alphabet has no '-', so a plain split is unambiguous.
fn split_parts<const N: usize>(envelope: &str) -> CryptoResult<[&str; N]> {
    let parts: Vec<&str> = envelope.split(SEPARATOR).collect();
    parts.try_into().map_err(|parts: Vec<&str>| {
        CryptoError::Format(format!("expected {N} parts, found {}", parts.len()))
    })
}

fn decode_part(part: &str, what: &str) -> CryptoResult<Vec<u8>> {
    STANDARD
        .decode(part)
        .map_err(|e| CryptoError::Format(format!("{what}: {e}")))
}

fn decode_nonce(part: &str) -> CryptoResult<[u8; NONCE_SIZE]> {
    decode_part(part, "nonce")?
        .try_into()
        .map_err(|v: Vec<u8>| CryptoError::Format(format!("nonce has {} bytes", v.len())))
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn key_envelope_roundtrips(payload in proptest::collection::vec(any::<u8>(), 0..2048), key in any::<[u8; KEY_SIZE]>()) {
            let env = encrypt_with_key(&payload, &key).unwrap();
            prop_assert_eq!(decrypt_with_key(&env, &key).unwrap(), payload);
        }

        #[test]
        fn garbage_never_panics(input in ".{0,200}") {
            let _ = decrypt_with_key(&input, &[0u8; KEY_SIZE]);
        }
    }
}
