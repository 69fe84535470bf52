use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("malformed envelope: {0}")]
    Format(String),

    /// Wrong key, wrong password, or tampered ciphertext. Deliberately carries no detail.
    #[error("decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("invalid key length: {0} bytes")]
    KeyLength(usize),
}
