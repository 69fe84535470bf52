//! mytoken-crypto: envelope encryption for refresh token custody
//!
//! Two primitives share one AEAD (XChaCha20-Poly1305, random 192-bit nonce):
//! a password envelope that derives its key with Argon2id, and a raw-key
//! envelope for callers that already hold a 256-bit key.
//!
//! Custody chain:
//! ```text
//! Bearer string of a node (password)
//!   └── Argon2id(bearer, random salt) ──wraps──► Data Key (256-bit random)
//!                                                   └── raw-key envelope ──► refresh token ciphertext
//!                                                        (one record, shared by every node holding this data key)
//! ```
//!
//! Text formats (standard base64, `-` separated):
//! - password envelope: `salt-nonce-ciphertext`
//! - raw-key envelope: `nonce-ciphertext`

pub mod envelope;
pub mod error;
pub mod keys;
pub mod random;

pub use envelope::{
    decrypt_with_key, decrypt_with_password, encrypt_with_key, encrypt_with_password, KdfParams,
};
pub use error::{CryptoError, CryptoResult};
pub use keys::{
    derive_subkey, generate_data_key, open_secret, rewrap_data_key, seal_secret,
    unwrap_data_key, wrap_data_key, DataKey,
};
pub use random::random_string;

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the Argon2id salt stored in password envelopes
pub const SALT_SIZE: usize = 16;
