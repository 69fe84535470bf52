//! Proxy tokens: opaque random strings standing in for a full bearer.
//!
//! The record id is the hash of the opaque string and the payload is
//! encrypted with the opaque string as password, so the store alone can
//! neither find nor read a payload without the string.
//!
//! - short tokens never expire and are deleted explicitly;
//! - transfer and polling codes expire and are consumed once by [`ProxyTokens::pop`].
//!   A polling code is created before its payload exists and stays pending
//!   until [`ProxyTokens::link_polling_code`] binds one.

use mytoken_core::config::FeaturesConfig;
use mytoken_core::hash::sha512_b64;
use mytoken_core::{MytokenError, MytokenResult, ResponseType, TokenHash, UnixTime};
use mytoken_crypto::{decrypt_with_password, encrypt_with_password, random_string, KdfParams};
use mytoken_store::{ProxyKind, ProxyRecord, Transaction, TransferAttributes};
use secrecy::{ExposeSecret, SecretString};

use crate::custody::crypto_error;

/// Outcome of looking up an opaque string.
pub enum Resolved {
    NotFound,
    /// A record exists but does not decrypt under the presented string.
    Invalid,
    Found {
        payload: SecretString,
        token_id: Option<TokenHash>,
        attributes: Option<TransferAttributes>,
    },
    /// Polling code without a payload yet.
    Pending,
}

impl Resolved {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolved::Found { .. })
    }

    pub fn payload(&self) -> Option<&SecretString> {
        match self {
            Resolved::Found { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolved::NotFound => f.write_str("NotFound"),
            Resolved::Invalid => f.write_str("Invalid"),
            Resolved::Found { token_id, .. } => f
                .debug_struct("Found")
                .field("token_id", &token_id.as_ref().map(TokenHash::short))
                .finish_non_exhaustive(),
            Resolved::Pending => f.write_str("Pending"),
        }
    }
}

/// Non-consuming view of a transfer or polling code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCodeStatus {
    pub found: bool,
    pub expired: bool,
    pub response_type: ResponseType,
    pub max_token_len: Option<usize>,
    pub new_mytoken: bool,
}

/// A presented token after short-token indirection is undone.
pub struct UniversalMytoken {
    pub bearer: SecretString,
    pub original_type: ResponseType,
}

impl std::fmt::Debug for UniversalMytoken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniversalMytoken")
            .field("bearer", &"[REDACTED]")
            .field("original_type", &self.original_type)
            .finish()
    }
}

pub fn proxy_id(opaque: &str) -> String {
    sha512_b64(opaque)
}

#[derive(Debug, Clone)]
pub struct ProxyTokens {
    features: FeaturesConfig,
    params: KdfParams,
}

impl ProxyTokens {
    pub fn new(features: FeaturesConfig, params: KdfParams) -> Self {
        Self { features, params }
    }

    pub fn features(&self) -> &FeaturesConfig {
        &self.features
    }

    fn seal(&self, payload: &SecretString, opaque: &SecretString) -> MytokenResult<String> {
        encrypt_with_password(payload.expose_secret().as_bytes(), opaque, &self.params)
            .map_err(crypto_error)
    }

    fn open(&self, record: ProxyRecord, opaque: &SecretString) -> Resolved {
        if record.ciphertext.is_empty() {
            return Resolved::Pending;
        }
        let plaintext = decrypt_with_password(&record.ciphertext, opaque, &self.params)
            .ok()
            .and_then(|p| String::from_utf8(p).ok());
        match plaintext {
            Some(payload) => Resolved::Found {
                payload: SecretString::from(payload),
                token_id: record.token_id,
                attributes: record.attributes,
            },
            None => Resolved::Invalid,
        }
    }

    /// Bind `bearer` to a new short token.
    pub fn create_short_token<T: Transaction>(
        &self,
        tx: &mut T,
        bearer: &SecretString,
        token_id: &TokenHash,
        now: UnixTime,
    ) -> MytokenResult<SecretString> {
        if !self.features.short_tokens.enabled {
            return Err(MytokenError::validation("short tokens are not enabled"));
        }
        let opaque = SecretString::from(random_string(self.features.short_tokens.len));
        tx.put_proxy(ProxyRecord {
            id: proxy_id(opaque.expose_secret()),
            kind: ProxyKind::ShortToken,
            ciphertext: self.seal(bearer, &opaque)?,
            token_id: Some(token_id.clone()),
            created: now,
            expires_at: None,
            attributes: None,
        })?;
        tracing::debug!(token = token_id.short(), "short token created");
        Ok(opaque)
    }

    /// Bind `bearer` to a new one-time transfer code.
    pub fn create_transfer_code<T: Transaction>(
        &self,
        tx: &mut T,
        bearer: &SecretString,
        token_id: &TokenHash,
        attributes: TransferAttributes,
        now: UnixTime,
    ) -> MytokenResult<SecretString> {
        if !self.features.transfer_codes.enabled {
            return Err(MytokenError::validation("transfer codes are not enabled"));
        }
        let opaque = SecretString::from(random_string(self.features.polling_codes.len));
        tx.put_proxy(ProxyRecord {
            id: proxy_id(opaque.expose_secret()),
            kind: ProxyKind::TransferCode,
            ciphertext: self.seal(bearer, &opaque)?,
            token_id: Some(token_id.clone()),
            created: now,
            expires_at: Some(now.plus_secs(self.features.polling_codes.expires_after)),
            attributes: Some(attributes),
        })?;
        tracing::debug!(token = token_id.short(), "transfer code created");
        Ok(opaque)
    }

    /// Register a polling code whose payload is linked later.
    pub fn create_polling_code<T: Transaction>(
        &self,
        tx: &mut T,
        code: &SecretString,
        response_type: ResponseType,
        max_token_len: Option<usize>,
        now: UnixTime,
    ) -> MytokenResult<()> {
        if !self.features.polling_codes.enabled {
            return Err(MytokenError::validation("polling codes are not enabled"));
        }
        let id = proxy_id(code.expose_secret());
        if tx.get_proxy(&id)?.is_some() {
            return Err(MytokenError::validation("polling code already in use"));
        }
        tx.put_proxy(ProxyRecord {
            id,
            kind: ProxyKind::PollingCode,
            ciphertext: String::new(),
            token_id: None,
            created: now,
            expires_at: Some(now.plus_secs(self.features.polling_codes.expires_after)),
            attributes: Some(TransferAttributes {
                new_mytoken: true,
                response_type,
                max_token_len,
            }),
        })?;
        Ok(())
    }

    /// Bind the issued bearer to a pending polling code.
    pub fn link_polling_code<T: Transaction>(
        &self,
        tx: &mut T,
        code: &SecretString,
        payload: &SecretString,
        token_id: &TokenHash,
        now: UnixTime,
    ) -> MytokenResult<()> {
        let mut record = tx
            .get_proxy(&proxy_id(code.expose_secret()))?
            .filter(|r| r.kind == ProxyKind::PollingCode && !r.is_expired(now))
            .ok_or_else(|| MytokenError::validation("unknown or expired polling code"))?;
        record.ciphertext = self.seal(payload, code)?;
        record.token_id = Some(token_id.clone());
        tx.put_proxy(record)?;
        tracing::debug!(token = token_id.short(), "polling code linked");
        Ok(())
    }

    /// Look up without consuming.
    pub fn resolve<T: Transaction>(
        &self,
        tx: &mut T,
        opaque: &SecretString,
        now: UnixTime,
    ) -> MytokenResult<Resolved> {
        match tx.get_proxy(&proxy_id(opaque.expose_secret()))? {
            None => Ok(Resolved::NotFound),
            Some(r) if r.is_expired(now) => Ok(Resolved::NotFound),
            Some(r) => Ok(self.open(r, opaque)),
        }
    }

    /// Resolve and delete a transfer or polling code. Pending codes are left
    /// in place; expired ones are removed and reported as not found.
    pub fn pop<T: Transaction>(
        &self,
        tx: &mut T,
        code: &SecretString,
        now: UnixTime,
    ) -> MytokenResult<Resolved> {
        let id = proxy_id(code.expose_secret());
        match tx.get_proxy(&id)? {
            None => return Ok(Resolved::NotFound),
            Some(r) if r.kind == ProxyKind::ShortToken => return Ok(Resolved::NotFound),
            Some(r) if r.ciphertext.is_empty() && !r.is_expired(now) => {
                return Ok(Resolved::Pending)
            }
            Some(_) => {}
        }
        let Some(record) = tx.pop_proxy(&id)? else {
            return Ok(Resolved::NotFound);
        };
        if record.is_expired(now) {
            return Ok(Resolved::NotFound);
        }
        Ok(self.open(record, code))
    }

    pub fn transfer_code_status<T: Transaction>(
        &self,
        tx: &mut T,
        code: &SecretString,
        now: UnixTime,
    ) -> MytokenResult<TransferCodeStatus> {
        let record = tx
            .get_proxy(&proxy_id(code.expose_secret()))?
            .filter(|r| r.kind != ProxyKind::ShortToken);
        Ok(match record {
            None => TransferCodeStatus {
                found: false,
                expired: false,
                response_type: ResponseType::Token,
                max_token_len: None,
                new_mytoken: false,
            },
            Some(r) => {
                let attributes = r.attributes.clone().unwrap_or_default();
                TransferCodeStatus {
                    found: true,
                    expired: r.is_expired(now),
                    response_type: attributes.response_type,
                    max_token_len: attributes.max_token_len,
                    new_mytoken: attributes.new_mytoken,
                }
            }
        })
    }

    /// Point an existing short token at the rotated bearer. Returns false
    /// when `opaque` is not a short token.
    pub fn update_short_token<T: Transaction>(
        &self,
        tx: &mut T,
        opaque: &SecretString,
        bearer: &SecretString,
    ) -> MytokenResult<bool> {
        let Some(mut record) = tx
            .get_proxy(&proxy_id(opaque.expose_secret()))?
            .filter(|r| r.kind == ProxyKind::ShortToken)
        else {
            return Ok(false);
        };
        record.ciphertext = self.seal(bearer, opaque)?;
        tx.put_proxy(record)?;
        Ok(true)
    }

    pub fn delete_short_token<T: Transaction>(
        &self,
        tx: &mut T,
        opaque: &SecretString,
    ) -> MytokenResult<bool> {
        Ok(tx.delete_proxy(&proxy_id(opaque.expose_secret()))?)
    }

    /// Accept either a full bearer or a short token standing in for one.
    pub fn universal_parse<T: Transaction>(
        &self,
        tx: &mut T,
        presented: &SecretString,
    ) -> MytokenResult<UniversalMytoken> {
        let s = presented.expose_secret();
        if s.contains('.') {
            return Ok(UniversalMytoken {
                bearer: SecretString::from(s.to_owned()),
                original_type: ResponseType::Token,
            });
        }
        match tx.get_proxy(&proxy_id(s))? {
            Some(r) if r.kind == ProxyKind::ShortToken => match self.open(r, presented) {
                Resolved::Found { payload, .. } => Ok(UniversalMytoken {
                    bearer: payload,
                    original_type: ResponseType::ShortToken,
                }),
                _ => Err(MytokenError::authentication("short token does not decrypt")),
            },
            _ => Err(MytokenError::authentication("unknown short token")),
        }
    }
}
