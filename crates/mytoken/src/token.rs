//! Bearer representation: a compact JWS over [`MytokenClaims`], signed with
//! Ed25519.
//!
//! `b64url(header).b64url(claims).b64url(signature)` with header
//! `{"alg":"EdDSA","typ":"MT+JWT"}`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use mytoken_core::{MytokenError, MytokenResult, TokenHash, TokenId, UnixTime};
use mytoken_crypto::{derive_subkey, KEY_SIZE};
use mytoken_policy::{Capabilities, Restrictions, RotationConfig};
use mytoken_store::{NodeRecord, SecretId};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroize;

pub const TOKEN_TYPE: &str = "mytoken";
pub const TOKEN_VERSION: &str = "0.7";

const JWS_ALG: &str = "EdDSA";
const JWS_TYP: &str = "MT+JWT";
const SIGNING_KEY_INFO: &[u8] = b"mytoken-signing-key-v1";

#[derive(Debug, Serialize, Deserialize)]
struct JwsHeader {
    alg: String,
    typ: String,
}

/// The signed wire form of a mytoken. Carries the raw [`TokenId`]; nothing
/// here is ever written to storage as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MytokenClaims {
    pub ver: String,
    pub token_type: String,
    pub iss: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "UnixTime::is_unset")]
    pub exp: UnixTime,
    pub nbf: UnixTime,
    pub iat: UnixTime,
    pub jti: TokenId,
    pub seq_no: u64,
    pub aud: String,
    pub oidc_sub: String,
    pub oidc_iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "no_restrictions")]
    pub restrictions: Restrictions,
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotationConfig>,
}

fn no_restrictions(r: &Restrictions) -> bool {
    r.is_empty()
}

/// Subject claim binding a mytoken to its upstream OIDC identity.
pub fn mytoken_subject(oidc_sub: &str, oidc_iss: &str) -> String {
    format!("{oidc_sub}@{oidc_iss}")
}

impl MytokenClaims {
    pub fn id(&self) -> &TokenHash {
        self.jti.hash()
    }

    pub fn rotation(&self) -> RotationConfig {
        self.rotation.unwrap_or_default()
    }

    /// Seconds until expiry, 0 for tokens that never expire.
    pub fn expires_in(&self, now: UnixTime) -> u64 {
        if self.exp.is_unset() {
            return 0;
        }
        now.secs_until(self.exp)
    }

    /// The next generation of this token: same identity, bumped sequence
    /// number, fresh timestamps.
    pub fn rotated(&self, now: UnixTime) -> MytokenClaims {
        let mut next = self.clone();
        next.seq_no += 1;
        next.iat = now;
        next.nbf = now;
        if let Some(lifetime) = self.rotation().bounded_lifetime() {
            next.exp = now.plus_secs(lifetime);
        }
        next
    }

    /// Storage row for this token. Only the id hash is kept.
    pub fn to_record(
        &self,
        parent: Option<&TokenHash>,
        root: &TokenHash,
        secret_id: SecretId,
        ip_created: Option<String>,
    ) -> MytokenResult<NodeRecord> {
        let restrictions = if self.restrictions.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&self.restrictions).map_err(|e| MytokenError::Other(e.into()))?)
        };
        let rotation = self
            .rotation
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| MytokenError::Other(e.into()))?;
        Ok(NodeRecord {
            id: self.id().clone(),
            seq_no: self.seq_no,
            parent_id: parent.cloned(),
            root_id: root.clone(),
            secret_id,
            oidc_subject: self.oidc_sub.clone(),
            oidc_issuer: self.oidc_iss.clone(),
            name: self.name.clone(),
            created: self.iat,
            last_rotated: self.iat,
            expires_at: self.exp,
            ip_created,
            restrictions,
            capabilities: self.capabilities.to_strings(),
            rotation,
        })
    }
}

/// A token together with its signed bearer string.
pub struct IssuedMytoken {
    pub claims: MytokenClaims,
    bearer: SecretString,
}

impl IssuedMytoken {
    pub(crate) fn new(claims: MytokenClaims, bearer: SecretString) -> Self {
        Self { claims, bearer }
    }

    pub fn id(&self) -> &TokenHash {
        self.claims.id()
    }

    pub fn bearer(&self) -> &SecretString {
        &self.bearer
    }

    pub fn into_bearer(self) -> SecretString {
        self.bearer
    }
}

impl std::fmt::Debug for IssuedMytoken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedMytoken")
            .field("id", &self.id().short())
            .field("seq_no", &self.claims.seq_no)
            .field("bearer", &"[REDACTED]")
            .finish()
    }
}

/// Ed25519 key that signs and verifies bearer strings.
pub struct TokenSigner {
    key: SigningKey,
}

impl TokenSigner {
    pub fn from_seed(mut seed: [u8; KEY_SIZE]) -> Self {
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { key }
    }

    /// Derive the signing seed from an arbitrary-length secret.
    pub fn from_secret(secret: &[u8]) -> MytokenResult<Self> {
        if secret.is_empty() {
            return Err(MytokenError::Config("signing secret is empty".into()));
        }
        let seed = derive_subkey(secret, SIGNING_KEY_INFO).map_err(|e| MytokenError::Other(e.into()))?;
        Ok(Self::from_seed(seed))
    }

    /// Load from a file holding either a raw 32-byte seed or a secret to
    /// derive one from.
    pub fn load(path: &Path) -> MytokenResult<Self> {
        let mut bytes = std::fs::read(path)?;
        let signer = match <[u8; KEY_SIZE]>::try_from(bytes.as_slice()) {
            Ok(seed) => Ok(Self::from_seed(seed)),
            Err(_) => {
                let trimmed = bytes.trim_ascii();
                Self::from_secret(trimmed)
            }
        };
        bytes.zeroize();
        tracing::debug!(path = %path.display(), "signing key loaded");
        signer
    }

    /// A random key. Tokens signed with it do not survive a restart.
    pub fn ephemeral() -> Self {
        let mut seed = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn sign(&self, claims: &MytokenClaims) -> MytokenResult<SecretString> {
        let header = JwsHeader {
            alg: JWS_ALG.into(),
            typ: JWS_TYP.into(),
        };
        let header = serde_json::to_vec(&header).map_err(|e| MytokenError::Other(e.into()))?;
        let payload = serde_json::to_vec(claims).map_err(|e| MytokenError::Other(e.into()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = self.key.sign(signing_input.as_bytes());
        Ok(SecretString::from(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )))
    }

    /// Check the signature and decode the claims. Does not look at time,
    /// issuer or revocation.
    pub fn verify(&self, bearer: &SecretString) -> MytokenResult<MytokenClaims> {
        let token = bearer.expose_secret();
        let malformed = || MytokenError::authentication("malformed bearer");
        let (signing_input, signature) = token.rsplit_once('.').ok_or_else(malformed)?;
        let (header, payload) = signing_input.split_once('.').ok_or_else(malformed)?;
        if payload.contains('.') {
            return Err(malformed());
        }

        let header: JwsHeader = decode_json(header)?;
        if header.alg != JWS_ALG || header.typ != JWS_TYP {
            return Err(MytokenError::authentication(format!(
                "unexpected header alg={} typ={}",
                header.alg, header.typ
            )));
        }
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .ok()
            .and_then(|s| Signature::from_slice(&s).ok())
            .ok_or_else(|| MytokenError::authentication("malformed signature"))?;
        self.key
            .verifying_key()
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| MytokenError::authentication("bad signature"))?;
        decode_json(payload)
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("verifying_key", &URL_SAFE_NO_PAD.encode(self.verifying_key().as_bytes()))
            .finish()
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(part: &str) -> MytokenResult<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| MytokenError::authentication("bearer part is not base64url"))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| MytokenError::authentication(format!("bearer part is not valid JSON: {e}")))
}
