//! Token lifecycle: mint, derive, rotate, revoke and authenticate.
//!
//! Every operation runs inside a caller-supplied [`Transaction`]. Nothing
//! here commits; an `Err` return means the caller rolls back, except for
//! [`MytokenError::LineageRevoked`], which [`transact`] commits.

use mytoken_core::config::{CryptoConfig, MytokenConfig};
use mytoken_core::{MytokenError, MytokenResult, Purpose, ResponseType, TokenHash, TokenId, UnixTime};
use mytoken_crypto::KdfParams;
use mytoken_policy::{
    tighten, Capabilities, Capability, GeoIpLookup, HostResolver, NoGeoIp, NoResolver,
    Restriction, RestrictionVerifier, Restrictions, RotationConfig, Tightened, Verdict,
};
use mytoken_store::{
    transact_keeping, NodeRecord, Store, TokenEvent, Transaction, TransferAttributes,
};
use secrecy::{ExposeSecret, SecretString};

use crate::context::RequestContext;
use crate::custody::Custody;
use crate::history::record_event;
use crate::oidc::OidcProvider;
use crate::proxy::{ProxyTokens, Resolved};
use crate::revocation::{is_revoked, revocation_status, revoke_lineage, RevocationStatus, Revoked};
use crate::token::{mytoken_subject, IssuedMytoken, MytokenClaims, TokenSigner, TOKEN_TYPE, TOKEN_VERSION};
use crate::tree::{subtree, token_tree, TokenTree};

/// Run a lifecycle operation in a fresh transaction of `store`. Commits on
/// `Ok` and on errors that must keep their writes, such as a lineage
/// revoked while authenticating a stale bearer; rolls back otherwise.
pub fn transact<'s, S, T, F>(store: &'s S, f: F) -> MytokenResult<T>
where
    S: Store,
    F: FnOnce(&mut S::Tx<'s>) -> MytokenResult<T>,
{
    transact_keeping(store, MytokenError::keeps_writes, f)
}

pub fn kdf_params(crypto: &CryptoConfig) -> KdfParams {
    KdfParams {
        mem_cost_kib: crypto.argon2_mem_cost_kib,
        time_cost: crypto.argon2_time_cost,
        parallelism: crypto.argon2_parallelism,
    }
}

/// Request for a new root mytoken, backed by a fresh upstream refresh token.
#[derive(Debug)]
pub struct MintRequest {
    pub oidc_subject: String,
    pub oidc_issuer: String,
    pub refresh_token: SecretString,
    /// Scopes the provider granted with the refresh token; empty if unknown.
    pub granted_scopes: Vec<String>,
    /// Audiences of the provider's access token; empty if unknown.
    pub granted_audiences: Vec<String>,
    pub restrictions: Restrictions,
    /// `None` grants the configured default capabilities.
    pub capabilities: Option<Capabilities>,
    pub rotation: Option<RotationConfig>,
    pub name: Option<String>,
}

#[derive(Debug, Default)]
pub struct DeriveRequest {
    pub restrictions: Restrictions,
    /// `None` inherits the parent's capabilities.
    pub capabilities: Option<Capabilities>,
    pub rotation: Option<RotationConfig>,
    pub name: Option<String>,
    /// Reject instead of silently narrowing a request the parent cannot cover.
    pub fail_if_not_tighter: bool,
}

#[derive(Debug)]
pub struct Derived {
    pub token: IssuedMytoken,
    /// The parent's next generation, when deriving rotated it.
    pub rotated_parent: Option<IssuedMytoken>,
}

/// A bearer that passed [`MytokenService::authenticate`].
#[derive(Debug)]
pub struct Authenticated {
    pub token: IssuedMytoken,
    pub record: NodeRecord,
    /// How the caller presented it: a full bearer or a short token.
    pub presented_as: ResponseType,
    /// An older generation accepted within its rotation lifetime.
    pub superseded: bool,
}

impl Authenticated {
    /// Operations that unlock the refresh token need the latest generation;
    /// a superseded bearer no longer opens its wrapped key.
    pub(crate) fn require_current(&self) -> MytokenResult<()> {
        if self.superseded {
            return Err(MytokenError::authentication(
                "superseded token generation, present the rotated token",
            ));
        }
        Ok(())
    }
}

/// A freshly issued token in the shape the requester asked for.
pub struct MytokenResponse {
    pub mytoken: SecretString,
    pub response_type: ResponseType,
    pub expires_in: u64,
    pub mom_id: TokenHash,
    pub capabilities: Capabilities,
    pub restrictions: Restrictions,
    pub rotation: Option<RotationConfig>,
}

impl std::fmt::Debug for MytokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MytokenResponse")
            .field("mytoken", &"[REDACTED]")
            .field("response_type", &self.response_type)
            .field("expires_in", &self.expires_in)
            .field("mom_id", &self.mom_id.short())
            .finish_non_exhaustive()
    }
}

/// Result of redeeming a transfer or polling code.
pub enum Exchanged {
    /// The polling code has no token linked yet.
    Pending,
    Token {
        mytoken: SecretString,
        response_type: ResponseType,
        token_id: Option<TokenHash>,
    },
}

pub struct MytokenService {
    config: MytokenConfig,
    signer: TokenSigner,
    custody: Custody,
    proxies: ProxyTokens,
    resolver: Box<dyn HostResolver + Send + Sync>,
    geoip: Box<dyn GeoIpLookup + Send + Sync>,
}

impl MytokenService {
    pub fn new(config: MytokenConfig, signer: TokenSigner) -> Self {
        let params = kdf_params(&config.crypto);
        Self {
            custody: Custody::new(params.clone()),
            proxies: ProxyTokens::new(config.features.clone(), params),
            signer,
            config,
            resolver: Box::new(NoResolver),
            geoip: Box::new(NoGeoIp),
        }
    }

    /// Build from config, loading the signing key from
    /// `service.signing_secret_file` or falling back to an ephemeral one.
    pub fn from_config(config: MytokenConfig) -> MytokenResult<Self> {
        let signer = match &config.service.signing_secret_file {
            Some(path) => TokenSigner::load(path)?,
            None => {
                tracing::warn!("no signing_secret_file configured, using an ephemeral signing key");
                TokenSigner::ephemeral()
            }
        };
        Ok(Self::new(config, signer))
    }

    pub fn with_resolver(mut self, resolver: impl HostResolver + Send + Sync + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_geoip(mut self, geoip: impl GeoIpLookup + Send + Sync + 'static) -> Self {
        self.geoip = Box::new(geoip);
        self
    }

    pub fn config(&self) -> &MytokenConfig {
        &self.config
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn proxies(&self) -> &ProxyTokens {
        &self.proxies
    }

    pub(crate) fn custody(&self) -> &Custody {
        &self.custody
    }

    pub(crate) fn verifier(&self) -> RestrictionVerifier<'_> {
        RestrictionVerifier::new(self.resolver.as_ref(), self.geoip.as_ref())
    }

    // ── authentication ───────────────────────────────────────────────────

    /// Check a presented bearer (or short token) end to end. Every failure
    /// is an authentication error.
    pub fn authenticate<T: Transaction>(
        &self,
        tx: &mut T,
        presented: &SecretString,
        now: UnixTime,
    ) -> MytokenResult<Authenticated> {
        let result = self.check_bearer(tx, presented, now);
        match &result {
            Err(MytokenError::Authentication { reason }) => {
                tracing::warn!(%reason, "mytoken authentication failed");
            }
            Err(MytokenError::LineageRevoked { reason }) => {
                tracing::warn!(%reason, "mytoken authentication failed, lineage revoked");
            }
            _ => {}
        }
        result
    }

    fn check_bearer<T: Transaction>(
        &self,
        tx: &mut T,
        presented: &SecretString,
        now: UnixTime,
    ) -> MytokenResult<Authenticated> {
        let universal = self.proxies.universal_parse(tx, presented)?;
        let claims = self.signer.verify(&universal.bearer)?;
        if claims.iss != self.config.service.issuer {
            return Err(MytokenError::authentication(format!(
                "foreign issuer {}",
                claims.iss
            )));
        }
        if claims.token_type != TOKEN_TYPE {
            return Err(MytokenError::authentication("not a mytoken"));
        }
        if !claims.jti.is_valid() {
            return Err(MytokenError::authentication("invalid token id"));
        }
        if claims.nbf > now {
            return Err(MytokenError::authentication("token not yet valid"));
        }
        if !claims.exp.is_unset() && now >= claims.exp {
            return Err(MytokenError::authentication("token expired"));
        }
        let superseded = match revocation_status(tx, &claims, now)? {
            RevocationStatus::Current => false,
            RevocationStatus::Superseded => true,
            RevocationStatus::Revoked => {
                return Err(MytokenError::authentication("token revoked"))
            }
            RevocationStatus::LineageRevoked(revoked) => {
                return Err(MytokenError::LineageRevoked {
                    reason: format!(
                        "stale generation {} presented, {} token(s) revoked",
                        claims.seq_no,
                        revoked.nodes.len()
                    ),
                })
            }
        };
        let record = tx
            .get_node(claims.id())?
            .ok_or_else(|| MytokenError::authentication("token revoked"))?;
        Ok(Authenticated {
            token: IssuedMytoken::new(claims, universal.bearer),
            record,
            presented_as: universal.original_type,
            superseded,
        })
    }

    pub fn is_revoked<T: Transaction>(
        &self,
        tx: &mut T,
        claims: &MytokenClaims,
        now: UnixTime,
    ) -> MytokenResult<bool> {
        is_revoked(tx, claims, now)
    }

    // ── issuance ─────────────────────────────────────────────────────────

    fn prepare_restrictions(
        &self,
        restrictions: &mut Restrictions,
        max_lifetime: u64,
        ctx: &RequestContext,
    ) -> bool {
        restrictions.clear_disabled_keys(&self.config.features.disabled_restriction_keys);
        restrictions.replace_this_ip(ctx.client_ip);
        restrictions.enforce_max_lifetime(max_lifetime, ctx.now)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_claims(
        &self,
        oidc_sub: &str,
        oidc_iss: &str,
        restrictions: Restrictions,
        capabilities: Capabilities,
        rotation: Option<RotationConfig>,
        name: Option<String>,
        now: UnixTime,
    ) -> MytokenClaims {
        let issuer = self.config.service.issuer.clone();
        MytokenClaims {
            ver: TOKEN_VERSION.into(),
            token_type: TOKEN_TYPE.into(),
            sub: mytoken_subject(oidc_sub, oidc_iss),
            exp: restrictions.expires_at(),
            nbf: restrictions.not_before().max(now),
            iat: now,
            jti: TokenId::new(),
            seq_no: 1,
            aud: issuer.clone(),
            iss: issuer,
            oidc_sub: oidc_sub.to_string(),
            oidc_iss: oidc_iss.to_string(),
            name,
            restrictions,
            capabilities,
            rotation: rotation.filter(RotationConfig::is_enabled),
        }
    }

    /// Create a root token holding a fresh upstream refresh token.
    pub fn mint_root<T: Transaction>(
        &self,
        tx: &mut T,
        request: MintRequest,
        ctx: &RequestContext,
    ) -> MytokenResult<IssuedMytoken> {
        let provider = self
            .config
            .provider(&request.oidc_issuer)
            .ok_or_else(|| {
                MytokenError::validation(format!("unknown OIDC provider {}", request.oidc_issuer))
            })?;
        let capabilities = match request.capabilities {
            None => Capabilities::from_strings(&self.config.service.default_capabilities),
            Some(c) if c.is_empty() => {
                return Err(MytokenError::validation("capability set must not be empty"))
            }
            Some(c) => c,
        };
        let mut restrictions = request.restrictions;
        restrictions.set_max_scopes(&request.granted_scopes);
        restrictions.set_max_audiences(&request.granted_audiences);
        self.prepare_restrictions(&mut restrictions, provider.mytokens_max_lifetime, ctx);

        let claims = self.new_claims(
            &request.oidc_subject,
            &request.oidc_issuer,
            restrictions,
            capabilities,
            request.rotation,
            request.name,
            ctx.now,
        );
        let bearer = self.signer.sign(&claims)?;
        let secret_id = self
            .custody
            .establish(tx, claims.id(), &bearer, &request.refresh_token)?;
        tx.insert_node(claims.to_record(
            None,
            claims.id(),
            secret_id,
            Some(ctx.client_ip.to_string()),
        )?)?;
        record_event(tx, claims.id(), TokenEvent::Created, "", Some(ctx.client_ip), ctx.now)?;
        tracing::info!(
            token = claims.id().short(),
            issuer = %claims.oidc_iss,
            clauses = claims.restrictions.len(),
            "root mytoken minted"
        );
        Ok(IssuedMytoken::new(claims, bearer))
    }

    /// Create a child of the presented token, no more powerful than it.
    pub fn derive<T: Transaction>(
        &self,
        tx: &mut T,
        parent_bearer: &SecretString,
        request: DeriveRequest,
        ctx: &RequestContext,
    ) -> MytokenResult<Derived> {
        let parent = self.authenticate(tx, parent_bearer, ctx.now)?;
        parent.require_current()?;
        let pclaims = &parent.token.claims;
        if !pclaims.capabilities.has_all(&[Capability::CREATE_MYTOKEN]) {
            return Err(MytokenError::policy_denied(
                "token lacks the create_mytoken capability",
            ));
        }
        self.spend_use(tx, pclaims, ctx, Purpose::Other)?;

        if request.fail_if_not_tighter {
            if let Some(requested) = &request.capabilities {
                if !requested.is_subset_of(&pclaims.capabilities) {
                    return Err(MytokenError::validation(
                        "requested capabilities exceed the parent's",
                    ));
                }
            }
        }
        let capabilities =
            Capabilities::tighten(&pclaims.capabilities, request.capabilities.as_ref())?;

        let max_lifetime = self
            .config
            .provider(&pclaims.oidc_iss)
            .map_or(0, |p| p.mytokens_max_lifetime);
        let mut requested = request.restrictions;
        requested.clear_disabled_keys(&self.config.features.disabled_restriction_keys);
        requested.replace_this_ip(ctx.client_ip);
        // an empty request inherits the parent's policy, which was clamped when issued
        let clamped = !requested.is_empty() && requested.enforce_max_lifetime(max_lifetime, ctx.now);
        if clamped && request.fail_if_not_tighter {
            return Err(MytokenError::validation(
                "requested lifetime exceeds the provider maximum",
            ));
        }
        let Tightened {
            restrictions,
            all_honored,
        } = tighten(&pclaims.restrictions, &requested, self.resolver.as_ref());
        if !all_honored && request.fail_if_not_tighter {
            return Err(MytokenError::validation(
                "requested restrictions are not tighter than the parent's",
            ));
        }

        let mut claims = self.new_claims(
            &pclaims.oidc_sub,
            &pclaims.oidc_iss,
            restrictions,
            capabilities,
            request.rotation,
            request.name,
            ctx.now,
        );
        if !pclaims.exp.is_unset() && (claims.exp.is_unset() || claims.exp > pclaims.exp) {
            claims.exp = pclaims.exp;
        }
        let bearer = self.signer.sign(&claims)?;

        let unlocked = self.custody.unlock(tx, pclaims.id(), parent.token.bearer())?;
        self.custody.share(tx, &unlocked, claims.id(), &bearer)?;
        tx.insert_node(claims.to_record(
            Some(pclaims.id()),
            &parent.record.root_id,
            unlocked.secret_id(),
            Some(ctx.client_ip.to_string()),
        )?)?;
        record_event(
            tx,
            claims.id(),
            TokenEvent::Created,
            "derived",
            Some(ctx.client_ip),
            ctx.now,
        )?;
        record_event(
            tx,
            pclaims.id(),
            TokenEvent::SubtokenCreated,
            "",
            Some(ctx.client_ip),
            ctx.now,
        )?;
        tracing::info!(
            token = claims.id().short(),
            parent = pclaims.id().short(),
            all_honored,
            "mytoken derived"
        );

        let rotated_parent =
            self.rotate_authenticated(tx, &parent, parent_bearer, Purpose::Other, ctx)?;
        Ok(Derived {
            token: IssuedMytoken::new(claims, bearer),
            rotated_parent,
        })
    }

    /// Verify the policy for `purpose` and spend one use on the clause that
    /// allowed it.
    pub(crate) fn spend_use<T: Transaction>(
        &self,
        tx: &mut T,
        claims: &MytokenClaims,
        ctx: &RequestContext,
        purpose: Purpose,
    ) -> MytokenResult<()> {
        let verdict = self.verifier().verify(
            &claims.restrictions,
            claims.id(),
            &ctx.verify_ctx(purpose),
            tx,
        )?;
        match verdict {
            Verdict::Unrestricted => Ok(()),
            Verdict::Denied => Err(MytokenError::policy_denied(format!(
                "no restriction permits {purpose} use from {}",
                ctx.client_ip
            ))),
            Verdict::Matched(r) => consume(tx, r, claims.id(), purpose),
        }
    }

    // ── rotation ─────────────────────────────────────────────────────────

    /// Rotate the presented token if its settings ask for it on `purpose`.
    pub fn rotate<T: Transaction>(
        &self,
        tx: &mut T,
        presented: &SecretString,
        purpose: Purpose,
        ctx: &RequestContext,
    ) -> MytokenResult<Option<IssuedMytoken>> {
        let auth = self.authenticate(tx, presented, ctx.now)?;
        self.rotate_authenticated(tx, &auth, presented, purpose, ctx)
    }

    pub(crate) fn rotate_authenticated<T: Transaction>(
        &self,
        tx: &mut T,
        auth: &Authenticated,
        presented: &SecretString,
        purpose: Purpose,
        ctx: &RequestContext,
    ) -> MytokenResult<Option<IssuedMytoken>> {
        let now = ctx.now;
        let current = &auth.token;
        if !current.claims.rotation().rotates_on(purpose) {
            return Ok(None);
        }
        auth.require_current()?;
        let next = current.claims.rotated(now);
        let bearer = self.signer.sign(&next)?;
        if !tx.update_rotation(next.id(), next.seq_no, now, next.exp)? {
            return Err(MytokenError::authentication("token vanished during rotation"));
        }
        self.custody
            .rewrap(tx, next.id(), current.bearer(), &bearer)?;
        if auth.presented_as == ResponseType::ShortToken {
            self.proxies.update_short_token(tx, presented, &bearer)?;
        }
        record_event(
            tx,
            next.id(),
            TokenEvent::Rotated,
            &format!("seq {}", next.seq_no),
            Some(ctx.client_ip),
            now,
        )?;
        tracing::info!(
            token = next.id().short(),
            seq_no = next.seq_no,
            %purpose,
            "mytoken rotated"
        );
        Ok(Some(IssuedMytoken::new(next, bearer)))
    }

    // ── revocation ───────────────────────────────────────────────────────

    /// Revoke the presented token (with `cascade`, its subtree too). When a
    /// provider is given and the token's refresh token lost its last
    /// holder, it is revoked upstream as well.
    pub fn revoke<T: Transaction>(
        &self,
        tx: &mut T,
        presented: &SecretString,
        cascade: bool,
        provider: Option<&dyn OidcProvider>,
        ctx: &RequestContext,
    ) -> MytokenResult<Revoked> {
        let auth = self.authenticate(tx, presented, ctx.now)?;
        let claims = &auth.token.claims;
        let upstream = match provider {
            Some(p) => {
                auth.require_current()?;
                let unlocked = self.custody.unlock(tx, claims.id(), auth.token.bearer())?;
                let refresh_token = self.custody.refresh_token(tx, &unlocked)?;
                Some((p, unlocked.secret_id(), refresh_token))
            }
            None => None,
        };

        let revoked = revoke_lineage(tx, claims.id(), cascade)?;
        if let Some((p, secret_id, refresh_token)) = upstream {
            if revoked.released_secrets.contains(&secret_id) {
                p.revoke_refresh_token(&claims.oidc_iss, &refresh_token)?;
                tracing::info!(issuer = %claims.oidc_iss, "upstream refresh token revoked");
            }
        }
        Ok(revoked)
    }

    /// Administrative revoke by stored id; no bearer needed.
    pub fn revoke_by_id<T: Transaction>(
        &self,
        tx: &mut T,
        id: &TokenHash,
        cascade: bool,
    ) -> MytokenResult<Revoked> {
        revoke_lineage(tx, id, cascade)
    }

    // ── response shaping ─────────────────────────────────────────────────

    /// Hand `issued` back as a bearer, short token or transfer code. A
    /// `max_token_len` the bearer does not fit in picks the first smaller
    /// form that is enabled.
    pub fn issue_response<T: Transaction>(
        &self,
        tx: &mut T,
        issued: &IssuedMytoken,
        requested: ResponseType,
        max_token_len: Option<usize>,
        now: UnixTime,
    ) -> MytokenResult<MytokenResponse> {
        let features = self.proxies.features();
        let response_type = match max_token_len.filter(|&max| max > 0) {
            None => requested,
            Some(max) if max >= issued.bearer().expose_secret().len() => ResponseType::Token,
            Some(max) if features.short_tokens.enabled && max >= features.short_tokens.len => {
                ResponseType::ShortToken
            }
            Some(_) if features.transfer_codes.enabled => ResponseType::TransferCode,
            Some(_) => ResponseType::Token,
        };

        let (mytoken, expires_in) = match response_type {
            ResponseType::Token => (
                SecretString::from(issued.bearer().expose_secret().to_owned()),
                issued.claims.expires_in(now),
            ),
            ResponseType::ShortToken => (
                self.proxies
                    .create_short_token(tx, issued.bearer(), issued.id(), now)?,
                issued.claims.expires_in(now),
            ),
            ResponseType::TransferCode => {
                let attributes = TransferAttributes {
                    new_mytoken: true,
                    response_type: if requested == ResponseType::ShortToken {
                        ResponseType::ShortToken
                    } else {
                        ResponseType::Token
                    },
                    max_token_len,
                };
                let code = self.proxies.create_transfer_code(
                    tx,
                    issued.bearer(),
                    issued.id(),
                    attributes,
                    now,
                )?;
                record_event(tx, issued.id(), TokenEvent::TransferCodeCreated, "", None, now)?;
                (code, features.polling_codes.expires_after)
            }
        };
        Ok(MytokenResponse {
            mytoken,
            response_type,
            expires_in,
            mom_id: issued.id().clone(),
            capabilities: issued.claims.capabilities.clone(),
            restrictions: issued.claims.restrictions.clone(),
            rotation: issued.claims.rotation,
        })
    }

    /// Redeem a transfer or polling code once.
    pub fn exchange_transfer_code<T: Transaction>(
        &self,
        tx: &mut T,
        code: &SecretString,
        now: UnixTime,
    ) -> MytokenResult<Exchanged> {
        match self.proxies.pop(tx, code, now)? {
            Resolved::Pending => Ok(Exchanged::Pending),
            Resolved::NotFound | Resolved::Invalid => {
                Err(MytokenError::authentication("unknown or expired transfer code"))
            }
            Resolved::Found {
                payload,
                token_id,
                attributes,
            } => {
                if let Some(id) = &token_id {
                    record_event(tx, id, TokenEvent::TransferCodeUsed, "", None, now)?;
                }
                let wants_short = attributes
                    .is_some_and(|a| a.response_type == ResponseType::ShortToken)
                    && self.proxies.features().short_tokens.enabled;
                match (&token_id, wants_short) {
                    (Some(id), true) => Ok(Exchanged::Token {
                        mytoken: self.proxies.create_short_token(tx, &payload, id, now)?,
                        response_type: ResponseType::ShortToken,
                        token_id,
                    }),
                    _ => Ok(Exchanged::Token {
                        mytoken: payload,
                        response_type: ResponseType::Token,
                        token_id,
                    }),
                }
            }
        }
    }

    // ── listings ─────────────────────────────────────────────────────────

    /// All token trees of the presented token's owner.
    pub fn token_tree<T: Transaction>(
        &self,
        tx: &mut T,
        presented: &SecretString,
        ctx: &RequestContext,
    ) -> MytokenResult<Vec<TokenTree>> {
        let auth = self.authenticate(tx, presented, ctx.now)?;
        let claims = &auth.token.claims;
        if !claims.capabilities.has_all(&[Capability::TOKENINFO_TREE]) {
            return Err(MytokenError::policy_denied(
                "token lacks the tokeninfo_tree capability",
            ));
        }
        token_tree(tx, &claims.oidc_sub, &claims.oidc_iss)
    }

    /// The presented token and everything derived from it.
    pub fn subtree<T: Transaction>(
        &self,
        tx: &mut T,
        presented: &SecretString,
        ctx: &RequestContext,
    ) -> MytokenResult<Option<TokenTree>> {
        let auth = self.authenticate(tx, presented, ctx.now)?;
        subtree(tx, auth.token.id())
    }
}

impl std::fmt::Debug for MytokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MytokenService")
            .field("issuer", &self.config.service.issuer)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

pub(crate) fn consume<T: Transaction>(
    tx: &mut T,
    clause: &Restriction,
    token: &TokenHash,
    purpose: Purpose,
) -> MytokenResult<()> {
    if clause.consume_usage(tx, token, purpose)? {
        Ok(())
    } else {
        Err(MytokenError::policy_denied(format!(
            "{purpose} usage limit reached"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mytoken_core::config::ProviderConfig;
    use mytoken_store::{MemoryStore, Store};
    use std::net::{IpAddr, Ipv4Addr};

    const OP: &str = "https://op.example.com";

    fn service() -> MytokenService {
        let mut config = MytokenConfig::default();
        config.crypto.argon2_mem_cost_kib = 1024;
        config.crypto.argon2_time_cost = 1;
        config.providers.push(ProviderConfig {
            issuer: OP.into(),
            mytokens_max_lifetime: 3600,
            ..Default::default()
        });
        MytokenService::new(config, TokenSigner::ephemeral())
    }

    fn ctx(now: i64) -> RequestContext {
        RequestContext::at(UnixTime(now), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)))
    }

    fn mint(svc: &MytokenService, tx: &mut impl Transaction, caps: &[&str]) -> IssuedMytoken {
        svc.mint_root(
            tx,
            MintRequest {
                oidc_subject: "alice".into(),
                oidc_issuer: OP.into(),
                refresh_token: SecretString::from("rt-0"),
                granted_scopes: Vec::new(),
                granted_audiences: Vec::new(),
                restrictions: Restrictions::default(),
                capabilities: Some(Capabilities::new(caps.iter().copied())),
                rotation: None,
                name: None,
            },
            &ctx(1_000),
        )
        .unwrap()
    }

    #[test]
    fn test_mint_applies_max_lifetime_and_defaults() {
        let svc = service();
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let root = svc
            .mint_root(
                &mut tx,
                MintRequest {
                    oidc_subject: "alice".into(),
                    oidc_issuer: OP.into(),
                    refresh_token: SecretString::from("rt"),
                    granted_scopes: Vec::new(),
                    granted_audiences: Vec::new(),
                    restrictions: Restrictions::default(),
                    capabilities: None,
                    rotation: None,
                    name: Some("laptop".into()),
                },
                &ctx(1_000),
            )
            .unwrap();
        assert_eq!(root.claims.exp, UnixTime(4_600));
        assert_eq!(root.claims.nbf, UnixTime(1_000));
        assert_eq!(root.claims.sub, format!("alice@{OP}"));
        assert!(root.claims.capabilities.contains("AT"));

        let record = tx.get_node(root.id()).unwrap().unwrap();
        assert!(record.is_root());
        assert_eq!(record.root_id, *root.id());
        assert_eq!(record.ip_created.as_deref(), Some("192.0.2.7"));
    }

    #[test]
    fn test_mint_rejects_unknown_provider_and_empty_capabilities() {
        let svc = service();
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let mut request = MintRequest {
            oidc_subject: "alice".into(),
            oidc_issuer: "https://elsewhere.example.com".into(),
            refresh_token: SecretString::from("rt"),
            granted_scopes: Vec::new(),
            granted_audiences: Vec::new(),
            restrictions: Restrictions::default(),
            capabilities: None,
            rotation: None,
            name: None,
        };
        let err = svc.mint_root(&mut tx, request, &ctx(1)).unwrap_err();
        assert!(matches!(err, MytokenError::Validation(_)));

        request = MintRequest {
            oidc_subject: "alice".into(),
            oidc_issuer: OP.into(),
            refresh_token: SecretString::from("rt"),
            granted_scopes: Vec::new(),
            granted_audiences: Vec::new(),
            restrictions: Restrictions::default(),
            capabilities: Some(Capabilities::default()),
            rotation: None,
            name: None,
        };
        let err = svc.mint_root(&mut tx, request, &ctx(1)).unwrap_err();
        assert!(matches!(err, MytokenError::Validation(_)));
    }

    #[test]
    fn test_mint_drops_scopes_the_provider_did_not_grant() {
        let svc = service();
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let root = svc
            .mint_root(
                &mut tx,
                MintRequest {
                    oidc_subject: "alice".into(),
                    oidc_issuer: OP.into(),
                    refresh_token: SecretString::from("rt"),
                    granted_scopes: vec!["openid".into()],
                    granted_audiences: vec!["api".into()],
                    restrictions: Restrictions::new(vec![Restriction {
                        scope: "openid dropped".into(),
                        audiences: vec!["api".into(), "other".into()],
                        ..Default::default()
                    }]),
                    capabilities: None,
                    rotation: None,
                    name: None,
                },
                &ctx(1_000),
            )
            .unwrap();
        assert_eq!(root.claims.restrictions[0].scope, "openid");
        assert_eq!(root.claims.restrictions[0].audiences, vec!["api"]);
    }

    #[test]
    fn test_authenticate_checks_issuer_and_time() {
        let svc = service();
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let root = mint(&svc, &mut tx, &["AT"]);

        assert!(svc.authenticate(&mut tx, root.bearer(), UnixTime(1_000)).is_ok());
        let err = svc
            .authenticate(&mut tx, root.bearer(), UnixTime(999))
            .unwrap_err();
        assert!(err.is_authentication());
        let err = svc
            .authenticate(&mut tx, root.bearer(), UnixTime(4_600))
            .unwrap_err();
        assert!(err.is_authentication());

        let mut foreign = root.claims.clone();
        foreign.iss = "https://other.example.com".into();
        let forged = svc.signer().sign(&foreign).unwrap();
        let err = svc.authenticate(&mut tx, &forged, UnixTime(1_000)).unwrap_err();
        assert!(err.is_authentication());
        assert_eq!(err.to_string(), "invalid token");
    }

    #[test]
    fn test_derive_requires_create_mytoken() {
        let svc = service();
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let root = mint(&svc, &mut tx, &["AT"]);
        let err = svc
            .derive(&mut tx, root.bearer(), DeriveRequest::default(), &ctx(1_000))
            .unwrap_err();
        assert!(matches!(err, MytokenError::PolicyDenied(_)));
    }

    #[test]
    fn test_derive_tightens_and_caps_expiry() {
        let svc = service();
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let root = mint(&svc, &mut tx, &["AT", "create_mytoken"]);

        let derived = svc
            .derive(
                &mut tx,
                root.bearer(),
                DeriveRequest {
                    capabilities: Some(Capabilities::new(["AT", "settings"])),
                    ..Default::default()
                },
                &ctx(1_100),
            )
            .unwrap();
        let child = &derived.token.claims;
        assert_eq!(child.capabilities.to_strings(), vec!["AT".to_string()]);
        assert_eq!(child.exp, root.claims.exp);
        assert!(derived.rotated_parent.is_none());

        let record = tx.get_node(child.id()).unwrap().unwrap();
        assert_eq!(record.parent_id.as_ref(), Some(root.id()));
        assert_eq!(record.root_id, *root.id());
        assert_eq!(record.secret_id, tx.get_node(root.id()).unwrap().unwrap().secret_id);
    }

    #[test]
    fn test_derive_strict_rejects_wider_request() {
        let svc = service();
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let root = mint(&svc, &mut tx, &["AT", "create_mytoken"]);
        let wider = Restrictions::new(vec![Restriction {
            expires_at: UnixTime(9_999),
            ..Default::default()
        }]);
        let err = svc
            .derive(
                &mut tx,
                root.bearer(),
                DeriveRequest {
                    restrictions: wider,
                    fail_if_not_tighter: true,
                    ..Default::default()
                },
                &ctx(1_100),
            )
            .unwrap_err();
        assert!(matches!(err, MytokenError::Validation(_)));

        let err = svc
            .derive(
                &mut tx,
                root.bearer(),
                DeriveRequest {
                    capabilities: Some(Capabilities::new(["settings"])),
                    fail_if_not_tighter: true,
                    ..Default::default()
                },
                &ctx(1_100),
            )
            .unwrap_err();
        assert!(matches!(err, MytokenError::Validation(_)));
    }

    #[test]
    fn test_issue_response_shapes() {
        let svc = service();
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let root = mint(&svc, &mut tx, &["AT"]);
        let bearer_len = root.bearer().expose_secret().len();

        let full = svc
            .issue_response(&mut tx, &root, ResponseType::Token, None, UnixTime(1_000))
            .unwrap();
        assert_eq!(full.response_type, ResponseType::Token);
        assert_eq!(full.mytoken.expose_secret(), root.bearer().expose_secret());
        assert_eq!(full.expires_in, 3_600);

        let short = svc
            .issue_response(&mut tx, &root, ResponseType::Token, Some(bearer_len - 1), UnixTime(1_000))
            .unwrap();
        assert_eq!(short.response_type, ResponseType::ShortToken);
        assert_eq!(short.mytoken.expose_secret().len(), 64);

        let code = svc
            .issue_response(&mut tx, &root, ResponseType::Token, Some(20), UnixTime(1_000))
            .unwrap();
        assert_eq!(code.response_type, ResponseType::TransferCode);
        assert_eq!(code.expires_in, 300);

        match svc
            .exchange_transfer_code(&mut tx, &code.mytoken, UnixTime(1_010))
            .unwrap()
        {
            Exchanged::Token {
                mytoken,
                response_type,
                token_id,
            } => {
                assert_eq!(response_type, ResponseType::Token);
                assert_eq!(mytoken.expose_secret(), root.bearer().expose_secret());
                assert_eq!(token_id.as_ref(), Some(root.id()));
            }
            Exchanged::Pending => panic!("transfer code should carry a token"),
        }
        assert!(svc
            .exchange_transfer_code(&mut tx, &code.mytoken, UnixTime(1_011))
            .is_err());
    }

    #[test]
    fn test_short_token_authenticates_and_follows_rotation() {
        let svc = service();
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let root = svc
            .mint_root(
                &mut tx,
                MintRequest {
                    oidc_subject: "alice".into(),
                    oidc_issuer: OP.into(),
                    refresh_token: SecretString::from("rt"),
                    granted_scopes: Vec::new(),
                    granted_audiences: Vec::new(),
                    restrictions: Restrictions::default(),
                    capabilities: None,
                    rotation: Some(RotationConfig {
                        on_other: true,
                        ..Default::default()
                    }),
                    name: None,
                },
                &ctx(1_000),
            )
            .unwrap();
        let short = svc
            .issue_response(&mut tx, &root, ResponseType::ShortToken, None, UnixTime(1_000))
            .unwrap()
            .mytoken;

        let auth = svc.authenticate(&mut tx, &short, UnixTime(1_001)).unwrap();
        assert_eq!(auth.presented_as, ResponseType::ShortToken);

        let rotated = svc
            .rotate(&mut tx, &short, Purpose::Other, &ctx(1_002))
            .unwrap()
            .unwrap();
        assert_eq!(rotated.claims.seq_no, 2);
        let again = svc.authenticate(&mut tx, &short, UnixTime(1_003)).unwrap();
        assert_eq!(again.token.claims.seq_no, 2);
        assert!(svc
            .authenticate(&mut tx, root.bearer(), UnixTime(1_003))
            .unwrap_err()
            .is_authentication());
    }
}
