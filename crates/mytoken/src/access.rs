//! Exchanging a mytoken for an upstream access token.

use mytoken_core::{MytokenError, MytokenResult, Purpose};
use mytoken_policy::{Capability, Restriction};
use mytoken_store::{TokenEvent, Transaction};
use secrecy::SecretString;

use crate::context::RequestContext;
use crate::history::record_event;
use crate::oidc::OidcProvider;
use crate::service::{consume, MytokenService};
use crate::token::IssuedMytoken;

#[derive(Debug, Clone, Default)]
pub struct AccessTokenRequest {
    pub scopes: Vec<String>,
    pub audiences: Vec<String>,
    /// Free text recorded with the grant.
    pub comment: Option<String>,
}

pub struct AccessTokenGrant {
    pub access_token: SecretString,
    pub scopes: Vec<String>,
    pub audiences: Vec<String>,
    pub expires_in: u64,
    /// The presented token's next generation, if this use rotated it.
    pub rotated: Option<IssuedMytoken>,
}

impl std::fmt::Debug for AccessTokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("audiences", &self.audiences)
            .field("expires_in", &self.expires_in)
            .field("rotated", &self.rotated)
            .finish()
    }
}

fn split_scopes(r: &Restriction) -> Vec<String> {
    r.scopes().into_iter().map(str::to_string).collect()
}

impl MytokenService {
    /// Use the presented token's refresh token to obtain an access token.
    pub fn obtain_access_token<T: Transaction>(
        &self,
        tx: &mut T,
        presented: &SecretString,
        request: &AccessTokenRequest,
        ctx: &RequestContext,
        provider: &dyn OidcProvider,
    ) -> MytokenResult<AccessTokenGrant> {
        let auth = self.authenticate(tx, presented, ctx.now)?;
        auth.require_current()?;
        let claims = &auth.token.claims;
        if !claims.capabilities.has_all(&[Capability::AT]) {
            return Err(MytokenError::policy_denied("token lacks the AT capability"));
        }

        let governing = if claims.restrictions.is_empty() {
            None
        } else {
            let valid = self.verifier().valid_for(
                &claims.restrictions,
                claims.id(),
                &ctx.verify_ctx(Purpose::AccessToken),
                tx,
            )?;
            let candidates = valid
                .with_scopes(&request.scopes)
                .with_audiences(&request.audiences);
            let first = candidates.first().cloned().ok_or_else(|| {
                MytokenError::policy_denied("no restriction permits this access token request")
            })?;
            Some(first)
        };

        let scopes = if !request.scopes.is_empty() {
            request.scopes.clone()
        } else {
            match governing.as_ref().map(split_scopes) {
                Some(s) if !s.is_empty() => s,
                _ => self
                    .config()
                    .provider(&claims.oidc_iss)
                    .map(|p| p.default_scopes.clone())
                    .unwrap_or_default(),
            }
        };
        let audiences = if !request.audiences.is_empty() {
            request.audiences.clone()
        } else {
            governing
                .as_ref()
                .map(|r| r.audiences.clone())
                .unwrap_or_default()
        };

        let unlocked = self
            .custody()
            .unlock(tx, claims.id(), auth.token.bearer())?;
        let refresh_token = self.custody().refresh_token(tx, &unlocked)?;
        let tokens =
            provider.refresh_access_token(&claims.oidc_iss, &refresh_token, &scopes, &audiences)?;
        if let Some(rotated_rt) = &tokens.refresh_token {
            self.custody()
                .replace_refresh_token(tx, &unlocked, rotated_rt)?;
        }

        if let Some(clause) = &governing {
            consume(tx, clause, claims.id(), Purpose::AccessToken)?;
        }
        record_event(
            tx,
            claims.id(),
            TokenEvent::AccessTokenIssued,
            request.comment.as_deref().unwrap_or(""),
            Some(ctx.client_ip),
            ctx.now,
        )?;
        let rotated =
            self.rotate_authenticated(tx, &auth, presented, Purpose::AccessToken, ctx)?;

        tracing::info!(
            token = claims.id().short(),
            scopes = %scopes.join(" "),
            comment = request.comment.as_deref().unwrap_or(""),
            rotated = rotated.is_some(),
            "access token issued"
        );
        Ok(AccessTokenGrant {
            access_token: tokens.access_token,
            scopes: tokens.scopes.unwrap_or(scopes),
            audiences,
            expires_in: tokens.expires_in,
            rotated,
        })
    }
}
