use mytoken_core::MytokenResult;
use secrecy::SecretString;

/// Tokens returned by a refresh grant at the upstream provider.
pub struct ProviderTokens {
    pub access_token: SecretString,
    /// Set when the provider rotated the refresh token.
    pub refresh_token: Option<SecretString>,
    pub expires_in: u64,
    /// Scopes the provider actually granted, if it says so.
    pub scopes: Option<Vec<String>>,
}

impl std::fmt::Debug for ProviderTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("access_token", &"[REDACTED]")
            .field("rotated_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// The upstream OpenID Connect provider. Failures are reported as
/// [`mytoken_core::MytokenError::Provider`].
pub trait OidcProvider {
    fn refresh_access_token(
        &self,
        issuer: &str,
        refresh_token: &SecretString,
        scopes: &[String],
        audiences: &[String],
    ) -> MytokenResult<ProviderTokens>;

    fn revoke_refresh_token(&self, issuer: &str, refresh_token: &SecretString) -> MytokenResult<()>;
}
