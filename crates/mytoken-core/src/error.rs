use thiserror::Error;

pub type MytokenResult<T> = Result<T, MytokenError>;

#[derive(Debug, Error)]
pub enum MytokenError {
    #[error("validation error: {0}")]
    Validation(String),

    /// Every authentication failure renders the same way; `reason` is for logs only.
    #[error("invalid token")]
    Authentication { reason: String },

    /// A stale token generation was presented and its lineage was revoked
    /// while checking it. Renders like any authentication failure, but the
    /// revocation must be committed.
    #[error("invalid token")]
    LineageRevoked { reason: String },

    #[error("usage restricted: {0}")]
    PolicyDenied(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("oidc provider error: {0}")]
    Provider(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MytokenError {
    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn policy_denied(msg: impl Into<String>) -> Self {
        Self::PolicyDenied(msg.into())
    }

    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::LineageRevoked { .. }
        )
    }

    /// Failures that leave writes behind which must survive the request.
    pub fn keeps_writes(&self) -> bool {
        matches!(self, Self::LineageRevoked { .. })
    }

    /// Transient collaborator failures; the caller owns any retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Provider(_))
    }
}
