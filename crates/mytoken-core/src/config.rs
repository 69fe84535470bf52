use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MytokenError, MytokenResult};
use crate::types::RestrictionKey;

/// Top-level service configuration (loaded from mytoken.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MytokenConfig {
    pub service: ServiceConfig,
    pub providers: Vec<ProviderConfig>,
    pub features: FeaturesConfig,
    pub crypto: CryptoConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Issuer URL written into every mytoken
    pub issuer: String,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Capabilities granted to a root mytoken when the request names none
    pub default_capabilities: Vec<String>,
    /// File holding the secret the token signing key is derived from
    pub signing_secret_file: Option<PathBuf>,
}

/// One upstream OIDC provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub issuer: String,
    /// Upper bound on mytoken lifetime in seconds (0 = unlimited)
    pub mytokens_max_lifetime: u64,
    /// Scopes requested when neither the request nor the restriction names any
    pub default_scopes: Vec<String>,
    /// Audiences the provider accepts
    pub audiences: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Restriction keys stripped from every incoming policy
    pub disabled_restriction_keys: Vec<RestrictionKey>,
    pub short_tokens: ShortTokenConfig,
    pub transfer_codes: TransferCodeConfig,
    pub polling_codes: PollingCodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortTokenConfig {
    pub enabled: bool,
    /// Length of generated short tokens
    pub len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferCodeConfig {
    pub enabled: bool,
}

/// Transfer codes share their length and expiry with polling codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingCodeConfig {
    pub enabled: bool,
    pub len: usize,
    /// Seconds until an unclaimed code expires
    pub expires_after: u64,
}

/// Envelope encryption KDF parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 19456 = 19 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 2)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 1)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot of the reference store (in-memory only when unset)
    pub snapshot_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            issuer: "https://mytoken.example.com".into(),
            log_level: "info".into(),
            log_format: "json".into(),
            default_capabilities: vec!["AT".into(), "tokeninfo_introspect".into()],
            signing_secret_file: None,
        }
    }
}

impl Default for ShortTokenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            len: 64,
        }
    }
}

impl Default for TransferCodeConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for PollingCodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            len: 8,
            expires_after: 300,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 19456,
            argon2_time_cost: 2,
            argon2_parallelism: 1,
        }
    }
}

impl MytokenConfig {
    pub fn from_toml_str(s: &str) -> MytokenResult<Self> {
        let config: MytokenConfig =
            toml::from_str(s).map_err(|e| MytokenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> MytokenResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!(path = %path.display(), providers = config.providers.len(), "config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> MytokenResult<()> {
        if self.service.issuer.is_empty() {
            return Err(MytokenError::Config("service.issuer must be set".into()));
        }
        if self.service.default_capabilities.is_empty() {
            return Err(MytokenError::Config(
                "service.default_capabilities must not be empty".into(),
            ));
        }
        if self.features.short_tokens.enabled && self.features.short_tokens.len < 16 {
            return Err(MytokenError::Config(
                "features.short_tokens.len must be at least 16".into(),
            ));
        }
        if self.features.polling_codes.len < 4 {
            return Err(MytokenError::Config(
                "features.polling_codes.len must be at least 4".into(),
            ));
        }
        for (i, p) in self.providers.iter().enumerate() {
            if p.issuer.is_empty() {
                return Err(MytokenError::Config(format!(
                    "providers[{i}].issuer must be set"
                )));
            }
            if self.providers[..i].iter().any(|q| q.issuer == p.issuer) {
                return Err(MytokenError::Config(format!(
                    "provider {} configured twice",
                    p.issuer
                )));
            }
        }
        Ok(())
    }

    pub fn provider(&self, issuer: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.issuer == issuer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[service]
issuer = "https://mytoken.example.org"
log_level = "debug"
log_format = "text"
default_capabilities = ["AT", "create_mytoken"]

[[providers]]
issuer = "https://accounts.example.org"
mytokens_max_lifetime = 2592000
default_scopes = ["openid", "profile"]

[[providers]]
issuer = "https://login.example.net"

[features]
disabled_restriction_keys = ["geoip_allow", "usages_other"]

[features.short_tokens]
enabled = false
len = 32

[features.polling_codes]
len = 10
expires_after = 600

[crypto]
argon2_mem_cost_kib = 65536
argon2_time_cost = 3
argon2_parallelism = 4

[store]
snapshot_path = "/var/lib/mytoken/state.json"
"#;
        let config = MytokenConfig::from_toml_str(toml_str).unwrap();

        assert_eq!(config.service.issuer, "https://mytoken.example.org");
        assert_eq!(config.service.log_level, "debug");
        assert_eq!(config.service.default_capabilities, vec!["AT", "create_mytoken"]);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].mytokens_max_lifetime, 2592000);
        assert_eq!(config.providers[1].mytokens_max_lifetime, 0);
        assert!(!config.features.short_tokens.enabled);
        assert_eq!(config.features.polling_codes.len, 10);
        assert_eq!(config.features.polling_codes.expires_after, 600);
        assert_eq!(
            config.features.disabled_restriction_keys,
            vec![RestrictionKey::GeoIpAllow, RestrictionKey::UsagesOther]
        );
        assert_eq!(config.crypto.argon2_mem_cost_kib, 65536);
        assert_eq!(
            config.store.snapshot_path,
            Some(PathBuf::from("/var/lib/mytoken/state.json"))
        );
    }

    #[test]
    fn test_parse_defaults() {
        let config: MytokenConfig = toml::from_str("").unwrap();

        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.service.log_format, "json");
        assert!(config.providers.is_empty());
        assert!(config.features.short_tokens.enabled);
        assert_eq!(config.features.short_tokens.len, 64);
        assert!(config.features.transfer_codes.enabled);
        assert_eq!(config.features.polling_codes.len, 8);
        assert_eq!(config.features.polling_codes.expires_after, 300);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 19456);
        assert!(config.store.snapshot_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[features.short_tokens]
len = 40
"#;
        let config = MytokenConfig::from_toml_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.features.short_tokens.len, 40);
        // Defaults
        assert!(config.features.short_tokens.enabled);
        assert_eq!(config.crypto.argon2_time_cost, 2);
        assert_eq!(config.service.log_level, "info");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = MytokenConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: MytokenConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.service.issuer, parsed.service.issuer);
        assert_eq!(
            config.features.short_tokens.len,
            parsed.features.short_tokens.len
        );
        assert_eq!(
            config.crypto.argon2_mem_cost_kib,
            parsed.crypto.argon2_mem_cost_kib
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_provider() {
        let toml_str = r#"
[[providers]]
issuer = "https://op.example.org"

[[providers]]
issuer = "https://op.example.org"
"#;
        let err = MytokenConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("configured twice"), "{err}");
    }

    #[test]
    fn test_validate_rejects_short_short_tokens() {
        let mut config = MytokenConfig::default();
        config.features.short_tokens.len = 8;
        assert!(matches!(config.validate(), Err(MytokenError::Config(_))));
    }

    #[test]
    fn test_provider_lookup() {
        let mut config = MytokenConfig::default();
        config.providers.push(ProviderConfig {
            issuer: "https://op.example.org".into(),
            mytokens_max_lifetime: 3600,
            ..Default::default()
        });
        assert_eq!(
            config
                .provider("https://op.example.org")
                .map(|p| p.mytokens_max_lifetime),
            Some(3600)
        );
        assert!(config.provider("https://other.example.org").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mytoken.toml");
        std::fs::write(&path, "[service]\nissuer = \"https://mt.example.org\"\n").unwrap();
        let config = MytokenConfig::load(&path).unwrap();
        assert_eq!(config.service.issuer, "https://mt.example.org");

        let missing = MytokenConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(MytokenError::Io(_))));
    }
}
