use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch. Zero doubles as "unset" in restriction
/// and token timestamps.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixTime(pub i64);

impl UnixTime {
    pub const UNSET: UnixTime = UnixTime(0);

    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        UnixTime(secs)
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    pub fn secs(self) -> i64 {
        self.0
    }

    pub fn plus_secs(self, secs: u64) -> Self {
        UnixTime(self.0.saturating_add(secs.min(i64::MAX as u64) as i64))
    }

    /// Seconds from `self` until `later`, zero if `later` is not after `self`.
    pub fn secs_until(self, later: UnixTime) -> u64 {
        later.0.saturating_sub(self.0).max(0) as u64
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a token is being used for. Usage budgets and rotation triggers are
/// tracked per purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Purpose {
    #[serde(rename = "AT")]
    AccessToken,
    #[serde(rename = "other")]
    Other,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Purpose::AccessToken => f.write_str("AT"),
            Purpose::Other => f.write_str("other"),
        }
    }
}

/// Names of the individual restriction fields, as they appear in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestrictionKey {
    #[serde(rename = "nbf")]
    NotBefore,
    #[serde(rename = "exp")]
    ExpiresAt,
    #[serde(rename = "scope")]
    Scope,
    #[serde(rename = "audience")]
    Audience,
    #[serde(rename = "hosts")]
    Hosts,
    #[serde(rename = "geoip_allow")]
    GeoIpAllow,
    #[serde(rename = "geoip_disallow")]
    GeoIpDisallow,
    #[serde(rename = "usages_AT")]
    UsagesAt,
    #[serde(rename = "usages_other")]
    UsagesOther,
}

/// How a freshly issued mytoken is handed back to its requester.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Token,
    ShortToken,
    TransferCode,
}
