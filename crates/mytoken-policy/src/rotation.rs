use mytoken_core::Purpose;
use serde::{Deserialize, Serialize};

/// When a mytoken is replaced by a fresh bearer after use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(rename = "on_AT", default, skip_serializing_if = "is_false")]
    pub on_at: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub on_other: bool,
    /// Seconds a rotated bearer stays valid; 0 keeps the previous expiry.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub lifetime: u64,
    /// Revoke the whole lineage when a stale bearer is presented.
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_revoke: bool,
}

fn is_false(b: &bool) -> bool {
    !b
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl RotationConfig {
    pub fn rotates_on(&self, purpose: Purpose) -> bool {
        match purpose {
            Purpose::AccessToken => self.on_at,
            Purpose::Other => self.on_other,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.on_at || self.on_other
    }

    pub fn bounded_lifetime(&self) -> Option<u64> {
        (self.lifetime > 0).then_some(self.lifetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let cfg: RotationConfig =
            serde_json::from_str(r#"{"on_AT": true, "lifetime": 60, "auto_revoke": true}"#).unwrap();
        assert!(cfg.rotates_on(Purpose::AccessToken));
        assert!(!cfg.rotates_on(Purpose::Other));
        assert_eq!(cfg.bounded_lifetime(), Some(60));
        assert_eq!(
            serde_json::to_string(&cfg).unwrap(),
            r#"{"on_AT":true,"lifetime":60,"auto_revoke":true}"#
        );
    }

    #[test]
    fn test_default_is_disabled() {
        let cfg = RotationConfig::default();
        assert!(!cfg.is_enabled());
        assert_eq!(cfg.bounded_lifetime(), None);
        assert_eq!(serde_json::to_string(&cfg).unwrap(), "{}");
    }
}
