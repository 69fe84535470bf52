//! Capability sets: what a mytoken may be used for.

use mytoken_core::{MytokenError, MytokenResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// A single capability name. The vocabulary is open; unknown names are
/// carried through but have no description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub const AT: &'static str = "AT";
    pub const CREATE_MYTOKEN: &'static str = "create_mytoken";
    pub const SETTINGS: &'static str = "settings";
    pub const TOKENINFO_INTROSPECT: &'static str = "tokeninfo_introspect";
    pub const TOKENINFO_HISTORY: &'static str = "tokeninfo_history";
    pub const TOKENINFO_TREE: &'static str = "tokeninfo_tree";
    pub const LIST_MYTOKENS: &'static str = "list_mytokens";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Human description for known capabilities.
    pub fn description(&self) -> Option<&'static str> {
        KNOWN
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.0))
            .map(|(_, desc)| *desc)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

const KNOWN: &[(&str, &str)] = &[
    (Capability::AT, "Allows obtaining OpenID Connect Access Tokens."),
    (Capability::CREATE_MYTOKEN, "Allows to create a new mytoken."),
    (Capability::SETTINGS, "Allows to modify user settings."),
    (
        Capability::TOKENINFO_INTROSPECT,
        "Allows to obtain basic information about this token.",
    ),
    (
        Capability::TOKENINFO_HISTORY,
        "Allows to obtain the event history for this token.",
    ),
    (
        Capability::TOKENINFO_TREE,
        "Allows to list a subtoken-tree for this token.",
    ),
    (Capability::LIST_MYTOKENS, "Allows to list all mytokens."),
];

/// Every known capability with its description.
pub fn known_capabilities() -> impl Iterator<Item = (Capability, &'static str)> {
    KNOWN.iter().map(|(name, desc)| (Capability::new(*name), *desc))
}

/// An ordered capability set without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Capability>", into = "Vec<Capability>")]
pub struct Capabilities(Vec<Capability>);

impl Capabilities {
    pub fn new<I, C>(caps: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        let mut out: Vec<Capability> = Vec::new();
        for c in caps {
            let c = c.into();
            if !out.contains(&c) {
                out.push(c);
            }
        }
        Self(out)
    }

    pub fn from_strings(caps: &[String]) -> Self {
        Self::new(caps.iter().map(|s| Capability::new(s.as_str())))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|c| c.0 == name)
    }

    /// AND semantics. An empty set authorizes nothing.
    pub fn has_all(&self, required: &[&str]) -> bool {
        !self.0.is_empty() && required.iter().all(|r| self.contains(r))
    }

    pub fn is_subset_of(&self, other: &Capabilities) -> bool {
        self.0.iter().all(|c| other.contains(c.name()))
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|c| c.0.clone()).collect()
    }

    /// Capabilities for a derived token.
    ///
    /// `None` inherits the parent set. An explicitly empty request, or one
    /// sharing nothing with the parent, is rejected.
    pub fn tighten(parent: &Capabilities, requested: Option<&Capabilities>) -> MytokenResult<Self> {
        let Some(requested) = requested else {
            return Ok(parent.clone());
        };
        if requested.is_empty() {
            return Err(MytokenError::validation(
                "a mytoken must carry at least one capability",
            ));
        }
        let kept: Vec<Capability> = requested
            .0
            .iter()
            .filter(|c| parent.contains(c.name()))
            .cloned()
            .collect();
        if kept.is_empty() {
            return Err(MytokenError::validation(
                "none of the requested capabilities are held by the parent",
            ));
        }
        Ok(Self(kept))
    }
}

impl Deref for Capabilities {
    type Target = [Capability];

    fn deref(&self) -> &[Capability] {
        &self.0
    }
}

impl From<Vec<Capability>> for Capabilities {
    fn from(v: Vec<Capability>) -> Self {
        Self::new(v)
    }
}

impl From<Capabilities> for Vec<Capability> {
    fn from(c: Capabilities) -> Self {
        c.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(names: &[&str]) -> Capabilities {
        Capabilities::new(names.iter().copied())
    }

    #[test]
    fn test_tighten_intersects_in_requested_order() {
        let parent = caps(&["AT", "create_mytoken", "settings"]);
        let req = caps(&["settings", "AT", "list_mytokens"]);
        let got = Capabilities::tighten(&parent, Some(&req)).unwrap();
        assert_eq!(got, caps(&["settings", "AT"]));
        assert!(got.is_subset_of(&parent));
    }

    #[test]
    fn test_tighten_inherits_when_omitted() {
        let parent = caps(&["AT", "create_mytoken"]);
        assert_eq!(Capabilities::tighten(&parent, None).unwrap(), parent);
    }

    #[test]
    fn test_tighten_rejects_empty() {
        let parent = caps(&["AT"]);
        let err = Capabilities::tighten(&parent, Some(&Capabilities::default())).unwrap_err();
        assert!(matches!(err, MytokenError::Validation(_)));
        let err = Capabilities::tighten(&parent, Some(&caps(&["settings"]))).unwrap_err();
        assert!(matches!(err, MytokenError::Validation(_)));
    }

    #[test]
    fn test_has_all() {
        let c = caps(&["AT", "tokeninfo_tree"]);
        assert!(c.has_all(&["AT"]));
        assert!(c.has_all(&[]));
        assert!(!c.has_all(&["AT", "settings"]));
        assert!(!Capabilities::default().has_all(&[]));
    }

    #[test]
    fn test_dedup_and_json() {
        let c = caps(&["AT", "AT", "settings"]);
        assert_eq!(c.len(), 2);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"["AT","settings"]"#);
        let back: Capabilities = serde_json::from_str(r#"["AT","AT"]"#).unwrap();
        assert_eq!(back, caps(&["AT"]));
    }

    #[test]
    fn test_descriptions() {
        assert!(Capability::new("AT").description().is_some());
        assert!(Capability::new("custom").description().is_none());
        assert_eq!(known_capabilities().count(), 7);
    }
}
