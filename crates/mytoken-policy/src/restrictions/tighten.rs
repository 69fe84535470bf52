//! The partial order between restriction clauses and policy tightening for
//! derived tokens.

use super::hosts::{self, HostResolver};
use super::{Restriction, Restrictions};
use std::collections::BTreeSet;

/// Subset rule shared by scopes, audiences and allow lists: an empty `b`
/// allows anything, an empty `a` is wider than any non-empty `b`.
fn narrower_set<'s>(
    a: impl IntoIterator<Item = &'s str>,
    b: impl IntoIterator<Item = &'s str>,
) -> bool {
    let b: BTreeSet<&str> = b.into_iter().collect();
    if b.is_empty() {
        return true;
    }
    let a: BTreeSet<&str> = a.into_iter().collect();
    !a.is_empty() && a.is_subset(&b)
}

/// `a <= b` where `None` is unbounded.
fn bounded_by(a: Option<u64>, b: Option<u64>) -> bool {
    match (a, b) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(a), Some(b)) => a <= b,
    }
}

impl Restriction {
    /// Whether this clause grants no more than `other`.
    pub fn is_tighter_than(&self, other: &Restriction, resolver: &dyn HostResolver) -> bool {
        if self.not_before < other.not_before {
            return false;
        }
        if !other.expires_at.is_unset()
            && (self.expires_at.is_unset() || self.expires_at > other.expires_at)
        {
            return false;
        }
        if !narrower_set(self.scopes(), other.scopes()) {
            return false;
        }
        if !narrower_set(
            self.audiences.iter().map(String::as_str),
            other.audiences.iter().map(String::as_str),
        ) {
            return false;
        }
        if !other.hosts.is_empty()
            && (self.hosts.is_empty() || !hosts::hosts_within(&self.hosts, &other.hosts, resolver))
        {
            return false;
        }
        if !narrower_set(
            self.geoip_allow.iter().map(String::as_str),
            other.geoip_allow.iter().map(String::as_str),
        ) {
            return false;
        }
        // disallow lists invert: the tighter clause bans at least as much
        if !other
            .geoip_disallow
            .iter()
            .all(|c| self.geoip_disallow.contains(c))
        {
            return false;
        }
        bounded_by(self.usages_at, other.usages_at)
            && bounded_by(self.usages_other, other.usages_other)
    }

    fn subtract_usages(&mut self, spent: &Restriction) {
        if let (Some(have), Some(used)) = (self.usages_at.as_mut(), spent.usages_at) {
            *have = have.saturating_sub(used);
        }
        if let (Some(have), Some(used)) = (self.usages_other.as_mut(), spent.usages_other) {
            *have = have.saturating_sub(used);
        }
    }
}

/// Result of [`tighten`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tightened {
    pub restrictions: Restrictions,
    /// False if any requested clause had to be dropped.
    pub all_honored: bool,
}

/// Restrict `requested` to what `parent` permits.
///
/// Each requested clause is kept if it is tighter than some parent clause,
/// whose usage budget is then reduced by the clause's own budget so that
/// several children cannot together exceed the parent. Clauses fitting no
/// parent clause are dropped. If nothing survives, the parent policy is
/// returned unchanged.
pub fn tighten(
    parent: &Restrictions,
    requested: &Restrictions,
    resolver: &dyn HostResolver,
) -> Tightened {
    if parent.is_empty() {
        return Tightened {
            restrictions: requested.clone(),
            all_honored: true,
        };
    }
    if requested.is_empty() {
        return Tightened {
            restrictions: parent.clone(),
            all_honored: true,
        };
    }

    let mut pool: Vec<Restriction> = parent.to_vec();
    let mut kept = Vec::with_capacity(requested.len());
    let mut dropped = false;
    for wanted in requested.iter() {
        match pool
            .iter_mut()
            .find(|base| wanted.is_tighter_than(base, resolver))
        {
            Some(base) => {
                base.subtract_usages(wanted);
                kept.push(wanted.clone());
            }
            None => {
                tracing::debug!(clause = ?wanted, "requested restriction exceeds parent policy");
                dropped = true;
            }
        }
    }

    if kept.is_empty() {
        return Tightened {
            restrictions: parent.clone(),
            all_honored: false,
        };
    }
    Tightened {
        restrictions: Restrictions::new(kept),
        all_honored: !dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restrictions::hosts::NoResolver;
    use mytoken_core::UnixTime;

    fn exp(secs: i64) -> Restriction {
        Restriction {
            expires_at: UnixTime(secs),
            ..Default::default()
        }
    }

    #[test]
    fn test_expiry_ordering() {
        let r = NoResolver;
        assert!(exp(100).is_tighter_than(&exp(200), &r));
        assert!(!exp(300).is_tighter_than(&exp(200), &r));
        assert!(exp(100).is_tighter_than(&Restriction::default(), &r));
        assert!(!Restriction::default().is_tighter_than(&exp(100), &r));
        assert!(Restriction::default().is_tighter_than(&Restriction::default(), &r));
    }

    #[test]
    fn test_not_before_ordering() {
        let early = Restriction {
            not_before: UnixTime(10),
            ..Default::default()
        };
        let late = Restriction {
            not_before: UnixTime(20),
            ..Default::default()
        };
        assert!(late.is_tighter_than(&early, &NoResolver));
        assert!(!early.is_tighter_than(&late, &NoResolver));
    }

    #[test]
    fn test_scope_subset() {
        let wide = Restriction {
            scope: "openid profile email".into(),
            ..Default::default()
        };
        let narrow = Restriction {
            scope: "openid".into(),
            ..Default::default()
        };
        let r = NoResolver;
        assert!(narrow.is_tighter_than(&wide, &r));
        assert!(!wide.is_tighter_than(&narrow, &r));
        assert!(!Restriction::default().is_tighter_than(&narrow, &r));
        assert!(wide.is_tighter_than(&Restriction::default(), &r));
    }

    #[test]
    fn test_geoip_lists() {
        let r = NoResolver;
        let allow_de = Restriction {
            geoip_allow: vec!["DE".into()],
            ..Default::default()
        };
        let allow_de_fr = Restriction {
            geoip_allow: vec!["DE".into(), "FR".into()],
            ..Default::default()
        };
        assert!(allow_de.is_tighter_than(&allow_de_fr, &r));
        assert!(!allow_de_fr.is_tighter_than(&allow_de, &r));

        let ban_us = Restriction {
            geoip_disallow: vec!["US".into()],
            ..Default::default()
        };
        let ban_us_cn = Restriction {
            geoip_disallow: vec!["US".into(), "CN".into()],
            ..Default::default()
        };
        assert!(ban_us_cn.is_tighter_than(&ban_us, &r));
        assert!(!ban_us.is_tighter_than(&ban_us_cn, &r));
        assert!(!Restriction::default().is_tighter_than(&ban_us, &r));
    }

    #[test]
    fn test_hosts_and_usages() {
        let r = NoResolver;
        let net = Restriction {
            hosts: vec!["10.0.0.0/8".into()],
            usages_at: Some(10),
            ..Default::default()
        };
        let ip = Restriction {
            hosts: vec!["10.1.2.3".into()],
            usages_at: Some(5),
            ..Default::default()
        };
        assert!(ip.is_tighter_than(&net, &r));
        assert!(!net.is_tighter_than(&ip, &r));

        let unlimited = Restriction {
            hosts: vec!["10.1.2.3".into()],
            ..Default::default()
        };
        assert!(!unlimited.is_tighter_than(&net, &r));
    }

    #[test]
    fn test_tighten_empty_sides() {
        let p = Restrictions::new(vec![exp(100)]);
        let t = tighten(&p, &Restrictions::default(), &NoResolver);
        assert_eq!(t.restrictions, p);
        assert!(t.all_honored);

        let t = tighten(&Restrictions::default(), &p, &NoResolver);
        assert_eq!(t.restrictions, p);
        assert!(t.all_honored);
    }

    #[test]
    fn test_tighten_drops_wider_clauses() {
        let parent = Restrictions::new(vec![exp(100)]);
        let requested = Restrictions::new(vec![exp(50), exp(500)]);
        let t = tighten(&parent, &requested, &NoResolver);
        assert_eq!(t.restrictions, Restrictions::new(vec![exp(50)]));
        assert!(!t.all_honored);
    }

    #[test]
    fn test_tighten_falls_back_to_parent() {
        let parent = Restrictions::new(vec![exp(100)]);
        let requested = Restrictions::new(vec![exp(500)]);
        let t = tighten(&parent, &requested, &NoResolver);
        assert_eq!(t.restrictions, parent);
        assert!(!t.all_honored);
    }

    #[test]
    fn test_tighten_splits_usage_budget() {
        let budget = |n| Restriction {
            usages_other: Some(n),
            ..Default::default()
        };
        let parent = Restrictions::new(vec![budget(10)]);
        // 6 + 4 fit, the third clause finds the parent budget spent
        let requested = Restrictions::new(vec![budget(6), budget(4), budget(1)]);
        let t = tighten(&parent, &requested, &NoResolver);
        assert_eq!(t.restrictions.len(), 2);
        assert!(!t.all_honored);
        // the caller's policy is untouched
        assert_eq!(parent[0].usages_other, Some(10));
    }
}
