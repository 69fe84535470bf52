//! Usage restrictions.
//!
//! A policy ([`Restrictions`]) is an ordered list of [`Restriction`] clauses
//! with OR semantics: a token is usable when any clause verifies. An empty
//! policy restricts nothing.

pub mod geoip;
pub mod hosts;
pub mod tighten;

use mytoken_core::hash::sha512_b64;
use mytoken_core::{MytokenError, MytokenResult, Purpose, RestrictionKey, TokenHash, UnixTime};
use mytoken_store::{Transaction, UsageKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::ops::Deref;

use self::geoip::GeoIpLookup;
use self::hosts::HostResolver;

pub use self::tighten::{tighten, Tightened};

/// One restriction clause. Unset fields restrict nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    #[serde(rename = "nbf", default, skip_serializing_if = "UnixTime::is_unset")]
    pub not_before: UnixTime,
    #[serde(rename = "exp", default, skip_serializing_if = "UnixTime::is_unset")]
    pub expires_at: UnixTime,
    /// Space separated scope values
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(rename = "audience", default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geoip_allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geoip_disallow: Vec<String>,
    #[serde(rename = "usages_AT", default, skip_serializing_if = "Option::is_none")]
    pub usages_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usages_other: Option<u64>,
}

impl Restriction {
    /// Canonical JSON: struct field order, unset fields omitted.
    pub fn canonical_json(&self) -> MytokenResult<String> {
        serde_json::to_string(self).map_err(|e| MytokenError::Other(e.into()))
    }

    /// Key under which usage of this clause is counted.
    pub fn hash(&self) -> MytokenResult<String> {
        Ok(sha512_b64(self.canonical_json()?))
    }

    pub fn usage_key(&self, token: &TokenHash) -> MytokenResult<UsageKey> {
        let restriction = self.canonical_json()?;
        Ok(UsageKey {
            token_id: token.clone(),
            restriction_hash: sha512_b64(&restriction),
            restriction,
        })
    }

    pub fn scopes(&self) -> BTreeSet<&str> {
        self.scope.split_whitespace().collect()
    }

    pub fn usage_limit(&self, purpose: Purpose) -> Option<u64> {
        match purpose {
            Purpose::AccessToken => self.usages_at,
            Purpose::Other => self.usages_other,
        }
    }

    /// Half-open validity window `[nbf, exp)`.
    pub fn verify_time(&self, now: UnixTime) -> bool {
        now >= self.not_before && (self.expires_at.is_unset() || now < self.expires_at)
    }

    pub fn verify_usage(&self, purpose: Purpose, prior_uses: Option<u64>) -> bool {
        match self.usage_limit(purpose) {
            None => true,
            Some(limit) => limit > prior_uses.unwrap_or(0),
        }
    }

    /// Record one use of this clause.
    pub fn record_usage<T: Transaction>(
        &self,
        tx: &mut T,
        token: &TokenHash,
        purpose: Purpose,
    ) -> MytokenResult<u64> {
        let key = self.usage_key(token)?;
        Ok(tx.increment_usage(&key, purpose)?)
    }

    /// Record one use if budget remains, as a single store operation.
    /// Returns false when the budget for `purpose` is exhausted.
    pub fn consume_usage<T: Transaction>(
        &self,
        tx: &mut T,
        token: &TokenHash,
        purpose: Purpose,
    ) -> MytokenResult<bool> {
        let key = self.usage_key(token)?;
        match self.usage_limit(purpose) {
            Some(limit) => Ok(tx.increment_usage_below(&key, purpose, limit)?),
            None => {
                tx.increment_usage(&key, purpose)?;
                Ok(true)
            }
        }
    }

    fn clear_key(&mut self, key: RestrictionKey) {
        match key {
            RestrictionKey::NotBefore => self.not_before = UnixTime::UNSET,
            RestrictionKey::ExpiresAt => self.expires_at = UnixTime::UNSET,
            RestrictionKey::Scope => self.scope.clear(),
            RestrictionKey::Audience => self.audiences.clear(),
            RestrictionKey::Hosts => self.hosts.clear(),
            RestrictionKey::GeoIpAllow => self.geoip_allow.clear(),
            RestrictionKey::GeoIpDisallow => self.geoip_disallow.clear(),
            RestrictionKey::UsagesAt => self.usages_at = None,
            RestrictionKey::UsagesOther => self.usages_other = None,
        }
    }
}

/// Request environment a policy is verified against.
#[derive(Debug, Clone, Copy)]
pub struct VerifyContext {
    pub now: UnixTime,
    pub client_ip: IpAddr,
    pub purpose: Purpose,
}

/// Outcome of [`RestrictionVerifier::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict<'p> {
    /// Empty policy.
    Unrestricted,
    /// First clause that verified.
    Matched(&'p Restriction),
    Denied,
}

impl<'p> Verdict<'p> {
    pub fn is_usable(&self) -> bool {
        !matches!(self, Verdict::Denied)
    }

    pub fn matched(&self) -> Option<&'p Restriction> {
        match self {
            Verdict::Matched(r) => Some(r),
            _ => None,
        }
    }
}

/// Checks restrictions against a request, using injected network lookups.
#[derive(Clone, Copy)]
pub struct RestrictionVerifier<'a> {
    resolver: &'a dyn HostResolver,
    geoip: &'a dyn GeoIpLookup,
}

impl<'a> RestrictionVerifier<'a> {
    pub fn new(resolver: &'a dyn HostResolver, geoip: &'a dyn GeoIpLookup) -> Self {
        Self { resolver, geoip }
    }

    pub fn resolver(&self) -> &'a dyn HostResolver {
        self.resolver
    }

    /// Everything except usage counts.
    pub fn verify_environment(&self, r: &Restriction, ctx: &VerifyContext) -> bool {
        r.verify_time(ctx.now)
            && (r.hosts.is_empty() || hosts::ip_allowed(ctx.client_ip, &r.hosts, self.resolver))
            && geoip::country_allowed(ctx.client_ip, &r.geoip_allow, &r.geoip_disallow, self.geoip)
    }

    pub fn verify_element<T: Transaction>(
        &self,
        r: &Restriction,
        token: &TokenHash,
        ctx: &VerifyContext,
        tx: &mut T,
    ) -> MytokenResult<bool> {
        if !self.verify_environment(r, ctx) {
            return Ok(false);
        }
        if r.usage_limit(ctx.purpose).is_none() {
            return Ok(true);
        }
        let prior = tx.usage_count(token, &r.hash()?, ctx.purpose)?;
        Ok(r.verify_usage(ctx.purpose, prior))
    }

    pub fn verify<'p, T: Transaction>(
        &self,
        policy: &'p Restrictions,
        token: &TokenHash,
        ctx: &VerifyContext,
        tx: &mut T,
    ) -> MytokenResult<Verdict<'p>> {
        if policy.is_empty() {
            return Ok(Verdict::Unrestricted);
        }
        for r in policy.iter() {
            if self.verify_element(r, token, ctx, tx)? {
                return Ok(Verdict::Matched(r));
            }
        }
        Ok(Verdict::Denied)
    }

    /// All clauses that currently verify, in policy order.
    pub fn valid_for<T: Transaction>(
        &self,
        policy: &Restrictions,
        token: &TokenHash,
        ctx: &VerifyContext,
        tx: &mut T,
    ) -> MytokenResult<Restrictions> {
        let mut valid = Vec::new();
        for r in policy.iter() {
            if self.verify_element(r, token, ctx, tx)? {
                valid.push(r.clone());
            }
        }
        Ok(Restrictions(valid))
    }
}

/// A restriction policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Restrictions(Vec<Restriction>);

impl Restrictions {
    pub fn new(clauses: Vec<Restriction>) -> Self {
        Self(clauses)
    }

    pub fn into_vec(self) -> Vec<Restriction> {
        self.0
    }

    pub fn push(&mut self, r: Restriction) {
        self.0.push(r);
    }

    /// Clauses whose scope is unset or covers every requested scope.
    pub fn with_scopes(&self, scopes: &[String]) -> Restrictions {
        if scopes.is_empty() {
            return self.clone();
        }
        self.filtered(|r| {
            r.scope.is_empty() || {
                let have = r.scopes();
                scopes.iter().all(|s| have.contains(s.as_str()))
            }
        })
    }

    /// Clauses whose audiences are unset or cover every requested audience.
    pub fn with_audiences(&self, audiences: &[String]) -> Restrictions {
        if audiences.is_empty() {
            return self.clone();
        }
        self.filtered(|r| r.audiences.is_empty() || audiences.iter().all(|a| r.audiences.contains(a)))
    }

    fn filtered(&self, keep: impl Fn(&Restriction) -> bool) -> Restrictions {
        Restrictions(self.0.iter().filter(|r| keep(r)).cloned().collect())
    }

    /// Latest expiry over all clauses; unset if any clause never expires.
    pub fn expires_at(&self) -> UnixTime {
        if self.0.is_empty() || self.0.iter().any(|r| r.expires_at.is_unset()) {
            return UnixTime::UNSET;
        }
        self.0
            .iter()
            .map(|r| r.expires_at)
            .max()
            .unwrap_or(UnixTime::UNSET)
    }

    /// Earliest not-before over all clauses; unset if any clause has none.
    pub fn not_before(&self) -> UnixTime {
        if self.0.iter().any(|r| r.not_before.is_unset()) {
            return UnixTime::UNSET;
        }
        self.0
            .iter()
            .map(|r| r.not_before)
            .min()
            .unwrap_or(UnixTime::UNSET)
    }

    /// Union of all scopes named by any clause.
    pub fn scopes(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.0.iter().flat_map(|r| r.scopes()).collect();
        set.into_iter().map(str::to_string).collect()
    }

    /// Union of all audiences named by any clause.
    pub fn audiences(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .0
            .iter()
            .flat_map(|r| r.audiences.iter().map(String::as_str))
            .collect();
        set.into_iter().map(str::to_string).collect()
    }

    /// Strip every scope the provider did not grant from each clause. A
    /// clause without scopes stays unrestricted. An empty `max` means the
    /// provider did not report its grant and leaves the policy untouched.
    pub fn set_max_scopes(&mut self, max: &[String]) {
        if max.is_empty() {
            return;
        }
        for r in self.0.iter_mut() {
            let kept: Vec<&str> = r
                .scope
                .split_whitespace()
                .filter(|s| max.iter().any(|m| m == s))
                .collect();
            r.scope = kept.join(" ");
        }
    }

    /// Strip every audience the provider did not grant from each clause.
    pub fn set_max_audiences(&mut self, max: &[String]) {
        if max.is_empty() {
            return;
        }
        for r in self.0.iter_mut() {
            r.audiences.retain(|a| max.contains(a));
        }
    }

    /// Clamp every clause to expire within `max_lifetime` seconds of `now`.
    /// Returns whether anything changed. `0` disables the clamp.
    pub fn enforce_max_lifetime(&mut self, max_lifetime: u64, now: UnixTime) -> bool {
        if max_lifetime == 0 {
            return false;
        }
        let exp = now.plus_secs(max_lifetime);
        if self.0.is_empty() {
            self.0.push(Restriction {
                expires_at: exp,
                ..Default::default()
            });
            return true;
        }
        let mut changed = false;
        for r in &mut self.0 {
            if r.expires_at.is_unset() || r.expires_at > exp {
                r.expires_at = exp;
                changed = true;
            }
        }
        changed
    }

    /// Replace the special host `this` with the requesting address.
    pub fn replace_this_ip(&mut self, client_ip: IpAddr) {
        let ip = client_ip.to_string();
        for r in &mut self.0 {
            for host in r.hosts.iter_mut().filter(|h| h.as_str() == "this") {
                *host = ip.clone();
            }
        }
    }

    /// Reset keys this deployment does not support.
    pub fn clear_disabled_keys(&mut self, disabled: &[RestrictionKey]) {
        for r in &mut self.0 {
            for key in disabled {
                r.clear_key(*key);
            }
        }
    }
}

impl Deref for Restrictions {
    type Target = [Restriction];

    fn deref(&self) -> &[Restriction] {
        &self.0
    }
}

impl From<Vec<Restriction>> for Restrictions {
    fn from(v: Vec<Restriction>) -> Self {
        Self(v)
    }
}

impl FromIterator<Restriction> for Restrictions {
    fn from_iter<I: IntoIterator<Item = Restriction>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Restrictions {
    type Item = Restriction;
    type IntoIter = std::vec::IntoIter<Restriction>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
