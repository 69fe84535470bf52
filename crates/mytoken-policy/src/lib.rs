//! mytoken-policy: what a mytoken may do, and under which conditions
//!
//! # Overview
//! - `restrictions`: OR-policies over time windows, scopes, audiences, hosts,
//!   GeoIP and usage budgets, plus the tightening order used on derivation
//! - `capabilities`: capability sets (AND for checks, subset for derivation)
//! - `rotation`: per-token rotation settings

pub mod capabilities;
pub mod restrictions;
pub mod rotation;

pub use capabilities::{known_capabilities, Capabilities, Capability};
pub use restrictions::geoip::{GeoIpLookup, NoGeoIp, StaticGeoIp};
pub use restrictions::hosts::{HostResolver, NoResolver, StaticResolver};
pub use restrictions::{
    tighten, Restriction, RestrictionVerifier, Restrictions, Tightened, Verdict, VerifyContext,
};
pub use rotation::RotationConfig;
