use std::collections::HashMap;
use std::net::IpAddr;

/// Country lookup for GeoIP restrictions.
pub trait GeoIpLookup {
    /// ISO 3166-1 alpha-2 code, if known.
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// Knows no country. Any non-empty allow list then rejects every address.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeoIp;

impl GeoIpLookup for NoGeoIp {
    fn country_code(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Fixed IP → country table.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoIp {
    countries: HashMap<IpAddr, String>,
}

impl StaticGeoIp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, country: impl Into<String>) -> Self {
        self.countries.insert(ip, country.into());
        self
    }
}

impl GeoIpLookup for StaticGeoIp {
    fn country_code(&self, ip: IpAddr) -> Option<String> {
        self.countries.get(&ip).cloned()
    }
}

fn contains_code(list: &[String], code: &str) -> bool {
    list.iter().any(|c| c.eq_ignore_ascii_case(code))
}

pub(crate) fn country_allowed(
    ip: IpAddr,
    allow: &[String],
    disallow: &[String],
    geoip: &dyn GeoIpLookup,
) -> bool {
    if allow.is_empty() && disallow.is_empty() {
        return true;
    }
    let country = geoip.country_code(ip);
    if !allow.is_empty() {
        match &country {
            Some(code) if contains_code(allow, code) => {}
            _ => return false,
        }
    }
    match &country {
        Some(code) => !contains_code(disallow, code),
        None => true,
    }
}
