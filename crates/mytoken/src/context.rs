use mytoken_core::{Purpose, UnixTime};
use mytoken_policy::VerifyContext;
use std::net::IpAddr;

/// Per-request environment supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub now: UnixTime,
    pub client_ip: IpAddr,
}

impl RequestContext {
    pub fn new(client_ip: IpAddr) -> Self {
        Self::at(UnixTime::now(), client_ip)
    }

    pub fn at(now: UnixTime, client_ip: IpAddr) -> Self {
        Self { now, client_ip }
    }

    pub(crate) fn verify_ctx(&self, purpose: Purpose) -> VerifyContext {
        VerifyContext {
            now: self.now,
            client_ip: self.client_ip,
            purpose,
        }
    }
}
