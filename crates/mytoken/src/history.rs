//! Per-token event history.

use std::net::IpAddr;

use mytoken_core::{MytokenError, MytokenResult, TokenHash, UnixTime};
use mytoken_policy::Capability;
use mytoken_store::{EventRecord, TokenEvent, Transaction};
use secrecy::SecretString;

use crate::context::RequestContext;
use crate::service::MytokenService;

pub(crate) fn record_event<T: Transaction>(
    tx: &mut T,
    token: &TokenHash,
    event: TokenEvent,
    comment: &str,
    ip: Option<IpAddr>,
    now: UnixTime,
) -> MytokenResult<()> {
    tx.append_event(EventRecord {
        token_id: token.clone(),
        event,
        comment: comment.to_string(),
        ip: ip.map(|ip| ip.to_string()),
        time: now,
    })?;
    Ok(())
}

impl MytokenService {
    /// Events recorded for the presented token, oldest first.
    pub fn history<T: Transaction>(
        &self,
        tx: &mut T,
        presented: &SecretString,
        ctx: &RequestContext,
    ) -> MytokenResult<Vec<EventRecord>> {
        let auth = self.authenticate(tx, presented, ctx.now)?;
        if !auth
            .token
            .claims
            .capabilities
            .has_all(&[Capability::TOKENINFO_HISTORY])
        {
            return Err(MytokenError::policy_denied(
                "token lacks the tokeninfo_history capability",
            ));
        }
        Ok(tx.list_events(auth.token.id())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mytoken_store::{MemoryStore, Store};
    use std::net::Ipv4Addr;

    #[test]
    fn test_record_event_keeps_ip_and_comment() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let token = TokenHash::from_stored("t");
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9));
        record_event(&mut tx, &token, TokenEvent::AccessTokenIssued, "ci job", Some(ip), UnixTime(5))
            .unwrap();
        record_event(&mut tx, &token, TokenEvent::TransferCodeUsed, "", None, UnixTime(6)).unwrap();

        let events = tx.list_events(&token).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].comment, "ci job");
        assert_eq!(events[0].ip.as_deref(), Some("192.0.2.9"));
        assert_eq!(events[1].event, TokenEvent::TransferCodeUsed);
        assert!(events[1].ip.is_none());
    }
}
