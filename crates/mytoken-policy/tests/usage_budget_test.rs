//! Integration tests: usage budgets persisted through the reference store
//!
//! Usage counts must survive across transactions and be rolled back with
//! the transaction that recorded them.

use mytoken_core::{Purpose, TokenHash, UnixTime};
use mytoken_policy::{
    NoGeoIp, NoResolver, Restriction, RestrictionVerifier, Restrictions, VerifyContext,
};
use mytoken_store::{transact, MemoryStore, Store, StoreError, Transaction};

fn ctx(purpose: Purpose) -> VerifyContext {
    VerifyContext {
        now: UnixTime(1_000),
        client_ip: "192.0.2.10".parse().unwrap(),
        purpose,
    }
}

fn budget_policy(at: u64) -> Restrictions {
    Restrictions::new(vec![Restriction {
        expires_at: UnixTime(2_000),
        usages_at: Some(at),
        ..Default::default()
    }])
}

fn use_once(store: &MemoryStore, policy: &Restrictions, token: &TokenHash) -> bool {
    let verifier = RestrictionVerifier::new(&NoResolver, &NoGeoIp);
    transact(store, |tx| -> Result<bool, StoreError> {
        let verdict = verifier
            .verify(policy, token, &ctx(Purpose::AccessToken), tx)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match verdict.matched() {
            Some(r) => r
                .consume_usage(tx, token, Purpose::AccessToken)
                .map_err(|e| StoreError::Backend(e.to_string())),
            None => Ok(verdict.is_usable()),
        }
    })
    .unwrap()
}

#[test]
fn fourth_use_of_three_is_denied() {
    let store = MemoryStore::new();
    let token = TokenHash::from_stored("tok-a");
    let policy = budget_policy(3);

    assert!(use_once(&store, &policy, &token));
    assert!(use_once(&store, &policy, &token));
    assert!(use_once(&store, &policy, &token));
    assert!(!use_once(&store, &policy, &token));

    // budgets are per token
    let other = TokenHash::from_stored("tok-b");
    assert!(use_once(&store, &policy, &other));
}

#[test]
fn rolled_back_use_is_not_counted() {
    let store = MemoryStore::new();
    let token = TokenHash::from_stored("tok-a");
    let policy = budget_policy(1);

    {
        let mut tx = store.begin().unwrap();
        assert!(policy[0]
            .consume_usage(&mut tx, &token, Purpose::AccessToken)
            .unwrap());
        tx.rollback().unwrap();
    }
    assert!(use_once(&store, &policy, &token));
    assert!(!use_once(&store, &policy, &token));
}

#[test]
fn changed_clause_starts_a_fresh_count() {
    let store = MemoryStore::new();
    let token = TokenHash::from_stored("tok-a");

    assert!(use_once(&store, &budget_policy(1), &token));
    assert!(!use_once(&store, &budget_policy(1), &token));
    // a different clause hashes differently
    assert!(use_once(&store, &budget_policy(2), &token));
}

#[test]
fn expired_clause_is_denied_even_with_budget() {
    let store = MemoryStore::new();
    let token = TokenHash::from_stored("tok-a");
    let policy = Restrictions::new(vec![Restriction {
        expires_at: UnixTime(1_000),
        usages_at: Some(5),
        ..Default::default()
    }]);
    assert!(!use_once(&store, &policy, &token));
}
