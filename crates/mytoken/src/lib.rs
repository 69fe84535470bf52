//! mytoken: the credential lifecycle on top of policies, envelopes and storage
//!
//! A mytoken is a bearer credential standing in for an upstream OIDC refresh
//! token. Tokens form trees: a root is minted from a fresh refresh token and
//! every derived token is at most as powerful as its parent, shares its
//! refresh token, and dies with it on cascading revocation.
//!
//! # Overview
//! - `service`: [`MytokenService`] with mint, derive, rotate, revoke,
//!   authenticate and response shaping
//! - `access`: exchanging a mytoken for an upstream access token
//! - `token`: signed bearer representation
//! - `custody`: the wrapped data key chain guarding the refresh token
//! - `proxy`: short tokens, transfer codes and polling codes
//! - `revocation`, `tree`, `gc`: lineage deletion, listings and cleanup
//! - `history`: per-token event log

pub mod access;
pub mod context;
pub mod custody;
pub mod gc;
pub mod history;
pub mod oidc;
pub mod proxy;
pub mod revocation;
pub mod service;
pub mod token;
pub mod tree;

pub use access::{AccessTokenGrant, AccessTokenRequest};
pub use context::RequestContext;
pub use custody::Custody;
pub use gc::{collect_garbage, GcReport};
pub use oidc::{OidcProvider, ProviderTokens};
pub use proxy::{ProxyTokens, Resolved, TransferCodeStatus, UniversalMytoken};
pub use revocation::{is_revoked, revocation_status, revoke_lineage, RevocationStatus, Revoked};
pub use service::{
    kdf_params, transact, Authenticated, DeriveRequest, Derived, Exchanged, MintRequest, MytokenResponse,
    MytokenService,
};
pub use token::{IssuedMytoken, MytokenClaims, TokenSigner};
pub use tree::{reconstruct_tree, subtree, token_tree, TokenTree};
