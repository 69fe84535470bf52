pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod types;

pub use error::{MytokenError, MytokenResult};
pub use id::{TokenHash, TokenId};
pub use types::{Purpose, ResponseType, RestrictionKey, UnixTime};
