//! Bearer-token storage/refresh and the signed-in session built on it.

mod session;
mod token;

pub use self::session::Session;
pub use self::token::{is_token_expired, TokenError, TokenLookup, TokenService};

#[cfg(test)]
pub(crate) use self::token::tests;
