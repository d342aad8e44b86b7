//! Join-token verification

pub mod token;

pub use token::{JoinClaims, TokenManager};
