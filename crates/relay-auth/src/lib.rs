//! Credential gate for the relay: JWT issue/validate, bearer extraction and
//! password hashing.

pub mod bearer;
pub mod config;
pub mod errors;
pub mod gate;
pub mod password;

pub use bearer::bearer_from_parts;
pub use config::AuthConfig;
pub use errors::AuthError;
pub use gate::{Claims, IdentityGate, TokenKind};
