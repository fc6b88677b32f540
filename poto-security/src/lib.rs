//! Auth frontend for Poto: bearer credentials, visitor registration, and
//! the dispatcher-facing authenticator.

pub mod authenticator;
pub mod error;
pub mod login;
pub mod password;
pub mod token;

pub use authenticator::JwtAuthenticator;
pub use error::SecurityError;
pub use login::{login_router, AuthState};
pub use password::{generate_password, hash_password, verify_password};
pub use token::{Claims, TokenIssuer, DEFAULT_TOKEN_TTL};
