use axum::response::{IntoResponse, Response};
use http::StatusCode;

/// Security-related errors for token validation and login.
#[derive(Debug)]
pub enum SecurityError {
    /// The JWT is invalid (malformed, bad signature, wrong claims).
    InvalidToken(String),

    /// The JWT has expired.
    TokenExpired,

    /// The principal named by the credential does not exist.
    UnknownPrincipal(String),

    /// The supplied password does not match the stored credential.
    BadCredentials,

    /// Password hashing failed.
    Hashing(String),
}

impl std::fmt::Display for SecurityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityError::InvalidToken(msg) => write!(f, "Invalid token: {msg}"),
            SecurityError::TokenExpired => write!(f, "Token expired"),
            SecurityError::UnknownPrincipal(id) => write!(f, "Unknown principal: {id}"),
            SecurityError::BadCredentials => write!(f, "Bad credentials"),
            SecurityError::Hashing(msg) => write!(f, "Password hashing failed: {msg}"),
        }
    }
}

impl std::error::Error for SecurityError {}

impl SecurityError {
    /// The short text body surfaced on 401 responses.
    pub fn public_message(&self) -> &'static str {
        match self {
            SecurityError::UnknownPrincipal(_) => "Unauthorized. User id not found.",
            SecurityError::BadCredentials => "Unauthorized. Bad credentials.",
            SecurityError::TokenExpired => "Unauthorized. Token expired.",
            _ => "Unauthorized.",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SecurityError::Hashing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        (self.status(), self.public_message()).into_response()
    }
}
