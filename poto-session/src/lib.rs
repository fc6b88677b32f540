//! Per-principal key-value session state.
//!
//! The [`SessionStore`] front-end takes the current principal from the
//! request context; callers never name it. Storage is pluggable through
//! [`SessionBackend`]: a process-wide in-memory map, or a signed and
//! encrypted cookie round-tripped through the request/response pair held
//! by the context.

pub mod backend;
pub mod cookie;
pub mod memory;
mod record;

use std::sync::Arc;
use std::time::Duration;

use poto_codec::{CodecError, Value};
use poto_core::context::{ContextError, RequestContext};
use poto_core::error::RpcError;

pub use backend::{SessionBackend, SessionStats};
pub use cookie::CookieSessionBackend;
pub use memory::MemorySessionBackend;
pub use record::SessionRecord;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "poto_session";

/// Errors surfaced by session operations.
#[derive(Debug)]
pub enum SessionError {
    /// No request context is active; a programming error (HTTP 500).
    NoContext,
    /// The request is unauthenticated; session writes need a principal.
    NoPrincipal,
    /// The serialized session exceeds its ceiling.
    SizeLimit { actual: usize, max: usize },
    /// The session record could not be encoded or decoded.
    Codec(CodecError),
    /// Key derivation or AEAD failure in the cookie backend.
    Crypto(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NoContext => write!(f, "No request context is active"),
            SessionError::NoPrincipal => {
                write!(f, "Session writes require an authenticated principal")
            }
            SessionError::SizeLimit { actual, max } => {
                write!(f, "Session of {actual} bytes exceeds the limit of {max}")
            }
            SessionError::Codec(err) => write!(f, "Session codec failure: {err}"),
            SessionError::Crypto(msg) => write!(f, "Session crypto failure: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        SessionError::Codec(err)
    }
}

impl From<ContextError> for SessionError {
    fn from(_: ContextError) -> Self {
        SessionError::NoContext
    }
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        RpcError::Internal(err.to_string())
    }
}

/// Per-principal session state, accessed through the request context.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self { backend }
    }

    fn current_ctx() -> Result<RequestContext, SessionError> {
        Ok(RequestContext::current()?)
    }

    /// The current principal's session record, if one exists.
    pub async fn get_session(&self) -> Result<Option<SessionRecord>, SessionError> {
        let ctx = Self::current_ctx()?;
        let Some(principal_id) = ctx.principal_id().map(String::from) else {
            return Ok(None);
        };
        self.backend.load(&ctx, &principal_id).await
    }

    /// Replace the current principal's session record. The record's
    /// principal identifier is taken from the carrier.
    pub async fn set_session(&self, mut record: SessionRecord) -> Result<(), SessionError> {
        let ctx = Self::current_ctx()?;
        let Some(principal_id) = ctx.principal_id().map(String::from) else {
            return Err(SessionError::NoPrincipal);
        };
        record.principal_id = principal_id;
        self.backend.store(&ctx, record).await
    }

    /// Delete the current principal's session.
    pub async fn delete_session(&self) -> Result<(), SessionError> {
        let ctx = Self::current_ctx()?;
        let Some(principal_id) = ctx.principal_id().map(String::from) else {
            return Ok(());
        };
        self.backend.delete(&ctx, &principal_id).await
    }

    /// A single value from the current session, or absent.
    pub async fn get_value(&self, key: &str) -> Result<Option<Value>, SessionError> {
        let session = self.get_session().await?;
        Ok(session.and_then(|record| record.data.get(key).cloned()))
    }

    /// Write a single value into the current session, creating the record
    /// on first write. Atomic per principal on backends that support it.
    pub async fn set_value(&self, key: &str, value: Value) -> Result<(), SessionError> {
        let ctx = Self::current_ctx()?;
        let Some(principal_id) = ctx.principal_id().map(String::from) else {
            return Err(SessionError::NoPrincipal);
        };
        self.backend
            .set_value(&ctx, &principal_id, key, value)
            .await
    }

    /// Evict sessions idle for longer than `age`. Returns the eviction
    /// count; backends without enumeration evict nothing.
    pub async fn cleanup_older_than(&self, age: Duration) -> usize {
        self.backend.cleanup_older_than(age).await
    }

    /// Active-session statistics. Backends that cannot enumerate report
    /// zero sessions and an empty principal list.
    pub fn stats(&self) -> SessionStats {
        self.backend.stats()
    }
}
