//! The pluggable storage seam behind [`SessionStore`](crate::SessionStore).

use std::time::Duration;

use async_trait::async_trait;
use poto_codec::Value;
use poto_core::context::RequestContext;

use crate::{SessionError, SessionRecord};

/// Active-session statistics. Backends that cannot enumerate their
/// principals report zero sessions and an empty list.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub principals: Vec<String>,
}

/// Storage backend for session records.
///
/// The context gives serializing backends access to the request (cookie
/// reads) and the response-header buffer (cookie writes); the in-memory
/// backend ignores it.
#[async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    async fn load(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<Option<SessionRecord>, SessionError>;

    async fn store(
        &self,
        ctx: &RequestContext,
        record: SessionRecord,
    ) -> Result<(), SessionError>;

    async fn delete(&self, ctx: &RequestContext, principal_id: &str) -> Result<(), SessionError>;

    /// Write one key. The default is read-mutate-write, which is all a
    /// cookie can do (the last response written wins); backends with
    /// shared state override this with an atomic critical section.
    async fn set_value(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), SessionError> {
        let mut record = self
            .load(ctx, principal_id)
            .await?
            .unwrap_or_else(|| SessionRecord::new(principal_id));
        record.data.insert(key.to_string(), value);
        self.store(ctx, record).await
    }

    /// Evict sessions idle for longer than `age`; returns the count.
    /// Backends without enumeration evict nothing.
    async fn cleanup_older_than(&self, _age: Duration) -> usize {
        0
    }

    fn stats(&self) -> SessionStats {
        SessionStats::default()
    }
}
