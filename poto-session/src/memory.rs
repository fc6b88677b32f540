//! Process-wide in-memory session backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use poto_codec::Value;
use poto_core::context::RequestContext;
use tracing::debug;

use crate::backend::{SessionBackend, SessionStats};
use crate::{SessionError, SessionRecord};

/// In-memory backend: one record per principal. Each record's critical
/// sections run under its map entry, so concurrent writers for the same
/// principal serialize and never produce a corrupted composite.
#[derive(Default)]
pub struct MemorySessionBackend {
    sessions: DashMap<String, SessionRecord>,
    max_idle: Duration,
}

impl MemorySessionBackend {
    pub fn new(max_idle: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_idle,
        }
    }

    fn expired(&self, record: &SessionRecord) -> bool {
        record.idle_age(Utc::now()) > self.max_idle
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn load(
        &self,
        _ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<Option<SessionRecord>, SessionError> {
        if let Some(record) = self.sessions.get(principal_id) {
            if self.expired(&record) {
                drop(record);
                self.sessions.remove(principal_id);
                debug!(principal = principal_id, "evicted idle session on load");
                return Ok(None);
            }
        }
        Ok(self.sessions.get_mut(principal_id).map(|mut record| {
            record.touch();
            record.clone()
        }))
    }

    async fn store(
        &self,
        _ctx: &RequestContext,
        mut record: SessionRecord,
    ) -> Result<(), SessionError> {
        record.touch();
        self.sessions.insert(record.principal_id.clone(), record);
        Ok(())
    }

    async fn delete(
        &self,
        _ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<(), SessionError> {
        self.sessions.remove(principal_id);
        Ok(())
    }

    async fn set_value(
        &self,
        _ctx: &RequestContext,
        principal_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), SessionError> {
        // The entry guard is the per-principal critical section: read,
        // mutate, and store happen under it.
        let mut entry = self
            .sessions
            .entry(principal_id.to_string())
            .or_insert_with(|| SessionRecord::new(principal_id));
        if self.expired(&entry) {
            *entry = SessionRecord::new(principal_id);
        }
        entry.data.insert(key.to_string(), value);
        entry.touch();
        Ok(())
    }

    async fn cleanup_older_than(&self, age: Duration) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, record| record.idle_age(now) <= age);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            debug!(evicted, "session cleanup pass");
        }
        evicted
    }

    fn stats(&self) -> SessionStats {
        let principals: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        SessionStats {
            active_sessions: principals.len(),
            principals,
        }
    }
}
