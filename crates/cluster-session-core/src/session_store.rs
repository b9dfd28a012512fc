//! The store interface consumed by session middleware.
//!
//! Implemented identically by the in-process [`MemoryStore`], the
//! [`PeerClient`](crate::ipc::PeerClient) adapter, and the mode-selected
//! [`ClusterStore`](crate::ClusterStore).

use crate::store::MemoryStore;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Session storage backend.
///
/// `ttl: None` applies the backend's default session TTL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session payload. Missing and expired sessions are `None`.
    async fn get(&self, session_id: &str) -> Result<Option<Value>>;

    /// Create or replace a session.
    async fn set(&self, session_id: &str, payload: Value, ttl: Option<Duration>) -> Result<()>;

    /// Remove a session. Removing a missing session succeeds.
    async fn destroy(&self, session_id: &str) -> Result<()>;

    /// Extend a session's expiry. Fails with `NotFound` if it does not exist.
    async fn touch(&self, session_id: &str, ttl: Option<Duration>) -> Result<()>;

    /// Number of live sessions.
    async fn length(&self) -> Result<usize>;

    /// Remove every session.
    async fn clear(&self) -> Result<()>;

    /// Fetch a payload, treating any failure as an anonymous session.
    async fn load_or_anonymous(&self, session_id: &str) -> Option<Value> {
        match self.get(session_id).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    "Session {} unavailable, continuing unauthenticated: {}",
                    session_id, e
                );
                None
            }
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, session_id: &str) -> Result<Option<Value>> {
        Ok(MemoryStore::get(self, session_id)?.map(|record| record.payload))
    }

    async fn set(&self, session_id: &str, payload: Value, ttl: Option<Duration>) -> Result<()> {
        MemoryStore::set(self, session_id, payload, ttl)
    }

    async fn destroy(&self, session_id: &str) -> Result<()> {
        MemoryStore::destroy(self, session_id)
    }

    async fn touch(&self, session_id: &str, ttl: Option<Duration>) -> Result<()> {
        MemoryStore::touch(self, session_id, ttl)
    }

    async fn length(&self) -> Result<usize> {
        MemoryStore::length(self)
    }

    async fn clear(&self) -> Result<()> {
        MemoryStore::clear(self)
    }
}
