//! In-memory session table.
//!
//! [`MemoryStore`] is the single authoritative owner of session records. It is
//! used directly in standalone mode and sits behind the coordinator's socket in
//! clustered mode. Every operation takes the table lock for the duration of one
//! map access, so concurrent writers to the same id see last-writer-wins and a
//! record is never observed half-updated.

use crate::{Result, SessionError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

/// Longest TTL honoured; larger requests are clamped.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// One session as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    /// Opaque data attached by the session middleware.
    pub payload: Value,
    pub expires_at: Instant,
    pub last_touched_at: Instant,
}

impl SessionRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Mutex-guarded session table with TTL expiry.
#[derive(Debug)]
pub struct MemoryStore {
    table: Mutex<HashMap<String, SessionRecord>>,
    default_ttl: Duration,
}

impl MemoryStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn expiry(&self, now: Instant, ttl: Option<Duration>) -> Instant {
        now + ttl.unwrap_or(self.default_ttl).min(MAX_SESSION_TTL)
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, HashMap<String, SessionRecord>>> {
        self.table
            .lock()
            .map_err(|_| SessionError::Internal("session table lock poisoned".to_string()))
    }

    /// Fetch a live record, refreshing its `last_touched_at`.
    ///
    /// Expired records are removed on the way out and reported as absent.
    pub fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let now = Instant::now();
        let mut table = self.lock_table()?;

        match table.get_mut(id) {
            Some(record) if record.is_expired(now) => {
                table.remove(id);
                Ok(None)
            }
            Some(record) => {
                record.last_touched_at = now;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace a record. `None` applies the store's default TTL.
    pub fn set(&self, id: &str, payload: Value, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let record = SessionRecord {
            id: id.to_string(),
            payload,
            expires_at: self.expiry(now, ttl),
            last_touched_at: now,
        };

        self.lock_table()?.insert(id.to_string(), record);
        Ok(())
    }

    /// Remove a record. Removing a missing id is not an error.
    pub fn destroy(&self, id: &str) -> Result<()> {
        self.lock_table()?.remove(id);
        Ok(())
    }

    /// Extend a live record's expiry without touching its payload.
    pub fn touch(&self, id: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let mut table = self.lock_table()?;

        match table.get_mut(id) {
            Some(record) if !record.is_expired(now) => {
                record.expires_at = self.expiry(now, ttl);
                record.last_touched_at = now;
                Ok(())
            }
            Some(_) => {
                table.remove(id);
                Err(SessionError::NotFound {
                    session_id: id.to_string(),
                })
            }
            None => Err(SessionError::NotFound {
                session_id: id.to_string(),
            }),
        }
    }

    /// Number of live (unexpired) records.
    pub fn length(&self) -> Result<usize> {
        let now = Instant::now();
        let table = self.lock_table()?;
        Ok(table.values().filter(|r| !r.is_expired(now)).count())
    }

    /// Drop every record.
    pub fn clear(&self) -> Result<()> {
        self.lock_table()?.clear();
        Ok(())
    }

    /// Remove every expired record, returning how many were dropped.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut table = self.lock_table()?;
        let before = table.len();
        table.retain(|_, record| !record.is_expired(now));
        Ok(before - table.len())
    }
}

/// Handle to a running expiry sweeper. Dropping stops the sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    task_handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Periodically purge expired records from `store`.
///
/// The first sweep runs one full `interval` after spawning.
pub fn spawn_sweeper(store: Arc<MemoryStore>, interval: Duration) -> SweeperHandle {
    let task_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match store.sweep_expired() {
                Ok(0) => {}
                Ok(removed) => debug!("Swept {} expired sessions", removed),
                Err(e) => {
                    error!("Session sweep failed, stopping sweeper: {}", e);
                    break;
                }
            }
        }
    });

    SweeperHandle {
        task_handle: Some(task_handle),
    }
}
