//! Cluster Session - shared HTTP session storage for multi-process web servers.
//!
//! One process (the coordinator) owns an in-memory session table and serves it
//! over a Unix domain socket. Every other worker process (a peer) forwards its
//! session reads and writes to the coordinator, so a login handled by one
//! worker is visible to all of them. A single-process deployment skips the
//! socket entirely and keeps a private table.
//!
//! # Example
//!
//! ```rust,ignore
//! use cluster_session::{ClusterStore, Role, SessionConfig, SessionStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> cluster_session::Result<()> {
//!     let config = SessionConfig::from_env()?.with_role(Role::Peer);
//!     let sessions = ClusterStore::start(config).await?;
//!
//!     sessions.set("abc123", json!({"user": "alice"}), None).await?;
//!
//!     // Requests degrade to anonymous if the coordinator is unreachable
//!     let user = sessions.load_or_anonymous("abc123").await;
//!     println!("session: {:?}", user);
//!
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod ipc;
pub mod session_store;
pub mod store;

mod cluster;

// Re-export commonly used types
pub use backoff::BackoffConfig;
pub use cluster::ClusterStore;
pub use config::{EnvVars, IpcConfig, Role, SessionConfig};
pub use error::{Result, SessionError, Unavailable};
pub use ipc::{Coordinator, CoordinatorHandle, PeerClient};
pub use session_store::SessionStore;
pub use store::{spawn_sweeper, MemoryStore, SessionRecord, SweeperHandle, MAX_SESSION_TTL};
