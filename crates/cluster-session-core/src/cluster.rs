//! Deployment mode selection.
//!
//! [`ClusterStore`] is the one value a web worker holds for session storage.
//! Internally it runs in one of three roles, chosen once from
//! [`SessionConfig::role`] at startup:
//!
//! - **Standalone**: private in-process table, no socket.
//! - **Coordinator**: owns the table, serves peers on the socket, and reads
//!   and writes the table directly for its own requests.
//! - **Peer**: forwards everything to the coordinator.
//!
//! The role is transparent to callers; every role implements [`SessionStore`].

use crate::config::{Role, SessionConfig};
use crate::ipc::{Coordinator, CoordinatorHandle, PeerClient};
use crate::session_store::SessionStore;
use crate::store::{spawn_sweeper, MemoryStore, SweeperHandle};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Session store for one process, in whichever role it was configured for.
#[derive(Debug)]
pub struct ClusterStore {
    config: SessionConfig,
    inner: StoreInner,
}

#[derive(Debug)]
enum StoreInner {
    Standalone {
        store: Arc<MemoryStore>,
        sweeper: SweeperHandle,
    },
    Coordinator {
        store: Arc<MemoryStore>,
        sweeper: SweeperHandle,
        server: CoordinatorHandle,
    },
    Peer(PeerClient),
}

impl ClusterStore {
    /// Start in the role named by `config`.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let inner = match config.role {
            Role::Standalone => {
                let store = Arc::new(MemoryStore::new(config.default_ttl));
                let sweeper = spawn_sweeper(store.clone(), config.sweep_interval);
                StoreInner::Standalone { store, sweeper }
            }
            Role::Coordinator => {
                let store = Arc::new(MemoryStore::new(config.default_ttl));
                let server = Coordinator::start(config.socket_path.clone(), store.clone()).await?;
                let sweeper = spawn_sweeper(store.clone(), config.sweep_interval);
                StoreInner::Coordinator {
                    store,
                    sweeper,
                    server,
                }
            }
            Role::Peer => StoreInner::Peer(PeerClient::connect(&config).await?),
        };

        info!(
            "Session store started as {} (ttl {:?}, timeout {:?})",
            config.role, config.default_ttl, config.request_timeout
        );

        Ok(Self { config, inner })
    }

    /// Start with configuration read from the environment.
    pub async fn from_env() -> Result<Self> {
        Self::start(SessionConfig::from_env()?).await
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self.inner, StoreInner::Coordinator { .. })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The in-process table, for roles that own one.
    pub fn local_store(&self) -> Option<&Arc<MemoryStore>> {
        match &self.inner {
            StoreInner::Standalone { store, .. } | StoreInner::Coordinator { store, .. } => {
                Some(store)
            }
            StoreInner::Peer(_) => None,
        }
    }

    /// The socket server, when running as coordinator.
    pub fn coordinator(&self) -> Option<&CoordinatorHandle> {
        match &self.inner {
            StoreInner::Coordinator { server, .. } => Some(server),
            _ => None,
        }
    }

    /// The coordinator connection, when running as peer.
    pub fn peer(&self) -> Option<&PeerClient> {
        match &self.inner {
            StoreInner::Peer(client) => Some(client),
            _ => None,
        }
    }

    /// Stop background work. A coordinator closes its socket and every peer
    /// connection; peers see that as connection loss.
    pub fn shutdown(&mut self) {
        match &mut self.inner {
            StoreInner::Standalone { sweeper, .. } => sweeper.stop(),
            StoreInner::Coordinator {
                sweeper, server, ..
            } => {
                sweeper.stop();
                server.shutdown();
            }
            StoreInner::Peer(_) => {}
        }
    }

    fn backend(&self) -> &dyn SessionStore {
        match &self.inner {
            StoreInner::Standalone { store, .. } | StoreInner::Coordinator { store, .. } => {
                store.as_ref()
            }
            StoreInner::Peer(client) => client,
        }
    }
}

#[async_trait]
impl SessionStore for ClusterStore {
    async fn get(&self, session_id: &str) -> Result<Option<Value>> {
        self.backend().get(session_id).await
    }

    async fn set(&self, session_id: &str, payload: Value, ttl: Option<Duration>) -> Result<()> {
        self.backend().set(session_id, payload, ttl).await
    }

    async fn destroy(&self, session_id: &str) -> Result<()> {
        self.backend().destroy(session_id).await
    }

    async fn touch(&self, session_id: &str, ttl: Option<Duration>) -> Result<()> {
        self.backend().touch(session_id, ttl).await
    }

    async fn length(&self) -> Result<usize> {
        self.backend().length().await
    }

    async fn clear(&self) -> Result<()> {
        self.backend().clear().await
    }
}
