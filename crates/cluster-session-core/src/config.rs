//! Centralized configuration for the cluster session store.
//!
//! Compile-time limits live on [`IpcConfig`]. Per-deployment settings live on
//! [`SessionConfig`], which is usually read from the environment at process
//! start with [`SessionConfig::from_env`].

use crate::backoff::BackoffConfig;
use crate::{Result, SessionError};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// IPC limits and defaults.
pub struct IpcConfig;

impl IpcConfig {
    /// Largest frame payload accepted by either end.
    pub const MAX_IPC_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
    /// Timeout for a single connect attempt to the coordinator socket.
    pub const IPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// `sun_path` is 104 bytes on macOS and 108 on Linux; use the smaller one.
    pub const MAX_SOCKET_PATH: usize = 104;
    pub const DEFAULT_SOCKET_PATH: &'static str = "/tmp/memstore.sock";
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
    /// Depth of the per-connection outbound queue.
    pub const OUTBOUND_QUEUE_DEPTH: usize = 256;
}

/// Environment variables read by [`SessionConfig::from_env`].
pub struct EnvVars;

impl EnvVars {
    pub const ROLE: &'static str = "CLUSTER_SESSION_ROLE";
    pub const SOCKET: &'static str = "CLUSTER_SESSION_SOCKET";
    pub const TIMEOUT_MS: &'static str = "CLUSTER_SESSION_TIMEOUT_MS";
    pub const TTL_SECS: &'static str = "CLUSTER_SESSION_TTL_SECS";
    pub const SWEEP_SECS: &'static str = "CLUSTER_SESSION_SWEEP_SECS";
}

/// Which part this process plays in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Owns the session table and serves peers over the socket.
    Coordinator,
    /// Forwards every operation to the coordinator.
    Peer,
    /// Single-worker deployment: owns a private table, no IPC.
    #[default]
    Standalone,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Peer => "peer",
            Role::Standalone => "standalone",
        }
    }

    /// Whether this role holds the session table in-process.
    pub fn owns_store(&self) -> bool {
        !matches!(self, Role::Peer)
    }
}

impl FromStr for Role {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "coordinator" => Ok(Role::Coordinator),
            "peer" => Ok(Role::Peer),
            "standalone" => Ok(Role::Standalone),
            other => Err(SessionError::Config {
                message: format!(
                    "unknown role '{}', expected coordinator, peer or standalone",
                    other
                ),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime configuration for one process.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub role: Role,
    pub socket_path: PathBuf,
    pub request_timeout: Duration,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
    pub reconnect: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            socket_path: PathBuf::from(IpcConfig::DEFAULT_SOCKET_PATH),
            request_timeout: IpcConfig::DEFAULT_REQUEST_TIMEOUT,
            default_ttl: IpcConfig::DEFAULT_SESSION_TTL,
            sweep_interval: IpcConfig::DEFAULT_SWEEP_INTERVAL,
            reconnect: BackoffConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    /// Read configuration from the process environment.
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(role) = lookup(EnvVars::ROLE) {
            config.role = role.parse()?;
        }
        if let Some(path) = lookup(EnvVars::SOCKET) {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(ms) = lookup(EnvVars::TIMEOUT_MS) {
            config.request_timeout = Duration::from_millis(parse_positive(EnvVars::TIMEOUT_MS, &ms)?);
        }
        if let Some(secs) = lookup(EnvVars::TTL_SECS) {
            config.default_ttl = Duration::from_secs(parse_positive(EnvVars::TTL_SECS, &secs)?);
        }
        if let Some(secs) = lookup(EnvVars::SWEEP_SECS) {
            config.sweep_interval = Duration::from_secs(parse_positive(EnvVars::SWEEP_SECS, &secs)?);
        }

        Ok(config)
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Reject settings that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("request_timeout", self.request_timeout),
            ("default_ttl", self.default_ttl),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(SessionError::Config {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }

        if self.role != Role::Standalone {
            let len = self.socket_path.as_os_str().len();
            if len == 0 || len >= IpcConfig::MAX_SOCKET_PATH {
                return Err(SessionError::Config {
                    message: format!(
                        "socket path must be 1..{} bytes, got {}: {}",
                        IpcConfig::MAX_SOCKET_PATH,
                        len,
                        self.socket_path.display()
                    ),
                });
            }
        }

        Ok(())
    }
}

fn parse_positive(name: &str, value: &str) -> Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(SessionError::Config {
            message: format!("{} must be greater than zero", name),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(SessionError::Config {
            message: format!("{}='{}' is not a valid integer: {}", name, value, e),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_role_roundtrip() {
        for role in [Role::Coordinator, Role::Peer, Role::Standalone] {
            let parsed: Role = role.as_str().parse().expect("Should parse");
            assert_eq!(role, parsed);
        }
        assert_eq!(" Peer ".parse::<Role>().unwrap(), Role::Peer);
        assert!("primary".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_owns_store() {
        assert!(Role::Coordinator.owns_store());
        assert!(Role::Standalone.owns_store());
        assert!(!Role::Peer.owns_store());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = SessionConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.role, Role::Standalone);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/memstore.sock"));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = SessionConfig::from_lookup(lookup_from(&[
            (EnvVars::ROLE, "coordinator"),
            (EnvVars::SOCKET, "/run/app/sessions.sock"),
            (EnvVars::TIMEOUT_MS, "750"),
            (EnvVars::TTL_SECS, "3600"),
            (EnvVars::SWEEP_SECS, "15"),
        ]))
        .unwrap();

        assert_eq!(config.role, Role::Coordinator);
        assert_eq!(config.socket_path, PathBuf::from("/run/app/sessions.sock"));
        assert_eq!(config.request_timeout, Duration::from_millis(750));
        assert_eq!(config.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = SessionConfig::from_lookup(lookup_from(&[(EnvVars::TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, SessionError::Config { .. }));

        let err = SessionConfig::from_lookup(lookup_from(&[(EnvVars::SWEEP_SECS, "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_validate_socket_path_length() {
        let long = format!("/tmp/{}.sock", "x".repeat(200));
        let config = SessionConfig::new(Role::Coordinator).with_socket_path(long.clone());
        assert!(config.validate().is_err());

        // Standalone never touches the socket.
        let config = SessionConfig::new(Role::Standalone).with_socket_path(long);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_durations() {
        let config = SessionConfig::default().with_request_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
