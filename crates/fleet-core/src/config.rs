//! Centralized runtime constants for the fleet core.
//!
//! Fleet configuration proper (apps, services, TLS paths) lives in
//! [`crate::manifest`]; this module only holds tunables.

use std::time::Duration;

/// Control-plane configuration.
pub struct ControlConfig;

impl ControlConfig {
    /// Extension that replaces the config file's extension to form the socket path.
    pub const SOCKET_SUFFIX: &'static str = "sock";
    /// Extension of the advisory lock file guarding elections.
    pub const LOCK_SUFFIX: &'static str = "lock";
    /// Windows named-pipe namespace prefix.
    pub const PIPE_PREFIX: &'static str = r"\\.\pipe\";

    pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    pub const READ_CHUNK_SIZE: usize = 4096;
    /// Upper bound on an unterminated control line before it is discarded.
    pub const MAX_LINE_BYTES: usize = 1024 * 1024;

    /// Environment variable carrying the absolute config path to spawned apps.
    pub const CONFIG_ENV_VAR: &'static str = "FLEET_CONFIG";
    /// Environment variable carrying the app name to spawned apps.
    pub const APP_ENV_VAR: &'static str = "FLEET_APP";
}

/// Data-plane (default transport) configuration.
pub struct RpcConfig;

impl RpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    pub const MAX_CONNECTIONS: usize = 256;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ControlConfig::HANDSHAKE_TIMEOUT >= ControlConfig::CONNECT_TIMEOUT);
        assert!(RpcConfig::DEFAULT_CONNECT_TIMEOUT > Duration::ZERO);
        assert!(ControlConfig::MAX_LINE_BYTES <= RpcConfig::MAX_MESSAGE_SIZE);
    }
}
