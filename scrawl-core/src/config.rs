//! Sync engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy used to resolve conflicts automatically when the resolution
/// ladder reaches its fallback step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Keep whichever side has the later update timestamp.
    LastWriteWins,
    /// Always keep the local version.
    PreferLocal,
    /// Always keep the remote version.
    PreferServer,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::LastWriteWins => write!(f, "last-write-wins"),
            ConflictStrategy::PreferLocal => write!(f, "prefer-local"),
            ConflictStrategy::PreferServer => write!(f, "prefer-server"),
        }
    }
}

/// Sync configuration.
///
/// All intervals are in milliseconds so the config file stays plain YAML
/// numbers; accessors return `Duration`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the remote document store (http(s) or ws(s) host).
    pub server_url: Option<String>,
    /// Base delay between realtime reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// How many reconnect attempts before the channel gives up.
    pub max_reconnect_attempts: u32,
    /// Ping interval; a missing pong within one interval triggers reconnect.
    pub heartbeat_interval_ms: u64,
    /// Period of the safety-net drain timer.
    pub sync_interval_ms: u64,
    /// Fallback strategy when `auto_resolve` is enabled.
    pub conflict_strategy: ConflictStrategy,
    /// Resolve fallback conflicts automatically instead of prompting.
    pub auto_resolve: bool,
    /// How long to wait for an external resolution answer.
    pub user_prompt_timeout_ms: u64,
    /// Per-request timeout for transport calls.
    pub request_timeout_ms: u64,
    /// Pause between queue items during a drain.
    pub drain_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            reconnect_interval_ms: 1_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 30_000,
            sync_interval_ms: 30_000,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            auto_resolve: true,
            user_prompt_timeout_ms: 30_000,
            request_timeout_ms: 10_000,
            drain_delay_ms: 100,
        }
    }
}

impl SyncConfig {
    /// Whether a remote store has been configured.
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some()
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn user_prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.user_prompt_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(!config.is_configured());
        assert!(config.auto_resolve);
        assert_eq!(config.conflict_strategy, ConflictStrategy::LastWriteWins);
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_strategy_kebab_case() {
        let s: ConflictStrategy = serde_json::from_str("\"last-write-wins\"").unwrap();
        assert_eq!(s, ConflictStrategy::LastWriteWins);
        let s: ConflictStrategy = serde_json::from_str("\"prefer-server\"").unwrap();
        assert_eq!(s, ConflictStrategy::PreferServer);
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"server_url":"http://localhost:8080","auto_resolve":false}"#)
                .unwrap();
        assert!(config.is_configured());
        assert!(!config.auto_resolve);
        assert_eq!(config.max_reconnect_attempts, 5);
    }
}
