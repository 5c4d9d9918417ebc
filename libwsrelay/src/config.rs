// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde_derive::Deserialize;

use crate::consts;

/// User-facing configuration, deserialized from a TOML file. Every field
/// is optional so that an empty file is a valid, fully-defaulted config.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    /// Milliseconds between PINGs sent to an idle client.
    pub ping_interval_ms: Option<u64>,
    /// Milliseconds to wait for a PONG before dropping the connection.
    pub ping_timeout_ms: Option<u64>,
    /// Largest single packet payload accepted, in bytes.
    pub max_payload_bytes: Option<u64>,
    /// Seconds to wait for an acknowledgement before timing it out.
    pub ack_timeout_secs: Option<u64>,
    /// Seconds a disconnected session's state is retained for recovery.
    pub recovery_window_secs: Option<u64>,
    /// Max packets buffered per room for session recovery replay.
    pub recovery_buffer_len: Option<usize>,
    /// Session-recovery feature toggle; off by default like upstream
    /// Socket.IO, since it changes disconnect-handling semantics.
    #[serde(default)]
    pub connection_state_recovery: bool,
    /// Milliseconds a connection has to join at least one namespace before
    /// it is closed for never completing a handshake.
    pub connect_timeout_ms: Option<u64>,
    /// Whether a dynamically created child namespace self-destructs once
    /// its last socket disconnects.
    pub cleanup_empty_child_namespaces: Option<bool>,
    /// Whether a session restored via connection-state recovery bypasses
    /// the namespace's middleware chain.
    pub skip_middlewares_on_recovery: Option<bool>,
}

/// Resolved, fully-defaulted form of [`Config`] that the rest of the
/// engine actually reads, so call sites never have to chase `Option`s.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_payload_bytes: u64,
    pub ack_timeout: Duration,
    pub recovery_window: Duration,
    pub recovery_buffer_len: usize,
    pub connection_state_recovery: bool,
    pub connect_timeout: Duration,
    pub cleanup_empty_child_namespaces: bool,
    pub skip_middlewares_on_recovery: bool,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        ResolvedConfig {
            ping_interval: consts::DEFAULT_PING_INTERVAL,
            ping_timeout: consts::DEFAULT_PING_TIMEOUT,
            max_payload_bytes: consts::DEFAULT_MAX_PAYLOAD_BYTES,
            ack_timeout: consts::DEFAULT_ACK_TIMEOUT,
            recovery_window: consts::DEFAULT_RECOVERY_WINDOW,
            recovery_buffer_len: consts::DEFAULT_RECOVERY_BUFFER_LEN,
            connection_state_recovery: false,
            connect_timeout: consts::DEFAULT_CONNECT_TIMEOUT,
            cleanup_empty_child_namespaces: false,
            skip_middlewares_on_recovery: true,
        }
    }
}

impl Config {
    pub fn resolve(&self) -> ResolvedConfig {
        let default = ResolvedConfig::default();
        ResolvedConfig {
            ping_interval: self.ping_interval_ms.map(Duration::from_millis).unwrap_or(default.ping_interval),
            ping_timeout: self.ping_timeout_ms.map(Duration::from_millis).unwrap_or(default.ping_timeout),
            max_payload_bytes: self.max_payload_bytes.unwrap_or(default.max_payload_bytes),
            ack_timeout: self.ack_timeout_secs.map(Duration::from_secs).unwrap_or(default.ack_timeout),
            recovery_window: self
                .recovery_window_secs
                .map(Duration::from_secs)
                .unwrap_or(default.recovery_window),
            recovery_buffer_len: self.recovery_buffer_len.unwrap_or(default.recovery_buffer_len),
            connection_state_recovery: self.connection_state_recovery,
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis).unwrap_or(default.connect_timeout),
            cleanup_empty_child_namespaces: self
                .cleanup_empty_child_namespaces
                .unwrap_or(default.cleanup_empty_child_namespaces),
            skip_middlewares_on_recovery: self
                .skip_middlewares_on_recovery
                .unwrap_or(default.skip_middlewares_on_recovery),
        }
    }
}

/// Reads and parses the TOML config file at `path`. Missing files are not
/// an error at this layer; callers that want a config to be mandatory
/// should check existence themselves before calling in.
pub fn read_config(path: &Path) -> anyhow::Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_resolves_to_defaults() {
        let config = Config::default();
        let resolved = config.resolve();
        assert_eq!(resolved.ping_interval, consts::DEFAULT_PING_INTERVAL);
        assert!(!resolved.connection_state_recovery);
        assert_eq!(resolved.connect_timeout, consts::DEFAULT_CONNECT_TIMEOUT);
        assert!(!resolved.cleanup_empty_child_namespaces);
        assert!(resolved.skip_middlewares_on_recovery);
    }

    #[test]
    fn overrides_are_applied() {
        let toml_str = r#"
            ping_interval_ms = 5000
            ack_timeout_secs = 3
            connection_state_recovery = true
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let resolved = config.resolve();
        assert_eq!(resolved.ping_interval, Duration::from_millis(5000));
        assert_eq!(resolved.ack_timeout, Duration::from_secs(3));
        assert!(resolved.connection_state_recovery);
    }

    #[test]
    fn read_config_parses_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wsrelay.toml");
        fs::write(&path, "max_payload_bytes = 2048\nrecovery_buffer_len = 50\n").unwrap();

        let resolved = read_config(&path).unwrap().resolve();
        assert_eq!(resolved.max_payload_bytes, 2048);
        assert_eq!(resolved.recovery_buffer_len, 50);
    }

    #[test]
    fn read_config_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        assert!(read_config(&path).is_err());
    }
}
