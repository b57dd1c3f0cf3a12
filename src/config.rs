// Copyright 2026 Daniel Pelikan
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

//! Adapter configuration.
//!
//! Defaults match the controller's recommended values; a TOML file can
//! override any section.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{AdapterError, AdapterResult};
use crate::types::{ConnParams, COMMAND_QUEUE_DEPTH, EVENT_QUEUE_DEPTH, MAX_MTU};

/// Local IO capability advertised during pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    #[default]
    NoInputNoOutput,
    KeyboardDisplay,
}

/// Pairing and bonding parameters, passed through to the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Request bonding during pairing.
    pub bonding: bool,
    /// Require man-in-the-middle protection.
    pub mitm: bool,
    /// Offer LE secure connections.
    pub secure_connections: bool,
    /// Reject peers that only support legacy pairing.
    pub secure_connections_only: bool,
    pub io_capability: IoCapability,
    /// Out-of-band pairing data available.
    pub oob: bool,
    /// Answer passkey requests with `fixed_passkey` instead of asking the
    /// application.
    pub use_fixed_passkey: bool,
    pub fixed_passkey: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            bonding: true,
            mitm: false,
            secure_connections: true,
            secure_connections_only: false,
            io_capability: IoCapability::NoInputNoOutput,
            oob: false,
            use_fixed_passkey: false,
            fixed_passkey: 0,
        }
    }
}

/// Top-level adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub security: SecurityConfig,

    /// Default connection parameters for central-role links.
    pub conn_params: ConnParams,

    /// How long the initiator scans for its target before giving up (ms).
    pub connect_scan_timeout_ms: u32,

    /// ATT MTU requested from the controller.
    pub max_mtu: u16,

    /// Command queue depth.
    pub command_queue_depth: usize,

    /// Event queue depth.
    pub event_queue_depth: usize,

    /// Bounded wait for one firmware round trip (ms).
    pub firmware_step_timeout_ms: u64,

    /// Bounded wait for one caller-visible operation (ms).
    pub api_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            security: SecurityConfig::default(),
            conn_params: ConnParams::default(),
            connect_scan_timeout_ms: crate::types::CONNECT_SCAN_TIMEOUT_MS,
            max_mtu: MAX_MTU,
            command_queue_depth: COMMAND_QUEUE_DEPTH,
            event_queue_depth: EVENT_QUEUE_DEPTH,
            firmware_step_timeout_ms: 5_000,
            api_timeout_ms: 7_000,
        }
    }
}

impl AdapterConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> AdapterResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AdapterError::Storage(format!("read {}: {}", path.display(), e)))?;
        let config: AdapterConfig = toml::from_str(&text)
            .map_err(|e| AdapterError::Storage(format!("parse {}: {}", path.display(), e)))?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.firmware_step_timeout_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    /// Bounded wait for a connection attempt: scan timeout plus one
    /// firmware round trip of margin.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_scan_timeout_ms as u64 + self.firmware_step_timeout_ms)
    }

    /// Bounded wait for a disconnect: the link supervision timeout (10 ms
    /// units) plus one firmware round trip of margin.
    pub fn disconnect_timeout(&self, supervision_timeout: u16) -> Duration {
        Duration::from_millis(supervision_timeout as u64 * 10 + self.firmware_step_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AdapterConfig::default();
        assert_eq!(config.command_queue_depth, 10);
        assert_eq!(config.event_queue_depth, 160);
        assert_eq!(config.max_mtu, 247);
        assert!(config.security.bonding);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AdapterConfig = toml::from_str(
            r#"
            max_mtu = 185

            [security]
            use_fixed_passkey = true
            fixed_passkey = 123456
            "#,
        )
        .unwrap();
        assert_eq!(config.max_mtu, 185);
        assert!(config.security.use_fixed_passkey);
        assert_eq!(config.security.fixed_passkey, 123456);
        assert_eq!(config.command_queue_depth, 10);
    }

    #[test]
    fn disconnect_timeout_scales_with_supervision() {
        let config = AdapterConfig::default();
        assert_eq!(
            config.disconnect_timeout(0x1F4),
            Duration::from_millis(0x1F4 * 10 + 5_000)
        );
    }
}
