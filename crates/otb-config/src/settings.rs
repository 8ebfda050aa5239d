//! Typed config sections. Every field has a default, so an empty document
//! is a complete configuration.

use std::time::Duration;

use otb_surface::AddressingMode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtbConfig {
    pub device: DeviceConfig,
    pub bridge: BridgeConfig,
    pub daemon: DaemonConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
}

// ---------------------------------------------------------------------------
// Device simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Modbus/TCP listen address.
    pub bind: String,
    /// Time to produce one unit.
    pub tick_ms: u64,
    pub addressing: AddressingMode,
    /// Number of most recently accepted nonces refused on reuse.
    pub replay_window: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:502".to_string(),
            tick_ms: 1_000,
            addressing: AddressingMode::Explicit,
            replay_window: 1,
        }
    }
}

impl DeviceConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

// ---------------------------------------------------------------------------
// Bridge dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub device_host: String,
    pub device_port: u16,
    /// Sleep when no order is pending.
    pub idle_interval_ms: u64,
    /// Sleep between progress polls.
    pub poll_interval_ms: u64,
    /// No progress and no completion for this long fails the order.
    pub stall_timeout_ms: u64,
    /// Sleep after a connection or persistence failure.
    pub failure_backoff_ms: u64,
    /// Per-request timeout on the device link, connect included.
    pub request_timeout_ms: u64,
    pub addressing: AddressingMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_host: "127.0.0.1".to_string(),
            device_port: 502,
            idle_interval_ms: 1_000,
            poll_interval_ms: 1_000,
            stall_timeout_ms: 20_000,
            failure_backoff_ms: 1_000,
            request_timeout_ms: 2_000,
            addressing: AddressingMode::Explicit,
        }
    }
}

impl BridgeConfig {
    pub fn device_addr(&self) -> String {
        format!("{}:{}", self.device_host, self.device_port)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Daemon / store / auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address.
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8899".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Postgres,
    /// Process-local, lost on exit.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Name of the env var holding the database URL.
    pub database_url_env: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Postgres,
            database_url_env: "OTB_DATABASE_URL".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Name of the env var holding the shared device key.
    pub key_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_env: "OTB_AUTH_KEY".to_string(),
        }
    }
}
