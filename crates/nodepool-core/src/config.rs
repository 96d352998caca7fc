//! npmd configuration: TOML file, environment overrides, validation.
//!
//! Every field has a default so an empty file (or no file at all) is a
//! valid starting point; deployments usually only set the TLS paths and
//! the control plane through the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::DEFAULT_CAPACITY_PER_RUNNER_MB;

pub const ENV_PORT: &str = "FN_NPM_PORT";
pub const ENV_ADMIN_PORT: &str = "FN_NPM_ADMIN_PORT";
pub const ENV_CERT: &str = "FN_NPM_CERT";
pub const ENV_KEY: &str = "FN_NPM_KEY";
pub const ENV_CA: &str = "FN_NPM_CA";
pub const ENV_RUNNER_ADDRESSES: &str = "FN_RUNNER_ADDRESSES";
pub const ENV_CONTROL_PLANE: &str = "FN_CONTROL_PLANE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NpmConfig {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub capacity: CapacityConfig,
    pub control_plane: ControlPlaneConfig,
    /// Static peer directory used by `ResolveAddress`: peer id → address.
    pub peers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// gRPC listening port.
    pub port: u16,
    /// Admin HTTP port; the admin API is disabled when unset.
    pub admin_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9120,
            admin_port: None,
        }
    }
}

/// Paths to the mutual-TLS material. All three are required to serve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    /// Name expected in the peer certificate when dialing (defaults to the host).
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// How often stale reporters are purged.
    pub purge_interval_ms: u64,
    /// A reporter silent for longer than this is purged.
    pub staleness_ms: u64,
    /// How often each group's runners are polled from the control plane.
    pub poll_interval_ms: u64,
    /// Upper bound on runners requested from the control plane in one call.
    pub max_provision_at_once: usize,
    /// How long a scaled-down runner drains before it is removed.
    pub drain_lifetime_ms: u64,
    /// How long an accepted provisioning request may stay outstanding.
    pub provision_timeout_ms: u64,
    pub min_runners: usize,
    pub max_runners: Option<usize>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            purge_interval_ms: 5_000,
            staleness_ms: 5_000,
            poll_interval_ms: 1_000,
            max_provision_at_once: 20,
            drain_lifetime_ms: 50_000,
            provision_timeout_ms: 300_000,
            min_runners: 0,
            max_runners: None,
        }
    }
}

impl CapacityConfig {
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_lifetime(&self) -> Duration {
        Duration::from_millis(self.drain_lifetime_ms)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Registered backend name: "static" or "command".
    pub backend: String,
    /// Memory capacity (MB) of every runner this control plane creates.
    pub runner_capacity_mb: i64,
    /// Fixed runner addresses for the static backend.
    pub runner_addresses: Vec<String>,
    /// Simulated provisioning latency for the static backend.
    pub provision_delay_ms: u64,
    /// Program and arguments run once per runner to provision (command backend).
    pub provision_command: Vec<String>,
    /// Program and arguments run to remove a runner (command backend).
    pub remove_command: Vec<String>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            backend: "static".to_string(),
            runner_capacity_mb: DEFAULT_CAPACITY_PER_RUNNER_MB,
            runner_addresses: Vec::new(),
            provision_delay_ms: 5_000,
            provision_command: Vec::new(),
            remove_command: Vec::new(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn provision_delay(&self) -> Duration {
        Duration::from_millis(self.provision_delay_ms)
    }
}

impl NpmConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> CoreResult<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = parse_port(ENV_PORT, &port)?;
        }
        if let Some(port) = lookup(ENV_ADMIN_PORT) {
            self.server.admin_port = Some(parse_port(ENV_ADMIN_PORT, &port)?);
        }
        if let Some(cert) = lookup(ENV_CERT) {
            self.tls.cert = Some(PathBuf::from(cert));
        }
        if let Some(key) = lookup(ENV_KEY) {
            self.tls.key = Some(PathBuf::from(key));
        }
        if let Some(ca) = lookup(ENV_CA) {
            self.tls.ca = Some(PathBuf::from(ca));
        }
        if let Some(addresses) = lookup(ENV_RUNNER_ADDRESSES) {
            self.control_plane.runner_addresses = split_addresses(&addresses);
        }
        if let Some(backend) = lookup(ENV_CONTROL_PLANE) {
            self.control_plane.backend = backend.trim().to_string();
        }
        Ok(())
    }

    /// Check cross-field invariants before any subsystem is started.
    pub fn validate(&self) -> CoreResult<()> {
        let cap = &self.capacity;
        if cap.purge_interval_ms == 0 || cap.poll_interval_ms == 0 {
            return Err(CoreError::Config("intervals must be non-zero".into()));
        }
        if cap.max_provision_at_once == 0 {
            return Err(CoreError::Config(
                "capacity.max_provision_at_once must be at least 1".into(),
            ));
        }
        if let Some(max) = cap.max_runners
            && max < cap.min_runners
        {
            return Err(CoreError::Config(format!(
                "capacity.max_runners ({max}) is below min_runners ({})",
                cap.min_runners
            )));
        }
        if self.control_plane.runner_capacity_mb <= 0 {
            return Err(CoreError::Config(
                "control_plane.runner_capacity_mb must be positive".into(),
            ));
        }
        if self.control_plane.backend.is_empty() {
            return Err(CoreError::Config("control_plane.backend is empty".into()));
        }
        Ok(())
    }

    /// The three TLS paths, or an error naming the first missing one.
    pub fn tls_paths(&self) -> CoreResult<(&Path, &Path, &Path)> {
        let missing = |name: &str| CoreError::Config(format!("tls.{name} is required"));
        Ok((
            self.tls.cert.as_deref().ok_or_else(|| missing("cert"))?,
            self.tls.key.as_deref().ok_or_else(|| missing("key"))?,
            self.tls.ca.as_deref().ok_or_else(|| missing("ca"))?,
        ))
    }
}

/// Split a comma-separated address list, dropping blanks.
pub fn split_addresses(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_port(key: &str, value: &str) -> CoreResult<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|e| CoreError::Config(format!("{key}={value:?}: {e}")))
}
