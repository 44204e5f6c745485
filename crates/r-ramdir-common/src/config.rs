//! ---
//! ramdir_section: "04-configuration-orchestration"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Configuration model and loading for the mirror daemon."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Location inspected when no explicit configuration path is supplied.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/r-ramdir/r-ramdird.toml";

fn default_true() -> bool {
    true
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/run/r-ramdird.lock")
}

fn default_systemctl() -> PathBuf {
    PathBuf::from("systemctl")
}

fn default_convergence_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_period() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

/// Primary configuration object for the mirror daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Managed resources keyed by name, in configuration order.
    #[serde(default)]
    pub resources: IndexMap<String, ResourceConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_RAMDIR_CONFIG";

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Copy each map key into the corresponding [`ResourceConfig::name`].
    fn normalize(&mut self) {
        for (name, resource) in self.resources.iter_mut() {
            resource.name = name.clone();
        }
    }

    /// Resources that should be managed, in configuration order.
    pub fn enabled_resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.resources.values().filter(|resource| resource.enabled)
    }

    /// Retrieve a resource configuration by name.
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.get(name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.resources.is_empty() {
            return Err(anyhow!("configuration must contain at least one resource"));
        }
        let mut claimed: HashSet<&Path> = HashSet::new();
        for (name, resource) in &self.resources {
            resource.validate(name)?;
            for path in resource.paths() {
                if !claimed.insert(path) {
                    return Err(anyhow!(
                        "path {} is claimed by more than one resource entry (resource '{}')",
                        path.display(),
                        name
                    ));
                }
            }
        }
        self.service.validate()?;
        if self.checkpoint.idle_period.is_zero() {
            return Err(anyhow!("checkpoint.idle_period must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let mut config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }
}

/// One directory mirrored into memory and owned by a service unit.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceConfig {
    /// Filled from the table key when loaded from TOML.
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Service unit that owns the directory, e.g. `rrdcached.service`.
    pub service_unit: String,
    /// Mount point the service reads and writes.
    pub disk_path: PathBuf,
    /// Volatile working copy, normally on tmpfs.
    pub memory_path: PathBuf,
    /// Durable copy that survives restarts.
    pub persistent_path: PathBuf,
    /// Zero disables periodic checkpoints; data is flushed only at shutdown.
    #[serde(default)]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub checkpoint_interval: Duration,
    #[serde(default)]
    pub post_populate: Option<PostPopulateHook>,
}

impl ResourceConfig {
    /// Convenience constructor used by tests and tooling.
    pub fn new(
        name: impl Into<String>,
        service_unit: impl Into<String>,
        disk_path: impl Into<PathBuf>,
        memory_path: impl Into<PathBuf>,
        persistent_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            service_unit: service_unit.into(),
            disk_path: disk_path.into(),
            memory_path: memory_path.into(),
            persistent_path: persistent_path.into(),
            checkpoint_interval: Duration::ZERO,
            post_populate: None,
        }
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    fn paths(&self) -> [&Path; 3] {
        [
            self.disk_path.as_path(),
            self.memory_path.as_path(),
            self.persistent_path.as_path(),
        ]
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(anyhow!("resource names cannot be empty"));
        }
        if self.service_unit.trim().is_empty() {
            return Err(anyhow!("resource '{}' must name a service_unit", name));
        }
        for path in self.paths() {
            if !path.is_absolute() {
                return Err(anyhow!(
                    "resource '{}' path {} must be absolute",
                    name,
                    path.display()
                ));
            }
        }
        let [disk, memory, persistent] = self.paths();
        if disk == memory || disk == persistent || memory == persistent {
            return Err(anyhow!(
                "resource '{}' must use three distinct paths for disk, memory and persistent copies",
                name
            ));
        }
        Ok(())
    }
}

/// Ownership and mode applied to a freshly populated memory copy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostPopulateHook {
    #[serde(default)]
    pub owner: Option<u32>,
    #[serde(default)]
    pub group: Option<u32>,
    /// Permission bits for the memory directory itself.
    #[serde(default)]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_systemctl")]
    pub systemctl: PathBuf,
    #[serde(default = "default_convergence_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub convergence_timeout: Duration,
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            systemctl: default_systemctl(),
            convergence_timeout: default_convergence_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("service.poll_interval must be greater than zero"));
        }
        if self.poll_interval > self.convergence_timeout {
            return Err(anyhow!(
                "service.poll_interval ({:?}) exceeds service.convergence_timeout ({:?})",
                self.poll_interval,
                self.convergence_timeout
            ));
        }
        Ok(())
    }
}

/// When dependent services are started relative to the readiness signal.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    /// Deferred when a notify socket is present, immediate otherwise.
    #[default]
    Auto,
    Immediate,
    Deferred,
}

impl ActivationMode {
    /// Resolve `Auto` against whether the process runs under a notifying supervisor.
    pub fn resolve(self, supervised: bool) -> ActivationMode {
        match self {
            ActivationMode::Auto if supervised => ActivationMode::Deferred,
            ActivationMode::Auto => ActivationMode::Immediate,
            other => other,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, ActivationMode::Deferred)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivationConfig {
    #[serde(default)]
    pub mode: ActivationMode,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// How long a zero-interval loop sleeps between idle wake-ups.
    #[serde(default = "default_idle_period")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub idle_period: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            idle_period: default_idle_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
