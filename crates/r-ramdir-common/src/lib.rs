//! ---
//! ramdir_section: "01-core-functionality"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Shared primitives for the mirror daemon workspace."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
//! Shared configuration loading and logging setup consumed by the core
//! lifecycle crate and the daemon binary.

pub mod config;
pub mod logging;

pub use config::{
    ActivationConfig, ActivationMode, AppConfig, CheckpointConfig, LoadedAppConfig, LockConfig,
    LoggingConfig, MetricsConfig, PostPopulateHook, ResourceConfig, ServiceConfig,
    DEFAULT_CONFIG_PATH,
};
pub use logging::{init_tracing, LogFormat};
