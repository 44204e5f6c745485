//! ---
//! ramdir_section: "01-core-functionality"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Lifecycle core of the memory-backed directory mirror daemon."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
//! Keeps on-disk data directories mirrored into memory-backed storage and
//! flushes them back on a schedule and at shutdown.
//!
//! [`Manager`] is the entry point. With the `testing` feature, `testing` holds
//! doubles for every host integration so the full lifecycle can be exercised
//! without root.

pub mod activation;
pub mod checkpoint;
pub mod error;
pub mod fsops;
pub mod lock;
pub mod manager;
pub mod mount;
pub mod notify;
pub mod service;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod unit;

pub use activation::ActivationCoordinator;
pub use checkpoint::{
    spawn_loop, CheckpointJob, CheckpointLoopHandle, CheckpointStatus, Checkpointer, FlushOutcome,
};
pub use error::{
    AggregateServiceError, FlushError, LockError, ServiceError, ServiceTarget, ShutdownError,
    StartupError, TeardownFailure, TeardownStep, UnitError,
};
pub use lock::{InstanceLock, LockHandle};
pub use manager::{Manager, ManagerDeps, ManagerRuntimeState, RunningManager};
pub use mount::{KernelMounter, Mounter};
pub use notify::{Notifier, SupervisorEvent, SystemdNotifier};
pub use service::{ServiceBackend, ServiceController, SystemctlBackend};
pub use unit::{MountUnit, UnitContext, UnitState};
