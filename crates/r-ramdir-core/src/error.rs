//! ---
//! ramdir_section: "02-storage-lifecycle"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Failure taxonomy for lifecycle, checkpoint and service operations."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::unit::UnitState;

/// Failure to obtain or hold the process-wide instance lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// A second manager instance attempted to start.
    #[error("another instance holds {} ({})", .path.display(), describe_holder(.holder))]
    AlreadyRunning { path: PathBuf, holder: Option<u32> },
    #[error("lock file {}: {cause}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
}

fn describe_holder(holder: &Option<u32>) -> String {
    match holder {
        Some(pid) => format!("pid {}", pid),
        None => "holder unknown".to_owned(),
    }
}

/// Requested service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceTarget {
    Running,
    Stopped,
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceTarget::Running => f.write_str("running"),
            ServiceTarget::Stopped => f.write_str("stopped"),
        }
    }
}

/// Errors raised while driving an external service unit.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to invoke {program} for {unit}: {cause}")]
    Command {
        unit: String,
        program: String,
        #[source]
        cause: io::Error,
    },
    #[error("request to make {unit} {target} was rejected: {detail}")]
    Rejected {
        unit: String,
        target: ServiceTarget,
        detail: String,
    },
    /// The unit did not reach the requested state in time.
    #[error("{unit} did not become {target} within {:?}", .waited)]
    ConvergenceTimeout {
        unit: String,
        target: ServiceTarget,
        waited: Duration,
    },
}

/// Errors raised by a single checkpoint attempt.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("memory copy {} does not exist", .0.display())]
    SourceMissing(PathBuf),
    /// Mirroring would have wiped a non-empty persistent copy.
    #[error(
        "refusing to mirror empty {} over non-empty {}",
        .memory.display(),
        .persistent.display()
    )]
    UnsafeEmptySource { memory: PathBuf, persistent: PathBuf },
    #[error(
        "checkpoint of {} into {} failed: {cause}",
        .memory.display(),
        .persistent.display()
    )]
    FlushFailure {
        memory: PathBuf,
        persistent: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("checkpoint task did not complete: {0}")]
    Aborted(String),
}

impl FlushError {
    /// Short label used for metrics and structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            FlushError::SourceMissing(_) => "source_missing",
            FlushError::UnsafeEmptySource { .. } => "unsafe_empty_source",
            FlushError::FlushFailure { .. } => "flush_failure",
            FlushError::Aborted(_) => "aborted",
        }
    }
}

/// Errors raised by a mount unit's setup state machine.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// Unclean external state that needs operator attention.
    #[error("{resource}: precondition violated: {reason}")]
    PreconditionViolated { resource: String, reason: String },
    #[error("{resource}: data migration failed while {stage}: {cause}")]
    MigrationFailure {
        resource: String,
        stage: &'static str,
        #[source]
        cause: io::Error,
    },
    #[error("{resource}: mount operation on {} failed: {cause}", .target.display())]
    Mount {
        resource: String,
        target: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("{resource}: {cause}")]
    Service {
        resource: String,
        #[source]
        cause: ServiceError,
    },
    #[error("{resource}: cannot {operation} while {state}")]
    InvalidTransition {
        resource: String,
        operation: &'static str,
        state: UnitState,
    },
}

impl UnitError {
    pub fn resource(&self) -> &str {
        match self {
            UnitError::PreconditionViolated { resource, .. }
            | UnitError::MigrationFailure { resource, .. }
            | UnitError::Mount { resource, .. }
            | UnitError::Service { resource, .. }
            | UnitError::InvalidTransition { resource, .. } => resource,
        }
    }
}

/// Every deferred service start that failed, not just the first.
#[derive(Debug, thiserror::Error)]
#[error("{} deferred service start(s) failed: {}", .failures.len(), list(.failures.iter().map(|(r, e)| format!("{}: {}", r, e))))]
pub struct AggregateServiceError {
    pub failures: Vec<(String, ServiceError)>,
}

impl AggregateServiceError {
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(resource, _)| resource.as_str())
    }
}

/// One of the independent steps a teardown performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    StopService,
    FinalFlush,
    Unmount,
    RemoveMemory,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TeardownStep::StopService => "stop service",
            TeardownStep::FinalFlush => "final flush",
            TeardownStep::Unmount => "unmount",
            TeardownStep::RemoveMemory => "remove memory copy",
        };
        f.write_str(label)
    }
}

/// A recorded, non-aborting teardown failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub resource: String,
    pub step: TeardownStep,
    pub detail: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.resource, self.step, self.detail)
    }
}

/// Manager startup failed; all partially applied work has been unwound.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("setup failed for {} resource(s): {}", .failures.len(), list(.failures.iter()))]
    Setup {
        failures: Vec<UnitError>,
        unwind: Vec<TeardownFailure>,
    },
    #[error("{error}")]
    Activation {
        error: AggregateServiceError,
        unwind: Vec<TeardownFailure>,
    },
}

impl StartupError {
    /// True when the lock was held by another instance.
    pub fn is_already_running(&self) -> bool {
        matches!(self, StartupError::Lock(LockError::AlreadyRunning { .. }))
    }

    /// Teardown failures recorded while unwinding a failed startup.
    pub fn unwind_failures(&self) -> &[TeardownFailure] {
        match self {
            StartupError::Lock(_) => &[],
            StartupError::Setup { unwind, .. } | StartupError::Activation { unwind, .. } => unwind,
        }
    }
}

/// Shutdown completed but at least one step failed; state may need manual verification.
#[derive(Debug, thiserror::Error)]
#[error("shutdown recorded {} failure(s): {}", .failures.len(), list(.failures.iter()))]
pub struct ShutdownError {
    pub failures: Vec<TeardownFailure>,
}

fn list<T: fmt::Display>(items: impl Iterator<Item = T>) -> String {
    items
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
