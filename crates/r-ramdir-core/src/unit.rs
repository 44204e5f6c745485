//! ---
//! ramdir_section: "02-storage-lifecycle"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Per-resource setup and teardown state machine."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
//! A [`MountUnit`] owns one resource's directory triple:
//!
//! * `persistent_path`, the durable source of truth,
//! * `memory_path`, the volatile working copy,
//! * `disk_path`, where the service expects its data and where the memory
//!   copy is bind mounted while the unit is up.
//!
//! The memory copy exists exactly while the unit is `Mounted`, `ServiceQueued`,
//! `ServiceRunning` or `TearingDown`. The bind mount exists exactly while the
//! unit is in one of the first three.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use r_ramdir_common::ResourceConfig;
use r_ramdir_metrics::LifecycleMetrics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{spawn_loop, CheckpointLoopHandle, CheckpointStatus, Checkpointer};
use crate::error::{ServiceError, TeardownFailure, TeardownStep, UnitError};
use crate::fsops;
use crate::mount::Mounter;
use crate::service::ServiceController;

/// Lifecycle position of a mount unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    Unconfigured,
    PersistentReady,
    Mounted,
    ServiceQueued,
    ServiceRunning,
    TearingDown,
    TornDown,
}

impl UnitState {
    /// Stable number exported through the `r_ramdir_unit_state` gauge.
    pub fn ordinal(self) -> i64 {
        match self {
            UnitState::Unconfigured => 0,
            UnitState::PersistentReady => 1,
            UnitState::Mounted => 2,
            UnitState::ServiceQueued => 3,
            UnitState::ServiceRunning => 4,
            UnitState::TearingDown => 5,
            UnitState::TornDown => 6,
        }
    }

    /// Whether the bind mount is expected to be in place.
    pub fn is_mounted(self) -> bool {
        matches!(
            self,
            UnitState::Mounted | UnitState::ServiceQueued | UnitState::ServiceRunning
        )
    }

    /// Whether the memory copy is expected to exist.
    pub fn has_memory_copy(self) -> bool {
        self.is_mounted() || self == UnitState::TearingDown
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitState::Unconfigured => "unconfigured",
            UnitState::PersistentReady => "persistent-ready",
            UnitState::Mounted => "mounted",
            UnitState::ServiceQueued => "service-queued",
            UnitState::ServiceRunning => "service-running",
            UnitState::TearingDown => "tearing-down",
            UnitState::TornDown => "torn-down",
        };
        f.write_str(label)
    }
}

/// Collaborators shared by every unit of one manager.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub services: ServiceController,
    pub mounter: Arc<dyn Mounter>,
    /// Manager-wide shutdown flag.
    pub shutdown: CancellationToken,
    pub metrics: Option<LifecycleMetrics>,
}

/// One managed resource and its state machine.
#[derive(Debug)]
pub struct MountUnit {
    config: Arc<ResourceConfig>,
    state: UnitState,
    status: CheckpointStatus,
    services: ServiceController,
    mounter: Arc<dyn Mounter>,
    checkpointer: Checkpointer,
    metrics: Option<LifecycleMetrics>,
}

impl MountUnit {
    pub fn new(config: Arc<ResourceConfig>, context: &UnitContext) -> Self {
        let checkpointer = Checkpointer::new(config.clone(), context.shutdown.clone())
            .with_metrics(context.metrics.clone());
        let unit = Self {
            config,
            state: UnitState::Unconfigured,
            status: CheckpointStatus::default(),
            services: context.services.clone(),
            mounter: context.mounter.clone(),
            checkpointer,
            metrics: context.metrics.clone(),
        };
        unit.publish_state();
        unit
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn status(&self) -> &CheckpointStatus {
        &self.status
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Stop the service and make sure the persistent copy exists.
    ///
    /// On first run the current content of `disk_path` is copied into the new
    /// persistent path. An existing persistent path is never touched.
    pub async fn prepare_persistent(&mut self) -> Result<(), UnitError> {
        self.expect_state(UnitState::Unconfigured, "prepare persistent copy")?;
        let disk = self.config.disk_path.clone();

        let mounter = self.mounter.clone();
        let probe = disk.clone();
        let mounted = blocking(move || mounter.is_mounted(&probe))
            .await
            .map_err(|cause| self.mount_error(&disk, cause))?;
        if mounted {
            return Err(UnitError::PreconditionViolated {
                resource: self.name().to_owned(),
                reason: format!("{} is already a mount point", disk.display()),
            });
        }

        self.services
            .stop(&self.config.service_unit)
            .await
            .map_err(|cause| UnitError::Service {
                resource: self.name().to_owned(),
                cause,
            })?;

        let persistent = self.config.persistent_path.clone();
        match fs::symlink_metadata(&persistent) {
            Ok(meta) if meta.is_dir() => {
                debug!(resource = self.name(), path = %persistent.display(), "persistent copy present");
            }
            Ok(_) => {
                return Err(UnitError::PreconditionViolated {
                    resource: self.name().to_owned(),
                    reason: format!("{} exists but is not a directory", persistent.display()),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let resource = self.name().to_owned();
                let stats = blocking(move || migrate_first_run(&disk, &persistent))
                    .await
                    .map_err(|cause| UnitError::MigrationFailure {
                        resource,
                        stage: "migrating existing data",
                        cause,
                    })?;
                info!(
                    resource = self.name(),
                    copied = stats.copied,
                    bytes = stats.bytes,
                    "first run: persistent copy created"
                );
            }
            Err(cause) => {
                return Err(UnitError::MigrationFailure {
                    resource: self.name().to_owned(),
                    stage: "inspecting persistent copy",
                    cause,
                })
            }
        }

        self.set_state(UnitState::PersistentReady);
        Ok(())
    }

    /// Populate a fresh memory copy from the persistent copy and bind it over `disk_path`.
    pub async fn mount(&mut self) -> Result<(), UnitError> {
        self.expect_state(UnitState::PersistentReady, "mount")?;
        let memory = self.config.memory_path.clone();

        if fs::symlink_metadata(&memory).is_ok() {
            warn!(
                resource = self.name(),
                path = %memory.display(),
                "discarding memory copy left by an unclean shutdown"
            );
            let stale = memory.clone();
            blocking(move || fsops::remove_tree(&stale))
                .await
                .map_err(|cause| self.migration_error("discarding stale memory copy", cause))?;
        }

        let config = self.config.clone();
        let populated = blocking(move || populate_memory(&config)).await;
        let stats = match populated {
            Ok(stats) => stats,
            Err(cause) => {
                self.discard_memory().await;
                return Err(self.migration_error("populating memory copy", cause));
            }
        };

        let mounter = self.mounter.clone();
        let (source, target) = (memory.clone(), self.config.disk_path.clone());
        if let Err(cause) = blocking(move || {
            fs::create_dir_all(&target)?;
            mounter.bind(&source, &target)
        })
        .await
        {
            self.discard_memory().await;
            return Err(self.mount_error(&self.config.disk_path, cause));
        }

        info!(
            resource = self.name(),
            copied = stats.copied,
            bytes = stats.bytes,
            memory = %memory.display(),
            disk = %self.config.disk_path.display(),
            "memory copy mounted"
        );
        self.set_state(UnitState::Mounted);
        Ok(())
    }

    /// Run both setup transitions, ending in `Mounted`.
    pub async fn setup(&mut self) -> Result<(), UnitError> {
        self.prepare_persistent().await?;
        self.mount().await
    }

    /// Start the service right away. On failure the unit is rolled back
    /// through teardown so it is never left mounted with its service down.
    pub async fn start_service(&mut self) -> Result<(), UnitError> {
        self.expect_state(UnitState::Mounted, "start service")?;
        match self.services.start(&self.config.service_unit).await {
            Ok(()) => {
                self.set_state(UnitState::ServiceRunning);
                Ok(())
            }
            Err(cause) => {
                error!(resource = self.name(), error = %cause, "service start failed; rolling back");
                for failure in self.teardown().await {
                    error!(resource = self.name(), failure = %failure, "rollback step failed");
                }
                Err(UnitError::Service {
                    resource: self.name().to_owned(),
                    cause,
                })
            }
        }
    }

    /// Leave the service start to the activation coordinator.
    pub fn mark_queued(&mut self) -> Result<(), UnitError> {
        self.expect_state(UnitState::Mounted, "queue service start")?;
        self.set_state(UnitState::ServiceQueued);
        Ok(())
    }

    /// Start a queued service. The unit stays queued if the start fails.
    pub async fn activate_queued(&mut self) -> Result<(), ServiceError> {
        if self.state != UnitState::ServiceQueued {
            debug!(resource = self.name(), state = %self.state, "not queued; nothing to activate");
            return Ok(());
        }
        self.services.start(&self.config.service_unit).await?;
        self.set_state(UnitState::ServiceRunning);
        Ok(())
    }

    /// Start the periodic checkpoint loop, handing it this unit's status.
    pub fn start_checkpoint_loop(
        &mut self,
        idle_period: Duration,
        cancel: CancellationToken,
    ) -> CheckpointLoopHandle {
        spawn_loop(
            self.checkpointer.clone(),
            self.config.checkpoint_interval,
            idle_period,
            std::mem::take(&mut self.status),
            cancel,
        )
    }

    /// Take back the status a joined checkpoint loop returned.
    pub fn restore_status(&mut self, status: CheckpointStatus) {
        self.status = status;
    }

    /// Stop the service, flush, unmount and drop the memory copy.
    ///
    /// Every step is attempted regardless of earlier failures. The memory copy
    /// is kept only while the disk path is still mounted over it, in which
    /// case the unit stays `TearingDown`.
    pub async fn teardown(&mut self) -> Vec<TeardownFailure> {
        match self.state {
            UnitState::TornDown => return Vec::new(),
            UnitState::Unconfigured | UnitState::PersistentReady => {
                self.set_state(UnitState::TornDown);
                return Vec::new();
            }
            UnitState::Mounted
            | UnitState::ServiceQueued
            | UnitState::ServiceRunning
            | UnitState::TearingDown => {}
        }
        self.set_state(UnitState::TearingDown);
        let mut failures = Vec::new();

        if let Err(err) = self.services.stop(&self.config.service_unit).await {
            failures.push(self.failure(TeardownStep::StopService, err.to_string()));
        }

        let flushed = self.checkpointer.flush(true).await;
        self.status.record(&flushed);
        if let Err(err) = flushed {
            failures.push(self.failure(TeardownStep::FinalFlush, err.to_string()));
        }

        let mounter = self.mounter.clone();
        let disk = self.config.disk_path.clone();
        let unmounted = blocking(move || {
            if mounter.is_mounted(&disk)? {
                mounter.unmount(&disk)?;
            }
            Ok(())
        })
        .await;
        let unmounted = match unmounted {
            Ok(()) => true,
            Err(err) => {
                failures.push(self.failure(TeardownStep::Unmount, err.to_string()));
                false
            }
        };

        let removed = if !unmounted {
            failures.push(self.failure(
                TeardownStep::RemoveMemory,
                "kept because the disk path is still mounted".to_owned(),
            ));
            false
        } else {
            let memory = self.config.memory_path.clone();
            match blocking(move || fsops::remove_tree(&memory)).await {
                Ok(_) => true,
                Err(err) => {
                    failures.push(self.failure(TeardownStep::RemoveMemory, err.to_string()));
                    false
                }
            }
        };

        for failure in &failures {
            warn!(resource = self.name(), step = %failure.step, detail = %failure.detail, "teardown step failed");
        }
        if removed {
            self.set_state(UnitState::TornDown);
        } else {
            error!(
                resource = self.name(),
                memory = %self.config.memory_path.display(),
                "memory copy retained; manual verification required"
            );
        }
        failures
    }

    fn expect_state(&self, expected: UnitState, operation: &'static str) -> Result<(), UnitError> {
        if self.state == expected {
            return Ok(());
        }
        Err(UnitError::InvalidTransition {
            resource: self.name().to_owned(),
            operation,
            state: self.state,
        })
    }

    fn set_state(&mut self, state: UnitState) {
        if self.state != state {
            info!(resource = self.name(), from = %self.state, to = %state, "unit state changed");
        }
        self.state = state;
        self.publish_state();
    }

    fn publish_state(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_unit_state(self.name(), self.state.ordinal());
        }
    }

    async fn discard_memory(&self) {
        let memory = self.config.memory_path.clone();
        if let Err(err) = blocking(move || fsops::remove_tree(&memory)).await {
            warn!(resource = self.name(), error = %err, "failed to clean up memory copy");
        }
    }

    fn failure(&self, step: TeardownStep, detail: String) -> TeardownFailure {
        TeardownFailure {
            resource: self.name().to_owned(),
            step,
            detail,
        }
    }

    fn migration_error(&self, stage: &'static str, cause: io::Error) -> UnitError {
        UnitError::MigrationFailure {
            resource: self.name().to_owned(),
            stage,
            cause,
        }
    }

    fn mount_error(&self, target: &Path, cause: io::Error) -> UnitError {
        UnitError::Mount {
            resource: self.name().to_owned(),
            target: target.to_path_buf(),
            cause,
        }
    }
}

/// Run blocking filesystem or mount work off the async workers.
async fn blocking<T, F>(work: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
}

/// Create `persistent` from whatever `disk` holds, via a staging directory
/// renamed into place so an interrupted copy is never mistaken for a complete one.
fn migrate_first_run(disk: &Path, persistent: &Path) -> io::Result<fsops::MirrorStats> {
    if let Some(parent) = persistent.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = staging_path(persistent);
    fsops::remove_tree(&staging)?;
    let result = if fsops::has_entries(disk)? {
        fsops::copy_tree(disk, &staging)
    } else {
        fs::create_dir(&staging).map(|_| fsops::MirrorStats::default())
    };
    let stats = match result.and_then(|stats| fs::rename(&staging, persistent).map(|_| stats)) {
        Ok(stats) => stats,
        Err(err) => {
            let _ = fsops::remove_tree(&staging);
            return Err(err);
        }
    };
    fsops::sync_filesystem(persistent)?;
    Ok(stats)
}

fn staging_path(persistent: &Path) -> PathBuf {
    let mut name = persistent
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".migrating");
    persistent.with_file_name(name)
}

fn populate_memory(config: &ResourceConfig) -> io::Result<fsops::MirrorStats> {
    fs::create_dir_all(&config.memory_path)?;
    let stats = fsops::mirror_tree(&config.persistent_path, &config.memory_path)?;
    if let Some(hook) = &config.post_populate {
        fsops::apply_post_populate(&config.memory_path, hook)?;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceTarget;
    use crate::testing::{Behaviour, MemoryMounter, ScriptedServiceBackend};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        config: Arc<ResourceConfig>,
        backend: Arc<ScriptedServiceBackend>,
        mounter: Arc<MemoryMounter>,
        context: UnitContext,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let config = Arc::new(ResourceConfig::new(
            "rrd",
            "rrdcached.service",
            root.join("disk"),
            root.join("run/memory"),
            root.join("lib/persistent"),
        ));
        fs::create_dir_all(&config.disk_path).unwrap();
        let backend = Arc::new(ScriptedServiceBackend::new());
        let mounter = Arc::new(MemoryMounter::new());
        let context = UnitContext {
            services: ServiceController::new(backend.clone())
                .with_timing(Duration::from_millis(100), Duration::from_millis(5)),
            mounter: mounter.clone(),
            shutdown: CancellationToken::new(),
            metrics: None,
        };
        Fixture {
            _dir: dir,
            config,
            backend,
            mounter,
            context,
        }
    }

    fn names(path: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(path)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn first_run_migrates_disk_content() {
        let fx = fixture();
        fs::write(fx.config.disk_path.join("a"), b"1").unwrap();
        fs::write(fx.config.disk_path.join("b"), b"2").unwrap();
        fx.backend.set_running("rrdcached.service", true);

        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        unit.setup().await.unwrap();

        assert_eq!(unit.state(), UnitState::Mounted);
        assert!(!fx.backend.is_running("rrdcached.service"));
        assert_eq!(names(&fx.config.persistent_path), vec!["a", "b"]);
        assert_eq!(names(&fx.config.memory_path), vec!["a", "b"]);
        assert_eq!(
            fx.mounter.source_of(&fx.config.disk_path),
            Some(fx.config.memory_path.clone())
        );
        assert!(!staging_path(&fx.config.persistent_path).exists());
    }

    #[tokio::test]
    async fn existing_persistent_copy_is_authoritative() {
        let fx = fixture();
        fs::create_dir_all(&fx.config.persistent_path).unwrap();
        fs::write(fx.config.persistent_path.join("kept"), b"p").unwrap();
        fs::write(fx.config.disk_path.join("ignored"), b"d").unwrap();
        fs::create_dir_all(&fx.config.memory_path).unwrap();
        fs::write(fx.config.memory_path.join("stale"), b"s").unwrap();

        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        unit.setup().await.unwrap();

        assert_eq!(names(&fx.config.persistent_path), vec!["kept"]);
        assert_eq!(names(&fx.config.memory_path), vec!["kept"]);
    }

    #[tokio::test]
    async fn already_mounted_disk_path_is_a_precondition_violation() {
        let fx = fixture();
        fx.mounter.mark_mounted(&fx.config.disk_path);

        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        let err = unit.setup().await.unwrap_err();
        assert!(matches!(err, UnitError::PreconditionViolated { .. }));
        assert_eq!(unit.state(), UnitState::Unconfigured);
        assert!(!fx.config.persistent_path.exists());
        assert!(fx.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn stop_that_never_converges_fails_setup() {
        let fx = fixture();
        fx.backend.set_running("rrdcached.service", true);
        fx.backend
            .set_behaviour("rrdcached.service", ServiceTarget::Stopped, Behaviour::Stuck);

        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        let err = unit.setup().await.unwrap_err();
        assert!(matches!(
            err,
            UnitError::Service {
                cause: ServiceError::ConvergenceTimeout { .. },
                ..
            }
        ));
        assert!(!fx.config.memory_path.exists());
    }

    #[tokio::test]
    async fn failed_bind_cleans_up_memory_copy() {
        let fx = fixture();
        fx.mounter.fail_bind(&fx.config.disk_path);

        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        let err = unit.setup().await.unwrap_err();
        assert!(matches!(err, UnitError::Mount { .. }));
        assert_eq!(unit.state(), UnitState::PersistentReady);
        assert!(!fx.config.memory_path.exists());
        assert!(unit.teardown().await.is_empty());
        assert_eq!(unit.state(), UnitState::TornDown);
    }

    #[tokio::test]
    async fn failed_start_rolls_back_to_torn_down() {
        let fx = fixture();
        fx.backend.set_behaviour(
            "rrdcached.service",
            ServiceTarget::Running,
            Behaviour::Reject("unit masked".to_owned()),
        );

        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        unit.setup().await.unwrap();
        let err = unit.start_service().await.unwrap_err();

        assert!(matches!(err, UnitError::Service { .. }));
        assert_eq!(unit.state(), UnitState::TornDown);
        assert_eq!(fx.mounter.mount_count(), 0);
        assert!(!fx.config.memory_path.exists());
    }

    #[tokio::test]
    async fn teardown_flushes_then_unmounts() {
        let fx = fixture();
        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        unit.setup().await.unwrap();
        unit.start_service().await.unwrap();
        assert!(fx.backend.is_running("rrdcached.service"));

        fs::write(fx.config.memory_path.join("written"), b"w").unwrap();
        let failures = unit.teardown().await;

        assert!(failures.is_empty(), "{failures:?}");
        assert_eq!(unit.state(), UnitState::TornDown);
        assert!(!fx.backend.is_running("rrdcached.service"));
        assert_eq!(names(&fx.config.persistent_path), vec!["written"]);
        assert!(!fx.config.memory_path.exists());
        assert_eq!(unit.status().total_flushes, 1);
    }

    #[tokio::test]
    async fn teardown_attempts_every_step_and_keeps_memory_when_unmount_fails() {
        let fx = fixture();
        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        unit.setup().await.unwrap();
        unit.start_service().await.unwrap();
        fx.backend
            .set_behaviour("rrdcached.service", ServiceTarget::Stopped, Behaviour::Stuck);
        fx.mounter.fail_unmount(&fx.config.disk_path);
        fs::write(fx.config.memory_path.join("late"), b"l").unwrap();

        let failures = unit.teardown().await;
        let steps: Vec<TeardownStep> = failures.iter().map(|f| f.step).collect();

        assert_eq!(
            steps,
            vec![
                TeardownStep::StopService,
                TeardownStep::Unmount,
                TeardownStep::RemoveMemory
            ]
        );
        assert_eq!(names(&fx.config.persistent_path), vec!["late"]);
        assert_eq!(unit.state(), UnitState::TearingDown);
        assert!(fx.config.memory_path.exists());
    }

    #[tokio::test]
    async fn refused_final_flush_still_unmounts_and_removes_memory() {
        let fx = fixture();
        fs::write(fx.config.disk_path.join("a"), b"1").unwrap();
        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        unit.setup().await.unwrap();
        fs::remove_file(fx.config.memory_path.join("a")).unwrap();

        let failures = unit.teardown().await;
        let steps: Vec<TeardownStep> = failures.iter().map(|f| f.step).collect();

        assert_eq!(steps, vec![TeardownStep::FinalFlush]);
        assert_eq!(fx.mounter.mount_count(), 0);
        assert_eq!(names(&fx.config.persistent_path), vec!["a"]);
        assert_eq!(unit.state(), UnitState::TornDown);
        assert!(!fx.config.memory_path.exists());
        assert_eq!(unit.status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn queued_unit_starts_on_activation() {
        let fx = fixture();
        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        unit.setup().await.unwrap();
        unit.mark_queued().unwrap();
        assert!(!fx.backend.is_running("rrdcached.service"));

        unit.activate_queued().await.unwrap();
        assert_eq!(unit.state(), UnitState::ServiceRunning);
        assert!(fx.backend.is_running("rrdcached.service"));
    }

    #[tokio::test]
    async fn operations_out_of_order_are_rejected() {
        let fx = fixture();
        let mut unit = MountUnit::new(fx.config.clone(), &fx.context);
        let err = unit.mount().await.unwrap_err();
        assert!(matches!(
            err,
            UnitError::InvalidTransition {
                state: UnitState::Unconfigured,
                ..
            }
        ));
        assert!(unit.mark_queued().is_err());
    }

    #[test]
    fn state_predicates_follow_lifecycle() {
        assert!(UnitState::ServiceQueued.is_mounted());
        assert!(!UnitState::TearingDown.is_mounted());
        assert!(UnitState::TearingDown.has_memory_copy());
        assert!(!UnitState::PersistentReady.has_memory_copy());
        assert_eq!(UnitState::ServiceRunning.to_string(), "service-running");
    }
}
