//! ---
//! ramdir_section: "01-core-functionality"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Startup and shutdown orchestration across all mount units."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
//! The manager drives every enabled resource through its lifecycle.
//!
//! Startup: lock, set up every unit, unwind everything if any unit failed,
//! announce readiness, release deferred service starts, announce running,
//! start checkpoint loops. Shutdown: raise the shutdown flag, cancel and join
//! every loop, tear every unit down, release the lock.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use r_ramdir_common::{ActivationMode, AppConfig};
use r_ramdir_metrics::LifecycleMetrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::activation::ActivationCoordinator;
use crate::checkpoint::CheckpointLoopHandle;
use crate::error::{ShutdownError, StartupError, TeardownFailure, UnitError};
use crate::lock::{InstanceLock, LockHandle};
use crate::mount::{KernelMounter, Mounter};
use crate::notify::{spawn_watchdog, Notifier, SupervisorEvent, SystemdNotifier};
use crate::service::ServiceController;
use crate::unit::{MountUnit, UnitContext};

/// Host integrations the manager drives. Swapped for doubles in tests.
#[derive(Debug, Clone)]
pub struct ManagerDeps {
    pub services: ServiceController,
    pub mounter: Arc<dyn Mounter>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Option<LifecycleMetrics>,
}

impl ManagerDeps {
    /// `systemctl`, kernel bind mounts and `$NOTIFY_SOCKET`.
    pub fn production(config: &AppConfig) -> Self {
        Self {
            services: ServiceController::from_config(&config.service),
            mounter: Arc::new(KernelMounter::new()),
            notifier: Arc::new(SystemdNotifier::from_env()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: LifecycleMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Not yet started manager for one configuration.
#[derive(Debug)]
pub struct Manager {
    config: Arc<AppConfig>,
    deps: ManagerDeps,
}

impl Manager {
    pub fn new(config: AppConfig, deps: ManagerDeps) -> Self {
        Self {
            config: Arc::new(config),
            deps,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Activation mode after resolving `auto` against the supervisor.
    pub fn activation_mode(&self) -> ActivationMode {
        self.config
            .activation
            .mode
            .resolve(self.deps.notifier.is_supervised())
    }

    /// Bring every enabled resource up.
    ///
    /// Fails fast with [`StartupError::Lock`] before touching anything if
    /// another instance runs. Any other failure unwinds all units and releases
    /// the lock before returning.
    pub async fn start(self) -> Result<RunningManager, StartupError> {
        let mut lock = InstanceLock::from_config(&self.config.lock).acquire()?;
        let mode = self.activation_mode();
        let shutdown = CancellationToken::new();
        let context = UnitContext {
            services: self.deps.services.clone(),
            mounter: self.deps.mounter.clone(),
            shutdown: shutdown.clone(),
            metrics: self.deps.metrics.clone(),
        };
        let mut units: Vec<MountUnit> = self
            .config
            .enabled_resources()
            .map(|resource| MountUnit::new(Arc::new(resource.clone()), &context))
            .collect();
        let notifier = self.deps.notifier.clone();
        info!(units = units.len(), mode = ?mode, "starting manager");

        let mut failures: Vec<UnitError> = Vec::new();
        for unit in units.iter_mut() {
            if let Err(err) = unit.setup().await {
                error!(resource = unit.name(), error = %err, "setup failed");
                failures.push(err);
            }
        }

        let mut coordinator = ActivationCoordinator::new(mode);
        if failures.is_empty() {
            for unit in units.iter_mut() {
                if let Err(err) = coordinator.activate(unit).await {
                    error!(resource = unit.name(), error = %err, "service activation failed");
                    failures.push(err);
                }
            }
        }

        if !failures.is_empty() {
            let unwind = abort_startup(&shutdown, &mut units, &mut lock, notifier.as_ref()).await;
            return Err(StartupError::Setup { failures, unwind });
        }

        if let Err(err) = notifier.notify(SupervisorEvent::Ready("mounts established")) {
            warn!(error = %err, "failed to announce readiness");
        }
        let liveness = CancellationToken::new();
        let watchdog = spawn_watchdog(notifier.clone(), liveness.clone());

        if let Err(error) = coordinator.release_all(&mut units).await {
            let unwind = abort_startup(&shutdown, &mut units, &mut lock, notifier.as_ref()).await;
            liveness.cancel();
            join_watchdog(watchdog).await;
            return Err(StartupError::Activation { error, unwind });
        }
        if let Err(err) = notifier.notify(SupervisorEvent::Running) {
            warn!(error = %err, "failed to announce running status");
        }

        let idle_period = self.config.checkpoint.idle_period;
        let loops = units
            .iter_mut()
            .map(|unit| unit.start_checkpoint_loop(idle_period, shutdown.child_token()))
            .collect();
        info!(units = units.len(), "all resources mounted and services running");

        Ok(RunningManager {
            state: ManagerRuntimeState {
                shutdown,
                units,
                loops,
                lock: Some(lock),
            },
            notifier,
            liveness,
            watchdog,
        })
    }
}

/// Everything a running manager owns. Torn down exactly once.
#[derive(Debug)]
pub struct ManagerRuntimeState {
    shutdown: CancellationToken,
    units: Vec<MountUnit>,
    loops: Vec<CheckpointLoopHandle>,
    lock: Option<LockHandle>,
}

impl ManagerRuntimeState {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn units(&self) -> &[MountUnit] {
        &self.units
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.as_ref().map(LockHandle::is_held).unwrap_or(false)
    }
}

/// A started manager. Consumed by [`shutdown`](Self::shutdown), so it cannot
/// be shut down twice or restarted.
#[derive(Debug)]
pub struct RunningManager {
    state: ManagerRuntimeState,
    notifier: Arc<dyn Notifier>,
    liveness: CancellationToken,
    watchdog: Option<JoinHandle<()>>,
}

impl RunningManager {
    pub fn state(&self) -> &ManagerRuntimeState {
        &self.state
    }

    pub fn units(&self) -> &[MountUnit] {
        self.state.units()
    }

    /// Token that, once cancelled, makes [`run_until`](Self::run_until) shut down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Block until `termination` resolves or shutdown is requested, then shut down.
    pub async fn run_until<F>(self, termination: F) -> Result<(), ShutdownError>
    where
        F: Future<Output = ()>,
    {
        let requested = self.state.shutdown.clone();
        tokio::select! {
            _ = termination => info!("termination requested"),
            _ = requested.cancelled() => info!("shutdown requested"),
        }
        self.shutdown().await
    }

    /// Stop all loops, tear every unit down and release the lock.
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        let RunningManager {
            state,
            notifier,
            liveness,
            watchdog,
        } = self;
        let ManagerRuntimeState {
            shutdown,
            mut units,
            loops,
            mut lock,
        } = state;

        info!("shutting down");
        if let Err(err) = notifier.notify(SupervisorEvent::Stopping) {
            warn!(error = %err, "failed to announce shutdown");
        }
        shutdown.cancel();

        let joined = join_all(loops.into_iter().map(|handle| async move {
            let resource = handle.resource().to_owned();
            (resource, handle.join().await)
        }))
        .await;
        for (resource, outcome) in joined {
            match outcome {
                Ok(status) => {
                    if let Some(unit) = units.iter_mut().find(|unit| unit.name() == resource) {
                        unit.restore_status(status);
                    }
                }
                Err(err) => error!(resource = %resource, error = %err, "checkpoint loop did not exit cleanly"),
            }
        }

        let failures = teardown_all(&mut units).await;
        for unit in &units {
            let status = unit.status();
            info!(
                resource = unit.name(),
                state = %unit.state(),
                flushes = status.total_flushes,
                failures = status.total_failures,
                "unit shut down"
            );
        }

        release_lock(&mut lock);
        liveness.cancel();
        join_watchdog(watchdog).await;

        if failures.is_empty() {
            info!("shutdown complete");
            Ok(())
        } else {
            for failure in &failures {
                error!(failure = %failure, "shutdown step failed");
            }
            Err(ShutdownError { failures })
        }
    }
}

async fn teardown_all(units: &mut [MountUnit]) -> Vec<TeardownFailure> {
    let mut failures = Vec::new();
    for unit in units.iter_mut() {
        failures.extend(unit.teardown().await);
    }
    failures
}

async fn abort_startup(
    shutdown: &CancellationToken,
    units: &mut [MountUnit],
    lock: &mut LockHandle,
    notifier: &dyn Notifier,
) -> Vec<TeardownFailure> {
    warn!("startup failed; unwinding");
    if let Err(err) = notifier.notify(SupervisorEvent::Status("startup failed; unwinding")) {
        warn!(error = %err, "failed to report startup failure");
    }
    shutdown.cancel();
    let unwind = teardown_all(units).await;
    for failure in &unwind {
        error!(failure = %failure, "unwind step failed");
    }
    if let Err(err) = lock.release() {
        error!(error = %err, "failed to release instance lock");
    }
    unwind
}

fn release_lock(lock: &mut Option<LockHandle>) {
    if let Some(handle) = lock.as_mut() {
        if let Err(err) = handle.release() {
            error!(error = %err, "failed to release instance lock");
        }
    }
    lock.take();
}

async fn join_watchdog(watchdog: Option<JoinHandle<()>>) {
    if let Some(handle) = watchdog {
        if let Err(err) = handle.await {
            warn!(error = %err, "watchdog task did not exit cleanly");
        }
    }
}
