//! ---
//! ramdir_section: "04-configuration-orchestration"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Immediate or deferred start of dependent services."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
use r_ramdir_common::ActivationMode;
use tracing::{error, info};

use crate::error::{AggregateServiceError, UnitError};
use crate::unit::MountUnit;

/// Decides when each mounted unit's service is started.
///
/// In deferred mode services are only queued during setup and started by
/// [`release_all`](Self::release_all) after readiness has been announced, so
/// a slow first migration cannot run into the supervisor's start deadline.
#[derive(Debug)]
pub struct ActivationCoordinator {
    mode: ActivationMode,
    queued: Vec<String>,
}

impl ActivationCoordinator {
    /// `mode` must already be resolved; `Auto` is treated as immediate.
    pub fn new(mode: ActivationMode) -> Self {
        Self {
            mode,
            queued: Vec::new(),
        }
    }

    pub fn mode(&self) -> ActivationMode {
        self.mode
    }

    pub fn is_deferred(&self) -> bool {
        self.mode.is_deferred()
    }

    /// Names of units waiting for [`release_all`](Self::release_all).
    pub fn queued(&self) -> &[String] {
        &self.queued
    }

    /// Start the unit's service now, or queue it when activation is deferred.
    pub async fn activate(&mut self, unit: &mut MountUnit) -> Result<(), UnitError> {
        if self.is_deferred() {
            self.queue(unit)
        } else {
            unit.start_service().await
        }
    }

    pub fn queue(&mut self, unit: &mut MountUnit) -> Result<(), UnitError> {
        unit.mark_queued()?;
        info!(resource = unit.name(), "service start deferred until ready");
        self.queued.push(unit.name().to_owned());
        Ok(())
    }

    /// Start every queued service, attempting all of them even after a failure.
    pub async fn release_all(&mut self, units: &mut [MountUnit]) -> Result<(), AggregateServiceError> {
        let queued = std::mem::take(&mut self.queued);
        let mut failures = Vec::new();
        for unit in units
            .iter_mut()
            .filter(|unit| queued.iter().any(|name| name == unit.name()))
        {
            match unit.activate_queued().await {
                Ok(()) => info!(resource = unit.name(), "deferred service started"),
                Err(err) => {
                    error!(resource = unit.name(), error = %err, "deferred service start failed");
                    failures.push((unit.name().to_owned(), err));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateServiceError { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use r_ramdir_common::ResourceConfig;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use crate::error::ServiceTarget;
    use crate::service::ServiceController;
    use crate::testing::{Behaviour, MemoryMounter, ScriptedServiceBackend};
    use crate::unit::{UnitContext, UnitState};

    async fn mounted_units(
        root: &std::path::Path,
        backend: Arc<ScriptedServiceBackend>,
        names: &[&str],
    ) -> Vec<MountUnit> {
        let context = UnitContext {
            services: ServiceController::new(backend)
                .with_timing(Duration::from_millis(50), Duration::from_millis(5)),
            mounter: Arc::new(MemoryMounter::new()),
            shutdown: CancellationToken::new(),
            metrics: None,
        };
        let mut units = Vec::new();
        for name in names {
            let disk = root.join(name).join("disk");
            fs::create_dir_all(&disk).unwrap();
            let config = ResourceConfig::new(
                *name,
                format!("{name}.service"),
                disk,
                root.join(name).join("memory"),
                root.join(name).join("persistent"),
            );
            let mut unit = MountUnit::new(Arc::new(config), &context);
            unit.setup().await.unwrap();
            units.push(unit);
        }
        units
    }

    #[tokio::test]
    async fn immediate_mode_starts_right_away() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(ScriptedServiceBackend::new());
        let mut units = mounted_units(dir.path(), backend.clone(), &["a"]).await;
        let mut coordinator = ActivationCoordinator::new(ActivationMode::Immediate);

        coordinator.activate(&mut units[0]).await.unwrap();
        assert_eq!(units[0].state(), UnitState::ServiceRunning);
        assert!(backend.is_running("a.service"));
        assert!(coordinator.queued().is_empty());
    }

    #[tokio::test]
    async fn deferred_mode_waits_for_release() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(ScriptedServiceBackend::new());
        let mut units = mounted_units(dir.path(), backend.clone(), &["a", "b"]).await;
        let mut coordinator = ActivationCoordinator::new(ActivationMode::Deferred);

        for unit in units.iter_mut() {
            coordinator.activate(unit).await.unwrap();
        }
        assert_eq!(coordinator.queued().to_vec(), vec!["a".to_owned(), "b".to_owned()]);
        assert!(backend.requests().is_empty());

        coordinator.release_all(&mut units).await.unwrap();
        assert!(units.iter().all(|u| u.state() == UnitState::ServiceRunning));
        assert!(coordinator.queued().is_empty());
    }

    #[tokio::test]
    async fn release_collects_every_failure() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(ScriptedServiceBackend::new());
        backend.set_behaviour("a.service", ServiceTarget::Running, Behaviour::Stuck);
        backend.set_behaviour(
            "c.service",
            ServiceTarget::Running,
            Behaviour::Reject("not found".to_owned()),
        );
        let mut units = mounted_units(dir.path(), backend.clone(), &["a", "b", "c"]).await;
        let mut coordinator = ActivationCoordinator::new(ActivationMode::Deferred);
        for unit in units.iter_mut() {
            coordinator.queue(unit).unwrap();
        }

        let err = coordinator.release_all(&mut units).await.unwrap_err();
        assert_eq!(err.resources().collect::<Vec<_>>(), vec!["a", "c"]);
        assert!(backend.is_running("b.service"));
        assert_eq!(units[0].state(), UnitState::ServiceQueued);
        assert_eq!(units[1].state(), UnitState::ServiceRunning);
    }
}
