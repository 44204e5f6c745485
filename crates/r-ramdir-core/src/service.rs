//! ---
//! ramdir_section: "01-core-functionality"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Service unit control with bounded state convergence."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r_ramdir_common::ServiceConfig;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::error::{ServiceError, ServiceTarget};

/// Raw access to the host service manager.
///
/// Implementations issue requests and report state; convergence and
/// timeouts are handled by [`ServiceController`].
#[async_trait]
pub trait ServiceBackend: Send + Sync + Debug {
    async fn is_active(&self, unit: &str) -> Result<bool, ServiceError>;

    /// Ask for `unit` to move towards `target` without waiting for it.
    async fn request(&self, unit: &str, target: ServiceTarget) -> Result<(), ServiceError>;
}

/// Backend that shells out to `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemctlBackend {
    program: PathBuf,
}

impl SystemctlBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command_error(&self, unit: &str, cause: std::io::Error) -> ServiceError {
        ServiceError::Command {
            unit: unit.to_owned(),
            program: self.program.display().to_string(),
            cause,
        }
    }
}

#[async_trait]
impl ServiceBackend for SystemctlBackend {
    async fn is_active(&self, unit: &str) -> Result<bool, ServiceError> {
        let status = Command::new(&self.program)
            .args(["is-active", "--quiet", unit])
            .status()
            .await
            .map_err(|err| self.command_error(unit, err))?;
        Ok(status.success())
    }

    async fn request(&self, unit: &str, target: ServiceTarget) -> Result<(), ServiceError> {
        let verb = match target {
            ServiceTarget::Running => "start",
            ServiceTarget::Stopped => "stop",
        };
        let output = Command::new(&self.program)
            .args([verb, "--no-block", unit])
            .output()
            .await
            .map_err(|err| self.command_error(unit, err))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Err(ServiceError::Rejected {
            unit: unit.to_owned(),
            target,
            detail: if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            },
        })
    }
}

/// Starts and stops units, waiting for them to reach the requested state.
#[derive(Debug, Clone)]
pub struct ServiceController {
    backend: Arc<dyn ServiceBackend>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ServiceController {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(backend: Arc<dyn ServiceBackend>) -> Self {
        Self {
            backend,
            timeout: Self::DEFAULT_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Controller driving `systemctl` with the configured bounds.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(Arc::new(SystemctlBackend::new(config.systemctl.clone())))
            .with_timing(config.convergence_timeout, config.poll_interval)
    }

    pub fn with_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub async fn is_running(&self, unit: &str) -> Result<bool, ServiceError> {
        self.backend.is_active(unit).await
    }

    /// Stop `unit`; a no-op when it is already stopped.
    pub async fn stop(&self, unit: &str) -> Result<(), ServiceError> {
        self.transition(unit, ServiceTarget::Stopped).await
    }

    /// Start `unit`; a no-op when it is already running.
    pub async fn start(&self, unit: &str) -> Result<(), ServiceError> {
        self.transition(unit, ServiceTarget::Running).await
    }

    async fn transition(&self, unit: &str, target: ServiceTarget) -> Result<(), ServiceError> {
        let want_running = target == ServiceTarget::Running;
        if self.backend.is_active(unit).await? == want_running {
            debug!(unit, %target, "service already in requested state");
            return Ok(());
        }

        info!(unit, %target, "requesting service state change");
        self.backend.request(unit, target).await?;

        let started = Instant::now();
        loop {
            if self.backend.is_active(unit).await? == want_running {
                info!(unit, %target, waited_ms = started.elapsed().as_millis() as u64, "service converged");
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.timeout {
                return Err(ServiceError::ConvergenceTimeout {
                    unit: unit.to_owned(),
                    target,
                    waited,
                });
            }
            sleep(self.poll_interval.min(self.timeout - waited)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behaviour, ScriptedServiceBackend};

    fn controller(backend: Arc<ScriptedServiceBackend>) -> ServiceController {
        ServiceController::new(backend)
            .with_timing(Duration::from_millis(200), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn stop_is_noop_when_already_stopped() {
        let backend = Arc::new(ScriptedServiceBackend::new());
        controller(backend.clone()).stop("a.service").await.unwrap();
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn start_is_noop_when_already_running() {
        let backend = Arc::new(ScriptedServiceBackend::new());
        backend.set_running("a.service", true);
        controller(backend.clone()).start("a.service").await.unwrap();
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn start_issues_one_request_and_polls_until_converged() {
        let backend = Arc::new(ScriptedServiceBackend::new());
        backend.set_behaviour("a.service", ServiceTarget::Running, Behaviour::ConvergeAfter(3));
        controller(backend.clone()).start("a.service").await.unwrap();

        assert_eq!(
            backend.requests(),
            vec![("a.service".to_owned(), ServiceTarget::Running)]
        );
        assert!(backend.is_running("a.service"));
    }

    #[tokio::test]
    async fn stuck_unit_times_out_without_repeating_request() {
        let backend = Arc::new(ScriptedServiceBackend::new());
        backend.set_running("a.service", true);
        backend.set_behaviour("a.service", ServiceTarget::Stopped, Behaviour::Stuck);

        let err = controller(backend.clone()).stop("a.service").await.unwrap_err();
        match err {
            ServiceError::ConvergenceTimeout { unit, target, waited } => {
                assert_eq!(unit, "a.service");
                assert_eq!(target, ServiceTarget::Stopped);
                assert!(waited >= Duration::from_millis(200));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn rejected_request_is_surfaced() {
        let backend = Arc::new(ScriptedServiceBackend::new());
        backend.set_behaviour(
            "a.service",
            ServiceTarget::Running,
            Behaviour::Reject("Unit a.service not found.".to_owned()),
        );
        let err = controller(backend).start("a.service").await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected { .. }));
    }

    #[tokio::test]
    async fn systemctl_backend_reports_missing_program() {
        let backend = SystemctlBackend::new("/nonexistent/systemctl");
        let err = backend.is_active("a.service").await.unwrap_err();
        assert!(matches!(err, ServiceError::Command { .. }));
    }
}
