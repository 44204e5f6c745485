//! ---
//! ramdir_section: "03-persistence-logging"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Periodic and forced mirroring of memory copies back to disk."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
//! Checkpointing of a resource's memory copy into its persistent path.
//!
//! A [`Checkpointer`] performs single flushes. [`spawn_loop`] runs the
//! periodic sleep-then-flush cycle for one resource and owns that resource's
//! [`CheckpointStatus`] until the loop is cancelled and joined.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use r_ramdir_common::ResourceConfig;
use r_ramdir_metrics::LifecycleMetrics;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FlushError;
use crate::fsops::{self, MirrorStats};

/// One synchronisation of a memory copy into its persistent path.
#[derive(Debug, Clone)]
pub struct CheckpointJob {
    pub resource: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub forced: bool,
}

impl CheckpointJob {
    pub fn for_resource(config: &ResourceConfig, forced: bool) -> Self {
        Self {
            resource: config.name.clone(),
            source: config.memory_path.clone(),
            destination: config.persistent_path.clone(),
            forced,
        }
    }

    /// Mirror source into destination, then wait for the writes to be durable.
    ///
    /// Blocking; run it on a blocking-capable thread.
    pub fn run(&self) -> Result<MirrorStats, FlushError> {
        match fs::metadata(&self.source) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(FlushError::SourceMissing(self.source.clone())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(FlushError::SourceMissing(self.source.clone()))
            }
            Err(err) => return Err(self.failure(err)),
        }

        let source_empty = fsops::is_empty_dir(&self.source).map_err(|err| self.failure(err))?;
        if source_empty
            && fsops::has_entries(&self.destination).map_err(|err| self.failure(err))?
        {
            return Err(FlushError::UnsafeEmptySource {
                memory: self.source.clone(),
                persistent: self.destination.clone(),
            });
        }

        let stats =
            fsops::mirror_tree(&self.source, &self.destination).map_err(|err| self.failure(err))?;
        fsops::sync_filesystem(&self.destination).map_err(|err| self.failure(err))?;
        Ok(stats)
    }

    fn failure(&self, cause: io::Error) -> FlushError {
        FlushError::FlushFailure {
            memory: self.source.clone(),
            persistent: self.destination.clone(),
            cause,
        }
    }
}

/// Result of a flush that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Shutdown is in progress and the flush was not forced.
    Skipped,
    Mirrored(MirrorStats),
}

/// Bookkeeping of flush attempts for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStatus {
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_flushes: u64,
    pub total_failures: u64,
}

impl CheckpointStatus {
    /// Record an attempt. Skipped flushes are not attempts and leave no trace.
    pub fn record(&mut self, result: &Result<FlushOutcome, FlushError>) {
        let now = Utc::now();
        match result {
            Ok(FlushOutcome::Skipped) => {}
            Ok(FlushOutcome::Mirrored(_)) => {
                self.last_checkpoint = Some(now);
                self.last_success = Some(now);
                self.last_error = None;
                self.consecutive_failures = 0;
                self.total_flushes += 1;
            }
            Err(err) => {
                self.last_checkpoint = Some(now);
                self.last_error = Some(err.to_string());
                self.consecutive_failures += 1;
                self.total_failures += 1;
            }
        }
    }
}

/// Performs flushes for one resource.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    config: Arc<ResourceConfig>,
    shutdown: CancellationToken,
    metrics: Option<LifecycleMetrics>,
}

impl Checkpointer {
    /// `shutdown` is the manager-wide flag; once cancelled, only forced flushes run.
    pub fn new(config: Arc<ResourceConfig>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            shutdown,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<LifecycleMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn resource(&self) -> &str {
        &self.config.name
    }

    pub async fn flush(&self, forced: bool) -> Result<FlushOutcome, FlushError> {
        let resource = self.config.name.as_str();
        if !forced && self.shutdown.is_cancelled() {
            debug!(resource, "shutdown in progress; skipping periodic flush");
            return Ok(FlushOutcome::Skipped);
        }

        let job = CheckpointJob::for_resource(&self.config, forced);
        let started = Instant::now();
        let result = match tokio::task::spawn_blocking(move || job.run()).await {
            Ok(result) => result,
            Err(err) => Err(FlushError::Aborted(err.to_string())),
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(stats) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_checkpoint(resource, forced, elapsed.as_secs_f64());
                }
                info!(
                    resource,
                    forced,
                    copied = stats.copied,
                    removed = stats.removed,
                    bytes = stats.bytes,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "checkpoint complete"
                );
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_checkpoint_failure(resource, err.reason());
                }
                warn!(resource, forced, reason = err.reason(), error = %err, "checkpoint failed");
            }
        }
        result.map(FlushOutcome::Mirrored)
    }
}

/// Handle to a running periodic loop, owned by the manager.
#[derive(Debug)]
pub struct CheckpointLoopHandle {
    resource: String,
    cancel: CancellationToken,
    task: JoinHandle<CheckpointStatus>,
}

impl CheckpointLoopHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Interrupt the loop's current sleep. The loop will not flush again.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel, wait for the loop to exit and take back its status.
    pub async fn join(self) -> Result<CheckpointStatus, JoinError> {
        self.cancel.cancel();
        self.task.await
    }
}

/// Start the periodic loop for one resource.
///
/// A zero `interval` makes the loop idle in steps of `idle_period` without ever
/// flushing; the forced flush at teardown is then the only checkpoint.
pub fn spawn_loop(
    checkpointer: Checkpointer,
    interval: Duration,
    idle_period: Duration,
    status: CheckpointStatus,
    cancel: CancellationToken,
) -> CheckpointLoopHandle {
    let resource = checkpointer.resource().to_owned();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut status = status;
        let resource = checkpointer.resource().to_owned();
        let period = if interval.is_zero() { idle_period } else { interval };
        debug!(resource = %resource, interval_secs = interval.as_secs(), "checkpoint loop started");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            if interval.is_zero() {
                continue;
            }
            let result = checkpointer.flush(false).await;
            status.record(&result);
            if status.consecutive_failures > 1 {
                warn!(
                    resource = %resource,
                    consecutive_failures = status.consecutive_failures,
                    "checkpoints keep failing"
                );
            }
        }
        debug!(resource = %resource, "checkpoint loop stopped");
        status
    });
    CheckpointLoopHandle {
        resource,
        cancel,
        task,
    }
}
