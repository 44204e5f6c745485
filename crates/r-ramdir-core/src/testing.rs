//! ---
//! ramdir_section: "15-testing-qa-runbook"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "In-memory doubles for the service, mount and supervisor seams."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
//! Test doubles that let the full lifecycle run without root, systemd or a
//! supervisor socket. All of them can share a [`Journal`] so tests can assert
//! on the relative order of side effects across seams.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ServiceError, ServiceTarget};
use crate::mount::Mounter;
use crate::notify::Notifier;
use crate::service::ServiceBackend;

/// Ordered record of side effects shared between doubles.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Position of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e == entry)
    }
}

/// How a scripted unit reacts to a state change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behaviour {
    /// Reaches the requested state immediately.
    Converge,
    /// Reaches the requested state after this many status polls.
    ConvergeAfter(u32),
    /// Accepts the request but never changes state.
    Stuck,
    /// Refuses the request outright.
    Reject(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    running: HashMap<String, bool>,
    behaviours: HashMap<(String, bool), Behaviour>,
    pending: HashMap<String, (bool, u32)>,
    requests: Vec<(String, ServiceTarget)>,
}

/// Service backend driven entirely by in-memory state.
#[derive(Debug, Default)]
pub struct ScriptedServiceBackend {
    state: Mutex<ScriptState>,
    journal: Option<Journal>,
}

impl ScriptedServiceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn set_running(&self, unit: &str, running: bool) {
        self.state.lock().running.insert(unit.to_owned(), running);
    }

    pub fn set_behaviour(&self, unit: &str, target: ServiceTarget, behaviour: Behaviour) {
        self.state.lock().behaviours.insert(
            (unit.to_owned(), target == ServiceTarget::Running),
            behaviour,
        );
    }

    pub fn is_running(&self, unit: &str) -> bool {
        self.state.lock().running.get(unit).copied().unwrap_or(false)
    }

    /// Every request issued so far, in order.
    pub fn requests(&self) -> Vec<(String, ServiceTarget)> {
        self.state.lock().requests.clone()
    }

    pub fn requests_for(&self, unit: &str) -> Vec<ServiceTarget> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(name, _)| name == unit)
            .map(|(_, target)| *target)
            .collect()
    }
}

#[async_trait]
impl ServiceBackend for ScriptedServiceBackend {
    async fn is_active(&self, unit: &str) -> Result<bool, ServiceError> {
        let mut state = self.state.lock();
        if let Some((want, remaining)) = state.pending.get(unit).copied() {
            if remaining <= 1 {
                state.pending.remove(unit);
                state.running.insert(unit.to_owned(), want);
            } else {
                state.pending.insert(unit.to_owned(), (want, remaining - 1));
            }
        }
        Ok(state.running.get(unit).copied().unwrap_or(false))
    }

    async fn request(&self, unit: &str, target: ServiceTarget) -> Result<(), ServiceError> {
        let want = target == ServiceTarget::Running;
        let mut state = self.state.lock();
        state.requests.push((unit.to_owned(), target));
        if let Some(journal) = &self.journal {
            let verb = if want { "start" } else { "stop" };
            journal.record(format!("{} {}", verb, unit));
        }
        let behaviour = state
            .behaviours
            .get(&(unit.to_owned(), want))
            .cloned()
            .unwrap_or(Behaviour::Converge);
        match behaviour {
            Behaviour::Converge => {
                state.running.insert(unit.to_owned(), want);
            }
            Behaviour::ConvergeAfter(polls) => {
                state.pending.insert(unit.to_owned(), (want, polls));
            }
            Behaviour::Stuck => {}
            Behaviour::Reject(detail) => {
                return Err(ServiceError::Rejected {
                    unit: unit.to_owned(),
                    target,
                    detail,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MountTable {
    mounts: HashMap<PathBuf, PathBuf>,
    failing_binds: HashSet<PathBuf>,
    failing_unmounts: HashSet<PathBuf>,
}

/// Mount backend that only tracks a mount table in memory.
#[derive(Debug, Default)]
pub struct MemoryMounter {
    table: Mutex<MountTable>,
    journal: Option<Journal>,
}

impl MemoryMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Pretend something foreign is already mounted at `target`.
    pub fn mark_mounted(&self, target: &Path) {
        self.table
            .lock()
            .mounts
            .insert(target.to_path_buf(), PathBuf::from("foreign"));
    }

    pub fn fail_bind(&self, target: &Path) {
        self.table.lock().failing_binds.insert(target.to_path_buf());
    }

    pub fn fail_unmount(&self, target: &Path) {
        self.table
            .lock()
            .failing_unmounts
            .insert(target.to_path_buf());
    }

    /// What is bound at `target`, if anything.
    pub fn source_of(&self, target: &Path) -> Option<PathBuf> {
        self.table.lock().mounts.get(target).cloned()
    }

    pub fn mount_count(&self) -> usize {
        self.table.lock().mounts.len()
    }
}

impl Mounter for MemoryMounter {
    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        Ok(self.table.lock().mounts.contains_key(target))
    }

    fn bind(&self, source: &Path, target: &Path) -> io::Result<()> {
        let mut table = self.table.lock();
        if table.failing_binds.contains(target) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        table
            .mounts
            .insert(target.to_path_buf(), source.to_path_buf());
        if let Some(journal) = &self.journal {
            journal.record(format!("bind {}", target.display()));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let mut table = self.table.lock();
        if table.failing_unmounts.contains(target) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        if table.mounts.remove(target).is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if let Some(journal) = &self.journal {
            journal.record(format!("unmount {}", target.display()));
        }
        Ok(())
    }
}

/// Notifier that keeps every message it was asked to send.
#[derive(Debug)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    supervised: bool,
    watchdog: Option<Duration>,
    journal: Option<Journal>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            supervised: true,
            watchdog: None,
            journal: None,
        }
    }
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that behaves as if no supervisor is listening.
    pub fn unsupervised() -> Self {
        Self {
            supervised: false,
            ..Self::default()
        }
    }

    pub fn with_watchdog(mut self, period: Duration) -> Self {
        self.watchdog = Some(period);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn is_supervised(&self) -> bool {
        self.supervised
    }

    fn send_raw(&self, message: &str) -> io::Result<()> {
        self.messages.lock().push(message.to_owned());
        if let Some(journal) = &self.journal {
            // First line is enough to identify the transition.
            let head = message.lines().next().unwrap_or_default();
            journal.record(format!("notify {}", head));
        }
        Ok(())
    }

    fn watchdog_interval(&self) -> Option<Duration> {
        self.watchdog
    }
}
