//! ---
//! ramdir_section: "01-core-functionality"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Readiness and liveness notifications to the process supervisor."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
use std::fmt::Debug;
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";
const WATCHDOG_USEC_ENV: &str = "WATCHDOG_USEC";
const WATCHDOG_PID_ENV: &str = "WATCHDOG_PID";

/// State transitions announced to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent<'a> {
    /// Every mount is in place; dependent services may still be pending.
    Ready(&'a str),
    /// Every deferred service has started.
    Running,
    Stopping,
    Watchdog,
    Status(&'a str),
}

impl SupervisorEvent<'_> {
    /// Wire encoding of the event (newline separated `KEY=VALUE` pairs).
    pub fn encode(&self) -> String {
        match self {
            SupervisorEvent::Ready(status) => format!("READY=1\nSTATUS={}", status),
            SupervisorEvent::Running => "STATUS=running".to_owned(),
            SupervisorEvent::Stopping => "STOPPING=1\nSTATUS=stopping".to_owned(),
            SupervisorEvent::Watchdog => "WATCHDOG=1".to_owned(),
            SupervisorEvent::Status(status) => format!("STATUS={}", status),
        }
    }
}

/// Channel to the process supervisor.
pub trait Notifier: Send + Sync + Debug {
    /// Whether a supervisor is listening at all.
    fn is_supervised(&self) -> bool;

    /// Deliver one already encoded message.
    fn send_raw(&self, message: &str) -> io::Result<()>;

    /// Period at which liveness pings are expected, if any.
    fn watchdog_interval(&self) -> Option<Duration> {
        None
    }

    fn notify(&self, event: SupervisorEvent<'_>) -> io::Result<()> {
        if !self.is_supervised() {
            return Ok(());
        }
        self.send_raw(&event.encode())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NotifyTarget {
    Path(PathBuf),
    Abstract(Vec<u8>),
}

/// `sd_notify` compatible datagram notifier.
#[derive(Debug, Clone, Default)]
pub struct SystemdNotifier {
    target: Option<NotifyTarget>,
    watchdog: Option<Duration>,
}

impl SystemdNotifier {
    /// Build from `NOTIFY_SOCKET`, `WATCHDOG_USEC` and `WATCHDOG_PID`.
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var(NOTIFY_SOCKET_ENV).ok().as_deref(),
            std::env::var(WATCHDOG_USEC_ENV).ok().as_deref(),
            std::env::var(WATCHDOG_PID_ENV).ok().as_deref(),
            std::process::id(),
        )
    }

    fn from_values(
        socket: Option<&str>,
        watchdog_usec: Option<&str>,
        watchdog_pid: Option<&str>,
        own_pid: u32,
    ) -> Self {
        let target = socket.filter(|s| !s.is_empty()).map(|s| {
            match s.strip_prefix('@') {
                Some(name) => NotifyTarget::Abstract(name.as_bytes().to_vec()),
                None => NotifyTarget::Path(PathBuf::from(s)),
            }
        });
        let pid_matches = watchdog_pid
            .map(|pid| pid.trim().parse::<u32>().ok() == Some(own_pid))
            .unwrap_or(true);
        let watchdog = watchdog_usec
            .and_then(|usec| usec.trim().parse::<u64>().ok())
            .filter(|usec| *usec > 0 && pid_matches && target.is_some())
            .map(Duration::from_micros);
        Self { target, watchdog }
    }

    /// Notifier bound to an explicit socket path.
    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Some(NotifyTarget::Path(path.into())),
            watchdog: None,
        }
    }
}

impl Notifier for SystemdNotifier {
    fn is_supervised(&self) -> bool {
        self.target.is_some()
    }

    fn send_raw(&self, message: &str) -> io::Result<()> {
        let Some(target) = &self.target else {
            return Ok(());
        };
        let socket = UnixDatagram::unbound()?;
        match target {
            NotifyTarget::Path(path) => socket.send_to(message.as_bytes(), path)?,
            NotifyTarget::Abstract(name) => {
                let addr = SocketAddr::from_abstract_name(name)?;
                socket.send_to_addr(message.as_bytes(), &addr)?
            }
        };
        debug!(message, "supervisor notified");
        Ok(())
    }

    fn watchdog_interval(&self) -> Option<Duration> {
        self.watchdog
    }
}

/// Keep the supervisor's watchdog fed at half its period until `token` fires.
pub fn spawn_watchdog(
    notifier: Arc<dyn Notifier>,
    token: CancellationToken,
) -> Option<JoinHandle<()>> {
    let period = notifier.watchdog_interval()? / 2;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = notifier.notify(SupervisorEvent::Watchdog) {
                        warn!(error = %err, "failed to send watchdog ping");
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingNotifier;
    use tempfile::tempdir;

    #[test]
    fn encodes_events() {
        assert_eq!(
            SupervisorEvent::Ready("mounts established").encode(),
            "READY=1\nSTATUS=mounts established"
        );
        assert_eq!(SupervisorEvent::Running.encode(), "STATUS=running");
        assert_eq!(SupervisorEvent::Watchdog.encode(), "WATCHDOG=1");
    }

    #[test]
    fn unsupervised_notifier_is_silent() {
        let notifier = SystemdNotifier::from_values(None, Some("1000000"), None, 1);
        assert!(!notifier.is_supervised());
        assert_eq!(notifier.watchdog_interval(), None);
        notifier.notify(SupervisorEvent::Running).unwrap();
    }

    #[test]
    fn parses_abstract_socket_and_watchdog() {
        let notifier =
            SystemdNotifier::from_values(Some("@/org/freedesktop/notify"), Some("4000000"), Some("7"), 7);
        assert_eq!(
            notifier.target,
            Some(NotifyTarget::Abstract(b"/org/freedesktop/notify".to_vec()))
        );
        assert_eq!(notifier.watchdog_interval(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn watchdog_ignored_for_other_pid() {
        let notifier =
            SystemdNotifier::from_values(Some("/run/notify"), Some("4000000"), Some("8"), 7);
        assert!(notifier.is_supervised());
        assert_eq!(notifier.watchdog_interval(), None);
    }

    #[test]
    fn delivers_datagrams_to_socket_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        let notifier = SystemdNotifier::with_socket(&path);
        notifier.notify(SupervisorEvent::Ready("ok")).unwrap();

        let mut buf = [0u8; 128];
        let len = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"READY=1\nSTATUS=ok");
    }

    #[tokio::test]
    async fn watchdog_pings_until_cancelled() {
        let notifier = Arc::new(RecordingNotifier::new().with_watchdog(Duration::from_millis(20)));
        let token = CancellationToken::new();
        let handle = spawn_watchdog(notifier.clone(), token.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(notifier
            .messages()
            .iter()
            .any(|message| message == "WATCHDOG=1"));
    }
}
