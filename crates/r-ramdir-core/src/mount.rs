//! ---
//! ramdir_section: "02-storage-lifecycle"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Bind mount backend and mount table queries."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{debug, warn};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Bind mount operations a mount unit needs from the host.
pub trait Mounter: Send + Sync + Debug {
    /// Whether `target` is currently a mount point.
    fn is_mounted(&self, target: &Path) -> io::Result<bool>;

    /// Expose `source` at `target`.
    fn bind(&self, source: &Path, target: &Path) -> io::Result<()>;

    /// Detach whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> io::Result<()>;
}

/// Mounter backed by the kernel's mount syscalls.
#[derive(Debug, Clone)]
pub struct KernelMounter {
    mountinfo: PathBuf,
}

impl Default for KernelMounter {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from(MOUNTINFO),
        }
    }
}

impl KernelMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read mount points from an alternative mountinfo file.
    pub fn with_mountinfo(path: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: path.into(),
        }
    }
}

impl Mounter for KernelMounter {
    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        let target = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        let table = fs::read_to_string(&self.mountinfo)?;
        let found = mount_points(&table).any(|point| point == target);
        Ok(found)
    }

    fn bind(&self, source: &Path, target: &Path) -> io::Result<()> {
        mount::<Path, Path, str, str>(Some(source), target, None, MsFlags::MS_BIND, None)?;
        debug!(source = %source.display(), target = %target.display(), "bind mount established");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => Ok(()),
            Err(Errno::EBUSY) => {
                warn!(target = %target.display(), "mount point busy; detaching lazily");
                umount2(target, MntFlags::MNT_DETACH)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Mount points listed in a `/proc/<pid>/mountinfo` table.
pub fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
}

/// Decode the octal escapes (`\040` for space, etc.) the kernel applies to paths.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
35 22 0:30 / /run rw,nosuid,nodev shared:12 - tmpfs tmpfs rw
61 22 0:30 /r-ramdir/rrd /var/lib/rrdcached rw,relatime shared:12 - tmpfs tmpfs rw
62 22 8:1 /srv /mnt/with\\040space rw - ext4 /dev/sda1 rw
";

    #[test]
    fn parses_mount_points() {
        let points: Vec<_> = mount_points(SAMPLE).collect();
        assert_eq!(
            points,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/run"),
                PathBuf::from("/var/lib/rrdcached"),
                PathBuf::from("/mnt/with space"),
            ]
        );
    }

    #[test]
    fn unescape_leaves_plain_text_untouched() {
        assert_eq!(unescape_mount_field("/plain/path"), "/plain/path");
        assert_eq!(unescape_mount_field("/tab\\011x"), "/tab\tx");
        assert_eq!(unescape_mount_field("/trailing\\"), "/trailing\\");
    }

    #[test]
    fn kernel_mounter_reads_alternate_table() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("mountinfo");
        fs::write(&table, SAMPLE).unwrap();
        let mounter = KernelMounter::with_mountinfo(&table);
        assert!(mounter.is_mounted(Path::new("/var/lib/rrdcached")).unwrap());
        assert!(!mounter.is_mounted(Path::new("/var/lib/pve-cluster")).unwrap());
    }
}
