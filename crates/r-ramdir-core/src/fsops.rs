//! ---
//! ramdir_section: "02-storage-lifecycle"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Directory copy, mirror-with-delete and durability helpers."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
//! Blocking filesystem primitives used by mount units and checkpoints.
//!
//! Every function here performs synchronous I/O and is expected to run on a
//! blocking-capable thread (`tokio::task::spawn_blocking`) when called from
//! async code.

use std::collections::HashSet;
use std::fs::{self, File, Metadata};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use r_ramdir_common::PostPopulateHook;
use tracing::debug;
use walkdir::WalkDir;

/// Counters describing one copy or mirror pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub copied: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub bytes: u64,
}

/// Returns `true` when `path` is a directory without entries.
pub fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Returns `true` when `path` exists and has at least one entry.
pub fn has_entries(path: &Path) -> io::Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Copy `src` into `dst` without deleting anything already present in `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<MirrorStats> {
    transfer(src, dst, false)
}

/// Make `dst` an exact replica of `src`, deleting entries absent from `src`.
///
/// Files whose type, size and modification time already match are left alone,
/// so repeated mirrors of an unchanged tree do no data copying.
pub fn mirror_tree(src: &Path, dst: &Path) -> io::Result<MirrorStats> {
    transfer(src, dst, true)
}

/// Remove `path` and everything under it. Returns `false` if it was absent.
pub fn remove_tree(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map(|_| true),
        Ok(_) => fs::remove_file(path).map(|_| true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Apply the configured ownership (recursively) and root mode to `path`.
pub fn apply_post_populate(path: &Path, hook: &PostPopulateHook) -> io::Result<()> {
    if hook.owner.is_some() || hook.group.is_some() {
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry?;
            lchown(entry.path(), hook.owner, hook.group)?;
        }
    }
    if let Some(mode) = hook.mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// Block until all writes on the filesystem holding `path` are committed.
pub fn sync_filesystem(path: &Path) -> io::Result<()> {
    let dir = File::open(path)?;
    // SAFETY: the descriptor stays open for the duration of the call.
    let rc = unsafe { libc::syncfs(dir.as_raw_fd()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn transfer(src: &Path, dst: &Path, prune: bool) -> io::Result<MirrorStats> {
    let root_meta = fs::metadata(src)?;
    if !root_meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", src.display()),
        ));
    }
    fs::create_dir_all(dst)?;

    let preserve_owner = nix::unistd::geteuid().is_root();
    let mut stats = MirrorStats::default();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut directories: Vec<(PathBuf, Metadata)> = Vec::new();

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
            .to_path_buf();
        let target = dst.join(&relative);
        let meta = entry.path().symlink_metadata()?;
        let kind = meta.file_type();
        if !(kind.is_dir() || kind.is_file() || kind.is_symlink()) {
            debug!(path = %entry.path().display(), "skipping special file");
            continue;
        }

        if prune {
            seen.insert(relative);
        }

        if meta.is_dir() {
            if !fs::symlink_metadata(&target)
                .map(|existing| existing.is_dir())
                .unwrap_or(false)
            {
                remove_tree(&target)?;
                fs::create_dir(&target)?;
            }
            directories.push((target, meta));
            continue;
        }

        if !needs_copy(entry.path(), &meta, &target)? {
            stats.unchanged += 1;
            continue;
        }

        if meta.file_type().is_symlink() {
            remove_tree(&target)?;
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link, &target)?;
            let mtime = FileTime::from_last_modification_time(&meta);
            filetime::set_symlink_file_times(&target, mtime, mtime)?;
        } else {
            if fs::symlink_metadata(&target)
                .map(|existing| !existing.is_file())
                .unwrap_or(false)
            {
                remove_tree(&target)?;
            }
            stats.bytes += fs::copy(entry.path(), &target)?;
            let atime = FileTime::from_last_access_time(&meta);
            let mtime = FileTime::from_last_modification_time(&meta);
            filetime::set_file_times(&target, atime, mtime)?;
        }
        if preserve_owner {
            lchown(&target, Some(meta.uid()), Some(meta.gid()))?;
        }
        stats.copied += 1;
    }

    if prune {
        for entry in WalkDir::new(dst)
            .min_depth(1)
            .contents_first(true)
            .follow_links(false)
        {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(dst)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            if seen.contains(relative) {
                continue;
            }
            if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
            debug!(path = %entry.path().display(), "removed entry absent from source");
            stats.removed += 1;
        }
    }

    // Directory attributes last: copying children would otherwise bump mtimes,
    // and a read-only mode would block the copy itself.
    directories.push((dst.to_path_buf(), root_meta));
    for (path, meta) in directories.iter().rev() {
        fs::set_permissions(path, meta.permissions())?;
        let mtime = FileTime::from_last_modification_time(meta);
        filetime::set_file_times(path, FileTime::from_last_access_time(meta), mtime)?;
        if preserve_owner {
            lchown(path, Some(meta.uid()), Some(meta.gid()))?;
        }
    }

    Ok(stats)
}

fn needs_copy(src: &Path, meta: &Metadata, target: &Path) -> io::Result<bool> {
    let existing = match fs::symlink_metadata(target) {
        Ok(existing) => existing,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err),
    };
    if existing.file_type() != meta.file_type() {
        return Ok(true);
    }
    if meta.file_type().is_symlink() {
        return Ok(fs::read_link(src)? != fs::read_link(target)?);
    }
    Ok(existing.len() != meta.len()
        || FileTime::from_last_modification_time(&existing)
            != FileTime::from_last_modification_time(meta)
        || existing.permissions() != meta.permissions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("nested/deeper")).unwrap();
        fs::write(root.join("a"), b"alpha").unwrap();
        fs::write(root.join("nested/b"), b"bravo").unwrap();
        fs::write(root.join("nested/deeper/c"), b"charlie").unwrap();
        std::os::unix::fs::symlink("a", root.join("link-to-a")).unwrap();
    }

    fn listing(root: &Path) -> Vec<String> {
        let mut entries: Vec<String> = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| {
                e.unwrap()
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .display()
                    .to_string()
            })
            .collect();
        entries.sort();
        entries
    }

    #[test]
    fn copy_tree_replicates_nested_content() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src);

        let stats = copy_tree(&src, &dst).unwrap();
        assert_eq!(stats.copied, 4);
        assert_eq!(listing(&src), listing(&dst));
        assert_eq!(fs::read(dst.join("nested/deeper/c")).unwrap(), b"charlie");
        assert_eq!(fs::read_link(dst.join("link-to-a")).unwrap(), PathBuf::from("a"));
    }

    #[test]
    fn copy_tree_never_deletes_destination_entries() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src);
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("keep-me"), b"x").unwrap();

        copy_tree(&src, &dst).unwrap();
        assert!(dst.join("keep-me").exists());
    }

    #[test]
    fn mirror_tree_removes_extras_and_skips_unchanged() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src);
        mirror_tree(&src, &dst).unwrap();

        fs::create_dir_all(dst.join("stale/dir")).unwrap();
        fs::write(dst.join("stale/dir/file"), b"old").unwrap();
        fs::write(dst.join("orphan"), b"old").unwrap();

        let stats = mirror_tree(&src, &dst).unwrap();
        assert_eq!(stats.copied, 0);
        assert_eq!(stats.unchanged, 4);
        assert_eq!(stats.removed, 4);
        assert_eq!(listing(&src), listing(&dst));
    }

    #[test]
    fn mirror_tree_recopies_modified_files() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src);
        mirror_tree(&src, &dst).unwrap();

        fs::write(src.join("a"), b"alpha, but longer").unwrap();
        let stats = mirror_tree(&src, &dst).unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(fs::read(dst.join("a")).unwrap(), b"alpha, but longer");
    }

    #[test]
    fn mirror_tree_replaces_entries_that_changed_type() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("thing")).unwrap();
        fs::write(src.join("thing/inner"), b"1").unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("thing"), b"was a file").unwrap();

        mirror_tree(&src, &dst).unwrap();
        assert!(dst.join("thing").is_dir());
        assert_eq!(fs::read(dst.join("thing/inner")).unwrap(), b"1");
    }

    #[test]
    fn mirror_of_empty_source_empties_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        populate(&dst);

        mirror_tree(&src, &dst).unwrap();
        assert!(is_empty_dir(&dst).unwrap());
    }

    #[test]
    fn mirror_prunes_destination_entry_shadowed_by_special_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src);
        nix::unistd::mkfifo(&src.join("pipe"), nix::sys::stat::Mode::S_IRWXU).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("pipe"), b"stale").unwrap();

        let stats = mirror_tree(&src, &dst).unwrap();

        assert!(!dst.join("pipe").exists());
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.copied, 4);
    }

    #[test]
    fn transfer_rejects_non_directory_source() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        let err = copy_tree(&file, &dir.path().join("dst")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn remove_tree_tolerates_missing_paths() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("gone");
        assert!(!remove_tree(&target).unwrap());
        populate(&target);
        assert!(remove_tree(&target).unwrap());
        assert!(!target.exists());
    }

    #[test]
    fn has_entries_reports_missing_as_empty() {
        let dir = tempdir().unwrap();
        assert!(!has_entries(&dir.path().join("missing")).unwrap());
        assert!(!has_entries(dir.path()).unwrap());
        fs::write(dir.path().join("x"), b"x").unwrap();
        assert!(has_entries(dir.path()).unwrap());
    }

    #[test]
    fn post_populate_sets_root_mode() {
        let dir = tempdir().unwrap();
        let hook = PostPopulateHook {
            owner: None,
            group: None,
            mode: Some(0o750),
        };
        apply_post_populate(dir.path(), &hook).unwrap();
        let mode = fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn sync_filesystem_succeeds_on_directory() {
        let dir = tempdir().unwrap();
        sync_filesystem(dir.path()).unwrap();
    }
}
