//! Exclusive named locks for agent loops.
//!
//! The lock is an advisory `flock` on a marker file in a shared directory. The
//! kernel drops the flock when the holder dies, so a crashed agent never wedges
//! the resource; a clean exit also removes the marker through [`Drop`].

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

/// Capability: take a named lock without blocking, released when the guard drops.
pub trait LockProvider {
    type Guard;

    /// `Ok(None)` means another holder already has `name`.
    fn try_acquire(&self, name: &str) -> Result<Option<Self::Guard>>;
}

/// Lock markers under a single directory.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    dir: PathBuf,
}

impl FileLockProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Held agent lock. Dropping it deletes the marker and releases the flock.
#[derive(Debug)]
pub struct RelayLock {
    file: File,
    path: PathBuf,
}

impl RelayLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Attempts before giving up on a marker that keeps being replaced.
const MAX_ATTEMPTS: usize = 5;

impl LockProvider for FileLockProvider {
    type Guard = RelayLock;

    fn try_acquire(&self, name: &str) -> Result<Option<RelayLock>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create lock dir {}", self.dir.display()))?;
        let path = self.dir.join(name);
        for _ in 0..MAX_ATTEMPTS {
            let file = open_marker(&path)?;
            match claim(file, &path)? {
                Claim::Held(lock) => return Ok(Some(lock)),
                Claim::Contended => return Ok(None),
                Claim::Unlinked => debug!(path = %path.display(), "marker replaced while locking, retrying"),
            }
        }
        warn!(path = %path.display(), "lock marker kept changing, giving up");
        Ok(None)
    }
}

fn open_marker(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open lock marker {}", path.display()))
}

#[derive(Debug)]
enum Claim {
    Held(RelayLock),
    Contended,
    /// The flock was granted on a marker that no longer sits at the path.
    Unlinked,
}

/// Lock an opened marker. The flock only counts if `file` is still the marker
/// at `path`; a previous holder may have unlinked it between open and lock.
fn claim(mut file: File, path: &Path) -> Result<Claim> {
    if let Err(err) = file.try_lock_exclusive() {
        if err.kind() == fs2::lock_contended_error().kind() {
            debug!(path = %path.display(), "lock already held");
            return Ok(Claim::Contended);
        }
        return Err(err).with_context(|| format!("lock {}", path.display()));
    }
    if !is_marker_at(&file, path)? {
        return Ok(Claim::Unlinked);
    }

    file.set_len(0)
        .with_context(|| format!("truncate lock marker {}", path.display()))?;
    writeln!(file, "{}", std::process::id())
        .with_context(|| format!("write lock marker {}", path.display()))?;
    debug!(path = %path.display(), "lock acquired");
    Ok(Claim::Held(RelayLock {
        file,
        path: path.to_path_buf(),
    }))
}

fn is_marker_at(file: &File, path: &Path) -> Result<bool> {
    let held = file
        .metadata()
        .with_context(|| format!("stat lock marker {}", path.display()))?;
    match fs::metadata(path) {
        Ok(current) => Ok(same_file(&held, &current)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(_a: &fs::Metadata, _b: &fs::Metadata) -> bool {
    true
}

impl Drop for RelayLock {
    fn drop(&mut self) {
        // A waiter that opened the marker before the unlink locks a dead inode;
        // `claim` rejects that.
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), err = %err, "failed to remove lock marker");
        }
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
        debug!(path = %self.path.display(), "lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = FileLockProvider::new(temp.path());

        let held = provider
            .try_acquire("relay-test.lock")
            .expect("acquire")
            .expect("first holder");
        assert!(
            provider
                .try_acquire("relay-test.lock")
                .expect("acquire")
                .is_none()
        );

        drop(held);
        assert!(
            provider
                .try_acquire("relay-test.lock")
                .expect("acquire")
                .is_some()
        );
    }

    #[test]
    fn drop_removes_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = FileLockProvider::new(temp.path());
        let held = provider
            .try_acquire("relay-test.lock")
            .expect("acquire")
            .expect("holder");
        let path = held.path().to_path_buf();
        let contents = fs::read_to_string(&path).expect("read marker");
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(held);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn marker_opened_before_release_is_not_a_second_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = FileLockProvider::new(temp.path());
        let first = provider
            .try_acquire("relay-test.lock")
            .expect("acquire")
            .expect("first holder");
        let path = first.path().to_path_buf();

        // A late agent opened the marker just before the first one let go.
        let late = open_marker(&path).expect("open marker");
        drop(first);
        assert!(matches!(
            claim(late, &path).expect("claim"),
            Claim::Unlinked
        ));

        let next = provider
            .try_acquire("relay-test.lock")
            .expect("acquire")
            .expect("fresh holder");
        let reopened = open_marker(&path).expect("open marker");
        assert!(matches!(
            claim(reopened, &path).expect("claim"),
            Claim::Contended
        ));
        drop(next);
    }

    #[test]
    fn distinct_names_do_not_contend() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = FileLockProvider::new(temp.path());
        let _a = provider.try_acquire("a.lock").expect("a").expect("a held");
        let _b = provider.try_acquire("b.lock").expect("b").expect("b held");
    }

    #[test]
    fn stale_marker_without_holder_is_reusable() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("stale.lock"), "999999\n").expect("write stale");
        let provider = FileLockProvider::new(temp.path());
        assert!(provider.try_acquire("stale.lock").expect("acquire").is_some());
    }

    #[test]
    fn creates_missing_lock_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = FileLockProvider::new(temp.path().join("nested/locks"));
        assert!(provider.try_acquire("x.lock").expect("acquire").is_some());
        assert!(provider.dir().exists());
    }
}
