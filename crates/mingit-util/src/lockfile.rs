use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::LockError;

const LOCK_SUFFIX: &str = ".lock";

/// RAII lock-file guard around an atomically replaced file.
///
/// Protocol:
/// - create `<path>.lock` with `O_CREAT|O_EXCL`
/// - stream the new contents into the lock file
/// - `commit()` fsyncs and atomically renames `.lock` onto the target
/// - dropping an uncommitted guard unlinks the `.lock` (rollback)
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl LockFile {
    /// Acquire the lock for `path`, failing if another holder exists.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let lock_path = PathBuf::from(format!("{}{}", path.display(), LOCK_SUFFIX));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    LockError::AlreadyLocked { path: lock_path.clone() }
                } else {
                    LockError::Create { path: lock_path.clone(), source: e }
                }
            })?;

        Ok(Self {
            path,
            lock_path,
            file: Some(file),
            committed: false,
        })
    }

    /// The target path (without the `.lock` suffix).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The lock-file path.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Flush, fsync, and atomically rename the lock file onto the target.
    pub fn commit(mut self) -> Result<(), LockError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()
                .and_then(|_| file.sync_all())
                .map_err(|e| LockError::Commit {
                    path: self.lock_path.clone(),
                    source: e,
                })?;
        }
        // Close before rename.
        self.file.take();

        fs::rename(&self.lock_path, &self.path).map_err(|e| LockError::Commit {
            path: self.lock_path.clone(),
            source: e,
        })?;
        self.committed = true;
        Ok(())
    }

    /// Abandon the update, removing the lock file.
    pub fn rollback(mut self) -> Result<(), LockError> {
        self.file.take();
        fs::remove_file(&self.lock_path)?;
        self.committed = true;
        Ok(())
    }
}

impl Write for LockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .flush()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");
        fs::write(&target, b"old").unwrap();

        let mut lock = LockFile::acquire(&target).unwrap();
        assert!(lock.lock_path().exists());
        lock.write_all(b"new").unwrap();
        lock.commit().unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!dir.path().join("state.lock").exists());
    }

    #[test]
    fn drop_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");
        fs::write(&target, b"old").unwrap();

        {
            let mut lock = LockFile::acquire(&target).unwrap();
            lock.write_all(b"discarded").unwrap();
        }

        assert_eq!(fs::read(&target).unwrap(), b"old");
        assert!(!dir.path().join("state.lock").exists());
    }

    #[test]
    fn second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");

        let _held = LockFile::acquire(&target).unwrap();
        match LockFile::acquire(&target) {
            Err(LockError::AlreadyLocked { .. }) => {}
            other => panic!("expected AlreadyLocked, got {other:?}"),
        }
    }

    #[test]
    fn rollback_removes_lock() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");

        let lock = LockFile::acquire(&target).unwrap();
        lock.rollback().unwrap();
        assert!(!dir.path().join("state.lock").exists());
        assert!(!target.exists());
    }

    #[test]
    fn lock_creates_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("fresh");

        let mut lock = LockFile::acquire(&target).unwrap();
        lock.write_all(b"content").unwrap();
        lock.commit().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"content");
    }
}
