//! Cross-process advisory file lock and write-then-rename atomic writer
//! (component B). Grounded in `storage::chunk::write_chunk`'s tmp-file +
//! rename pattern, extended with an `fs2` sibling lock file since the
//! teacher's daemon is single-writer and never needed one.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

#[derive(Debug)]
pub enum LockError {
    Io(io::Error),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Io(e) => write!(f, "file lock I/O error: {e}"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<io::Error> for LockError {
    fn from(e: io::Error) -> Self {
        LockError::Io(e)
    }
}

/// An exclusive advisory lock on `<target>.lock`, held for the lifetime of
/// the guard. Acquisition blocks until the lock is available; callers must
/// not re-enter (re-entrance within a process is not supported).
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock sibling to `target`, creating parent directories
    /// (`0o700` on POSIX) as needed.
    pub fn acquire(target: &Path) -> Result<Self, LockError> {
        if let Some(parent) = target.parent() {
            create_dir_secure(parent)?;
        }
        let lock_path = lock_path_for(target);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(FileLock {
            file,
            path: lock_path,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

#[cfg(unix)]
fn create_dir_secure(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.exists() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_dir_secure(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn set_file_secure(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_file_secure(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Writes `bytes` to `target` via `<target>.tmp` + fsync + rename, under an
/// exclusive lock on the target's sibling lock file.
pub fn atomic_write(target: &Path, bytes: &[u8]) -> Result<(), LockError> {
    let _guard = FileLock::acquire(target)?;
    if let Some(parent) = target.parent() {
        create_dir_secure(parent)?;
    }
    let tmp_path = target.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    set_file_secure(&tmp_path)?;
    fs::rename(&tmp_path, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("state.json");
        atomic_write(&target, b"{\"a\":1}").unwrap();
        let got = fs::read_to_string(&target).unwrap();
        assert_eq!(got, "{\"a\":1}");
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        atomic_write(&target, b"x").unwrap();
        assert!(!target.with_extension("tmp").exists());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        {
            let _lock = FileLock::acquire(&target).unwrap();
        }
        // A second acquisition must not deadlock now that the first is dropped.
        let _lock2 = FileLock::acquire(&target).unwrap();
    }
}
