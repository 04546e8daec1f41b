//! One run per device: an advisory `flock` held for the whole run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} is held by another run")]
    Held { path: PathBuf },

    #[error("I/O error on lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<LockError> for exn_common::Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { path } => exn_common::Error::RunLocked { path },
            LockError::Io { source, .. } => exn_common::Error::Io(source),
        }
    }
}

/// Lock file path for runs against `device_ip`.
pub fn lock_path(state_dir: &Path, device_ip: &str) -> PathBuf {
    let name: String = device_ip
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    state_dir.join(format!("exynex-{}.lock", name))
}

/// Held until dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without blocking, creating the file and its directory.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the fd belongs to `file`, which outlives this call.
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(LockError::Held {
                        path: path.to_path_buf(),
                    });
                }
                return Err(io_err(err));
            }
        }

        file.set_len(0).map_err(io_err)?;
        let mut writer = &file;
        if let Err(e) = writer
            .write_all(std::process::id().to_string().as_bytes())
            .and_then(|()| writer.flush())
        {
            debug!(path = %path.display(), error = %e, "could not record pid in lock file");
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the fd belongs to `self.file`, still open until drop returns.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        // The file stays: unlinking it would let a waiter lock a dead inode.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_path_is_per_device() {
        let dir = Path::new("/var/lib/exynex");
        assert_eq!(
            lock_path(dir, "192.168.1.20"),
            PathBuf::from("/var/lib/exynex/exynex-192.168.1.20.lock")
        );
        assert_eq!(
            lock_path(dir, "fe80::1"),
            PathBuf::from("/var/lib/exynex/exynex-fe80__1.lock")
        );
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempdir().unwrap();
        let path = lock_path(dir.path(), "10.0.0.2");
        let _held = RunLock::acquire(&path).unwrap();
        match RunLock::acquire(&path) {
            Err(LockError::Held { path: p }) => assert_eq!(p, path),
            other => panic!("expected Held, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = lock_path(dir.path(), "10.0.0.2");
        drop(RunLock::acquire(&path).unwrap());
        assert!(RunLock::acquire(&path).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_lock_file_holds_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("exynex-x.lock");
        let lock = RunLock::acquire(&path).unwrap();
        let text = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(text, std::process::id().to_string());
    }

    #[test]
    fn test_held_maps_to_run_locked() {
        let err: exn_common::Error = LockError::Held {
            path: PathBuf::from("/tmp/x.lock"),
        }
        .into();
        assert!(matches!(err, exn_common::Error::RunLocked { .. }));
    }
}
