use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::PidLockError;

/// Keeps a second instance of a tool from running at the same time.
///
/// The file holds the PID of its owner and is removed when the lock is
/// dropped. A file left behind by a dead process is taken over.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<PidLock, PidLockError> {
        let path = path.into();
        let own_pid = std::process::id() as i32;
        match fs::read_to_string(&path) {
            Ok(content) => match content.trim().parse::<i32>() {
                Ok(pid) if pid != own_pid && is_alive(pid) => {
                    return Err(PidLockError::AlreadyRunning(pid));
                }
                Ok(pid) => info!(file=%path.display(), pid, "taking over stale pid file"),
                Err(_) => warn!(file=%path.display(), "overwriting unreadable pid file"),
            },
            Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            Err(io_err) => return Err(io_err.into()),
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, format!("{own_pid}\n"))?;
        Ok(PidLock { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(io_err) = fs::remove_file(&self.path) {
            warn!(file=%self.path.display(), error=%io_err, "failed to remove pid file");
        }
    }
}

fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // safety: signal 0 only checks that the process exists.
    let res = unsafe { libc::kill(pid, 0) };
    res == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("run").join("cplog.pid");
        {
            let lock = PidLock::acquire(&path).unwrap();
            assert_eq!(lock.path(), path.as_path());
            let content = fs::read_to_string(&path).unwrap();
            assert_eq!(content.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_live_owner_blocks() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("cplog.pid");
        // safety: getppid cannot fail
        let parent_pid = unsafe { libc::getppid() };
        fs::write(&path, format!("{parent_pid}\n")).unwrap();
        assert!(matches!(
            PidLock::acquire(&path),
            Err(PidLockError::AlreadyRunning(pid)) if pid == parent_pid
        ));
        assert!(path.exists());
    }

    #[test]
    fn test_stale_file_taken_over() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("cplog.pid");
        fs::write(&path, "2147483000\n").unwrap();
        let _lock = PidLock::acquire(&path).unwrap();
        fs::write(&path, "garbage").unwrap();
        let _lock_again = PidLock::acquire(&path).unwrap();
    }
}
