// src/sequencer/lock.rs

//! One orchestrator per deployment root.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::SequencerError;

/// Lock file name inside the deployment root
pub const LOCK_FILE: &str = ".netdeploy.lock";

/// PID file guarding a deployment root
#[derive(Debug)]
pub struct DeploymentLock {
    path: PathBuf,
    released: bool,
}

impl DeploymentLock {
    /// Takes the lock for `root`, reclaiming it from a dead holder
    pub fn acquire(root: &Path) -> Result<Self, SequencerError> {
        let path = root.join(LOCK_FILE);
        let pid = std::process::id();

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", pid).map_err(|e| lock_io(&path, e))?;
                    debug!("acquired {} for pid {}", path.display(), pid);
                    return Ok(Self { path, released: false });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_holder(&path) {
                        Some(holder) if holder != pid && process_exists(holder) => {
                            return Err(SequencerError::Locked { path, pid: holder });
                        }
                        holder => {
                            warn!("Reclaiming stale deployment lock {} (pid {:?})", path.display(), holder);
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(lock_io(&path, e)),
                            }
                        }
                    }
                }
                Err(e) => return Err(lock_io(&path, e)),
            }
        }

        Err(lock_io(
            &path,
            io::Error::new(io::ErrorKind::AlreadyExists, "lock was re-taken while reclaiming it"),
        ))
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file
    pub fn release(mut self) -> Result<(), SequencerError> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Released {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(lock_io(&self.path, e)),
        }
    }
}

impl Drop for DeploymentLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn lock_io(path: &Path, source: io::Error) -> SequencerError {
    SequencerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_sees_the_live_holder() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join(LOCK_FILE);
        let lock = DeploymentLock::acquire(root.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), std::process::id().to_string());

        // pid 1 is always alive
        fs::write(&path, "1").unwrap();
        match DeploymentLock::acquire(root.path()) {
            Err(SequencerError::Locked { pid, .. }) => assert_eq!(pid, 1),
            other => panic!("unexpected result: {:?}", other),
        }

        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join(LOCK_FILE);
        fs::write(&path, "garbage").unwrap();

        let lock = DeploymentLock::acquire(root.path()).unwrap();
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), std::process::id().to_string());
    }

    #[test]
    fn dropping_the_lock_removes_it() {
        let root = tempfile::tempdir().unwrap();
        {
            let _lock = DeploymentLock::acquire(root.path()).unwrap();
        }
        assert!(!root.path().join(LOCK_FILE).exists());
    }
}
