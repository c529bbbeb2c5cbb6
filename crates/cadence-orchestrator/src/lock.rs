use cadence_core::{CadenceError, CadenceResult};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive, cross-process run lock for one task id.
///
/// Backed by an advisory `flock` on `<lock_dir>/<task_id>.lock`. The lock
/// is released when the value is dropped or the holding process exits,
/// so a crashed run never leaves a stale lock behind. The file itself is
/// left in place and reused by the next holder.
#[derive(Debug)]
pub struct TaskLock {
    file: File,
    path: PathBuf,
}

impl TaskLock {
    /// Take the lock without waiting.
    ///
    /// Returns [`CadenceError::LockConflict`] when another holder, in this
    /// process or any other, already has it.
    pub fn try_acquire(lock_dir: &Path, task_id: &str) -> CadenceResult<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{task_id}.lock"));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match lock_exclusive_nonblocking(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(CadenceError::LockConflict(task_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        // Holder pid, for whoever inspects the lock directory.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!(task_id, path = %path.display(), "Run lock acquired");
        Ok(Self { file, path })
    }

    /// Location of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        let _ = unlock(&self.file);
        debug!(path = %self.path.display(), "Run lock released");
    }
}

#[cfg(unix)]
fn lock_exclusive_nonblocking(file: &File) -> std::io::Result<()> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(std::io::Error::from)
}

#[cfg(unix)]
fn unlock(file: &File) -> std::io::Result<()> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    flock(file.as_raw_fd(), FlockArg::Unlock).map_err(std::io::Error::from)
}

// Without flock only the in-process guard applies.
#[cfg(not(unix))]
fn lock_exclusive_nonblocking(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> std::io::Result<()> {
    Ok(())
}
