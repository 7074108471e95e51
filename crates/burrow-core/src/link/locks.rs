//! Advisory `flock` lock files carrying session state.
//!
//! The server holds `server.lock` for its lifetime, so "the server is
//! alive" is observable as "that lock is held by someone else". Each
//! client slot pairs `client<i>.lock` (held for the whole session,
//! claims the slot) with `suspend<i>.lock` (held while the target is
//! parked on that client's behalf).
//!
//! `flock` locks belong to the open file description, not the process,
//! so two handles to the same path contend even inside one process.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::{Error, Result};
use crate::link::protocol::SHM_MAX_CLIENTS;

pub fn server_lock_path(runtime_dir: &Path, pid: u32) -> PathBuf {
    runtime_dir.join(pid.to_string()).join("server.lock")
}

pub fn client_lock_path(runtime_dir: &Path, pid: u32, slot: usize) -> PathBuf {
    runtime_dir.join(pid.to_string()).join(format!("client{slot}.lock"))
}

pub fn suspend_lock_path(runtime_dir: &Path, pid: u32, slot: usize) -> PathBuf {
    runtime_dir.join(pid.to_string()).join(format!("suspend{slot}.lock"))
}

/// One lock file handle. Dropping it releases any held lock.
pub struct LockFile {
    file: File,
    path: PathBuf,
    held: bool,
}

impl LockFile {
    /// Open (creating if needed) without taking the lock.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(LockFile { file, path, held: false })
    }

    fn flock(&self, operation: libc::c_int) -> io::Result<()> {
        loop {
            let rc = unsafe { libc::flock(self.file.as_raw_fd(), operation) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Block until the exclusive lock is ours.
    pub fn lock(&mut self) -> Result<()> {
        self.flock(libc::LOCK_EX)?;
        self.held = true;
        trace!(path = %self.path.display(), "lock acquired");
        Ok(())
    }

    /// Take the exclusive lock if free; `Ok(false)` when contended.
    pub fn try_lock(&mut self) -> Result<bool> {
        match self.flock(libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                self.held = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn unlock(&mut self) -> Result<()> {
        if self.held {
            self.flock(libc::LOCK_UN)?;
            self.held = false;
            trace!(path = %self.path.display(), "lock released");
        }
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Probe whether some other handle holds this lock, without keeping
    /// it. Only meaningful while we do not hold it ourselves.
    pub fn is_held_elsewhere(&mut self) -> Result<bool> {
        if self.held {
            return Ok(false);
        }
        if self.try_lock()? {
            self.unlock()?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // closing the descriptor releases the flock
        let _ = self.unlock();
    }
}

/// Claim the first free client slot. `None` means every slot is taken.
///
/// The suspend lock is opened but deliberately not taken; holding it is
/// what [`crate::link::ProcessLink::suspend`] does.
pub fn acquire_slot(
    runtime_dir: &Path,
    pid: u32,
) -> Result<Option<(usize, LockFile, LockFile)>> {
    for slot in 0..SHM_MAX_CLIENTS {
        let mut client = LockFile::open(client_lock_path(runtime_dir, pid, slot))?;
        if client.try_lock()? {
            let suspend = LockFile::open(suspend_lock_path(runtime_dir, pid, slot))?;
            trace!(slot, "claimed client slot");
            return Ok(Some((slot, client, suspend)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_then_unlock_is_reacquirable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let mut a = LockFile::open(path.clone()).unwrap();
        a.lock().unwrap();
        assert!(a.is_held());

        let mut b = LockFile::open(path).unwrap();
        assert!(!b.try_lock().unwrap());
        a.unlock().unwrap();
        assert!(b.try_lock().unwrap());
    }

    #[test]
    fn test_drop_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        {
            let mut a = LockFile::open(path.clone()).unwrap();
            a.lock().unwrap();
        }
        let mut b = LockFile::open(path).unwrap();
        assert!(b.try_lock().unwrap());
    }

    #[test]
    fn test_held_elsewhere_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.lock");
        let mut holder = LockFile::open(path.clone()).unwrap();
        let mut probe = LockFile::open(path).unwrap();

        assert!(!probe.is_held_elsewhere().unwrap());
        holder.lock().unwrap();
        assert!(probe.is_held_elsewhere().unwrap());
        // the probe must not have stolen the lock
        assert!(!probe.is_held());
        holder.unlock().unwrap();
        assert!(!probe.is_held_elsewhere().unwrap());
    }

    #[test]
    fn test_slot_scan_takes_first_free() {
        let dir = tempfile::tempdir().unwrap();
        let (slot0, _c0, _s0) = acquire_slot(dir.path(), 99).unwrap().unwrap();
        assert_eq!(slot0, 0);
        let (slot1, _c1, _s1) = acquire_slot(dir.path(), 99).unwrap().unwrap();
        assert_eq!(slot1, 1);
    }

    #[test]
    fn test_slot_scan_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let mut held = Vec::new();
        for expected in 0..SHM_MAX_CLIENTS {
            let (slot, client, suspend) = acquire_slot(dir.path(), 5).unwrap().unwrap();
            assert_eq!(slot, expected);
            held.push((client, suspend));
        }
        assert!(acquire_slot(dir.path(), 5).unwrap().is_none());
        held.clear();
        let (slot, _c, _s) = acquire_slot(dir.path(), 5).unwrap().unwrap();
        assert_eq!(slot, 0);
    }
}
