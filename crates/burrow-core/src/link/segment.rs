//! File-backed mapping of the shared memory segment.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{Error, Result};
use crate::link::protocol::{self, SegmentHeader, SHM_HEADER, SHM_MAGIC, SHM_SIZE};

/// A writable mapping of the per-PID segment file. Dropping it unmaps;
/// the file itself is owned by the server side.
#[derive(Debug)]
pub struct Segment {
    map: MmapMut,
    path: PathBuf,
}

impl Segment {
    pub fn path_for(dir: &Path, pid: u32) -> PathBuf {
        dir.join(protocol::segment_name(pid))
    }

    /// Map an existing segment created by a server. Verifies size and
    /// magic; any mismatch comes back as a recoverable attach failure.
    pub fn open(dir: &Path, pid: u32) -> Result<Self> {
        let path = Self::path_for(dir, pid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                Error::AttachFailure(format!("no shared memory segment at {}: {e}", path.display()))
            })?;
        let len = file.metadata()?.len();
        if (len as usize) < SHM_SIZE {
            return Err(Error::AttachFailure(format!(
                "segment {} is truncated ({len} bytes)",
                path.display()
            )));
        }
        // Safety: the mapping stays valid as long as the file exists;
        // concurrent access is mediated by the command protocol.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let segment = Segment { map, path };
        if segment.header().magic != SHM_MAGIC {
            return Err(Error::AttachFailure(format!(
                "segment {} has a bad magic word",
                segment.path.display()
            )));
        }
        debug!(path = %segment.path.display(), "mapped shared segment");
        Ok(segment)
    }

    /// Create and initialize a fresh segment. This is the server side of
    /// [`Segment::open`]; the library uses it for in-process test
    /// servers.
    pub fn create(dir: &Path, pid: u32) -> Result<Self> {
        let path = Self::path_for(dir, pid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(SHM_SIZE as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut segment = Segment { map, path };
        let magic_bytes = SHM_MAGIC.to_ne_bytes();
        segment.map[..4].copy_from_slice(&magic_bytes);
        let header = segment.header();
        header.server_pid.store(std::process::id(), Ordering::SeqCst);
        header
            .server_version
            .store(protocol::PROTOCOL_VERSION, Ordering::SeqCst);
        header.yield_hint.store(1, Ordering::SeqCst);
        Ok(segment)
    }

    pub fn header(&self) -> &SegmentHeader {
        // Safety: the constructors guarantee at least SHM_SIZE mapped
        // bytes, and SegmentHeader fits within the reserved header area.
        unsafe { &*(self.map.as_ptr() as *const SegmentHeader) }
    }

    /// The bulk transfer window.
    pub fn data(&self) -> &[u8] {
        &self.map[SHM_HEADER..SHM_SIZE]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.map[SHM_HEADER..SHM_SIZE]
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
