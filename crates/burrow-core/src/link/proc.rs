//! Target process introspection via procfs.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::error::Result;

/// One mapped region from `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRange {
    pub start: u64,
    pub end: u64,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub shared: bool,
    /// Backing path, or an empty string for anonymous mappings.
    pub name: String,
}

impl MemRange {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Parse a single maps line, e.g.
/// `00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/foo`.
pub(crate) fn parse_maps_line(line: &str) -> Option<MemRange> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    // offset, dev, inode
    let _ = fields.next()?;
    let _ = fields.next()?;
    let _ = fields.next()?;
    let name = fields.next().unwrap_or("").to_owned();

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let perms = perms.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    Some(MemRange {
        start,
        end,
        read: perms[0] == b'r',
        write: perms[1] == b'w',
        execute: perms[2] == b'x',
        shared: perms[3] == b's',
        name,
    })
}

/// All mapped regions of the target, in maps-file order.
pub fn mem_ranges(pid: u32) -> Result<Vec<MemRange>> {
    let text = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;
    Ok(text.lines().filter_map(parse_maps_line).collect())
}

/// Thread IDs of the target, from `/proc/<pid>/task`.
pub fn thread_ids(pid: u32) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            ids.push(tid);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Resolved executable path of the target.
pub fn exe_path(pid: u32) -> Result<PathBuf> {
    Ok(std::fs::read_link(format!("/proc/{pid}/exe"))?)
}

/// Lowercase hex MD5 of a file, streamed in 64 KiB chunks.
pub fn file_md5(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    Ok(hex)
}
