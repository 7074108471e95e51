//! Wire protocol for the shared memory segment.
//!
//! The segment starts with a [`SegmentHeader`] followed by a single bulk
//! data window. Each client owns one command cell; a round trip is
//! "store payload, store command, spin until the cell changes". The
//! value the server leaves in the cell doubles as the target state:
//! `Running` while the target executes, `Suspended` while it is parked,
//! `Error` when the request was rejected.

use std::sync::atomic::{AtomicU32, AtomicU64};

use strum::FromRepr;

/// Concurrent client sessions the server accepts.
pub const SHM_MAX_CLIENTS: usize = 4;

/// Reserved bytes before the bulk data window.
pub const SHM_HEADER: usize = 1024;

/// Bulk data window size; one round trip moves at most this much.
pub const SHM_BODY: usize = 1024 * 1024;

/// Total segment size.
pub const SHM_SIZE: usize = SHM_HEADER + SHM_BODY;

/// Bumped on any incompatible change to this file.
pub const PROTOCOL_VERSION: u32 = 9;

/// First word of a valid segment ("BURW").
pub const SHM_MAGIC: u32 = 0x4255_5257;

/// Segment file name under the shm directory.
pub fn segment_name(pid: u32) -> String {
    format!("burrow-shm.{pid}")
}

/// Commands and acknowledgement states, one u32 per client cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum Command {
    /// Idle state while the target executes. Also the ack for `Run`
    /// and `Attach`.
    Running = 0,
    /// Park the target at the next safe point.
    Suspend = 1,
    /// Idle state while the target is parked. Also the ack for every
    /// data command.
    Suspended = 2,
    /// One frame, then park. Used instead of `Suspend` right after a
    /// `Run`, so a just-started frame still completes.
    Step = 3,
    Run = 4,
    /// Request rejected; the session stays valid.
    Error = 5,
    Attach = 6,
    AcquireModule = 7,
    /// Bulk transfer through the data window, `address` + `length`.
    Read = 8,
    Write = 9,
    ReadByte = 10,
    WriteByte = 11,
    ReadWord = 12,
    WriteWord = 13,
    ReadDword = 14,
    WriteDword = 15,
    ReadQuad = 16,
    WriteQuad = 17,
    ReadFloat = 18,
    WriteFloat = 19,
    /// `address` in, length in `value` + bytes in the window out.
    ReadStlString = 20,
    WriteStlString = 21,
}

/// Lives at offset 0 of the segment. The server initializes `magic`,
/// `server_pid` and `server_version` before taking its lock; everything
/// else is per-round-trip scratch.
#[repr(C)]
pub struct SegmentHeader {
    pub magic: u32,
    pub server_pid: AtomicU32,
    pub server_version: AtomicU32,
    /// Nonzero when the server prefers clients to `sched_yield` while
    /// spinning (single-core hosts). A hint only; clients may override.
    pub yield_hint: AtomicU32,
    /// One command cell per client slot.
    pub commands: [AtomicU32; SHM_MAX_CLIENTS],
    /// Target address for data commands.
    pub address: AtomicU32,
    /// Byte count for bulk transfers.
    pub length: AtomicU32,
    /// Scalar payload for 1/2/4-byte and float commands; string length
    /// for stl-string commands.
    pub value: AtomicU32,
    /// Scalar payload for 8-byte commands.
    pub quad: AtomicU64,
    /// Set nonzero by the server when a request was serviced but the
    /// operation itself failed (e.g. unknown module).
    pub error: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() <= SHM_HEADER);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trips_through_repr() {
        for cmd in [
            Command::Running,
            Command::Suspended,
            Command::Attach,
            Command::ReadDword,
            Command::WriteStlString,
        ] {
            assert_eq!(Command::from_repr(cmd as u32), Some(cmd));
        }
        assert_eq!(Command::from_repr(0xdead), None);
    }

    #[test]
    fn test_header_fits_reserved_space() {
        assert!(std::mem::size_of::<SegmentHeader>() <= SHM_HEADER);
        assert_eq!(SHM_SIZE, SHM_HEADER + SHM_BODY);
    }

    #[test]
    fn test_segment_name_is_pid_keyed() {
        assert_eq!(segment_name(1234), "burrow-shm.1234");
    }
}
