//! Client-side session against the shared memory server embedded in a
//! running target.
//!
//! A session walks Detached -> Attached, and while attached toggles
//! between running and suspended. Every memory access requires the
//! suspended state; violating that fails with
//! [`Error::MemoryAccessDenied`] rather than racing the target. A
//! server that stops responding mid-command is detected by the liveness
//! probe and surfaces as the fatal [`Error::ServerDisappeared`], after
//! which the session is already torn down.

pub mod locks;
pub mod proc;
pub mod protocol;
pub mod segment;

use std::path::PathBuf;
use std::sync::atomic::{fence, Ordering};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::factory::VersionInfoFactory;
use crate::layout::VersionInfo;
use crate::memory::{self, ReadMemory};

pub use locks::LockFile;
pub use proc::MemRange;
pub use protocol::{Command, SegmentHeader, PROTOCOL_VERSION, SHM_BODY, SHM_MAX_CLIENTS};
pub use segment::Segment;

/// Replacement for the default server-lock liveness check; returns
/// whether the server should be considered alive.
pub type LivenessProbe = Box<dyn FnMut() -> bool + Send>;

/// Spin-wait behavior while a command is outstanding.
#[derive(Debug, Clone)]
pub struct SpinConfig {
    /// Iterations between liveness probes. There is no other timeout:
    /// as long as the server holds its lock, the wait is unbounded.
    pub liveness_check_interval: u32,
    /// `None` adopts the server's preference from the handshake.
    pub yield_while_waiting: Option<bool>,
}

impl Default for SpinConfig {
    fn default() -> Self {
        SpinConfig {
            liveness_check_interval: 10_000,
            yield_while_waiting: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub pid: u32,
    /// Lock file directory; the segment's locks live under `<dir>/<pid>/`.
    pub runtime_dir: PathBuf,
    /// Directory holding the segment file.
    pub shm_dir: PathBuf,
    pub spin: SpinConfig,
}

impl LinkConfig {
    pub fn new(pid: u32) -> Self {
        LinkConfig {
            pid,
            runtime_dir: PathBuf::from("/tmp/burrow"),
            shm_dir: PathBuf::from("/dev/shm"),
            spin: SpinConfig::default(),
        }
    }
}

struct Session {
    segment: Segment,
    slot: usize,
    /// Held for the whole session; releasing it frees the slot.
    #[allow(dead_code)]
    client_lock: LockFile,
    /// Held exactly while the target is suspended on our behalf.
    suspend_lock: LockFile,
    /// Never locked by us; probed to tell a busy server from a dead one.
    server_lock: LockFile,
    server_pid: u32,
    server_version: u32,
    suspended: bool,
    /// The last state-changing command was `Run`; the next suspend must
    /// `Step` so the frame in flight completes first.
    last_start: bool,
    /// A suspend command already in the cell, awaiting acknowledgement.
    pending_suspend: Option<Command>,
    liveness_check_interval: u64,
    yield_while_waiting: bool,
}

impl Session {
    fn header(&self) -> &SegmentHeader {
        self.segment.header()
    }

    fn issue(&self, cmd: Command) {
        fence(Ordering::SeqCst);
        self.header().commands[self.slot].store(cmd as u32, Ordering::SeqCst);
    }

    /// Spin until the server replaces `issued` in our cell. Every
    /// `liveness_check_interval` iterations the probe runs; a dead
    /// server turns the wait into `ServerDisappeared`.
    fn wait(&mut self, issued: Command, probe: &mut Option<LivenessProbe>) -> Result<Command> {
        let mut iterations: u64 = 0;
        loop {
            let cell = self.header().commands[self.slot].load(Ordering::SeqCst);
            if cell != issued as u32 {
                fence(Ordering::SeqCst);
                return Command::from_repr(cell).ok_or(Error::LockingError("protocol"));
            }
            iterations += 1;
            if iterations % self.liveness_check_interval == 0 {
                let alive = match probe.as_mut() {
                    Some(p) => p(),
                    None => {
                        self.client_lock.is_held() && self.server_lock.is_held_elsewhere()?
                    }
                };
                if !alive {
                    return Err(Error::ServerDisappeared);
                }
            }
            if self.yield_while_waiting {
                std::thread::yield_now();
            }
        }
    }

    fn set_and_wait(&mut self, cmd: Command, probe: &mut Option<LivenessProbe>) -> Result<Command> {
        self.issue(cmd);
        self.wait(cmd, probe)
    }
}

/// Handle to one target process. Construct with a [`LinkConfig`], then
/// [`attach`](ProcessLink::attach); the target is handed over suspended.
pub struct ProcessLink {
    config: LinkConfig,
    session: Option<Session>,
    version: Option<VersionInfo>,
    probe: Option<LivenessProbe>,
}

impl ProcessLink {
    pub fn new(config: LinkConfig) -> Self {
        ProcessLink {
            config,
            session: None,
            version: None,
            probe: None,
        }
    }

    pub fn for_pid(pid: u32) -> Self {
        Self::new(LinkConfig::new(pid))
    }

    /// Override the default server-lock liveness check. Mainly for
    /// driving fault scenarios in tests.
    pub fn set_liveness_probe(&mut self, probe: LivenessProbe) {
        self.probe = Some(probe);
    }

    pub fn pid(&self) -> u32 {
        self.config.pid
    }

    pub fn is_attached(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.suspended)
    }

    pub fn slot(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.slot)
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.server_pid)
    }

    pub fn server_version(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.server_version)
    }

    /// Establish a session. Every failure on this path is returned with
    /// nothing left mapped or locked; the caller may retry.
    pub fn attach(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let pid = self.config.pid;

        let mut server_lock =
            LockFile::open(locks::server_lock_path(&self.config.runtime_dir, pid))?;
        if !server_lock.is_held_elsewhere()? {
            return Err(Error::AttachFailure(format!(
                "no server is running for pid {pid} (server lock is free)"
            )));
        }

        let Some((slot, client_lock, suspend_lock)) =
            locks::acquire_slot(&self.config.runtime_dir, pid)?
        else {
            return Err(Error::AttachFailure(format!(
                "all {SHM_MAX_CLIENTS} client slots are taken"
            )));
        };

        let segment = Segment::open(&self.config.shm_dir, pid)?;

        let affinity = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        segment.header().value.store(affinity, Ordering::SeqCst);

        self.session = Some(Session {
            segment,
            slot,
            client_lock,
            suspend_lock,
            server_lock,
            server_pid: 0,
            server_version: 0,
            suspended: false,
            last_start: false,
            pending_suspend: None,
            liveness_check_interval: self.config.spin.liveness_check_interval.max(1) as u64,
            yield_while_waiting: self.config.spin.yield_while_waiting.unwrap_or(true),
        });

        if let Err(e) = self.handshake().and_then(|_| self.suspend()) {
            self.session = None;
            return Err(e);
        }
        info!(pid, slot, "attached to target");
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        match self.command(Command::Attach)? {
            Command::Running => {}
            _ => return Err(Error::AttachFailure("attach request rejected".into())),
        }
        let hint = {
            let session = self.session.as_mut().expect("command succeeded");
            let header = session.segment.header();
            let theirs = header.server_version.load(Ordering::SeqCst);
            if theirs != PROTOCOL_VERSION {
                return Err(Error::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs,
                });
            }
            session.server_version = theirs;
            session.server_pid = header.server_pid.load(Ordering::SeqCst);
            header.yield_hint.load(Ordering::SeqCst) != 0
        };
        if let Some(session) = self.session.as_mut() {
            session.yield_while_waiting = self.config.spin.yield_while_waiting.unwrap_or(hint);
            debug!(
                server_pid = session.server_pid,
                protocol = session.server_version,
                "handshake complete"
            );
        }
        Ok(())
    }

    /// One protocol round trip. Fatal failures tear the session down
    /// before returning.
    fn command(&mut self, cmd: Command) -> Result<Command> {
        let session = self.session.as_mut().ok_or(Error::NotAttached)?;
        match session.set_and_wait(cmd, &mut self.probe) {
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "session lost, tearing down");
                self.session = None;
                Err(e)
            }
            other => other,
        }
    }

    /// Park the target. No-op if already suspended. This is the one
    /// deliberately unbounded wait in the protocol: a busy frame takes
    /// as long as it takes, and only server death breaks the loop.
    pub fn suspend(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NotAttached)?;
        if session.suspended {
            return Ok(());
        }
        let issued = match session.pending_suspend {
            Some(cmd) => cmd,
            None => {
                let cmd = if session.last_start {
                    Command::Step
                } else {
                    Command::Suspend
                };
                session.issue(cmd);
                session.pending_suspend = Some(cmd);
                cmd
            }
        };
        match session.wait(issued, &mut self.probe) {
            Ok(Command::Suspended) => {}
            Ok(_) => {
                session.pending_suspend = None;
                return Err(Error::CommandFailed("suspend"));
            }
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "session lost, tearing down");
                self.session = None;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        let session = self.session.as_mut().expect("ack received");
        session.pending_suspend = None;
        session.suspend_lock.lock()?;
        session.suspended = true;
        session.last_start = false;
        Ok(())
    }

    /// Non-blocking suspend: issue the command if not yet outstanding
    /// and report whether the target has parked. Poll until `Ok(true)`.
    pub fn async_suspend(&mut self) -> Result<bool> {
        let session = self.session.as_mut().ok_or(Error::NotAttached)?;
        if session.suspended {
            return Ok(true);
        }
        if session.pending_suspend.is_none() {
            let cmd = if session.last_start {
                Command::Step
            } else {
                Command::Suspend
            };
            session.issue(cmd);
            session.pending_suspend = Some(cmd);
        }
        let cell = session.header().commands[session.slot].load(Ordering::SeqCst);
        if cell == Command::Error as u32 {
            session.pending_suspend = None;
            return Err(Error::CommandFailed("suspend"));
        }
        if cell == Command::Suspended as u32 {
            fence(Ordering::SeqCst);
            // Stay non-blocking: if the suspend lock is contended, keep
            // the command pending and let a later poll retry the lock.
            if !session.suspend_lock.try_lock()? {
                return Ok(false);
            }
            session.pending_suspend = None;
            session.suspended = true;
            session.last_start = false;
            return Ok(true);
        }
        Ok(false)
    }

    /// Let the target run again. No-op while already running.
    pub fn resume(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NotAttached)?;
        if !session.suspended {
            return Ok(());
        }
        self.resume_inner()
    }

    /// Issue `Run` regardless of what we believe the state to be.
    pub fn force_resume(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::NotAttached);
        }
        self.resume_inner()
    }

    fn resume_inner(&mut self) -> Result<()> {
        let session = self.session.as_mut().expect("checked by caller");
        session.suspend_lock.unlock()?;
        match self.command(Command::Run) {
            Ok(Command::Running) => {
                let session = self.session.as_mut().expect("ack received");
                session.suspended = false;
                session.last_start = true;
                Ok(())
            }
            Ok(_) => {
                // the target's state is now unknowable; discard the session
                self.session = None;
                Err(Error::LockingError("resume"))
            }
            Err(e) => Err(e),
        }
    }

    /// End the session. The target is resumed (best effort) before the
    /// slot and segment are released. Idempotent.
    pub fn detach(&mut self) -> Result<()> {
        if self.is_suspended() {
            if let Err(e) = self.resume() {
                warn!(error = %e, "resume on detach failed");
            }
        }
        if self.session.take().is_some() {
            info!(pid = self.config.pid, "detached from target");
        }
        Ok(())
    }

    fn ensure_suspended(&self) -> Result<()> {
        match &self.session {
            None => Err(Error::NotAttached),
            Some(s) if !s.suspended => Err(Error::MemoryAccessDenied),
            Some(_) => Ok(()),
        }
    }

    fn scalar_read(&mut self, addr: u32, cmd: Command) -> Result<u32> {
        self.ensure_suspended()?;
        let session = self.session.as_ref().expect("suspended implies attached");
        session.header().address.store(addr, Ordering::SeqCst);
        match self.command(cmd)? {
            Command::Suspended => {
                let session = self.session.as_ref().expect("ack received");
                Ok(session.header().value.load(Ordering::SeqCst))
            }
            _ => Err(Error::CommandFailed("read")),
        }
    }

    fn scalar_write(&mut self, addr: u32, value: u32, cmd: Command) -> Result<()> {
        self.ensure_suspended()?;
        let session = self.session.as_ref().expect("suspended implies attached");
        let header = session.header();
        header.address.store(addr, Ordering::SeqCst);
        header.value.store(value, Ordering::SeqCst);
        match self.command(cmd)? {
            Command::Suspended => Ok(()),
            _ => Err(Error::CommandFailed("write")),
        }
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<()> {
        self.scalar_write(addr, value as u32, Command::WriteByte)
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> Result<()> {
        self.scalar_write(addr, value as u32, Command::WriteWord)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.scalar_write(addr, value, Command::WriteDword)
    }

    pub fn write_u64(&mut self, addr: u32, value: u64) -> Result<()> {
        self.ensure_suspended()?;
        let session = self.session.as_ref().expect("suspended implies attached");
        let header = session.header();
        header.address.store(addr, Ordering::SeqCst);
        header.quad.store(value, Ordering::SeqCst);
        match self.command(Command::WriteQuad)? {
            Command::Suspended => Ok(()),
            _ => Err(Error::CommandFailed("write")),
        }
    }

    pub fn write_f32(&mut self, addr: u32, value: f32) -> Result<()> {
        self.scalar_write(addr, value.to_bits(), Command::WriteFloat)
    }

    /// Bulk write, chunked to the data window size.
    pub fn write_raw(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.ensure_suspended()?;
        let mut cursor = 0usize;
        while cursor < data.len() {
            let chunk = (data.len() - cursor).min(SHM_BODY);
            let session = self.session.as_mut().expect("suspended implies attached");
            session.segment.data_mut()[..chunk].copy_from_slice(&data[cursor..cursor + chunk]);
            let header = session.header();
            header
                .address
                .store(addr.wrapping_add(cursor as u32), Ordering::SeqCst);
            header.length.store(chunk as u32, Ordering::SeqCst);
            match self.command(Command::Write)? {
                Command::Suspended => {}
                _ => return Err(Error::CommandFailed("write")),
            }
            cursor += chunk;
        }
        Ok(())
    }

    /// Single round trip string read; the server reports the length and
    /// places the bytes in the data window.
    pub fn read_stl_string(&mut self, addr: u32) -> Result<String> {
        self.ensure_suspended()?;
        let session = self.session.as_ref().expect("suspended implies attached");
        session.header().address.store(addr, Ordering::SeqCst);
        match self.command(Command::ReadStlString)? {
            Command::Suspended => {
                let session = self.session.as_ref().expect("ack received");
                let len = (session.header().value.load(Ordering::SeqCst) as usize).min(SHM_BODY);
                Ok(String::from_utf8_lossy(&session.segment.data()[..len]).into_owned())
            }
            _ => Err(Error::CommandFailed("read string")),
        }
    }

    /// Fixed-buffer variant: truncates to `buf.len() - 1` and always
    /// NUL-terminates. Returns the number of string bytes copied.
    pub fn read_stl_string_into(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_suspended()?;
        let session = self.session.as_ref().expect("suspended implies attached");
        session.header().address.store(addr, Ordering::SeqCst);
        match self.command(Command::ReadStlString)? {
            Command::Suspended => {
                let session = self.session.as_ref().expect("ack received");
                let len = (session.header().value.load(Ordering::SeqCst) as usize).min(SHM_BODY);
                let copied = len.min(buf.len() - 1);
                buf[..copied].copy_from_slice(&session.segment.data()[..copied]);
                buf[copied] = 0;
                Ok(copied)
            }
            _ => Err(Error::CommandFailed("read string")),
        }
    }

    pub fn write_stl_string(&mut self, addr: u32, value: &str) -> Result<()> {
        self.ensure_suspended()?;
        let bytes = value.as_bytes();
        let len = bytes.len().min(SHM_BODY);
        let session = self.session.as_mut().expect("suspended implies attached");
        session.segment.data_mut()[..len].copy_from_slice(&bytes[..len]);
        let header = session.header();
        header.address.store(addr, Ordering::SeqCst);
        header.value.store(len as u32, Ordering::SeqCst);
        match self.command(Command::WriteStlString)? {
            Command::Suspended => Ok(()),
            _ => Err(Error::CommandFailed("write string")),
        }
    }

    /// Dynamic type name of the object whose vtable pointer is `vptr`.
    pub fn read_class_name(&mut self, vptr: u32) -> Result<String> {
        memory::read_class_name(self, vptr)
    }

    /// Ask the server for the index of a named module at a given module
    /// version. `None` when the server does not carry it.
    pub fn module_index(&mut self, name: &str, version: u32) -> Result<Option<u32>> {
        let session = self.session.as_mut().ok_or(Error::NotAttached)?;
        let bytes = name.as_bytes();
        if bytes.len() + 5 > SHM_BODY {
            return Ok(None);
        }
        let data = session.segment.data_mut();
        data[..4].copy_from_slice(&version.to_le_bytes());
        data[4..4 + bytes.len()].copy_from_slice(bytes);
        data[4 + bytes.len()] = 0;
        session.header().error.store(0, Ordering::SeqCst);
        match self.command(Command::AcquireModule)? {
            Command::Error => Ok(None),
            _ => {
                let session = self.session.as_ref().expect("ack received");
                let header = session.header();
                if header.error.load(Ordering::SeqCst) != 0 {
                    Ok(None)
                } else {
                    Ok(Some(header.value.load(Ordering::SeqCst)))
                }
            }
        }
    }

    /// Mapped regions of the target from procfs.
    pub fn mem_ranges(&self) -> Result<Vec<MemRange>> {
        proc::mem_ranges(self.config.pid)
    }

    pub fn thread_ids(&self) -> Result<Vec<u32>> {
        proc::thread_ids(self.config.pid)
    }

    /// Resolved executable path of the target.
    pub fn path(&self) -> Result<PathBuf> {
        proc::exe_path(self.config.pid)
    }

    /// Match the target binary's MD5 against the factory's versions and
    /// keep a private copy of the winning layout.
    pub fn identify(&mut self, factory: &VersionInfoFactory) -> Result<&VersionInfo> {
        let path = self.path()?;
        let md5 = proc::file_md5(&path)?;
        match factory.identify(&md5) {
            Some(version) => {
                info!(version = %version.name(), md5, "identified target build");
                self.version = Some(version.clone());
                Ok(self.version.as_ref().expect("just set"))
            }
            None => Err(Error::UnknownVersion(md5)),
        }
    }

    pub fn is_identified(&self) -> bool {
        self.version.is_some()
    }

    pub fn version_info(&self) -> Option<&VersionInfo> {
        self.version.as_ref()
    }
}

impl ReadMemory for ProcessLink {
    fn read_u8(&mut self, addr: u32) -> Result<u8> {
        Ok(self.scalar_read(addr, Command::ReadByte)? as u8)
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16> {
        Ok(self.scalar_read(addr, Command::ReadWord)? as u16)
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32> {
        self.scalar_read(addr, Command::ReadDword)
    }

    fn read_u64(&mut self, addr: u32) -> Result<u64> {
        self.ensure_suspended()?;
        let session = self.session.as_ref().expect("suspended implies attached");
        session.header().address.store(addr, Ordering::SeqCst);
        match self.command(Command::ReadQuad)? {
            Command::Suspended => {
                let session = self.session.as_ref().expect("ack received");
                Ok(session.header().quad.load(Ordering::SeqCst))
            }
            _ => Err(Error::CommandFailed("read")),
        }
    }

    fn read_f32(&mut self, addr: u32) -> Result<f32> {
        Ok(f32::from_bits(self.scalar_read(addr, Command::ReadFloat)?))
    }

    /// Bulk read, chunked to the data window size. A size of exactly
    /// `k * SHM_BODY` takes exactly `k` round trips.
    fn read_raw(&mut self, addr: u32, out: &mut [u8]) -> Result<()> {
        self.ensure_suspended()?;
        let mut cursor = 0usize;
        while cursor < out.len() {
            let chunk = (out.len() - cursor).min(SHM_BODY);
            let session = self.session.as_ref().expect("suspended implies attached");
            let header = session.header();
            header
                .address
                .store(addr.wrapping_add(cursor as u32), Ordering::SeqCst);
            header.length.store(chunk as u32, Ordering::SeqCst);
            match self.command(Command::Read)? {
                Command::Suspended => {}
                _ => return Err(Error::CommandFailed("read")),
            }
            let session = self.session.as_ref().expect("ack received");
            out[cursor..cursor + chunk].copy_from_slice(&session.segment.data()[..chunk]);
            cursor += chunk;
        }
        Ok(())
    }
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}
