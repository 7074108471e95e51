//! Status command implementation.
//!
//! Attaches to the target just long enough to report the session
//! details, then detaches and lets it run.

use std::path::Path;

use anyhow::{Context, Result};
use burrow_core::{Error, ProcessLink, VersionInfoFactory};

/// Run the status command
pub fn run(pid: u32, layouts: Option<&Path>) -> Result<()> {
    let mut link = ProcessLink::for_pid(pid);
    if let Err(e) = link.attach() {
        // distinguish "no server" and "protocol skew" from real faults
        match &e {
            Error::AttachFailure(reason) => {
                println!("Cannot attach to pid {pid}: {reason}");
                return Ok(());
            }
            Error::VersionMismatch { ours, theirs } => {
                println!(
                    "Cannot attach to pid {pid}: the embedded server speaks \
                     protocol {theirs}, this tool speaks {ours}"
                );
                return Ok(());
            }
            _ => return Err(e).context("attaching"),
        }
    }

    println!("Attached to pid {pid}");
    if let Some(slot) = link.slot() {
        println!("  client slot:      {slot}");
    }
    if let Some(server_pid) = link.server_pid() {
        println!("  server pid:       {server_pid}");
    }
    if let Some(protocol) = link.server_version() {
        println!("  server protocol:  {protocol}");
    }
    if let Ok(path) = link.path() {
        println!("  executable:       {}", path.display());
    }
    if let Ok(threads) = link.thread_ids() {
        println!("  threads:          {}", threads.len());
    }

    if let Some(layouts) = layouts {
        let factory = VersionInfoFactory::from_file(layouts)
            .with_context(|| format!("loading layout descriptions from {}", layouts.display()))?;
        match link.identify(&factory) {
            Ok(version) => println!("  identified build: {}", version.name()),
            Err(Error::UnknownVersion(md5)) => {
                println!("  identified build: unknown (md5 {md5})")
            }
            Err(e) => return Err(e).context("identifying build"),
        }
    }

    link.detach()?;
    Ok(())
}
