//! Dump command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use burrow_core::VersionInfoFactory;

/// Run the dump command
pub fn run(layouts: &Path, name: &str) -> Result<()> {
    let mut factory = VersionInfoFactory::from_file(layouts)
        .with_context(|| format!("loading layout descriptions from {}", layouts.display()))?;
    let version = factory
        .resolve(name)
        .with_context(|| format!("resolving version {name:?}"))?;
    print!("{version}");
    Ok(())
}
