//! Versions command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use burrow_core::VersionInfoFactory;

/// Run the versions command
pub fn run(layouts: &Path) -> Result<()> {
    let factory = VersionInfoFactory::from_file(layouts)
        .with_context(|| format!("loading layout descriptions from {}", layouts.display()))?;

    let mut count = 0;
    for version in factory.versions() {
        let os = version
            .os()
            .map(|os| os.to_string())
            .unwrap_or_else(|| "?".into());
        let md5 = version.md5().unwrap_or("-");
        println!("{:<32} {:<8} {}", version.name(), os, md5);
        count += 1;
    }
    println!();
    println!("{count} version(s)");
    Ok(())
}
