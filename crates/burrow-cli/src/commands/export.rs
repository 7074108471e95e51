//! Export command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use burrow_core::VersionInfoFactory;

/// Run the export command
pub fn run(layouts: &Path, name: &str, output: Option<&Path>) -> Result<()> {
    let mut factory = VersionInfoFactory::from_file(layouts)
        .with_context(|| format!("loading layout descriptions from {}", layouts.display()))?;
    let version = factory
        .resolve(name)
        .with_context(|| format!("resolving version {name:?}"))?;

    let json = serde_json::to_string_pretty(&version)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Exported {name:?} to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
