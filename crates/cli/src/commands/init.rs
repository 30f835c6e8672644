//! `conclave init` — write a starter configuration.

use conclave_config::AppConfig;
use std::path::{Path, PathBuf};

pub async fn run(path: Option<PathBuf>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = path.unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));

    if write_starter(&config_path, force)? {
        println!("Created {}", config_path.display());
        println!();
        println!("Next steps:");
        println!("  1. Set OPENROUTER_API_KEY (or add api_key to the file)");
        println!("  2. Adjust the [[sessions]] panel to taste");
        println!("  3. Run: conclave chat");
    } else {
        println!("Config already exists at {}", config_path.display());
        println!("Edit it manually, or re-run with --force to overwrite.");
    }
    Ok(())
}

/// Write the starter config. Returns false if a file is already there and
/// `force` is not set.
fn write_starter(path: &Path, force: bool) -> std::io::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    Ok(true)
}
