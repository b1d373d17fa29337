//! Version command implementation.

use anyhow::Result;
use toolbox_cli::config::Settings;
use toolbox_cli::identity;

/// Executes the version command.
pub fn execute() -> Result<()> {
    let settings = Settings::load(identity::is_privileged())?;

    println!("admin-toolbox version {}", env!("CARGO_PKG_VERSION"));
    println!("Default config dir: {}", settings.default_conf_dir.display());

    Ok(())
}
