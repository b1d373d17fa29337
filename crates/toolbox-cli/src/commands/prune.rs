//! Prune command implementation.
//!
//! Removes toolbox containers left behind by sessions that could not clean
//! up (engine restarts, killed processes).

use super::GlobalOptions;
use anyhow::{Context, Result};
use nix::unistd::getuid;
use toolbox_cli::client::short_id;
use toolbox_cli::config::Settings;
use toolbox_cli::container_spec::{LABEL_FOR_UID, LABEL_OWNER};
use toolbox_cli::engine::Engine;
use toolbox_cli::identity;

/// Executes the prune command.
pub async fn execute(global: &GlobalOptions) -> Result<()> {
    let settings = Settings::load(identity::is_privileged())?;
    let engine = super::connect(global, &settings).await?;

    let uid = getuid().as_raw().to_string();
    let containers = engine
        .list_containers(&[(LABEL_OWNER, "true"), (LABEL_FOR_UID, &uid)])
        .await
        .context("Failed to list containers")?;

    for container in &containers {
        match engine.remove(&container.id, true, true).await {
            Ok(()) => println!("{}", short_id(&container.id)),
            Err(e) if e.is_already_removed() => {}
            Err(e) => eprintln!("Error removing {}: {}", short_id(&container.id), e),
        }
    }

    Ok(())
}
