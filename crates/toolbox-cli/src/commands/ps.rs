//! Ps (list toolbox containers) command implementation.

use super::GlobalOptions;
use anyhow::{Context, Result};
use nix::unistd::getuid;
use toolbox_cli::client::short_id;
use toolbox_cli::config::Settings;
use toolbox_cli::container_spec::{LABEL_FOR_UID, LABEL_OWNER};
use toolbox_cli::engine::Engine;
use toolbox_cli::identity;

/// Executes the ps command.
pub async fn execute(global: &GlobalOptions) -> Result<()> {
    let settings = Settings::load(identity::is_privileged())?;
    let engine = super::connect(global, &settings).await?;

    let uid = getuid().as_raw().to_string();
    let containers = engine
        .list_containers(&[(LABEL_OWNER, "true"), (LABEL_FOR_UID, &uid)])
        .await
        .context("Failed to list containers")?;

    println!(
        "{:<12} {:<40} {:<30} {:<20}",
        "CONTAINER ID", "NAME", "IMAGE", "STATUS"
    );

    for container in containers {
        let name = container
            .names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or_default();

        println!(
            "{:<12} {:<40} {:<30} {:<20}",
            short_id(&container.id),
            name,
            container.image,
            container.status
        );
    }

    Ok(())
}
