//! Run command implementation.

use super::GlobalOptions;
use anyhow::{Context, Result};
use chrono::Local;
use clap::Args;
use std::sync::Arc;
use toolbox_cli::config::{self, Settings};
use toolbox_cli::container_spec;
use toolbox_cli::engine::DynEngine;
use toolbox_cli::identity::{self, Identity};
use toolbox_cli::mounts;
use toolbox_cli::session::{Session, SessionError, SessionOptions};
use toolbox_cli::terminal::StdConsole;
use toolbox_cli::workdir::Workdir;

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Pull the image before creating the container
    #[arg(short, long)]
    pub pull: bool,

    /// Run for another uid (only when invoked by root, e.g. via sudo)
    #[arg(short, long)]
    pub uid: Option<u32>,
}

/// Executes the run command.
pub async fn execute(args: RunArgs, global: &GlobalOptions) -> Result<()> {
    let privileged = identity::is_privileged();
    let settings = Settings::load(privileged).map_err(SessionError::from)?;

    let config_path = global
        .config
        .as_deref()
        .context("-c argument required (no config path)")?;

    let identity = Identity::resolve(args.uid).map_err(SessionError::from)?;
    tracing::debug!(
        "Default config dir: {}",
        settings.default_conf_dir.display()
    );

    let config = config::resolve(
        &settings.default_conf_dir,
        global.default_root_profile.as_deref(),
        config_path,
        &identity,
        privileged,
    )
    .map_err(SessionError::from)?;

    tracing::debug!("Config: {}", config.conf_path.display());
    if let Some(user_conf) = &config.user_conf_path {
        tracing::debug!("User config: {}", user_conf.display());
    }
    if let Some(agent) = &config.ssh_agent {
        tracing::debug!("SSH agent host: {}", agent.host);
    }

    mounts::ensure_home_exists(&identity).map_err(SessionError::from)?;
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let request =
        container_spec::build(&config, &identity, &cwd).map_err(SessionError::from)?;

    let _workdir = Workdir::create(&identity, &config.name)?;

    let engine: DynEngine = Arc::new(super::connect(global, &settings).await?);

    let name = container_spec::container_name(
        &identity.username,
        &config.name,
        Local::now(),
        std::process::id(),
    );
    tracing::debug!("Container name: {}", name);

    let options = SessionOptions {
        name,
        pull: args.pull,
        resize_interval: settings.resize_interval(),
        start_failure_grace: settings.start_failure_grace(),
    };

    let mut session = Session::new(engine, Arc::new(StdConsole), options);
    session
        .run(&request, tokio::io::stdin(), tokio::io::stdout())
        .await?;

    Ok(())
}
