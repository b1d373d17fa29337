//! CLI command implementations.
//!
//! - Session: run
//! - Housekeeping: ps, prune
//! - System: version

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use toolbox_cli::client::{self, EngineClient};
use toolbox_cli::config::Settings;

pub mod prune;
pub mod ps;
pub mod run;
pub mod version;

/// admin-toolbox - ephemeral interactive containers for operators
#[derive(Parser)]
#[command(name = "admin-toolbox")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the profile file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Name of a file from the default profile directory
    #[arg(short = 'p', long = "defaultrootprofile")]
    pub default_root_profile: Option<String>,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Unix socket path of the container engine
    ///
    /// Can also be set via ADMIN_TOOLBOX_SOCKET or DOCKER_HOST.
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run your toolbox container
    Run(run::RunArgs),

    /// List toolbox containers of the current user
    Ps,

    /// Remove leftover toolbox containers of the current user
    Prune,

    /// Show version information
    Version,
}

/// Options shared by every command.
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub default_root_profile: Option<String>,
    pub socket: Option<PathBuf>,
}

impl From<&Cli> for GlobalOptions {
    fn from(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            default_root_profile: cli.default_root_profile.clone(),
            socket: cli.socket.clone(),
        }
    }
}

/// Connects to the engine selected by flags, settings and environment.
pub async fn connect(global: &GlobalOptions, settings: &Settings) -> Result<EngineClient> {
    let socket =
        client::resolve_socket_path(global.socket.as_deref().or(settings.socket.as_deref()));
    let pinned = client::pinned_api_version()?;

    EngineClient::connect(&socket, pinned)
        .await
        .with_context(|| format!("Failed to connect to engine at {}", socket.display()))
}
