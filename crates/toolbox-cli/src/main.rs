//! admin-toolbox - ephemeral interactive containers for operators.

use anyhow::Result;
use clap::Parser;
use toolbox_cli::engine::{EXIT_ENGINE_FAILURE, EngineError};
use toolbox_cli::session::SessionError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands, GlobalOptions};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "admin_toolbox=debug,toolbox_cli=debug"
    } else {
        "admin_toolbox=info,toolbox_cli=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(e) => report(&e),
    };

    // Exit without dropping the runtime: a blocked stdin read would
    // otherwise keep the process alive.
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<()> {
    let global = GlobalOptions::from(&cli);

    match cli.command {
        Commands::Run(args) => commands::run::execute(args, &global).await,
        Commands::Ps => commands::ps::execute(&global).await,
        Commands::Prune => commands::prune::execute(&global).await,
        Commands::Version => commands::version::execute(),
    }
}

/// Prints the error and returns the process exit code for it.
fn report(error: &anyhow::Error) -> i32 {
    if let Some(session) = error.downcast_ref::<SessionError>() {
        // The container's own output already explains a non-zero exit.
        if !matches!(session, SessionError::NonZeroExit { .. }) {
            eprintln!("admin-toolbox: {}", render(error));
        }
        return session.exit_code();
    }

    eprintln!("admin-toolbox: {}", render(error));
    if error.chain().any(|cause| cause.is::<EngineError>()) {
        EXIT_ENGINE_FAILURE
    } else {
        1
    }
}

/// One line with every cause not already spelled out by its parent.
fn render(error: &anyhow::Error) -> String {
    let mut line = error.to_string();
    for cause in error.chain().skip(1) {
        let text = cause.to_string();
        if !line.contains(&text) {
            line.push_str(": ");
            line.push_str(&text);
        }
    }
    line
}
