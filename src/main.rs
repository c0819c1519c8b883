mod cli;
mod config;
mod output;
mod pool;
mod server;
mod shell;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let config = config::DockmuxConfig::load_or_default(&cli.config)?;

    match cli.command {
        Command::Serve { socket } => {
            cli::serve::run(config, socket).await?;
        }

        Command::Exec {
            env,
            user,
            host,
            cmd,
        } => {
            cli::exec::run(
                config,
                env.as_deref(),
                user.as_deref(),
                host.as_deref(),
                &cmd,
            )
            .await?;
        }

        Command::Envs => {
            cli::envs::run(&config)?;
        }
    }

    Ok(())
}
