use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod envs;
pub mod exec;
pub mod serve;

#[derive(Parser)]
#[command(
    name = "dockmux",
    version,
    about = "Pooled SSH connections for running Docker commands on remote hosts"
)]
pub struct Cli {
    /// Path to dockmux.toml
    #[arg(short, long, default_value = "dockmux.toml")]
    pub config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the connection pool and answer requests on a unix socket
    Serve {
        /// Socket path (overrides server.socket)
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Execute a one-off command on a remote host
    Exec {
        /// Configured environment to target
        #[arg(short, long, conflicts_with_all = ["user", "host"])]
        env: Option<String>,
        /// Remote user
        #[arg(short, long, requires = "host")]
        user: Option<String>,
        /// Remote host
        #[arg(long, requires = "user")]
        host: Option<String>,
        /// Command to run
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },

    /// List configured environments
    Envs,
}
