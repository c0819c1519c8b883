use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::config::DockmuxConfig;
use crate::output;
use crate::pool::ConnectionPool;
use crate::server;
use crate::shell::SshShell;

pub async fn run(config: DockmuxConfig, socket: Option<PathBuf>) -> Result<()> {
    let settings = config.pool_settings();
    let shell = SshShell::new(&config.ssh, settings.connect_timeout)?;
    let pool = ConnectionPool::new(shell, settings)?;
    let socket = socket.unwrap_or_else(|| config.socket_path());

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    info!(
        "Control sockets in {}",
        pool.settings().control_dir.display()
    );
    pool.start_reaper().await;
    output::success(&format!("Listening on {}", socket.display()));

    let result = server::run(pool.clone(), &socket, async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    })
    .await;

    output::info("Shutting down, closing SSH connections");
    pool.shutdown().await;

    result
}
