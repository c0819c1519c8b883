use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pool::PoolSettings;

mod validate;

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct DockmuxConfig {
    pub default_environment: Option<String>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub environments: Vec<Environment>,
}

/// Pool timings, all in seconds.
#[derive(Debug, Deserialize, Serialize)]
pub struct PoolConfig {
    pub control_dir: Option<PathBuf>,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    #[serde(default = "default_close_timeout")]
    pub close_timeout: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            control_dir: None,
            idle_timeout: default_idle_timeout(),
            check_interval: default_check_interval(),
            connect_timeout: default_connect_timeout(),
            probe_timeout: default_probe_timeout(),
            command_timeout: default_command_timeout(),
            close_timeout: default_close_timeout(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    600
}
fn default_check_interval() -> u64 {
    60
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_command_timeout() -> u64 {
    120
}
fn default_close_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_server_alive_interval")]
    pub server_alive_interval: u64,
    #[serde(default = "default_server_alive_count_max")]
    pub server_alive_count_max: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            server_alive_interval: default_server_alive_interval(),
            server_alive_count_max: default_server_alive_count_max(),
        }
    }
}

fn default_program() -> String {
    "ssh".to_string()
}
fn default_server_alive_interval() -> u64 {
    10
}
fn default_server_alive_count_max() -> u32 {
    2
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ServerConfig {
    pub socket: Option<PathBuf>,
}

/// A named remote Docker host.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Environment {
    pub name: String,
    pub user: String,
    pub host: String,
}

impl DockmuxConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        validate::validate(&config)?;

        Ok(config)
    }

    /// Like `load`, but a missing file means defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn environment(&self, name: &str) -> Result<&Environment> {
        self.environments
            .iter()
            .find(|env| env.name == name)
            .with_context(|| format!("Environment '{}' not found in config", name))
    }

    pub fn default_environment(&self) -> Result<&Environment> {
        let name = self
            .default_environment
            .as_deref()
            .context("No environment given and no default_environment configured")?;
        self.environment(name)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        let pool = &self.pool;
        PoolSettings {
            control_dir: pool.control_dir.clone().unwrap_or_else(default_control_dir),
            idle_timeout: Duration::from_secs(pool.idle_timeout),
            check_interval: Duration::from_secs(pool.check_interval),
            connect_timeout: Duration::from_secs(pool.connect_timeout),
            probe_timeout: Duration::from_secs(pool.probe_timeout),
            command_timeout: Duration::from_secs(pool.command_timeout),
            close_timeout: Duration::from_secs(pool.close_timeout),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.server.socket.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("dockmux.sock")
        })
    }
}

fn default_control_dir() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join("dockmux"),
        None => std::env::temp_dir().join("docker-remote-ssh"),
    }
}
