use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Identity of a remote endpoint: `username@hostname`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionKey {
    pub username: String,
    pub hostname: String,
}

impl ConnectionKey {
    pub fn new(username: &str, hostname: &str) -> Self {
        Self {
            username: username.to_string(),
            hostname: hostname.to_string(),
        }
    }

    /// Control socket location for this key under `control_dir`.
    ///
    /// Hashed so arbitrary user/host strings map to a short, filesystem-safe name that fits
    /// the unix socket path limit. The same key always maps to the same path, which lets a
    /// socket left behind by a crashed process be found and removed.
    pub fn control_path(&self, control_dir: &Path) -> PathBuf {
        let digest = Sha256::digest(self.to_string().as_bytes());
        control_dir.join(format!("ssh-{}.sock", &hex::encode(digest)[..16]))
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.hostname)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Active,
    Broken,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Broken => "broken",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The shareable part of a record: what a command needs to run outside the registry lock.
/// Carries its key so a holder can find its own record again for touch and eviction.
pub struct Connection<M> {
    pub(super) key: ConnectionKey,
    pub(super) control_path: PathBuf,
    pub(super) master: M,
}

/// Registry entry for one key.
pub struct ConnectionRecord<M> {
    pub conn: Arc<Connection<M>>,
    pub state: ConnectionState,
    pub connected_at: DateTime<Local>,
    last_used: Instant,
}

impl<M> ConnectionRecord<M> {
    pub fn active(conn: Arc<Connection<M>>) -> Self {
        Self {
            conn,
            state: ConnectionState::Active,
            connected_at: Local::now(),
            last_used: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_used = self.last_used.max(Instant::now());
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_used)
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection: self.conn.key.to_string(),
            control_path: self.conn.control_path.display().to_string(),
            state: self.state,
            connected_at: self.connected_at.to_rfc3339(),
            idle_secs: self.idle_for().as_secs(),
        }
    }
}

/// Listing view of a record.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection: String,
    pub control_path: String,
    pub state: ConnectionState,
    pub connected_at: String,
    pub idle_secs: u64,
}
