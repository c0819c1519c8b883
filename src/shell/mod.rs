pub mod ssh;

#[cfg(test)]
pub mod fake;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::pool::ConnectionKey;

pub use ssh::SshShell;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Ssh(#[from] openssh::Error),

    #[error("master process exited ({status}): {stderr}")]
    MasterExited { status: String, stderr: String },

    #[error("{0}")]
    CommandFailed(String),
}

/// Output of one command run over a master connection.
#[derive(Debug, Clone, Default)]
pub struct RemoteOutput {
    /// `None` when the remote process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(mut self) -> Vec<u8> {
        self.stdout.append(&mut self.stderr);
        self.stdout
    }
}

/// The remote-shell capability the pool drives: start a multiplexed master bound to a
/// control socket, run commands through it, and end it.
///
/// Implementations do not apply timeouts themselves; the pool bounds every call.
#[async_trait]
pub trait RemoteShell: Send + Sync + 'static {
    /// Handle to a running master session and its backing process.
    type Master: Send + Sync + 'static;

    /// Start a master for `key` listening on `control_path` and wait until the socket is
    /// ready. Dropping the returned future must not leave the process running.
    async fn start_master(
        &self,
        key: &ConnectionKey,
        control_path: &Path,
    ) -> Result<Self::Master, ShellError>;

    /// Cheap round trip through the control socket.
    async fn probe(&self, master: &Self::Master) -> Result<(), ShellError>;

    /// Run `command` verbatim through the master. A non-zero exit is reported through
    /// `RemoteOutput::status`, not as an error.
    async fn run(&self, master: &Self::Master, command: &str) -> Result<RemoteOutput, ShellError>;

    /// Ask the master to exit and wait for the backing process to go away.
    async fn terminate(&self, master: &Self::Master) -> Result<(), ShellError>;

    /// Kill the backing process.
    async fn kill(&self, master: &Self::Master) -> Result<(), ShellError>;

    /// True once the backing process is gone, without touching the remote host.
    async fn has_exited(&self, master: &Self::Master) -> bool;
}
