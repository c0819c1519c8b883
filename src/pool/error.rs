use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("failed to establish SSH connection for {key}: {reason}")]
    ConnectFailed { key: String, reason: String },

    #[error("command failed on {key}: {reason}")]
    ExecFailed {
        key: String,
        /// Remote exit code; `None` for transport errors and signals.
        status: Option<i32>,
        reason: String,
        /// Whatever stdout/stderr was captured before the failure.
        output: Vec<u8>,
    },

    #[error("{operation} for {key} timed out after {}s", after.as_secs())]
    Timeout {
        key: String,
        operation: &'static str,
        after: Duration,
    },

    #[error("not connecting {key}: the pool is shutting down")]
    ShuttingDown { key: String },
}

impl PoolError {
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            PoolError::ExecFailed { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn is_connect_failure(&self) -> bool {
        matches!(self, PoolError::ConnectFailed { .. })
    }
}
