use serde::{Deserialize, Serialize};

use crate::pool::ConnectionInfo;

/// One request per line, tagged by `op`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Open(Target),
    Close(Target),
    Status(Target),
    List,
    Exec(ExecRequest),
}

#[derive(Debug, Deserialize, Default)]
pub struct Target {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub hostname: String,
}

impl Target {
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.hostname.is_empty()
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub command: String,
}

impl ExecRequest {
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.hostname.is_empty() && !self.command.is_empty()
    }
}

#[derive(Debug, Serialize, Default)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_tunnels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<ConnectionInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
