use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use openssh::Session;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;

use super::{RemoteOutput, RemoteShell, ShellError};
use crate::config::SshConfig;
use crate::pool::ConnectionKey;

const SOCKET_POLL: Duration = Duration::from_millis(100);

/// OpenSSH client driven as a ControlMaster.
///
/// The master runs in the foreground as our own child (`ssh -M -S <ctl> -N`), so it can be
/// killed directly if `-O exit` does not bring it down. Commands and liveness checks go
/// through the control socket with openssh's native mux client.
pub struct SshShell {
    program: PathBuf,
    server_alive_interval: u64,
    server_alive_count_max: u32,
    connect_timeout: u64,
}

pub struct SshMaster {
    destination: String,
    control_path: PathBuf,
    session: Session,
    process: Mutex<Child>,
}

impl SshShell {
    pub fn new(config: &SshConfig, connect_timeout: Duration) -> anyhow::Result<Self> {
        let program = which::which(&config.program)
            .with_context(|| format!("SSH client '{}' not found in PATH", config.program))?;

        Ok(Self {
            program,
            server_alive_interval: config.server_alive_interval,
            server_alive_count_max: config.server_alive_count_max,
            connect_timeout: connect_timeout.as_secs().max(1),
        })
    }

    fn master_command(&self, destination: &str, control_path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-M")
            .arg("-S")
            .arg(control_path)
            .arg("-N")
            .args(["-o", "ControlMaster=yes"])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout))
            .arg("-o")
            .arg(format!("ServerAliveInterval={}", self.server_alive_interval))
            .arg("-o")
            .arg(format!("ServerAliveCountMax={}", self.server_alive_count_max))
            .arg(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

async fn drain_stderr(child: &mut Child) -> String {
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        if let Err(e) = stderr.read_to_string(&mut buf).await {
            debug!("Failed to read ssh master stderr: {}", e);
        }
    }
    buf.trim().to_string()
}

/// Keep reading a running master's stderr so it never blocks on a full pipe. Ends when the
/// master exits.
fn forward_stderr(child: &mut Child, destination: &str) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    let destination = destination.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!("[{}] ssh: {}", destination, line),
                Ok(None) => break,
                Err(e) => {
                    debug!("[{}] stopped reading ssh stderr: {}", destination, e);
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl RemoteShell for SshShell {
    type Master = SshMaster;

    async fn start_master(
        &self,
        key: &ConnectionKey,
        control_path: &Path,
    ) -> Result<SshMaster, ShellError> {
        let destination = key.to_string();
        debug!("[{}] starting master on {}", destination, control_path.display());

        let mut child = self.master_command(&destination, control_path).spawn()?;

        // The master creates its control socket once authentication succeeded.
        loop {
            if let Some(status) = child.try_wait()? {
                let stderr = drain_stderr(&mut child).await;
                return Err(ShellError::MasterExited {
                    status: status.to_string(),
                    stderr,
                });
            }
            if tokio::fs::try_exists(control_path).await.unwrap_or(false) {
                break;
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }

        forward_stderr(&mut child, &destination);

        let session = Session::resume_mux(control_path.to_path_buf().into_boxed_path(), None);

        Ok(SshMaster {
            destination,
            control_path: control_path.to_path_buf(),
            session,
            process: Mutex::new(child),
        })
    }

    async fn probe(&self, master: &SshMaster) -> Result<(), ShellError> {
        if self.has_exited(master).await {
            return Err(ShellError::CommandFailed(format!(
                "master process for {} is not running",
                master.destination
            )));
        }
        master.session.check().await?;
        Ok(())
    }

    async fn run(&self, master: &SshMaster, command: &str) -> Result<RemoteOutput, ShellError> {
        debug!("[{}] exec: {}", master.destination, command);

        let output = master.session.raw_command(command).output().await?;

        Ok(RemoteOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn terminate(&self, master: &SshMaster) -> Result<(), ShellError> {
        debug!("[{}] requesting master exit", master.destination);

        let output = Command::new(&self.program)
            .arg("-S")
            .arg(&master.control_path)
            .args(["-O", "exit"])
            .arg(&master.destination)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(ShellError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        master.process.lock().await.wait().await?;
        Ok(())
    }

    async fn kill(&self, master: &SshMaster) -> Result<(), ShellError> {
        let mut process = master.process.lock().await;
        if process.try_wait()?.is_some() {
            return Ok(());
        }
        process.kill().await?;
        Ok(())
    }

    async fn has_exited(&self, master: &SshMaster) -> bool {
        !matches!(master.process.lock().await.try_wait(), Ok(None))
    }
}
