use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{RemoteOutput, RemoteShell, ShellError};
use crate::pool::ConnectionKey;

/// In-memory stand-in for the ssh client. Clones share state, so a test can keep one
/// handle while the pool owns another.
#[derive(Clone, Default)]
pub struct FakeShell {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    attempts: AtomicUsize,
    established: AtomicUsize,
    kills: AtomicUsize,
    terminations: AtomicUsize,
    fail_connect: AtomicBool,
    fail_probe: AtomicBool,
    fail_terminate: AtomicBool,
    fail_run: AtomicBool,
    connect_delay: Mutex<Duration>,
    run_delay: Mutex<Duration>,
    masters: Mutex<Vec<Arc<AtomicBool>>>,
}

pub struct FakeMaster {
    pub id: usize,
    alive: Arc<AtomicBool>,
}

impl FakeShell {
    /// Calls to `start_master`, successful or not.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn established(&self) -> usize {
        self.inner.established.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.inner.kills.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.inner.terminations.load(Ordering::SeqCst)
    }

    pub fn live_masters(&self) -> usize {
        self.inner
            .masters
            .lock()
            .unwrap()
            .iter()
            .filter(|alive| alive.load(Ordering::SeqCst))
            .count()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_probe(&self, fail: bool) {
        self.inner.fail_probe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_terminate(&self, fail: bool) {
        self.inner.fail_terminate.store(fail, Ordering::SeqCst);
    }

    /// Make `run` fail as if the control channel broke, while the master keeps running.
    pub fn set_fail_run(&self, fail: bool) {
        self.inner.fail_run.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock().unwrap() = delay;
    }

    pub fn set_run_delay(&self, delay: Duration) {
        *self.inner.run_delay.lock().unwrap() = delay;
    }

    /// Simulate every master dying underneath the pool (network drop, remote reboot).
    pub fn crash_all(&self) {
        for alive in self.inner.masters.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    type Master = FakeMaster;

    async fn start_master(
        &self,
        key: &ConnectionKey,
        control_path: &Path,
    ) -> Result<FakeMaster, ShellError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(ShellError::MasterExited {
                status: "exit status: 255".to_string(),
                stderr: format!("{}: Permission denied (publickey).", key),
            });
        }

        std::fs::write(control_path, b"")?;

        let id = self.inner.established.fetch_add(1, Ordering::SeqCst) + 1;
        let alive = Arc::new(AtomicBool::new(true));
        self.inner.masters.lock().unwrap().push(Arc::clone(&alive));

        Ok(FakeMaster { id, alive })
    }

    async fn probe(&self, master: &FakeMaster) -> Result<(), ShellError> {
        if self.inner.fail_probe.load(Ordering::SeqCst) || !master.alive.load(Ordering::SeqCst) {
            return Err(ShellError::CommandFailed(
                "Control socket connect: Connection refused".to_string(),
            ));
        }
        Ok(())
    }

    async fn run(&self, master: &FakeMaster, command: &str) -> Result<RemoteOutput, ShellError> {
        let delay = *self.inner.run_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.inner.fail_run.load(Ordering::SeqCst) {
            return Err(ShellError::CommandFailed(
                "mux_client_read_packet: read header failed: Broken pipe".to_string(),
            ));
        }

        if !master.alive.load(Ordering::SeqCst) {
            return Err(ShellError::CommandFailed(
                "mux_client_request_session: session request failed".to_string(),
            ));
        }

        if let Some(code) = command.strip_prefix("exit ") {
            return Ok(RemoteOutput {
                status: code.trim().parse().ok(),
                stdout: b"partial\n".to_vec(),
                stderr: b"boom\n".to_vec(),
            });
        }

        Ok(RemoteOutput {
            status: Some(0),
            stdout: format!("{}\n", command).into_bytes(),
            stderr: Vec::new(),
        })
    }

    async fn terminate(&self, master: &FakeMaster) -> Result<(), ShellError> {
        self.inner.terminations.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_terminate.load(Ordering::SeqCst) {
            return Err(ShellError::CommandFailed(
                "Control socket connect: Connection refused".to_string(),
            ));
        }
        master.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self, master: &FakeMaster) -> Result<(), ShellError> {
        self.inner.kills.fetch_add(1, Ordering::SeqCst);
        master.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn has_exited(&self, master: &FakeMaster) -> bool {
        !master.alive.load(Ordering::SeqCst)
    }
}
