pub mod error;
pub mod reaper;
pub mod record;


use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use error::PoolError;
pub use record::{ConnectionInfo, ConnectionKey, ConnectionState};

use crate::shell::RemoteShell;
use reaper::Reaper;
use record::{Connection, ConnectionRecord};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Directory holding one control socket per connection.
    pub control_dir: PathBuf,
    pub idle_timeout: Duration,
    pub check_interval: Duration,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    pub close_timeout: Duration,
}

struct Registry<M> {
    records: HashMap<ConnectionKey, ConnectionRecord<M>>,
    gates: HashMap<ConnectionKey, Arc<Gate>>,
}

/// Serializes establishment and teardown of one key. The guarded value is the failure of
/// the last establishment attempt, handed to callers that queued up behind it.
#[derive(Default)]
struct Gate {
    /// Finished establishment attempts.
    attempts: AtomicU64,
    lock: Arc<Mutex<Option<PoolError>>>,
}

struct GateGuard {
    gate: Arc<Gate>,
    /// `attempts` at the time this holder queued up.
    joined_at: u64,
    last_failure: OwnedMutexGuard<Option<PoolError>>,
}

impl GateGuard {
    /// The failure of an attempt that finished while we were waiting, if any.
    fn shared_failure(&self) -> Option<PoolError> {
        if self.gate.attempts.load(Ordering::SeqCst) > self.joined_at {
            (*self.last_failure).clone()
        } else {
            None
        }
    }

    fn record<T>(&mut self, result: &Result<T, PoolError>) {
        *self.last_failure = result.as_ref().err().cloned();
        self.gate.attempts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Pool of multiplexed SSH master connections, at most one per `user@host`.
///
/// The registry lock is only held for map reads and writes. Starting, probing, running
/// through and tearing down a master all happen outside it; per-key gates make sure only
/// one establishment or teardown for a given key is in flight at a time. Callers that queue
/// behind a failing attempt get its error instead of starting another one.
pub struct ConnectionPool<S: RemoteShell> {
    shell: S,
    settings: PoolSettings,
    registry: Mutex<Registry<S::Master>>,
    reaper: Mutex<Option<Reaper>>,
    /// Set by `shutdown`; no new masters are started afterwards.
    closing: AtomicBool,
}

impl<S: RemoteShell> ConnectionPool<S> {
    pub fn new(shell: S, settings: PoolSettings) -> Result<Arc<Self>> {
        create_control_dir(&settings.control_dir).with_context(|| {
            format!(
                "Failed to create control directory: {}",
                settings.control_dir.display()
            )
        })?;

        Ok(Arc::new(Self {
            shell,
            settings,
            registry: Mutex::new(Registry {
                records: HashMap::new(),
                gates: HashMap::new(),
            }),
            reaper: Mutex::new(None),
            closing: AtomicBool::new(false),
        }))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Make sure a live master exists for `username@hostname`. Reuses the existing one
    /// when there is one.
    pub async fn open(&self, username: &str, hostname: &str) -> Result<(), PoolError> {
        let key = ConnectionKey::new(username, hostname);
        self.acquire(&key).await.map(|_| ())
    }

    /// Run `command` on the remote host and return its combined output.
    ///
    /// Opens a connection first if there is none. A non-zero exit is returned as
    /// `ExecFailed` carrying the captured output; the connection stays pooled. A transport
    /// failure evicts the connection so the next call starts a fresh one.
    pub async fn execute(
        &self,
        username: &str,
        hostname: &str,
        command: &str,
    ) -> Result<Vec<u8>, PoolError> {
        let key = ConnectionKey::new(username, hostname);
        let mut conn = self.acquire(&key).await?;

        if self.shell.has_exited(&conn.master).await {
            warn!("SSH master for {} exited unexpectedly, reconnecting", key);
            self.evict(&conn).await;
            conn = self.acquire(&key).await?;
        }

        let after = self.settings.command_timeout;
        let result = timeout(after, self.shell.run(&conn.master, command)).await;
        self.touch(&conn).await;

        match result {
            Err(_) => Err(PoolError::Timeout {
                key: key.to_string(),
                operation: "command",
                after,
            }),
            Ok(Err(e)) => {
                warn!("Command transport failed for {}: {}", key, e);
                self.evict(&conn).await;
                Err(PoolError::ExecFailed {
                    key: key.to_string(),
                    status: None,
                    reason: e.to_string(),
                    output: Vec::new(),
                })
            }
            Ok(Ok(output)) if output.success() => Ok(output.combined()),
            Ok(Ok(output)) => {
                let status = output.status;
                let reason = match status {
                    Some(code) => format!("exit status {}", code),
                    None => "terminated by signal".to_string(),
                };
                debug!("[{}] command exited non-zero: {}", key, reason);
                Err(PoolError::ExecFailed {
                    key: key.to_string(),
                    status,
                    reason,
                    output: output.combined(),
                })
            }
        }
    }

    /// Tear down the connection for `username@hostname`, if any. Never fails.
    pub async fn close(&self, username: &str, hostname: &str) {
        let key = ConnectionKey::new(username, hostname);
        self.retire(&key, ConnectionState::Closed, |_| true).await;
    }

    /// Tear down every connection and clear the registry.
    ///
    /// Keys with an establishment in flight are included: their teardown waits on the gate
    /// and retires whatever the establishment published.
    pub async fn close_all(&self) {
        let keys: BTreeSet<ConnectionKey> = {
            let registry = self.registry.lock().await;
            registry
                .records
                .keys()
                .chain(registry.gates.keys())
                .cloned()
                .collect()
        };

        if !keys.is_empty() {
            info!("Closing SSH connections for {} key(s)", keys.len());
        }

        join_all(
            keys.iter()
                .map(|key| self.retire(key, ConnectionState::Closed, |_| true)),
        )
        .await;
    }

    /// Probe the connection for `username@hostname`. A connection that fails the probe is
    /// evicted.
    pub async fn is_active(&self, username: &str, hostname: &str) -> bool {
        let key = ConnectionKey::new(username, hostname);

        let conn = {
            let registry = self.registry.lock().await;
            match registry.records.get(&key) {
                Some(record) if record.is_active() => Arc::clone(&record.conn),
                _ => return false,
            }
        };

        let after = self.settings.probe_timeout;
        let failure = match timeout(after, self.shell.probe(&conn.master)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no answer within {}s", after.as_secs()),
        };

        warn!("SSH connection for {} appears to be broken: {}", key, failure);
        self.evict(&conn).await;
        false
    }

    pub async fn list_active(&self) -> Vec<ConnectionKey> {
        let registry = self.registry.lock().await;
        let mut keys: Vec<ConnectionKey> = registry
            .records
            .iter()
            .filter(|(_, record)| record.is_active())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub async fn list_details(&self) -> Vec<ConnectionInfo> {
        let registry = self.registry.lock().await;
        let mut details: Vec<ConnectionInfo> = registry
            .records
            .values()
            .filter(|record| record.is_active())
            .map(|record| record.info())
            .collect();
        details.sort_by(|a, b| a.connection.cmp(&b.connection));
        details
    }

    /// One reaper cycle: close every connection idle for longer than the idle timeout.
    /// Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.settings.idle_timeout;

        let idle: Vec<(ConnectionKey, Duration)> = {
            let registry = self.registry.lock().await;
            registry
                .records
                .iter()
                .filter(|(_, record)| record.is_active() && record.idle_for() > idle_timeout)
                .map(|(key, record)| (key.clone(), record.idle_for()))
                .collect()
        };

        let mut closed = 0;
        for (key, idle_for) in idle {
            info!(
                "Closing idle SSH connection for {} (idle for {}s)",
                key,
                idle_for.as_secs()
            );
            // Re-checked under the gate: the key may have been used in the meantime.
            if self
                .retire(&key, ConnectionState::Closed, |record| {
                    record.idle_for() > idle_timeout
                })
                .await
            {
                closed += 1;
            }
        }
        closed
    }

    /// Start the background idle reaper. No-op if it is already running.
    pub async fn start_reaper(self: &Arc<Self>) {
        let mut slot = self.reaper.lock().await;
        if slot.is_none() {
            *slot = Some(Reaper::spawn(
                Arc::downgrade(self),
                self.settings.check_interval,
            ));
        }
    }

    /// Refuse new connections, stop the reaper and close every connection.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let reaper = self.reaper.lock().await.take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }
        self.close_all().await;
    }

    async fn acquire(&self, key: &ConnectionKey) -> Result<Arc<Connection<S::Master>>, PoolError> {
        if let Some(conn) = self.reuse(key).await {
            return Ok(conn);
        }

        let mut gate = self.gate(key).await;
        // Whoever held the gate before us may have just published a connection, or failed to.
        let result = if let Some(conn) = self.reuse(key).await {
            Ok(conn)
        } else if let Some(err) = gate.shared_failure() {
            debug!("Connection attempt for {} failed while queued: {}", key, err);
            Err(err)
        } else if self.closing.load(Ordering::SeqCst) {
            Err(PoolError::ShuttingDown {
                key: key.to_string(),
            })
        } else {
            let result = self.establish(key).await;
            gate.record(&result);
            result
        };
        self.release(key, gate).await;
        result
    }

    async fn reuse(&self, key: &ConnectionKey) -> Option<Arc<Connection<S::Master>>> {
        let mut registry = self.registry.lock().await;
        let record = registry
            .records
            .get_mut(key)
            .filter(|record| record.is_active())?;
        record.touch();
        debug!("Reusing existing SSH connection for {}", key);
        Some(Arc::clone(&record.conn))
    }

    async fn establish(&self, key: &ConnectionKey) -> Result<Arc<Connection<S::Master>>, PoolError> {
        let control_path = key.control_path(&self.settings.control_dir);

        // Left over by a previous process that did not shut down cleanly.
        remove_control_socket(&control_path).await;

        info!("Starting new SSH master connection for {}", key);
        debug!("[{}] {}", key, ConnectionState::Connecting);

        // On timeout the start future is dropped, which kills the half-started master.
        let connect_timeout = self.settings.connect_timeout;
        let master = match timeout(
            connect_timeout,
            self.shell.start_master(key, &control_path),
        )
        .await
        {
            Ok(Ok(master)) => master,
            Ok(Err(e)) => {
                remove_control_socket(&control_path).await;
                return Err(PoolError::ConnectFailed {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                remove_control_socket(&control_path).await;
                return Err(PoolError::Timeout {
                    key: key.to_string(),
                    operation: "connect",
                    after: connect_timeout,
                });
            }
        };

        let probe_timeout = self.settings.probe_timeout;
        let failure = match timeout(probe_timeout, self.shell.probe(&master)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(PoolError::ConnectFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Some(PoolError::Timeout {
                key: key.to_string(),
                operation: "liveness probe",
                after: probe_timeout,
            }),
        };

        if let Some(err) = failure {
            warn!("New SSH connection for {} failed its probe: {}", key, err);
            self.force_kill(key, &master).await;
            remove_control_socket(&control_path).await;
            return Err(err);
        }

        let conn = Arc::new(Connection {
            key: key.clone(),
            control_path,
            master,
        });

        self.registry
            .lock()
            .await
            .records
            .insert(key.clone(), ConnectionRecord::active(Arc::clone(&conn)));

        info!("Successfully established SSH connection for {}", key);
        Ok(conn)
    }

    async fn touch(&self, conn: &Arc<Connection<S::Master>>) {
        let mut registry = self.registry.lock().await;
        if let Some(record) = registry.records.get_mut(&conn.key) {
            if Arc::ptr_eq(&record.conn, conn) {
                record.touch();
            }
        }
    }

    /// Remove `conn` as broken, unless it was already replaced.
    async fn evict(&self, conn: &Arc<Connection<S::Master>>) {
        self.retire(&conn.key, ConnectionState::Broken, |record| {
            Arc::ptr_eq(&record.conn, conn)
        })
        .await;
    }

    /// Remove the record for `key` if `should_retire` agrees, then tear it down. Returns
    /// whether a record was removed.
    async fn retire<F>(&self, key: &ConnectionKey, state: ConnectionState, should_retire: F) -> bool
    where
        F: FnOnce(&ConnectionRecord<S::Master>) -> bool + Send,
    {
        let gate = self.gate(key).await;

        let removed = {
            let mut registry = self.registry.lock().await;
            let matches = registry
                .records
                .get(key)
                .is_some_and(|record| record.is_active() && should_retire(record));
            if matches {
                registry.records.remove(key)
            } else {
                None
            }
        };

        let retired = removed.is_some();
        if let Some(mut record) = removed {
            record.state = state;
            self.teardown(&record).await;
        }

        self.release(key, gate).await;
        retired
    }

    /// Best effort: graceful exit first, kill if that fails, then drop the socket file.
    async fn teardown(&self, record: &ConnectionRecord<S::Master>) {
        let conn = &record.conn;
        debug!("[{}] {}", conn.key, record.state);

        if record.state == ConnectionState::Broken {
            debug!("Discarding broken SSH connection for {}", conn.key);
            self.force_kill(&conn.key, &conn.master).await;
        } else {
            info!("Closing SSH connection for {}", conn.key);
            let after = self.settings.close_timeout;
            let failure = match timeout(after, self.shell.terminate(&conn.master)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("master still running after {}s", after.as_secs())),
            };
            if let Some(reason) = failure {
                warn!(
                    "Error closing SSH connection for {} cleanly: {}, killing master",
                    conn.key, reason
                );
                self.force_kill(&conn.key, &conn.master).await;
            }
        }

        remove_control_socket(&conn.control_path).await;
    }

    async fn force_kill(&self, key: &ConnectionKey, master: &S::Master) {
        match timeout(self.settings.close_timeout, self.shell.kill(master)).await {
            Ok(Ok(())) => debug!("Killed SSH master for {}", key),
            Ok(Err(e)) => warn!("Failed to kill SSH master for {}: {}", key, e),
            Err(_) => warn!("Timed out killing SSH master for {}", key),
        }
    }

    async fn gate(&self, key: &ConnectionKey) -> GateGuard {
        let (gate, joined_at) = {
            let mut registry = self.registry.lock().await;
            let gate = Arc::clone(registry.gates.entry(key.clone()).or_default());
            let joined_at = gate.attempts.load(Ordering::SeqCst);
            (gate, joined_at)
        };
        let last_failure = Arc::clone(&gate.lock).lock_owned().await;
        GateGuard {
            gate,
            joined_at,
            last_failure,
        }
    }

    /// Drop our hold on the gate and forget it if nobody else is waiting on it. Gates are
    /// only cloned under the registry lock, so the count check cannot race a new waiter.
    async fn release(&self, key: &ConnectionKey, guard: GateGuard) {
        drop(guard);
        let mut registry = self.registry.lock().await;
        if registry
            .gates
            .get(key)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            registry.gates.remove(key);
        }
    }
}

fn create_control_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

async fn remove_control_socket(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed control socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove control socket {}: {}", path.display(), e),
    }
}
