use std::sync::Weak;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::ConnectionPool;
use crate::shell::RemoteShell;

/// Background task closing idle connections on a fixed interval.
///
/// Holds only a weak reference to the pool and exits on its own once the pool is dropped.
pub struct Reaper {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Reaper {
    pub fn spawn<S: RemoteShell>(pool: Weak<ConnectionPool<S>>, check_interval: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let closed = pool.reap_idle().await;
                        if closed > 0 {
                            debug!("Idle reaper closed {} connection(s)", closed);
                        }
                    }
                }
            }

            debug!("Idle reaper stopped");
        });

        Self { stop, handle }
    }

    /// Signal the task and wait for it to finish its current cycle.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            warn!("Idle reaper task failed: {}", e);
        }
    }
}
