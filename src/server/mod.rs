pub mod protocol;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::pool::ConnectionPool;
use crate::shell::RemoteShell;
use protocol::{Request, Response};

const MISSING_FIELDS: &str = "Missing required fields";

/// Serve JSON-line requests on a unix socket until `shutdown` resolves.
///
/// On shutdown no new requests are read, but requests already being handled run to
/// completion before this returns.
pub async fn run<S, F>(pool: Arc<ConnectionPool<S>>, socket: &Path, shutdown: F) -> Result<()>
where
    S: RemoteShell,
    F: Future<Output = ()>,
{
    if socket.exists() {
        std::fs::remove_file(socket)
            .with_context(|| format!("Failed to remove stale socket: {}", socket.display()))?;
    }

    let listener = UnixListener::bind(socket)
        .with_context(|| format!("Failed to listen on {}", socket.display()))?;
    info!("Listening on {}", socket.display());

    let (stop, _) = watch::channel(false);
    let mut clients = JoinSet::new();

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(joined) = clients.join_next(), if !clients.is_empty() => {
                if let Err(e) = joined {
                    warn!("Client task failed: {}", e);
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let pool = Arc::clone(&pool);
                    let stopped = stop.subscribe();
                    clients.spawn(async move {
                        if let Err(e) = serve_client(pool, stream, stopped).await {
                            warn!("Client connection failed: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }
    }

    drop(listener);
    let _ = stop.send(true);
    if !clients.is_empty() {
        info!("Waiting for {} client(s) to finish", clients.len());
    }
    while let Some(joined) = clients.join_next().await {
        if let Err(e) = joined {
            warn!("Client task failed: {}", e);
        }
    }

    if let Err(e) = std::fs::remove_file(socket) {
        debug!("Failed to remove socket {}: {}", socket.display(), e);
    }
    Ok(())
}

async fn serve_client<S: RemoteShell>(
    pool: Arc<ConnectionPool<S>>,
    stream: UnixStream,
    mut stopped: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = stopped.changed() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle(&pool, request).await,
            Err(e) => {
                debug!("Rejecting request {:?}: {}", line, e);
                Response::error("Invalid request format")
            }
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }

    Ok(())
}

pub async fn handle<S: RemoteShell>(pool: &ConnectionPool<S>, request: Request) -> Response {
    match request {
        Request::Open(target) => {
            if !target.is_complete() {
                return Response::error(MISSING_FIELDS);
            }
            let (user, host) = (target.username.as_str(), target.hostname.as_str());

            let mut result = pool.open(user, host).await;
            if matches!(&result, Err(e) if e.is_connect_failure()) {
                info!("Retrying SSH connection for {}@{}", user, host);
                result = pool.open(user, host).await;
            }

            match result {
                Ok(()) => Response::ok(format!("SSH tunnel opened for {}@{}", user, host)),
                Err(e) => {
                    error!("Failed to open SSH tunnel: {}", e);
                    Response::error(format!("Failed to open SSH tunnel: {}", e))
                }
            }
        }

        Request::Close(target) => {
            if !target.is_complete() {
                return Response::error(MISSING_FIELDS);
            }
            pool.close(&target.username, &target.hostname).await;
            Response::ok(format!(
                "SSH tunnel closed for {}@{}",
                target.username, target.hostname
            ))
        }

        Request::Status(target) => {
            if !target.is_complete() {
                return Response::error("Missing username or hostname");
            }
            Response {
                success: true,
                active: Some(pool.is_active(&target.username, &target.hostname).await),
                connection: Some(format!("{}@{}", target.username, target.hostname)),
                ..Default::default()
            }
        }

        Request::List => Response {
            success: true,
            active_tunnels: Some(
                pool.list_active()
                    .await
                    .iter()
                    .map(|key| key.to_string())
                    .collect(),
            ),
            connections: Some(pool.list_details().await),
            ..Default::default()
        },

        Request::Exec(req) => {
            if !req.is_complete() {
                return Response::error(MISSING_FIELDS);
            }

            match pool.execute(&req.username, &req.hostname, &req.command).await {
                Ok(output) => Response {
                    success: true,
                    output: Some(String::from_utf8_lossy(&output).into_owned()),
                    ..Default::default()
                },
                Err(e) => {
                    error!(
                        "Error executing command on {}@{}: {}",
                        req.username, req.hostname, e
                    );
                    Response {
                        success: false,
                        error: Some(format!("Failed to execute command: {}", e)),
                        output: e
                            .output()
                            .map(|out| String::from_utf8_lossy(out).into_owned()),
                        ..Default::default()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::sync::oneshot;

    use super::protocol::{ExecRequest, Request, Target};
    use super::*;
    use crate::pool::PoolSettings;
    use crate::shell::fake::FakeShell;

    fn pool(shell: &FakeShell, dir: &tempfile::TempDir) -> Arc<ConnectionPool<FakeShell>> {
        let settings = PoolSettings {
            control_dir: dir.path().join("ctl"),
            idle_timeout: Duration::from_secs(600),
            check_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
        };
        ConnectionPool::new(shell.clone(), settings).unwrap()
    }

    fn target(user: &str, host: &str) -> Target {
        Target {
            username: user.to_string(),
            hostname: host.to_string(),
        }
    }

    #[tokio::test]
    async fn open_status_list_close() {
        let dir = tempfile::tempdir().unwrap();
        let shell = FakeShell::default();
        let pool = pool(&shell, &dir);

        let res = handle(&pool, Request::Open(target("alice", "h1"))).await;
        assert!(res.success);
        assert_eq!(res.message.as_deref(), Some("SSH tunnel opened for alice@h1"));

        let res = handle(&pool, Request::Status(target("alice", "h1"))).await;
        assert_eq!(res.active, Some(true));
        assert_eq!(res.connection.as_deref(), Some("alice@h1"));

        let res = handle(&pool, Request::List).await;
        assert_eq!(res.active_tunnels, Some(vec!["alice@h1".to_string()]));
        assert_eq!(res.connections.map(|c| c.len()), Some(1));

        let res = handle(&pool, Request::Close(target("alice", "h1"))).await;
        assert!(res.success);

        let res = handle(&pool, Request::Status(target("alice", "h1"))).await;
        assert_eq!(res.active, Some(false));
    }

    #[tokio::test]
    async fn open_retries_once_on_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let shell = FakeShell::default();
        shell.set_fail_connect(true);
        let pool = pool(&shell, &dir);

        let res = handle(&pool, Request::Open(target("alice", "h1"))).await;

        assert!(!res.success);
        assert_eq!(shell.attempts(), 2);
        assert!(res
            .error
            .unwrap()
            .starts_with("Failed to open SSH tunnel: failed to establish SSH connection"));
    }

    #[tokio::test]
    async fn rejects_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let shell = FakeShell::default();
        let pool = pool(&shell, &dir);

        let res = handle(&pool, Request::Open(target("", "h1"))).await;
        assert_eq!(res.error.as_deref(), Some(MISSING_FIELDS));

        let res = handle(
            &pool,
            Request::Exec(ExecRequest {
                username: "alice".to_string(),
                hostname: "h1".to_string(),
                command: String::new(),
            }),
        )
        .await;
        assert_eq!(res.error.as_deref(), Some(MISSING_FIELDS));
        assert_eq!(shell.attempts(), 0);
    }

    #[tokio::test]
    async fn exec_failure_returns_remote_output() {
        let dir = tempfile::tempdir().unwrap();
        let shell = FakeShell::default();
        let pool = pool(&shell, &dir);

        let res = handle(
            &pool,
            Request::Exec(ExecRequest {
                username: "alice".to_string(),
                hostname: "h1".to_string(),
                command: "exit 1".to_string(),
            }),
        )
        .await;

        assert!(!res.success);
        assert_eq!(res.output.as_deref(), Some("partial\nboom\n"));
        assert!(res.error.unwrap().contains("exit status 1"));
    }

    #[tokio::test]
    async fn serves_json_lines_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let shell = FakeShell::default();
        let pool = pool(&shell, &dir);
        let socket = dir.path().join("dockmux.sock");

        let (stop, stopped) = oneshot::channel::<()>();
        let server = {
            let pool = Arc::clone(&pool);
            let socket = socket.clone();
            tokio::spawn(async move {
                run(pool, &socket, async {
                    let _ = stopped.await;
                })
                .await
            })
        };

        let mut stream = loop {
            match UnixStream::connect(&socket).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };

        stream
            .write_all(
                b"{\"op\":\"exec\",\"username\":\"alice\",\"hostname\":\"h1\",\"command\":\"docker ps\"}\nnot json\n",
            )
            .await
            .unwrap();

        let mut lines = BufReader::new(&mut stream).lines();
        let first: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["success"], true);
        assert_eq!(first["output"], "docker ps\n");

        let second: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["success"], false);
        assert_eq!(second["error"], "Invalid request format");

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn shutdown_stops_reading_from_open_clients() {
        let dir = tempfile::tempdir().unwrap();
        let shell = FakeShell::default();
        let pool = pool(&shell, &dir);
        let socket = dir.path().join("dockmux.sock");

        let (stop, stopped) = oneshot::channel::<()>();
        let server = {
            let pool = Arc::clone(&pool);
            let socket = socket.clone();
            tokio::spawn(async move {
                run(pool, &socket, async {
                    let _ = stopped.await;
                })
                .await
            })
        };

        let mut stream = loop {
            match UnixStream::connect(&socket).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        stream.write_all(b"{\"op\":\"list\"}\n").await.unwrap();

        let mut lines = BufReader::new(&mut stream).lines();
        let listed: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(listed["success"], true);

        // The client stays connected; shutdown must not wait on it.
        stop.send(()).unwrap();
        server.await.unwrap().unwrap();

        assert_eq!(lines.next_line().await.unwrap(), None);
        assert_eq!(shell.attempts(), 0);
    }
}
