use std::io::Write;

use anyhow::{bail, Context, Result};

use crate::config::DockmuxConfig;
use crate::output;
use crate::pool::ConnectionPool;
use crate::shell::SshShell;

pub async fn run(
    config: DockmuxConfig,
    env: Option<&str>,
    user: Option<&str>,
    host: Option<&str>,
    cmd: &[String],
) -> Result<()> {
    if cmd.is_empty() {
        bail!("No command specified");
    }

    let (user, host) = resolve_target(&config, env, user, host)?;

    let settings = config.pool_settings();
    let shell = SshShell::new(&config.ssh, settings.connect_timeout)?;
    let pool = ConnectionPool::new(shell, settings)?;

    let command = cmd.join(" ");
    let pb = output::create_spinner(&format!("Running on {}@{}...", user, host));
    let result = pool.execute(&user, &host, &command).await;
    pb.finish_and_clear();

    pool.shutdown().await;

    match result {
        Ok(out) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&out)?;
            stdout.flush()?;
            Ok(())
        }
        Err(e) => {
            if let Some(out) = e.output() {
                let mut stderr = std::io::stderr().lock();
                stderr.write_all(out)?;
                stderr.flush()?;
            }
            Err(e).context(format!("Command failed on {}@{}", user, host))
        }
    }
}

/// Pick the target from `--user/--host`, `--env`, or the configured default, in that order.
fn resolve_target(
    config: &DockmuxConfig,
    env: Option<&str>,
    user: Option<&str>,
    host: Option<&str>,
) -> Result<(String, String)> {
    if let (Some(user), Some(host)) = (user, host) {
        return Ok((user.to_string(), host.to_string()));
    }

    let env = match env {
        Some(name) => config.environment(name)?,
        None => config.default_environment()?,
    };
    Ok((env.user.clone(), env.host.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    fn config() -> DockmuxConfig {
        DockmuxConfig {
            default_environment: Some("prod".to_string()),
            environments: vec![
                Environment {
                    name: "prod".to_string(),
                    user: "deploy".to_string(),
                    host: "10.0.0.5".to_string(),
                },
                Environment {
                    name: "staging".to_string(),
                    user: "ubuntu".to_string(),
                    host: "staging.internal".to_string(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn explicit_target_wins() {
        let target = resolve_target(&config(), None, Some("root"), Some("h9")).unwrap();
        assert_eq!(target, ("root".to_string(), "h9".to_string()));
    }

    #[test]
    fn named_environment_then_default() {
        let config = config();
        let staging = resolve_target(&config, Some("staging"), None, None).unwrap();
        assert_eq!(staging.1, "staging.internal");

        let default = resolve_target(&config, None, None, None).unwrap();
        assert_eq!(default, ("deploy".to_string(), "10.0.0.5".to_string()));
    }

    #[test]
    fn unknown_environment_is_an_error() {
        assert!(resolve_target(&config(), Some("dev"), None, None).is_err());
        assert!(resolve_target(&DockmuxConfig::default(), None, None, None).is_err());
    }
}
