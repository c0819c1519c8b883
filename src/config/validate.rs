use std::collections::HashSet;

use anyhow::{bail, Result};

use super::DockmuxConfig;

pub fn validate(config: &DockmuxConfig) -> Result<()> {
    let pool = &config.pool;
    for (name, value) in [
        ("idle_timeout", pool.idle_timeout),
        ("check_interval", pool.check_interval),
        ("connect_timeout", pool.connect_timeout),
        ("probe_timeout", pool.probe_timeout),
        ("command_timeout", pool.command_timeout),
        ("close_timeout", pool.close_timeout),
    ] {
        if value == 0 {
            bail!("pool.{} must be greater than zero", name);
        }
    }

    // A command running past the idle timeout would look idle to the reaper.
    if pool.command_timeout >= pool.idle_timeout {
        bail!(
            "pool.command_timeout ({}s) must be shorter than pool.idle_timeout ({}s)",
            pool.command_timeout,
            pool.idle_timeout
        );
    }

    if config.ssh.program.is_empty() {
        bail!("ssh.program cannot be empty");
    }

    if config.ssh.server_alive_count_max == 0 {
        bail!("ssh.server_alive_count_max must be greater than zero");
    }

    let mut seen = HashSet::new();
    for env in &config.environments {
        if env.name.is_empty() {
            bail!("Environment with host '{}' has an empty name", env.host);
        }
        if !seen.insert(env.name.as_str()) {
            bail!("Environment '{}' is defined more than once", env.name);
        }
        if env.user.is_empty() {
            bail!("Environment '{}' has no user defined", env.name);
        }
        if env.host.is_empty() {
            bail!("Environment '{}' has no host defined", env.name);
        }
    }

    if let Some(name) = &config.default_environment {
        if !seen.contains(name.as_str()) {
            bail!(
                "default_environment '{}' does not match any configured environment",
                name
            );
        }
    }

    Ok(())
}
