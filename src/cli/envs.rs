use anyhow::Result;

use crate::config::DockmuxConfig;
use crate::output;

pub fn run(config: &DockmuxConfig) -> Result<()> {
    output::header("Environments");

    if config.environments.is_empty() {
        output::info("No environments configured");
        return Ok(());
    }

    for env in &config.environments {
        let marker = if config.default_environment.as_deref() == Some(env.name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {:<16} {}@{}{}", env.name, env.user, env.host, marker);
    }

    Ok(())
}
