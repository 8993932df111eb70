//! Resolved configuration dump.

use crate::error::CliResult;
use colored::Colorize;
use sessionstore_dynamodb::{ConfigLayer, SessionConfig};

/// Resolve and print the configuration.
pub fn run(runtime: ConfigLayer) -> CliResult<()> {
    let config = SessionConfig::resolve(runtime)?;

    println!("{}", "Session store configuration".bright_cyan().bold());
    println!("{:#?}", config);
    if config.secret_key.is_none() {
        println!(
            "\n{} no secret_key set; session ids can be neither issued nor verified",
            "warning:".yellow().bold()
        );
    }
    Ok(())
}
