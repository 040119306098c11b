use clap::{Parser, Subcommand};

use dr_domain::config::{Config, ConfigSeverity};

/// drover worker — drives chat-service sessions for its identities.
#[derive(Debug, Parser)]
#[command(name = "drover-worker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the worker (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the environment configuration and exit.
    Validate,
    /// Print the effective configuration as JSON.
    Show,
}

/// Validate and report; returns `false` when any error was found.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => eprintln!("warning: {issue}"),
            ConfigSeverity::Error => eprintln!("error: {issue}"),
        }
    }
    let errors = issues.iter().filter(|i| i.is_error()).count();
    if errors == 0 {
        eprintln!("configuration OK ({} warning(s))", issues.len());
        true
    } else {
        eprintln!("configuration invalid: {errors} error(s)");
        false
    }
}

pub fn show(config: &Config) {
    match serde_json::to_string_pretty(config) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("cannot render config: {e}"),
    }
}
