//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use pv_domain::config::{Config, ConfigSeverity};

#[derive(Parser)]
#[command(name = "palaver", about = "LLM agent turn-execution engine", version)]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "palaver.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway (default).
    Serve,
    /// Config inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective config.
    Show,
}

pub fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
    }
    Ok(Config::load(path)?)
}

/// Print validation issues; returns whether the config is usable.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("config ok");
        return true;
    }
    let mut valid = true;
    for issue in issues {
        match issue.severity {
            ConfigSeverity::Warning => println!("warning: {issue}"),
            ConfigSeverity::Error => {
                println!("error: {issue}");
                valid = false;
            }
        }
    }
    valid
}

pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => println!("failed to render config: {e}"),
    }
}
