use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

/// CLI flags: only the handful of knobs worth overriding without editing the
/// config file (§10.4). Everything else lives in the TOML file.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "SMTP relay spool and delivery daemon")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/relay/relay.toml")]
    pub config: PathBuf,

    #[arg(long)]
    pub spool_root: Option<PathBuf>,

    #[arg(long)]
    pub max_concurrent_send_jobs: Option<usize>,

    #[arg(long)]
    pub give_up_secs: Option<u64>,

    #[arg(long)]
    pub log_level: Option<String>,
}

fn default_max_concurrent_send_jobs() -> usize {
    64
}

fn default_max_uses_per_connection() -> u32 {
    100
}

fn default_tick_cadence_secs() -> u64 {
    10
}

fn default_give_up_secs() -> u64 {
    60
}

fn default_ehlo_name() -> String {
    "localhost".to_owned()
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/relay/control.sock")
}

fn default_log_level() -> String {
    "info".to_owned()
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub spool_root: PathBuf,

    #[serde(default = "default_max_concurrent_send_jobs")]
    pub max_concurrent_send_jobs: usize,

    #[serde(default = "default_max_uses_per_connection")]
    pub max_uses_per_connection: u32,

    #[serde(default = "default_tick_cadence_secs")]
    pub tick_cadence_secs: u64,

    #[serde(default = "default_give_up_secs")]
    pub give_up_secs: u64,

    #[serde(default = "default_ehlo_name")]
    pub ehlo_name: String,

    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Config> {
        use anyhow::Context;

        let contents = std::fs::read_to_string(&cli.config)
            .with_context(|| format!("reading config file at {}", cli.config.display()))?;
        let mut config: Config =
            toml::from_str(&contents).with_context(|| format!("parsing config file at {}", cli.config.display()))?;

        if let Some(root) = &cli.spool_root {
            config.spool_root = root.clone();
        }
        if let Some(n) = cli.max_concurrent_send_jobs {
            config.max_concurrent_send_jobs = n;
        }
        if let Some(level) = &cli.log_level {
            config.log_level = level.clone();
        }
        if let Some(secs) = cli.give_up_secs {
            config.give_up_secs = secs;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let config: Config = toml::from_str(r#"spool_root = "/var/spool/relay""#).unwrap();
        assert_eq!(config.max_concurrent_send_jobs, 64);
        assert_eq!(config.tick_cadence_secs, 10);
        assert_eq!(config.give_up_secs, 60);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            spool_root = "/var/spool/relay"
            max_concurrent_send_jobs = 8
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_send_jobs, 8);
        assert_eq!(config.log_level, "debug");
    }
}
