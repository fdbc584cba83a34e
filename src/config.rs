//! Command-line configuration for the gateway binary
//!
//! Everything about providers and tuning lives in the providers file; the flags here only say
//! where to listen and where that file is.
use anyhow::anyhow;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the gateway will listen.
    #[arg(short = 'p', long, env = "SWITCHYARD_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, env = "SWITCHYARD_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, action = ArgAction::Set, default_value_t = true)]
    pub metrics: bool,

    /// The file from which to read providers, auth keys and tuning.
    #[arg(short = 'f', long, env = "SWITCHYARD_PROVIDERS")]
    pub providers: PathBuf,

    /// Whether we should continue watching the providers file for changes
    #[arg(short = 'w', long, action = ArgAction::Set, default_value_t = true)]
    pub watch: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "switchyard")]
    pub metrics_prefix: String,

    /// How long (in seconds) background tasks get to finish once shutdown starts.
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.providers.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.providers.display()
            ));
        }
        Ok(self)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
