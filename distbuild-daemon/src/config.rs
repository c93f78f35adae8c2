//! Controller configuration: CLI flags, plus an optional TOML file for
//! the worker address list. There is no persisted runtime state to speak
//! of (`spec.md` §1 Non-goals), so a flags-plus-file layer is enough —
//! no need for the heavier config frameworks the rest of the ecosystem
//! reaches for when a service has durable state to reconcile.

use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "distbuildd")]
pub struct Args {
    /// Address to accept initiator connections on.
    #[arg(long, default_value = "0.0.0.0:3434")]
    pub initiator_listen: String,

    /// Address to accept helper connections on.
    #[arg(long, default_value = "0.0.0.0:3435")]
    pub helper_listen: String,

    /// Read-only artifact cache server base URL.
    #[arg(long)]
    pub cache_server: String,

    /// Writeable artifact cache server base URL (receives `/1.0/fetch`).
    #[arg(long)]
    pub writeable_cache_server: String,

    /// Optional TOML file listing outbound worker addresses.
    #[arg(long)]
    pub config: Option<String>,

    /// Seconds between reconnect attempts for outbound worker addresses.
    #[arg(long, default_value_t = 1)]
    pub reconnect_interval_secs: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub workers: Vec<String>,
}

impl Args {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn load_file_config(&self) -> anyhow::Result<FileConfig> {
        match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&text)?)
            }
            None => Ok(FileConfig::default()),
        }
    }
}
