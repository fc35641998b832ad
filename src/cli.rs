//! Shared CLI helpers and small reusable Clap fragments

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_FILE;

/// Config file location shared by both binaries
#[derive(Clone, Debug, Parser)]
pub struct ConfigOpts {
    /// Path to the TOML config file
    #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

/// Daemon options used by filesyncd and `filesync daemon`
#[derive(Clone, Debug, Parser)]
pub struct DaemonOpts {
    /// Override `server.port` from the config file
    #[arg(long)]
    pub port: Option<u16>,

    /// Bind host
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
}

impl DaemonOpts {
    pub fn bind_addr(&self, config_port: u16) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(config_port))
    }
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Walk the source root and write the source cache file
    Makecache,
    /// Report entries that are new or stale at the destination
    Compare {
        /// Print each differing path
        #[arg(long)]
        list: bool,
    },
    /// Compare, transfer, and save the destination cache
    Sync,
    /// Run the sync server
    Daemon(DaemonOpts),
}
