//! TOML configuration file

use crate::error::{Result, SyncError};
use crate::fs_enum::ExcludeSet;
use crate::logger::{Level, Logger, StderrLogger, TextLogger};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_PORT: u16 = 9031;
const MIB: u64 = 1024 * 1024;
const DEFAULT_BLOCK_MB: u64 = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Local,
    Net,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub log: LogConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub srcpath: PathBuf,
    pub dstpath: PathBuf,
    pub cachefile: PathBuf,
    pub dstcachefile: PathBuf,
    pub excludefrom: Option<PathBuf>,
    pub syncmode: SyncMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub token: String,
    pub compression: bool,
    pub workers: usize,
    /// Transfer block size in MiB
    pub blocksize: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            token: String::new(),
            compression: false,
            workers: 4,
            blocksize: DEFAULT_BLOCK_MB,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub serverip: String,
    pub serverport: u16,
    pub token: String,
    /// 0 = one worker per CPU
    pub threads: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            serverip: "127.0.0.1".to_string(),
            serverport: DEFAULT_PORT,
            token: String::new(),
            threads: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
    pub rotate_bytes: u64,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: Some(PathBuf::from("logs/filesync.log")),
            rotate_bytes: MIB,
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let mut cfg: Config =
            toml::from_str(data).map_err(|e| SyncError::Config(e.to_string()))?;
        cfg.sync.srcpath = clean_root(&cfg.sync.srcpath);
        cfg.sync.dstpath = clean_root(&cfg.sync.dstpath);
        if Level::parse(&cfg.log.level).is_none() {
            return Err(SyncError::Config(format!("unknown log level {:?}", cfg.log.level)));
        }
        Ok(cfg)
    }

    /// Transfer block size in bytes.
    pub fn block_size(&self) -> u64 {
        let mb = if self.server.blocksize == 0 {
            DEFAULT_BLOCK_MB
        } else {
            self.server.blocksize
        };
        mb * MIB
    }

    pub fn client_threads(&self) -> usize {
        if self.client.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.client.threads
        }
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.client.serverip, self.client.serverport)
    }

    /// Exclusion list from `sync.excludefrom`; an unreadable list is logged and ignored.
    pub fn exclude_set(&self, logger: &dyn Logger) -> ExcludeSet {
        match &self.sync.excludefrom {
            Some(p) if !p.as_os_str().is_empty() => match ExcludeSet::load(p) {
                Ok(set) => {
                    log_info!(logger, "loaded {} exclude entries from {}", set.len(), p.display());
                    set
                }
                Err(e) => {
                    log_error!(logger, "read exclude-from file failed: {}", e);
                    ExcludeSet::new()
                }
            },
            _ => ExcludeSet::new(),
        }
    }

    pub fn build_logger(&self) -> Arc<dyn Logger> {
        let level = Level::parse(&self.log.level).unwrap_or(Level::Info);
        if let Some(ref p) = self.log.file {
            if let Ok(l) = TextLogger::new(p, self.log.rotate_bytes, level) {
                return Arc::new(l);
            }
        }
        Arc::new(StderrLogger::new(level))
    }
}

/// Drop trailing separators and `.` components so prefix stripping is exact.
fn clean_root(p: &Path) -> PathBuf {
    p.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}
