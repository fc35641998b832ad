//! Durable JSON snapshot caches (source tree and destination tree)

use crate::error::{Result, SyncError};
use crate::logger::Logger;
use crate::snapshot::Snapshot;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One cache file on disk. Keys are stored forward-slash normalized.
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CacheStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the cache file wholesale.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
        }
        // Write beside the target then rename over it
        let temp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&temp_path).map_err(|e| SyncError::fs(&temp_path, e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &snapshot.to_wire())
                .map_err(|e| SyncError::fs(&temp_path, e.into()))?;
            writer.flush().map_err(|e| SyncError::fs(&temp_path, e))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| SyncError::fs(&self.path, e))?;
        Ok(())
    }

    /// Load the cache with keys converted to native form.
    pub fn load(&self) -> Result<Snapshot> {
        let file = File::open(&self.path).map_err(|e| SyncError::fs(&self.path, e))?;
        let reader = BufReader::new(file);
        let snapshot: Snapshot = serde_json::from_reader(reader)
            .map_err(|e| SyncError::fs(&self.path, e.into()))?;
        Ok(snapshot.to_native())
    }

    /// Load, or log and fall back to an empty snapshot.
    pub fn load_or_empty(&self, logger: &dyn Logger) -> Snapshot {
        match self.load() {
            Ok(s) => s,
            Err(e) => {
                log_warn!(logger, "load cache {} failed: {}", self.path.display(), e);
                Snapshot::new()
            }
        }
    }
}
