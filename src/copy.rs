//! Local-filesystem sync operator
//! Parallel copy with rayon; the destination snapshot is updated under a lock

use crate::cache::CacheStore;
use crate::diff;
use crate::error::{Result, SyncError};
use crate::logger::Logger;
use crate::oper::{SyncOper, SyncReport};
use crate::snapshot::{FileEntry, Snapshot};
use async_trait::async_trait;
use filetime::{set_file_mtime, FileTime};
use indicatif::ProgressBar;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const COPY_BUF: usize = 1024 * 1024;

/// Copy a single file's contents; returns bytes written.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
    }

    let mut reader =
        BufReader::with_capacity(COPY_BUF, File::open(src).map_err(|e| SyncError::fs(src, e))?);
    let mut writer =
        BufWriter::with_capacity(COPY_BUF, File::create(dst).map_err(|e| SyncError::fs(dst, e))?);

    let mut buffer = vec![0u8; COPY_BUF];
    let mut total_bytes = 0u64;
    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| SyncError::fs(src, e))?;
        if bytes_read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| SyncError::fs(dst, e))?;
        total_bytes += bytes_read as u64;
    }
    writer.flush().map_err(|e| SyncError::fs(dst, e))?;
    Ok(total_bytes)
}

#[cfg(unix)]
fn apply_mode(path: &Path, perm: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(perm)).map_err(|e| SyncError::fs(path, e))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _perm: u32) -> Result<()> {
    Ok(())
}

fn apply_attrs(dst: &Path, entry: &FileEntry) -> Result<()> {
    apply_mode(dst, entry.permissions())?;
    let ft = FileTime::from_unix_time(entry.mod_time.timestamp(), entry.mod_time.timestamp_subsec_nanos());
    set_file_mtime(dst, ft).map_err(|e| SyncError::fs(dst, e))
}

/// Materialize one entry under `dst_root`.
///
/// Files are copied and get their mode and mtime. Directories are only
/// created; their attributes go on later through [`finish_dir`], once nothing
/// else will be written inside them.
pub fn sync_entry(src_root: &Path, dst_root: &Path, rel: &str, entry: &FileEntry, logger: &dyn Logger) -> Result<()> {
    let src = src_root.join(rel);
    let dst = dst_root.join(rel);

    if entry.is_dir {
        return fs::create_dir_all(&dst).map_err(|e| SyncError::fs(&dst, e));
    }
    let bytes = copy_file(&src, &dst)?;
    logger.copy_done(&src, &dst, bytes);
    apply_attrs(&dst, entry)
}

/// Apply a directory entry's mode and mtime.
pub fn finish_dir(dst_root: &Path, rel: &str, entry: &FileEntry) -> Result<()> {
    apply_attrs(&dst_root.join(rel), entry)
}

pub struct OsSyncOper {
    src_root: PathBuf,
    dst_root: PathBuf,
    src_cache: CacheStore,
    dst_cache: CacheStore,
    dst: Arc<Mutex<Snapshot>>,
    logger: Arc<dyn Logger>,
}

impl OsSyncOper {
    pub fn new(
        src_root: PathBuf,
        dst_root: PathBuf,
        src_cache: CacheStore,
        dst_cache: CacheStore,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            src_root,
            dst_root,
            src_cache,
            dst_cache,
            dst: Arc::new(Mutex::new(Snapshot::new())),
            logger,
        }
    }
}

#[async_trait]
impl SyncOper for OsSyncOper {
    async fn compare_diff_files(&mut self) -> Result<Snapshot> {
        let src = self.src_cache.load()?;
        let dst = self.dst_cache.load_or_empty(self.logger.as_ref());
        let diff = diff::compare_logged(&src, &dst, self.logger.as_ref());
        *self.dst.lock() = dst;
        Ok(diff)
    }

    async fn sync_files(&mut self, diff: &Snapshot, progress: Option<&ProgressBar>) -> SyncReport {
        let pairs: Vec<(String, FileEntry)> =
            diff.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let src_root = self.src_root.clone();
        let dst_root = self.dst_root.clone();
        let dst = Arc::clone(&self.dst);
        let logger = Arc::clone(&self.logger);
        let pb = progress.cloned();

        let task = tokio::task::spawn_blocking(move || {
            let report = Mutex::new(SyncReport::default());
            let record = |rel: &String, entry: &FileEntry, result: Result<()>| {
                match result {
                    Ok(()) => {
                        dst.lock().insert(rel.clone(), entry.clone());
                        report.lock().synced.insert(rel.clone(), entry.clone());
                    }
                    Err(e) => {
                        log_error!(logger, "sync {} failed: {}", rel, e);
                        report.lock().failed.push(rel.clone());
                    }
                }
                if let Some(ref pb) = pb {
                    pb.inc(1);
                }
            };

            // Create dirs, copy files, then set dir attributes so neither a
            // read-only mode nor the copies' own mtime bumps get in the way
            let (dirs, files): (Vec<_>, Vec<_>) = pairs.into_iter().partition(|(_, e)| e.is_dir);
            let created: Vec<&(String, FileEntry)> = dirs
                .par_iter()
                .filter(|(rel, entry)| match sync_entry(&src_root, &dst_root, rel, entry, logger.as_ref()) {
                    Ok(()) => true,
                    Err(e) => {
                        record(rel, entry, Err(e));
                        false
                    }
                })
                .collect();
            files.par_iter().for_each(|(rel, entry)| {
                record(rel, entry, sync_entry(&src_root, &dst_root, rel, entry, logger.as_ref()));
            });
            created.par_iter().for_each(|(rel, entry)| {
                record(rel, entry, finish_dir(&dst_root, rel, entry));
            });
            report.into_inner()
        });

        match task.await {
            Ok(report) => report,
            Err(e) => {
                log_error!(self.logger, "local copy task failed: {}", e);
                SyncReport {
                    synced: Snapshot::new(),
                    failed: diff.paths().cloned().collect(),
                }
            }
        }
    }

    fn dst_snapshot(&self) -> Snapshot {
        self.dst.lock().clone()
    }
}
