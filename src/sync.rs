//! Sync driver: build the source cache, compare, transfer, persist the destination cache

use crate::cache::CacheStore;
use crate::config::Config;
use crate::error::Result;
use crate::fs_enum::walk_tree;
use crate::logger::Logger;
use crate::oper::{SyncOper, SyncReport};
use crate::snapshot::Snapshot;
use indicatif::ProgressBar;
use std::time::Instant;
use uuid::Uuid;

/// Walk the source root and write the source cache file.
pub fn make_src_cache(cfg: &Config, logger: &dyn Logger) -> Result<Snapshot> {
    let started = Instant::now();
    let exclude = cfg.exclude_set(logger);
    let snapshot = walk_tree(&cfg.sync.srcpath, &exclude, logger);
    CacheStore::new(&cfg.sync.cachefile).save(&snapshot)?;
    log_info!(
        logger,
        "make src cache: {} entries from {} in {:.3}s",
        snapshot.len(),
        cfg.sync.srcpath.display(),
        started.elapsed().as_secs_f64()
    );
    Ok(snapshot)
}

pub async fn compare(oper: &mut dyn SyncOper, logger: &dyn Logger) -> Result<Snapshot> {
    let diff = oper.compare_diff_files().await?;
    log_info!(logger, "compare: {} entries differ", diff.len());
    Ok(diff)
}

/// Compare, transfer, then save the destination cache with the synced entries
/// merged over the previous destination snapshot.
pub async fn do_sync(
    oper: &mut dyn SyncOper,
    dst_cache: &CacheStore,
    progress: Option<&ProgressBar>,
    logger: &dyn Logger,
) -> Result<SyncReport> {
    let batch = Uuid::new_v4();
    let started = Instant::now();
    log_info!(logger, "batch {} start", batch);

    let diff = compare(oper, logger).await?;
    if let Some(pb) = progress {
        pb.set_length(diff.len() as u64);
    }
    let report = oper.sync_files(&diff, progress).await;

    let mut dst = oper.dst_snapshot();
    dst.merge_normalized(report.synced.clone());
    dst_cache.save(&dst)?;

    for path in &report.failed {
        log_warn!(logger, "batch {} failed: {}", batch, path);
    }
    log_info!(
        logger,
        "batch {} saved {} entries to {}",
        batch,
        dst.len(),
        dst_cache.path().display()
    );
    logger.done(
        report.synced.len() as u64,
        report.failed.len() as u64,
        started.elapsed().as_secs_f64(),
    );
    Ok(report)
}
