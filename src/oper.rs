//! Sync operator: compare then transfer, over the local filesystem or the network

use crate::cache::CacheStore;
use crate::config::{Config, SyncMode};
use crate::copy::OsSyncOper;
use crate::error::Result;
use crate::logger::Logger;
use crate::net::client::{ClientSettings, SyncClient};
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use indicatif::ProgressBar;
use std::sync::Arc;

/// Outcome of one transfer batch.
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    pub synced: Snapshot,
    pub failed: Vec<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[async_trait]
pub trait SyncOper: Send {
    /// Entries that are new or stale at the destination.
    async fn compare_diff_files(&mut self) -> Result<Snapshot>;

    /// Apply a diff. Per-entry failures are reported, never raised.
    async fn sync_files(&mut self, diff: &Snapshot, progress: Option<&ProgressBar>) -> SyncReport;

    /// Destination snapshot as last loaded or updated by this operator.
    fn dst_snapshot(&self) -> Snapshot;
}

#[async_trait]
impl SyncOper for SyncClient {
    async fn compare_diff_files(&mut self) -> Result<Snapshot> {
        SyncClient::compare_diff_files(self).await
    }

    async fn sync_files(&mut self, diff: &Snapshot, progress: Option<&ProgressBar>) -> SyncReport {
        SyncClient::sync_files(self, diff, progress).await
    }

    fn dst_snapshot(&self) -> Snapshot {
        SyncClient::dst_snapshot(self).clone()
    }
}

pub fn make_sync_oper(cfg: &Config, logger: Arc<dyn Logger>) -> Box<dyn SyncOper> {
    match cfg.sync.syncmode {
        SyncMode::Local => Box::new(OsSyncOper::new(
            cfg.sync.srcpath.clone(),
            cfg.sync.dstpath.clone(),
            CacheStore::new(&cfg.sync.cachefile),
            CacheStore::new(&cfg.sync.dstcachefile),
            logger,
        )),
        SyncMode::Net => Box::new(SyncClient::new(ClientSettings::from_config(cfg), logger)),
    }
}
