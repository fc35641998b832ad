//! filesync - metadata-cached directory sync, local or over the network
//!
//! Subcommands:
//! - `makecache` walks the source root into the source cache file
//! - `compare` reports new or stale entries
//! - `sync` transfers them and saves the destination cache
//! - `daemon` runs the receiving server

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;

use filesync::cache::CacheStore;
use filesync::cli::{Command, ConfigOpts};
use filesync::config::Config;
use filesync::logger::Logger;
use filesync::net::server::{self, ServerSettings};
use filesync::oper::make_sync_oper;
use filesync::sync;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "filesync - cached-metadata directory sync (local or network)")]
struct Args {
    #[command(flatten)]
    config: ConfigOpts,

    #[command(subcommand)]
    command: Command,
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let args = Args::parse();
    let cfg = Config::load(&args.config.config)
        .with_context(|| format!("load config {}", args.config.config.display()))?;
    let logger: Arc<dyn Logger> = cfg.build_logger();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match args.command {
        Command::Makecache => {
            let snap = sync::make_src_cache(&cfg, logger.as_ref())
                .context("make source cache")?;
            println!("{} entries written to {}", snap.len(), cfg.sync.cachefile.display());
        }
        Command::Compare { list } => {
            let mut oper = make_sync_oper(&cfg, Arc::clone(&logger));
            let diff = rt
                .block_on(sync::compare(oper.as_mut(), logger.as_ref()))
                .context("compare")?;
            if list {
                for path in diff.paths() {
                    println!("{}", path);
                }
            }
            println!("{} entries differ", diff.len());
        }
        Command::Sync => {
            let mut oper = make_sync_oper(&cfg, Arc::clone(&logger));
            let dst_cache = CacheStore::new(&cfg.sync.dstcachefile);
            let pb = progress_bar();
            let report = rt
                .block_on(sync::do_sync(oper.as_mut(), &dst_cache, Some(&pb), logger.as_ref()))
                .context("sync")?;
            pb.finish_and_clear();
            println!(
                "synced {} entries, {} failed",
                report.synced.len(),
                report.failed.len()
            );
            if !report.is_clean() {
                for path in &report.failed {
                    eprintln!("failed: {}", path);
                }
                std::process::exit(1);
            }
        }
        Command::Daemon(opts) => {
            let bind = opts.bind_addr(cfg.server.port);
            let settings = ServerSettings::from_config(&cfg, logger.as_ref());
            rt.block_on(server::serve(&bind, settings, logger))
                .with_context(|| format!("serve {}", bind))?;
        }
    }
    Ok(())
}
