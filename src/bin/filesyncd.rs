use anyhow::{Context, Result};
use clap::Parser;

use filesync::cli::{ConfigOpts, DaemonOpts};
use filesync::config::Config;
use filesync::net::server::{self, ServerSettings};

#[derive(Parser, Debug)]
#[command(author, version, about = "filesync daemon")]
struct Opts {
    #[command(flatten)]
    config: ConfigOpts,

    #[command(flatten)]
    daemon: DaemonOpts,
}

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nfilesyncd interrupted. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = Opts::parse();
    let cfg = Config::load(&opts.config.config)
        .with_context(|| format!("load config {}", opts.config.config.display()))?;
    if cfg.server.token.is_empty() {
        eprintln!("WARNING: server.token is empty; any client sending an empty token is accepted");
    }

    let logger = cfg.build_logger();
    let bind = opts.daemon.bind_addr(cfg.server.port);
    let settings = ServerSettings::from_config(&cfg, logger.as_ref());

    println!("Starting filesync daemon:");
    println!("  Bind: {}", bind);
    println!("  Block size: {} bytes", settings.block_size);
    println!("  Excludes: {}", settings.exclude.len());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(server::serve(&bind, settings, logger))
        .with_context(|| format!("serve {}", bind))
}
