//! xixi-cache: runs a cache manager with its expiration ticker until
//! interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use xixibase::config::DEFAULT_CONFIG;
use xixibase::manager::CacheManagerBuilder;
use xixibase::stats::GroupStats;
use xixibase::{logging, signal, CacheManager, Config, Ticker};

#[derive(Parser)]
#[command(name = "xixi-cache")]
#[command(about = "In-memory cache core with watches")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print!("{DEFAULT_CONFIG}");
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let shutdown = match signal::install_signal_handler() {
        Ok(flag) => flag,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handler");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config, shutdown) {
        tracing::error!(error = %e, "cache error");
        std::process::exit(1);
    }
}

fn run(config: Config, shutdown: Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    let manager: Arc<CacheManager> = Arc::new(
        CacheManagerBuilder::from_config(&config.cache)
            .stats(Arc::new(GroupStats::new()))
            .build(),
    );

    let interval = Duration::from_millis(config.maintenance.interval_ms);
    let ticker = Ticker::spawn(manager.clone(), interval)?;
    tracing::info!(
        memory_limit = manager.memory_limit(),
        classes = manager.class_count(),
        "xixi-cache running"
    );

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    ticker.shutdown();
    tracing::info!(
        items = manager.item_count(),
        memory_used = manager.memory_used(),
        pooled = manager.pooled_bytes(),
        "xixi-cache stopped"
    );
    Ok(())
}
