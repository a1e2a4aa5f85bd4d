//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use vxcache_service::caching;
use vxcache_service::config::Config;
use vxcache_service::metrics;

use crate::logging;

/// vxcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Remove stale payload files from the cache directory.
    ///
    /// The cache index lives in memory, so files from previous runs are
    /// unreachable; this reclaims them. Run it while the service is
    /// stopped.
    Cleanup {
        /// Report what would be removed without deleting anything.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: no other threads are running this early in startup.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        );
    }

    match cli.command {
        Command::Cleanup { dry_run } => caching::cleanup(&config, dry_run)
            .context("failed to clean up the cache directory")?,
    }

    Ok(())
}
