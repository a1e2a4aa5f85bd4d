use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::metric;

/// Entry function for the `cleanup` command.
///
/// Removes payload files that have not been written for longer than the
/// configured `entry_expiration`, and prunes directories left empty. The
/// in-memory index does not survive a restart, so this is how disk space
/// held by previous runs is reclaimed; run it while the service is
/// stopped.
///
/// If `dry_run` is `true`, nothing is actually deleted.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let root = &config.cache_dir;
    let max_age = config.caches.entry_expiration;

    tracing::info!(root = %root.display(), "cleaning up cache directory");
    let mut stats = SweepStats::default();
    sweep_directory_recursive(root, max_age, &mut stats, dry_run)
        .with_context(|| format!("failed to sweep {}", root.display()))?;

    tracing::info!(
        files = stats.retained_files,
        bytes = stats.retained_bytes,
        "retained cache files"
    );
    tracing::info!(
        files = stats.removed_files,
        directories = stats.removed_dirs,
        bytes = stats.removed_bytes,
        "removed cache files"
    );

    metric!(gauge("cache.disk.files") = stats.retained_files);
    metric!(gauge("cache.disk.bytes") = stats.retained_bytes);

    Ok(())
}

#[derive(Debug, Default)]
struct SweepStats {
    removed_dirs: u64,
    removed_files: u64,
    removed_bytes: u64,
    retained_files: u64,
    retained_bytes: u64,
}

/// Sweeps `directory`, returning `true` if it ended up empty.
fn sweep_directory_recursive(
    directory: &Path,
    max_age: Duration,
    stats: &mut SweepStats,
    dry_run: bool,
) -> Result<bool> {
    let entries = match catch_not_found(|| read_dir(directory))? {
        Some(entries) => entries,
        None => return Ok(true),
    };
    tracing::debug!(directory = %directory.display(), "sweeping directory");

    let mut is_empty = true;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            let mut dir_is_empty =
                sweep_directory_recursive(&path, max_age, stats, dry_run)?;
            if dir_is_empty && !dry_run {
                if let Err(err) = remove_dir(&path) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to remove cache directory"
                    );
                    dir_is_empty = false;
                }
            }
            if dir_is_empty {
                stats.removed_dirs += 1;
            }
            is_empty &= dir_is_empty;
        } else {
            match sweep_file(&path, max_age, stats, dry_run) {
                Ok(removed) => is_empty &= removed,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to sweep cache file"
                    );
                    is_empty = false;
                }
            }
        }
    }

    Ok(is_empty)
}

/// Removes the file at `path` if it is older than `max_age`; returns
/// `true` if it was removed (or already gone).
fn sweep_file(
    path: &Path,
    max_age: Duration,
    stats: &mut SweepStats,
    dry_run: bool,
) -> Result<bool> {
    let Some(metadata) = catch_not_found(|| path.metadata())? else {
        return Ok(true);
    };
    anyhow::ensure!(metadata.is_file(), "not a regular file");
    let size = metadata.len();

    let expired = metadata
        .modified()?
        .elapsed()
        .map(|age| age > max_age)
        .unwrap_or(true);

    if expired {
        tracing::debug!(path = %path.display(), "removing stale cache file");
        if !dry_run {
            catch_not_found(|| remove_file(path))?;
        }
        stats.removed_files += 1;
        stats.removed_bytes += size;
        return Ok(true);
    }

    stats.retained_files += 1;
    stats.retained_bytes += size;
    Ok(false)
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
