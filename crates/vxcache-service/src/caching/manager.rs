use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::Config;
use crate::metric;

use super::counter::Counter;
use super::entry::{CacheEntry, EntryOptions, EvictionRank, OpenEntryError};
use super::error::{CacheError, CacheResult};
use super::key::CacheKey;
use super::lock_pool::LockPool;
use super::stream::{EntryReader, EntryWriter};

/// How many children a cache subdirectory may accumulate; new paths are
/// sharded `seq / 256` / `seq % 256` to stay under it.
const DIR_SHARD: u64 = 256;

/// File extension for cache payloads.
const ENTRY_EXT: &str = "sbc";

const MIB: u64 = 1024 * 1024;

/// Open mode for [`CacheManager::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing entry for reading.
    Read,
    /// Create the entry (or truncate an existing one) and open it for
    /// writing.
    Write,
    /// Atomically open an existing entry for reading, or create it and
    /// open it for writing when absent.
    ReadOrCreate,
}

/// Successful outcome of [`CacheManager::open`].
#[derive(Debug)]
pub enum Opened {
    /// An existing entry, opened for reading.
    Read(EntryReader),
    /// An entry opened for writing.
    Write(EntryWriter),
    /// `ReadOrCreate` found nothing under the key and created the entry;
    /// the writer fills it in.
    Created(EntryWriter),
}

/// Key→entry table plus the recency ordering, guarded by one lock.
///
/// Lookups run under the shared side; inserts, removals and recency
/// touches take the exclusive side. The lock is only ever held for the
/// table operation itself, never across file I/O or an entry lock
/// acquisition.
#[derive(Debug, Default)]
struct CacheIndex {
    entries: FxHashMap<CacheKey, Arc<CacheEntry>>,
    /// Recency ordering, keyed by ticks of the touch clock: iteration runs
    /// from least to most recently used.
    recency: BTreeMap<u64, CacheKey>,
}

impl CacheIndex {
    fn insert(&mut self, entry: Arc<CacheEntry>, slot: u64) {
        entry.set_lru_slot(slot);
        self.recency.insert(slot, entry.key().clone());
        self.entries.insert(entry.key().clone(), entry);
    }

    /// Removes `entry` if it is still the live generation under its key.
    fn remove(&mut self, entry: &Arc<CacheEntry>) -> bool {
        match self.entries.get(entry.key()) {
            Some(live) if Arc::ptr_eq(live, entry) => {
                self.recency.remove(&entry.lru_slot());
                self.entries.remove(entry.key());
                true
            }
            _ => false,
        }
    }

    /// Moves `entry` to the most-recent end of the ordering.
    fn touch(&mut self, entry: &Arc<CacheEntry>, slot: u64) {
        match self.entries.get(entry.key()) {
            Some(live) if Arc::ptr_eq(live, entry) => {
                self.recency.remove(&entry.lru_slot());
                entry.set_lru_slot(slot);
                self.recency.insert(slot, entry.key().clone());
            }
            _ => {}
        }
    }
}

#[derive(Debug)]
struct ManagerInner {
    root: PathBuf,
    max_total_size: u64,
    max_entry_size: u64,
    low_water: u64,
    entry_expiration: Duration,
    index: RwLock<CacheIndex>,
    /// Approximate sum of all committed payload sizes plus in-flight
    /// written bytes. Updated independently of the table lock.
    total_size: Counter,
    path_sequence: Counter,
    touch_clock: AtomicU64,
    locks: LockPool,
    over_budget_warned: AtomicBool,
}

/// The cache service.
///
/// Owns the key→entry table, the recency ordering, the global byte budget
/// and the lock pool. Cheap to clone; all clones share the same state. See
/// the [module docs](super) for the full locking and lifecycle story.
#[derive(Debug, Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    /// Creates the manager over `config`, validating the size parameters
    /// and creating the cache root directory.
    ///
    /// The index always starts empty: payload files carry no metadata and
    /// no index is persisted, so files left behind by a previous process
    /// are invisible here. `vxcache cleanup` reclaims them.
    pub fn new(config: &Config) -> CacheResult<Self> {
        let params = &config.caches;
        let max_total_size = params.max_size_mb * MIB;
        let max_entry_size = params.max_entry_size_mb * MIB;
        let low_water = params.low_water_mb * MIB;

        if max_entry_size > max_total_size {
            return Err(CacheError::InvalidArgument(format!(
                "max_entry_size_mb ({}) exceeds max_size_mb ({})",
                params.max_entry_size_mb, params.max_size_mb
            )));
        }
        if low_water > max_total_size {
            return Err(CacheError::InvalidArgument(format!(
                "low_water_mb ({}) exceeds max_size_mb ({})",
                params.low_water_mb, params.max_size_mb
            )));
        }
        if params.entry_expiration.is_zero() {
            return Err(CacheError::InvalidArgument(
                "entry_expiration must be positive".into(),
            ));
        }

        fs::create_dir_all(&config.cache_dir)?;

        Ok(CacheManager {
            inner: Arc::new(ManagerInner {
                root: config.cache_dir.clone(),
                max_total_size,
                max_entry_size,
                low_water,
                entry_expiration: params.entry_expiration,
                index: RwLock::new(CacheIndex::default()),
                total_size: Counter::new(),
                path_sequence: Counter::new(),
                touch_clock: AtomicU64::new(0),
                locks: LockPool::default(),
                over_budget_warned: AtomicBool::new(false),
            }),
        })
    }

    /// Opens `key` in the given mode.
    ///
    /// The lookup runs under the shared table lock; creation re-checks
    /// under the exclusive lock so two racing creators cannot both insert
    /// an entry for the same key. An opener that loses against an
    /// in-flight writer (the entry gets invalidated under it) restarts
    /// from the table — the writer resolves by committing or discarding,
    /// so the retry terminates.
    ///
    /// Entries whose last write is older than the configured expiration
    /// are treated as absent and dropped. After every successful open the
    /// entry moves to the recent end of the LRU order and the byte budget
    /// is re-checked.
    pub fn open(
        &self,
        module: &str,
        key: impl AsRef<[u8]>,
        mode: OpenMode,
        options: EntryOptions,
    ) -> CacheResult<Opened> {
        let key = CacheKey::normalize(key);
        metric!(counter("cache.open") += 1, "module" => module);

        loop {
            let existing = self.lookup_live(&key);

            match (mode, existing) {
                (OpenMode::Read, None) => return Err(CacheError::NotFound),
                (OpenMode::Read | OpenMode::ReadOrCreate, Some(entry)) => {
                    match self.open_reader(entry) {
                        Ok(reader) => return Ok(Opened::Read(reader)),
                        Err(OpenEntryError::Stale) => continue,
                        Err(OpenEntryError::Vanished) => continue,
                        Err(OpenEntryError::Error(err)) => return Err(err),
                    }
                }
                (OpenMode::Write, existing) => {
                    let entry = match existing {
                        Some(entry) => entry,
                        None => match self.create_entry(module, &key) {
                            Some(entry) => entry,
                            // Lost the creation race; retry against the
                            // winner's entry.
                            None => continue,
                        },
                    };
                    match self.open_writer(module, entry, options) {
                        Ok(writer) => return Ok(Opened::Write(writer)),
                        Err(OpenEntryError::Stale | OpenEntryError::Vanished) => continue,
                        Err(OpenEntryError::Error(err)) => return Err(err),
                    }
                }
                (OpenMode::ReadOrCreate, None) => {
                    let entry = match self.create_entry(module, &key) {
                        Some(entry) => entry,
                        // Someone else created it first; retry as a reader.
                        None => continue,
                    };
                    match self.open_writer(module, entry, options) {
                        Ok(writer) => return Ok(Opened::Created(writer)),
                        Err(OpenEntryError::Stale | OpenEntryError::Vanished) => continue,
                        Err(OpenEntryError::Error(err)) => return Err(err),
                    }
                }
            }
        }
    }

    /// Accounts freshly written bytes against the budget, evicting when
    /// the total crosses the configured maximum.
    ///
    /// Driven by [`EntryWriter::write`] after each successful write;
    /// `writing` names the entry currently being filled so eviction leaves
    /// it alone.
    pub fn write_notification(&self, module: &str, bytes: u64, writing: &CacheKey) {
        metric!(counter("cache.write.bytes") += bytes as i64, "module" => module);
        if self
            .inner
            .total_size
            .increment_test(bytes, self.inner.max_total_size)
            == Ordering::Greater
        {
            self.evict(Some(writing));
        }
    }

    /// Clears the eviction pin on `key`, making the entry evictable again.
    pub fn unlock(&self, key: impl AsRef<[u8]>) -> CacheResult<()> {
        let key = CacheKey::normalize(key);
        let entry = self
            .inner
            .index
            .read()
            .entries
            .get(&key)
            .cloned()
            .ok_or(CacheError::NotFound)?;
        entry.unpin();
        Ok(())
    }

    /// Removes `key` from the cache.
    ///
    /// Streams still holding the entry keep working against their open
    /// file; the payload disappears from disk once the last of them is
    /// dropped. The byte tally is adjusted by the size known at this
    /// moment, which is best-effort while a writer is active.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> CacheResult<()> {
        let key = CacheKey::normalize(key);
        let entry = self
            .inner
            .index
            .read()
            .entries
            .get(&key)
            .cloned()
            .ok_or(CacheError::NotFound)?;
        self.remove_entry(&entry);
        Ok(())
    }

    /// Approximate total payload bytes currently accounted for.
    pub fn total_size(&self) -> u64 {
        self.inner.total_size.get()
    }

    /// Number of live entries in the table.
    pub fn entry_count(&self) -> usize {
        self.inner.index.read().entries.len()
    }

    /// Brings the cache back under budget. No-op while the tally is at or
    /// below the configured maximum.
    ///
    /// Eviction aims for the low-water mark. Candidates are all entries
    /// except the one currently being written (`writing`), pinned entries,
    /// and entries whose observable size is still zero (a writer owns
    /// them); they are taken in eviction-rank order until enough bytes are
    /// covered. The chosen entries leave the table and recency ordering
    /// under the exclusive table lock, but the references are dropped
    /// outside it so file deletion never runs under the table lock.
    pub fn evict(&self, writing: Option<&CacheKey>) {
        let current = self.inner.total_size.get();
        if current <= self.inner.max_total_size {
            return;
        }

        if !self.inner.over_budget_warned.swap(true, Relaxed) {
            tracing::warn!(
                current_bytes = current,
                maximum_bytes = self.inner.max_total_size,
                "cache size exceeded the configured maximum for the first time"
            );
        }

        let mut candidates: Vec<(EvictionRank, Arc<CacheEntry>)> = {
            let index = self.inner.index.read();
            index
                .recency
                .values()
                .filter_map(|key| index.entries.get(key))
                .filter(|entry| writing.is_none_or(|w| entry.key() != w))
                .map(|entry| (entry.rank(), entry.clone()))
                .filter(|(rank, _)| !rank.pinned && rank.size > 0)
                .collect()
        };
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut wanted = current.saturating_sub(self.inner.low_water);
        let mut doomed = Vec::new();
        for (rank, entry) in candidates {
            if wanted == 0 {
                break;
            }
            wanted = wanted.saturating_sub(rank.size);
            doomed.push(entry);
        }
        if doomed.is_empty() {
            return;
        }

        let mut removed = Vec::with_capacity(doomed.len());
        {
            let mut index = self.inner.index.write();
            for entry in doomed {
                // The snapshot is stale by now: skip anything a writer
                // re-opened or a caller pinned in the meantime.
                let rank = entry.rank();
                if rank.pinned || rank.size == 0 {
                    continue;
                }
                if index.remove(&entry) {
                    removed.push((entry, rank.size));
                }
            }
        }

        let mut freed = 0u64;
        for (entry, size) in &removed {
            entry.invalidate();
            self.inner.total_size.decrement(*size);
            freed += size;
        }

        tracing::debug!(
            files = removed.len(),
            bytes = freed,
            "evicted cache entries"
        );
        metric!(counter("cache.evicted.files") += removed.len() as i64);
        metric!(counter("cache.evicted.bytes") += freed as i64);
        metric!(gauge("cache.size.bytes") = self.inner.total_size.get());

        // Dropping the references here, outside the table lock, is what
        // deletes the files for entries nothing else holds open.
        drop(removed);
    }

    /// Discards an in-flight write: the entry leaves the table before it
    /// is invalidated so no new opener can find it, and the bytes written
    /// so far leave the budget.
    pub(super) fn discard_written(&self, entry: &Arc<CacheEntry>, written: u64) {
        self.inner.index.write().remove(entry);
        entry.invalidate();
        if written > 0 {
            self.inner.total_size.decrement(written);
        }
    }

    /// Looks `key` up under the shared lock, dropping the entry when its
    /// last write is older than the configured expiration.
    fn lookup_live(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let entry = self.inner.index.read().entries.get(key).cloned()?;
        if entry.is_expired(self.inner.entry_expiration) {
            tracing::debug!(key = %entry.key(), "dropping expired cache entry");
            self.remove_entry(&entry);
            return None;
        }
        Some(entry)
    }

    /// Removes `entry` from table and recency ordering and releases its
    /// bytes. Returns whether this call did the removal.
    fn remove_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        let removed = self.inner.index.write().remove(entry);
        if removed {
            self.inner.total_size.decrement(entry.size());
            entry.invalidate();
        }
        removed
    }

    /// Inserts a fresh entry for `key`, re-checking existence under the
    /// exclusive table lock. Returns `None` when another creator won the
    /// race in the window since the caller's shared-lock lookup.
    fn create_entry(&self, module: &str, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let mut index = self.inner.index.write();
        if index.entries.contains_key(key) {
            return None;
        }

        let seq = self.inner.path_sequence.next_sequence();
        let path = entry_path(&self.inner.root, module, seq);
        let entry = Arc::new(CacheEntry::new(
            key.clone(),
            path,
            self.inner.locks.next_lock(),
        ));
        let slot = self.next_touch();
        index.insert(entry.clone(), slot);
        Some(entry)
    }

    fn open_reader(&self, entry: Arc<CacheEntry>) -> Result<EntryReader, OpenEntryError> {
        match entry.open_read() {
            Ok((guard, file, size, last_modified)) => {
                self.touch(&entry);
                self.evict(None);
                Ok(EntryReader::new(entry, guard, file, size, last_modified))
            }
            Err(OpenEntryError::Vanished) => {
                // The file went away underneath a live entry; drop the
                // entry so the lookup can start over cleanly.
                self.remove_entry(&entry);
                Err(OpenEntryError::Vanished)
            }
            Err(err) => Err(err),
        }
    }

    fn open_writer(
        &self,
        module: &str,
        entry: Arc<CacheEntry>,
        options: EntryOptions,
    ) -> Result<EntryWriter, OpenEntryError> {
        match entry.open_write(options) {
            Ok((guard, file, previous_size)) => {
                if previous_size > 0 {
                    // The previous generation's bytes are gone the moment
                    // the file is truncated.
                    self.inner.total_size.decrement(previous_size);
                }
                self.touch(&entry);
                self.evict(Some(entry.key()));
                Ok(EntryWriter::new(
                    self.clone(),
                    entry,
                    module.to_owned(),
                    guard,
                    file,
                    self.inner.max_entry_size,
                ))
            }
            Err(OpenEntryError::Error(err)) => {
                // A failed create leaves nothing usable behind; drop the
                // entry so later opens start fresh instead of spinning on
                // it.
                self.remove_entry(&entry);
                Err(OpenEntryError::Error(err))
            }
            Err(err) => Err(err),
        }
    }

    /// Moves `entry` to the most-recent end of the LRU ordering.
    fn touch(&self, entry: &Arc<CacheEntry>) {
        let slot = self.next_touch();
        self.inner.index.write().touch(entry, slot);
    }

    fn next_touch(&self) -> u64 {
        self.inner.touch_clock.fetch_add(1, Relaxed) + 1
    }
}

/// Builds the on-disk location for a new entry:
/// `<root>/<module>/<seq / 256>/<seq % 256>.sbc`. The two-level split
/// keeps every directory at or below 256 children.
fn entry_path(root: &Path, module: &str, seq: u64) -> PathBuf {
    root.join(sanitize_module(module))
        .join((seq / DIR_SHARD).to_string())
        .join(format!("{}.{ENTRY_EXT}", seq % DIR_SHARD))
}

/// Maps a module name to a safe path segment: ASCII alphanumerics and `.`
/// pass through, everything else becomes `_`. A segment that would walk
/// the directory tree (empty, or dots only) is replaced wholesale.
fn sanitize_module(module: &str) -> String {
    let name: String = module
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.bytes().all(|b| b == b'.') {
        "_".into()
    } else {
        name
    }
}
