use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use super::error::CacheError;
use super::key::CacheKey;

/// Owned shared guard on an entry's file lock, carried by a read stream.
pub(super) type SharedFileGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// Owned exclusive guard on an entry's file lock, carried by a write stream.
pub(super) type ExclusiveFileGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Pinning requested when an entry is written.
///
/// Pinned entries are never chosen by eviction until explicitly unpinned;
/// the platform uses this for built-in grammars and administrator
/// provisioned resources. `Memory` asks for the payload to additionally be
/// kept in memory; this implementation keeps no payloads in memory, so it
/// degrades to the content pin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PinMode {
    /// The entry is evictable.
    #[default]
    None,
    /// Keep the entry on disk until it is unpinned.
    Content,
    /// Degrades to [`Content`](Self::Content).
    Memory,
}

/// Caller-supplied hint for how expensive the cached artifact was to
/// produce. Cheaper entries are evicted first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CreationCost {
    #[default]
    Low,
    Medium,
    High,
}

/// Properties applied to an entry when it is (re)written.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryOptions {
    pub pin: PinMode,
    pub cost: CreationCost,
}

/// Why an entry could not be opened.
#[derive(Debug)]
pub(super) enum OpenEntryError {
    /// The entry lost a race against a concurrent writer: it was
    /// invalidated, or its backing file has not materialized yet. The
    /// opener restarts from the table; the writer resolves the race by
    /// committing or discarding.
    Stale,
    /// The backing file disappeared underneath a live entry. The entry is
    /// dropped from the table and the lookup restarts.
    Vanished,
    /// A real failure to surface to the caller.
    Error(CacheError),
}

#[derive(Debug)]
struct EntryState {
    /// Payload size in bytes. Zero while a writer owns the entry; only
    /// authoritative again once the writer has committed.
    size: u64,
    cost: CreationCost,
    pinned: bool,
    last_accessed: Instant,
    /// Wall-clock time of the last committed write; reported to callers
    /// and compared against the expiration TTL.
    last_modified: SystemTime,
    /// Cleared once a writer fails or discards, or the entry is deleted
    /// while still open elsewhere. Openers finding this cleared restart
    /// from the table.
    valid: bool,
    file_exists: bool,
    /// Set once the entry has left the table for good. The backing file is
    /// removed when the last reference goes away.
    unlink_on_drop: bool,
}

/// One cached on-disk object.
///
/// Shared between the entry table, the recency ordering and any open
/// streams via [`Arc`]. The file lock comes from the shared pool and
/// serializes payload access: any number of readers, or one writer. The
/// metadata lives under its own small mutex and is never held across file
/// I/O.
///
/// Deleting the backing file is tied to ownership: once the entry has been
/// evicted, deleted or discarded, the file is removed when the last
/// reference drops, so streams that are still open keep reading a payload
/// that has already disappeared from the table.
#[derive(Debug)]
pub(super) struct CacheEntry {
    key: CacheKey,
    path: PathBuf,
    file_lock: Arc<RwLock<()>>,
    lru_slot: AtomicU64,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, path: PathBuf, file_lock: Arc<RwLock<()>>) -> Self {
        CacheEntry {
            key,
            path,
            file_lock,
            lru_slot: AtomicU64::new(0),
            state: Mutex::new(EntryState {
                size: 0,
                cost: CreationCost::default(),
                pinned: false,
                last_accessed: Instant::now(),
                last_modified: SystemTime::now(),
                valid: true,
                file_exists: false,
                unlink_on_drop: false,
            }),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn lru_slot(&self) -> u64 {
        self.lru_slot.load(Relaxed)
    }

    pub fn set_lru_slot(&self, slot: u64) {
        self.lru_slot.store(slot, Relaxed);
    }

    /// Opens the entry for writing.
    ///
    /// Blocks until every reader and writer of this entry (or of another
    /// entry sharing the pooled lock) is gone. The backing file is created
    /// fresh; if that fails, parent directories are created and the open
    /// retried once. On success the observable size drops to zero and the
    /// caller-supplied properties are recorded. Returns the previous
    /// committed size so the caller can release those bytes from the
    /// budget.
    pub fn open_write(
        self: &Arc<Self>,
        options: EntryOptions,
    ) -> Result<(ExclusiveFileGuard, File, u64), OpenEntryError> {
        let guard = self.file_lock.write_arc();

        if !self.state.lock().valid {
            return Err(OpenEntryError::Stale);
        }

        let file = match File::create(&self.path) {
            Ok(file) => file,
            Err(_) => {
                let retried = match self.path.parent() {
                    Some(parent) => {
                        fs::create_dir_all(parent).and_then(|()| File::create(&self.path))
                    }
                    None => File::create(&self.path),
                };
                match retried {
                    Ok(file) => file,
                    Err(err) => {
                        self.state.lock().file_exists = false;
                        drop(guard);
                        return Err(OpenEntryError::Error(err.into()));
                    }
                }
            }
        };

        let mut state = self.state.lock();
        let previous_size = state.size;
        state.size = 0;
        state.cost = options.cost;
        state.pinned = state.pinned || options.pin != PinMode::None;
        state.file_exists = true;
        state.last_modified = SystemTime::now();
        state.last_accessed = Instant::now();
        drop(state);

        Ok((guard, file, previous_size))
    }

    /// Opens the entry for reading.
    ///
    /// Blocks behind any active writer; once the shared lock is acquired
    /// the entry may turn out to have been invalidated or discarded in the
    /// meantime, which is reported as [`Stale`](OpenEntryError::Stale) so
    /// the caller restarts from the table.
    pub fn open_read(
        self: &Arc<Self>,
    ) -> Result<(SharedFileGuard, File, u64, SystemTime), OpenEntryError> {
        let guard = self.file_lock.read_arc();

        let (size, last_modified) = {
            let mut state = self.state.lock();
            if !state.valid || !state.file_exists {
                return Err(OpenEntryError::Stale);
            }
            state.last_accessed = Instant::now();
            (state.size, state.last_modified)
        };

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(OpenEntryError::Vanished);
            }
            Err(err) => return Err(OpenEntryError::Error(err.into())),
        };

        Ok((guard, file, size, last_modified))
    }

    /// Publishes a completed write of `size` bytes.
    ///
    /// Returns `false` when the entry was deleted while the writer had it
    /// open; the payload is then reclaimed with the entry instead of
    /// becoming visible.
    pub fn finish_write(&self, size: u64) -> bool {
        let mut state = self.state.lock();
        if !state.valid {
            return false;
        }
        state.size = size;
        state.last_modified = SystemTime::now();
        state.last_accessed = Instant::now();
        true
    }

    /// Marks the entry dead: no opener may use it again, and the backing
    /// file goes away with the last reference.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.valid = false;
        state.unlink_on_drop = true;
    }

    /// Clears the eviction pin.
    pub fn unpin(&self) {
        self.state.lock().pinned = false;
    }

    /// Size as currently observable. Zero while a writer owns the entry.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Whether the last committed write is older than `ttl`.
    ///
    /// Pinned entries never expire, and neither does an entry a writer
    /// currently owns.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        let state = self.state.lock();
        if state.pinned || state.size == 0 {
            return false;
        }
        state
            .last_modified
            .elapsed()
            .map(|age| age > ttl)
            .unwrap_or(true)
    }

    /// Snapshot used to order and filter eviction candidates.
    pub fn rank(&self) -> EvictionRank {
        let state = self.state.lock();
        EvictionRank {
            pinned: state.pinned,
            cost: state.cost,
            last_accessed: state.last_accessed,
            size: state.size,
        }
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.unlink_on_drop && state.file_exists {
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "failed to remove retired cache file"
                    );
                }
            }
        }
    }
}

/// Eviction order for entries: unpinned before pinned, then cheapest
/// creation cost, then least recently accessed, then smallest size. The
/// derived ordering compares fields top to bottom, which is exactly that
/// ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct EvictionRank {
    pub pinned: bool,
    pub cost: CreationCost,
    pub last_accessed: Instant,
    pub size: u64,
}
