use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use super::entry::{CacheEntry, ExclusiveFileGuard, SharedFileGuard};
use super::error::{CacheError, CacheResult};
use super::key::CacheKey;
use super::manager::CacheManager;

/// A read handle bound to one cache entry.
///
/// Holds the entry's shared lock for its whole lifetime: no writer can
/// touch the entry until every reader is dropped. The payload stays
/// readable even if the entry is evicted or deleted in the meantime; the
/// backing file is only removed once the last handle is gone.
///
/// All I/O is blocking. End of stream is the usual `Ok(0)` read result.
pub struct EntryReader {
    entry: Arc<CacheEntry>,
    file: File,
    size: u64,
    last_modified: SystemTime,
    _guard: SharedFileGuard,
}

impl EntryReader {
    pub(super) fn new(
        entry: Arc<CacheEntry>,
        guard: SharedFileGuard,
        file: File,
        size: u64,
        last_modified: SystemTime,
    ) -> Self {
        EntryReader {
            entry,
            file,
            size,
            last_modified,
            _guard: guard,
        }
    }

    /// The final (possibly digest-folded) key of the entry.
    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    /// Committed payload size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Time of the last committed write.
    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryReader")
            .field("key", self.entry.key())
            .field("size", &self.size)
            .finish()
    }
}

/// A write handle bound to one cache entry.
///
/// Holds the entry's exclusive lock: readers and other writers queue up
/// until this writer resolves by [`commit`](Self::commit)ting or
/// [`discard`](Self::discard)ing. Dropping an unresolved writer discards.
///
/// All I/O is blocking.
pub struct EntryWriter {
    manager: CacheManager,
    entry: Arc<CacheEntry>,
    module: String,
    file: Option<File>,
    written: u64,
    max_entry_size: u64,
    finished: bool,
    _guard: ExclusiveFileGuard,
}

impl EntryWriter {
    pub(super) fn new(
        manager: CacheManager,
        entry: Arc<CacheEntry>,
        module: String,
        guard: ExclusiveFileGuard,
        file: File,
        max_entry_size: u64,
    ) -> Self {
        EntryWriter {
            manager,
            entry,
            module,
            file: Some(file),
            written: 0,
            max_entry_size,
            finished: false,
            _guard: guard,
        }
    }

    /// The final (possibly digest-folded) key of the entry.
    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends `buf` to the entry.
    ///
    /// A write that would push the entry past the per-entry maximum is
    /// rejected whole: nothing of `buf` is written and everything written
    /// before stays in place. Every successful write is reported to the
    /// manager, which may evict other entries to keep the cache inside its
    /// global budget.
    ///
    /// An I/O failure invalidates the entry on the spot so no reader can
    /// ever observe the partial payload.
    pub fn write(&mut self, buf: &[u8]) -> CacheResult<usize> {
        let Some(file) = self.file.as_mut() else {
            return Err(CacheError::Io(io::Error::other(
                "write stream already failed",
            )));
        };

        if self.written + buf.len() as u64 > self.max_entry_size {
            return Err(CacheError::EntryTooLarge {
                limit: self.max_entry_size,
            });
        }

        if let Err(err) = file.write_all(buf) {
            self.fail();
            return Err(err.into());
        }

        self.written += buf.len() as u64;
        self.manager
            .write_notification(&self.module, buf.len() as u64, self.entry.key());
        Ok(buf.len())
    }

    /// Commits the payload: the final size is recorded and the entry
    /// becomes visible to readers.
    ///
    /// If the entry was deleted while this writer had it open, the payload
    /// is quietly reclaimed instead of being published.
    pub fn commit(mut self) {
        self.finished = true;
        drop(self.file.take());
        if !self.entry.finish_write(self.written) {
            self.manager.discard_written(&self.entry, self.written);
        }
    }

    /// Discards the write: the entry leaves the table, the bytes written so
    /// far leave the budget, and the backing file is deleted once the last
    /// reference to the entry drops.
    pub fn discard(mut self) {
        self.fail();
    }

    fn fail(&mut self) {
        self.finished = true;
        self.file = None;
        self.manager.discard_written(&self.entry, self.written);
    }
}

impl fmt::Debug for EntryWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryWriter")
            .field("key", self.entry.key())
            .field("module", &self.module)
            .field("written", &self.written)
            .finish()
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.fail();
        }
    }
}
