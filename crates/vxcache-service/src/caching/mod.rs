//! # The vxcache caching core
//!
//! The VoiceXML platform fetches documents, grammars and prompt audio over
//! and over for every call it handles. This module is the disk-backed
//! cache those fetches go through: callers store an arbitrarily large blob
//! under an arbitrarily long key, read it back later, and the cache
//! discards whatever stops pulling its weight once the configured byte
//! budget is exceeded — except entries the platform has pinned (built-in
//! grammars, administrator-provisioned resources), which are never evicted
//! behind the caller's back.
//!
//! ## Keys
//!
//! Client keys are normalized through [`CacheKey::normalize`]: short keys
//! are kept verbatim, anything longer than 256 bytes is folded through an
//! MD5 digest into a fixed-length Base64 form. Folding is deterministic,
//! so the same client key always lands on the same entry. Keys are unique
//! within the table: there is never more than one live entry per key.
//!
//! ## Entries, streams and locking
//!
//! A cache entry records one on-disk object and is shared between the
//! table, the recency ordering and any open streams via
//! [`Arc`](std::sync::Arc). Payload access is serialized by a
//! reader/writer lock drawn from a fixed [`LockPool`]: any number of
//! concurrent [`EntryReader`]s, or exactly one [`EntryWriter`]. The lock
//! is writer-preferring, so a stream of readers cannot starve a pending
//! writer. Streams own their lock guard; dropping the stream releases it.
//!
//! A writer resolves in one of two ways: [`EntryWriter::commit`] publishes
//! the payload and its final size, [`EntryWriter::discard`] (or dropping
//! the writer, or a failed write) invalidates the entry. Readers that
//! were blocked behind a writer re-check the entry after acquiring the
//! lock; if they find it invalidated they restart from the table. That
//! retry happens inside [`CacheManager::open`] and callers never see it —
//! the writer is guaranteed to resolve, so the retry terminates.
//!
//! The backing file is deleted when the last reference to a retired entry
//! goes away. A reader that was already open when its entry got evicted or
//! deleted keeps reading a perfectly good file; the disk space is
//! reclaimed as soon as the reader is dropped.
//!
//! ## Budget and eviction
//!
//! A global [`Counter`] approximates the summed size of all payloads. It
//! is bumped on every write (see [`CacheManager::write_notification`]) and
//! adjusted when entries are overwritten, deleted or evicted. The counter
//! lives outside the table lock, so accounting can race concurrent writers
//! slightly; eviction simply runs again if the budget is still exceeded.
//!
//! Once the tally crosses the configured maximum, [`CacheManager::evict`]
//! frees space down to the low-water mark. Candidates are ranked unpinned
//! first, then by ascending creation cost (a caller-supplied hint for how
//! expensive the artifact was to produce), then least-recently-accessed,
//! then smallest. Pinned entries and entries a writer currently owns are
//! never touched. The chosen entries leave the table under the exclusive
//! table lock; their files are removed outside it, so no disk I/O ever
//! happens while the table is locked.
//!
//! ## On-disk layout
//!
//! Payload files are raw bytes with no header; all metadata lives in the
//! in-memory table, which is rebuilt empty on every process start. Paths
//! are `<root>/<module>/<seq / 256>/<seq % 256>.sbc`, sharded so no
//! directory collects more than 256 children. Files orphaned by a restart
//! are reclaimed by [`cleanup`], the maintenance sweep behind
//! `vxcache cleanup`.

mod cleanup;
mod counter;
mod entry;
mod error;
mod key;
mod lock_pool;
mod manager;
mod stream;
#[cfg(test)]
mod tests;

pub use cleanup::cleanup;
pub use counter::Counter;
pub use entry::{CreationCost, EntryOptions, PinMode};
pub use error::{CacheError, CacheResult};
pub use key::CacheKey;
pub use lock_pool::{DEFAULT_POOL_SIZE, LockPool};
pub use manager::{CacheManager, OpenMode, Opened};
pub use stream::{EntryReader, EntryWriter};
