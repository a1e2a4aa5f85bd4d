use std::fs::File;
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use crate::config::{CacheParams, Config};

use super::*;

const MIB: u64 = 1024 * 1024;

fn test_config(dir: &Path, max_mb: u64, entry_mb: u64, low_mb: u64) -> Config {
    Config {
        cache_dir: dir.to_path_buf(),
        caches: CacheParams {
            max_size_mb: max_mb,
            max_entry_size_mb: entry_mb,
            low_water_mb: low_mb,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn test_manager(dir: &Path, max_mb: u64, entry_mb: u64, low_mb: u64) -> CacheManager {
    CacheManager::new(&test_config(dir, max_mb, entry_mb, low_mb)).unwrap()
}

fn write_entry(manager: &CacheManager, key: &str, payload: &[u8], options: EntryOptions) {
    match manager.open("test", key, OpenMode::Write, options).unwrap() {
        Opened::Write(mut writer) => {
            writer.write(payload).unwrap();
            writer.commit();
        }
        other => panic!("expected a write stream, got {other:?}"),
    }
}

fn read_entry(manager: &CacheManager, key: &str) -> CacheResult<Vec<u8>> {
    match manager.open("test", key, OpenMode::Read, EntryOptions::default())? {
        Opened::Read(mut reader) => {
            let mut payload = Vec::new();
            reader.read_to_end(&mut payload).unwrap();
            Ok(payload)
        }
        other => panic!("expected a read stream, got {other:?}"),
    }
}

fn cache_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut directories = vec![root.to_path_buf()];
    while let Some(directory) = directories.pop() {
        for entry in std::fs::read_dir(directory).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                directories.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[test]
fn test_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    let payload = b"<vxml version=\"2.1\"><form id=\"main\"/></vxml>";
    write_entry(&manager, "http://voice.example.com/app.vxml", payload, Default::default());

    let read = read_entry(&manager, "http://voice.example.com/app.vxml").unwrap();
    assert_eq!(read, payload);
}

#[test]
fn test_open_reports_entry_info() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    let before = SystemTime::now();
    write_entry(&manager, "key", b"payload", Default::default());

    match manager
        .open("test", "key", OpenMode::Read, Default::default())
        .unwrap()
    {
        Opened::Read(reader) => {
            assert_eq!(reader.key().as_bytes(), b"key");
            assert_eq!(reader.size(), 7);
            assert!(reader.last_modified() >= before);
        }
        other => panic!("expected a read stream, got {other:?}"),
    }
}

#[test]
fn test_read_missing_key() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    assert!(matches!(
        read_entry(&manager, "nothing-here"),
        Err(CacheError::NotFound)
    ));
}

#[test]
fn test_overwrite_replaces_payload() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    write_entry(&manager, "key", b"first generation", Default::default());
    write_entry(&manager, "key", b"second", Default::default());

    assert_eq!(read_entry(&manager, "key").unwrap(), b"second");
    // The first generation's bytes left the tally when the entry was
    // truncated for rewriting.
    assert_eq!(manager.total_size(), 6);
}

#[test]
fn test_long_keys_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    let key = "http://voice.example.com/grammar?".to_owned() + &"digits".repeat(100);
    write_entry(&manager, &key, b"#ABNF 1.0;", Default::default());
    assert_eq!(read_entry(&manager, &key).unwrap(), b"#ABNF 1.0;");
}

#[test]
fn test_read_or_create_reads_existing() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    write_entry(&manager, "key", b"payload", Default::default());

    match manager
        .open("test", "key", OpenMode::ReadOrCreate, Default::default())
        .unwrap()
    {
        Opened::Read(mut reader) => {
            let mut payload = Vec::new();
            reader.read_to_end(&mut payload).unwrap();
            assert_eq!(payload, b"payload");
        }
        other => panic!("expected a read stream, got {other:?}"),
    }
}

#[test]
fn test_delete_keeps_open_readers_alive() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    write_entry(&manager, "key", b"still readable", Default::default());

    let mut reader = match manager
        .open("test", "key", OpenMode::Read, Default::default())
        .unwrap()
    {
        Opened::Read(reader) => reader,
        other => panic!("expected a read stream, got {other:?}"),
    };

    manager.delete("key").unwrap();
    assert!(matches!(
        read_entry(&manager, "key"),
        Err(CacheError::NotFound)
    ));
    assert_eq!(manager.total_size(), 0);

    // The open reader still sees the full payload; the file goes away only
    // once the reader is dropped.
    let mut payload = Vec::new();
    reader.read_to_end(&mut payload).unwrap();
    assert_eq!(payload, b"still readable");

    assert!(!cache_files(dir.path()).is_empty());
    drop(reader);
    assert!(cache_files(dir.path()).is_empty());
}

#[test]
fn test_delete_missing_key() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);
    assert!(matches!(manager.delete("nope"), Err(CacheError::NotFound)));
    assert!(matches!(manager.unlock("nope"), Err(CacheError::NotFound)));
}

#[test]
fn test_discard_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    match manager
        .open("test", "key", OpenMode::Write, Default::default())
        .unwrap()
    {
        Opened::Write(mut writer) => {
            writer.write(b"half-finished").unwrap();
            writer.discard();
        }
        other => panic!("expected a write stream, got {other:?}"),
    }

    assert!(matches!(
        read_entry(&manager, "key"),
        Err(CacheError::NotFound)
    ));
    assert_eq!(manager.total_size(), 0);
    assert!(cache_files(dir.path()).is_empty());
}

#[test]
fn test_dropped_writer_discards() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    match manager
        .open("test", "key", OpenMode::Write, Default::default())
        .unwrap()
    {
        Opened::Write(mut writer) => {
            writer.write(b"never committed").unwrap();
            // dropped here
        }
        other => panic!("expected a write stream, got {other:?}"),
    }

    assert!(matches!(
        read_entry(&manager, "key"),
        Err(CacheError::NotFound)
    ));
    assert_eq!(manager.total_size(), 0);
}

#[test]
fn test_oversized_write_is_rejected_whole() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 2, 1, 1);

    let mut writer = match manager
        .open("test", "key", OpenMode::Write, Default::default())
        .unwrap()
    {
        Opened::Write(writer) => writer,
        other => panic!("expected a write stream, got {other:?}"),
    };

    let almost_full = vec![b'a'; MIB as usize - 1];
    writer.write(&almost_full).unwrap();

    // Two more bytes would cross the ceiling: rejected whole, nothing of
    // the buffer is written.
    assert!(matches!(
        writer.write(b"xy"),
        Err(CacheError::EntryTooLarge { .. })
    ));
    assert_eq!(writer.written(), MIB - 1);

    // One byte still fits exactly.
    writer.write(b"b").unwrap();
    writer.commit();

    let payload = read_entry(&manager, "key").unwrap();
    assert_eq!(payload.len() as u64, MIB);
    assert_eq!(payload[payload.len() - 1], b'b');
    assert_eq!(payload[payload.len() - 2], b'a');
}

#[test]
fn test_pinned_entries_survive_pressure() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 2, 1, 1);

    let pinned = EntryOptions {
        pin: PinMode::Content,
        cost: CreationCost::High,
    };
    write_entry(&manager, "pinned", &vec![b'p'; MIB as usize], pinned);
    write_entry(&manager, "filler-1", &vec![b'f'; MIB as usize], Default::default());

    // Pushes the tally over budget; eviction must take the filler, not the
    // pinned entry.
    write_entry(&manager, "filler-2", &vec![b'f'; MIB as usize], Default::default());
    assert!(read_entry(&manager, "pinned").is_ok());
    assert!(matches!(
        read_entry(&manager, "filler-1"),
        Err(CacheError::NotFound)
    ));

    // Repeated pressure still leaves the pinned entry alone.
    write_entry(&manager, "filler-3", &vec![b'f'; MIB as usize], Default::default());
    assert!(read_entry(&manager, "pinned").is_ok());

    // Once unpinned it is fair game again.
    manager.unlock("pinned").unwrap();
    write_entry(&manager, "filler-4", &vec![b'f'; MIB as usize], Default::default());
    assert!(matches!(
        read_entry(&manager, "pinned"),
        Err(CacheError::NotFound)
    ));
}

#[test]
fn test_eviction_converges_to_low_water() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 2, 1, 1);

    write_entry(&manager, "a", &vec![b'a'; MIB as usize], Default::default());
    write_entry(&manager, "b", &vec![b'b'; MIB as usize], Default::default());
    write_entry(&manager, "c", &vec![b'c'; MIB as usize], Default::default());

    // Writing `c` pushed the tally to 3 MiB against a 2 MiB budget;
    // eviction frees down to the 1 MiB low-water mark.
    assert_eq!(manager.total_size(), MIB);
    assert_eq!(manager.entry_count(), 1);
    assert!(read_entry(&manager, "c").is_ok());
}

#[test]
fn test_eviction_prefers_cheap_entries() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 3, 1, 2);

    let low = EntryOptions::default();
    let high = EntryOptions {
        cost: CreationCost::High,
        ..Default::default()
    };
    write_entry(&manager, "a", &vec![b'a'; MIB as usize], low);
    write_entry(&manager, "b", &vec![b'b'; MIB as usize], high);
    write_entry(&manager, "c", &vec![b'c'; MIB as usize], low);

    // 1 MiB over budget with a 2 MiB target: both cheap entries go before
    // the expensive one, even though `b` is older than `c`.
    write_entry(&manager, "d", &vec![b'd'; MIB as usize], Default::default());

    assert!(matches!(read_entry(&manager, "a"), Err(CacheError::NotFound)));
    assert!(matches!(read_entry(&manager, "c"), Err(CacheError::NotFound)));
    assert!(read_entry(&manager, "b").is_ok());
    assert!(read_entry(&manager, "d").is_ok());
}

#[test]
fn test_eviction_takes_least_recent_first() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 4, 2, 3);

    write_entry(&manager, "old", &vec![b'o'; 2 * MIB as usize], Default::default());
    write_entry(&manager, "mid", &vec![b'm'; MIB as usize], Default::default());
    write_entry(&manager, "new", &vec![b'n'; MIB as usize], Default::default());

    // 1 MiB over budget with a 3 MiB target: the stalest entry alone
    // covers it, everything else stays.
    write_entry(&manager, "d", &vec![b'd'; MIB as usize], Default::default());

    assert!(matches!(read_entry(&manager, "old"), Err(CacheError::NotFound)));
    assert!(read_entry(&manager, "mid").is_ok());
    assert!(read_entry(&manager, "new").is_ok());
    assert!(read_entry(&manager, "d").is_ok());
}

#[test]
fn test_reading_refreshes_recency() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 3, 1, 2);

    write_entry(&manager, "a", &vec![b'a'; MIB as usize], Default::default());
    write_entry(&manager, "b", &vec![b'b'; MIB as usize], Default::default());
    write_entry(&manager, "c", &vec![b'c'; MIB as usize], Default::default());

    // Touch `a` so `b` becomes the stalest entry.
    read_entry(&manager, "a").unwrap();

    write_entry(&manager, "d", &vec![b'd'; MIB as usize], Default::default());

    assert!(read_entry(&manager, "a").is_ok());
    assert!(matches!(read_entry(&manager, "b"), Err(CacheError::NotFound)));
}

#[test]
fn test_concurrent_read_or_create_creates_once() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);
    let payload = b"created exactly once";

    let created = AtomicUsize::new(0);
    let read = AtomicUsize::new(0);
    let barrier = Barrier::new(2);

    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                barrier.wait();
                match manager
                    .open("test", "shared", OpenMode::ReadOrCreate, Default::default())
                    .unwrap()
                {
                    Opened::Created(mut writer) => {
                        created.fetch_add(1, Ordering::SeqCst);
                        writer.write(payload).unwrap();
                        writer.commit();
                    }
                    Opened::Read(mut reader) => {
                        read.fetch_add(1, Ordering::SeqCst);
                        let mut seen = Vec::new();
                        reader.read_to_end(&mut seen).unwrap();
                        assert_eq!(seen, payload);
                    }
                    Opened::Write(_) => panic!("plain write stream from ReadOrCreate"),
                }
            });
        }
    });

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(read.load(Ordering::SeqCst), 1);
}

#[test]
fn test_second_writer_waits_for_first() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);

    let first_committed = AtomicBool::new(false);

    let mut writer = match manager
        .open("test", "key", OpenMode::Write, Default::default())
        .unwrap()
    {
        Opened::Write(writer) => writer,
        other => panic!("expected a write stream, got {other:?}"),
    };

    thread::scope(|scope| {
        scope.spawn(|| {
            // Blocks on the entry's exclusive lock until the first writer
            // resolves.
            match manager
                .open("test", "key", OpenMode::Write, Default::default())
                .unwrap()
            {
                Opened::Write(mut second) => {
                    assert!(first_committed.load(Ordering::SeqCst));
                    second.write(b"two").unwrap();
                    second.commit();
                }
                other => panic!("expected a write stream, got {other:?}"),
            }
        });

        thread::sleep(Duration::from_millis(100));
        writer.write(b"one").unwrap();
        first_committed.store(true, Ordering::SeqCst);
        writer.commit();
    });

    assert_eq!(read_entry(&manager, "key").unwrap(), b"two");
}

#[test]
fn test_reader_blocks_until_writer_commits() {
    let dir = tempfile::tempdir().unwrap();
    let manager = test_manager(dir.path(), 10, 5, 5);
    let barrier = Barrier::new(2);

    thread::scope(|scope| {
        scope.spawn(|| {
            let mut writer = match manager
                .open("test", "key", OpenMode::Write, Default::default())
                .unwrap()
            {
                Opened::Write(writer) => writer,
                other => panic!("expected a write stream, got {other:?}"),
            };
            writer.write(b"first half, ").unwrap();
            barrier.wait();
            thread::sleep(Duration::from_millis(150));
            writer.write(b"second half").unwrap();
            writer.commit();
        });

        barrier.wait();
        // A reader arriving mid-write must never observe the partial
        // payload; it waits out the writer and sees the committed whole.
        let payload = read_entry(&manager, "key").unwrap();
        assert_eq!(payload, b"first half, second half");
    });
}

#[test]
fn test_readers_do_not_starve_a_waiting_writer() {
    let lock = Arc::new(RwLock::new(()));
    let writer_acquired = Arc::new(AtomicBool::new(false));

    let first_reader = lock.read_arc();

    thread::scope(|scope| {
        scope.spawn(|| {
            let _guard = lock.write_arc();
            writer_acquired.store(true, Ordering::SeqCst);
        });

        // Give the writer time to start waiting behind the held read lock.
        thread::sleep(Duration::from_millis(100));
        assert!(!writer_acquired.load(Ordering::SeqCst));

        scope.spawn(|| {
            // Arrives after the writer: must queue behind it rather than
            // sharing the lock with the first reader.
            let _guard = lock.read_arc();
            assert!(writer_acquired.load(Ordering::SeqCst));
        });

        thread::sleep(Duration::from_millis(100));
        drop(first_reader);
    });
}

#[test]
fn test_expired_entries_are_treated_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 10, 5, 5);
    config.caches.entry_expiration = Duration::from_millis(50);
    let manager = CacheManager::new(&config).unwrap();

    write_entry(&manager, "short-lived", b"payload", Default::default());
    assert!(read_entry(&manager, "short-lived").is_ok());

    thread::sleep(Duration::from_millis(120));
    assert!(matches!(
        read_entry(&manager, "short-lived"),
        Err(CacheError::NotFound)
    ));
    assert_eq!(manager.entry_count(), 0);
}

#[test]
fn test_pinned_entries_do_not_expire() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 10, 5, 5);
    config.caches.entry_expiration = Duration::from_millis(50);
    let manager = CacheManager::new(&config).unwrap();

    let pinned = EntryOptions {
        pin: PinMode::Content,
        ..Default::default()
    };
    write_entry(&manager, "builtin", b"grammar", pinned);

    thread::sleep(Duration::from_millis(120));
    assert!(read_entry(&manager, "builtin").is_ok());
}

#[test]
fn test_size_parameters_are_validated() {
    let dir = tempfile::tempdir().unwrap();

    let config = test_config(dir.path(), 10, 20, 5);
    assert!(matches!(
        CacheManager::new(&config),
        Err(CacheError::InvalidArgument(_))
    ));

    let config = test_config(dir.path(), 10, 5, 20);
    assert!(matches!(
        CacheManager::new(&config),
        Err(CacheError::InvalidArgument(_))
    ));

    let mut config = test_config(dir.path(), 10, 5, 5);
    config.caches.entry_expiration = Duration::ZERO;
    assert!(matches!(
        CacheManager::new(&config),
        Err(CacheError::InvalidArgument(_))
    ));
}

#[test]
fn test_index_does_not_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let manager = test_manager(dir.path(), 10, 5, 5);
    write_entry(&manager, "key", b"payload", Default::default());
    drop(manager);

    // Payload files carry no metadata and no index is persisted: a fresh
    // manager starts empty even though the file is still on disk.
    let manager = test_manager(dir.path(), 10, 5, 5);
    assert!(matches!(
        read_entry(&manager, "key"),
        Err(CacheError::NotFound)
    ));
    assert_eq!(manager.entry_count(), 0);
    assert!(!cache_files(dir.path()).is_empty());
}

#[test]
fn test_cleanup_sweeps_stale_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 10, 5, 5);
    config.caches.entry_expiration = Duration::from_millis(50);

    let manager = CacheManager::new(&config).unwrap();
    write_entry(&manager, "one", b"stale payload", Default::default());
    write_entry(&manager, "two", b"another stale payload", Default::default());
    drop(manager);

    thread::sleep(Duration::from_millis(120));

    let fresh = dir.path().join("fresh.sbc");
    File::create(&fresh).unwrap().write_all(b"fresh").unwrap();

    // A dry run reports but deletes nothing.
    cleanup(&config, true).unwrap();
    assert_eq!(cache_files(dir.path()).len(), 3);

    cleanup(&config, false).unwrap();
    assert_eq!(cache_files(dir.path()), vec![fresh]);
}
