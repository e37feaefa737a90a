//! Integration tests for eviction, unlink and rename

mod common;

use common::Fixture;
use filetime::{FileTime, set_file_atime};
use vofs_cache::testing::{BLOCK_SIZE, assert_bytes_equal, patterned_bytes};

// ==================== eviction ====================

fn age(fx: &Fixture, path: &str, seconds: i64) {
    set_file_atime(fx.data_file(path), FileTime::from_unix_time(1_000_000 + seconds, 0)).unwrap();
}

#[test]
fn test_open_evicts_least_recently_accessed_unopened_file() {
    let fx = Fixture::with_config(|c| c.max_cache_size(10_000));
    for i in 0..11 {
        let path = format!("/d{i}/f");
        fx.seed_cached(&path, &patterned_bytes(1000));
        age(&fx, &path, i * 1000);
    }

    // d0 is the oldest, but it is open; d1 goes instead.
    let handle = fx.open("/d0/f", false, true, true).unwrap();
    assert!(fx.data_file("/d0/f").exists());
    assert!(!fx.data_file("/d1/f").exists());
    assert!(!fx.meta_file("/d1/f").exists());
    assert!(!fx.cache.data_dir().join("d1").exists());
    assert!(!fx.cache.metadata_dir().join("d1").exists());
    assert!(fx.data_file("/d2/f").exists());
    assert_eq!(fx.cache.determine_cache_size().total_bytes, 10_000);
    assert_eq!(fx.cache.stats().evictions, 1);

    assert_eq!(handle.read(0, 1000).unwrap(), patterned_bytes(1000));
    handle.release().unwrap();
}

#[test]
fn test_explicit_space_check_evicts_until_under_limit() {
    let fx = Fixture::with_config(|c| c.max_cache_size(2500));
    for i in 0..5 {
        let path = format!("/f{i}");
        fx.seed_cached(&path, &patterned_bytes(1000));
        age(&fx, &path, i);
    }

    fx.cache.check_cache_space().unwrap();
    // The most recently accessed survive.
    let survivors: Vec<_> = (0..5)
        .filter(|i| fx.data_file(&format!("/f{i}")).exists())
        .collect();
    assert_eq!(survivors, vec![3, 4]);
    assert_eq!(fx.cache.stats().evictions, 3);
}

#[test]
fn test_open_files_are_never_evicted() {
    let fx = Fixture::with_config(|c| c.max_cache_size(500));
    fx.seed_cached("/only", &patterned_bytes(1000));

    let handle = fx.open("/only", false, true, true).unwrap();
    fx.cache.check_cache_space().unwrap();
    assert!(fx.data_file("/only").exists());
    handle.release().unwrap();

    fx.cache.check_cache_space().unwrap();
    assert!(!fx.data_file("/only").exists());
}

#[test]
fn test_evicted_file_is_refetched() {
    let fx = Fixture::with_config(|c| c.max_cache_size(3 * BLOCK_SIZE as u64));
    let first = patterned_bytes(2 * BLOCK_SIZE);
    fx.create_file("/a", &first);
    age(&fx, "/a", 0);
    fx.create_file("/b", &patterned_bytes(2 * BLOCK_SIZE));
    // Eviction runs on the flush worker after the upload completes.
    fx.cache.wait_flushes();
    assert!(!fx.data_file("/a").exists());

    let handle = fx.open("/a", false, true, true).unwrap();
    assert_bytes_equal(&handle.read(0, first.len()).unwrap(), &first, "refetched");
    handle.release().unwrap();
}

// ==================== unlink ====================

#[test]
fn test_unlink_open_file_makes_handle_obsolete() {
    let fx = Fixture::new();
    let handle = fx.open("/dir/u", true, false, false).unwrap();
    handle.write(b"doomed", 0).unwrap();

    fx.cache.unlink_file("/dir/u").unwrap();
    assert!(handle.is_obsolete());
    assert!(fx.cache.handle("/dir/u").is_none());
    assert!(!fx.data_file("/dir/u").exists());
    assert!(!fx.cache.data_dir().join("dir").exists());

    // Reads still go through the open descriptor.
    assert_eq!(handle.read(0, 6).unwrap(), b"doomed");
    handle.release().unwrap();
    assert_eq!(fx.store.upload_count(), 0);
    assert!(!fx.meta_file("/dir/u").exists());
}

#[test]
fn test_unlink_closed_file() {
    let fx = Fixture::new();
    fx.create_file("/gone", b"abc");
    assert!(fx.meta_file("/gone").exists());

    fx.cache.unlink_file("/gone").unwrap();
    assert!(!fx.data_file("/gone").exists());
    assert!(!fx.meta_file("/gone").exists());
    fx.cache.unlink_file("/gone").unwrap();
}

// ==================== rename ====================

#[test]
fn test_rename_open_file_carries_handle() {
    let fx = Fixture::new();
    let handle = fx.open("/a/x", true, false, false).unwrap();
    handle.write(b"moving", 0).unwrap();

    fx.cache.rename_file("/a/x", "/b/y").unwrap();
    assert_eq!(handle.path(), "/b/y");
    assert!(fx.cache.handle("/a/x").is_none());
    assert!(fx.cache.handle("/b/y").is_some());
    assert!(fx.data_file("/b/y").exists());
    assert!(!fx.data_file("/a/x").exists());

    handle.release().unwrap();
    assert!(fx.meta_file("/b/y").exists());
    assert!(!fx.meta_file("/a/x").exists());
}

#[test]
fn test_rename_closed_file_moves_data_and_metadata() {
    let fx = Fixture::new();
    let content = patterned_bytes(300);
    fx.create_file("/from", &content);

    fx.cache.rename_file("/from", "/sub/to").unwrap();
    assert!(!fx.data_file("/from").exists());
    assert!(fx.meta_file("/sub/to").exists());

    fx.store.put("/sub/to", content.clone());
    let handle = fx.open("/sub/to", false, true, true).unwrap();
    assert!(handle.is_fully_cached());
    assert_eq!(handle.read(0, 300).unwrap(), content);
    assert_eq!(fx.store.read_count(), 0);
    handle.release().unwrap();
}

#[test]
fn test_rename_over_open_file_obsoletes_target() {
    let fx = Fixture::new();
    let source = fx.open("/src", true, false, false).unwrap();
    source.write(b"source", 0).unwrap();
    let target = fx.open("/dst", true, false, false).unwrap();
    target.write(b"target", 0).unwrap();

    fx.cache.rename_file("/src", "/dst").unwrap();
    assert!(target.is_obsolete());
    assert!(!source.is_obsolete());
    assert_eq!(source.path(), "/dst");
    assert_eq!(fx.cache.open_handle_count(), 1);

    target.release().unwrap();
    source.release().unwrap();
    assert_eq!(fx.store.upload_count(), 1);
}

#[test]
fn test_rename_dir_updates_every_handle_inside() {
    let fx = Fixture::new();
    let a = fx.open("/dir/a", true, false, false).unwrap();
    a.write(b"a", 0).unwrap();
    let b = fx.open("/dir/sub/b", true, false, false).unwrap();
    b.write(b"b", 0).unwrap();
    let outside = fx.open("/dirx/c", true, false, false).unwrap();

    fx.cache.rename_dir("/dir", "/moved").unwrap();
    assert_eq!(a.path(), "/moved/a");
    assert_eq!(b.path(), "/moved/sub/b");
    assert_eq!(outside.path(), "/dirx/c");
    assert!(fx.data_file("/moved/sub/b").exists());
    assert!(!fx.cache.data_dir().join("dir").exists());
    assert!(fx.cache.handle("/moved/a").is_some());

    for handle in [a, b, outside] {
        handle.release().unwrap();
    }
    assert!(fx.meta_file("/moved/a").exists());
    assert!(fx.meta_file("/moved/sub/b").exists());
}

#[test]
fn test_rename_dir_rejects_file() {
    let fx = Fixture::new();
    fx.create_file("/plain", b"x");
    assert!(fx.cache.rename_dir("/plain", "/other").is_err());
    assert!(fx.cache.rename_file("/", "/x").is_err());
}
