//! Integration tests for persistent map lifecycle across process-like
//! restarts (reopening a new `Map` over the same files, standing in for a
//! real process restart within one test binary).

use hedgehog::{Map, MapOptions};
use std::path::PathBuf;

fn persistent_options(dir: &std::path::Path, name: &str) -> MapOptions {
    MapOptions {
        data_path: Some(dir.to_path_buf()),
        name: name.to_string(),
        is_persistent: true,
        concurrency_factor: 4,
        ..MapOptions::default()
    }
}

#[test]
fn reopen_after_force_preserves_small_dataset() {
    let dir = tempfile::tempdir().unwrap();
    {
        let map = Map::open(persistent_options(dir.path(), "small")).unwrap();
        for i in 0..20u32 {
            map.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        map.force().unwrap();
    }
    let reopened = Map::open(persistent_options(dir.path(), "small")).unwrap();
    assert_eq!(reopened.size().unwrap(), 20);
    for i in 0..20u32 {
        assert_eq!(
            reopened.get(format!("k{i}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
}

#[test]
fn reopen_preserves_dataset_through_a_grow() {
    let dir = tempfile::tempdir().unwrap();
    let options = MapOptions {
        concurrency_factor: 1,
        initial_file_size: 64 * 1024,
        ..persistent_options(dir.path(), "grown")
    };
    {
        let map = Map::open(options.clone()).unwrap();
        for i in 0..2048u32 {
            map.put(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        map.force().unwrap();
    }
    let reopened = Map::open(options).unwrap();
    assert_eq!(reopened.size().unwrap(), 2048);
    for i in 0..2048u32 {
        assert_eq!(
            reopened.get(format!("key-{i}").as_bytes()).unwrap(),
            Some(format!("value-{i}").into_bytes())
        );
    }
}

#[test]
fn reopen_after_removals_does_not_resurrect_deleted_keys() {
    let dir = tempfile::tempdir().unwrap();
    let options = persistent_options(dir.path(), "removed");
    {
        let map = Map::open(options.clone()).unwrap();
        for i in 0..30u32 {
            map.put(format!("k{i}").as_bytes(), b"v").unwrap();
        }
        for i in 0..15u32 {
            map.remove(format!("k{i}").as_bytes()).unwrap();
        }
        map.force().unwrap();
    }
    let reopened = Map::open(options).unwrap();
    assert_eq!(reopened.size().unwrap(), 15);
    for i in 0..15u32 {
        assert_eq!(reopened.get(format!("k{i}").as_bytes()).unwrap(), None);
    }
    for i in 15..30u32 {
        assert_eq!(reopened.get(format!("k{i}").as_bytes()).unwrap(), Some(b"v".to_vec()));
    }
}

#[test]
fn put_after_reopen_does_not_corrupt_existing_entries() {
    let dir = tempfile::tempdir().unwrap();
    let options = persistent_options(dir.path(), "resume");
    {
        let map = Map::open(options.clone()).unwrap();
        for i in 0..40u32 {
            map.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        map.force().unwrap();
    }
    let reopened = Map::open(options).unwrap();
    for i in 0..20u32 {
        reopened
            .put(format!("new{i}").as_bytes(), format!("nv{i}").as_bytes())
            .unwrap();
    }
    assert_eq!(reopened.size().unwrap(), 60);
    for i in 0..40u32 {
        assert_eq!(
            reopened.get(format!("k{i}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
    for i in 0..20u32 {
        assert_eq!(
            reopened.get(format!("new{i}").as_bytes()).unwrap(),
            Some(format!("nv{i}").into_bytes())
        );
    }
}

#[test]
fn compact_on_persistent_map_shrinks_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let options = persistent_options(dir.path(), "compacted");
    {
        let map = Map::open(options.clone()).unwrap();
        for i in 0..200u32 {
            map.put(format!("k{i}").as_bytes(), b"value").unwrap();
        }
        for i in 0..190u32 {
            map.remove(format!("k{i}").as_bytes()).unwrap();
        }
        map.compact().unwrap();
        assert_eq!(map.size().unwrap(), 10);
        map.force().unwrap();
    }
    let reopened = Map::open(options).unwrap();
    assert_eq!(reopened.size().unwrap(), 10);
    for i in 190..200u32 {
        assert_eq!(
            reopened.get(format!("k{i}").as_bytes()).unwrap(),
            Some(b"value".to_vec())
        );
    }
}

#[test]
fn separate_names_under_same_directory_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let a = Map::open(persistent_options(dir.path(), "tenant-a")).unwrap();
    let b = Map::open(persistent_options(dir.path(), "tenant-b")).unwrap();
    a.put(b"shared-key", b"from-a").unwrap();
    b.put(b"shared-key", b"from-b").unwrap();
    assert_eq!(a.get(b"shared-key").unwrap(), Some(b"from-a".to_vec()));
    assert_eq!(b.get(b"shared-key").unwrap(), Some(b"from-b".to_vec()));
}

#[test]
fn ephemeral_map_requires_no_data_path() {
    let map = Map::open(MapOptions::default()).unwrap();
    map.put(b"k", b"v").unwrap();
    assert_eq!(map.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn persistent_without_data_path_is_rejected() {
    let options = MapOptions {
        is_persistent: true,
        data_path: None::<PathBuf>,
        ..MapOptions::default()
    };
    assert!(Map::open(options).is_err());
}
