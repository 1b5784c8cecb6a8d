use crate::*;
use anyhow::Result;
use arena::Sha1Hash;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

#[test]
fn lookup_memoizes() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.idx");
    let mut vmap = BTreeMap::new();
    vmap.insert(Sha1Hash::compute("a"), 1);
    LsmTableIndex::write(&vmap, &path)?;

    let cache = IndexCache::new();
    let first = cache.lookup(&path)?;
    let second = cache.lookup(&path)?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);
    Ok(())
}

#[test]
fn flush_evicts_and_reload_sees_new_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.idx");
    let key = Sha1Hash::compute("a");

    let mut vmap = BTreeMap::new();
    vmap.insert(key, 1);
    LsmTableIndex::write(&vmap, &path)?;

    let cache = IndexCache::new();
    let held = cache.lookup(&path)?;

    vmap.insert(key, 2);
    LsmTableIndex::write(&vmap, &path)?;
    cache.flush(&path);
    assert!(cache.is_empty());

    assert_eq!(cache.lookup(&path)?.get(&key), Some(2));
    assert_eq!(held.get(&key), Some(1));
    Ok(())
}

#[test]
fn lookup_of_missing_file_fails_and_caches_nothing() -> Result<()> {
    let dir = tempdir()?;
    let cache = IndexCache::new();
    assert!(cache.lookup(&dir.path().join("none.idx")).is_err());
    assert!(cache.is_empty());
    Ok(())
}

#[test]
fn concurrent_lookup_and_flush() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.idx");
    let mut vmap = BTreeMap::new();
    vmap.insert(Sha1Hash::compute("a"), 1);
    LsmTableIndex::write(&vmap, &path)?;

    let cache = Arc::new(IndexCache::new());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = cache.clone();
            let path = path.clone();
            thread::spawn(move || -> Result<()> {
                for _ in 0..100 {
                    if i % 2 == 0 {
                        cache.lookup(&path)?;
                    } else {
                        cache.flush(&path);
                    }
                }
                Ok(())
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked")?;
    }
    assert_eq!(cache.lookup(&path)?.len(), 1);
    Ok(())
}

#[test]
fn load_racing_delete_is_not_cached() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.idx");
    let mut vmap = BTreeMap::new();
    vmap.insert(Sha1Hash::compute("a"), 1);

    let cache = Arc::new(IndexCache::new());
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let loader = {
        let (cache, path, done) = (cache.clone(), path.clone(), done.clone());
        thread::spawn(move || {
            while !done.load(std::sync::atomic::Ordering::Acquire) {
                // Misses while the file is gone are expected.
                let _ = cache.lookup(&path);
            }
        })
    };

    for _ in 0..200 {
        LsmTableIndex::write(&vmap, &path)?;
        std::fs::remove_file(&path)?;
        cache.flush(&path);
    }
    done.store(true, std::sync::atomic::Ordering::Release);
    loader.join().expect("loader panicked");

    assert!(!path.exists());
    assert!(cache.is_empty());
    Ok(())
}
