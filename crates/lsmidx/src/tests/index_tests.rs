use crate::*;
use anyhow::Result;
use arena::{RecordId, Sha1Hash};
use std::collections::{BTreeMap, HashMap};
use tempfile::tempdir;

fn id(s: &str) -> RecordId {
    Sha1Hash::compute(s)
}

fn vmap(entries: &[(&str, u64)]) -> BTreeMap<RecordId, u64> {
    entries.iter().map(|(k, v)| (id(k), *v)).collect()
}

#[test]
fn write_then_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.idx");
    LsmTableIndex::write(&vmap(&[("a", 1), ("b", 5), ("c", 2)]), &path)?;

    let idx = LsmTableIndex::open(&path)?;
    assert_eq!(idx.len(), 3);
    assert_eq!(idx.get(&id("b")), Some(5));
    assert_eq!(idx.get(&id("zzz")), None);
    assert!(!dir.path().join("t.idx.tmp").exists());
    Ok(())
}

#[test]
fn empty_index() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("e.idx");
    LsmTableIndex::write(&BTreeMap::new(), &path)?;
    let idx = LsmTableIndex::open(&path)?;
    assert!(idx.is_empty());
    Ok(())
}

#[test]
fn lookup_only_raises_present_candidates() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.idx");
    LsmTableIndex::write(&vmap(&[("a", 3), ("b", 1), ("c", 9)]), &path)?;
    let idx = LsmTableIndex::open(&path)?;

    let mut candidates: HashMap<RecordId, u64> =
        [(id("a"), 0), (id("b"), 4), (id("x"), 2)].into_iter().collect();
    idx.lookup(&mut candidates);

    assert_eq!(candidates[&id("a")], 3);
    assert_eq!(candidates[&id("b")], 4);
    assert_eq!(candidates[&id("x")], 2);
    assert!(!candidates.contains_key(&id("c")));
    Ok(())
}

#[test]
fn list_keeps_first_sighting() -> Result<()> {
    let dir = tempdir()?;
    let newer = dir.path().join("newer.idx");
    let older = dir.path().join("older.idx");
    LsmTableIndex::write(&vmap(&[("a", 7)]), &newer)?;
    LsmTableIndex::write(&vmap(&[("a", 2), ("b", 1)]), &older)?;

    let mut out = HashMap::new();
    LsmTableIndex::open(&newer)?.list(&mut out);
    LsmTableIndex::open(&older)?.list(&mut out);

    assert_eq!(out.len(), 2);
    assert_eq!(out[&id("a")], 7);
    assert_eq!(out[&id("b")], 1);
    Ok(())
}

#[test]
fn corrupt_index_is_an_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.idx");
    LsmTableIndex::write(&vmap(&[("a", 1)]), &path)?;

    let mut data = std::fs::read(&path)?;
    data[14] ^= 0x01;
    std::fs::write(&path, &data)?;

    let err = LsmTableIndex::open(&path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::ChecksumMismatch { .. })
    ));
    Ok(())
}

#[test]
fn missing_index_is_an_error() -> Result<()> {
    let dir = tempdir()?;
    assert!(LsmTableIndex::open(&dir.path().join("none.idx")).is_err());
    Ok(())
}
