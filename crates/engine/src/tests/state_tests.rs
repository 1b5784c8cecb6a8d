use super::helpers::*;
use crate::state::SNAPSHOT_FILENAME;
use crate::*;
use anyhow::Result;
use tempfile::tempdir;
use uuid::Uuid;

#[test]
fn state_save_load_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let mut state = PartitionState::new(NAMESPACE, TABLE, partition_key());
    state.lsm_sequence = 42;
    state.lsm_generation = 3;
    state.lsm_tables.push(LsmTableRef {
        filename: "00000000000000aa".to_string(),
        first_sequence: 1,
        last_sequence: 42,
    });
    state
        .replication_state
        .set_replicated_offset_for(Sha1Hash::compute("replica"), 40);

    state.save(dir.path(), true)?;
    assert!(dir.path().join(SNAPSHOT_FILENAME).exists());
    assert!(!dir.path().join("_snapshot.tmp").exists());

    let loaded = PartitionState::load(dir.path())?;
    assert_eq!(loaded, state);
    Ok(())
}

#[test]
fn state_file_is_readable_json() -> Result<()> {
    let dir = tempdir()?;
    let state = PartitionState::new(NAMESPACE, TABLE, partition_key());
    state.save(dir.path(), false)?;

    let text = std::fs::read_to_string(dir.path().join(SNAPSHOT_FILENAME))?;
    let json: serde_json::Value = serde_json::from_str(&text)?;
    assert_eq!(json["tsdb_namespace"], NAMESPACE);
    assert_eq!(json["partition_key"], partition_key().to_hex());
    assert_eq!(json["lsm_sequence"], 0);
    Ok(())
}

#[test]
fn garbage_state_fails_to_load() -> Result<()> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join(SNAPSHOT_FILENAME), b"not json")?;
    assert!(PartitionState::load(dir.path()).is_err());
    Ok(())
}

#[test]
fn new_states_get_distinct_incarnations() {
    let a = PartitionState::new(NAMESPACE, TABLE, partition_key());
    let b = PartitionState::new(NAMESPACE, TABLE, partition_key());
    assert_ne!(a.uuid, b.uuid);
    assert_eq!(a.replication_state.uuid, a.uuid);
}

#[test]
fn replicated_offset_defaults_to_zero() {
    let mut state = ReplicationState::new(Uuid::new_v4());
    let replica = Sha1Hash::compute("r1");
    assert_eq!(state.replicated_offset_for(&replica), 0);
    state.set_replicated_offset_for(replica, 17);
    assert_eq!(state.replicated_offset_for(&replica), 17);
}

#[test]
fn replication_state_is_persisted() -> Result<()> {
    let dir = tempdir()?;
    let (p, ctx) = create_partition(dir.path(), test_config())?;
    let w = p.writer();

    let mut state = w.fetch_replication_state();
    state.set_replicated_offset_for(Sha1Hash::compute("r1"), 9);
    w.commit_replication_state(state)?;
    drop(w);
    drop(p);

    let p = Partition::reopen(lsm_table(), partition_key(), dir.path(), &ctx)?;
    let state = p.writer().fetch_replication_state();
    assert_eq!(state.replicated_offset_for(&Sha1Hash::compute("r1")), 9);
    Ok(())
}

#[test]
fn stale_replication_state_does_not_regress_offsets() -> Result<()> {
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config())?;
    let w = p.writer();
    let (r1, r2) = (Sha1Hash::compute("r1"), Sha1Hash::compute("r2"));

    // Two passes start from the same empty state; the faster one finishes first.
    let mut stale = w.fetch_replication_state();
    let mut fresh = w.fetch_replication_state();
    fresh.set_replicated_offset_for(r1, 10);
    w.commit_replication_state(fresh)?;

    stale.set_replicated_offset_for(r1, 5);
    stale.set_replicated_offset_for(r2, 3);
    w.commit_replication_state(stale)?;

    let state = w.fetch_replication_state();
    assert_eq!(state.replicated_offset_for(&r1), 10);
    assert_eq!(state.replicated_offset_for(&r2), 3);
    Ok(())
}

#[test]
fn foreign_replication_state_is_ignored_and_refused() -> Result<()> {
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config())?;
    let w = p.writer();

    let mut foreign = ReplicationState::new(Uuid::new_v4());
    foreign.set_replicated_offset_for(Sha1Hash::compute("r1"), 100);

    let err = w.commit_replication_state(foreign.clone()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PartitionError>(),
        Some(PartitionError::IllegalState(_))
    ));

    // A state file carrying offsets of an earlier incarnation reads as empty.
    let base = p.base_path();
    let mut state = PartitionState::load(&base)?;
    state.replication_state = foreign;
    state.save(&base, false)?;
    let ctx = EngineContext::new(test_config());
    let p = Partition::reopen(lsm_table(), partition_key(), dir.path(), &ctx)?;
    let fetched = p.writer().fetch_replication_state();
    assert_eq!(fetched.uuid, p.snapshot().state.uuid);
    assert!(fetched.replicas.is_empty());
    Ok(())
}

#[test]
fn info_reflects_partition_state() -> Result<()> {
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config())?;
    insert(&p, &[("a", 1), ("b", 1)])?;
    p.writer().commit()?;

    let info = p.info();
    assert!(info.exists);
    assert_eq!(info.partition_key, partition_key());
    assert_eq!(info.namespace, NAMESPACE);
    assert_eq!(info.table_key, TABLE);
    assert_eq!(info.lsm_sequence, 2);
    assert_eq!(info.num_tables, 1);
    assert_eq!(info.uuid, p.snapshot().state.uuid);
    assert_eq!(
        info.checksum,
        Sha1Hash::compute(format!("{}~{}", partition_key(), 2))
    );
    Ok(())
}

