use super::helpers::*;
use crate::*;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

/// Applies uploaded batches to a partition standing in for the peer.
struct ForwardingTransport {
    peer: Arc<Partition>,
}

impl ReplicaTransport for ForwardingTransport {
    fn upload_batch(&self, _addr: &str, batch: &RecordEnvelopeList) -> Result<()> {
        self.peer
            .apply_replicated(RecordEnvelopeList::decode(&batch.encode()?)?)?;
        Ok(())
    }

    fn partition_info(
        &self,
        _addr: &str,
        _partition: PartitionAddr<'_>,
    ) -> Result<Option<PartitionInfo>> {
        Ok(Some(self.peer.info()))
    }

    fn upload_table(
        &self,
        _: &str,
        _: PartitionAddr<'_>,
        version: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        self.peer.update_cstable(&data, version)?;
        Ok(())
    }
}

fn remote(name: &str) -> ReplicaRef {
    ReplicaRef::new(Sha1Hash::compute(name), name, false)
}

fn scheme(replicas: Vec<ReplicaRef>) -> Arc<dyn ReplicationScheme> {
    Arc::new(FixedReplicationScheme::new(replicas))
}

fn fill(p: &Partition, n: usize) -> Result<()> {
    let names: Vec<String> = (0..n).map(|i| format!("rec-{:04}", i)).collect();
    let batch: Vec<(&str, u64)> = names.iter().map(|n| (n.as_str(), 1)).collect();
    insert(p, &batch)?;
    p.writer().commit()?;
    Ok(())
}

fn open_peer(db: &Path) -> Result<Arc<Partition>> {
    let ctx = EngineContext::new(test_config());
    Partition::create(lsm_table(), partition_key(), db, &ctx)
}

// --------------------- Batching ---------------------

#[test]
fn replicate_ships_all_rows_in_bounded_batches() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config().with_replication_batch(8, 1 << 20))?;
    fill(&p, 100)?;

    let transport = Arc::new(RecordingTransport::default());
    let r1 = remote("node-1:9000");
    let replication = p.replication(scheme(vec![r1.clone()]), transport.clone());

    assert!(replication.needs_replication());
    assert_eq!(replication.num_full_remote_copies(), 0);
    assert!(replication.replicate()?);

    let sizes = transport.batch_sizes(&r1.addr);
    assert_eq!(sizes.iter().sum::<usize>(), 100);
    assert!(sizes.iter().all(|&s| s > 0 && s <= 8));
    assert_eq!(sizes.len(), 13);

    let batches = transport.batches.lock();
    let envelope = &batches[0].1.records[0];
    assert_eq!(envelope.tsdb_namespace, NAMESPACE);
    assert_eq!(envelope.table_name, TABLE);
    assert_eq!(envelope.partition_key()?, partition_key());
    drop(batches);

    let state = p.writer().fetch_replication_state();
    assert_eq!(state.replicated_offset_for(&r1.unique_id), 100);
    assert!(!replication.needs_replication());
    assert_eq!(replication.num_full_remote_copies(), 1);
    Ok(())
}

#[test]
fn byte_limit_splits_batches() -> Result<()> {
    let dir = tempdir()?;
    let row = payload("rec-0000", 1).len();
    let (p, _) = create_partition(
        dir.path(),
        test_config().with_replication_batch(1000, row * 3),
    )?;
    fill(&p, 10)?;

    let transport = Arc::new(RecordingTransport::default());
    let r1 = remote("node-1:9000");
    assert!(p.replication(scheme(vec![r1.clone()]), transport.clone()).replicate()?);

    let sizes = transport.batch_sizes(&r1.addr);
    assert_eq!(sizes, vec![3, 3, 3, 1]);
    Ok(())
}

#[test]
fn oversized_record_travels_alone() -> Result<()> {
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config().with_replication_batch(1000, 1))?;
    fill(&p, 3)?;

    let transport = Arc::new(RecordingTransport::default());
    let r1 = remote("node-1:9000");
    assert!(p.replication(scheme(vec![r1.clone()]), transport.clone()).replicate()?);
    assert_eq!(transport.batch_sizes(&r1.addr), vec![1, 1, 1]);
    Ok(())
}

// --------------------- Offsets ---------------------

#[test]
fn failed_replica_keeps_its_offset() -> Result<()> {
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config())?;
    fill(&p, 5)?;

    let good = remote("good:9000");
    let bad = remote("bad:9000");
    let transport = Arc::new(RecordingTransport::failing(&["bad:9000"]));
    let replication = p.replication(scheme(vec![good.clone(), bad.clone()]), transport.clone());

    assert!(!replication.replicate()?);

    let state = p.writer().fetch_replication_state();
    assert_eq!(state.replicated_offset_for(&good.unique_id), 5);
    assert_eq!(state.replicated_offset_for(&bad.unique_id), 0);
    assert!(replication.needs_replication());
    assert_eq!(replication.num_full_remote_copies(), 1);
    Ok(())
}

#[test]
fn replication_resumes_from_offset() -> Result<()> {
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config())?;
    let r1 = remote("node-1:9000");
    let transport = Arc::new(RecordingTransport::default());

    fill(&p, 4)?;
    assert!(p.replication(scheme(vec![r1.clone()]), transport.clone()).replicate()?);

    insert(&p, &[("late", 1)])?;
    p.writer().commit()?;
    assert!(p.replication(scheme(vec![r1.clone()]), transport.clone()).replicate()?);

    let batches = transport.batches.lock();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].1.len(), 1);
    assert_eq!(batches[1].1.records[0].record_id, id("late").to_hex());
    drop(batches);

    assert_eq!(
        p.writer()
            .fetch_replication_state()
            .replicated_offset_for(&r1.unique_id),
        5
    );
    Ok(())
}

#[test]
fn uncommitted_records_are_not_replicated() -> Result<()> {
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config())?;
    insert(&p, &[("pending", 1)])?;

    let transport = Arc::new(RecordingTransport::default());
    let replication = p.replication(scheme(vec![remote("node-1:9000")]), transport.clone());
    assert!(!replication.needs_replication());
    assert!(replication.replicate()?);
    assert!(transport.batches.lock().is_empty());
    Ok(())
}

#[test]
fn local_replicas_are_skipped() -> Result<()> {
    let dir = tempdir()?;
    let (p, ctx) = create_partition(dir.path(), test_config())?;
    fill(&p, 2)?;

    let local = ReplicaRef::new(Sha1Hash::compute("me"), "me:9000", true);
    let transport = Arc::new(RecordingTransport::default());
    let replication = p.replication(scheme(vec![local.clone()]), transport.clone());
    assert!(!replication.needs_replication());
    assert!(replication.replicate()?);
    assert!(transport.batches.lock().is_empty());

    // Asking for it explicitly is a caller bug.
    let direct = LsmPartitionReplication::new(
        p.snapshot(),
        p.table().clone(),
        p.writer(),
        ctx.idx_cache.clone(),
        scheme(vec![]),
        transport,
        &ctx.config,
    );
    let err = direct.replicate_to(&local, 0).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PartitionError>(),
        Some(PartitionError::IllegalState(_))
    ));
    Ok(())
}

#[test]
fn standalone_scheme_has_nothing_to_do() -> Result<()> {
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config())?;
    fill(&p, 3)?;

    let standalone = StandaloneReplicationScheme;
    assert!(standalone.has_local_replica(&partition_key()));
    assert!(standalone.replicas_for(&partition_key()).is_empty());

    let transport = Arc::new(RecordingTransport::default());
    let replication = p.replication(Arc::new(standalone), transport);
    assert!(!replication.needs_replication());
    assert!(replication.replicate()?);
    assert_eq!(replication.num_full_remote_copies(), 0);
    Ok(())
}

// --------------------- End to end ---------------------

#[test]
fn replica_converges_and_redelivery_is_harmless() -> Result<()> {
    let src_dir = tempdir()?;
    let peer_dir = tempdir()?;
    let config = test_config().with_replication_batch(4, 1 << 20);
    let (p, _) = create_partition(src_dir.path(), config)?;
    let peer = open_peer(peer_dir.path())?;

    insert(&p, &[("a", 1), ("b", 1), ("c", 1)])?;
    p.writer().commit()?;
    insert(&p, &[("a", 3), ("d", 2)])?;
    p.writer().commit()?;

    let transport: Arc<dyn ReplicaTransport> = Arc::new(ForwardingTransport { peer: peer.clone() });
    let r1 = remote("peer:9000");
    let replication = p.replication(scheme(vec![r1.clone()]), transport.clone());
    assert!(replication.replicate()?);
    assert_eq!(read_all(&peer)?, read_all(&p)?);

    // Re-sending everything from offset zero changes nothing.
    let direct = LsmPartitionReplication::new(
        p.snapshot(),
        p.table().clone(),
        p.writer(),
        Arc::new(lsmidx::IndexCache::new()),
        scheme(vec![]),
        transport,
        &test_config(),
    );
    direct.replicate_to(&r1, 0)?;
    assert_eq!(read_all(&peer)?, read_all(&p)?);
    assert_eq!(peer.lsm_reader()?.count_records()?, 4);
    Ok(())
}

#[test]
fn envelopes_for_another_partition_are_refused() -> Result<()> {
    let dir = tempdir()?;
    let (p, _) = create_partition(dir.path(), test_config())?;

    let batch = RecordEnvelopeList {
        records: vec![RecordEnvelope {
            tsdb_namespace: NAMESPACE.to_string(),
            table_name: TABLE.to_string(),
            partition_key: Sha1Hash::compute("elsewhere").to_hex(),
            record_id: id("a").to_hex(),
            record_version: 1,
            record_data: payload("a", 1),
        }],
    };
    let err = p.apply_replicated(batch).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PartitionError>(),
        Some(PartitionError::IllegalState(_))
    ));
    assert_eq!(read_all(&p)?.len(), 0);
    Ok(())
}

#[test]
fn http_transport_uses_configured_timeout() -> Result<()> {
    let config = test_config().with_replication_timeout(std::time::Duration::from_millis(250));
    let transport = HttpTransport::from_config(&config)?;

    // Nothing listens on port 1, so the upload fails instead of hanging.
    let batch = RecordEnvelopeList { records: Vec::new() };
    let err = transport.upload_batch("127.0.0.1:1", &batch).unwrap_err();
    assert!(err.to_string().contains("127.0.0.1:1"));
    Ok(())
}
