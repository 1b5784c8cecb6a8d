use anyhow::{Context, Result};
use arena::{Record, Sha1Hash};
use config::EngineConfig;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::PartitionError;

/// One record shipped to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub tsdb_namespace: String,
    pub table_name: String,
    /// Hex encoded partition key.
    pub partition_key: String,
    /// Hex encoded record id.
    pub record_id: String,
    pub record_version: u64,
    pub record_data: Vec<u8>,
}

impl RecordEnvelope {
    pub fn partition_key(&self) -> Result<Sha1Hash> {
        let key = Sha1Hash::from_hex(&self.partition_key).ok_or_else(|| {
            PartitionError::Corrupt(format!("bad partition key {}", self.partition_key))
        })?;
        Ok(key)
    }

    /// Converts back into a record for the receiving partition's insert path.
    pub fn into_record(self) -> Result<Record> {
        let id = Sha1Hash::from_hex(&self.record_id)
            .ok_or_else(|| PartitionError::Corrupt(format!("bad record id {}", self.record_id)))?;
        Ok(Record::new(id, self.record_version, self.record_data))
    }
}

/// Body of one replication request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEnvelopeList {
    pub records: Vec<RecordEnvelope>,
}

impl RecordEnvelopeList {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).context("failed to decode record envelopes")
    }
}

/// Summary of a partition, as answered by the partition info RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_key: Sha1Hash,
    pub table_key: String,
    pub namespace: String,
    pub uuid: Uuid,
    pub lsm_sequence: u64,
    pub cstable_version: u64,
    pub num_tables: usize,
    /// `sha1("<partition key hex>~<lsm_sequence>")`.
    pub checksum: Sha1Hash,
    pub exists: bool,
}

/// Identifies a partition on a remote node.
#[derive(Debug, Clone, Copy)]
pub struct PartitionAddr<'a> {
    pub namespace: &'a str,
    pub table: &'a str,
    pub partition_key: &'a Sha1Hash,
}

/// Network calls made by replication. Implementations block until the
/// peer answers or the request times out.
pub trait ReplicaTransport: Send + Sync {
    /// Pushes a batch of records. Anything but `201 Created` is an error.
    fn upload_batch(&self, addr: &str, batch: &RecordEnvelopeList) -> Result<()>;

    /// Fetches the peer's view of a partition, `None` if it doesn't know it.
    fn partition_info(
        &self,
        addr: &str,
        partition: PartitionAddr<'_>,
    ) -> Result<Option<PartitionInfo>>;

    /// Uploads a complete column table at `version`.
    fn upload_table(
        &self,
        addr: &str,
        partition: PartitionAddr<'_>,
        version: u64,
        data: Vec<u8>,
    ) -> Result<()>;
}

/// [`ReplicaTransport`] over HTTP.
///
/// ```text
/// POST /tsdb/replicate                                          bincode RecordEnvelopeList -> 201
/// GET  /tsdb/partition_info?namespace=&table=&partition=        -> 200 JSON PartitionInfo | 404
/// POST /tsdb/update_cstable?namespace=&table=&partition=&version=  raw cstable -> 201
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build replication http client")?;
        Ok(Self { client })
    }

    /// A transport using the configured replication timeout.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(config.replication_timeout)
    }

    fn check_created(addr: &str, resp: reqwest::blocking::Response) -> Result<()> {
        let status = resp.status();
        if status == StatusCode::CREATED {
            return Ok(());
        }
        let body = resp.text().unwrap_or_default();
        Err(PartitionError::Replication {
            addr: addr.to_string(),
            status: status.as_u16(),
            body,
        }
        .into())
    }
}

impl ReplicaTransport for HttpTransport {
    fn upload_batch(&self, addr: &str, batch: &RecordEnvelopeList) -> Result<()> {
        let resp = self
            .client
            .post(format!("http://{}/tsdb/replicate", addr))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(batch.encode()?)
            .send()
            .with_context(|| format!("replication request to {} failed", addr))?;
        Self::check_created(addr, resp)
    }

    fn partition_info(
        &self,
        addr: &str,
        partition: PartitionAddr<'_>,
    ) -> Result<Option<PartitionInfo>> {
        let resp = self
            .client
            .get(format!("http://{}/tsdb/partition_info", addr))
            .query(&[
                ("namespace", partition.namespace.to_string()),
                ("table", partition.table.to_string()),
                ("partition", partition.partition_key.to_hex()),
            ])
            .send()
            .with_context(|| format!("partition info request to {} failed", addr))?;

        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json()?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(PartitionError::Replication {
                addr: addr.to_string(),
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            }
            .into()),
        }
    }

    fn upload_table(
        &self,
        addr: &str,
        partition: PartitionAddr<'_>,
        version: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        let resp = self
            .client
            .post(format!("http://{}/tsdb/update_cstable", addr))
            .query(&[
                ("namespace", partition.namespace.to_string()),
                ("table", partition.table.to_string()),
                ("partition", partition.partition_key.to_hex()),
                ("version", version.to_string()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .with_context(|| format!("cstable upload to {} failed", addr))?;
        Self::check_created(addr, resp)
    }
}
