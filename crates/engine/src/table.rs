use msg::MessageSchema;
use parking_lot::RwLock;
use std::sync::Arc;

/// How a table's partitions are stored and replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStorage {
    /// Incremental writes buffered in arenas, flushed to table files and
    /// compacted over time.
    Lsm,
    /// One column file per partition, replaced wholesale.
    Static,
}

/// Table metadata shared by all partitions of one table.
#[derive(Debug)]
pub struct Table {
    namespace: String,
    name: String,
    storage: TableStorage,
    schema: RwLock<Arc<MessageSchema>>,
}

impl Table {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        schema: MessageSchema,
        storage: TableStorage,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            storage,
            schema: RwLock::new(Arc::new(schema)),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> TableStorage {
        self.storage
    }

    /// Current row schema. Callers keep the returned handle for the whole
    /// operation so a concurrent [`update_schema`](Self::update_schema) does
    /// not change it mid-flight.
    pub fn schema(&self) -> Arc<MessageSchema> {
        self.schema.read().clone()
    }

    /// Replaces the row schema. Existing table files keep their columns;
    /// compaction fills new optional columns with nulls.
    pub fn update_schema(&self, schema: MessageSchema) {
        *self.schema.write() = Arc::new(schema);
    }
}
