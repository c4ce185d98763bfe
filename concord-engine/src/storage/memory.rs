//! In-memory operation log and snapshot store.
//!
//! Backs tests and single-process setups; the RocksDB store in
//! [`rocks`](super::rocks) is the durable equivalent.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::{OperationLog, OperationRecord, Snapshot, SnapshotStore, StoreError};

/// Non-durable store holding both the operation log and snapshots.
#[derive(Default)]
pub struct MemoryStore {
    operations: RwLock<HashMap<Uuid, Vec<OperationRecord>>>,
    snapshots: RwLock<HashMap<Uuid, Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total records stored for a document.
    pub async fn operation_count(&self, doc_id: Uuid) -> usize {
        self.operations
            .read()
            .await
            .get(&doc_id)
            .map_or(0, Vec::len)
    }
}

impl OperationLog for MemoryStore {
    async fn operations_since(
        &self,
        doc_id: Uuid,
        version: u64,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let operations = self.operations.read().await;
        Ok(operations
            .get(&doc_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.version > version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_operation(&self, record: OperationRecord) -> Result<(), StoreError> {
        let mut operations = self.operations.write().await;
        let records = operations.entry(record.doc_id).or_default();
        let expected = records.last().map_or(0, |r| r.version) + 1;
        if record.version != expected {
            return Err(StoreError::VersionConflict {
                expected,
                got: record.version,
            });
        }
        records.push(record);
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    async fn latest_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshots.read().await.get(&doc_id).cloned())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.doc_id, snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_ot::Operation;

    fn record(doc_id: Uuid, version: u64) -> OperationRecord {
        let mut op = Operation::new();
        op.insert("x");
        OperationRecord {
            doc_id,
            version,
            client_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            operation: op,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_since() {
        let store = MemoryStore::new();
        let doc_id = Uuid::new_v4();

        for v in 1..=5 {
            store.save_operation(record(doc_id, v)).await.unwrap();
        }

        let all = store.operations_since(doc_id, 0).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].version, 1);

        let tail = store.operations_since(doc_id, 3).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version, 4);
        assert_eq!(tail[1].version, 5);
    }

    #[tokio::test]
    async fn test_unknown_document_is_empty() {
        let store = MemoryStore::new();
        let records = store.operations_since(Uuid::new_v4(), 0).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_version_gap() {
        let store = MemoryStore::new();
        let doc_id = Uuid::new_v4();

        store.save_operation(record(doc_id, 1)).await.unwrap();
        let result = store.save_operation(record(doc_id, 3)).await;
        assert_eq!(
            result,
            Err(StoreError::VersionConflict { expected: 2, got: 3 })
        );

        // A duplicate append is rejected the same way.
        let result = store.save_operation(record(doc_id, 1)).await;
        assert_eq!(
            result,
            Err(StoreError::VersionConflict { expected: 2, got: 1 })
        );
    }

    #[tokio::test]
    async fn test_snapshot_latest_wins() {
        let store = MemoryStore::new();
        let doc_id = Uuid::new_v4();

        assert_eq!(store.latest_snapshot(doc_id).await.unwrap(), None);

        store
            .save_snapshot(Snapshot {
                doc_id,
                version: 5,
                content: "five".into(),
            })
            .await
            .unwrap();
        store
            .save_snapshot(Snapshot {
                doc_id,
                version: 10,
                content: "ten".into(),
            })
            .await
            .unwrap();

        let latest = store.latest_snapshot(doc_id).await.unwrap().unwrap();
        assert_eq!(latest.version, 10);
        assert_eq!(latest.content, "ten");
    }
}
