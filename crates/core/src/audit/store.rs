use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::audit::{AuditError, AuditRecord};

/// Durable, append-only storage for chained records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Commits every record or none of them.
    async fn append_batch(&self, records: &[AuditRecord]) -> Result<(), AuditError>;
    async fn load_all(&self) -> Result<Vec<AuditRecord>, AuditError>;
    async fn range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>, AuditError>;
    async fn last(&self) -> Result<Option<AuditRecord>, AuditError>;
}

#[derive(Clone, Default)]
pub struct InMemoryAuditStore {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn overwrite_payload(&self, sequence: u64, payload: String) {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|record| record.sequence == sequence) {
            record.payload = payload;
        }
    }

    #[cfg(test)]
    pub(crate) async fn truncate(&self, len: usize) {
        self.records.write().await.truncate(len);
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append_batch(&self, batch: &[AuditRecord]) -> Result<(), AuditError> {
        let mut records = self.records.write().await;
        let mut expected = records.last().map_or(1, |record| record.sequence + 1);
        for record in batch {
            if record.sequence != expected {
                return Err(AuditError::Storage(format!(
                    "sequence conflict: expected {expected}, got {}",
                    record.sequence
                )));
            }
            expected += 1;
        }
        records.extend_from_slice(batch);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.records.read().await.clone())
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>, AuditError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|record| record.sequence >= from && record.sequence <= to)
            .cloned()
            .collect())
    }

    async fn last(&self) -> Result<Option<AuditRecord>, AuditError> {
        Ok(self.records.read().await.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::{AuditStore, InMemoryAuditStore};
    use crate::audit::{AuditError, AuditRecord};

    fn record(sequence: u64) -> AuditRecord {
        AuditRecord {
            sequence,
            previous_hash: String::new(),
            payload: "{}".to_owned(),
            hash: format!("h{sequence}"),
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn batches_must_continue_the_sequence() {
        let store = InMemoryAuditStore::new();
        store.append_batch(&[record(1), record(2)]).await.expect("first batch");

        let conflict = store.append_batch(&[record(4)]).await;
        assert!(matches!(conflict, Err(AuditError::Storage(_))));
        assert_eq!(store.len().await, 2);

        store.append_batch(&[record(3)]).await.expect("second batch");
        let ranged = store.range(2, 3).await.expect("range");
        assert_eq!(ranged.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(store.last().await.expect("last").map(|r| r.sequence), Some(3));
    }

    #[tokio::test]
    async fn rejected_batch_commits_nothing() {
        let store = InMemoryAuditStore::new();
        let result = store.append_batch(&[record(1), record(3)]).await;
        assert!(result.is_err());
        assert!(store.is_empty().await);
    }
}
