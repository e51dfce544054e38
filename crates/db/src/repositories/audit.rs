use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use gatehouse_core::audit::{AuditError, AuditRecord, AuditStore};

use super::RepositoryError;
use crate::DbPool;

const SELECT_RECORDS: &str = "SELECT
        sequence,
        previous_hash,
        payload_json,
        record_hash,
        signature
     FROM audit_record";

pub struct SqlAuditStore {
    pool: DbPool,
}

impl SqlAuditStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_batch(&self, records: &[AuditRecord]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM audit_record").fetch_one(&mut *tx).await?;
        let mut expected = match last {
            Some(value) => parse_sequence("sequence", value)? + 1,
            None => 1,
        };

        let committed_at = Utc::now().to_rfc3339();
        for record in records {
            if record.sequence != expected {
                return Err(RepositoryError::SequenceConflict {
                    expected,
                    actual: record.sequence,
                });
            }
            sqlx::query(
                "INSERT INTO audit_record (
                    sequence,
                    previous_hash,
                    payload_json,
                    record_hash,
                    signature,
                    committed_at
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(to_column(record.sequence)?)
            .bind(&record.previous_hash)
            .bind(&record.payload)
            .bind(&record.hash)
            .bind(&record.signature)
            .bind(&committed_at)
            .execute(&mut *tx)
            .await?;
            expected += 1;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_all(&self) -> Result<Vec<AuditRecord>, RepositoryError> {
        let rows = sqlx::query(&format!("{SELECT_RECORDS} ORDER BY sequence ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_RECORDS} WHERE sequence >= ? AND sequence <= ? ORDER BY sequence ASC"
        ))
        .bind(to_column(from)?)
        .bind(to_column(to.min(i64::MAX as u64))?)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn fetch_last(&self) -> Result<Option<AuditRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_RECORDS} ORDER BY sequence DESC LIMIT 1"))
            .fetch_optional(&self.pool)
            .await?;
        row.map(record_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl AuditStore for SqlAuditStore {
    async fn append_batch(&self, records: &[AuditRecord]) -> Result<(), AuditError> {
        if records.is_empty() {
            return Ok(());
        }
        Ok(self.insert_batch(records).await?)
    }

    async fn load_all(&self) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.fetch_all().await?)
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>, AuditError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.fetch_range(from, to).await?)
    }

    async fn last(&self) -> Result<Option<AuditRecord>, AuditError> {
        Ok(self.fetch_last().await?)
    }
}

fn record_from_row(row: SqliteRow) -> Result<AuditRecord, RepositoryError> {
    Ok(AuditRecord {
        sequence: parse_sequence("sequence", row.try_get("sequence")?)?,
        previous_hash: row.try_get("previous_hash")?,
        payload: row.try_get("payload_json")?,
        hash: row.try_get("record_hash")?,
        signature: row.try_get("signature")?,
    })
}

fn parse_sequence(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u64): {value}"
        ))
    })
}

fn to_column(sequence: u64) -> Result<i64, RepositoryError> {
    i64::try_from(sequence)
        .map_err(|_| RepositoryError::Decode(format!("sequence {sequence} exceeds i64 range")))
}
