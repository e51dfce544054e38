use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{
    seal_record, verify_chain, AuditError, AuditPayload, AuditRecord, AuditSigner, AuditStore,
    ChainHead, ChainVerification,
};
use crate::config::AuditConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuditLogOptions {
    pub queue_capacity: usize,
    pub max_batch: usize,
}

impl Default for AuditLogOptions {
    fn default() -> Self {
        Self { queue_capacity: 1024, max_batch: 64 }
    }
}

impl From<&AuditConfig> for AuditLogOptions {
    fn from(config: &AuditConfig) -> Self {
        Self { queue_capacity: config.queue_capacity, max_batch: config.max_batch }
    }
}

enum WriterCommand {
    Append {
        payload: AuditPayload,
        respond_to: oneshot::Sender<Result<AuditRecord, AuditError>>,
    },
    /// Re-verifies the store and, when it is intact, rebuilds the head from
    /// its last record and unseals. Queued so it stays ordered with appends.
    Reopen { respond_to: oneshot::Sender<Result<ChainVerification, AuditError>> },
}

struct PendingAppend {
    payload: AuditPayload,
    respond_to: oneshot::Sender<Result<AuditRecord, AuditError>>,
}

/// Handle to the tamper-evident audit log. Cloning shares the same writer;
/// every append is serialized through one task, which owns the chain head.
#[derive(Clone)]
pub struct AuditLog {
    sender: mpsc::Sender<WriterCommand>,
    store: Arc<dyn AuditStore>,
    signer: AuditSigner,
    sealed: Arc<AtomicBool>,
}

impl AuditLog {
    /// Verifies the stored chain, then starts the writer. A broken chain does
    /// not fail the open; the log comes up sealed instead.
    pub async fn open(
        store: Arc<dyn AuditStore>,
        signer: AuditSigner,
        options: AuditLogOptions,
    ) -> Result<(Self, JoinHandle<()>), AuditError> {
        let records = store.load_all().await?;
        let verification = verify_chain(&records, &signer);
        let sealed = Arc::new(AtomicBool::new(!verification.valid));
        if verification.valid {
            info!(
                event_name = "audit.chain.verified",
                correlation_id = "audit-open",
                records = verification.verified_records,
                "audit chain verified at startup"
            );
        } else {
            error!(
                event_name = "audit.chain.integrity_failure",
                correlation_id = "audit-open",
                first_mismatch = ?verification.first_mismatch,
                reason = verification.failure_reason.as_deref().unwrap_or("unknown"),
                "audit chain failed verification; log sealed"
            );
        }

        let head = records.last().map(ChainHead::after).unwrap_or_else(ChainHead::genesis);
        let (sender, receiver) = mpsc::channel(options.queue_capacity.max(1));
        let writer = AuditWriter {
            receiver,
            store: Arc::clone(&store),
            signer: signer.clone(),
            head,
            max_batch: options.max_batch.max(1),
            sealed: Arc::clone(&sealed),
        };
        let handle = tokio::spawn(writer.run());

        Ok((Self { sender, store, signer, sealed }, handle))
    }

    /// Resolves once the record is durably committed.
    pub async fn append(&self, payload: AuditPayload) -> Result<AuditRecord, AuditError> {
        if self.is_sealed() {
            return Err(AuditError::Sealed);
        }
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(WriterCommand::Append { payload, respond_to })
            .await
            .map_err(|_| AuditError::WriterClosed)?;
        response.await.map_err(|_| AuditError::WriterClosed)?
    }

    pub async fn compensate(
        &self,
        original_sequence: u64,
        actor: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<AuditRecord, AuditError> {
        let existing = self.store.range(original_sequence, original_sequence).await?;
        if existing.is_empty() {
            return Err(AuditError::UnknownSequence(original_sequence));
        }
        self.append(AuditPayload::compensation(original_sequence, actor, reason)).await
    }

    /// Re-verifies the full chain. A failure seals the log.
    pub async fn verify_chain(&self) -> Result<ChainVerification, AuditError> {
        let verification = self.recompute().await?;
        if !verification.valid && !self.sealed.swap(true, Ordering::SeqCst) {
            error!(
                event_name = "audit.chain.integrity_failure",
                correlation_id = "audit-verify",
                first_mismatch = ?verification.first_mismatch,
                reason = verification.failure_reason.as_deref().unwrap_or("unknown"),
                "audit chain failed verification; log sealed"
            );
        }
        Ok(verification)
    }

    pub async fn range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>, AuditError> {
        if from > to {
            return Ok(Vec::new());
        }
        self.store.range(from, to).await
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Operator remediation: unseals only when the chain verifies again. The
    /// writer picks up the stored head, so a store restored from backup
    /// continues from its own last record.
    pub async fn reopen(&self) -> Result<ChainVerification, AuditError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(WriterCommand::Reopen { respond_to })
            .await
            .map_err(|_| AuditError::WriterClosed)?;
        response.await.map_err(|_| AuditError::WriterClosed)?
    }

    async fn recompute(&self) -> Result<ChainVerification, AuditError> {
        let records = self.store.load_all().await?;
        Ok(verify_chain(&records, &self.signer))
    }
}

struct AuditWriter {
    receiver: mpsc::Receiver<WriterCommand>,
    store: Arc<dyn AuditStore>,
    signer: AuditSigner,
    head: ChainHead,
    max_batch: usize,
    sealed: Arc<AtomicBool>,
}

impl AuditWriter {
    async fn run(mut self) {
        while let Some(first) = self.receiver.recv().await {
            let mut batch = Vec::new();
            let mut reopen = None;
            match first {
                WriterCommand::Append { payload, respond_to } => {
                    batch.push(PendingAppend { payload, respond_to })
                }
                WriterCommand::Reopen { respond_to } => reopen = Some(respond_to),
            }
            while reopen.is_none() && batch.len() < self.max_batch {
                match self.receiver.try_recv() {
                    Ok(WriterCommand::Append { payload, respond_to }) => {
                        batch.push(PendingAppend { payload, respond_to })
                    }
                    Ok(WriterCommand::Reopen { respond_to }) => reopen = Some(respond_to),
                    Err(_) => break,
                }
            }
            if !batch.is_empty() {
                self.commit(batch).await;
            }
            if let Some(respond_to) = reopen {
                let _ = respond_to.send(self.reopen().await);
            }
        }
        debug!(event_name = "audit.writer.stopped", "audit writer queue closed");
    }

    async fn reopen(&mut self) -> Result<ChainVerification, AuditError> {
        let records = self.store.load_all().await?;
        let verification = verify_chain(&records, &self.signer);
        if verification.valid {
            self.head = records.last().map(ChainHead::after).unwrap_or_else(ChainHead::genesis);
            self.sealed.store(false, Ordering::SeqCst);
            warn!(
                event_name = "audit.chain.reopened",
                correlation_id = "audit-reopen",
                records = verification.verified_records,
                next_sequence = self.head.next_sequence,
                "audit log unsealed after successful re-verification"
            );
        }
        Ok(verification)
    }

    async fn commit(&mut self, batch: Vec<PendingAppend>) {
        if self.sealed.load(Ordering::SeqCst) {
            for command in batch {
                let _ = command.respond_to.send(Err(AuditError::Sealed));
            }
            return;
        }

        let mut cursor = self.head.clone();
        let mut records = Vec::with_capacity(batch.len());
        let mut waiting = Vec::with_capacity(batch.len());
        for command in batch {
            match command.payload.to_canonical_json() {
                Ok(payload) => {
                    let record = seal_record(&cursor, payload, &self.signer);
                    cursor = ChainHead::after(&record);
                    records.push(record);
                    waiting.push(command.respond_to);
                }
                Err(error) => {
                    let _ = command.respond_to.send(Err(AuditError::Encoding(error.to_string())));
                }
            }
        }
        if records.is_empty() {
            return;
        }

        match self.store.append_batch(&records).await {
            Ok(()) => {
                debug!(
                    event_name = "audit.batch.committed",
                    size = records.len(),
                    last_sequence = cursor.next_sequence.saturating_sub(1),
                    "audit batch committed"
                );
                self.head = cursor;
                for (respond_to, record) in waiting.into_iter().zip(records) {
                    let _ = respond_to.send(Ok(record));
                }
            }
            Err(error) => {
                error!(
                    event_name = "audit.batch.commit_failed",
                    size = records.len(),
                    error = %error,
                    "audit batch commit failed; no sequence numbers consumed"
                );
                for respond_to in waiting {
                    let _ = respond_to.send(Err(error.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use secrecy::SecretString;

    use super::{AuditLog, AuditLogOptions};
    use crate::audit::{
        AuditError, AuditEventKind, AuditOutcome, AuditPayload, AuditRecord, AuditSigner,
        AuditStore, InMemoryAuditStore,
    };

    fn signer() -> AuditSigner {
        AuditSigner::new(SecretString::from("audit-signing-key-for-tests-0001".to_owned()))
    }

    fn payload(request_id: &str) -> AuditPayload {
        AuditPayload::new(
            AuditEventKind::AuthAttempted,
            request_id,
            "agent-101",
            AuditOutcome::Success,
        )
    }

    #[tokio::test]
    async fn concurrent_appends_receive_gap_free_sequences() {
        let store = InMemoryAuditStore::new();
        let (log, _writer) = AuditLog::open(
            Arc::new(store.clone()),
            signer(),
            AuditLogOptions { queue_capacity: 16, max_batch: 8 },
        )
        .await
        .expect("open");

        let mut tasks = Vec::new();
        for index in 0..64 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.append(payload(&format!("req-{index}"))).await
            }));
        }

        let mut sequences = BTreeSet::new();
        for task in tasks {
            let record = task.await.expect("join").expect("append");
            assert!(sequences.insert(record.sequence), "duplicate sequence");
        }
        assert_eq!(sequences.into_iter().collect::<Vec<_>>(), (1..=64).collect::<Vec<_>>());

        let verification = log.verify_chain().await.expect("verify");
        assert!(verification.valid);
        assert_eq!(verification.verified_records, 64);
    }

    #[tokio::test]
    async fn reopening_an_existing_store_continues_the_chain() {
        let store = InMemoryAuditStore::new();
        let (first, _writer) =
            AuditLog::open(Arc::new(store.clone()), signer(), AuditLogOptions::default())
                .await
                .expect("open");
        first.append(payload("a")).await.expect("append");
        first.append(payload("b")).await.expect("append");

        let (second, _writer) =
            AuditLog::open(Arc::new(store.clone()), signer(), AuditLogOptions::default())
                .await
                .expect("reopen");
        let record = second.append(payload("c")).await.expect("append");
        assert_eq!(record.sequence, 3);
        assert!(second.verify_chain().await.expect("verify").valid);
    }

    #[tokio::test]
    async fn tampering_seals_the_log_until_remediated() {
        let store = InMemoryAuditStore::new();
        let (log, _writer) =
            AuditLog::open(Arc::new(store.clone()), signer(), AuditLogOptions::default())
                .await
                .expect("open");
        let original = log.append(payload("a")).await.expect("append");
        log.append(payload("b")).await.expect("append");

        store.overwrite_payload(1, original.payload.replace("agent-101", "agent-666")).await;
        let verification = log.verify_chain().await.expect("verify");
        assert_eq!(verification.first_mismatch, Some(0));
        assert!(log.is_sealed());
        assert_eq!(log.append(payload("c")).await, Err(AuditError::Sealed));

        let still_broken = log.reopen().await.expect("reopen");
        assert!(!still_broken.valid);
        assert!(log.is_sealed());

        store.overwrite_payload(1, original.payload.clone()).await;
        assert!(log.reopen().await.expect("reopen").valid);
        assert_eq!(log.append(payload("c")).await.expect("append").sequence, 3);
    }

    #[tokio::test]
    async fn reopen_after_restore_continues_from_the_restored_head() {
        let store = InMemoryAuditStore::new();
        let (log, _writer) =
            AuditLog::open(Arc::new(store.clone()), signer(), AuditLogOptions::default())
                .await
                .expect("open");
        log.append(payload("a")).await.expect("append");
        log.append(payload("b")).await.expect("append");
        let third = log.append(payload("c")).await.expect("append");

        store.overwrite_payload(3, third.payload.replace("agent-101", "agent-666")).await;
        assert!(!log.verify_chain().await.expect("verify").valid);
        assert!(log.is_sealed());

        // Restore from the last good backup, which ends at sequence 2.
        store.truncate(2).await;
        let verification = log.reopen().await.expect("reopen");
        assert!(verification.valid);
        assert!(!log.is_sealed());

        let record = log.append(payload("d")).await.expect("append after restore");
        assert_eq!(record.sequence, 3);
        assert_eq!(log.append(payload("e")).await.expect("append").sequence, 4);
        let verification = log.verify_chain().await.expect("verify");
        assert!(verification.valid);
        assert_eq!(verification.verified_records, 4);
    }

    #[tokio::test]
    async fn broken_chain_at_startup_opens_sealed() {
        let store = InMemoryAuditStore::new();
        let (log, _writer) =
            AuditLog::open(Arc::new(store.clone()), signer(), AuditLogOptions::default())
                .await
                .expect("open");
        log.append(payload("a")).await.expect("append");
        store.overwrite_payload(1, "{}".to_owned()).await;

        let (reopened, _writer) =
            AuditLog::open(Arc::new(store), signer(), AuditLogOptions::default())
                .await
                .expect("open");
        assert!(reopened.is_sealed());
    }

    #[tokio::test]
    async fn compensation_must_reference_an_existing_record() {
        let (log, _writer) = AuditLog::open(
            Arc::new(InMemoryAuditStore::new()),
            signer(),
            AuditLogOptions::default(),
        )
        .await
        .expect("open");
        let original = log.append(payload("a")).await.expect("append");

        let correction = log
            .compensate(original.sequence, "operator", "actor mislabelled")
            .await
            .expect("compensate");
        let decoded = correction.decode_payload().expect("decode");
        assert_eq!(decoded.references, Some(original.sequence));
        assert_eq!(
            log.compensate(99, "operator", "nope").await,
            Err(AuditError::UnknownSequence(99))
        );
    }

    struct FlakyStore {
        inner: InMemoryAuditStore,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn append_batch(&self, records: &[AuditRecord]) -> Result<(), AuditError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(AuditError::Storage("disk full".to_owned()));
            }
            self.inner.append_batch(records).await
        }

        async fn load_all(&self) -> Result<Vec<AuditRecord>, AuditError> {
            self.inner.load_all().await
        }

        async fn range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>, AuditError> {
            self.inner.range(from, to).await
        }

        async fn last(&self) -> Result<Option<AuditRecord>, AuditError> {
            self.inner.last().await
        }
    }

    #[tokio::test]
    async fn failed_commit_consumes_no_sequence_numbers() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryAuditStore::new(),
            fail_next: AtomicBool::new(true),
        });
        let (log, _writer) = AuditLog::open(store.clone(), signer(), AuditLogOptions::default())
            .await
            .expect("open");

        let failed = log.append(payload("a")).await;
        assert!(matches!(failed, Err(AuditError::Storage(_))));

        let record = log.append(payload("b")).await.expect("append");
        assert_eq!(record.sequence, 1);
        assert!(log.verify_chain().await.expect("verify").valid);
    }
}
