mod chain;
mod event;
mod log;
mod store;

pub use chain::{
    hash_record_material, seal_record, verify_chain, AuditRecord, AuditSigner, ChainHead,
    ChainVerification, GENESIS_HASH,
};
pub use event::{AuditEventKind, AuditOutcome, AuditPayload};
pub use log::{AuditLog, AuditLogOptions};
pub use store::{AuditStore, InMemoryAuditStore};

use thiserror::Error;

use crate::errors::IntegrityError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit log is sealed after an integrity failure")]
    Sealed,
    #[error("audit store failure: {0}")]
    Storage(String),
    #[error("audit payload could not be encoded: {0}")]
    Encoding(String),
    #[error("audit writer is no longer running")]
    WriterClosed,
    #[error("no audit record with sequence {0}")]
    UnknownSequence(u64),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}
