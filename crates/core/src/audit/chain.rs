use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::audit::AuditPayload;
use crate::digest::{hmac_hex, hmac_matches, sha256_hex};
use crate::errors::IntegrityError;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Clone, Debug)]
pub struct AuditSigner {
    key: SecretString,
}

impl AuditSigner {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    pub fn sign(&self, hash: &str) -> String {
        hmac_hex(self.key.expose_secret().as_bytes(), hash.as_bytes())
    }

    pub fn verify(&self, hash: &str, signature: &str) -> bool {
        hmac_matches(self.key.expose_secret().as_bytes(), hash.as_bytes(), signature)
    }
}

/// One committed, chained record. `payload` is the canonical JSON of an
/// [`AuditPayload`] exactly as it was hashed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub previous_hash: String,
    pub payload: String,
    pub hash: String,
    pub signature: String,
}

impl AuditRecord {
    pub fn decode_payload(&self) -> Result<AuditPayload, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Position the next record will be chained onto.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainHead {
    pub next_sequence: u64,
    pub last_hash: String,
}

impl ChainHead {
    pub fn genesis() -> Self {
        Self { next_sequence: 1, last_hash: GENESIS_HASH.to_owned() }
    }

    pub fn after(record: &AuditRecord) -> Self {
        Self { next_sequence: record.sequence.saturating_add(1), last_hash: record.hash.clone() }
    }
}

pub fn hash_record_material(sequence: u64, previous_hash: &str, payload: &str) -> String {
    let material = format!("{sequence}|{previous_hash}|{payload}");
    sha256_hex(material.as_bytes())
}

pub fn seal_record(head: &ChainHead, payload: String, signer: &AuditSigner) -> AuditRecord {
    let hash = hash_record_material(head.next_sequence, &head.last_hash, &payload);
    let signature = signer.sign(&hash);
    AuditRecord {
        sequence: head.next_sequence,
        previous_hash: head.last_hash.clone(),
        payload,
        hash,
        signature,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub verified_records: usize,
    pub first_mismatch: Option<usize>,
    pub mismatch_sequence: Option<u64>,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

impl ChainVerification {
    fn broken(
        index: usize,
        sequence: u64,
        latest_hash: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            valid: false,
            verified_records: index,
            first_mismatch: Some(index),
            mismatch_sequence: Some(sequence),
            latest_hash,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn into_result(self) -> Result<Self, IntegrityError> {
        match (self.valid, self.first_mismatch) {
            (false, Some(index)) => Err(IntegrityError::ChainMismatch {
                index,
                sequence: self.mismatch_sequence.unwrap_or_default(),
                reason: self.failure_reason.unwrap_or_default(),
            }),
            _ => Ok(self),
        }
    }
}

/// Recomputes the chain from genesis and reports the first record that fails
/// its sequence, link, hash or signature check.
pub fn verify_chain(records: &[AuditRecord], signer: &AuditSigner) -> ChainVerification {
    let mut previous_hash = GENESIS_HASH.to_owned();
    let mut latest_hash: Option<String> = None;

    for (index, record) in records.iter().enumerate() {
        let expected_sequence = u64::try_from(index).unwrap_or(u64::MAX).saturating_add(1);
        if record.sequence != expected_sequence {
            return ChainVerification::broken(
                index,
                record.sequence,
                latest_hash,
                format!(
                    "sequence gap: expected {expected_sequence}, found {}",
                    record.sequence
                ),
            );
        }

        if record.previous_hash != previous_hash {
            return ChainVerification::broken(
                index,
                record.sequence,
                latest_hash,
                format!("previous hash mismatch at sequence {}", record.sequence),
            );
        }

        let computed =
            hash_record_material(record.sequence, &record.previous_hash, &record.payload);
        if computed != record.hash {
            return ChainVerification::broken(
                index,
                record.sequence,
                latest_hash,
                format!("hash mismatch at sequence {}", record.sequence),
            );
        }

        if !signer.verify(&record.hash, &record.signature) {
            return ChainVerification::broken(
                index,
                record.sequence,
                latest_hash,
                format!("signature mismatch at sequence {}", record.sequence),
            );
        }

        previous_hash = record.hash.clone();
        latest_hash = Some(record.hash.clone());
    }

    ChainVerification {
        valid: true,
        verified_records: records.len(),
        first_mismatch: None,
        mismatch_sequence: None,
        latest_hash,
        failure_reason: None,
    }
}
