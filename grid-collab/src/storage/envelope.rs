//! Checksummed encoding for stored operations.
//!
//! Each operation is stored as a sealed envelope:
//! ```text
//! ┌──────────┬──────────┬──────────────────────────┐
//! │ sequence │ checksum │ body (bincode Operation) │
//! │ u64      │ u32 FNV  │ variable                 │
//! └──────────┴──────────┴──────────────────────────┘
//! ```
//! The checksum covers the sequence and the body. A mismatch on read means the
//! stored log is corrupt and is reported as [`StoreError::Corrupted`].

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::model::Operation;

/// Envelope wrapping an encoded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedOperation {
    pub sequence: u64,
    pub checksum: u32,
    pub body: Vec<u8>,
}

impl SealedOperation {
    pub fn verify(&self) -> bool {
        self.checksum == checksum(self.sequence, &self.body)
    }
}

/// FNV-1a over the sequence and the body, folded four bytes at a time.
fn checksum(sequence: u64, body: &[u8]) -> u32 {
    const PRIME: u32 = 0x0100_0193;
    let mut hash: u32 = 0x811c_9dc5;
    hash ^= sequence as u32;
    hash = hash.wrapping_mul(PRIME);
    hash ^= (sequence >> 32) as u32;
    hash = hash.wrapping_mul(PRIME);
    for chunk in body.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Encode an operation into its stored form.
pub fn seal_operation(op: &Operation) -> Result<Vec<u8>, StoreError> {
    let body = bincode::serde::encode_to_vec(op, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let sealed = SealedOperation {
        sequence: op.sequence,
        checksum: checksum(op.sequence, &body),
        body,
    };
    bincode::serde::encode_to_vec(&sealed, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode and verify a stored operation.
///
/// `doc_id` and `sequence` identify the key the bytes were read from; the
/// decoded operation must match both.
pub fn open_operation(
    bytes: &[u8],
    doc_id: crate::model::DocumentId,
    sequence: u64,
) -> Result<Operation, StoreError> {
    let corrupted = || StoreError::Corrupted { doc_id, sequence };

    let (sealed, _): (SealedOperation, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|_| corrupted())?;
    if sealed.sequence != sequence || !sealed.verify() {
        return Err(corrupted());
    }

    let (op, _): (Operation, _) =
        bincode::serde::decode_from_slice(&sealed.body, bincode::config::standard())
            .map_err(|_| corrupted())?;
    if op.doc_id != doc_id || op.sequence != sequence {
        return Err(corrupted());
    }
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Change, FieldValue};
    use uuid::Uuid;

    fn sample(sequence: u64) -> Operation {
        Operation {
            doc_id: Uuid::new_v4(),
            sequence,
            session_id: Uuid::new_v4(),
            client_sequence: 1,
            change: Change::set_field("rec1", "name", FieldValue::text("X")),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_seal_open() {
        let op = sample(4);
        let bytes = seal_operation(&op).unwrap();
        let opened = open_operation(&bytes, op.doc_id, 4).unwrap();
        assert_eq!(opened, op);
    }

    #[test]
    fn test_flipped_byte_detected() {
        let op = sample(9);
        let mut bytes = seal_operation(&op).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(
            open_operation(&bytes, op.doc_id, 9),
            Err(StoreError::Corrupted { doc_id: op.doc_id, sequence: 9 })
        );
    }

    #[test]
    fn test_wrong_key_detected() {
        let op = sample(2);
        let bytes = seal_operation(&op).unwrap();
        assert!(open_operation(&bytes, op.doc_id, 3).is_err());
        assert!(open_operation(&bytes, Uuid::new_v4(), 2).is_err());
    }

    #[test]
    fn test_garbage_detected() {
        let err = open_operation(&[0xFF, 0xFE, 0xFD], Uuid::nil(), 1).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_checksum_covers_sequence() {
        let body = b"same body".to_vec();
        assert_ne!(checksum(1, &body), checksum(2, &body));
    }
}
