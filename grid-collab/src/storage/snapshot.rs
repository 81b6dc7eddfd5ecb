//! LZ4-compressed milestone snapshots of document projections.
//!
//! Every `snapshot_interval` commits the change log stores the encoded
//! projection. Rebuilding a projection then only folds the operations after
//! the newest snapshot:
//!
//! ```text
//!  snapshot@200 ◄── op 201 ◄── op 202 ◄── … ◄── head
//!  (LZ4)
//! ```

use serde::{Deserialize, Serialize};

use super::StoreError;

/// A compressed projection taken at `sequence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedSnapshot {
    pub sequence: u64,
    /// Uncompressed size in bytes
    pub original_size: u32,
    /// Size-prepended LZ4 block
    pub compressed: Vec<u8>,
}

impl CompressedSnapshot {
    pub fn compress(sequence: u64, data: &[u8]) -> Self {
        Self {
            sequence,
            original_size: data.len() as u32,
            compressed: lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(&self) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))
    }

    /// Original / compressed.
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(snapshot)
    }
}
