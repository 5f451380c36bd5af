//! File manifest — the first frame of every recipient's stream.

use serde::{Deserialize, Serialize};

/// Describes the payload that follows so the receiver can size buffers,
/// count chunks, and verify the reassembled file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifest {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u64,
    /// BLAKE3 of the whole payload, hex.
    pub digest: String,
}

impl FileManifest {
    pub fn for_payload(transfer_id: &str, file_name: &str, payload: &[u8], chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            transfer_id: transfer_id.to_string(),
            file_name: file_name.to_string(),
            file_size: payload.len() as u64,
            chunk_size: chunk_size as u32,
            chunk_count: payload.len().div_ceil(chunk_size) as u64,
            digest: hex::encode(blake3::hash(payload).as_bytes()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Check a reassembled payload against the manifest.
    pub fn verify(&self, payload: &[u8]) -> bool {
        payload.len() as u64 == self.file_size
            && hex::encode(blake3::hash(payload).as_bytes()) == self.digest
    }
}
