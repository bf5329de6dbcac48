//! Edge data units.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use axon_core::{Result, ServiceError};

pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16 MB

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeBlob {
    payload: Bytes,
    /// blake3 of the payload, checked on receive.
    checksum: [u8; 32],
}

/// One message on the edge wire: untyped string info fields and an ordered
/// list of byte blobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeData {
    info: Vec<(String, String)>,
    blobs: Vec<EdgeBlob>,
}

impl EdgeData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an info field, replacing any prior value for the key.
    pub fn set_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.info.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.info.push((key, value));
        }
    }

    pub fn info(&self, key: &str) -> Option<&str> {
        self.info
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn add_blob(&mut self, payload: Bytes) {
        let checksum = *blake3::hash(&payload).as_bytes();
        self.blobs.push(EdgeBlob { payload, checksum });
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn blob(&self, index: usize) -> Result<Bytes> {
        self.blobs
            .get(index)
            .map(|b| b.payload.clone())
            .ok_or_else(|| {
                ServiceError::invalid(format!(
                    "blob index {index} is out of range (count: {})",
                    self.blobs.len()
                ))
            })
    }

    /// Verify every blob against its checksum.
    pub fn verify(&self) -> Result<()> {
        for (i, blob) in self.blobs.iter().enumerate() {
            if blake3::hash(&blob.payload).as_bytes() != &blob.checksum {
                return Err(ServiceError::Io(format!(
                    "blob {i} failed its integrity check"
                )));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| ServiceError::Io(e.to_string()))?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(ServiceError::invalid(format!(
                "edge message of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
                body.len()
            )));
        }
        Ok(body)
    }

    pub fn decode(body: &[u8]) -> Result<EdgeData> {
        let data: EdgeData =
            bincode::deserialize(body).map_err(|e| ServiceError::Io(e.to_string()))?;
        data.verify()?;
        Ok(data)
    }
}
