//! Tensor data bundles.
//!
//! `TensorsData` carries the byte buffers that go with a `TensorsInfo`.
//! Buffers are reference-counted `Bytes`, so a shallow clone aliases the
//! payload without copying; replacing a buffer never disturbs other holders.

use bytes::Bytes;

use crate::error::{Result, ServiceError};
use crate::tensor::{TensorsInfo, MAX_TENSOR_COUNT};

#[derive(Debug, Clone)]
struct TensorBuffer {
    /// Declared byte size, derived from the descriptor when one is attached.
    capacity: usize,
    bytes: Option<Bytes>,
}

/// A bundle of tensor buffers, optionally tied to its shape descriptor.
#[derive(Debug, Clone, Default)]
pub struct TensorsData {
    info: Option<TensorsInfo>,
    tensors: Vec<TensorBuffer>,
}

impl TensorsData {
    /// Allocate the container only: buffer slots sized from `info` but with
    /// no payload attached. Callers must fill every slot before use.
    pub fn from_info_no_alloc(info: &TensorsInfo) -> Result<TensorsData> {
        if !info.validate() {
            return Err(ServiceError::invalid(
                "tensors descriptor is incomplete or invalid",
            ));
        }
        let tensors = info
            .iter()
            .map(|t| TensorBuffer {
                capacity: t.byte_size(),
                bytes: None,
            })
            .collect();
        Ok(TensorsData {
            info: Some(info.clone()),
            tensors,
        })
    }

    /// Allocate the container and a zeroed buffer per tensor.
    pub fn from_info(info: &TensorsInfo) -> Result<TensorsData> {
        let mut data = Self::from_info_no_alloc(info)?;
        for t in &mut data.tensors {
            t.bytes = Some(Bytes::from(vec![0u8; t.capacity]));
        }
        Ok(data)
    }

    /// Build a bundle from raw buffers, e.g. blobs received off the wire.
    /// When a descriptor is given, the buffer count must match it.
    pub fn from_buffers(info: Option<TensorsInfo>, buffers: Vec<Bytes>) -> Result<TensorsData> {
        if buffers.is_empty() || buffers.len() > MAX_TENSOR_COUNT {
            return Err(ServiceError::invalid(format!(
                "buffer count {} is out of range [1, {MAX_TENSOR_COUNT}]",
                buffers.len()
            )));
        }
        if let Some(ref info) = info {
            if info.count() != buffers.len() {
                return Err(ServiceError::invalid(format!(
                    "buffer count {} does not match descriptor count {}",
                    buffers.len(),
                    info.count()
                )));
            }
        }
        let tensors = buffers
            .into_iter()
            .map(|b| TensorBuffer {
                capacity: b.len(),
                bytes: Some(b),
            })
            .collect();
        Ok(TensorsData { info, tensors })
    }

    pub fn count(&self) -> usize {
        self.tensors.len()
    }

    pub fn info(&self) -> Option<&TensorsInfo> {
        self.info.as_ref()
    }

    fn buffer(&self, index: usize) -> Result<&TensorBuffer> {
        self.tensors
            .get(index)
            .ok_or_else(|| index_error(index, self.tensors.len()))
    }

    /// Declared byte size of one buffer slot.
    pub fn byte_size(&self, index: usize) -> Result<usize> {
        Ok(self.buffer(index)?.capacity)
    }

    /// Borrow one tensor's payload.
    pub fn tensor(&self, index: usize) -> Result<&[u8]> {
        let buf = self.buffer(index)?;
        buf.bytes
            .as_deref()
            .ok_or_else(|| ServiceError::invalid(format!("tensor {index} has no buffer attached")))
    }

    /// Shared handle to one tensor's payload without copying.
    pub fn tensor_bytes(&self, index: usize) -> Result<Bytes> {
        let buf = self.buffer(index)?;
        buf.bytes
            .clone()
            .ok_or_else(|| ServiceError::invalid(format!("tensor {index} has no buffer attached")))
    }

    /// Copy `src` into the indexed slot. The source must be non-empty and
    /// fit the declared size.
    pub fn set_tensor(&mut self, index: usize, src: &[u8]) -> Result<()> {
        let count = self.tensors.len();
        let buf = self
            .tensors
            .get_mut(index)
            .ok_or_else(|| index_error(index, count))?;
        if src.is_empty() || src.len() > buf.capacity {
            return Err(ServiceError::invalid(format!(
                "data size {} is out of range (0, {}]",
                src.len(),
                buf.capacity
            )));
        }
        buf.bytes = Some(Bytes::copy_from_slice(src));
        Ok(())
    }

    /// Attach an already-owned payload without copying.
    pub fn attach(&mut self, index: usize, payload: Bytes) -> Result<()> {
        let count = self.tensors.len();
        let buf = self
            .tensors
            .get_mut(index)
            .ok_or_else(|| index_error(index, count))?;
        if payload.is_empty() || payload.len() > buf.capacity {
            return Err(ServiceError::invalid(format!(
                "payload size {} is out of range (0, {}]",
                payload.len(),
                buf.capacity
            )));
        }
        buf.bytes = Some(payload);
        Ok(())
    }

    /// True when every slot holds a payload of its declared size.
    pub fn is_complete(&self) -> bool {
        !self.tensors.is_empty()
            && self
                .tensors
                .iter()
                .all(|t| t.bytes.as_ref().map(Bytes::len) == Some(t.capacity))
    }

    pub fn total_size(&self) -> usize {
        self.tensors.iter().map(|t| t.capacity).sum()
    }
}

fn index_error(index: usize, count: usize) -> ServiceError {
    ServiceError::invalid(format!(
        "tensor index {index} is out of range (count: {count})"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::ElementType;

    fn info_u8(len: u32) -> TensorsInfo {
        let mut info = TensorsInfo::with_count(1).unwrap();
        info.set_type(0, ElementType::UInt8).unwrap();
        info.set_dimension(0, &[len]).unwrap();
        info
    }

    #[test]
    fn no_alloc_leaves_slots_empty() {
        let data = TensorsData::from_info_no_alloc(&info_u8(8)).unwrap();
        assert_eq!(data.count(), 1);
        assert_eq!(data.byte_size(0).unwrap(), 8);
        assert!(data.tensor(0).is_err());
        assert!(!data.is_complete());
    }

    #[test]
    fn alloc_zeroes_buffers() {
        let data = TensorsData::from_info(&info_u8(4)).unwrap();
        assert_eq!(data.tensor(0).unwrap(), &[0, 0, 0, 0]);
        assert!(data.is_complete());
    }

    #[test]
    fn set_tensor_bounds() {
        let mut data = TensorsData::from_info(&info_u8(4)).unwrap();
        assert!(data.set_tensor(0, &[]).is_err());
        assert!(data.set_tensor(0, &[1, 2, 3, 4, 5]).is_err());
        data.set_tensor(0, &[9, 9]).unwrap();
        assert_eq!(data.tensor(0).unwrap(), &[9, 9]);
    }

    #[test]
    fn out_of_range_index() {
        let data = TensorsData::from_info(&info_u8(4)).unwrap();
        assert!(data.tensor(1).is_err());
        assert!(data.byte_size(7).is_err());
    }

    #[test]
    fn shallow_clone_aliases_then_diverges() {
        let mut data = TensorsData::from_info(&info_u8(4)).unwrap();
        data.set_tensor(0, &[1, 2, 3, 4]).unwrap();

        let alias = data.clone();
        assert_eq!(alias.tensor(0).unwrap(), data.tensor(0).unwrap());

        data.set_tensor(0, &[5, 6, 7, 8]).unwrap();
        assert_eq!(alias.tensor(0).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn buffer_count_must_match_info() {
        let info = info_u8(2);
        let err = TensorsData::from_buffers(
            Some(info),
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
        );
        assert!(err.is_err());
    }
}
