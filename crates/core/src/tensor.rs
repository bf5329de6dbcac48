//! Tensor shape descriptors.
//!
//! A `TensorsInfo` describes a bundle of up to 16 tensors. Each tensor has
//! an element type and a fixed-capacity dimension vector; the first zero
//! dimension marks the end of the used axes. Extended descriptors may use
//! all 16 axes, legacy descriptors are capped at 4.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};

/// Maximum number of tensors per bundle.
pub const MAX_TENSOR_COUNT: usize = 16;

/// Maximum axes per tensor on extended descriptors.
pub const MAX_RANK: usize = 16;

/// Axis cap for non-extended descriptors.
pub const LEGACY_RANK: usize = 4;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Unknown,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float16,
    Float32,
    Float64,
}

impl ElementType {
    /// Size of one element in bytes. Zero for `Unknown`.
    pub fn size(&self) -> usize {
        match self {
            ElementType::Unknown => 0,
            ElementType::Int8 | ElementType::UInt8 => 1,
            ElementType::Int16 | ElementType::UInt16 | ElementType::Float16 => 2,
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
            ElementType::Int64 | ElementType::UInt64 | ElementType::Float64 => 8,
        }
    }

    pub fn parse(s: &str) -> Result<ElementType> {
        let t = match s.to_ascii_lowercase().as_str() {
            "int8" => ElementType::Int8,
            "uint8" => ElementType::UInt8,
            "int16" => ElementType::Int16,
            "uint16" => ElementType::UInt16,
            "int32" => ElementType::Int32,
            "uint32" => ElementType::UInt32,
            "int64" => ElementType::Int64,
            "uint64" => ElementType::UInt64,
            "float16" => ElementType::Float16,
            "float32" => ElementType::Float32,
            "float64" => ElementType::Float64,
            other => {
                return Err(ServiceError::invalid(format!(
                    "unknown tensor element type '{other}'"
                )))
            }
        };
        Ok(t)
    }
}

/// Shape metadata of a single tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: Option<String>,
    pub elem_type: ElementType,
    pub dimension: [u32; MAX_RANK],
}

impl Default for TensorInfo {
    fn default() -> Self {
        Self {
            name: None,
            elem_type: ElementType::Unknown,
            dimension: [0; MAX_RANK],
        }
    }
}

impl TensorInfo {
    /// Number of used axes: index of the first zero dimension.
    pub fn rank(&self) -> usize {
        self.dimension
            .iter()
            .position(|&d| d == 0)
            .unwrap_or(MAX_RANK)
    }

    /// Total element count over the used axes.
    pub fn element_count(&self) -> u64 {
        self.dimension[..self.rank()]
            .iter()
            .map(|&d| d as u64)
            .product()
    }

    /// Byte size of this tensor's data.
    pub fn byte_size(&self) -> usize {
        self.element_count() as usize * self.elem_type.size()
    }

    fn is_valid(&self, extended: bool) -> bool {
        self.elem_type != ElementType::Unknown && dimension_is_valid(&self.dimension, extended)
    }
}

/// A dimension vector is valid when, for some rank r >= 1, axes 0..r are all
/// non-zero and every later axis is zero. Non-extended descriptors must not
/// use axes beyond `LEGACY_RANK`.
fn dimension_is_valid(dim: &[u32; MAX_RANK], extended: bool) -> bool {
    let rank = dim.iter().position(|&d| d == 0).unwrap_or(MAX_RANK);
    if rank == 0 {
        return false;
    }
    if dim[rank..].iter().any(|&d| d != 0) {
        return false;
    }
    if !extended && rank > LEGACY_RANK {
        return false;
    }
    true
}

/// Ordered bundle of tensor descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorsInfo {
    extended: bool,
    tensors: Vec<TensorInfo>,
}

impl Default for TensorsInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorsInfo {
    /// New empty descriptor; call `set_count` before use.
    pub fn new() -> Self {
        Self {
            extended: false,
            tensors: Vec::new(),
        }
    }

    /// New empty descriptor with the rank cap raised to `MAX_RANK`.
    pub fn new_extended() -> Self {
        Self {
            extended: true,
            tensors: Vec::new(),
        }
    }

    pub fn with_count(count: usize) -> Result<Self> {
        let mut info = Self::new();
        info.set_count(count)?;
        Ok(info)
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn count(&self) -> usize {
        self.tensors.len()
    }

    /// Resize the bundle. Count must be in `[1, MAX_TENSOR_COUNT]`; new
    /// slots start out with unknown type and empty dimensions.
    pub fn set_count(&mut self, count: usize) -> Result<()> {
        if count == 0 || count > MAX_TENSOR_COUNT {
            return Err(ServiceError::invalid(format!(
                "tensor count {count} is out of range [1, {MAX_TENSOR_COUNT}]"
            )));
        }
        self.tensors.resize_with(count, TensorInfo::default);
        Ok(())
    }

    pub fn tensor(&self, index: usize) -> Result<&TensorInfo> {
        self.tensors
            .get(index)
            .ok_or_else(|| index_error(index, self.tensors.len()))
    }

    pub fn set_name(&mut self, index: usize, name: Option<&str>) -> Result<()> {
        let count = self.tensors.len();
        let t = self
            .tensors
            .get_mut(index)
            .ok_or_else(|| index_error(index, count))?;
        t.name = name.map(str::to_string);
        Ok(())
    }

    /// Set the element type. `Unknown` is rejected, and `Float16` is only
    /// available when the `float16` feature is compiled in.
    pub fn set_type(&mut self, index: usize, elem_type: ElementType) -> Result<()> {
        if elem_type == ElementType::Unknown {
            return Err(ServiceError::invalid("tensor element type must be known"));
        }
        #[cfg(not(feature = "float16"))]
        if elem_type == ElementType::Float16 {
            return Err(ServiceError::NotSupported(
                "float16 support is not compiled in".into(),
            ));
        }
        let count = self.tensors.len();
        let t = self
            .tensors
            .get_mut(index)
            .ok_or_else(|| index_error(index, count))?;
        t.elem_type = elem_type;
        Ok(())
    }

    /// Set the dimension vector. The slice is zero-padded to `MAX_RANK` and
    /// must satisfy the validity rule for this descriptor's rank cap.
    pub fn set_dimension(&mut self, index: usize, dims: &[u32]) -> Result<()> {
        if dims.is_empty() || dims.len() > MAX_RANK {
            return Err(ServiceError::invalid(format!(
                "dimension vector length {} is out of range [1, {MAX_RANK}]",
                dims.len()
            )));
        }
        let mut dim = [0u32; MAX_RANK];
        dim[..dims.len()].copy_from_slice(dims);
        if !dimension_is_valid(&dim, self.extended) {
            return Err(ServiceError::invalid(format!(
                "invalid dimension vector {dims:?} (extended: {})",
                self.extended
            )));
        }
        let count = self.tensors.len();
        let t = self
            .tensors
            .get_mut(index)
            .ok_or_else(|| index_error(index, count))?;
        t.dimension = dim;
        Ok(())
    }

    /// Byte size of one tensor.
    pub fn tensor_byte_size(&self, index: usize) -> Result<usize> {
        Ok(self.tensor(index)?.byte_size())
    }

    /// Sum of all tensor byte sizes.
    pub fn total_byte_size(&self) -> usize {
        self.tensors.iter().map(TensorInfo::byte_size).sum()
    }

    /// A descriptor is valid when it holds at least one tensor and every
    /// tensor has a known type and a valid dimension vector.
    pub fn validate(&self) -> bool {
        !self.tensors.is_empty() && self.tensors.iter().all(|t| t.is_valid(self.extended))
    }

    /// Deep clone, refused for descriptors that fail `validate`.
    pub fn try_clone(&self) -> Result<TensorsInfo> {
        if !self.validate() {
            return Err(ServiceError::invalid(
                "cannot clone an incomplete tensors descriptor",
            ));
        }
        Ok(self.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorInfo> {
        self.tensors.iter()
    }
}

fn index_error(index: usize, count: usize) -> ServiceError {
    ServiceError::invalid(format!(
        "tensor index {index} is out of range (count: {count})"
    ))
}

/// Little-endian packing for float16 tensor buffers.
#[cfg(feature = "float16")]
pub mod f16 {
    use half::f16;

    pub fn to_bytes(values: &[f16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(values.len() * 2);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Vec<f16> {
        bytes
            .chunks_exact(2)
            .map(|chunk| f16::from_le_bytes([chunk[0], chunk[1]]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float32_1x1(name: Option<&str>) -> TensorsInfo {
        let mut info = TensorsInfo::with_count(1).unwrap();
        info.set_type(0, ElementType::Float32).unwrap();
        info.set_dimension(0, &[1, 1, 1, 1]).unwrap();
        info.set_name(0, name).unwrap();
        info
    }

    #[test]
    fn clone_is_deep_and_compares_equal() {
        let info = float32_1x1(Some("in"));
        let mut copy = info.try_clone().unwrap();
        assert_eq!(info, copy);

        copy.set_dimension(0, &[2, 1, 1, 1]).unwrap();
        assert_ne!(info, copy);
        assert_eq!(info.tensor(0).unwrap().dimension[0], 1);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut info = TensorsInfo::with_count(1).unwrap();
        assert!(info.set_type(0, ElementType::Unknown).is_err());
    }

    #[test]
    fn zero_in_the_middle_is_rejected() {
        let mut info = TensorsInfo::with_count(1).unwrap();
        assert!(info.set_dimension(0, &[2, 0, 3]).is_err());
    }

    #[test]
    fn count_bounds() {
        let mut info = TensorsInfo::new();
        assert!(info.set_count(0).is_err());
        assert!(info.set_count(MAX_TENSOR_COUNT + 1).is_err());
        assert!(info.set_count(MAX_TENSOR_COUNT).is_ok());
    }

    #[test]
    fn legacy_rank_cap() {
        let mut info = TensorsInfo::with_count(1).unwrap();
        assert!(info.set_dimension(0, &[2, 2, 2, 2, 2]).is_err());

        let mut ext = TensorsInfo::new_extended();
        ext.set_count(1).unwrap();
        assert!(ext.set_dimension(0, &[2, 2, 2, 2, 2]).is_ok());
    }

    #[test]
    fn byte_sizes() {
        let mut info = TensorsInfo::with_count(2).unwrap();
        info.set_type(0, ElementType::Float32).unwrap();
        info.set_dimension(0, &[2, 3]).unwrap();
        info.set_type(1, ElementType::UInt8).unwrap();
        info.set_dimension(1, &[10]).unwrap();

        assert_eq!(info.tensor_byte_size(0).unwrap(), 24);
        assert_eq!(info.tensor_byte_size(1).unwrap(), 10);
        assert_eq!(info.total_byte_size(), 34);
    }

    #[test]
    fn clone_requires_valid_source() {
        let info = TensorsInfo::with_count(1).unwrap();
        assert!(info.try_clone().is_err());
    }

    #[cfg(not(feature = "float16"))]
    #[test]
    fn float16_needs_the_feature() {
        let mut info = TensorsInfo::with_count(1).unwrap();
        assert!(matches!(
            info.set_type(0, ElementType::Float16),
            Err(ServiceError::NotSupported(_))
        ));
    }

    #[cfg(feature = "float16")]
    #[test]
    fn float16_packs_little_endian() {
        let values = [half::f16::from_f32(1.5), half::f16::from_f32(-2.0)];
        let bytes = f16::to_bytes(&values);
        assert_eq!(bytes.len(), 4);
        assert_eq!(f16::from_bytes(&bytes), values);

        let mut info = TensorsInfo::with_count(1).unwrap();
        assert!(info.set_type(0, ElementType::Float16).is_ok());
    }
}
