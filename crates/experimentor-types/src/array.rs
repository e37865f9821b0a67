//! Numeric array payloads.
//!
//! An [`NdArray`] is a flat little-endian byte buffer tagged with its
//! [`DType`] and shape.  The tag is what lets a subscriber rebuild the array
//! from raw bytes on the other side of the relay.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayBase, ArrayD, Data, Dimension, IxDyn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ExpError;

/// Element type of an [`NdArray`].  Names follow the usual numeric
/// conventions (`"uint16"`, `"float64"`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Uint8 | DType::Int8 => 1,
            DType::Uint16 | DType::Int16 => 2,
            DType::Uint32 | DType::Int32 | DType::Float32 => 4,
            DType::Uint64 | DType::Int64 | DType::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Uint8 => "uint8",
            DType::Uint16 => "uint16",
            DType::Uint32 => "uint32",
            DType::Uint64 => "uint64",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = ExpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dtype = match s {
            "uint8" => DType::Uint8,
            "uint16" => DType::Uint16,
            "uint32" => DType::Uint32,
            "uint64" => DType::Uint64,
            "int8" => DType::Int8,
            "int16" => DType::Int16,
            "int32" => DType::Int32,
            "int64" => DType::Int64,
            "float32" => DType::Float32,
            "float64" => DType::Float64,
            other => return Err(ExpError::Codec(format!("unknown dtype '{other}'"))),
        };
        Ok(dtype)
    }
}

/// A primitive numeric type that can live inside an [`NdArray`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    /// Append the little-endian encoding of `self` to `out`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode one element; `bytes.len()` is always `DTYPE.size()`.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = $dtype;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_element! {
    u8 => DType::Uint8,
    u16 => DType::Uint16,
    u32 => DType::Uint32,
    u64 => DType::Uint64,
    i8 => DType::Int8,
    i16 => DType::Int16,
    i32 => DType::Int32,
    i64 => DType::Int64,
    f32 => DType::Float32,
    f64 => DType::Float64,
}

/// A dtype-tagged, row-major numeric array stored as little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NdArray {
    /// Wrap an already-encoded buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ExpError::Codec`] when `data` does not hold exactly
    /// `product(shape)` elements of `dtype`.
    pub fn from_raw(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, ExpError> {
        let expected = element_count(&shape)?
            .checked_mul(dtype.size())
            .ok_or_else(|| too_large(&shape))?;
        if data.len() != expected {
            return Err(ExpError::Codec(format!(
                "{dtype} array of shape {shape:?} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build an array from row-major `values`.
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self, ExpError> {
        let expected = element_count(&shape)?;
        if values.len() != expected {
            return Err(ExpError::Codec(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                values.len()
            )));
        }
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for v in values {
            v.write_le(&mut data);
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            data,
        })
    }

    /// Copy an `ndarray` array of any dimensionality, in logical order.
    pub fn from_ndarray<T, S, D>(array: &ArrayBase<S, D>) -> Self
    where
        T: Element,
        S: Data<Elem = T>,
        D: Dimension,
    {
        let mut data = Vec::with_capacity(array.len() * T::DTYPE.size());
        for v in array.iter() {
            v.write_le(&mut data);
        }
        Self {
            dtype: T::DTYPE,
            shape: array.shape().to_vec(),
            data,
        }
    }

    /// Decode the elements as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ExpError::Codec`] when `T` does not match the stored dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, ExpError> {
        if T::DTYPE != self.dtype {
            return Err(ExpError::Codec(format!(
                "array holds {}, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::read_le)
            .collect())
    }

    /// Rebuild a dynamic-dimension `ndarray` array.
    pub fn to_ndarray<T: Element>(&self) -> Result<ArrayD<T>, ExpError> {
        let values = self.to_vec::<T>()?;
        ArrayD::from_shape_vec(IxDyn(&self.shape), values)
            .map_err(|e| ExpError::Codec(format!("shape mismatch: {e}")))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

fn too_large(shape: &[usize]) -> ExpError {
    ExpError::Codec(format!("shape {shape:?} is too large"))
}

/// Number of elements in `shape`, rejecting products that overflow.
fn element_count(shape: &[usize]) -> Result<usize, ExpError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| too_large(shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    #[test]
    fn dtype_names_parse_back() {
        for dtype in [DType::Uint16, DType::Int64, DType::Float32] {
            assert_eq!(dtype.name().parse::<DType>().unwrap(), dtype);
        }
        assert!("complex128".parse::<DType>().is_err());
    }

    #[test]
    fn dtype_serializes_lowercase() {
        let json = serde_json::to_string(&DType::Uint16).unwrap();
        assert_eq!(json, "\"uint16\"");
    }

    #[test]
    fn from_vec_checks_element_count() {
        let err = NdArray::from_vec(vec![2, 2], vec![1u16, 2, 3]).unwrap_err();
        assert!(matches!(err, ExpError::Codec(_)));
    }

    #[test]
    fn from_raw_checks_byte_length() {
        assert!(NdArray::from_raw(DType::Float64, vec![3], vec![0u8; 24]).is_ok());
        assert!(NdArray::from_raw(DType::Float64, vec![3], vec![0u8; 23]).is_err());
    }

    #[test]
    fn overflowing_shape_is_a_codec_error() {
        let err = NdArray::from_raw(DType::Uint16, vec![usize::MAX, 3], vec![0u8; 4]).unwrap_err();
        assert!(matches!(err, ExpError::Codec(_)));
        // Element count fits, byte count does not.
        assert!(NdArray::from_raw(DType::Float64, vec![usize::MAX / 2], Vec::new()).is_err());
        assert!(NdArray::from_vec::<u8>(vec![usize::MAX, usize::MAX], Vec::new()).is_err());
    }

    #[test]
    fn to_vec_rejects_wrong_element_type() {
        let arr = NdArray::from_vec(vec![2], vec![1.0f32, 2.0]).unwrap();
        assert!(arr.to_vec::<f64>().is_err());
        assert_eq!(arr.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn ndarray_conversion_keeps_shape_and_values() {
        let frame: Array2<u16> = array![[1, 2, 3], [4, 5, 6]];
        let arr = NdArray::from_ndarray(&frame);
        assert_eq!(arr.dtype(), DType::Uint16);
        assert_eq!(arr.shape(), &[2, 3]);
        assert_eq!(arr.len(), 6);

        let back = arr.to_ndarray::<u16>().unwrap();
        assert_eq!(back.shape(), &[2, 3]);
        assert_eq!(back.into_dimensionality::<ndarray::Ix2>().unwrap(), frame);
    }

    #[test]
    fn transposed_view_is_copied_in_logical_order() {
        let frame: Array2<i32> = array![[1, 2], [3, 4]];
        let arr = NdArray::from_ndarray(&frame.t());
        assert_eq!(arr.to_vec::<i32>().unwrap(), vec![1, 3, 2, 4]);
    }

    #[test]
    fn bytes_are_little_endian() {
        let arr = NdArray::from_vec(vec![1], vec![0x0102u16]).unwrap();
        assert_eq!(arr.as_bytes(), &[0x02, 0x01]);
    }
}
