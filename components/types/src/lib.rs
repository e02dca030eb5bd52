//! Tensor vocabulary shared by the preprocessor, the postprocessor and the
//! inference provider.
//!
//! A [`Tensor`] carries its payload as raw little-endian bytes so that it can
//! cross any boundary (engine, file, channel) without knowing the element type
//! up front. Only `f32` payloads are produced and consumed by this workspace.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    U128,
    S8,
    S16,
    S32,
    S64,
    S128,
    F16,
    #[default]
    F32,
    F64,
    F128,
    Na,
}

/// A dense tensor with a row-major shape and a little-endian byte payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tensor {
    pub shape: Vec<u32>,
    pub dtype: DataType,
    pub data: Vec<u8>,
}

impl Tensor {
    /// Encode `values` as an `f32` tensor of the given shape.
    ///
    /// Fails when the number of values does not match the shape.
    pub fn from_f32(shape: &[u32], values: &[f32]) -> MlResult<Self> {
        let expected = element_count(shape);
        if expected != values.len() {
            return Err(MlError::ShapeMismatch {
                shape: shape.to_vec(),
                elements: values.len(),
            });
        }

        let mut data = Vec::with_capacity(values.len() * 4);
        for value in values {
            data.write_f32::<LittleEndian>(*value)?;
        }

        Ok(Tensor {
            shape: shape.to_vec(),
            dtype: DataType::F32,
            data,
        })
    }

    /// Decode the payload as `f32` values.
    pub fn to_f32_vec(&self) -> MlResult<Vec<f32>> {
        if self.dtype != DataType::F32 {
            return Err(MlError::UnexpectedDataType {
                expected: DataType::F32,
                found: self.dtype,
            });
        }
        bytes_to_f32_vec(&self.data)
    }
}

fn element_count(shape: &[u32]) -> usize {
    shape.iter().map(|d| *d as usize).product()
}

/// Read a little-endian `f32` sequence. A trailing partial element is an error.
pub fn bytes_to_f32_vec(data: &[u8]) -> MlResult<Vec<f32>> {
    if data.len() % 4 != 0 {
        return Err(MlError::TruncatedPayload(data.len()));
    }

    let mut rdr = Cursor::new(data);
    let mut values = Vec::with_capacity(data.len() / 4);
    for _ in 0..data.len() / 4 {
        values.push(rdr.read_f32::<LittleEndian>()?);
    }
    Ok(values)
}

pub type MlResult<T> = Result<T, MlError>;

#[derive(Debug, thiserror::Error)]
pub enum MlError {
    #[error("expected tensor of dtype {expected:?}, found {found:?}")]
    UnexpectedDataType { expected: DataType, found: DataType },

    #[error("shape {shape:?} does not match {elements} elements")]
    ShapeMismatch { shape: Vec<u32>, elements: usize },

    #[error("payload of {0} bytes is not a whole number of f32 values")]
    TruncatedPayload(usize),

    #[error("tensor i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_payload_is_little_endian() {
        let tensor = Tensor::from_f32(&[1, 2], &[1.0, -2.5]).unwrap();
        assert_eq!(tensor.data.len(), 8);
        assert_eq!(&tensor.data[..4], &1.0f32.to_le_bytes());
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.0, -2.5]);
    }

    #[test]
    fn shape_must_match_values() {
        let err = Tensor::from_f32(&[1, 3, 2, 2], &[0.0; 11]).unwrap_err();
        assert!(matches!(err, MlError::ShapeMismatch { elements: 11, .. }));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert!(matches!(
            bytes_to_f32_vec(&[0, 0, 128]),
            Err(MlError::TruncatedPayload(3))
        ));
    }

    #[test]
    fn non_f32_tensor_cannot_be_decoded_as_f32() {
        let tensor = Tensor {
            shape: vec![4],
            dtype: DataType::U8,
            data: vec![1, 2, 3, 4],
        };
        assert!(matches!(
            tensor.to_f32_vec(),
            Err(MlError::UnexpectedDataType { .. })
        ));
    }
}
