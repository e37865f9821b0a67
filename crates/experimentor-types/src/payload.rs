//! Message payloads and their metadata record.
//!
//! A payload is either a generic serialisable object or a numeric array.  The
//! [`Metadata`] sent alongside tells the receiver which one it is, so the
//! payload bytes can be decoded without guessing.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ExpError;
use crate::array::{DType, NdArray};

/// The data carried by one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Any serde-serialisable value, carried as JSON.
    Object(serde_json::Value),
    /// A numeric array carried as raw little-endian bytes.
    Array(NdArray),
}

impl Payload {
    /// A plain string payload (sentinels are sent this way).
    pub fn text(s: impl Into<String>) -> Self {
        Payload::Object(serde_json::Value::String(s.into()))
    }

    /// Serialise any value into an object payload.
    pub fn object<T: Serialize>(value: &T) -> Result<Self, ExpError> {
        Ok(Payload::Object(serde_json::to_value(value)?))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Object(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// `true` when this payload is exactly the string `sentinel`.
    pub fn is_sentinel(&self, sentinel: &str) -> bool {
        self.as_text() == Some(sentinel)
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Payload::Array(arr) => Some(arr),
            Payload::Object(_) => None,
        }
    }

    /// Deserialise an object payload into `T`.
    ///
    /// # Errors
    ///
    /// [`ExpError::Serialization`] when the payload is an array or does not
    /// match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ExpError> {
        match self {
            Payload::Object(value) => Ok(T::deserialize(value)?),
            Payload::Array(arr) => Err(ExpError::Serialization(format!(
                "expected an object payload, got a {} array",
                arr.dtype()
            ))),
        }
    }

    /// Metadata describing this payload.
    pub fn metadata(&self, seq: u64) -> Metadata {
        match self {
            Payload::Object(_) => Metadata::object(seq),
            Payload::Array(arr) => Metadata::array(arr.dtype(), arr.shape().to_vec(), seq),
        }
    }

    /// Encode the payload body.  Arrays are copied verbatim, objects are
    /// serialised to JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ExpError> {
        match self {
            Payload::Object(value) => Ok(serde_json::to_vec(value)?),
            Payload::Array(arr) => Ok(arr.as_bytes().to_vec()),
        }
    }

    /// Decode a payload body according to `metadata`.
    pub fn from_bytes(metadata: &Metadata, bytes: &[u8]) -> Result<Self, ExpError> {
        if !metadata.array {
            return Ok(Payload::Object(serde_json::from_slice(bytes)?));
        }
        let (Some(dtype), Some(shape)) = (metadata.dtype, metadata.shape.clone()) else {
            return Err(ExpError::Codec(
                "array metadata without dtype and shape".to_string(),
            ));
        };
        Ok(Payload::Array(NdArray::from_raw(dtype, shape, bytes.to_vec())?))
    }
}

impl From<NdArray> for Payload {
    fn from(arr: NdArray) -> Self {
        Payload::Array(arr)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Object(value)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::text(s)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::text(s)
    }
}

/// Small record sent between the topic and the payload body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Metadata {
    /// `true` when the body is a raw numeric buffer.
    pub array: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    /// Per-topic message counter of the sending pusher.
    #[serde(default)]
    pub seq: u64,
}

impl Metadata {
    pub fn object(seq: u64) -> Self {
        Self {
            array: false,
            dtype: None,
            shape: None,
            seq,
        }
    }

    pub fn array(dtype: DType, shape: Vec<usize>, seq: u64) -> Self {
        Self {
            array: true,
            dtype: Some(dtype),
            shape: Some(shape),
            seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_payload_matches_sentinel() {
        let p = Payload::text("stop");
        assert!(p.is_sentinel("stop"));
        assert!(!p.is_sentinel("exit"));
        assert!(!Payload::Object(json!({"data": "stop"})).is_sentinel("stop"));
    }

    #[test]
    fn array_metadata_carries_dtype_and_shape() {
        let arr = NdArray::from_vec(vec![4, 4], vec![7u16; 16]).unwrap();
        let meta = Payload::from(arr).metadata(3);
        assert!(meta.array);
        assert_eq!(meta.dtype, Some(DType::Uint16));
        assert_eq!(meta.shape, Some(vec![4, 4]));
        assert_eq!(meta.seq, 3);
    }

    #[test]
    fn object_metadata_json_omits_array_fields() {
        let json = serde_json::to_string(&Metadata::object(1)).unwrap();
        assert_eq!(json, r#"{"array":false,"seq":1}"#);
    }

    #[test]
    fn array_body_decodes_with_its_metadata() {
        let arr = NdArray::from_vec(vec![2, 3], vec![1.5f64, 2.5, 3.5, 4.5, 5.5, 6.5]).unwrap();
        let payload = Payload::from(arr.clone());
        let bytes = payload.to_bytes().unwrap();
        let decoded = Payload::from_bytes(&payload.metadata(0), &bytes).unwrap();
        assert_eq!(decoded.as_array(), Some(&arr));
    }

    #[test]
    fn array_metadata_without_shape_is_rejected() {
        let meta = Metadata {
            array: true,
            dtype: Some(DType::Uint8),
            shape: None,
            seq: 0,
        };
        assert!(matches!(
            Payload::from_bytes(&meta, &[1, 2]),
            Err(ExpError::Codec(_))
        ));
    }

    #[test]
    fn deserialize_object_into_struct() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Reading {
            channel: String,
            volts: f64,
        }
        let p = Payload::Object(json!({"channel": "ai0", "volts": 1.25}));
        let r: Reading = p.deserialize().unwrap();
        assert_eq!(
            r,
            Reading {
                channel: "ai0".to_string(),
                volts: 1.25
            }
        );

        let arr = Payload::from(NdArray::from_vec(vec![1], vec![1u8]).unwrap());
        assert!(arr.deserialize::<Reading>().is_err());
    }
}
