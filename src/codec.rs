//! Wire and storage encodings.
//!
//! CBOR is used for everything persisted or exchanged with peers. JSON is only
//! used as the canonical pre-image for hashing/signing and for the genesis
//! bootstrap artifact.

use crate::error::{ChainError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ChainError::Codec(format!("cbor encode: {}", e)))?;
    Ok(buf)
}

pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| ChainError::Codec(format!("cbor decode: {}", e)))
}

/// JSON bytes in struct declaration order; serde_json never reorders struct fields.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Serde adapter for fixed 32-byte values rendered as `0x`-prefixed hex.
pub mod hex32 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        value: u64,
        #[serde(with = "hex32")]
        digest: [u8; 32],
    }

    #[test]
    fn test_cbor_decode_rejects_garbage() {
        let result: Result<Sample> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(ChainError::Codec(_))));
    }

    #[test]
    fn test_canonical_json_keeps_field_order() {
        let sample = Sample {
            name: "a".into(),
            value: 7,
            digest: [1u8; 32],
        };
        let json = String::from_utf8(to_canonical_json(&sample).unwrap()).unwrap();
        assert!(json.starts_with("{\"name\":\"a\",\"value\":7,\"digest\":\"0x0101"));
        let back: Sample = from_cbor(&to_cbor(&sample).unwrap()).unwrap();
        assert_eq!(back, sample);
    }
}
