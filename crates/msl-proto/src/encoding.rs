//! Interchangeable binary and textual encodings.
//!
//! Every wire structure serializes through serde, so the same value can be
//! written as CBOR or JSON. Decoders sniff the first byte and accept both:
//! a JSON document always begins with `{` (after optional whitespace), while
//! an encoded structure in CBOR always begins with a map header.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::errors::{ProtocolError, Result};

/// Encoding used for outgoing bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderFormat {
    /// Binary CBOR
    #[default]
    Cbor,
    /// Textual JSON
    Json,
}

impl EncoderFormat {
    /// Serialize `value` in this format.
    ///
    /// # Errors
    ///
    /// - `CborEncode` / `JsonEncode` if serialization fails
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(value, &mut buf)
                    .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
                Ok(buf)
            },
            Self::Json => serde_json::to_vec(value).map_err(|e| ProtocolError::JsonEncode(e.to_string())),
        }
    }

    /// Guess the format of `bytes`.
    ///
    /// Returns `None` for empty or all-whitespace input.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        let first = bytes.iter().find(|b| !b.is_ascii_whitespace())?;
        if *first == b'{' { Some(Self::Json) } else { Some(Self::Cbor) }
    }
}

/// Decode `bytes` in whichever format they were written.
///
/// # Errors
///
/// - `Empty` if there is nothing to decode
/// - `CborDecode` / `JsonDecode` on malformed input
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match EncoderFormat::detect(bytes) {
        None => Err(ProtocolError::Empty),
        Some(EncoderFormat::Json) => {
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::JsonDecode(e.to_string()))
        },
        Some(EncoderFormat::Cbor) => {
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u64,
        data: Vec<u8>,
    }

    fn sample() -> Sample {
        Sample { name: "token".to_string(), count: 42, data: vec![1, 2, 3] }
    }

    #[test]
    fn both_formats_decode_through_one_entry_point() {
        for format in [EncoderFormat::Cbor, EncoderFormat::Json] {
            let bytes = format.encode(&sample()).unwrap();
            assert_eq!(EncoderFormat::detect(&bytes), Some(format));
            assert_eq!(decode::<Sample>(&bytes).unwrap(), sample());
        }
    }

    #[test]
    fn detect_skips_leading_whitespace() {
        assert_eq!(EncoderFormat::detect(b"  \n{\"a\":1}"), Some(EncoderFormat::Json));
    }

    #[test]
    fn empty_input_rejected() {
        assert_eq!(decode::<Sample>(b""), Err(ProtocolError::Empty));
        assert_eq!(decode::<Sample>(b"   "), Err(ProtocolError::Empty));
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(decode::<Sample>(b"{not json"), Err(ProtocolError::JsonDecode(_))));
        assert!(matches!(decode::<Sample>(&[0xFF, 0x00, 0x13]), Err(ProtocolError::CborDecode(_))));
    }
}
