//! Value encoding for the typed cache helpers.
//!
//! Values are encoded as JSON or MessagePack. With compression enabled every
//! encoded value carries a one-byte marker: `c` for a zlib stream, `r` for
//! raw bytes. Only values at or above the threshold are deflated, and only
//! when that actually shrinks them. Without compression the bytes are the
//! plain encoding, so other clients can read them directly.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use latchkey_core::{CacheError, LatchkeyResult, SerializationFormat, SerializerConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

const COMPRESSED: u8 = b'c';
const RAW: u8 = b'r';

fn serialization_error(reason: impl Into<String>) -> CacheError {
    CacheError::Serialization {
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deflate {
    threshold: usize,
    level: u32,
}

/// Encoder/decoder pair applied by [`TwoTierCache`](super::TwoTierCache)
/// to typed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueSerializer {
    format: SerializationFormat,
    deflate: Option<Deflate>,
}

impl Default for ValueSerializer {
    fn default() -> Self {
        Self::json()
    }
}

impl ValueSerializer {
    pub fn json() -> Self {
        Self {
            format: SerializationFormat::Json,
            deflate: None,
        }
    }

    pub fn msgpack() -> Self {
        Self {
            format: SerializationFormat::MessagePack,
            deflate: None,
        }
    }

    pub fn from_config(config: &SerializerConfig) -> Self {
        let serializer = Self {
            format: config.format,
            deflate: None,
        };
        if config.compress {
            serializer.with_compression(config.compression_threshold, config.compression_level)
        } else {
            serializer
        }
    }

    /// Deflate encoded values of at least `threshold` bytes at zlib `level`.
    pub fn with_compression(mut self, threshold: usize, level: u32) -> Self {
        self.deflate = Some(Deflate {
            threshold,
            level: level.min(9),
        });
        self
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn is_compressed(&self) -> bool {
        self.deflate.is_some()
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> LatchkeyResult<Vec<u8>> {
        let encoded = match self.format {
            SerializationFormat::Json => serde_json::to_vec(value)?,
            SerializationFormat::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| serialization_error(format!("msgpack encode: {e}")))?,
        };
        let Some(deflate) = self.deflate else {
            return Ok(encoded);
        };

        if encoded.len() >= deflate.threshold {
            let compressed = compress(&encoded, deflate.level)?;
            if compressed.len() < encoded.len() {
                let mut out = Vec::with_capacity(compressed.len() + 1);
                out.push(COMPRESSED);
                out.extend_from_slice(&compressed);
                return Ok(out);
            }
        }
        let mut out = Vec::with_capacity(encoded.len() + 1);
        out.push(RAW);
        out.extend_from_slice(&encoded);
        Ok(out)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> LatchkeyResult<T> {
        let inflated;
        let payload = if self.deflate.is_some() {
            match bytes.split_first() {
                Some((&COMPRESSED, rest)) => {
                    inflated = decompress(rest)?;
                    inflated.as_slice()
                }
                Some((&RAW, rest)) => rest,
                Some((marker, _)) => {
                    return Err(serialization_error(format!(
                        "unknown compression marker {marker:#04x}"
                    ))
                    .into())
                }
                None => return Err(serialization_error("empty value").into()),
            }
        } else {
            bytes
        };

        match self.format {
            SerializationFormat::Json => Ok(serde_json::from_slice(payload)?),
            SerializationFormat::MessagePack => rmp_serde::from_slice(payload)
                .map_err(|e| serialization_error(format!("msgpack decode: {e}")).into()),
        }
    }
}

fn compress(data: &[u8], level: u32) -> LatchkeyResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| serialization_error(format!("deflate: {e}")))?;
    Ok(encoder
        .finish()
        .map_err(|e| serialization_error(format!("deflate: {e}")))?)
}

fn decompress(data: &[u8]) -> LatchkeyResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| serialization_error(format!("inflate: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Roster {
        class: String,
        students: Vec<u32>,
    }

    fn roster(n: u32) -> Roster {
        Roster {
            class: "7B".to_string(),
            students: (0..n).collect(),
        }
    }

    #[test]
    fn test_plain_json_has_no_marker() {
        let bytes = ValueSerializer::json().encode(&roster(2)).unwrap();
        assert_eq!(bytes, br#"{"class":"7B","students":[0,1]}"#.to_vec());
    }

    #[test]
    fn test_small_values_stay_raw() {
        let serializer = ValueSerializer::json().with_compression(1024, 6);
        let bytes = serializer.encode(&roster(3)).unwrap();
        assert_eq!(bytes[0], RAW);
        assert_eq!(serializer.decode::<Roster>(&bytes).unwrap(), roster(3));
    }

    #[test]
    fn test_large_values_are_deflated() {
        let serializer = ValueSerializer::json().with_compression(1024, 6);
        let value = vec!["attendance"; 500];
        let plain = ValueSerializer::json().encode(&value).unwrap();
        let bytes = serializer.encode(&value).unwrap();
        assert_eq!(bytes[0], COMPRESSED);
        assert!(bytes.len() < plain.len());
        assert_eq!(serializer.decode::<Vec<String>>(&bytes).unwrap().len(), 500);
    }

    #[test]
    fn test_msgpack_with_compression() {
        let serializer = ValueSerializer::msgpack().with_compression(64, 9);
        let value = roster(400);
        let bytes = serializer.encode(&value).unwrap();
        assert_eq!(serializer.decode::<Roster>(&bytes).unwrap(), value);
        assert!(ValueSerializer::json().decode::<Roster>(&bytes).is_err());
    }

    #[test]
    fn test_rejects_bad_marker_and_empty_input() {
        let serializer = ValueSerializer::json().with_compression(16, 6);
        let err = serializer.decode::<u32>(b"x42").unwrap_err();
        assert!(matches!(
            err,
            latchkey_core::LatchkeyError::Cache(CacheError::Serialization { .. })
        ));
        assert!(serializer.decode::<u32>(b"").is_err());
        assert!(serializer.decode::<u32>(b"c not zlib").is_err());
    }

    #[test]
    fn test_from_config() {
        let config = SerializerConfig {
            format: SerializationFormat::MessagePack,
            compress: true,
            compression_threshold: 10,
            compression_level: 3,
        };
        let serializer = ValueSerializer::from_config(&config);
        assert_eq!(serializer.format(), SerializationFormat::MessagePack);
        assert!(serializer.is_compressed());
        assert!(!ValueSerializer::from_config(&SerializerConfig::default()).is_compressed());
    }
}
