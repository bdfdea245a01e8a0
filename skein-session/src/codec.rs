//! Payload codecs.
//!
//! Codec implementations are supplied by the application; the client only
//! ships [`RawCodec`], the identity codec.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Identifier of a payload codec, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodecId(u32);

impl CodecId {
    /// Uncompressed payload.
    pub const RAW: Self = Self(1);
    /// Gzip.
    pub const GZIP: Self = Self(2);
    /// LZOP.
    pub const LZOP: Self = Self(3);
    /// Zstandard.
    pub const ZSTD: Self = Self(4);

    /// Creates an application-defined codec id.
    #[must_use]
    pub const fn custom(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RAW => write!(f, "raw"),
            Self::GZIP => write!(f, "gzip"),
            Self::LZOP => write!(f, "lzop"),
            Self::ZSTD => write!(f, "zstd"),
            Self(other) => write!(f, "codec-{other}"),
        }
    }
}

/// Codec error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// No codec is registered for the id.
    #[error("no codec registered for {codec}")]
    Unknown {
        /// The codec id.
        codec: CodecId,
    },

    /// The codec failed.
    #[error("{codec} failed: {message}")]
    Failed {
        /// The codec id.
        codec: CodecId,
        /// Error message.
        message: String,
    },
}

/// Compresses and decompresses payloads.
pub trait Codec: Send + Sync {
    /// Compresses `data` at `level`.
    ///
    /// # Errors
    /// Returns an error if compression fails.
    fn compress(&self, data: &[u8], level: i32) -> Result<Bytes, CodecError>;

    /// Decompresses `data`.
    ///
    /// # Errors
    /// Returns an error if `data` is not a valid payload for this codec.
    fn decompress(&self, data: &[u8]) -> Result<Bytes, CodecError>;
}

/// Identity codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn compress(&self, data: &[u8], _level: i32) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Codecs by id.
#[derive(Clone)]
pub struct CodecMap {
    codecs: HashMap<CodecId, Arc<dyn Codec>>,
}

impl CodecMap {
    /// Creates a map holding only [`RawCodec`].
    #[must_use]
    pub fn new() -> Self {
        let mut codecs: HashMap<CodecId, Arc<dyn Codec>> = HashMap::new();
        codecs.insert(CodecId::RAW, Arc::new(RawCodec));
        Self { codecs }
    }

    /// Registers or replaces a codec.
    pub fn register(&mut self, id: CodecId, codec: Arc<dyn Codec>) {
        self.codecs.insert(id, codec);
    }

    /// Returns true if a codec is registered for `id`.
    #[must_use]
    pub fn contains(&self, id: CodecId) -> bool {
        self.codecs.contains_key(&id)
    }

    /// Returns the codec for `id`.
    ///
    /// # Errors
    /// Returns `Unknown` if none is registered.
    pub fn get(&self, id: CodecId) -> Result<&Arc<dyn Codec>, CodecError> {
        self.codecs.get(&id).ok_or(CodecError::Unknown { codec: id })
    }

    /// Compresses with the codec for `id`.
    ///
    /// # Errors
    /// Returns an error if the codec is unknown or fails.
    pub fn compress(&self, id: CodecId, data: &[u8], level: i32) -> Result<Bytes, CodecError> {
        self.get(id)?.compress(data, level)
    }

    /// Decompresses with the codec for `id`. Raw payloads are returned as-is.
    ///
    /// # Errors
    /// Returns an error if the codec is unknown or fails.
    pub fn decompress(&self, id: CodecId, data: &Bytes) -> Result<Bytes, CodecError> {
        if id == CodecId::RAW {
            return Ok(data.clone());
        }
        self.get(id)?.decompress(data)
    }
}

impl Default for CodecMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.codecs.keys().copied().collect();
        ids.sort();
        f.debug_struct("CodecMap").field("codecs", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codec_registered_by_default() {
        let codecs = CodecMap::new();
        let data = Bytes::from_static(b"payload");
        assert_eq!(codecs.decompress(CodecId::RAW, &data).unwrap(), data);
        assert_eq!(codecs.compress(CodecId::RAW, &data, 4).unwrap(), data);
    }

    #[test]
    fn test_unknown_codec_reported() {
        let codecs = CodecMap::new();
        let err = codecs
            .decompress(CodecId::ZSTD, &Bytes::from_static(b"x"))
            .unwrap_err();
        assert_eq!(err, CodecError::Unknown { codec: CodecId::ZSTD });
        assert_eq!(err.to_string(), "no codec registered for zstd");
    }

    #[test]
    fn test_custom_codec_display() {
        assert_eq!(CodecId::custom(10_000).to_string(), "codec-10000");
    }
}
