//! Messages submitted by writers.

use bytes::Bytes;
use skein_core::Timestamp;

use crate::codec::CodecId;

/// Ordered key/value metadata attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    fields: Vec<(String, String)>,
}

impl MessageMeta {
    /// Creates empty metadata.
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Appends a field. Keys may repeat; order is preserved.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    /// Returns the first value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageMeta {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Compression already applied to a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precompressed {
    /// Codec the payload was compressed with.
    pub codec: CodecId,
    /// Size of the payload before compression.
    pub original_size: u64,
}

/// A message to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMessage {
    /// Payload, compressed if `precompressed` is set.
    pub data: Bytes,
    /// Explicit sequence number, or `None` for automatic numbering.
    pub seq_no: Option<u64>,
    /// Creation time; defaults to the time of the write call.
    pub created_at: Option<Timestamp>,
    /// User metadata.
    pub meta: MessageMeta,
    /// Set when the payload is already compressed.
    pub precompressed: Option<Precompressed>,
    /// Transaction the write belongs to.
    pub tx_id: Option<String>,
}

impl WriteMessage {
    /// Creates a message with an uncompressed payload.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            seq_no: None,
            created_at: None,
            meta: MessageMeta::new(),
            precompressed: None,
            tx_id: None,
        }
    }

    /// Creates a message whose payload is already compressed with `codec`.
    pub fn compressed(data: impl Into<Bytes>, codec: CodecId, original_size: u64) -> Self {
        Self {
            precompressed: Some(Precompressed {
                codec,
                original_size,
            }),
            ..Self::new(data)
        }
    }

    /// Sets an explicit sequence number.
    #[must_use]
    pub const fn with_seq_no(mut self, seq_no: u64) -> Self {
        self.seq_no = Some(seq_no);
        self
    }

    /// Sets the creation timestamp.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Appends a metadata field.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.push(key, value);
        self
    }

    /// Attaches the write to a transaction.
    #[must_use]
    pub fn with_tx_id(mut self, tx_id: impl Into<String>) -> Self {
        self.tx_id = Some(tx_id.into());
        self
    }

    /// Returns the payload size before compression.
    #[must_use]
    pub fn uncompressed_size(&self) -> u64 {
        self.precompressed
            .map_or(self.data.len() as u64, |p| p.original_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_preserves_order_and_repeats() {
        let meta: MessageMeta = [("k", "1"), ("j", "2"), ("k", "3")].into_iter().collect();
        assert_eq!(meta.get("k"), Some("1"));
        let keys: Vec<_> = meta.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["k", "j", "k"]);
    }

    #[test]
    fn test_uncompressed_size() {
        let plain = WriteMessage::new(&b"hello"[..]);
        assert_eq!(plain.uncompressed_size(), 5);

        let packed = WriteMessage::compressed(&b"xy"[..], CodecId::GZIP, 100);
        assert_eq!(packed.uncompressed_size(), 100);
    }
}
