//! DNS-SD TXT record codec.
//!
//! A TXT record is a concatenation of entries, each a length byte `L`
//! followed by `L` bytes of UTF-8 `key=value` (or a bare `key`). Only the
//! first `=` separates; later ones belong to the value.
//!
//! Encoding requires non-empty keys without `=`, and every entry (key, `=`,
//! value) must fit in 255 bytes. The whole record should stay below
//! [`TXT_RECORD_SOFT_LIMIT`](crate::protocol::TXT_RECORD_SOFT_LIMIT).
//! Neither is checked in release builds.

use std::collections::BTreeMap;
use std::fmt;
use crate::protocol::TXT_ENTRY_MAX_LEN;

/// Reasons a TXT byte sequence cannot be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedRecord {
    #[error("entry at offset {offset} declares {declared} bytes but only {remaining} remain")]
    Truncated {
        offset: usize,
        declared: usize,
        remaining: usize,
    },

    #[error("entry at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },
}

/// Key/value metadata attached to a service.
/// Keys are kept sorted so encoding is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord(BTreeMap<String, Vec<u8>>);

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Value as text, `None` if missing or not UTF-8
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Values rendered with lossy UTF-8, for logs and JSON
    pub fn to_lossy_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for MetadataRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<BTreeMap<String, String>> for MetadataRecord {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl fmt::Display for MetadataRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} = {}", key, String::from_utf8_lossy(value))?;
        }
        f.write_str("}")
    }
}

/// Serialize a record to TXT wire bytes, one entry per key in key order.
pub fn encode(record: &MetadataRecord) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in record.iter() {
        let len = key.len() + 1 + value.len();
        debug_assert!(!key.is_empty() && !key.contains('='), "invalid TXT key {:?}", key);
        debug_assert!(len <= TXT_ENTRY_MAX_LEN, "TXT entry for {:?} is {} bytes", key, len);

        out.push(len as u8);
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value);
    }
    out
}

/// Parse TXT wire bytes, reporting why the input is malformed.
pub fn try_decode(bytes: &[u8]) -> Result<MetadataRecord, MalformedRecord> {
    let mut record = MetadataRecord::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let declared = bytes[offset] as usize;
        let start = offset + 1;
        let remaining = bytes.len() - start;
        if remaining < declared {
            return Err(MalformedRecord::Truncated { offset, declared, remaining });
        }

        let entry = &bytes[start..start + declared];
        let text = std::str::from_utf8(entry).map_err(|_| MalformedRecord::InvalidUtf8 { offset })?;

        // An empty entry is a bare empty key, same as any entry without '='
        match text.split_once('=') {
            Some((key, value)) => record.insert(key, value),
            None => record.insert(text, Vec::new()),
        };

        offset = start + declared;
    }

    Ok(record)
}

/// Parse TXT wire bytes; malformed input yields an empty record rather than
/// partial data.
pub fn decode(bytes: &[u8]) -> MetadataRecord {
    try_decode(bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> MetadataRecord {
        pairs.iter().map(|(k, v)| (*k, v.as_bytes().to_vec())).collect()
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(&record(&[("hello", "world")]));
        assert_eq!(bytes[0], 11);
        assert_eq!(&bytes[1..], b"hello=world");
    }

    #[test]
    fn test_encode_empty_value_keeps_separator() {
        assert_eq!(encode(&record(&[("flag", "")])), b"\x05flag=".to_vec());
    }

    #[test]
    fn test_encode_is_key_ordered() {
        let bytes = encode(&record(&[("b", "2"), ("a", "1")]));
        assert_eq!(bytes, b"\x03a=1\x03b=2".to_vec());
    }

    #[test]
    fn test_round_trip() {
        let original = record(&[("hello", "world"), ("path", "/api"), ("empty", ""), ("uni", "h\u{e9}llo")]);
        assert_eq!(decode(&encode(&original)), original);
    }

    #[test]
    fn test_first_equals_only() {
        let decoded = decode(&encode(&record(&[("k", "a=b")])));
        assert_eq!(decoded.get_str("k"), Some("a=b"));
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_bare_key_has_empty_value() {
        let decoded = decode(b"\x01k");
        assert_eq!(decoded, record(&[("k", "")]));
    }

    #[test]
    fn test_truncated_entry_yields_empty() {
        // First entry is fine, second declares more than is left
        let bytes = b"\x03a=1\x09b=2";
        assert!(matches!(
            try_decode(bytes),
            Err(MalformedRecord::Truncated { offset: 4, declared: 9, remaining: 3 })
        ));
        assert!(decode(bytes).is_empty());
    }

    #[test]
    fn test_invalid_utf8_yields_empty() {
        let bytes = b"\x03a=1\x03b=\xff";
        assert_eq!(try_decode(bytes), Err(MalformedRecord::InvalidUtf8 { offset: 4 }));
        assert!(decode(bytes).is_empty());
    }

    #[test]
    fn test_empty_input_and_zero_length_entry() {
        assert!(decode(&[]).is_empty());
        assert_eq!(decode(&[0]), record(&[("", "")]));
        assert_eq!(decode(b"\x00\x03a=1"), record(&[("", ""), ("a", "1")]));
    }

    #[test]
    fn test_duplicate_key_last_wins() {
        assert_eq!(decode(b"\x03a=1\x03a=2"), record(&[("a", "2")]));
    }

    #[test]
    fn test_length_byte_only_is_truncated() {
        assert!(decode(&[5]).is_empty());
    }

    #[test]
    fn test_display() {
        let r = record(&[("hello", "world"), ("a", "")]);
        assert_eq!(r.to_string(), "{a = , hello = world}");
    }
}
