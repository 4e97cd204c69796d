//! gRPC metadata (headers and trailers) and its host-facing representation.
//!
//! On the wire, keys ending in `-bin` carry binary values. The host only sees
//! text, so those values are surfaced as standard base64. Pseudo-headers
//! (`:`-prefixed) are transport-owned and never reach the host.

use crate::error::BridgeError;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::collections::BTreeMap;
use tonic::metadata::{Ascii, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};

/// Suffix marking a binary metadata key.
pub const BINARY_SUFFIX: &str = "-bin";

/// Prefix marking a pseudo-header.
pub const PSEUDO_PREFIX: char = ':';

/// Request headers the transport sets itself.
const RESERVED: &[&str] = &["content-type", "te"];

/// Host-visible metadata key-value pairs.
///
/// Keys are lowercase ASCII. Each key holds one value; when the wire repeats
/// a key, the last value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key-value pair, replacing any previous value for the key.
    ///
    /// Keys are normalized to lowercase.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        self.entries.insert(key, value.into());
    }

    /// Get the value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// Check if a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    /// Remove the value for a key.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

/// Translate host request headers into wire metadata.
///
/// Pseudo-headers and transport-owned headers are skipped. Binary request
/// metadata is not supported, so `-bin` keys are rejected.
pub fn encode_request(headers: &Metadata) -> Result<MetadataMap, BridgeError> {
    let mut map = MetadataMap::with_capacity(headers.len());

    for (key, value) in headers.iter() {
        if key.starts_with(PSEUDO_PREFIX) || RESERVED.contains(&key) {
            continue;
        }

        if key.ends_with(BINARY_SUFFIX) {
            return Err(BridgeError::InvalidMetadata(format!(
                "binary request metadata is not supported: {}",
                key
            )));
        }

        let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
            .map_err(|_| BridgeError::InvalidMetadata(format!("invalid key: {}", key)))?;
        let value = MetadataValue::<Ascii>::try_from(value).map_err(|_| {
            BridgeError::InvalidMetadata(format!("invalid value for key: {}", key))
        })?;

        map.append(name, value);
    }

    Ok(map)
}

/// Translate wire metadata into its host-visible form.
pub fn decode(map: &MetadataMap) -> Metadata {
    let mut metadata = Metadata::new();

    for entry in map.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                push_entry(&mut metadata, key.as_str(), value.as_encoded_bytes());
            }
            KeyAndValueRef::Binary(key, value) => {
                // a value that is not valid base64 on the wire is dropped
                if let Ok(bytes) = value.to_bytes() {
                    push_entry(&mut metadata, key.as_str(), &bytes);
                }
            }
        }
    }

    metadata
}

/// Add one response field. Pseudo-headers are dropped, `-bin` values are
/// base64-encoded and text values that are not UTF-8 are skipped.
fn push_entry(metadata: &mut Metadata, key: &str, value: &[u8]) {
    if key.starts_with(PSEUDO_PREFIX) {
        return;
    }

    if key.ends_with(BINARY_SUFFIX) {
        metadata.insert(key, STANDARD.encode(value));
    } else if let Ok(text) = std::str::from_utf8(value) {
        metadata.insert(key, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::{Binary, MetadataValue};

    #[test]
    fn test_metadata_new() {
        let md = Metadata::new();
        assert!(md.is_empty());
        assert_eq!(md.len(), 0);
    }

    #[test]
    fn test_metadata_insert_get() {
        let mut md = Metadata::new();
        md.insert("Content-Type", "application/grpc");

        assert_eq!(md.get("content-type"), Some("application/grpc"));
        assert_eq!(md.get("Content-Type"), Some("application/grpc"));
    }

    #[test]
    fn test_metadata_last_value_wins() {
        let mut md = Metadata::new();
        md.insert("key", "value1");
        md.insert("key", "value2");

        assert_eq!(md.get("key"), Some("value2"));
        assert_eq!(md.len(), 1);
    }

    #[test]
    fn test_metadata_contains_remove() {
        let mut md = Metadata::new();
        md.insert("key", "value");

        assert!(md.contains_key("KEY"));
        assert_eq!(md.remove("key"), Some("value".to_string()));
        assert!(md.is_empty());
        assert!(md.remove("key").is_none());
    }

    #[test]
    fn test_metadata_from_iterator() {
        let md: Metadata = [("key1", "value1"), ("key2", "value2")].into_iter().collect();
        assert_eq!(md.len(), 2);
        assert_eq!(md.get("key1"), Some("value1"));
        assert_eq!(md.get("key2"), Some("value2"));
    }

    #[test]
    fn test_metadata_serializes_as_object() {
        let md: Metadata = [("b", "2"), ("a", "1")].into_iter().collect();
        let json = serde_json::to_string(&md).unwrap();
        assert_eq!(json, r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn test_encode_request() {
        let headers: Metadata = [("authorization", "Bearer token123"), ("x-custom", "v")]
            .into_iter()
            .collect();

        let map = encode_request(&headers).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get("authorization").unwrap().to_str().unwrap(),
            "Bearer token123"
        );
        assert_eq!(map.get("x-custom").unwrap().to_str().unwrap(), "v");
    }

    #[test]
    fn test_encode_request_skips_reserved() {
        let headers: Metadata = [
            (":authority", "example.com"),
            ("content-type", "text/plain"),
            ("te", "gzip"),
            ("x-kept", "yes"),
        ]
        .into_iter()
        .collect();

        let map = encode_request(&headers).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.get("x-kept").is_some());
    }

    #[test]
    fn test_encode_request_rejects_binary() {
        let headers: Metadata = [("x-trace-bin", "AAEC")].into_iter().collect();
        assert!(matches!(
            encode_request(&headers),
            Err(BridgeError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_encode_request_rejects_invalid_value() {
        let headers: Metadata = [("x-custom", "line\nbreak")].into_iter().collect();
        assert!(matches!(
            encode_request(&headers),
            Err(BridgeError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_encode_request_rejects_invalid_key() {
        let headers: Metadata = [("bad key", "value")].into_iter().collect();
        assert!(matches!(
            encode_request(&headers),
            Err(BridgeError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_decode_text_and_binary() {
        let mut map = MetadataMap::new();
        map.insert("x", "v".parse().unwrap());
        map.insert_bin("x-bin", MetadataValue::<Binary>::from_bytes(&[0, 1, 2, 255]));

        let md = decode(&map);
        assert_eq!(md.get("x"), Some("v"));

        let encoded = md.get("x-bin").unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_decode_binary_is_padded_base64() {
        let mut map = MetadataMap::new();
        map.insert_bin("trace-bin", MetadataValue::<Binary>::from_bytes(b"ab"));

        let md = decode(&map);
        assert_eq!(md.get("trace-bin"), Some("YWI="));
    }

    #[test]
    fn test_decode_repeated_key() {
        let mut map = MetadataMap::new();
        map.append("x-multi", "first".parse().unwrap());
        map.append("x-multi", "second".parse().unwrap());

        let md = decode(&map);
        assert_eq!(md.get("x-multi"), Some("second"));
    }

    #[test]
    fn test_push_entry_filters_pseudo_headers() {
        let mut md = Metadata::new();
        push_entry(&mut md, ":status", b"200");
        push_entry(&mut md, "grpc-status", b"0");

        assert!(md.get(":status").is_none());
        assert_eq!(md.get("grpc-status"), Some("0"));
        assert_eq!(md.len(), 1);
    }

    #[test]
    fn test_push_entry_invalid_utf8() {
        let mut md = Metadata::new();
        push_entry(&mut md, "valid-key", &[0xff, 0xfe]);
        assert!(md.is_empty());

        push_entry(&mut md, "valid-bin", &[0xff, 0xfe]);
        assert_eq!(md.get("valid-bin"), Some("//4="));
    }

    #[test]
    fn test_decode_empty() {
        assert!(decode(&MetadataMap::new()).is_empty());
    }
}
