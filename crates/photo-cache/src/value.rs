//! Cached values and their on-disk encoding
//!
//! A disk entry uses two slots: a small JSON [`ValueHeader`] describing the
//! payload, and the payload bytes themselves.

use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Slot holding the JSON header
pub const HEADER_SLOT: usize = 0;
/// Slot holding the payload bytes
pub const PAYLOAD_SLOT: usize = 1;

/// Anything the memory tier can account for in bytes
pub trait Weighted {
    fn weight(&self) -> u64;
}

/// An encoded image and its MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// A value the cache can hold
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Text(String),
    Binary(Vec<u8>),
    Structured(serde_json::Value),
    Image(Image),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text,
    Binary,
    Structured,
    Image,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Text => "text",
            ValueKind::Binary => "binary",
            ValueKind::Structured => "structured",
            ValueKind::Image => "image",
        };
        f.write_str(name)
    }
}

/// Stored in the header slot of every disk entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueHeader {
    pub kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ValueHeader {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

impl CacheValue {
    /// Serialize any value into a structured cache value
    pub fn structured<T: Serialize>(value: &T) -> Result<Self> {
        Ok(CacheValue::Structured(serde_json::to_value(value)?))
    }

    pub fn image(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        CacheValue::Image(Image {
            content_type: content_type.into(),
            bytes,
        })
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            CacheValue::Text(_) => ValueKind::Text,
            CacheValue::Binary(_) => ValueKind::Binary,
            CacheValue::Structured(_) => ValueKind::Structured,
            CacheValue::Image(_) => ValueKind::Image,
        }
    }

    /// Split into a header and payload bytes for the disk tier
    pub fn encode(&self, expires_at: Option<DateTime<Utc>>) -> Result<(ValueHeader, Vec<u8>)> {
        let (content_type, payload) = match self {
            CacheValue::Text(text) => (None, text.as_bytes().to_vec()),
            CacheValue::Binary(bytes) => (None, bytes.clone()),
            CacheValue::Structured(value) => (None, serde_json::to_vec(value)?),
            CacheValue::Image(image) => (Some(image.content_type.clone()), image.bytes.clone()),
        };
        let header = ValueHeader {
            kind: self.kind(),
            content_type,
            expires_at,
        };
        Ok((header, payload))
    }

    /// Rebuild a value from what [`CacheValue::encode`] produced
    pub fn decode(header: &ValueHeader, payload: Vec<u8>) -> Result<Self> {
        match header.kind {
            ValueKind::Text => String::from_utf8(payload)
                .map(CacheValue::Text)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            ValueKind::Binary => Ok(CacheValue::Binary(payload)),
            ValueKind::Structured => Ok(CacheValue::Structured(serde_json::from_slice(&payload)?)),
            ValueKind::Image => Ok(CacheValue::Image(Image {
                content_type: header
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                bytes: payload,
            })),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            CacheValue::Text(text) => Ok(text),
            other => Err(mismatch(ValueKind::Text, other.kind())),
        }
    }

    /// Raw bytes of a binary or image value
    pub fn into_binary(self) -> Result<Vec<u8>> {
        match self {
            CacheValue::Binary(bytes) => Ok(bytes),
            CacheValue::Image(image) => Ok(image.bytes),
            other => Err(mismatch(ValueKind::Binary, other.kind())),
        }
    }

    pub fn into_structured<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            CacheValue::Structured(value) => Ok(serde_json::from_value(value)?),
            other => Err(mismatch(ValueKind::Structured, other.kind())),
        }
    }

    pub fn into_image(self) -> Result<Image> {
        match self {
            CacheValue::Image(image) => Ok(image),
            other => Err(mismatch(ValueKind::Image, other.kind())),
        }
    }
}

impl Weighted for CacheValue {
    fn weight(&self) -> u64 {
        match self {
            CacheValue::Text(text) => text.len() as u64,
            CacheValue::Binary(bytes) => bytes.len() as u64,
            CacheValue::Structured(value) => serde_json::to_vec(value)
                .map(|v| v.len() as u64)
                .unwrap_or(0),
            CacheValue::Image(image) => image.bytes.len() as u64,
        }
    }
}

fn mismatch(expected: ValueKind, found: ValueKind) -> CacheError {
    CacheError::TypeMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Photo {
        url: String,
        width: u32,
    }

    #[test]
    fn test_image_header_carries_content_type() {
        let value = CacheValue::image("image/png", vec![0x89, b'P', b'N', b'G']);
        let (header, payload) = value.encode(None).unwrap();

        assert_eq!(header.kind, ValueKind::Image);
        assert_eq!(header.content_type.as_deref(), Some("image/png"));
        assert_eq!(payload, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(CacheValue::decode(&header, payload).unwrap(), value);
    }

    #[test]
    fn test_header_json_shape() {
        let header = ValueHeader {
            kind: ValueKind::Text,
            content_type: None,
            expires_at: None,
        };
        assert_eq!(serde_json::to_string(&header).unwrap(), r#"{"kind":"text"}"#);
    }

    #[test]
    fn test_structured_value() {
        let photo = Photo {
            url: "https://example.com/1.jpg".to_string(),
            width: 640,
        };
        let value = CacheValue::structured(&photo).unwrap();
        let (header, payload) = value.encode(None).unwrap();
        let decoded = CacheValue::decode(&header, payload).unwrap();
        assert_eq!(decoded.into_structured::<Photo>().unwrap(), photo);
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let header = ValueHeader {
            kind: ValueKind::Text,
            content_type: None,
            expires_at: None,
        };
        assert!(matches!(
            CacheValue::decode(&header, vec![0xff, 0xfe]),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn test_typed_accessors() {
        assert_eq!(
            CacheValue::Text("hi".to_string()).into_text().unwrap(),
            "hi"
        );
        assert_eq!(
            CacheValue::image("image/jpeg", vec![1, 2]).into_binary().unwrap(),
            vec![1, 2]
        );
        assert!(matches!(
            CacheValue::Binary(vec![1]).into_text(),
            Err(CacheError::TypeMismatch { .. })
        ));
        assert!(matches!(
            CacheValue::Structured(json!({"a": 1})).into_image(),
            Err(CacheError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut header = ValueHeader {
            kind: ValueKind::Binary,
            content_type: None,
            expires_at: None,
        };
        assert!(!header.is_expired(now));

        header.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(header.is_expired(now));

        header.expires_at = Some(now + chrono::Duration::seconds(60));
        assert!(!header.is_expired(now));
    }

    #[test]
    fn test_weight() {
        assert_eq!(CacheValue::Text("héllo".to_string()).weight(), 6);
        assert_eq!(CacheValue::Binary(vec![0; 10]).weight(), 10);
        assert_eq!(CacheValue::Structured(json!([1, 2])).weight(), 5);
    }
}
