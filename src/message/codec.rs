//! Body codecs selected by content type.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Content type for JSON-encoded bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type for bitcode (compact binary) bodies.
pub const CONTENT_TYPE_BITCODE: &str = "application/x-bitcode";

/// Error type for encode/decode operations.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary codec error: {0}")]
    Binary(#[from] bitcode::Error),

    #[error("payload is not a {expected}: {reason}")]
    WrongPayloadType {
        expected: &'static str,
        reason: String,
    },
}

/// Body codec, selected per message by the header's content type.
///
/// Two encodings are supported: JSON for interoperability and bitcode for
/// compact binary payloads. A content type that maps to neither is a
/// decode error, which the consume pipeline treats as terminal (the
/// conservative-default branch, never retried).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Json,
    Bitcode,
}

impl Codec {
    /// Select a codec for a content type. Parameters after `;` (such as
    /// `charset=utf-8`) are ignored.
    pub fn for_content_type(content_type: &str) -> Result<Self, CodecError> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim();
        match essence {
            CONTENT_TYPE_JSON | "text/json" => Ok(Self::Json),
            CONTENT_TYPE_BITCODE | "application/octet-stream" => Ok(Self::Bitcode),
            other => Err(CodecError::UnsupportedContentType(other.to_string())),
        }
    }

    /// The canonical content type this codec produces.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => CONTENT_TYPE_JSON,
            Self::Bitcode => CONTENT_TYPE_BITCODE,
        }
    }

    pub fn encode<T: Serialize>(self, payload: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(payload)?),
            Self::Bitcode => Ok(bitcode::serialize(payload)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, body: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => Ok(serde_json::from_slice(body)?),
            Self::Bitcode => Ok(bitcode::deserialize(body)?),
        }
    }
}
