use crate::message::{Codec, CodecError, MessageHeader, UnixMillis};
use crate::provider::MessageStatus;

use base64::Engine;
use serde::Serialize;

/// Base64 engine used to render binary bodies into `message_text`.
const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// One row of the outbox ledger.
///
/// Created Pending at registration time, mutated only through the
/// provider's atomic operations afterwards. `message_id` is the primary
/// key and is immutable, as is the header; everything else is dispatch
/// state owned by whichever process currently holds `lock_id`.
#[derive(Clone, Debug)]
pub struct OutboxEntry {
    pub message_id: i64,
    pub exchange: String,
    pub routing_key: String,
    pub header: MessageHeader,
    pub body: Vec<u8>,
    /// Optional human-readable rendering of the body, for operators
    /// browsing the ledger. Derived at registration when not set.
    pub text: Option<String>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub next_retry_time: Option<UnixMillis>,
    pub lock_id: Option<String>,
    pub lock_time: Option<UnixMillis>,
    pub last_error: Option<String>,
    pub create_time: UnixMillis,
    pub update_time: UnixMillis,
}

impl OutboxEntry {
    /// Create a Pending entry from a header and an already-encoded body.
    /// The destination exchange and routing key are taken from the header.
    pub fn new(header: MessageHeader, body: Vec<u8>) -> Self {
        let now = UnixMillis::now();
        Self {
            message_id: header.message_id,
            exchange: header.exchange.clone(),
            routing_key: header.routing_key.clone(),
            header,
            body,
            text: None,
            status: MessageStatus::Pending,
            retry_count: 0,
            next_retry_time: None,
            lock_id: None,
            lock_time: None,
            last_error: None,
            create_time: now,
            update_time: now,
        }
    }

    /// Create a Pending entry by encoding `payload` with the codec named
    /// by the header's content type.
    pub fn encode<T: Serialize>(header: MessageHeader, payload: &T) -> Result<Self, CodecError> {
        let codec = Codec::for_content_type(&header.content_type)?;
        let body = codec.encode(payload)?;
        Ok(Self::new(header, body))
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Human-readable rendering of the body: the body itself when it is
    /// UTF-8, base64 otherwise.
    pub fn display_text(&self) -> String {
        match std::str::from_utf8(&self.body) {
            Ok(text) => text.to_string(),
            Err(_) => BASE64.encode(&self.body),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == MessageStatus::Succeeded
    }
}
