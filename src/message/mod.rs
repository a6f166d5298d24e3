//! Message identity, headers, and body codecs.
//!
//! Everything a message carries besides its payload lives here: the
//! [`MessageHeader`] registered with the ledger, the snowflake-style
//! [`IdGenerator`] that mints numeric message ids, the [`UnixMillis`]
//! timestamps every ledger row is stamped with, and the [`Codec`] that
//! encodes and decodes payload bytes by content type.

mod codec;
mod header;
mod id;
mod time;

pub use codec::{Codec, CodecError, CONTENT_TYPE_BITCODE, CONTENT_TYPE_JSON};
pub use header::MessageHeader;
pub use id::IdGenerator;
pub use time::UnixMillis;
