//! Wire codec: the binary envelope for one message and its framing codec.
//!
//! - **message**: envelope types (`Message`, `MessageClass`, `MessageKind`)
//!   and the normative header layout
//! - **codec**: `MessageCodec` for `FramedRead`/`FramedWrite` stream use

mod codec;
mod message;

pub use codec::{CodecError, MessageCodec};
pub use message::{
    FLAG_EXPECTS_RESPONSE, FLAG_IS_RESPONSE, HandleRef, InterfaceId, MAX_HANDLES_PER_MESSAGE,
    MAX_PAYLOAD_BYTES, MalformedMessage, Message, MessageClass, MessageKind, RESERVED_CLASS_COUNT,
    RequestId,
};
