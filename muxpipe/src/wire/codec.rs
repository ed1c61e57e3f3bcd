//! Streaming codec for the message envelope.
//!
//! Implements the tokio-util `Decoder`/`Encoder` traits so the pipe works
//! over any `AsyncRead`/`AsyncWrite` transport. Framing is the binary header
//! from [`super::message`], not a generic length prefix, because the header
//! itself carries the lengths the receiver must validate.

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{
    FrameStatus, MalformedMessage, Message, parse_frame, truncation_error,
    MAX_HANDLES_PER_MESSAGE, MAX_PAYLOAD_BYTES,
};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames [`Message`] values over a byte stream.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        match parse_frame(src)? {
            FrameStatus::Incomplete { needed } => {
                src.reserve(needed.saturating_sub(src.len()));
                Ok(None)
            }
            FrameStatus::Complete { message, consumed } => {
                src.advance(consumed);
                tracing::trace!(
                    interface_id = %message.interface_id,
                    class = message.class.raw(),
                    frame_bytes = consumed,
                    "Decoded frame"
                );
                Ok(Some(message))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.is_empty() {
            return Ok(None);
        }
        match parse_frame(src)? {
            FrameStatus::Complete { message, consumed } => {
                src.advance(consumed);
                Ok(Some(message))
            }
            // A partial frame at EOF cannot complete; the stream is corrupt.
            FrameStatus::Incomplete { needed } => {
                Err(truncation_error(src.len(), needed).into())
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        if item.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(MalformedMessage::PayloadTooLarge(item.payload.len()).into());
        }
        if item.handles.len() > MAX_HANDLES_PER_MESSAGE {
            return Err(MalformedMessage::TooManyHandles(item.handles.len()).into());
        }
        let frame_bytes = item.encoded_len();
        tracing::trace!(
            interface_id = %item.interface_id,
            class = item.class.raw(),
            frame_bytes,
            "Encoding frame"
        );
        item.encode_into(dst);
        Ok(())
    }
}
