//! Message envelope and binary header layout.
//!
//! Header layout (all fields little-endian):
//! payload length u32, interface id u32, message class u32, flags u32,
//! request id u64 (present iff `EXPECTS_RESPONSE` or `IS_RESPONSE` is set),
//! handle count u32, `handle count` x u64 handle references, payload bytes.

use std::fmt;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};

/// The message expects a response carrying its request id.
pub const FLAG_EXPECTS_RESPONSE: u32 = 1 << 0;
/// The message is a response to an earlier request.
pub const FLAG_IS_RESPONSE: u32 = 1 << 1;

const KNOWN_FLAGS: u32 = FLAG_EXPECTS_RESPONSE | FLAG_IS_RESPONSE;

/// Fixed header prefix before any conditional fields: payload length,
/// interface id, message class, flags.
const FIXED_PREFIX: usize = 16;

/// Hard cap on declared payload size. A length field is attacker-controlled
/// input; decoding must never allocate based on it unchecked.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Hard cap on attached handles per message.
pub const MAX_HANDLES_PER_MESSAGE: usize = 64;

/// Message classes below this value are reserved for the control sub-protocol.
pub const RESERVED_CLASS_COUNT: u32 = 2;

/// Identifier of one logical interface multiplexed over a shared pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub u32);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier correlating a two-way request with its response. Unique among
/// outstanding calls on one endpoint at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a transferable OS handle. The pipe moves these
/// alongside the payload; their meaning belongs to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleRef(pub u64);

/// Message class, routing a frame to the control channel or the application
/// dispatch table. The reserved range is fixed, so this is a sum type rather
/// than a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Two-way control call (`QueryVersion` rides on this).
    Run,
    /// One-way control directive (`RequireVersion` rides on this).
    RunOrClosePipe,
    /// Application-defined class. Valid values are `>= RESERVED_CLASS_COUNT`.
    Application(u32),
}

impl MessageClass {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Run,
            1 => Self::RunOrClosePipe,
            other => Self::Application(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Run => 0,
            Self::RunOrClosePipe => 1,
            Self::Application(raw) => raw,
        }
    }

    /// Whether this class belongs to the reserved control range.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Run | Self::RunOrClosePipe)
    }
}

/// Direction/shape of a message. Encodes the two flag bits and carries the
/// request id exactly when one of them is set, so the "request id present iff
/// a flag is set" invariant holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    OneWay,
    Request(RequestId),
    Response(RequestId),
}

impl MessageKind {
    pub fn flags(self) -> u32 {
        match self {
            Self::OneWay => 0,
            Self::Request(_) => FLAG_EXPECTS_RESPONSE,
            Self::Response(_) => FLAG_IS_RESPONSE,
        }
    }

    pub fn request_id(self) -> Option<RequestId> {
        match self {
            Self::OneWay => None,
            Self::Request(id) | Self::Response(id) => Some(id),
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, Self::Response(_))
    }
}

/// One framed message: header fields, attached handles, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub interface_id: InterfaceId,
    pub class: MessageClass,
    pub kind: MessageKind,
    pub handles: Vec<HandleRef>,
    pub payload: Bytes,
}

impl Message {
    pub fn one_way(interface_id: InterfaceId, class: MessageClass, payload: Bytes) -> Self {
        Self {
            interface_id,
            class,
            kind: MessageKind::OneWay,
            handles: Vec::new(),
            payload,
        }
    }

    pub fn request(
        interface_id: InterfaceId,
        class: MessageClass,
        request_id: RequestId,
        payload: Bytes,
    ) -> Self {
        Self {
            interface_id,
            class,
            kind: MessageKind::Request(request_id),
            handles: Vec::new(),
            payload,
        }
    }

    pub fn response(
        interface_id: InterfaceId,
        class: MessageClass,
        request_id: RequestId,
        payload: Bytes,
    ) -> Self {
        Self {
            interface_id,
            class,
            kind: MessageKind::Response(request_id),
            handles: Vec::new(),
            payload,
        }
    }

    pub fn with_handles(mut self, handles: Vec<HandleRef>) -> Self {
        self.handles = handles;
        self
    }

    /// Total encoded size of this message, header included.
    pub fn encoded_len(&self) -> usize {
        let request_id_len = if self.kind.request_id().is_some() { 8 } else { 0 };
        FIXED_PREFIX + request_id_len + 4 + self.handles.len() * 8 + self.payload.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_u32_le(self.interface_id.0);
        dst.put_u32_le(self.class.raw());
        dst.put_u32_le(self.kind.flags());
        if let Some(request_id) = self.kind.request_id() {
            dst.put_u64_le(request_id.0);
        }
        dst.put_u32_le(self.handles.len() as u32);
        for handle in &self.handles {
            dst.put_u64_le(handle.0);
        }
        dst.put_slice(&self.payload);
    }

    /// Decode a message from a complete buffer. The buffer must contain
    /// exactly one frame; every declared length is validated against the
    /// actual buffer before any offset is touched.
    pub fn decode(buf: &[u8]) -> Result<Self, MalformedMessage> {
        match parse_frame(buf)? {
            FrameStatus::Complete { message, consumed } => {
                if consumed < buf.len() {
                    return Err(MalformedMessage::TrailingBytes {
                        extra: buf.len() - consumed,
                    });
                }
                Ok(message)
            }
            FrameStatus::Incomplete { needed } => Err(truncation_error(buf.len(), needed)),
        }
    }
}

/// Decode-time framing failures. Any of these poisons the byte stream; the
/// pipe must close since resynchronization is impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("truncated header: need {needed} bytes, have {have}")]
    TruncatedHeader { needed: usize, have: usize },

    #[error("truncated body: frame declares {declared} bytes, have {have}")]
    TruncatedBody { declared: usize, have: usize },

    #[error("reserved flag bits set: {flags:#010x}")]
    ReservedFlags { flags: u32 },

    #[error("declared payload length {0} exceeds the per-message cap")]
    PayloadTooLarge(usize),

    #[error("declared handle count {0} exceeds the per-message cap")]
    TooManyHandles(usize),

    #[error("{extra} trailing bytes after a complete frame")]
    TrailingBytes { extra: usize },
}

pub(crate) fn truncation_error(have: usize, needed: usize) -> MalformedMessage {
    if have < FIXED_PREFIX {
        MalformedMessage::TruncatedHeader {
            needed: FIXED_PREFIX,
            have,
        }
    } else {
        MalformedMessage::TruncatedBody {
            declared: needed,
            have,
        }
    }
}

pub(crate) enum FrameStatus {
    /// More bytes are required; `needed` is the total frame length known so
    /// far (a lower bound until the full header is available).
    Incomplete { needed: usize },
    Complete { message: Message, consumed: usize },
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Parse a single frame from the front of `buf` without consuming it.
/// Validation happens in header order so a malformed prefix is reported even
/// when the rest of the frame has not arrived yet.
pub(crate) fn parse_frame(buf: &[u8]) -> Result<FrameStatus, MalformedMessage> {
    if buf.len() < FIXED_PREFIX {
        return Ok(FrameStatus::Incomplete {
            needed: FIXED_PREFIX,
        });
    }

    let payload_len = read_u32(buf, 0) as usize;
    let interface_id = InterfaceId(read_u32(buf, 4));
    let class = MessageClass::from_raw(read_u32(buf, 8));
    let flags = read_u32(buf, 12);

    if flags & !KNOWN_FLAGS != 0 {
        return Err(MalformedMessage::ReservedFlags { flags });
    }
    // A message cannot be a request and a response at once.
    if flags & KNOWN_FLAGS == KNOWN_FLAGS {
        return Err(MalformedMessage::ReservedFlags { flags });
    }
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(MalformedMessage::PayloadTooLarge(payload_len));
    }

    let mut offset = FIXED_PREFIX;
    let request_id = if flags & KNOWN_FLAGS != 0 {
        if buf.len() < offset + 8 {
            return Ok(FrameStatus::Incomplete { needed: offset + 8 });
        }
        let id = RequestId(read_u64(buf, offset));
        offset += 8;
        Some(id)
    } else {
        None
    };

    if buf.len() < offset + 4 {
        return Ok(FrameStatus::Incomplete { needed: offset + 4 });
    }
    let handle_count = read_u32(buf, offset) as usize;
    offset += 4;
    if handle_count > MAX_HANDLES_PER_MESSAGE {
        return Err(MalformedMessage::TooManyHandles(handle_count));
    }

    let total = offset + handle_count * 8 + payload_len;
    if buf.len() < total {
        return Ok(FrameStatus::Incomplete { needed: total });
    }

    let mut handles = Vec::with_capacity(handle_count);
    for _ in 0..handle_count {
        handles.push(HandleRef(read_u64(buf, offset)));
        offset += 8;
    }

    let payload = Bytes::copy_from_slice(&buf[offset..offset + payload_len]);

    let kind = match (flags & FLAG_IS_RESPONSE != 0, request_id) {
        (false, None) => MessageKind::OneWay,
        (false, Some(id)) => MessageKind::Request(id),
        (true, Some(id)) => MessageKind::Response(id),
        // IS_RESPONSE implies a request id by the flag check above.
        (true, None) => unreachable!("response flag without request id"),
    };

    Ok(FrameStatus::Complete {
        message: Message {
            interface_id,
            class,
            kind,
            handles,
            payload,
        },
        consumed: total,
    })
}
