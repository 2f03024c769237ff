//! Frame encoding/decoding for the winksock/1 protocol
//!
//! Frame format:
//! ```text
//! +-----------------+--------------------------+
//! |   Length (2B)   |      Channel ID (4B)     |
//! +-----------------+--------------------------+
//! |  Descriptor (1B): op << 3 | flag           |
//! +--------------------------------------------+
//! |                  Payload                   |
//! +--------------------------------------------+
//! ```
//!
//! The length is big-endian and includes the 7-byte header. Channel id 0 is
//! the ALL_CHANNELS wildcard, valid only on inbound DATA/SIGNAL dispatch.

use super::WireError;
use crate::wire::Mode;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes (also the minimum frame length)
pub const FRAME_HEADER_SIZE: usize = 7;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = 10240;

/// Wildcard channel id used by the server to broadcast to every channel
pub const ALL_CHANNELS: u32 = 0;

/// Frame operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// No operation (ignored on receipt)
    Noop = 0x0,
    /// Channel open request/response
    Open = 0x1,
    /// Channel payload
    Data = 0x2,
    /// Out-of-band signal
    Signal = 0x3,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Noop),
            0x1 => Ok(Opcode::Open),
            0x2 => Ok(Opcode::Data),
            0x3 => Ok(Opcode::Signal),
            _ => Err(WireError::InvalidOpcode(value)),
        }
    }
}

/// Server responses to an OPEN request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenFlag {
    /// Channel granted under the requested id
    Allow = 0x0,
    /// Channel granted under a server-assigned id (payload = 4-byte id)
    Redirect = 0x1,
    /// Channel refused (payload = UTF-8 reason)
    Deny = 0x7,
}

impl TryFrom<u8> for OpenFlag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpenFlag::Allow),
            0x1 => Ok(OpenFlag::Redirect),
            0x7 => Ok(OpenFlag::Deny),
            _ => Err(WireError::BadOpenResponse),
        }
    }
}

/// SIGNAL frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalFlag {
    /// User-level out-of-band message
    Emit = 0x0,
    /// Close handshake
    End = 0x1,
    /// Channel or connection error
    Error = 0x7,
}

impl TryFrom<u8> for SignalFlag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x0 => Ok(SignalFlag::Emit),
            0x1 => Ok(SignalFlag::End),
            0x7 => Ok(SignalFlag::Error),
            _ => Err(WireError::UnknownSignalFlag),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Channel id (0 = ALL_CHANNELS)
    pub channel: u32,
    /// Frame operation
    pub op: Opcode,
    /// Low 3 bits of the descriptor
    pub flag: u8,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create an OPEN request frame; the flag carries the mode bitset and
    /// the payload the opaque handshake token.
    pub fn open(channel: u32, mode: Mode, token: Bytes) -> Self {
        Self {
            channel,
            op: Opcode::Open,
            flag: mode.bits(),
            payload: token,
        }
    }

    /// Create a DATA frame. `priority` is the user-facing 1..=4 value.
    pub fn data(channel: u32, text: bool, priority: u8, payload: Bytes) -> Self {
        debug_assert!((1..=4).contains(&priority));
        Self {
            channel,
            op: Opcode::Data,
            flag: ((priority - 1) << 1) | u8::from(text),
            payload,
        }
    }

    /// Create a SIGNAL frame
    pub fn signal(channel: u32, flag: SignalFlag, payload: Bytes) -> Self {
        Self {
            channel,
            op: Opcode::Signal,
            flag: flag as u8,
            payload,
        }
    }

    /// Whether a DATA frame carries text (UTF-8) rather than binary
    pub fn is_text(&self) -> bool {
        self.flag & 0x1 != 0
    }

    /// User-facing priority (1..=4) of a DATA frame
    pub fn priority(&self) -> u8 {
        ((self.flag >> 1) & 0x3) + 1
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let total_len = FRAME_HEADER_SIZE + self.payload.len();
        debug_assert!(total_len <= u16::MAX as usize);

        let mut buf = BytesMut::with_capacity(total_len);

        buf.put_u16(total_len as u16);
        buf.put_u32(self.channel);
        buf.put_u8(((self.op as u8) << 3) | (self.flag & 0x7));
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Decode one frame from the front of `buf`. Returns `Ok(None)` when the
    /// buffer does not yet hold a complete frame; the partial bytes stay put.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, WireError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let total_len = ((buf[0] as usize) << 8) | (buf[1] as usize);
        if total_len < FRAME_HEADER_SIZE {
            return Err(WireError::BadPacketSize);
        }
        if buf.len() < total_len {
            return Ok(None);
        }

        let mut frame = buf.split_to(total_len);
        frame.advance(2);
        let channel = frame.get_u32();
        let desc = frame.get_u8();

        // Legacy descriptor bit-twiddle, preserved for wire compatibility.
        let op = Opcode::try_from(((((desc as u16) >> 1) & 0xF) >> 2) as u8)?;
        let flag = ((((desc as u16) << 1) & 0xF) >> 1) as u8;

        Ok(Some(Self {
            channel,
            op,
            flag,
            payload: frame.freeze(),
        }))
    }
}

/// Incremental frame parser.
///
/// Feeds arbitrary chunks from the socket and yields complete frames,
/// retaining any residual tail across calls.
#[derive(Debug, Default)]
pub struct Decoder {
    residual: BytesMut,
}

impl Decoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk received from the socket
    pub fn feed(&mut self, chunk: &[u8]) {
        self.residual.extend_from_slice(chunk);
    }

    /// Pull the next complete frame, if any
    pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        Frame::decode(&mut self.residual)
    }

    /// Number of buffered bytes awaiting a complete frame
    pub fn pending(&self) -> usize {
        self.residual.len()
    }
}
