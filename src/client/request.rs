//! Pending OPEN requests

use crate::wire::{Frame, Mode};
use bytes::Bytes;

/// A pending OPEN for a channel id.
///
/// Requests targeting the same id queue FIFO on the connection; only the
/// front of the queue may be transmitted, so opens serialize when an id is
/// reused. `present` marks the request as queued for transmission and guards
/// against double scheduling; `sent` is set just before the frame is
/// encoded, after which the request can no longer be cancelled.
#[derive(Debug)]
pub(crate) struct OpenRequest {
    /// Arena key of the channel awaiting this open
    pub chan: u64,
    pub id: u32,
    pub mode: Mode,
    pub token: Bytes,
    pub present: bool,
    pub sent: bool,
}

impl OpenRequest {
    pub fn new(chan: u64, id: u32, mode: Mode, token: Bytes) -> Self {
        Self {
            chan,
            id,
            mode,
            token,
            present: false,
            sent: false,
        }
    }

    /// The OPEN frame transmitted to the server for this request
    pub fn to_frame(&self) -> Frame {
        Frame::open(self.id, self.mode, self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Opcode;

    #[test]
    fn test_open_request_frame() {
        let mode: Mode = "rw+e".parse().unwrap();
        let request = OpenRequest::new(9, 0x44, mode, Bytes::from_static(b"token"));

        let frame = request.to_frame();
        assert_eq!(frame.op, Opcode::Open);
        assert_eq!(frame.channel, 0x44);
        assert_eq!(frame.flag, mode.bits());
        assert_eq!(&frame.payload[..], b"token");
        assert!(!request.present);
        assert!(!request.sent);
    }
}
