//! Wire layer for the winksock/1 protocol
//!
//! Provides:
//! - Frame encoding/decoding
//! - Incremental packet reassembly
//! - Channel mode bitset and its textual grammar

mod frame;
mod mode;

pub use frame::{
    Decoder, Frame, Opcode, OpenFlag, SignalFlag, ALL_CHANNELS, FRAME_HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use mode::Mode;

use thiserror::Error;

/// Wire layer errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad packet size")]
    BadPacketSize,

    #[error("Bad open resp")]
    BadOpenResponse,

    #[error("unknown SIGFLAG")]
    UnknownSignalFlag,

    #[error("invalid opcode: {0}")]
    InvalidOpcode(u8),

    #[error("invalid mode expression: {0:?}")]
    InvalidMode(String),
}
