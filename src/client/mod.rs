//! Client core
//!
//! Provides:
//! - Connection multiplexer (one socket per authority, channel-indexed
//!   dispatch, disposal and reuse)
//! - Per-id OPEN request pipeline
//! - Channel handles with buffered writes during the open handshake

mod channel;
mod connection;
mod driver;
mod pool;
mod request;

pub use channel::{Channel, ChannelEvent, Encoding, Message};
pub use pool::Client;

use std::time::Duration;

/// Outbound bytes enqueued past this mark report writes as unflushed
pub(crate) const WRITE_HIGH_WATER: usize = 64 * 1024;

/// How long an idle connection keeps its socket awaiting reuse
pub(crate) const DISPOSE_LINGER: Duration = Duration::from_millis(200);
