//! # winksock
//!
//! Client for the winksock/1 multiplexed messaging protocol: any number of
//! logical channels share one TCP socket per authority, established through
//! an HTTP/1.1 Upgrade.
//!
//! ## Features
//!
//! - **Multiplexing**: channels are independently readable, writable and
//!   signal-capable, dispatched by a 32-bit id over a shared connection
//! - **Connection reuse**: idle connections linger briefly and are revived
//!   in place by the next open
//! - **Buffered opens**: writes made while a channel is still opening are
//!   queued and flushed in order once the server grants it
//! - **TLS**: `https` endpoints upgrade over rustls
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Application                        │
//! │        (Channel handles: write/dispatch/end)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Client core                         │
//! │   (connection pool, multiplexer, OPEN pipeline)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Wire framing                        │
//! │      (length-prefixed frames, reassembly)            │
//! ├─────────────────────────────────────────────────────┤
//! │              Upgrade handshake / transport           │
//! │                 (HTTP/1.1, TCP, TLS)                 │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use winksock::{ChannelEvent, Client};
//!
//! # async fn run() -> winksock::Result<()> {
//! let mut client = Client::new();
//! let mut channel = client.connect("http://localhost:7010/x112233", "rw")?;
//!
//! while let Some(event) = channel.recv().await {
//!     match event {
//!         ChannelEvent::Connect { id } => {
//!             println!("open as {}", id);
//!             channel.write_text("Hello", 1).await?;
//!         }
//!         ChannelEvent::Data { message, priority } => {
//!             println!("got {:?} at priority {}", message, priority);
//!         }
//!         ChannelEvent::Close { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod handshake;
pub mod transport;
pub mod url;
pub mod wire;

pub use client::{Channel, ChannelEvent, Client, Encoding, Message};
pub use config::ClientConfig;
pub use wire::{Mode, ALL_CHANNELS, MAX_PAYLOAD_SIZE};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad mode, URL, priority or payload size; raised synchronously at the
    /// call site without touching connection state
    #[error("{0}")]
    Validation(String),

    /// The upgrade handshake failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] handshake::HandshakeError),

    /// The server refused the OPEN request
    #[error("{0}")]
    OpenDenied(String),

    /// Protocol violation; fatal to the whole connection
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Socket failure; fatal to the whole connection
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Inbound payload decode failure; fatal to the one channel
    #[error("{0}")]
    Payload(String),

    /// Error signalled by the server on a channel or the connection
    #[error("{0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<wire::WireError> for Error {
    fn from(err: wire::WireError) -> Self {
        Error::Protocol(err.to_string())
    }
}
