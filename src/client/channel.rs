//! Channel handles and their event surface

use super::driver::Command;
use crate::wire::{Mode, MAX_PAYLOAD_SIZE};
use crate::Error;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Decoding applied to inbound DATA payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Ascii,
    Utf8,
    /// Binary payloads surfaced as base64 text
    Base64,
    /// Payloads parsed as JSON; a parse failure destroys the channel
    Json,
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ascii" => Ok(Encoding::Ascii),
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "base64" => Ok(Encoding::Base64),
            "json" => Ok(Encoding::Json),
            _ => Err(Error::Validation(format!("Unknown encoding: {}", s))),
        }
    }
}

/// A decoded inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Binary(Bytes),
    Text(String),
    Json(serde_json::Value),
}

impl Message {
    /// Text content, when the payload decoded as text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Events delivered on a channel, in order.
///
/// `Connect` always precedes the first `Data`/`Signal`/`Drain`; `Close`
/// fires exactly once and is always last, with `Error` (if any) immediately
/// before it.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The OPEN resolved; `id` is the final channel id (a server REDIRECT
    /// may differ from the requested one)
    Connect { id: u32 },
    /// Inbound DATA with its user-facing priority (1..=4)
    Data { message: Message, priority: u8 },
    /// Inbound out-of-band EMIT signal
    Signal { message: Message },
    /// Outbound backpressure cleared
    Drain,
    Error(Arc<Error>),
    Close {
        had_error: bool,
        message: Option<String>,
    },
}

/// A logical duplex message stream multiplexed over a shared connection.
///
/// Writes made before the channel finishes opening are buffered and flushed
/// in order once the server grants the open. Dropping the handle ends the
/// channel.
pub struct Channel {
    key: u64,
    mode: Mode,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    id: Option<u32>,
    ended: bool,
    closed: bool,
}

impl Channel {
    pub(crate) fn new(
        key: u64,
        mode: Mode,
        cmd_tx: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self {
            key,
            mode,
            cmd_tx,
            events,
            id: None,
            ended: false,
            closed: false,
        }
    }

    /// Resolved channel id; `None` until `Connect` has been received
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether the final `Close` event has been received
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Receive the next event. Returns `None` once the channel is closed
    /// and its event queue exhausted.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let event = self.events.recv().await;
        match &event {
            Some(ChannelEvent::Connect { id }) => self.id = Some(*id),
            Some(ChannelEvent::Close { .. }) => self.closed = true,
            _ => {}
        }
        event
    }

    /// Write a binary payload.
    ///
    /// Returns the flushedness of the underlying write: `false` when the
    /// payload was buffered (during open, under backpressure, or because the
    /// connection is gone).
    pub async fn write(&self, data: impl Into<Bytes>, priority: u8) -> Result<bool, Error> {
        self.send_data(data.into(), false, priority).await
    }

    /// Write a UTF-8 text payload
    pub async fn write_text(&self, text: &str, priority: u8) -> Result<bool, Error> {
        self.send_data(Bytes::copy_from_slice(text.as_bytes()), true, priority)
            .await
    }

    /// Write a binary payload supplied as base64 text
    pub async fn write_base64(&self, encoded: &str, priority: u8) -> Result<bool, Error> {
        let data = BASE64
            .decode(encoded)
            .map_err(|e| Error::Validation(format!("Invalid base64 payload: {}", e)))?;
        self.send_data(Bytes::from(data), false, priority).await
    }

    /// Write a JSON payload
    pub async fn write_json(
        &self,
        value: &serde_json::Value,
        priority: u8,
    ) -> Result<bool, Error> {
        let data = serde_json::to_vec(value)
            .map_err(|e| Error::Validation(format!("Invalid JSON payload: {}", e)))?;
        self.send_data(Bytes::from(data), true, priority).await
    }

    /// Emit a binary out-of-band signal
    pub async fn dispatch(&self, data: impl Into<Bytes>) -> Result<bool, Error> {
        self.send_signal(data.into()).await
    }

    /// Emit a UTF-8 text signal
    pub async fn dispatch_text(&self, text: &str) -> Result<bool, Error> {
        self.send_signal(Bytes::copy_from_slice(text.as_bytes()))
            .await
    }

    /// Emit a JSON signal
    pub async fn dispatch_json(&self, value: &serde_json::Value) -> Result<bool, Error> {
        let data = serde_json::to_vec(value)
            .map_err(|e| Error::Validation(format!("Invalid JSON payload: {}", e)))?;
        self.send_signal(Bytes::from(data)).await
    }

    /// Close the channel, optionally with a goodbye message. Idempotent.
    pub fn end(&mut self, message: Option<&str>) {
        if self.ended {
            return;
        }
        self.ended = true;
        let _ = self.cmd_tx.send(Command::End {
            key: self.key,
            message: message.map(str::to_string),
        });
    }

    /// Set the decoding applied to inbound DATA payloads
    pub fn set_encoding(&self, encoding: Option<Encoding>) {
        let _ = self.cmd_tx.send(Command::SetEncoding {
            key: self.key,
            encoding,
        });
    }

    async fn send_data(&self, payload: Bytes, text: bool, priority: u8) -> Result<bool, Error> {
        if !self.mode.writable() {
            return Err(Error::Validation("Channel is not writable".to_string()));
        }
        if !(1..=4).contains(&priority) {
            return Err(Error::Validation(format!("Invalid priority: {}", priority)));
        }
        check_payload_size(&payload)?;

        let (done_tx, done_rx) = oneshot::channel();
        let command = Command::Write {
            key: self.key,
            payload,
            text,
            priority,
            done: done_tx,
        };
        if self.cmd_tx.send(command).is_err() {
            // Dead connection: writes report unflushed, silently.
            return Ok(false);
        }
        Ok(done_rx.await.unwrap_or(false))
    }

    async fn send_signal(&self, payload: Bytes) -> Result<bool, Error> {
        if !self.mode.emitable() {
            return Err(Error::Validation("Channel is not emitable".to_string()));
        }
        check_payload_size(&payload)?;

        let (done_tx, done_rx) = oneshot::channel();
        let command = Command::Dispatch {
            key: self.key,
            payload,
            done: done_tx,
        };
        if self.cmd_tx.send(command).is_err() {
            return Ok(false);
        }
        Ok(done_rx.await.unwrap_or(false))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.cmd_tx.send(Command::End {
                key: self.key,
                message: None,
            });
        }
    }
}

fn check_payload_size(payload: &Bytes) -> Result<(), Error> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::Validation(format!(
            "Payload too large: {} > {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}
