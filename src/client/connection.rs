//! Connection multiplexer core
//!
//! One `Connection` owns every channel opened against a single authority and
//! demultiplexes the inbound frame stream to them. The core is synchronous:
//! the driver task feeds it socket chunks and user commands, drains the
//! microtask queue after every stimulus, and flushes the outbox it produces.
//! All per-channel events leave through the channel's own mpsc sender.

use super::channel::{ChannelEvent, Encoding, Message};
use super::driver::Command;
use super::request::OpenRequest;
use super::WRITE_HIGH_WATER;
use crate::wire::{Decoder, Frame, Mode, Opcode, OpenFlag, SignalFlag, ALL_CHANNELS};
use crate::Error;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Upgrade handshake in flight; work queues against the connection
    Connecting,
    /// Socket established, frames flowing
    Live,
    /// No channels or requests remain; socket retained for quick reuse
    Disposed,
    /// Terminal
    Dead,
}

/// Per-channel state held by the connection
struct ChannelSlot {
    /// Resolved id; set when the OPEN resolves (a REDIRECT rewrites it)
    id: Option<u32>,
    mode: Mode,
    encoding: Option<Encoding>,
    /// OPEN not yet resolved
    connecting: bool,
    /// `connect` has been delivered
    connected: bool,
    closing: bool,
    /// Registered under `by_id` and counted in `chan_refs`
    registered: bool,
    /// Exists exactly while connecting; drained once on open
    write_queue: Option<VecDeque<Frame>>,
    /// END frame deferred until the OPEN response arrives
    end_signal: Option<Frame>,
    /// Bytes this channel has enqueued to the socket but not yet flushed
    queued_bytes: usize,
    /// A write reported unflushed; emit `drain` once the bytes leave
    wants_drain: bool,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelSlot {
    fn emit(&self, event: ChannelEvent) {
        // The user may have dropped the handle; events then go nowhere.
        let _ = self.events.send(event);
    }
}

/// Deferred one-tick operations
enum Task {
    /// Fail a channel that targeted an id already in use
    FailChannel { key: u64, error: Arc<Error> },
    /// Transmit the head OPEN request for an id
    SendRequest { id: u32 },
}

pub(crate) struct Connection {
    authority: String,
    state: ConnState,
    /// The handshake has completed at least once (revival target state)
    socket_seen: bool,
    chans: HashMap<u64, ChannelSlot>,
    by_id: HashMap<u32, u64>,
    requests: HashMap<u32, VecDeque<OpenRequest>>,
    chan_refs: usize,
    req_refs: usize,
    decoder: Decoder,
    /// Encoded frames awaiting the socket, tagged with the channel that
    /// enqueued them (None for control frames)
    outbox: VecDeque<(Option<u64>, Bytes)>,
    tasks: VecDeque<Task>,
}

impl Connection {
    pub(crate) fn new(authority: String) -> Self {
        Self {
            authority,
            state: ConnState::Connecting,
            socket_seen: false,
            chans: HashMap::new(),
            by_id: HashMap::new(),
            requests: HashMap::new(),
            chan_refs: 0,
            req_refs: 0,
            decoder: Decoder::new(),
            outbox: VecDeque::new(),
            tasks: VecDeque::new(),
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state == ConnState::Dead
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state == ConnState::Disposed
    }

    /// Apply one user command
    pub(crate) fn command(&mut self, command: Command) {
        match command {
            Command::Open {
                key,
                id,
                mode,
                token,
                events,
            } => self.open_channel(key, id, mode, token, events),
            Command::Write {
                key,
                payload,
                text,
                priority,
                done,
            } => {
                let _ = done.send(self.chan_write(key, payload, text, priority));
            }
            Command::Dispatch { key, payload, done } => {
                let _ = done.send(self.chan_dispatch(key, payload));
            }
            Command::End { key, message } => self.chan_end(key, message),
            Command::SetEncoding { key, encoding } => {
                if let Some(chan) = self.chans.get_mut(&key) {
                    chan.encoding = encoding;
                }
            }
        }
    }

    /// Drain the microtask queue. Called by the driver after every stimulus.
    pub(crate) fn run_tasks(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            if self.state == ConnState::Dead {
                break;
            }
            match task {
                Task::FailChannel { key, error } => {
                    self.finalize_channel(key, Some(error), None)
                }
                Task::SendRequest { id } => self.send_request(id),
            }
        }
    }

    /// The upgrade handshake completed; flush pending OPEN requests.
    pub(crate) fn socket_ready(&mut self) {
        self.socket_seen = true;
        if self.state == ConnState::Connecting {
            self.state = ConnState::Live;
        }
        if self.state != ConnState::Live {
            return;
        }
        debug!(authority = %self.authority, "handshake complete");
        let ids: Vec<u32> = self.requests.keys().copied().collect();
        for id in ids {
            self.send_request(id);
        }
    }

    /// Feed an inbound socket chunk through the frame decoder.
    pub(crate) fn receive(&mut self, chunk: &[u8]) {
        if self.state == ConnState::Dead {
            return;
        }
        self.decoder.feed(chunk);
        loop {
            // Halt immediately if the connection died mid-dispatch.
            if self.state != ConnState::Live {
                break;
            }
            match self.decoder.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => break,
                Err(err) => {
                    self.destroy(Some(Arc::new(Error::from(err))), None);
                    break;
                }
            }
        }
    }

    /// Pop the next encoded frame awaiting transmission, tagged with the
    /// channel that enqueued it
    pub(crate) fn next_outbound(&mut self) -> Option<(Option<u64>, Bytes)> {
        self.outbox.pop_front()
    }

    /// Credit `len` flushed bytes back to the owning channel, emitting
    /// `drain` once a pressured channel has nothing left in flight.
    pub(crate) fn outbound_done(&mut self, owner: Option<u64>, len: usize) {
        let Some(key) = owner else {
            return;
        };
        let Some(chan) = self.chans.get_mut(&key) else {
            return;
        };
        chan.queued_bytes = chan.queued_bytes.saturating_sub(len);
        if chan.queued_bytes == 0 && chan.wants_drain {
            chan.wants_drain = false;
            if chan.connected && !chan.closing {
                chan.emit(ChannelEvent::Drain);
            }
        }
    }

    /// Terminal teardown: fan the error to every channel and request, clear
    /// all state. Idempotent.
    pub(crate) fn destroy(&mut self, error: Option<Arc<Error>>, message: Option<String>) {
        if self.state == ConnState::Dead {
            return;
        }
        self.state = ConnState::Dead;
        match &error {
            Some(err) => warn!(authority = %self.authority, error = %err, "connection destroyed"),
            None => debug!(authority = %self.authority, "connection closed"),
        }

        let keys: Vec<u64> = self.chans.keys().copied().collect();
        for key in keys {
            self.finalize_channel(key, error.clone(), message.clone());
        }

        self.requests.clear();
        self.by_id.clear();
        self.tasks.clear();
        self.outbox.clear();
        self.chan_refs = 0;
        self.req_refs = 0;
    }

    fn open_channel(
        &mut self,
        key: u64,
        id: u32,
        mode: Mode,
        token: Bytes,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        if self.state == ConnState::Dead {
            let _ = events.send(ChannelEvent::Error(Arc::new(Error::ConnectionClosed)));
            let _ = events.send(ChannelEvent::Close {
                had_error: true,
                message: None,
            });
            return;
        }

        if self.state == ConnState::Disposed {
            self.state = if self.socket_seen {
                ConnState::Live
            } else {
                ConnState::Connecting
            };
            debug!(authority = %self.authority, "connection revived");
        }

        self.chans.insert(
            key,
            ChannelSlot {
                id: None,
                mode,
                encoding: None,
                connecting: true,
                connected: false,
                closing: false,
                registered: false,
                write_queue: Some(VecDeque::new()),
                end_signal: None,
                queued_bytes: 0,
                wants_drain: false,
                events,
            },
        );

        // A live, non-closing channel already holds this id.
        if let Some(&held) = self.by_id.get(&id) {
            let live = self.chans.get(&held).map(|c| !c.closing).unwrap_or(false);
            if live {
                trace!(id, "open target already in use");
                self.tasks.push_back(Task::FailChannel {
                    key,
                    error: Arc::new(Error::Validation("Channel is already open".to_string())),
                });
                return;
            }
        }

        let blocked = self.by_id.contains_key(&id);
        let live = self.state == ConnState::Live;
        let queue = self.requests.entry(id).or_default();
        let mut request = OpenRequest::new(key, id, mode, token);
        let mut schedule = false;
        if queue.is_empty() && !blocked {
            // Head of a fresh queue; transmit on the next tick (or when the
            // handshake completes).
            request.present = true;
            schedule = live;
        }
        queue.push_back(request);
        self.req_refs += 1;
        if schedule {
            self.tasks.push_back(Task::SendRequest { id });
        }
    }

    fn chan_write(&mut self, key: u64, payload: Bytes, text: bool, priority: u8) -> bool {
        let Some(chan) = self.chans.get_mut(&key) else {
            return false;
        };
        if chan.closing {
            return false;
        }
        if chan.connecting {
            if let Some(queue) = chan.write_queue.as_mut() {
                // Placeholder id; rewritten when the OPEN resolves.
                queue.push_back(Frame::data(0, text, priority, payload));
            }
            return false;
        }
        let Some(id) = chan.id else {
            return false;
        };
        self.push_frame(&Frame::data(id, text, priority, payload), Some(key))
    }

    fn chan_dispatch(&mut self, key: u64, payload: Bytes) -> bool {
        let Some(chan) = self.chans.get_mut(&key) else {
            return false;
        };
        if chan.closing {
            return false;
        }
        if chan.connecting {
            if let Some(queue) = chan.write_queue.as_mut() {
                queue.push_back(Frame::signal(0, SignalFlag::Emit, payload));
            }
            return false;
        }
        let Some(id) = chan.id else {
            return false;
        };
        self.push_frame(&Frame::signal(id, SignalFlag::Emit, payload), Some(key))
    }

    fn chan_end(&mut self, key: u64, message: Option<String>) {
        let Some(chan) = self.chans.get_mut(&key) else {
            return;
        };
        if chan.closing {
            return;
        }
        let payload = message
            .map(|m| Bytes::from(m.into_bytes()))
            .unwrap_or_default();

        if chan.connecting {
            chan.closing = true;
            chan.end_signal = Some(Frame::signal(0, SignalFlag::End, payload));
            if self.try_cancel_request(key) {
                // Never transmitted; the channel dies silently.
                self.finalize_channel(key, None, None);
            }
            // Otherwise the OPEN is in flight; the END runs once it resolves.
            return;
        }

        chan.closing = true;
        let Some(id) = chan.id else {
            return;
        };
        self.push_frame(&Frame::signal(id, SignalFlag::End, payload), None);
    }

    // ---- OPEN pipeline ---------------------------------------------------

    /// Transmit the head request for `id` if it is ready to go.
    fn send_request(&mut self, id: u32) {
        if self.state != ConnState::Live {
            return;
        }
        // A closing channel still holds the id; wait for its END handshake.
        if self.by_id.contains_key(&id) {
            return;
        }
        let frame = {
            let Some(queue) = self.requests.get_mut(&id) else {
                return;
            };
            let Some(head) = queue.front_mut() else {
                return;
            };
            if !head.present || head.sent {
                return;
            }
            head.sent = true;
            head.to_frame()
        };
        trace!(id, "transmitting OPEN");
        self.push_frame(&frame, None);
    }

    /// Remove the queued, unsent request for channel `key`. Returns false if
    /// the request was already transmitted (the response must be awaited).
    fn try_cancel_request(&mut self, key: u64) -> bool {
        let mut found: Option<(u32, bool)> = None;
        for (&id, queue) in self.requests.iter_mut() {
            if let Some(pos) = queue.iter().position(|r| r.chan == key) {
                if queue[pos].sent {
                    return false;
                }
                let was_head = pos == 0;
                queue.remove(pos);
                found = Some((id, was_head));
                break;
            }
        }
        let Some((id, was_head)) = found else {
            return false;
        };
        self.req_refs -= 1;
        if self.requests.get(&id).map(VecDeque::is_empty).unwrap_or(false) {
            self.requests.remove(&id);
        } else if was_head {
            self.promote_head(id);
        }
        self.maybe_dispose();
        true
    }

    /// Mark the new head of `id`'s queue for transmission on the next tick.
    fn promote_head(&mut self, id: u32) {
        if self.by_id.contains_key(&id) {
            // Still blocked behind a closing channel.
            return;
        }
        let live = self.state == ConnState::Live;
        let mut schedule = false;
        if let Some(queue) = self.requests.get_mut(&id) {
            if let Some(head) = queue.front_mut() {
                if !head.sent && !head.present {
                    head.present = true;
                    schedule = live;
                }
            }
        }
        if schedule {
            self.tasks.push_back(Task::SendRequest { id });
        }
    }

    /// The END handshake for `id` completed; transmit a queued open at once.
    fn promote_and_send_now(&mut self, id: u32) {
        if let Some(queue) = self.requests.get_mut(&id) {
            if let Some(head) = queue.front_mut() {
                if !head.sent {
                    head.present = true;
                }
            }
        }
        self.send_request(id);
    }

    // ---- Inbound dispatch ------------------------------------------------

    fn handle_frame(&mut self, frame: Frame) {
        trace!(
            op = ?frame.op,
            channel = frame.channel,
            len = frame.payload.len(),
            "inbound frame"
        );
        match frame.op {
            Opcode::Noop => {}
            Opcode::Open => self.process_open(frame),
            Opcode::Data => self.process_data(frame),
            Opcode::Signal => self.process_signal(frame),
        }
    }

    fn process_open(&mut self, frame: Frame) {
        let id = frame.channel;
        if !self.requests.contains_key(&id) {
            self.destroy(
                Some(Arc::new(Error::Protocol(
                    "open response to unknown channel".to_string(),
                ))),
                None,
            );
            return;
        }

        let flag = match OpenFlag::try_from(frame.flag) {
            Ok(flag) => flag,
            Err(err) => {
                self.destroy(Some(Arc::new(Error::from(err))), None);
                return;
            }
        };

        match flag {
            OpenFlag::Allow => {
                let mut queue = self.requests.remove(&id).unwrap_or_default();
                if let Some(head) = queue.pop_front() {
                    self.req_refs -= 1;
                    self.resolve_open(head.chan, id);
                }
                // Everything queued behind the grant now collides with it.
                for successor in queue {
                    self.req_refs -= 1;
                    self.finalize_channel(
                        successor.chan,
                        Some(Arc::new(Error::Validation(
                            "Channel is already open".to_string(),
                        ))),
                        None,
                    );
                }
            }
            OpenFlag::Redirect => {
                if frame.payload.len() != 4 {
                    self.destroy(
                        Some(Arc::new(Error::Protocol("Bad open resp".to_string()))),
                        None,
                    );
                    return;
                }
                let new_id = u32::from_be_bytes([
                    frame.payload[0],
                    frame.payload[1],
                    frame.payload[2],
                    frame.payload[3],
                ]);
                let Some(head) = self.requests.get_mut(&id).and_then(VecDeque::pop_front)
                else {
                    return;
                };
                self.req_refs -= 1;
                if self.requests.get(&id).map(VecDeque::is_empty).unwrap_or(false) {
                    self.requests.remove(&id);
                }
                debug!(id, new_id, "open redirected");
                self.resolve_open(head.chan, new_id);
                // The successor was queued for the original id; it may go now.
                self.promote_head(id);
            }
            OpenFlag::Deny => {
                let Some(head) = self.requests.get_mut(&id).and_then(VecDeque::pop_front)
                else {
                    return;
                };
                self.req_refs -= 1;
                if self.requests.get(&id).map(VecDeque::is_empty).unwrap_or(false) {
                    self.requests.remove(&id);
                }
                let reason = if frame.payload.is_empty() {
                    "ERR_OPEN_DENIED".to_string()
                } else {
                    String::from_utf8_lossy(&frame.payload).into_owned()
                };
                debug!(id, %reason, "open denied");
                self.finalize_channel(head.chan, Some(Arc::new(Error::OpenDenied(reason))), None);
                self.promote_head(id);
            }
        }
    }

    /// Register the channel under its resolved id, emit `connect` and drain
    /// the write queue, or run the deferred END if the user already closed.
    fn resolve_open(&mut self, key: u64, id: u32) {
        let (pending_end, write_queue) = {
            let Some(chan) = self.chans.get_mut(&key) else {
                return;
            };
            chan.connecting = false;
            chan.id = Some(id);
            chan.registered = true;

            if chan.closing {
                let frame = chan.end_signal.take().map(|mut frame| {
                    frame.channel = id;
                    frame
                });
                chan.write_queue = None;
                (frame, None)
            } else {
                chan.connected = true;
                let queue = chan.write_queue.take();
                chan.emit(ChannelEvent::Connect { id });
                (None, queue)
            }
        };
        self.by_id.insert(id, key);
        self.chan_refs += 1;

        if let Some(frame) = pending_end {
            // User ended while the OPEN was in flight; close handshake now.
            self.push_frame(&frame, None);
            return;
        }

        debug!(id, "channel open");
        let queue = write_queue.unwrap_or_default();
        if queue.is_empty() {
            return;
        }
        let mut flushed = true;
        for mut frame in queue {
            frame.channel = id;
            flushed = self.push_frame(&frame, Some(key));
        }
        if flushed {
            if let Some(chan) = self.chans.get(&key) {
                chan.emit(ChannelEvent::Drain);
            }
        }
    }

    fn process_data(&mut self, frame: Frame) {
        let text = frame.is_text();
        let priority = frame.priority();
        if frame.channel == ALL_CHANNELS {
            let keys: Vec<u64> = self.by_id.values().copied().collect();
            for key in keys {
                self.deliver_data(key, frame.payload.clone(), text, priority);
            }
        } else if let Some(&key) = self.by_id.get(&frame.channel) {
            self.deliver_data(key, frame.payload, text, priority);
        }
    }

    fn deliver_data(&mut self, key: u64, payload: Bytes, text: bool, priority: u8) {
        let Some(chan) = self.chans.get(&key) else {
            return;
        };
        if !chan.mode.readable() || !chan.connected {
            return;
        }
        match decode_payload(chan.encoding, text, payload) {
            Ok(message) => chan.emit(ChannelEvent::Data { message, priority }),
            Err(reason) => {
                warn!(%reason, "inbound payload decode failed");
                self.finalize_channel(key, Some(Arc::new(Error::Payload(reason))), None);
            }
        }
    }

    fn process_signal(&mut self, frame: Frame) {
        let flag = match SignalFlag::try_from(frame.flag) {
            Ok(flag) => flag,
            Err(err) => {
                self.destroy(Some(Arc::new(Error::from(err))), None);
                return;
            }
        };
        match flag {
            SignalFlag::Emit => self.process_emit(frame),
            SignalFlag::End => self.process_end(frame),
            SignalFlag::Error => self.process_error(frame),
        }
    }

    fn process_emit(&mut self, frame: Frame) {
        if frame.channel == ALL_CHANNELS {
            let keys: Vec<u64> = self.by_id.values().copied().collect();
            for key in keys {
                self.deliver_signal(key, frame.payload.clone());
            }
        } else if let Some(&key) = self.by_id.get(&frame.channel) {
            self.deliver_signal(key, frame.payload);
        }
    }

    fn deliver_signal(&mut self, key: u64, payload: Bytes) {
        let Some(chan) = self.chans.get(&key) else {
            return;
        };
        if chan.closing || !chan.connected {
            return;
        }
        match decode_payload(chan.encoding, false, payload) {
            Ok(message) => chan.emit(ChannelEvent::Signal { message }),
            Err(reason) => {
                warn!(%reason, "inbound signal decode failed");
                self.finalize_channel(key, Some(Arc::new(Error::Payload(reason))), None);
            }
        }
    }

    fn process_end(&mut self, frame: Frame) {
        if frame.channel == ALL_CHANNELS {
            let message = utf8_message(&frame.payload);
            self.destroy(None, message);
            return;
        }
        let id = frame.channel;
        let Some(&key) = self.by_id.get(&id) else {
            // Protocol violation, tolerated.
            return;
        };
        let closing = self.chans.get(&key).map(|c| c.closing).unwrap_or(false);
        if closing {
            // Server acknowledged our END.
            self.finalize_channel(key, None, None);
        } else {
            // Server-initiated close; acknowledge, then finalize.
            self.push_frame(&Frame::signal(id, SignalFlag::End, Bytes::new()), None);
            let message = utf8_message(&frame.payload);
            self.finalize_channel(key, None, message);
        }
        // The id is free again; a queued open may transmit.
        self.promote_and_send_now(id);
    }

    fn process_error(&mut self, frame: Frame) {
        let reason = if frame.payload.is_empty() {
            "ERR_UNKNOWN".to_string()
        } else {
            String::from_utf8_lossy(&frame.payload).into_owned()
        };
        if frame.channel == ALL_CHANNELS {
            self.destroy(Some(Arc::new(Error::Remote(reason))), None);
            return;
        }
        let id = frame.channel;
        let Some(&key) = self.by_id.get(&id) else {
            return;
        };
        let closing = self.chans.get(&key).map(|c| c.closing).unwrap_or(false);
        if closing {
            self.finalize_channel(key, None, None);
        } else {
            self.push_frame(&Frame::signal(id, SignalFlag::End, Bytes::new()), None);
            self.finalize_channel(key, Some(Arc::new(Error::Remote(reason))), None);
        }
        self.promote_and_send_now(id);
    }

    // ---- Internals -------------------------------------------------------

    /// Emit `error` (if any) and the final `close`, unregister and release
    /// the channel. Exactly-once: the slot is removed first.
    fn finalize_channel(
        &mut self,
        key: u64,
        error: Option<Arc<Error>>,
        message: Option<String>,
    ) {
        let Some(chan) = self.chans.remove(&key) else {
            return;
        };
        let had_error = error.is_some();
        if let Some(err) = error {
            chan.emit(ChannelEvent::Error(err));
        }
        chan.emit(ChannelEvent::Close { had_error, message });

        if chan.registered {
            if let Some(id) = chan.id {
                if self.by_id.get(&id) == Some(&key) {
                    self.by_id.remove(&id);
                }
            }
            self.chan_refs -= 1;
        }
        self.maybe_dispose();
    }

    /// Serialize a frame into the outbox. The returned boolean is the owning
    /// channel's backpressure signal: false once that channel's unflushed
    /// bytes pass the high-water mark. Control frames always report true.
    fn push_frame(&mut self, frame: &Frame, owner: Option<u64>) -> bool {
        if self.state != ConnState::Live {
            return false;
        }
        let encoded = frame.encode();
        let len = encoded.len();
        self.outbox.push_back((owner, encoded.freeze()));

        let Some(key) = owner else {
            return true;
        };
        let Some(chan) = self.chans.get_mut(&key) else {
            return true;
        };
        chan.queued_bytes += len;
        let flushed = chan.queued_bytes <= WRITE_HIGH_WATER;
        if !flushed {
            chan.wants_drain = true;
        }
        flushed
    }

    fn maybe_dispose(&mut self) {
        if matches!(self.state, ConnState::Connecting | ConnState::Live)
            && self.chan_refs == 0
            && self.req_refs == 0
        {
            self.state = ConnState::Disposed;
            debug!(authority = %self.authority, "connection idle, entering disposal window");
        }
    }
}

/// Decode an inbound payload per the channel encoding, falling back to the
/// frame's text bit.
fn decode_payload(
    encoding: Option<Encoding>,
    text: bool,
    payload: Bytes,
) -> Result<Message, String> {
    match encoding {
        Some(Encoding::Json) => serde_json::from_slice(&payload)
            .map(Message::Json)
            .map_err(|e| e.to_string()),
        Some(Encoding::Utf8) | Some(Encoding::Ascii) => {
            Ok(Message::Text(String::from_utf8_lossy(&payload).into_owned()))
        }
        Some(Encoding::Base64) => Ok(Message::Text(BASE64.encode(&payload))),
        None if text => Ok(Message::Text(String::from_utf8_lossy(&payload).into_owned())),
        None => Ok(Message::Binary(payload)),
    }
}

fn utf8_message(payload: &Bytes) -> Option<String> {
    if payload.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(payload).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn conn() -> Connection {
        Connection::new("http://localhost:7010".to_string())
    }

    fn open(
        conn: &mut Connection,
        key: u64,
        id: u32,
        mode: &str,
    ) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        conn.open_channel(key, id, mode.parse().unwrap(), Bytes::new(), tx);
        rx
    }

    /// Drain and decode everything the connection wants to transmit.
    fn outbound(conn: &mut Connection) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some((owner, buf)) = conn.next_outbound() {
            let len = buf.len();
            let mut bytes = BytesMut::from(&buf[..]);
            while let Some(frame) = Frame::decode(&mut bytes).unwrap() {
                frames.push(frame);
            }
            conn.outbound_done(owner, len);
        }
        frames
    }

    fn allow(conn: &mut Connection, id: u32) {
        let frame = Frame {
            channel: id,
            op: Opcode::Open,
            flag: OpenFlag::Allow as u8,
            payload: Bytes::new(),
        };
        conn.receive(&frame.encode());
    }

    #[test]
    fn test_open_allow_connect_and_write() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 0x112233, "rw");
        c.socket_ready();
        c.run_tasks();

        let frames = outbound(&mut c);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].op, Opcode::Open);
        assert_eq!(frames[0].channel, 0x112233);
        assert_eq!(frames[0].flag, 0x3);

        allow(&mut c, 0x112233);
        assert!(matches!(
            rx.try_recv(),
            Ok(ChannelEvent::Connect { id: 0x112233 })
        ));

        assert!(c.chan_write(1, Bytes::from_static(b"Hello"), true, 1));
        let frames = outbound(&mut c);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].op, Opcode::Data);
        assert_eq!(frames[0].channel, 0x112233);
        assert!(frames[0].is_text());
        assert_eq!(frames[0].priority(), 1);
        assert_eq!(&frames[0].payload[..], b"Hello");
    }

    #[test]
    fn test_writes_buffer_during_opening_and_drain_in_order() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 4, "w");
        c.socket_ready();
        c.run_tasks();
        assert_eq!(outbound(&mut c).len(), 1); // the OPEN

        assert!(!c.chan_write(1, Bytes::from_static(b"A"), true, 1));
        assert!(!c.chan_write(1, Bytes::from_static(b"B"), true, 2));
        assert!(outbound(&mut c).is_empty());

        allow(&mut c, 4);
        assert!(matches!(rx.try_recv(), Ok(ChannelEvent::Connect { id: 4 })));

        let frames = outbound(&mut c);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].payload[..], b"A");
        assert_eq!(frames[0].channel, 4);
        assert_eq!(&frames[1].payload[..], b"B");
        assert_eq!(frames[1].channel, 4);
        assert_eq!(frames[1].priority(), 2);

        // The buffered writes all flushed, so the writer is told to resume.
        assert!(matches!(rx.try_recv(), Ok(ChannelEvent::Drain)));
    }

    #[test]
    fn test_redirect_rewrites_channel_id() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 1, "w");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);

        let redirect = Frame {
            channel: 1,
            op: Opcode::Open,
            flag: OpenFlag::Redirect as u8,
            payload: Bytes::from_static(&[0, 0, 0, 5]),
        };
        c.receive(&redirect.encode());

        assert!(matches!(rx.try_recv(), Ok(ChannelEvent::Connect { id: 5 })));

        c.chan_write(1, Bytes::from_static(b"x"), false, 1);
        let frames = outbound(&mut c);
        assert_eq!(frames[0].channel, 5);
    }

    #[test]
    fn test_malformed_redirect_destroys_connection() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 1, "w");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);

        let redirect = Frame {
            channel: 1,
            op: Opcode::Open,
            flag: OpenFlag::Redirect as u8,
            payload: Bytes::from_static(&[0, 5]),
        };
        c.receive(&redirect.encode());

        assert!(c.is_dead());
        match rx.try_recv() {
            Ok(ChannelEvent::Error(err)) => assert!(err.to_string().contains("Bad open resp")),
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(matches!(
            rx.try_recv(),
            Ok(ChannelEvent::Close { had_error: true, .. })
        ));
    }

    #[test]
    fn test_deny_fails_channel_without_connect() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 3, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);

        let deny = Frame {
            channel: 3,
            op: Opcode::Open,
            flag: OpenFlag::Deny as u8,
            payload: Bytes::from_static(b"NOT_ALLOWED"),
        };
        c.receive(&deny.encode());

        match rx.try_recv() {
            Ok(ChannelEvent::Error(err)) => assert_eq!(err.to_string(), "NOT_ALLOWED"),
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(matches!(
            rx.try_recv(),
            Ok(ChannelEvent::Close { had_error: true, .. })
        ));
        // No connect, and the idle connection enters its disposal window.
        assert!(rx.try_recv().is_err());
        assert!(c.is_disposed());
    }

    #[test]
    fn test_second_open_on_live_id_fails_async() {
        let mut c = conn();
        let _rx1 = open(&mut c, 1, 7, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 7);

        let mut rx2 = open(&mut c, 2, 7, "r");
        // The failure is deferred a tick so the caller holds the handle
        // before any event fires.
        assert!(rx2.try_recv().is_err());
        c.run_tasks();

        match rx2.try_recv() {
            Ok(ChannelEvent::Error(err)) => {
                assert_eq!(err.to_string(), "Channel is already open")
            }
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(matches!(
            rx2.try_recv(),
            Ok(ChannelEvent::Close { had_error: true, .. })
        ));
        // No OPEN went out for the second channel.
        assert!(outbound(&mut c).is_empty());
    }

    #[test]
    fn test_id_reuse_serializes_behind_end_handshake() {
        let mut c = conn();
        let mut rx1 = open(&mut c, 1, 1, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        assert!(matches!(rx1.try_recv(), Ok(ChannelEvent::Connect { .. })));

        c.chan_end(1, None);
        let frames = outbound(&mut c);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].op, Opcode::Signal);
        assert_eq!(frames[0].flag, SignalFlag::End as u8);

        // Second channel on the same id: no OPEN until the END is acked.
        let mut rx2 = open(&mut c, 2, 1, "rw");
        c.run_tasks();
        assert!(outbound(&mut c).is_empty());

        let ack = Frame::signal(1, SignalFlag::End, Bytes::new());
        c.receive(&ack.encode());

        // First channel closed silently; second OPEN transmitted.
        assert!(matches!(
            rx1.try_recv(),
            Ok(ChannelEvent::Close {
                had_error: false,
                message: None
            })
        ));
        let frames = outbound(&mut c);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].op, Opcode::Open);
        assert_eq!(frames[0].channel, 1);

        allow(&mut c, 1);
        assert!(matches!(rx2.try_recv(), Ok(ChannelEvent::Connect { id: 1 })));
    }

    #[test]
    fn test_cancel_before_transmission_finalizes_silently() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 2, "rw");
        // Handshake still in flight: the request was never transmitted.
        c.chan_end(1, None);

        assert!(matches!(
            rx.try_recv(),
            Ok(ChannelEvent::Close {
                had_error: false,
                message: None
            })
        ));
        assert!(c.is_disposed());

        // Nothing goes out once the handshake completes.
        c.socket_ready();
        c.run_tasks();
        assert!(outbound(&mut c).is_empty());
    }

    #[test]
    fn test_server_initiated_end_is_acknowledged() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 2, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 2);
        assert!(matches!(rx.try_recv(), Ok(ChannelEvent::Connect { .. })));

        let end = Frame::signal(2, SignalFlag::End, Bytes::from_static(b"bye"));
        c.receive(&end.encode());

        let frames = outbound(&mut c);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].op, Opcode::Signal);
        assert_eq!(frames[0].flag, SignalFlag::End as u8);
        assert!(frames[0].payload.is_empty());

        match rx.try_recv() {
            Ok(ChannelEvent::Close {
                had_error: false,
                message: Some(message),
            }) => assert_eq!(message, "bye"),
            other => panic!("expected close event, got {:?}", other),
        }
    }

    #[test]
    fn test_error_signal_fails_channel() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 2, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 2);
        rx.try_recv().unwrap();

        let error = Frame::signal(2, SignalFlag::Error, Bytes::from_static(b"broken"));
        c.receive(&error.encode());

        match rx.try_recv() {
            Ok(ChannelEvent::Error(err)) => assert_eq!(err.to_string(), "broken"),
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(matches!(
            rx.try_recv(),
            Ok(ChannelEvent::Close { had_error: true, .. })
        ));
        // The connection itself survives.
        assert!(!c.is_dead());
    }

    #[test]
    fn test_wildcard_data_broadcast() {
        let mut c = conn();
        let mut rx1 = open(&mut c, 1, 1, "r");
        let mut rx2 = open(&mut c, 2, 2, "rw");
        let mut rx3 = open(&mut c, 3, 3, "w");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        allow(&mut c, 2);
        allow(&mut c, 3);
        rx1.try_recv().unwrap();
        rx2.try_recv().unwrap();
        rx3.try_recv().unwrap();

        let broadcast = Frame::data(ALL_CHANNELS, true, 1, Bytes::from_static(b"all"));
        c.receive(&broadcast.encode());

        assert!(matches!(rx1.try_recv(), Ok(ChannelEvent::Data { .. })));
        assert!(matches!(rx2.try_recv(), Ok(ChannelEvent::Data { .. })));
        // Not readable: nothing delivered.
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn test_wildcard_end_closes_connection_cleanly() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 1, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        rx.try_recv().unwrap();

        let end = Frame::signal(ALL_CHANNELS, SignalFlag::End, Bytes::from_static(b"bye"));
        c.receive(&end.encode());

        assert!(c.is_dead());
        match rx.try_recv() {
            Ok(ChannelEvent::Close {
                had_error: false,
                message: Some(message),
            }) => assert_eq!(message, "bye"),
            other => panic!("expected close event, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_sigflag_destroys_connection() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 1, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        rx.try_recv().unwrap();

        let mut bogus = Frame::signal(1, SignalFlag::Emit, Bytes::new());
        bogus.flag = 0x3;
        c.receive(&bogus.encode());

        assert!(c.is_dead());
        match rx.try_recv() {
            Ok(ChannelEvent::Error(err)) => {
                assert!(err.to_string().contains("unknown SIGFLAG"))
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_packet_size_destroys_connection() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 1, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        rx.try_recv().unwrap();

        c.receive(&[0x00, 0x05, 0x01, 0x02, 0x03]);

        assert!(c.is_dead());
        match rx.try_recv() {
            Ok(ChannelEvent::Error(err)) => {
                assert!(err.to_string().contains("bad packet size"))
            }
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(matches!(
            rx.try_recv(),
            Ok(ChannelEvent::Close { had_error: true, .. })
        ));
    }

    #[test]
    fn test_open_response_for_unknown_id_is_fatal() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 1, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        rx.try_recv().unwrap();

        allow(&mut c, 99);
        assert!(c.is_dead());
    }

    #[test]
    fn test_json_decode_failure_is_fatal_to_one_channel() {
        let mut c = conn();
        let mut rx1 = open(&mut c, 1, 1, "r");
        let mut rx2 = open(&mut c, 2, 2, "r");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        allow(&mut c, 2);
        rx1.try_recv().unwrap();
        rx2.try_recv().unwrap();

        c.command(Command::SetEncoding {
            key: 1,
            encoding: Some(Encoding::Json),
        });

        let bad = Frame::data(1, true, 1, Bytes::from_static(b"{not json"));
        c.receive(&bad.encode());

        assert!(matches!(rx1.try_recv(), Ok(ChannelEvent::Error(_))));
        assert!(matches!(
            rx1.try_recv(),
            Ok(ChannelEvent::Close { had_error: true, .. })
        ));
        assert!(!c.is_dead());

        // The sibling channel still receives data.
        let good = Frame::data(2, true, 1, Bytes::from_static(b"ok"));
        c.receive(&good.encode());
        assert!(matches!(rx2.try_recv(), Ok(ChannelEvent::Data { .. })));
    }

    #[test]
    fn test_disposal_and_revival() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 1, "rw");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        rx.try_recv().unwrap();
        assert!(!c.is_disposed());

        c.chan_end(1, None);
        outbound(&mut c);
        let ack = Frame::signal(1, SignalFlag::End, Bytes::new());
        c.receive(&ack.encode());

        assert!(c.is_disposed());

        // A new channel revives the connection in place.
        let mut rx2 = open(&mut c, 2, 5, "rw");
        assert!(!c.is_disposed());
        c.run_tasks();
        let frames = outbound(&mut c);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].op, Opcode::Open);
        assert_eq!(frames[0].channel, 5);
        allow(&mut c, 5);
        assert!(matches!(rx2.try_recv(), Ok(ChannelEvent::Connect { id: 5 })));
    }

    #[test]
    fn test_emit_signal_delivery() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 1, "r");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        rx.try_recv().unwrap();

        let emit = Frame::signal(1, SignalFlag::Emit, Bytes::from_static(b"ping"));
        c.receive(&emit.encode());

        match rx.try_recv() {
            Ok(ChannelEvent::Signal {
                message: Message::Binary(payload),
            }) => assert_eq!(&payload[..], b"ping"),
            other => panic!("expected signal event, got {:?}", other),
        }
    }

    #[test]
    fn test_backpressure_and_drain_per_channel() {
        let mut c = conn();
        let mut rx1 = open(&mut c, 1, 1, "w");
        let mut rx2 = open(&mut c, 2, 2, "w");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        allow(&mut c, 2);
        rx1.try_recv().unwrap();
        rx2.try_recv().unwrap();

        // Pile writes onto channel 1 without flushing until it reports
        // unflushed; channel 2 is unaffected.
        let chunk = Bytes::from(vec![0u8; crate::wire::MAX_PAYLOAD_SIZE]);
        let mut pressured = false;
        for _ in 0..8 {
            pressured = !c.chan_write(1, chunk.clone(), false, 1);
            if pressured {
                break;
            }
        }
        assert!(pressured);
        assert!(c.chan_write(2, Bytes::from_static(b"tiny"), false, 1));

        // Flushing everything drains only the pressured channel.
        outbound(&mut c);
        assert!(matches!(rx1.try_recv(), Ok(ChannelEvent::Drain)));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_priority_round_trip_through_dispatch() {
        let mut c = conn();
        let mut rx = open(&mut c, 1, 1, "r");
        c.socket_ready();
        c.run_tasks();
        outbound(&mut c);
        allow(&mut c, 1);
        rx.try_recv().unwrap();

        let data = Frame::data(1, true, 4, Bytes::from_static(b"urgent"));
        c.receive(&data.encode());

        match rx.try_recv() {
            Ok(ChannelEvent::Data { message, priority }) => {
                assert_eq!(priority, 4);
                assert_eq!(message.as_text(), Some("urgent"));
            }
            other => panic!("expected data event, got {:?}", other),
        }
    }
}
