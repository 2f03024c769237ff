//! Per-connection driver task
//!
//! Owns the socket and the multiplexer core for one authority. Runs the
//! upgrade handshake (queueing commands that arrive meanwhile), then loops
//! over socket reads, user commands and the disposal timer, draining the
//! core's microtasks and outbox after every stimulus.

use super::channel::{ChannelEvent, Encoding};
use super::connection::Connection;
use super::DISPOSE_LINGER;
use crate::config::ClientConfig;
use crate::handshake::{self, Endpoint};
use crate::wire::Mode;
use crate::Error;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Commands from channel handles and the pool to the connection driver
pub(crate) enum Command {
    Open {
        key: u64,
        id: u32,
        mode: Mode,
        token: Bytes,
        events: mpsc::UnboundedSender<ChannelEvent>,
    },
    Write {
        key: u64,
        payload: Bytes,
        text: bool,
        priority: u8,
        done: oneshot::Sender<bool>,
    },
    Dispatch {
        key: u64,
        payload: Bytes,
        done: oneshot::Sender<bool>,
    },
    End {
        key: u64,
        message: Option<String>,
    },
    SetEncoding {
        key: u64,
        encoding: Option<Encoding>,
    },
}

pub(crate) async fn run(
    endpoint: Endpoint,
    config: ClientConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let scheme = if endpoint.secure { "https" } else { "http" };
    let authority = format!("{}://{}:{}", scheme, endpoint.host, endpoint.port);
    let mut conn = Connection::new(authority);

    let dispose = sleep(DISPOSE_LINGER);
    tokio::pin!(dispose);
    let mut dispose_armed = false;

    // Handshake phase: accept and queue commands while the upgrade runs.
    let upgrade = handshake::upgrade(&endpoint, &config);
    tokio::pin!(upgrade);
    let (mut socket, leftover) = loop {
        if conn.is_disposed() && !dispose_armed {
            dispose.as_mut().reset(Instant::now() + DISPOSE_LINGER);
        }
        dispose_armed = conn.is_disposed();

        tokio::select! {
            result = &mut upgrade => {
                match result {
                    Ok(pair) => break pair,
                    Err(err) => {
                        conn.destroy(Some(Arc::new(Error::from(err))), None);
                        drain_commands(&mut conn, &mut cmd_rx);
                        return;
                    }
                }
            }
            command = cmd_rx.recv() => {
                match command {
                    Some(command) => {
                        conn.command(command);
                        conn.run_tasks();
                    }
                    None => {
                        conn.destroy(None, None);
                        return;
                    }
                }
            }
            _ = &mut dispose, if dispose_armed => {
                debug!("connection idle before handshake completion");
                conn.destroy(None, None);
                drain_commands(&mut conn, &mut cmd_rx);
                return;
            }
        }
    };

    conn.socket_ready();
    // Bytes past the response headers already belong to the frame stream.
    conn.receive(&leftover);
    conn.run_tasks();

    let mut read_buf = vec![0u8; 8192];
    let mut dispose_armed = false;
    loop {
        // Flush everything the core produced before waiting again.
        while let Some((owner, buf)) = conn.next_outbound() {
            match socket.write_all(&buf).await {
                Ok(()) => conn.outbound_done(owner, buf.len()),
                Err(err) => {
                    conn.destroy(Some(Arc::new(Error::Transport(err))), None);
                    break;
                }
            }
        }
        if conn.is_dead() {
            break;
        }

        if conn.is_disposed() && !dispose_armed {
            dispose.as_mut().reset(Instant::now() + DISPOSE_LINGER);
        }
        dispose_armed = conn.is_disposed();

        tokio::select! {
            read = socket.read(&mut read_buf) => {
                match read {
                    Ok(0) => conn.destroy(Some(Arc::new(Error::ConnectionClosed)), None),
                    Ok(n) => conn.receive(&read_buf[..n]),
                    Err(err) => conn.destroy(Some(Arc::new(Error::Transport(err))), None),
                }
            }
            command = cmd_rx.recv() => {
                match command {
                    Some(command) => conn.command(command),
                    None => conn.destroy(None, None),
                }
            }
            _ = &mut dispose, if dispose_armed => {
                debug!("disposal window expired");
                conn.destroy(None, None);
            }
        }
        conn.run_tasks();
    }

    drain_commands(&mut conn, &mut cmd_rx);

    let _ = socket.shutdown().await;
}

/// Serve commands already queued against a dead connection, so late openers
/// observe their close and writers get their reply.
fn drain_commands(conn: &mut Connection, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) {
    while let Ok(command) = cmd_rx.try_recv() {
        conn.command(command);
    }
}
