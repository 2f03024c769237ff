//! HTTP/1.1 Upgrade handshake
//!
//! One-shot client handshake that upgrades a TCP (or TLS) stream to the
//! winksock/1 framing protocol:
//!
//! ```text
//! GET / HTTP/1.1
//! Host: <host>
//! Connection: Upgrade
//! Upgrade: winksock/1
//! Origin: <origin>
//! User-Agent: <agent>
//! [X-Accept-Redirects: no]
//! ```
//!
//! A `101` with `Upgrade: winksock/1` yields the raw byte stream; `301`,
//! `302` and `307` are re-dispatched against the `Location` URL (at most
//! five hops) when redirects are enabled; any other status fails with the
//! status reason text.

use crate::config::ClientConfig;
use crate::transport::{Socket, TransportError};
use crate::url::ChannelUrl;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Protocol token expected in the `Upgrade` response header
pub const UPGRADE_PROTOCOL: &str = "winksock/1";

/// Maximum number of redirect hops followed before giving up
pub const MAX_REDIRECTS: usize = 5;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest failure body read back for the error reason
const MAX_REASON_BODY: usize = 4096;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Non-upgrade HTTP status; the display text is the status reason
    #[error("{reason}")]
    Status { code: u16, reason: String },

    #[error("Max HTTP redirections reached")]
    MaxRedirects,

    #[error("Bad protocol version")]
    BadProtocolVersion,

    #[error("Invalid HTTP response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upgrade target, derived from the channel URL (the channel id and token
/// play no part in the handshake).
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub secure: bool,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl From<&ChannelUrl> for Endpoint {
    fn from(url: &ChannelUrl) -> Self {
        Self {
            secure: url.secure,
            host: url.host.clone(),
            port: url.port,
        }
    }
}

/// Perform the upgrade handshake against `endpoint`.
///
/// On success returns the established socket together with any bytes the
/// server sent past the response headers; those belong to the frame stream
/// and must be fed to the decoder first.
pub async fn upgrade(
    endpoint: &Endpoint,
    config: &ClientConfig,
) -> Result<(Socket, Vec<u8>), HandshakeError> {
    let mut target = endpoint.clone();

    for hop in 0..=MAX_REDIRECTS {
        let socket = Socket::connect(&target.host, target.port, target.secure).await?;
        let mut reader = BufReader::new(socket);

        send_request(reader.get_mut(), &target, config).await?;

        let response = tokio::time::timeout(RESPONSE_TIMEOUT, read_response(&mut reader))
            .await
            .map_err(|_| TransportError::Timeout)??;

        match response.code {
            101 => {
                let token = response.header("upgrade").unwrap_or("");
                if !token.eq_ignore_ascii_case(UPGRADE_PROTOCOL) {
                    return Err(HandshakeError::BadProtocolVersion);
                }
                debug!(host = %target.host, port = target.port, "upgrade accepted");
                let leftover = reader.buffer().to_vec();
                return Ok((reader.into_inner(), leftover));
            }
            301 | 302 | 307 if config.follow_redirects => {
                let location = response.header("location").ok_or_else(|| {
                    HandshakeError::InvalidResponse("redirect without Location".to_string())
                })?;
                target = parse_location(location)?;
                debug!(hop, location, "following redirect");
            }
            code => {
                let body =
                    tokio::time::timeout(RESPONSE_TIMEOUT, read_body(&mut reader, &response))
                        .await
                        .map_err(|_| TransportError::Timeout)?
                        .unwrap_or_default();
                let reason = if body.is_empty() {
                    response.reason
                } else {
                    format!("{} ({})", response.reason, body)
                };
                return Err(HandshakeError::Status { code, reason });
            }
        }
    }

    Err(HandshakeError::MaxRedirects)
}

async fn send_request<W: AsyncWrite + Unpin>(
    socket: &mut W,
    target: &Endpoint,
    config: &ClientConfig,
) -> Result<(), HandshakeError> {
    let mut request = String::with_capacity(256);
    request.push_str("GET / HTTP/1.1\r\n");
    request.push_str(&format!("Host: {}\r\n", target.host_header()));
    request.push_str("Connection: Upgrade\r\n");
    request.push_str(&format!("Upgrade: {}\r\n", UPGRADE_PROTOCOL));
    request.push_str(&format!("Origin: {}\r\n", config.origin_for(&target.host)));
    request.push_str(&format!("User-Agent: {}\r\n", config.agent()));
    if !config.follow_redirects {
        request.push_str("X-Accept-Redirects: no\r\n");
    }
    request.push_str("\r\n");

    socket.write_all(request.as_bytes()).await?;
    Ok(())
}

struct Response {
    code: u16,
    reason: String,
    headers: HashMap<String, String>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Response, HandshakeError> {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    if status_line.is_empty() {
        return Err(HandshakeError::InvalidResponse(
            "connection closed during handshake".to_string(),
        ));
    }

    let mut parts = status_line.trim().splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(HandshakeError::InvalidResponse(format!(
            "bad status line: {}",
            status_line.trim()
        )));
    }
    let code = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            HandshakeError::InvalidResponse(format!("bad status line: {}", status_line.trim()))
        })?;
    let reason = parts.next().unwrap_or("").trim().to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim();

        if line.is_empty() {
            break;
        }

        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    Ok(Response {
        code,
        reason,
        headers,
    })
}

async fn read_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    response: &Response,
) -> Result<String, HandshakeError> {
    let len = match response
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        Some(len) if len > 0 => len.min(MAX_REASON_BODY),
        _ => return Ok(String::new()),
    };

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(String::from_utf8_lossy(&body).trim().to_string())
}

fn parse_location(location: &str) -> Result<Endpoint, HandshakeError> {
    let url = ChannelUrl::parse(location).map_err(|_| {
        HandshakeError::InvalidResponse(format!("bad redirect location: {}", location))
    })?;
    Ok(Endpoint::from(&url))
}
