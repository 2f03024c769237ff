//! Channel URL parsing
//!
//! `[http(s)://]host[:port][/<chan-id>|/x<hex-chan-id>][?<url-encoded-token>]`
//!
//! The path selects the channel id (decimal, or hex with an `x` prefix),
//! defaulting to 1. The query component, percent-decoded, becomes the opaque
//! handshake token of the OPEN request.

use crate::wire::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::Error;
use bytes::Bytes;
use percent_encoding::percent_decode_str;

/// Maximum token size accepted in an OPEN request payload
pub const MAX_TOKEN_SIZE: usize = MAX_PAYLOAD_SIZE - FRAME_HEADER_SIZE;

/// A parsed channel URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUrl {
    /// Whether the connection uses TLS (`https`)
    pub secure: bool,
    /// Host name or address, lowercased
    pub host: String,
    /// Port, defaulted from the scheme when absent
    pub port: u16,
    /// Target channel id
    pub channel: u32,
    /// Percent-decoded token from the query component
    pub token: Bytes,
}

impl ChannelUrl {
    /// Parse a channel URL
    pub fn parse(input: &str) -> Result<Self, Error> {
        let rest = input.trim();

        let (secure, rest) = if let Some(tail) = strip_scheme(rest, "https://") {
            (true, tail)
        } else if let Some(tail) = strip_scheme(rest, "http://") {
            (false, tail)
        } else if rest.contains("://") {
            return Err(Error::Validation(format!("Unsupported URL scheme: {}", input)));
        } else {
            (false, rest)
        };

        let rest = rest.split('#').next().unwrap_or(rest);
        let (rest, query) = match rest.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, Some(path)),
            None => (rest, None),
        };

        let (host, port) = parse_authority(authority, secure)?;
        let channel = parse_channel(path)?;
        let token = parse_token(query)?;

        Ok(Self {
            secure,
            host,
            port,
            channel,
            token,
        })
    }

    /// Pool key for this endpoint: `scheme://host:port`
    pub fn authority(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Value for the `Host` request header, omitting the default port
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn strip_scheme<'a>(input: &'a str, scheme: &str) -> Option<&'a str> {
    if input.len() >= scheme.len() && input[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&input[scheme.len()..])
    } else {
        None
    }
}

fn parse_authority(authority: &str, secure: bool) -> Result<(String, u16), Error> {
    if authority.is_empty() {
        return Err(Error::Validation("Missing host in URL".to_string()));
    }

    let (host, port_str) = if let Some(tail) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal
        let end = tail
            .find(']')
            .ok_or_else(|| Error::Validation(format!("Invalid host: {}", authority)))?;
        let host = &tail[..end];
        match &tail[end + 1..] {
            "" => (host, None),
            rest => match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => {
                    return Err(Error::Validation(format!("Invalid host: {}", authority)))
                }
            },
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(Error::Validation("Missing host in URL".to_string()));
    }

    let port = match port_str {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| Error::Validation(format!("Invalid port: {}", port)))?,
        None => {
            if secure {
                443
            } else {
                80
            }
        }
    };

    Ok((host.to_ascii_lowercase(), port))
}

fn parse_channel(path: Option<&str>) -> Result<u32, Error> {
    let path = match path {
        None | Some("") => return Ok(1),
        Some(path) => path,
    };

    if path.contains('/') {
        return Err(Error::Validation(format!("Invalid channel path: /{}", path)));
    }

    let channel = if let Some(hex) = path.strip_prefix(&['x', 'X'][..]) {
        u32::from_str_radix(hex, 16)
    } else {
        path.parse::<u32>()
    }
    .map_err(|_| Error::Validation(format!("Invalid channel id: {}", path)))?;

    if channel == 0 {
        return Err(Error::Validation(
            "Channel id 0 is reserved for broadcast".to_string(),
        ));
    }

    Ok(channel)
}

fn parse_token(query: Option<&str>) -> Result<Bytes, Error> {
    let query = match query {
        None | Some("") => return Ok(Bytes::new()),
        Some(query) => query,
    };

    let decoded: Vec<u8> = percent_decode_str(query).collect();
    if decoded.len() > MAX_TOKEN_SIZE {
        return Err(Error::Validation(format!(
            "Token too large: {} > {}",
            decoded.len(),
            MAX_TOKEN_SIZE
        )));
    }

    Ok(Bytes::from(decoded))
}
