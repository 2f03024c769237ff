//! Connection pool

use super::channel::Channel;
use super::driver::{self, Command};
use crate::config::ClientConfig;
use crate::handshake::Endpoint;
use crate::url::ChannelUrl;
use crate::wire::Mode;
use crate::Error;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Entry point of the client: opens channels, pooling one connection per
/// authority.
///
/// Channels opened against the same `scheme://host:port` multiplex over a
/// single shared socket. A connection left without channels or pending
/// opens lingers briefly and is revived in place by the next open; once the
/// window expires it is torn down and the next open starts fresh.
pub struct Client {
    config: ClientConfig,
    next_key: u64,
    conns: HashMap<String, mpsc::UnboundedSender<Command>>,
}

impl Client {
    /// Create a client with the default configuration
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a client with an explicit configuration
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            next_key: 1,
            conns: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a channel.
    ///
    /// `url` is `[http(s)://]host[:port][/<chan-id>|/x<hex>][?token]` (the
    /// channel id defaults to 1); `mode` is a mode expression such as
    /// `"rw"` or `"read+emit"`. Validation failures are returned here;
    /// everything else, including handshake failures, surfaces as events
    /// on the returned handle. Must be called within a tokio runtime.
    pub fn connect(&mut self, url: &str, mode: &str) -> Result<Channel, Error> {
        let url = ChannelUrl::parse(url)?;
        let mode: Mode = mode
            .parse()
            .map_err(|err: crate::wire::WireError| Error::Validation(err.to_string()))?;

        let key = self.next_key;
        self.next_key += 1;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let command = Command::Open {
            key,
            id: url.channel,
            mode,
            token: url.token.clone(),
            events: event_tx,
        };

        let cmd_tx = self.acquire(&url);
        let cmd_tx = match cmd_tx.send(command) {
            Ok(()) => cmd_tx,
            Err(mpsc::error::SendError(command)) => {
                // The driver died between lookup and send; start a fresh one.
                let cmd_tx = self.spawn(&url);
                let _ = cmd_tx.send(command);
                cmd_tx
            }
        };

        Ok(Channel::new(key, mode, cmd_tx, event_rx))
    }

    /// Connection for the url's authority: the existing one while its
    /// driver is alive (disposed connections revive in place), otherwise a
    /// fresh spawn.
    fn acquire(&mut self, url: &ChannelUrl) -> mpsc::UnboundedSender<Command> {
        if let Some(cmd_tx) = self.conns.get(&url.authority()) {
            if !cmd_tx.is_closed() {
                return cmd_tx.clone();
            }
        }
        self.spawn(url)
    }

    fn spawn(&mut self, url: &ChannelUrl) -> mpsc::UnboundedSender<Command> {
        let authority = url.authority();
        debug!(%authority, "starting connection");
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(driver::run(
            Endpoint::from(url),
            self.config.clone(),
            cmd_rx,
        ));
        self.conns.insert(authority, cmd_tx.clone());
        cmd_tx
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_validation_errors_are_synchronous() {
        let mut client = Client::new();

        assert!(client.connect("ws://example.com", "rw").is_err());
        assert!(client.connect("example.com/0", "rw").is_err());
        assert!(client.connect("example.com", "banana").is_err());

        // None of them spawned a connection.
        assert!(client.conns.is_empty());
    }
}
