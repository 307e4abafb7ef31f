//! Out-of-band message channel used to swap handshake payloads.
//!
//! The engine only needs reliable, ordered, point-to-point delivery of whole
//! messages. [`TcpControlChannel`] provides that between hosts, using one
//! outbound and one inbound connection with a 4-byte big-endian length prefix
//! per message. [`LocalControlChannel`] pairs two endpoints in one process.
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;

use crate::error::RdmaError;
use crate::error::Result;

/// Message telling the peer it may release its resources.
pub const TERMINATE: &[u8] = b"TERMINATE";

pub trait ControlChannel: Send {
    fn send(&mut self, message: &[u8]) -> Result<()>;

    /// Blocks until the next whole message arrives.
    fn receive(&mut self) -> Result<Vec<u8>>;
}

/// Sends the termination sentinel.
pub fn send_terminate(channel: &mut dyn ControlChannel) -> Result<()> {
    channel.send(TERMINATE)
}

/// Blocks until the peer sends the termination sentinel, skipping other messages.
pub fn wait_remote_terminate(channel: &mut dyn ControlChannel) -> Result<()> {
    loop {
        let message = channel.receive()?;
        if message == TERMINATE {
            return Ok(());
        }
        tracing::warn!(
            "ignoring {} byte message while waiting for termination",
            message.len()
        );
    }
}

/// Settings for [`TcpControlChannel::connect`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TcpChannelConfig {
    /// Port this side listens on for the peer's outbound connection.
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    /// Connection attempts before giving up on the peer.
    pub connect_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            local_port: 6000,
            remote_addr: "127.0.0.1".to_string(),
            remote_port: 6001,
            connect_attempts: 600,
            retry_interval: Duration::from_millis(100),
        }
    }
}

pub struct TcpControlChannel {
    outbound: TcpStream,
    inbound: TcpStream,
}

impl TcpControlChannel {
    /// Listens on `local_port`, connects to the peer, then accepts the peer's connection.
    pub fn connect(config: &TcpChannelConfig) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.local_port))?;
        Self::with_listener(listener, config)
    }

    /// Same as [`TcpControlChannel::connect`] with an already bound listener.
    pub fn with_listener(listener: TcpListener, config: &TcpChannelConfig) -> Result<Self> {
        let outbound = connect_with_retry(config)?;
        outbound.set_nodelay(true)?;
        let (inbound, peer) = listener.accept()?;
        inbound.set_nodelay(true)?;
        tracing::info!(
            "control channel up: {}:{} outbound, {} inbound",
            config.remote_addr,
            config.remote_port,
            peer
        );
        Ok(Self { outbound, inbound })
    }
}

fn connect_with_retry(config: &TcpChannelConfig) -> Result<TcpStream> {
    let attempts = config.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match TcpStream::connect((config.remote_addr.as_str(), config.remote_port)) {
            Ok(stream) => return Ok(stream),
            Err(err) if attempt < attempts => {
                tracing::debug!(
                    "connect to {}:{} failed (attempt {}/{}): {}",
                    config.remote_addr,
                    config.remote_port,
                    attempt,
                    attempts,
                    err
                );
                attempt += 1;
                std::thread::sleep(config.retry_interval);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

impl ControlChannel for TcpControlChannel {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        let len = u32::try_from(message.len()).map_err(|_| {
            RdmaError::Channel(std::io::Error::new(
                ErrorKind::InvalidInput,
                "control message larger than 4 GiB",
            ))
        })?;
        self.outbound.write_all(&len.to_be_bytes())?;
        self.outbound.write_all(message)?;
        self.outbound.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        if let Err(err) = self.inbound.read_exact(&mut header) {
            return Err(match err.kind() {
                ErrorKind::UnexpectedEof => RdmaError::ChannelClosed,
                _ => err.into(),
            });
        }
        let mut message = vec![0u8; u32::from_be_bytes(header) as usize];
        self.inbound.read_exact(&mut message)?;
        Ok(message)
    }
}

/// One end of an in-process channel pair.
pub struct LocalControlChannel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl LocalControlChannel {
    /// Two connected endpoints; what one sends the other receives.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

impl ControlChannel for LocalControlChannel {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        self.tx
            .send(message.to_vec())
            .map_err(|_| RdmaError::ChannelClosed)
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().map_err(|_| RdmaError::ChannelClosed)
    }
}
