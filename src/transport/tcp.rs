//! TCP instruments.
//!
//! Some instruments are driven through a small server running next to the
//! vendor software (e.g. a DigitalMicrograph plugin). [`TcpBase`] holds the
//! socket and applies a timeout to every operation.

use crate::error::{InstrumentError, InstrumentResult};
use crate::util::validate_ip;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default connect/read/write timeout (5 s).
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// Base type for TCP instruments.
pub struct TcpBase {
    peer: SocketAddr,
    stream: TcpStream,
    timeout: Duration,
}

impl TcpBase {
    /// Connect to `addr:port`.
    ///
    /// # Arguments
    /// * `addr` - IPv4 or IPv6 address; host names are rejected
    /// * `port` - TCP port
    /// * `timeout` - applies to the connection and to every later send/receive
    ///
    /// # Errors
    /// [`InstrumentError::InvalidAddress`] for a malformed address,
    /// [`InstrumentError::Connection`] if nothing accepts the connection in time.
    pub async fn connect(addr: &str, port: u16, timeout: Duration) -> InstrumentResult<Self> {
        let ip = validate_ip(addr)?;
        let peer = SocketAddr::new(ip, port);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(InstrumentError::Connection(format!(
                    "could not connect to {}: {}",
                    peer, e
                )))
            }
            Err(_) => {
                return Err(InstrumentError::Connection(format!(
                    "connection to {} timed out after {} ms",
                    peer,
                    timeout.as_millis()
                )))
            }
        };
        stream.set_nodelay(true)?;

        tracing::info!(%peer, "Connected to TCP instrument");
        Ok(Self {
            peer,
            stream,
            timeout,
        })
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Timeout applied to each operation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the per-operation timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send all of `data`.
    pub async fn send(&mut self, data: &[u8]) -> InstrumentResult<()> {
        tokio::time::timeout(self.timeout, self.stream.write_all(data))
            .await
            .map_err(|_| InstrumentError::Timeout(self.timeout))??;
        tracing::trace!(peer = %self.peer, bytes = data.len(), "TCP send");
        Ok(())
    }

    /// Send an ASCII string.
    pub async fn send_str(&mut self, data: &str) -> InstrumentResult<()> {
        if !data.is_ascii() {
            return Err(InstrumentError::Encoding(format!(
                "'{}' cannot be encoded as ASCII",
                data.escape_default()
            )));
        }
        self.send(data.as_bytes()).await
    }

    /// Receive at most `max` bytes in a single read.
    ///
    /// # Errors
    /// [`InstrumentError::Timeout`] if nothing arrived in time,
    /// [`InstrumentError::Connection`] if the peer closed the connection.
    pub async fn recv(&mut self, max: usize) -> InstrumentResult<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = tokio::time::timeout(self.timeout, self.stream.read(&mut buf))
            .await
            .map_err(|_| InstrumentError::Timeout(self.timeout))??;
        if n == 0 && max > 0 {
            return Err(InstrumentError::Connection(format!(
                "{} closed the connection",
                self.peer
            )));
        }
        buf.truncate(n);
        tracing::trace!(peer = %self.peer, bytes = n, "TCP recv");
        Ok(buf)
    }

    /// Receive at most `max` bytes and decode them as ASCII.
    pub async fn recv_str(&mut self, max: usize) -> InstrumentResult<String> {
        let bytes = self.recv(max).await?;
        if !bytes.is_ascii() {
            return Err(InstrumentError::Encoding(format!(
                "received non-ASCII bytes: {:?}",
                bytes
            )));
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Shut the connection down.
    pub async fn close(mut self) -> InstrumentResult<()> {
        tracing::info!(peer = %self.peer, "Closing TCP instrument");
        self.stream.shutdown().await?;
        Ok(())
    }
}
