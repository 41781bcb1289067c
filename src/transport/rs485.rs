//! RS-485 instruments.
//!
//! RS-485 is half duplex: the host must enable its line driver before
//! transmitting and release it afterwards so the instrument can answer. Most
//! USB adapters wire the driver-enable pin to RTS, so [`Rs485Base`] toggles RTS
//! around every write.
//!
//! Protocol of a write:
//! 1. set RTS to `rts_level_for_tx`
//! 2. wait `delay_before_tx`
//! 3. write and flush
//! 4. wait `delay_before_rx`
//! 5. set RTS to `rts_level_for_rx`

use super::serial::{open_serial_stream, Encoding, SerialBase, SerialPortIO, SerialSettings};
use crate::error::{InstrumentError, InstrumentResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serial stream that can drive its RTS line.
pub trait Rs485Port: SerialPortIO {
    /// Set the RTS line level.
    fn set_rts(&mut self, level: bool) -> InstrumentResult<()>;
}

impl Rs485Port for tokio_serial::SerialStream {
    fn set_rts(&mut self, level: bool) -> InstrumentResult<()> {
        use tokio_serial::SerialPort;
        self.write_request_to_send(level)?;
        Ok(())
    }
}

impl<T: Rs485Port + ?Sized> Rs485Port for Box<T> {
    fn set_rts(&mut self, level: bool) -> InstrumentResult<()> {
        (**self).set_rts(level)
    }
}

fn default_true() -> bool {
    true
}

/// Direction-control timing for an RS-485 line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rs485Settings {
    /// RTS level while transmitting.
    #[serde(default = "default_true")]
    pub rts_level_for_tx: bool,
    /// RTS level while receiving.
    #[serde(default)]
    pub rts_level_for_rx: bool,
    /// Delay between asserting RTS and the first transmitted byte.
    #[serde(default)]
    pub delay_before_tx_ms: u64,
    /// Delay between the last transmitted byte and releasing RTS.
    #[serde(default)]
    pub delay_before_rx_ms: u64,
    /// The adapter echoes everything sent; read the echo back and check it.
    #[serde(default)]
    pub loopback: bool,
}

impl Default for Rs485Settings {
    fn default() -> Self {
        Self {
            rts_level_for_tx: true,
            rts_level_for_rx: false,
            delay_before_tx_ms: 0,
            delay_before_rx_ms: 0,
            loopback: false,
        }
    }
}

/// Base type for RS-485 instruments.
pub struct Rs485Base<P = Box<dyn Rs485Port>> {
    line: SerialBase<P>,
    rs485: Rs485Settings,
}

impl Rs485Base<Box<dyn Rs485Port>> {
    /// Open the port and release the line driver.
    pub async fn open(settings: SerialSettings, rs485: Rs485Settings) -> InstrumentResult<Self> {
        let stream = open_serial_stream(&settings).await?;
        tracing::info!(
            port = %settings.port,
            baud = settings.baud_rate,
            "Opened RS-485 instrument"
        );
        Self::with_port(Box::new(stream), settings, rs485)
    }
}

impl<P: Rs485Port> Rs485Base<P> {
    /// Wrap an already-open port. RTS is set to the receive level.
    pub fn with_port(
        mut port: P,
        settings: SerialSettings,
        rs485: Rs485Settings,
    ) -> InstrumentResult<Self> {
        port.set_rts(rs485.rts_level_for_rx)?;
        Ok(Self {
            line: SerialBase::with_port(port, settings),
            rs485,
        })
    }

    /// Direction-control settings.
    pub fn rs485_settings(&self) -> &Rs485Settings {
        &self.rs485
    }

    /// Line configuration.
    pub fn settings(&self) -> &SerialSettings {
        self.line.settings()
    }

    /// Wire encoding.
    pub fn encoding(&self) -> Encoding {
        self.line.encoding()
    }

    /// Read up to `size` bytes and decode them; may return fewer on timeout.
    pub async fn read_str(&mut self, size: usize) -> InstrumentResult<String> {
        self.line.read_str(size).await
    }

    /// Read one line without its line ending.
    pub async fn read_line(&mut self) -> InstrumentResult<String> {
        self.line.read_line().await
    }

    /// Encode and transmit `data` with the driver enabled.
    ///
    /// # Returns
    /// Number of bytes written.
    pub async fn write_str(&mut self, data: &str) -> InstrumentResult<usize> {
        let bytes = self.line.encoding().encode(data)?;

        self.line.port_mut().set_rts(self.rs485.rts_level_for_tx)?;
        if self.rs485.delay_before_tx_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.rs485.delay_before_tx_ms)).await;
        }

        let written = self.line.write_bytes(&bytes).await;

        if self.rs485.delay_before_rx_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.rs485.delay_before_rx_ms)).await;
        }
        // Always release the bus, even after a failed write.
        self.line.port_mut().set_rts(self.rs485.rts_level_for_rx)?;
        let written = written?;

        if self.rs485.loopback {
            let echo = self.line.read_bytes(bytes.len()).await?;
            if echo != bytes {
                return Err(InstrumentError::Protocol(format!(
                    "RS-485 echo mismatch: sent {:?}, read back {:?}",
                    String::from_utf8_lossy(&bytes),
                    String::from_utf8_lossy(&echo)
                )));
            }
        }

        Ok(written)
    }

    /// Write `data`, then read one line.
    pub async fn query(&mut self, data: &str) -> InstrumentResult<String> {
        self.write_str(data).await?;
        self.read_line().await
    }

    /// Discard pending input; returns the number of bytes dropped.
    pub async fn drain(&mut self) -> usize {
        self.line.drain().await
    }

    /// Shut the stream down.
    pub async fn close(self) -> InstrumentResult<()> {
        self.line.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::time::Instant;

    /// Duplex stream that records every RTS change.
    struct RtsRecorder {
        inner: DuplexStream,
        levels: Arc<Mutex<Vec<bool>>>,
        events: Arc<Mutex<Vec<(BusEvent, Instant)>>>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum BusEvent {
        Rts(bool),
        Write,
    }

    impl AsyncRead for RtsRecorder {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for RtsRecorder {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
            if let Poll::Ready(Ok(n)) = &polled {
                if *n > 0 {
                    this.events.lock().unwrap().push((BusEvent::Write, Instant::now()));
                }
            }
            polled
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    impl Rs485Port for RtsRecorder {
        fn set_rts(&mut self, level: bool) -> InstrumentResult<()> {
            self.levels.lock().unwrap().push(level);
            self.events.lock().unwrap().push((BusEvent::Rts(level), Instant::now()));
            Ok(())
        }
    }

    fn recorder() -> (DuplexStream, RtsRecorder, Arc<Mutex<Vec<bool>>>) {
        let (host, port) = timed_recorder();
        let levels = port.levels.clone();
        (host, port, levels)
    }

    fn timed_recorder() -> (DuplexStream, RtsRecorder) {
        let (host, device) = tokio::io::duplex(64);
        let port = RtsRecorder {
            inner: device,
            levels: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(Mutex::new(Vec::new())),
        };
        (host, port)
    }

    fn settings() -> SerialSettings {
        SerialSettings::new("rs485", 9600).with_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_default_rs485_settings() {
        let rs485 = Rs485Settings::default();
        assert!(rs485.rts_level_for_tx);
        assert!(!rs485.rts_level_for_rx);
        assert!(!rs485.loopback);

        let parsed: Rs485Settings = toml::from_str("delay_before_rx_ms = 2").unwrap();
        assert!(parsed.rts_level_for_tx);
        assert_eq!(parsed.delay_before_rx_ms, 2);
    }

    #[tokio::test]
    async fn test_write_toggles_rts_around_transmission() {
        let (mut host, port, levels) = recorder();
        let mut bus = Rs485Base::with_port(port, settings(), Rs485Settings::default()).unwrap();

        let sent = bus.write_str("@253PR1?;FF").await.unwrap();
        assert_eq!(sent, 11);

        let mut buf = vec![0u8; 11];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"@253PR1?;FF");

        // Released on open, asserted for TX, released for RX.
        assert_eq!(*levels.lock().unwrap(), vec![false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waits_configured_delays() {
        let (mut host, port) = timed_recorder();
        let events = port.events.clone();
        let rs485 = Rs485Settings {
            delay_before_tx_ms: 5,
            delay_before_rx_ms: 3,
            ..Default::default()
        };
        let mut bus = Rs485Base::with_port(port, settings(), rs485).unwrap();

        bus.write_str("GO").await.unwrap();
        let mut buf = [0u8; 2];
        host.read_exact(&mut buf).await.unwrap();

        let events = events.lock().unwrap().clone();
        let kinds: Vec<BusEvent> = events.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(
            kinds,
            vec![
                BusEvent::Rts(false),
                BusEvent::Rts(true),
                BusEvent::Write,
                BusEvent::Rts(false)
            ]
        );

        let (_, tx_asserted) = events[1];
        let (_, written) = events[2];
        let (_, released) = events[3];
        assert!(written - tx_asserted >= Duration::from_millis(5));
        assert!(released - written >= Duration::from_millis(3));
        assert!(released - tx_asserted < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_inverted_rts_levels() {
        let (_host, port, levels) = recorder();
        let rs485 = Rs485Settings {
            rts_level_for_tx: false,
            rts_level_for_rx: true,
            ..Default::default()
        };
        let mut bus = Rs485Base::with_port(port, settings(), rs485).unwrap();

        bus.write_str("X").await.unwrap();
        assert_eq!(*levels.lock().unwrap(), vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_query_reads_answer_after_release() {
        let (mut host, port, _levels) = recorder();
        let mut bus = Rs485Base::with_port(port, settings(), Rs485Settings::default()).unwrap();

        host.write_all(b"@253ACK7.60E+2;FF\r\n").await.unwrap();
        let answer = bus.query("@253PR1?;FF").await.unwrap();
        assert_eq!(answer, "@253ACK7.60E+2;FF");
    }

    #[tokio::test]
    async fn test_loopback_echo_is_consumed() {
        let (mut host, port, _levels) = recorder();
        let rs485 = Rs485Settings {
            loopback: true,
            ..Default::default()
        };
        let mut bus = Rs485Base::with_port(port, settings(), rs485).unwrap();

        // Adapter echo followed by the instrument's answer.
        host.write_all(b"PING\r\nPONG\r\n").await.unwrap();
        let answer = bus.query("PING\r\n").await.unwrap();
        assert_eq!(answer, "PONG");
    }

    #[tokio::test]
    async fn test_loopback_mismatch_is_protocol_error() {
        let (mut host, port, _levels) = recorder();
        let rs485 = Rs485Settings {
            loopback: true,
            ..Default::default()
        };
        let mut bus = Rs485Base::with_port(port, settings(), rs485).unwrap();

        host.write_all(b"PANG").await.unwrap();
        let err = bus.write_str("PING").await.unwrap_err();
        assert!(matches!(err, InstrumentError::Protocol(_)));
    }
}
