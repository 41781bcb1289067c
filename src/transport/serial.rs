//! Serial (RS-232 / USB-serial) instruments.
//!
//! [`SerialBase`] wraps any async byte stream and adds string I/O in the
//! instrument's [`Encoding`]. Real hardware uses a `tokio_serial::SerialStream`
//! opened with [`SerialBase::open`]; tests plug in `tokio::io::duplex`.
//!
//! # Example
//!
//! ```rust,ignore
//! use uedinst::transport::{SerialBase, SerialSettings};
//!
//! let mut port = SerialBase::open(SerialSettings::new("/dev/ttyUSB0", 9600)).await?;
//! port.write_str("*IDN?\r").await?;
//! let answer = port.read_line().await?;
//! ```

use crate::error::{InstrumentError, InstrumentResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;

// =============================================================================
// Port types
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port: `tokio_serial::SerialStream`, `tokio::io::DuplexStream`,
/// or a test mock.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Settings
// =============================================================================

/// Text encoding used on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// 7-bit ASCII; anything else is rejected.
    #[default]
    Ascii,
    /// UTF-8.
    Utf8,
}

impl Encoding {
    /// Encode `text` for transmission.
    pub fn encode(&self, text: &str) -> InstrumentResult<Vec<u8>> {
        match self {
            Encoding::Ascii if !text.is_ascii() => Err(InstrumentError::Encoding(format!(
                "'{}' cannot be encoded as ASCII",
                text.escape_default()
            ))),
            _ => Ok(text.as_bytes().to_vec()),
        }
    }

    /// Decode bytes received from an instrument.
    pub fn decode(&self, bytes: &[u8]) -> InstrumentResult<String> {
        if *self == Encoding::Ascii && !bytes.is_ascii() {
            return Err(InstrumentError::Encoding(format!(
                "received non-ASCII bytes: {:?}",
                bytes
            )));
        }
        String::from_utf8(bytes.to_vec())
            .map_err(|e| InstrumentError::Encoding(format!("received invalid UTF-8: {}", e)))
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Serial line configuration.
///
/// Defaults: 8 data bits, no parity, 1 stop bit, 1 s read timeout, ASCII.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Communication speed (e.g., 9600, 115200)
    pub baud_rate: u32,
    /// Data bits, 5 to 8
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity mode
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits, 1 or 2
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Wire encoding
    #[serde(default)]
    pub encoding: Encoding,
}

impl SerialSettings {
    /// Settings for `port` at `baud_rate` with defaults for everything else.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
            encoding: Encoding::default(),
        }
    }

    /// Set the read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the wire encoding.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the parity mode.
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Read timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check values the serial driver would reject.
    pub fn validate(&self) -> InstrumentResult<()> {
        if self.port.trim().is_empty() {
            return Err(InstrumentError::InvalidParameter(
                "serial port path cannot be empty".into(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(InstrumentError::InvalidParameter(
                "baud rate must be greater than 0".into(),
            ));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(InstrumentError::InvalidParameter(format!(
                "data bits must be between 5 and 8, not {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(InstrumentError::InvalidParameter(format!(
                "stop bits must be 1 or 2, not {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    fn data_bits_setting(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits_setting(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// Open a serial port on a blocking task.
///
/// Port initialisation can block for a noticeable time on some USB adapters,
/// so it is kept off the async runtime.
pub async fn open_serial_stream(
    settings: &SerialSettings,
) -> InstrumentResult<tokio_serial::SerialStream> {
    settings.validate()?;
    let settings = settings.clone();

    let stream = spawn_blocking(move || {
        tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(settings.data_bits_setting())
            .parity(settings.parity.into())
            .stop_bits(settings.stop_bits_setting())
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(settings.timeout())
            .open_native_async()
    })
    .await
    .map_err(|e| InstrumentError::Connection(format!("serial open task failed: {}", e)))??;

    Ok(stream)
}

// =============================================================================
// SerialBase
// =============================================================================

/// Base type for serial instruments.
pub struct SerialBase<P = DynSerial> {
    settings: SerialSettings,
    port: BufReader<P>,
}

impl SerialBase<DynSerial> {
    /// Open the port described by `settings`.
    pub async fn open(settings: SerialSettings) -> InstrumentResult<Self> {
        let stream = open_serial_stream(&settings).await?;
        tracing::info!(port = %settings.port, baud = settings.baud_rate, "Opened serial instrument");
        Ok(Self::with_port(Box::new(stream), settings))
    }
}

impl<P: SerialPortIO> SerialBase<P> {
    /// Wrap an already-open stream.
    pub fn with_port(port: P, settings: SerialSettings) -> Self {
        Self {
            settings,
            port: BufReader::new(port),
        }
    }

    /// Line configuration.
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Wire encoding.
    pub fn encoding(&self) -> Encoding {
        self.settings.encoding
    }

    pub(crate) fn port_mut(&mut self) -> &mut P {
        self.port.get_mut()
    }

    /// Read up to `size` bytes and decode them.
    ///
    /// Returns whatever arrived before the read timeout expired, so the result
    /// may be empty or shorter than `size`.
    pub async fn read_str(&mut self, size: usize) -> InstrumentResult<String> {
        let bytes = self.read_bytes(size).await?;
        self.settings.encoding.decode(&bytes)
    }

    /// Read up to `size` raw bytes before the read timeout expires.
    pub async fn read_bytes(&mut self, size: usize) -> InstrumentResult<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + self.settings.timeout();
        let mut data = Vec::with_capacity(size);
        let mut chunk = vec![0u8; size.min(256)];

        while data.len() < size {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let want = (size - data.len()).min(chunk.len());
            match tokio::time::timeout(remaining, self.port.read(&mut chunk[..want])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => data.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        if data.len() < size {
            tracing::debug!(
                port = %self.settings.port,
                requested = size,
                received = data.len(),
                "Serial read returned early"
            );
        }
        Ok(data)
    }

    /// Read one `\n`-terminated line and decode it, without the line ending.
    ///
    /// # Errors
    /// Returns [`InstrumentError::Timeout`] if no complete line arrived in time.
    pub async fn read_line(&mut self) -> InstrumentResult<String> {
        let timeout = self.settings.timeout();
        let mut line = Vec::new();
        match tokio::time::timeout(timeout, self.port.read_until(b'\n', &mut line)).await {
            Ok(Ok(0)) => Err(InstrumentError::Connection(format!(
                "serial port {} closed",
                self.settings.port
            ))),
            Ok(Ok(_)) => {
                let text = self.settings.encoding.decode(&line)?;
                Ok(text.trim_end_matches(['\r', '\n']).to_string())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(InstrumentError::Timeout(timeout)),
        }
    }

    /// Encode `data` and write it.
    ///
    /// # Returns
    /// Number of bytes written.
    ///
    /// # Errors
    /// Returns [`InstrumentError::IncompleteWrite`] if the port stopped accepting
    /// data before everything was sent.
    pub async fn write_str(&mut self, data: &str) -> InstrumentResult<usize> {
        let bytes = self.settings.encoding.encode(data)?;
        self.write_bytes(&bytes).await
    }

    /// Write raw bytes, flushing afterwards.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> InstrumentResult<usize> {
        let timeout = self.settings.timeout();
        let port = self.port.get_mut();
        let mut written = 0usize;

        while written < bytes.len() {
            match tokio::time::timeout(timeout, port.write(&bytes[written..])).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        port.flush().await?;

        if written < bytes.len() {
            return Err(InstrumentError::IncompleteWrite {
                written,
                expected: bytes.len(),
            });
        }
        tracing::trace!(port = %self.settings.port, bytes = written, "Serial write");
        Ok(written)
    }

    /// Write `data`, then read one line.
    pub async fn query(&mut self, data: &str) -> InstrumentResult<String> {
        self.write_str(data).await?;
        self.read_line().await
    }

    /// Discard buffered and pending input.
    ///
    /// # Returns
    /// Number of bytes discarded.
    pub async fn drain(&mut self) -> usize {
        let buffered = self.port.buffer().len();
        self.port.consume(buffered);

        let mut discard = [0u8; 256];
        let deadline = tokio::time::Instant::now() + Duration::from_millis(50);
        let mut total = buffered;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.port.get_mut().read(&mut discard)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total += n,
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if total > 0 {
            tracing::debug!(port = %self.settings.port, bytes = total, "Discarded stale serial data");
        }
        total
    }

    /// Shut the stream down.
    pub async fn close(mut self) -> InstrumentResult<()> {
        tracing::info!(port = %self.settings.port, "Closing serial instrument");
        self.port.get_mut().shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> SerialSettings {
        SerialSettings::new("test", 9600).with_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_settings_defaults() {
        let settings = SerialSettings::new("/dev/ttyUSB0", 9600);
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.stop_bits, 1);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.timeout(), Duration::from_secs(1));
        assert_eq!(settings.encoding, Encoding::Ascii);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = SerialSettings::new("/dev/ttyUSB0", 9600);
        settings.data_bits = 9;
        assert!(settings.validate().is_err());

        let settings = SerialSettings::new("", 9600);
        assert!(settings.validate().is_err());

        let settings = SerialSettings::new("COM3", 0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: SerialSettings = toml::from_str(
            r#"
            port = "/dev/ttyS0"
            baud_rate = 19200
            parity = "even"
            encoding = "utf8"
            "#,
        )
        .unwrap();
        assert_eq!(settings.baud_rate, 19200);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.encoding, Encoding::Utf8);
        assert_eq!(settings.timeout_ms, 1000);
    }

    #[test]
    fn test_ascii_encoding_rejects_non_ascii() {
        assert!(Encoding::Ascii.encode("25°C").is_err());
        assert!(Encoding::Utf8.encode("25°C").is_ok());
        assert!(Encoding::Ascii.decode(&[0xC2, 0xB0]).is_err());
        assert_eq!(Encoding::Ascii.decode(b"OK").unwrap(), "OK");
    }

    #[tokio::test]
    async fn test_write_str_counts_bytes() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut serial = SerialBase::with_port(device, test_settings());

        let sent = serial.write_str("VER?\r").await.unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 5];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"VER?\r");
    }

    #[tokio::test]
    async fn test_write_str_rejects_non_ascii_without_sending() {
        let (_host, device) = tokio::io::duplex(64);
        let mut serial = SerialBase::with_port(device, test_settings());

        let err = serial.write_str("µA").await.unwrap_err();
        assert!(matches!(err, InstrumentError::Encoding(_)));
    }

    #[tokio::test]
    async fn test_read_str_returns_partial_data_on_timeout() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut serial = SerialBase::with_port(device, test_settings());

        host.write_all(b"abc").await.unwrap();
        let data = serial.read_str(10).await.unwrap();
        assert_eq!(data, "abc");

        let empty = serial.read_str(4).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_read_str_stops_at_size() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut serial = SerialBase::with_port(device, test_settings());

        host.write_all(b"0123456789").await.unwrap();
        assert_eq!(serial.read_str(4).await.unwrap(), "0123");
        assert_eq!(serial.read_str(6).await.unwrap(), "456789");
    }

    #[tokio::test]
    async fn test_query_reads_line() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut serial = SerialBase::with_port(device, test_settings());

        host.write_all(b"+1.25E-09\r\n").await.unwrap();
        let answer = serial.query("READ?\r").await.unwrap();
        assert_eq!(answer, "+1.25E-09");
    }

    #[tokio::test]
    async fn test_read_line_timeout() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut serial = SerialBase::with_port(device, test_settings());

        host.write_all(b"no newline").await.unwrap();
        let err = serial.read_line().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_drain_discards_stale_bytes() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut serial = SerialBase::with_port(device, test_settings());

        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(serial.drain().await, 16);
        assert!(serial.read_str(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_follow_scripted_order() {
        let mock = tokio_test::io::Builder::new()
            .write(b"*RST\r")
            .write(b"*IDN?\r")
            .read(b"MOCK,0,0,1.0\n")
            .build();
        let mut serial = SerialBase::with_port(mock, test_settings());

        serial.write_str("*RST\r").await.unwrap();
        let idn = serial.query("*IDN?\r").await.unwrap();
        assert_eq!(idn, "MOCK,0,0,1.0");
    }
}
