//! Gatan Ultrascan 895 camera driver
//!
//! The camera is controlled through a TCP server plugin running inside
//! DigitalMicrograph (Gatan Microscopy Suite).
//!
//! Protocol Overview:
//! - Transport: TCP, default 127.0.0.1:42057
//! - Commands: ASCII, fields separated by `;`, e.g. `ULTRASCAN;INSERT;TRUE`
//! - Answers: `OK`, `ERR`, or a version string; never longer than 10 bytes
//! - Images are not sent over the socket. The plugin writes the raw frame
//!   (2048 × 2048 little-endian `i32`) to a file path given in the command.
//!
//! The detector saturates well below 32767 counts, so frames are clipped to
//! the `i16` range.

use crate::error::{InstrumentError, InstrumentResult};
use crate::transport::tcp::TcpBase;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

/// Default address of the DigitalMicrograph plugin.
pub const DEFAULT_ADDR: &str = "127.0.0.1";

/// Default port of the DigitalMicrograph plugin.
pub const DEFAULT_PORT: u16 = 42057;

/// Sensor width and height in pixels.
pub const SENSOR_SIZE: usize = 2048;

/// Answers are "OK", "ERR" or a version string.
const ANSWER_SIZE: usize = 10;

const TEMP_IMAGE_NAME: &str = "_uedinst_temp.dat";

fn default_addr() -> String {
    DEFAULT_ADDR.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Connection settings for the camera server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatanConfig {
    /// IP address of the plugin server
    #[serde(default = "default_addr")]
    pub addr: String,
    /// TCP port of the plugin server
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory for the temporary image file (default: OS temp dir)
    #[serde(default)]
    pub tempdir: Option<PathBuf>,
    /// Socket timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GatanConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            tempdir: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl GatanConfig {
    /// Check the address before connecting.
    pub fn validate(&self) -> InstrumentResult<()> {
        crate::util::validate_ip(&self.addr)?;
        if self.port == 0 {
            return Err(InstrumentError::InvalidParameter(
                "Gatan server port must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// A frame read from the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
    /// Row-major pixel values
    pub pixels: Vec<i16>,
}

impl Image {
    /// Pixel at `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> Option<i16> {
        if row >= self.height || col >= self.width {
            return None;
        }
        self.pixels.get(row * self.width + col).copied()
    }

    /// Decode a raw little-endian `i32` frame, clipping to the `i16` range.
    pub fn from_raw_i32(bytes: &[u8], width: usize, height: usize) -> InstrumentResult<Self> {
        let expected = width * height * 4;
        if bytes.len() != expected {
            return Err(InstrumentError::Protocol(format!(
                "Image file holds {} bytes, expected {} for a {}x{} frame of i32",
                bytes.len(),
                expected,
                width,
                height
            )));
        }

        let pixels = bytes
            .chunks_exact(4)
            .map(|raw| {
                let value = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
            })
            .collect();

        Ok(Self {
            width,
            height,
            pixels,
        })
    }
}

/// Python-style boolean literal expected by the plugin.
fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Driver for the Gatan Ultrascan 895 camera server.
pub struct GatanUltrascan895 {
    tcp: TcpBase,
    version: String,
    tempdir: PathBuf,
}

impl GatanUltrascan895 {
    /// Connect to the plugin server and check its version.
    ///
    /// # Errors
    /// [`InstrumentError::Connection`] if DigitalMicrograph is not reachable, or
    /// if the plugin is too old to report its version.
    pub async fn connect(config: &GatanConfig) -> InstrumentResult<Self> {
        config.validate()?;
        let timeout = Duration::from_millis(config.timeout_ms);
        let tcp = TcpBase::connect(&config.addr, config.port, timeout)
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "Gatan server connection failed");
                InstrumentError::Connection(
                    "Could not connect to DigitalMicrograph. Make sure it is open.".into(),
                )
            })?;

        let tempdir = config.tempdir.clone().unwrap_or_else(std::env::temp_dir);
        let mut camera = Self {
            tcp,
            version: String::new(),
            tempdir,
        };

        // The earliest plugin versions did not answer this command.
        camera.version = camera
            .send_command(&["ULTRASCAN;VERSION"], None)
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "Gatan version query failed");
                InstrumentError::Connection(
                    "The uedinst plugin version installed in the GMS is too old.".into(),
                )
            })?;

        tracing::info!(version = %camera.version, peer = %camera.tcp.peer(), "Connected to Gatan Ultrascan 895");
        Ok(camera)
    }

    /// Plugin version reported on connection.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Directory holding the temporary image file.
    pub fn tempdir(&self) -> &Path {
        &self.tempdir
    }

    /// Path of the temporary file images are written to.
    pub fn temp_image_path(&self) -> PathBuf {
        self.tempdir.join(TEMP_IMAGE_NAME)
    }

    /// Send a command and wait for the answer.
    ///
    /// `parts` are concatenated. `wait` is slept between sending and reading,
    /// for commands that take long to complete (exposures).
    ///
    /// # Errors
    /// [`InstrumentError::Command`] if the server answered `ERR`; see the GMS
    /// result console for details.
    pub async fn send_command(
        &mut self,
        parts: &[&str],
        wait: Option<Duration>,
    ) -> InstrumentResult<String> {
        let command = parts.concat();
        tracing::debug!(command = %command, "Gatan command");
        self.tcp.send_str(&command).await?;

        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }

        let answer = self.tcp.recv_str(ANSWER_SIZE).await?;
        let answer = answer.trim().to_string();
        if answer == "ERR" {
            return Err(InstrumentError::Command { command, answer });
        }
        Ok(answer)
    }

    /// Insert the camera into the beam, or retract it.
    #[instrument(skip(self), err)]
    pub async fn insert(&mut self, toggle: bool) -> InstrumentResult<()> {
        let state = if toggle { "TRUE" } else { "FALSE" };
        self.send_command(&["ULTRASCAN;INSERT;", state], None).await?;
        Ok(())
    }

    /// Acquire an image.
    ///
    /// # Arguments
    /// * `exposure` - Exposure in seconds
    /// * `remove_dark` - Let GMS subtract the dark background
    /// * `normalize_gain` - Let GMS gain-normalise the image
    #[instrument(skip(self), err)]
    pub async fn acquire_image(
        &mut self,
        exposure: f64,
        remove_dark: bool,
        normalize_gain: bool,
    ) -> InstrumentResult<Image> {
        let wait = Duration::try_from_secs_f64(exposure).map_err(|_| {
            InstrumentError::InvalidParameter(format!(
                "Exposure must be a non-negative number of seconds, not {}",
                exposure
            ))
        })?;

        // Raw format avoids the plugin's TIFF conversion.
        let path = self.temp_image_path();
        let command = format!(
            "ULTRASCAN;ACQUIRE;{:.3},{},{},{}",
            exposure,
            py_bool(remove_dark),
            py_bool(normalize_gain),
            path.display()
        );
        self.send_command(&[&command], Some(wait)).await?;

        let bytes = tokio::fs::read(&path).await?;
        Image::from_raw_i32(&bytes, SENSOR_SIZE, SENSOR_SIZE)
    }

    /// Close the connection.
    pub async fn close(self) -> InstrumentResult<()> {
        self.tcp.close().await
    }
}
