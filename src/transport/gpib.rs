//! GPIB instruments.
//!
//! [`GpibBase`] is the common layer for message-based GPIB instruments. It owns a
//! [`GpibResource`] (normally a VISA session, see [`super::visa`]) and adds what
//! every driver needs on top of plain writes and reads: request/response queries,
//! waiting for a service request, and an orderly close.
//!
//! # Example
//!
//! ```rust,ignore
//! use uedinst::transport::GpibBase;
//!
//! let mut instrument = GpibBase::open("GPIB::15").await?;
//! let idn = instrument.query("*IDN?").await?;
//! instrument.close().await?;
//! ```

use crate::error::InstrumentResult;
use crate::util;
use async_trait::async_trait;
use std::time::Duration;

/// Default time to wait for a service request (25 s).
pub const DEFAULT_SRQ_TIMEOUT: Duration = Duration::from_millis(25_000);

/// Request-for-service bit of the IEEE 488.2 status byte.
pub const RQS_BIT: u8 = 0x40;

const SRQ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A message-based GPIB session.
///
/// Implementors append and strip the bus terminator themselves; callers pass
/// and receive bare messages.
#[async_trait]
pub trait GpibResource: Send {
    /// Write one message.
    async fn write(&mut self, message: &str) -> InstrumentResult<()>;

    /// Read one message.
    async fn read(&mut self) -> InstrumentResult<String>;

    /// Write `message`, then read the answer.
    async fn query(&mut self, message: &str) -> InstrumentResult<String> {
        self.write(message).await?;
        self.read().await
    }

    /// Serial-poll the instrument's status byte.
    async fn read_status_byte(&mut self) -> InstrumentResult<u8>;

    /// Send a device clear.
    async fn clear(&mut self) -> InstrumentResult<()>;

    /// Release the session.
    async fn close(&mut self) -> InstrumentResult<()>;
}

/// Base type for GPIB instruments.
pub struct GpibBase<R> {
    address: String,
    resource: R,
}

#[cfg(feature = "visa")]
impl GpibBase<super::visa::VisaResource> {
    /// Open the instrument at `address` through the system VISA library.
    ///
    /// # Arguments
    /// * `address` - VISA resource string, e.g. `"GPIB::15"` or `"GPIB0::15::INSTR"`
    pub async fn open(address: &str) -> InstrumentResult<Self> {
        let resource = super::visa::VisaResource::open(address).await?;
        tracing::info!(address, "Opened GPIB instrument");
        Ok(Self::with_resource(address, resource))
    }
}

impl<R: GpibResource> GpibBase<R> {
    /// Wrap an already-open resource.
    pub fn with_resource(address: impl Into<String>, resource: R) -> Self {
        Self {
            address: address.into(),
            resource,
        }
    }

    /// Instrument address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Write a message to the instrument.
    pub async fn write(&mut self, message: &str) -> InstrumentResult<()> {
        tracing::trace!(address = %self.address, message, "GPIB write");
        self.resource.write(message).await
    }

    /// Read a message from the instrument.
    pub async fn read(&mut self) -> InstrumentResult<String> {
        let answer = self.resource.read().await?;
        tracing::trace!(address = %self.address, answer = %answer, "GPIB read");
        Ok(answer)
    }

    /// Write a message and read the answer.
    pub async fn query(&mut self, message: &str) -> InstrumentResult<String> {
        let answer = self.resource.query(message).await?;
        tracing::trace!(address = %self.address, message, answer = %answer, "GPIB query");
        Ok(answer)
    }

    /// Wait for a service request (SRQ) or the timeout to expire.
    ///
    /// The status byte is polled until its RQS bit is set. `None` waits forever.
    ///
    /// # Errors
    /// Returns [`crate::InstrumentError::Timeout`] if the timeout expired first.
    pub async fn wait_for_srq(&mut self, timeout: Option<Duration>) -> InstrumentResult<u8> {
        let address = self.address.clone();
        let resource = &mut self.resource;
        let status = util::timeout(timeout, async move {
            loop {
                let status = resource.read_status_byte().await?;
                if status & RQS_BIT != 0 {
                    return Ok(status);
                }
                tokio::time::sleep(SRQ_POLL_INTERVAL).await;
            }
        })
        .await?;
        tracing::debug!(address = %address, status, "Service request received");
        Ok(status)
    }

    /// Send a device clear.
    pub async fn clear(&mut self) -> InstrumentResult<()> {
        self.resource.clear().await
    }

    /// Close the session.
    pub async fn close(mut self) -> InstrumentResult<()> {
        tracing::info!(address = %self.address, "Closing GPIB instrument");
        self.resource.close().await
    }
}
