//! Instrument transports.
//!
//! Low-level communication layers shared by the device drivers: GPIB (through
//! VISA), RS-232 serial, RS-485 serial and TCP.

pub mod gpib;
pub mod rs485;
pub mod serial;
pub mod tcp;
#[cfg(feature = "visa")]
pub mod visa;

pub use gpib::{GpibBase, GpibResource, DEFAULT_SRQ_TIMEOUT};
pub use rs485::{Rs485Base, Rs485Port, Rs485Settings};
pub use serial::{DynSerial, Encoding, Parity, SerialBase, SerialPortIO, SerialSettings};
pub use tcp::{TcpBase, DEFAULT_TCP_TIMEOUT};
#[cfg(feature = "visa")]
pub use visa::VisaResource;
