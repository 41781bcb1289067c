//! Error type shared by every instrument.
//!
//! Instruments talk to hardware over very different transports (VISA/GPIB,
//! RS-232, RS-485, raw TCP), each with its own error type. Callers should not
//! have to care which bus a device sits on, so every public operation in this
//! crate returns [`InstrumentError`].
//!
//! ## Error Hierarchy
//!
//! - **`Io`**, **`Serial`**, **`Visa`**: transport failures. These are converted
//!   automatically through `From`, so `?` at any call site turns a bus error into
//!   an instrument error.
//! - **`Timeout`**: a deadline expired (SRQ wait, TCP connect, serial read).
//! - **`Connection`**: the instrument could not be reached or did not identify
//!   itself correctly.
//! - **`Command`** and **`Protocol`**: the instrument answered, but the answer was
//!   an error indication or could not be understood.
//! - **`InvalidParameter`**, **`InvalidAddress`**, **`Encoding`**: the caller
//!   asked for something the instrument cannot do. Nothing was sent.
//! - **`Config`**: configuration loading failed.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the instrument error type.
pub type InstrumentResult<T> = std::result::Result<T, InstrumentError>;

/// Primary error type for instrument control.
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// Standard I/O failure on a socket, serial stream or temporary file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// VISA library reported a failure.
    #[error("VISA error: {0}")]
    Visa(String),

    /// Operation did not complete before its deadline.
    #[error("Operation timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// Instrument could not be reached or identified.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Instrument rejected a command.
    #[error("Command failed: {command}. Answer received: {answer}")]
    Command {
        /// Command as sent to the instrument.
        command: String,
        /// Raw answer received.
        answer: String,
    },

    /// Answer could not be parsed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Caller argument is outside what the instrument accepts.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// String is not a valid IPv4 or IPv6 address.
    #[error("Invalid IP address: '{0}'")]
    InvalidAddress(String),

    /// Text cannot be represented in the instrument's encoding.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A write returned before all bytes were sent.
    #[error("Incomplete write: {written} of {expected} bytes sent")]
    IncompleteWrite {
        /// Bytes accepted by the port.
        written: usize,
        /// Bytes that should have been sent.
        expected: usize,
    },

    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}

impl InstrumentError {
    /// True for deadline expiries, including I/O errors of kind `TimedOut`.
    pub fn is_timeout(&self) -> bool {
        match self {
            InstrumentError::Timeout(_) => true,
            InstrumentError::Io(err) => err.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// True when the failure came from the bus rather than from the instrument's answer.
    ///
    /// Transport errors are usually worth a retry after reconnecting;
    /// command and parameter errors are not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            InstrumentError::Io(_)
                | InstrumentError::Serial(_)
                | InstrumentError::Visa(_)
                | InstrumentError::Timeout(_)
                | InstrumentError::Connection(_)
        )
    }
}

#[cfg(feature = "visa")]
impl From<visa_rs::Error> for InstrumentError {
    fn from(err: visa_rs::Error) -> Self {
        InstrumentError::Visa(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn fails() -> InstrumentResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))?;
            Ok(())
        }

        let err = fails().unwrap_err();
        assert!(matches!(err, InstrumentError::Io(_)));
        assert!(err.is_transport());
        assert!(!err.is_timeout());
    }

    #[test]
    fn timed_out_io_counts_as_timeout() {
        let err = InstrumentError::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(err.is_timeout());
    }

    #[test]
    fn command_error_is_not_transport() {
        let err = InstrumentError::Command {
            command: "ULTRASCAN;INSERT;TRUE".into(),
            answer: "ERR".into(),
        };
        assert!(!err.is_transport());
        assert_eq!(
            err.to_string(),
            "Command failed: ULTRASCAN;INSERT;TRUE. Answer received: ERR"
        );
    }

    #[test]
    fn timeout_message_reports_millis() {
        let err = InstrumentError::Timeout(Duration::from_millis(25_000));
        assert_eq!(err.to_string(), "Operation timed out after 25000 ms");
    }
}
