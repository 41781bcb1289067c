//! Small helpers shared by transports and drivers.

use crate::error::{InstrumentError, InstrumentResult};
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

/// Returns true if `address` is a valid IPv4 or IPv6 address.
///
/// Surrounding whitespace is ignored. Host names are not resolved and are
/// therefore rejected.
///
/// ```
/// use uedinst::util::is_valid_ip;
///
/// assert!(is_valid_ip("127.0.0.1"));
/// assert!(is_valid_ip("::1"));
/// assert!(!is_valid_ip("256.0.0.1"));
/// assert!(is_valid_ip(" 10.0.0.2 "));
/// assert!(!is_valid_ip("localhost"));
/// ```
pub fn is_valid_ip(address: &str) -> bool {
    validate_ip(address).is_ok()
}

/// Parses `address` as an IP address.
///
/// # Errors
///
/// Returns [`InstrumentError::InvalidAddress`] if the string is not an IPv4 or IPv6 address.
pub fn validate_ip(address: &str) -> InstrumentResult<IpAddr> {
    address
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| InstrumentError::InvalidAddress(address.to_string()))
}

/// Await `future`, giving up after `limit`.
///
/// `None` disables the deadline and waits for as long as the future takes.
///
/// # Errors
///
/// Returns [`InstrumentError::Timeout`] carrying `limit` when the deadline expires,
/// otherwise whatever the future itself returned.
pub async fn timeout<F, T>(limit: Option<Duration>, future: F) -> InstrumentResult<T>
where
    F: Future<Output = InstrumentResult<T>>,
{
    match limit {
        None => future.await,
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| InstrumentError::Timeout(limit))?,
    }
}

/// Converts an optional millisecond count into an optional [`Duration`].
pub fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}
