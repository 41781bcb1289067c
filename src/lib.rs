//! # uedinst
//!
//! Instrument control for ultrafast electron diffraction experiments.
//!
//! ## Crate Structure
//!
//! - **`error`**: The [`InstrumentError`] enum every operation returns, whatever the bus.
//!   Transport errors convert into it through `From`, so `?` is all a driver needs.
//! - **`transport`**: Base types shared by the drivers: [`transport::GpibBase`] (VISA),
//!   [`transport::SerialBase`], [`transport::Rs485Base`] and [`transport::TcpBase`].
//! - **`instruments`**: Device drivers built on those transports, e.g. the Keithley 6514
//!   electrometer and the Gatan Ultrascan 895 camera.
//! - **`util`**: IP-address validation and an optional-deadline `timeout`.
//! - **`config`**: TOML + environment configuration through `figment`.
//! - **`logging`**: `tracing-subscriber` setup.
//!
//! ## Feature Flags
//!
//! - `visa`: open GPIB instruments through the system VISA library (`visa-rs`).

pub mod config;
pub mod error;
pub mod instruments;
pub mod logging;
pub mod transport;
pub mod util;

pub use error::{InstrumentError, InstrumentResult};
pub use util::{is_valid_ip, timeout};
