//! Device drivers.
//!
//! | Kind                 | Instrument                    | Transport |
//! |----------------------|-------------------------------|-----------|
//! | `keithley6514`       | Keithley 6514 electrometer    | GPIB      |
//! | `gatan_ultrascan895` | Gatan Ultrascan 895 camera    | TCP       |

pub mod gatan;
pub mod keithley6514;

pub use gatan::{GatanConfig, GatanUltrascan895, Image};
pub use keithley6514::{BufferedReading, Keithley6514, MeasurementFunction, TriggerSource};

use crate::error::InstrumentError;
use std::fmt;
use std::str::FromStr;

/// Instrument types that can be declared in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    /// Keithley 6514 electrometer.
    Keithley6514,
    /// Gatan Ultrascan 895 camera.
    GatanUltrascan895,
}

impl InstrumentKind {
    /// All supported kinds.
    pub const ALL: [InstrumentKind; 2] =
        [InstrumentKind::Keithley6514, InstrumentKind::GatanUltrascan895];

    /// Configuration type string.
    pub fn type_name(&self) -> &'static str {
        match self {
            InstrumentKind::Keithley6514 => "keithley6514",
            InstrumentKind::GatanUltrascan895 => "gatan_ultrascan895",
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            InstrumentKind::Keithley6514 => "Keithley 6514 Electrometer",
            InstrumentKind::GatanUltrascan895 => "Gatan Ultrascan 895",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl FromStr for InstrumentKind {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        InstrumentKind::ALL
            .into_iter()
            .find(|kind| kind.type_name() == wanted)
            .ok_or_else(|| {
                InstrumentError::InvalidParameter(format!(
                    "Unknown instrument type '{}'. Supported: {}",
                    s,
                    InstrumentKind::ALL.map(|k| k.type_name()).join(", ")
                ))
            })
    }
}
