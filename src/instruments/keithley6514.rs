//! Keithley 6514 System Electrometer Driver
//!
//! Reference: Keithley Model 6514 Instruction Manual
//!
//! Protocol Overview:
//! - Bus: GPIB (IEEE 488.2), SCPI command set
//! - Readings are returned as `READ, TIME` pairs (`FORM:ELEM READ, TIME`)
//! - Buffered acquisitions signal completion through a service request: the
//!   measurement event "buffer full" (bit 9) is enabled in the measurement
//!   event register and routed to the status byte with `*SRE 9`
//! - The trace buffer holds at most 2500 readings
//!
//! # Usage
//!
//! ```rust,ignore
//! use uedinst::instruments::Keithley6514;
//!
//! let mut electrometer = Keithley6514::open("GPIB::15").await?;
//! electrometer.set_measurement_function(MeasurementFunction::Current).await?;
//! let readings = electrometer.acquire_buffered(100, None, 0.01).await?;
//! electrometer.close().await?;
//! ```

use crate::error::{InstrumentError, InstrumentResult};
use crate::transport::gpib::{GpibBase, GpibResource};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

/// Maximum number of readings the trace buffer can hold.
pub const MAX_BUFFERED_READINGS: usize = 2500;

/// Valid integration time range in power-line cycles.
pub const NPLC_RANGE: (f64, f64) = (0.01, 10.0);

/// Default integration time in power-line cycles.
pub const DEFAULT_NPLC: f64 = 0.01;

/// Trigger source of the measurement layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Trigger immediately (`IMM`).
    Immediate,
    /// Trigger from the trigger link (`TLIN`).
    TriggerLink,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            TriggerSource::Immediate => "IMM",
            TriggerSource::TriggerLink => "TLIN",
        };
        write!(f, "{}", code)
    }
}

impl FromStr for TriggerSource {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IMM" | "IMMEDIATE" => Ok(TriggerSource::Immediate),
            "TLIN" | "TLINK" => Ok(TriggerSource::TriggerLink),
            other => Err(InstrumentError::InvalidParameter(format!(
                "Trigger source must be either IMM or TLIN, not {}",
                other
            ))),
        }
    }
}

/// Measurement function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementFunction {
    /// DC voltage (`VOLT`).
    Voltage,
    /// DC current (`CURR`).
    Current,
    /// Resistance (`RES`).
    Resistance,
    /// Charge (`CHAR`).
    Charge,
}

impl MeasurementFunction {
    /// SCPI mnemonic.
    pub fn code(&self) -> &'static str {
        match self {
            MeasurementFunction::Voltage => "VOLT",
            MeasurementFunction::Current => "CURR",
            MeasurementFunction::Resistance => "RES",
            MeasurementFunction::Charge => "CHAR",
        }
    }
}

impl fmt::Display for MeasurementFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for MeasurementFunction {
    type Err = InstrumentError;

    /// Accepts the short mnemonic or the `CONF?` form, e.g. `"VOLT:DC"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = s.trim().replace('"', "").to_uppercase();
        let head = cleaned.split(':').next().unwrap_or_default();
        match head {
            "VOLT" | "VOLTAGE" => Ok(MeasurementFunction::Voltage),
            "CURR" | "CURRENT" => Ok(MeasurementFunction::Current),
            "RES" | "RESISTANCE" => Ok(MeasurementFunction::Resistance),
            "CHAR" | "CHARGE" => Ok(MeasurementFunction::Charge),
            _ => Err(InstrumentError::InvalidParameter(format!(
                "The only supported measurement functions are VOLT, CURR, RES or CHAR, \
                 and {} is not one of them",
                s.trim()
            ))),
        }
    }
}

/// One buffered reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferedReading {
    /// Time stamp in seconds, relative to the start of the acquisition.
    pub time_s: f64,
    /// Reading in the units of the active measurement function.
    pub value: f64,
}

/// Driver for the Keithley 6514 electrometer.
pub struct Keithley6514<R> {
    gpib: GpibBase<R>,
}

#[cfg(feature = "visa")]
impl Keithley6514<crate::transport::VisaResource> {
    /// Open and initialise the electrometer at a VISA address, e.g. `"GPIB::15"`.
    pub async fn open(address: &str) -> InstrumentResult<Self> {
        Self::new(GpibBase::open(address).await?).await
    }
}

impl<R: GpibResource> Keithley6514<R> {
    /// Initialise the electrometer behind `gpib`.
    ///
    /// Resets the instrument, selects `READ, TIME` elements, resets the status
    /// model and enables the buffer-full measurement event. Without the status
    /// setup, waiting for a service request always times out.
    pub async fn new(mut gpib: GpibBase<R>) -> InstrumentResult<Self> {
        gpib.write("*RST;*CLS").await?;
        gpib.write("FORM:ELEM READ, TIME").await?;
        gpib.write("STAT:PRES").await?;
        gpib.write("STAT:MEAS:ENAB 512").await?;
        gpib.write("VOLT:NPLC 0.01").await?;
        tracing::info!(address = %gpib.address(), "Keithley 6514 initialised");
        Ok(Self { gpib })
    }

    /// Underlying GPIB session.
    pub fn gpib(&mut self) -> &mut GpibBase<R> {
        &mut self.gpib
    }

    async fn query_trimmed(&mut self, command: &str) -> InstrumentResult<String> {
        let answer = self.gpib.query(command).await?;
        Ok(answer.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Current trigger source.
    pub async fn trigger_source(&mut self) -> InstrumentResult<TriggerSource> {
        self.query_trimmed("TRIG:SOUR?").await?.parse()
    }

    /// Select immediate or trigger-link triggering.
    #[instrument(skip(self), err)]
    pub async fn set_trigger_source(&mut self, source: TriggerSource) -> InstrumentResult<()> {
        self.gpib.write(&format!("TRIG:SOUR {}", source)).await
    }

    /// Input trigger line, only meaningful with [`TriggerSource::TriggerLink`].
    pub async fn input_trigger_line(&mut self) -> InstrumentResult<u8> {
        let answer = self.query_trimmed("TRIG:TCON:ASYN:ILIN?").await?;
        answer.trim().parse::<u8>().map_err(|_| {
            InstrumentError::Protocol(format!("Failed to parse trigger line: '{}'", answer))
        })
    }

    /// Select the input trigger line, from 1 to 6.
    #[instrument(skip(self), err)]
    pub async fn set_input_trigger_line(&mut self, line: u8) -> InstrumentResult<()> {
        if !(1..=6).contains(&line) {
            return Err(InstrumentError::InvalidParameter(format!(
                "Input trigger line must be between 1 and 6, not {}",
                line
            )));
        }
        self.gpib.write(&format!("TRIG:TCON:ASYN:ILIN {}", line)).await
    }

    /// Active measurement function.
    pub async fn measurement_function(&mut self) -> InstrumentResult<MeasurementFunction> {
        // Answer has the form "VOLT:DC" including the quotes.
        self.query_trimmed("CONF?").await?.parse()
    }

    /// Configure one of the measurement functions.
    #[instrument(skip(self), err)]
    pub async fn set_measurement_function(
        &mut self,
        function: MeasurementFunction,
    ) -> InstrumentResult<()> {
        self.gpib.write(&format!("CONF:{}", function)).await?;
        self.gpib.write(&format!("{}:NPLC 0.01", function)).await
    }

    /// Drain the error queue.
    ///
    /// # Returns
    /// Non-zero error codes; empty if the queue was clear.
    pub async fn error_codes(&mut self) -> InstrumentResult<Vec<i32>> {
        let answer = self.query_trimmed("SYST:ERR:CODE:ALL?").await?;
        self.gpib.write("SYST:CLE").await?;
        parse_error_codes(&answer)
    }

    /// Enable or disable the front-panel display; acquisition is faster with it off.
    pub async fn toggle_display(&mut self, enabled: bool) -> InstrumentResult<()> {
        self.gpib.write(&format!("DISP:ENAB {}", on_off(enabled))).await
    }

    /// Enable or disable autozero; acquisition is faster with it off.
    pub async fn toggle_autozero(&mut self, enabled: bool) -> InstrumentResult<()> {
        self.gpib.write(&format!("SYST:AZER {}", on_off(enabled))).await
    }

    /// Enable or disable zero check.
    pub async fn toggle_zero_check(&mut self, enabled: bool) -> InstrumentResult<()> {
        self.gpib.write(&format!("SYST:ZCH {}", on_off(enabled))).await
    }

    /// Acquire `num` buffered readings.
    ///
    /// # Arguments
    /// * `num` - Number of readings, at most [`MAX_BUFFERED_READINGS`]
    /// * `timeout` - Time to wait for the buffer to fill; `None` waits forever
    /// * `nplc` - Integration time in power-line cycles, in [0.01, 10].
    ///   For reference, 6 NPLC is 16.67 ms at 60 Hz.
    ///
    /// Display, zero check and autozero are turned back on afterwards, also
    /// when the acquisition failed.
    ///
    /// # Errors
    /// - [`InstrumentError::InvalidParameter`] if `num` or `nplc` is out of range
    /// - [`InstrumentError::Timeout`] if the buffer did not fill in time
    #[instrument(skip(self), err)]
    pub async fn acquire_buffered(
        &mut self,
        num: usize,
        timeout: Option<Duration>,
        nplc: f64,
    ) -> InstrumentResult<Vec<BufferedReading>> {
        if num == 0 || num > MAX_BUFFERED_READINGS {
            return Err(InstrumentError::InvalidParameter(format!(
                "Cannot store {} readings in the buffer; choose between 1 and {}",
                num, MAX_BUFFERED_READINGS
            )));
        }
        if !nplc.is_finite() || nplc < NPLC_RANGE.0 || nplc > NPLC_RANGE.1 {
            return Err(InstrumentError::InvalidParameter(format!(
                "Cannot integrate for {:.2} NPLCs. Choose a value in [0.01, 10]",
                nplc
            )));
        }

        let acquired = self.run_buffered(num, timeout, nplc).await;
        let restored = self.restore_front_end().await;

        let readings = acquired?;
        restored?;
        tracing::debug!(count = readings.len(), "Buffered acquisition complete");
        Ok(readings)
    }

    async fn run_buffered(
        &mut self,
        num: usize,
        timeout: Option<Duration>,
        nplc: f64,
    ) -> InstrumentResult<Vec<BufferedReading>> {
        self.gpib.write(&format!("VOLT:NPLC {:.2}", nplc)).await?;
        self.gpib.write(&format!("TRIG:COUN {}", num)).await?;
        // Request service on buffer full
        self.gpib.write("*SRE 9").await?;

        self.gpib.write("TRAC:CLE").await?;
        self.gpib.write(&format!("TRAC:POIN {}", num)).await?;
        self.gpib.write("TRAC:FEED SENS1").await?;
        self.gpib.write("TRAC:FEED:CONT NEXT").await?;

        self.toggle_autozero(false).await?;
        self.toggle_zero_check(false).await?;
        self.toggle_display(false).await?;
        self.gpib.write("INIT").await?;

        self.gpib.wait_for_srq(timeout).await?;
        self.gpib.write("*CLS").await?;

        let data = self.query_trimmed("TRAC:DATA?").await?;
        parse_trace_data(&data, num)
    }

    /// Every toggle is attempted; the first failure is returned.
    async fn restore_front_end(&mut self) -> InstrumentResult<()> {
        let display = self.toggle_display(true).await;
        let zero_check = self.toggle_zero_check(true).await;
        let autozero = self.toggle_autozero(true).await;
        display.and(zero_check).and(autozero)
    }

    /// Report pending errors, reset the instrument and release the session.
    ///
    /// A failing reset is logged and ignored so the session is always released.
    pub async fn close(mut self) -> InstrumentResult<()> {
        match self.error_codes().await {
            Ok(codes) if !codes.is_empty() => {
                tracing::warn!(address = %self.gpib.address(), ?codes, "Keithley 6514 error codes")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Could not read Keithley 6514 error queue"),
        }
        if let Err(e) = self.gpib.write("*RST;*CLS").await {
            tracing::debug!(error = %e, "Keithley 6514 reset on close failed");
        }
        self.gpib.close().await
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

/// Parse the `SYST:ERR:CODE:ALL?` answer, e.g. `"0"` or `"-113,-222"`.
fn parse_error_codes(answer: &str) -> InstrumentResult<Vec<i32>> {
    let mut codes = Vec::new();
    for token in answer.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let code = token.parse::<i32>().map_err(|_| {
            InstrumentError::Protocol(format!("Unexpected error queue answer: '{}'", answer))
        })?;
        if code != 0 {
            codes.push(code);
        }
    }
    Ok(codes)
}

/// Parse `TRAC:DATA?`: alternating reading and time stamp values.
fn parse_trace_data(data: &str, num: usize) -> InstrumentResult<Vec<BufferedReading>> {
    let values = data
        .split(',')
        .map(|v| {
            v.trim().parse::<f64>().map_err(|_| {
                InstrumentError::Protocol(format!("Failed to parse buffered value: '{}'", v))
            })
        })
        .collect::<InstrumentResult<Vec<f64>>>()?;

    if values.len() < 2 * num {
        return Err(InstrumentError::Protocol(format!(
            "Expected {} buffered readings, received {} values",
            num,
            values.len()
        )));
    }

    Ok(values
        .chunks_exact(2)
        .take(num)
        .map(|pair| BufferedReading {
            value: pair[0],
            time_s: pair[1],
        })
        .collect())
}
