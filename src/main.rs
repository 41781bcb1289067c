//! CLI Entry Point for uedinst
//!
//! Provides command-line access to:
//! - Configuration checking
//! - Serial port discovery
//! - One-shot acquisitions from the Gatan camera and (with `visa`) the Keithley electrometer
//!
//! # Usage
//!
//! ```bash
//! uedinst check-config config/uedinst.toml
//! uedinst gatan --exposure 1.5 --output frame.raw
//! uedinst electrometer --address GPIB::15 --num 100
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uedinst::config::{Config, InstrumentSettings};
use uedinst::instruments::{GatanConfig, GatanUltrascan895};
use uedinst::logging::{self, OutputFormat, TracingConfig};

#[derive(Parser)]
#[command(name = "uedinst")]
#[command(about = "Laboratory instrument control for UED experiments", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    CheckConfig {
        /// Path to the TOML configuration
        path: PathBuf,
    },

    /// Check whether a string is a valid IP address
    ValidateIp {
        /// Address to check
        address: String,
    },

    /// List serial ports present on this machine
    Ports,

    /// Acquire one frame from the Gatan Ultrascan 895
    Gatan {
        /// Plugin server address
        #[arg(long, default_value = uedinst::instruments::gatan::DEFAULT_ADDR)]
        addr: String,

        /// Plugin server port
        #[arg(long, default_value_t = uedinst::instruments::gatan::DEFAULT_PORT)]
        port: u16,

        /// Directory for the temporary image file
        #[arg(long)]
        tempdir: Option<PathBuf>,

        /// Exposure in seconds
        #[arg(long, default_value_t = 1.0)]
        exposure: f64,

        /// Keep the dark background
        #[arg(long)]
        keep_dark: bool,

        /// Skip gain normalisation
        #[arg(long)]
        no_gain_normalization: bool,

        /// Where to write the frame (raw little-endian i16)
        #[arg(long)]
        output: PathBuf,
    },

    /// Acquire buffered readings from a Keithley 6514
    #[cfg(feature = "visa")]
    Electrometer {
        /// VISA address
        #[arg(long, default_value = "GPIB::15")]
        address: String,

        /// Number of readings (max 2500)
        #[arg(long, default_value_t = 100)]
        num: usize,

        /// Integration time in power-line cycles
        #[arg(long, default_value_t = uedinst::instruments::keithley6514::DEFAULT_NPLC)]
        nplc: f64,

        /// Timeout in milliseconds; waits forever if absent
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = logging::parse_log_level(&cli.log_level).map_err(anyhow::Error::msg)?;
    let format: OutputFormat = cli.log_format.parse().map_err(anyhow::Error::msg)?;
    logging::init(TracingConfig::new(level).with_format(format)).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::CheckConfig { path } => check_config(path),
        Commands::ValidateIp { address } => {
            let valid = uedinst::is_valid_ip(&address);
            println!("{}: {}", address, if valid { "valid" } else { "invalid" });
            if valid {
                Ok(())
            } else {
                anyhow::bail!("'{}' is not a valid IP address", address)
            }
        }
        Commands::Ports => list_ports(),
        Commands::Gatan {
            addr,
            port,
            tempdir,
            exposure,
            keep_dark,
            no_gain_normalization,
            output,
        } => {
            let config = GatanConfig {
                addr,
                port,
                tempdir,
                ..Default::default()
            };
            acquire_gatan(&config, exposure, !keep_dark, !no_gain_normalization, output).await
        }
        #[cfg(feature = "visa")]
        Commands::Electrometer {
            address,
            num,
            nplc,
            timeout_ms,
        } => acquire_electrometer(&address, num, nplc, timeout_ms).await,
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = Config::load_from(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate().context("Configuration is invalid")?;

    println!("{} ({} instruments)", config.application.name, config.instruments.len());
    for instrument in &config.instruments {
        let detail = match instrument.settings()? {
            InstrumentSettings::Keithley6514(s) => s.address,
            InstrumentSettings::GatanUltrascan895(s) => format!("{}:{}", s.addr, s.port),
        };
        println!(
            "  {:<16} {:<20} {:<24} {}",
            instrument.id,
            instrument.kind()?.name(),
            detail,
            if instrument.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let kind = match port.port_type {
            serialport::SerialPortType::UsbPort(info) => format!(
                "USB {:04x}:{:04x} {}",
                info.vid,
                info.pid,
                info.product.unwrap_or_default()
            ),
            serialport::SerialPortType::PciPort => "PCI".to_string(),
            serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            serialport::SerialPortType::Unknown => "unknown".to_string(),
        };
        println!("{:<24} {}", port.port_name, kind);
    }
    Ok(())
}

async fn acquire_gatan(
    config: &GatanConfig,
    exposure: f64,
    remove_dark: bool,
    normalize_gain: bool,
    output: PathBuf,
) -> Result<()> {
    let mut camera = GatanUltrascan895::connect(config).await?;
    tracing::info!(version = camera.version(), "Camera server ready");

    let image = camera
        .acquire_image(exposure, remove_dark, normalize_gain)
        .await
        .context("Acquisition failed")?;
    camera.close().await?;

    let bytes: Vec<u8> = image.pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
    tokio::fs::write(&output, bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let max = image.pixels.iter().copied().max().unwrap_or_default();
    let total: f64 = image.pixels.iter().map(|&p| f64::from(p)).sum();
    let mean = total / image.pixels.len().max(1) as f64;
    println!(
        "{}",
        serde_json::json!({
            "output": output,
            "width": image.width,
            "height": image.height,
            "max": max,
            "mean": mean,
        })
    );
    Ok(())
}

#[cfg(feature = "visa")]
async fn acquire_electrometer(
    address: &str,
    num: usize,
    nplc: f64,
    timeout_ms: Option<u64>,
) -> Result<()> {
    use uedinst::instruments::Keithley6514;

    let mut electrometer = Keithley6514::open(address)
        .await
        .with_context(|| format!("Failed to open electrometer at {}", address))?;
    let readings = electrometer
        .acquire_buffered(num, uedinst::util::millis(timeout_ms), nplc)
        .await;
    electrometer.close().await?;

    println!("{}", serde_json::to_string_pretty(&readings?)?);
    Ok(())
}
