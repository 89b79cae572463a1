//! Command-line front end for the measurement rig.
//!
//! ```bash
//! specrig run routines/survey.txt --simulate
//! specrig parse routines/survey.txt --json
//! specrig crc 02 10 00 58 00 12 24
//! specrig move-motor /dev/ttyUSB0 45
//! ```
//!
//! Settings come from `config/specrig.toml` (or `--config`) overlaid with
//! `SPECRIG_*` environment variables. `RUST_LOG` overrides `log_level`.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rig_core::settings::RigSettings;
use rig_experiment::{RoutineProgram, RoutineProgress};
use rig_hardware::drivers::modbus::crc16;
use rig_hardware::simulated::SimulatedConfig;
use rig_hardware::spectrometer::AcquisitionState;
use specrig::{Controller, ControllerCommand, ControllerHandle, DeviceSet};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long `run` waits for the spectrometer before starting the routine.
const READY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "specrig")]
#[command(about = "Optical measurement rig controller", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a routine file to completion (Ctrl-C stops it)
    Run {
        /// Routine file
        routine: PathBuf,

        /// Use simulated devices only
        #[arg(long)]
        simulate: bool,
    },

    /// Parse a routine file and list its commands
    Parse {
        /// Routine file
        routine: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective settings as TOML
    Config,

    /// Append the Modbus CRC16 to a frame given as hex bytes
    Crc {
        /// Hex bytes, e.g. `02 03 00 58` or `02030058`
        #[arg(required = true)]
        bytes: Vec<String>,
    },

    /// Discover the motor's baud rate
    #[cfg(feature = "serial")]
    DetectBaud {
        /// Serial port
        port: String,

        /// Modbus slave address (defaults to the configured one)
        #[arg(long)]
        slave: Option<u8>,
    },

    /// Move the motor to an absolute angle
    #[cfg(feature = "serial")]
    MoveMotor {
        /// Serial port
        port: String,

        /// Target angle in degrees
        #[arg(allow_negative_numbers = true)]
        angle: f64,

        /// Modbus slave address (defaults to the configured one)
        #[arg(long)]
        slave: Option<u8>,
    },
}

fn init_logging(settings: &RigSettings, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = RigSettings::load(cli.config.as_deref())?;
    init_logging(&settings, cli.json_logs);

    match cli.command {
        Commands::Run { routine, simulate } => run_routine(settings, &routine, simulate).await,
        Commands::Parse { routine, json } => parse_routine(&routine, json),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Crc { bytes } => {
            let frame = parse_hex(&bytes)?;
            let crc = crc16(&frame);
            let mut full = frame;
            full.extend_from_slice(&crc.to_le_bytes());
            println!("CRC16/Modbus: 0x{crc:04X}");
            println!("Frame: {}", format_hex(&full));
            Ok(())
        }
        #[cfg(feature = "serial")]
        Commands::DetectBaud { port, slave } => {
            let slave = slave.unwrap_or(settings.motor.slave_id);
            let motor = tokio::task::spawn_blocking(move || {
                rig_hardware::drivers::az_motor::AzMotor::connect(
                    &rig_core::serial::SystemPortOpener,
                    &port,
                    slave,
                )
            })
            .await??;
            println!("Motor answered at {} baud on {}", motor.link().baud(), motor.link().port());
            Ok(())
        }
        #[cfg(feature = "serial")]
        Commands::MoveMotor { port, angle, slave } => {
            use rig_hardware::drivers::az_motor::{AzMotor, MotorDevice};

            let slave = slave.unwrap_or(settings.motor.slave_id);
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut motor = AzMotor::connect(&rig_core::serial::SystemPortOpener, &port, slave)?;
                motor.move_to(angle)?;
                Ok(())
            })
            .await??;
            println!("Motor moved to {angle:.2}°");
            Ok(())
        }
    }
}

// =============================================================================
// run
// =============================================================================

fn device_set(settings: &RigSettings, simulate: bool) -> DeviceSet {
    if simulate {
        info!("using simulated devices");
        return DeviceSet::simulated(SimulatedConfig::default()).0;
    }
    #[cfg(feature = "serial")]
    {
        use rig_hardware::simulated::SimulatedSpectrometer;
        use std::sync::Arc;

        warn!("no vendor spectrometer binding is built in, using the simulated spectrometer");
        let spectrometer = Arc::new(SimulatedSpectrometer::new(SimulatedConfig::default()));
        DeviceSet::serial(settings, spectrometer)
    }
    #[cfg(not(feature = "serial"))]
    {
        let _ = settings;
        warn!("built without serial support, using simulated devices");
        DeviceSet::simulated(SimulatedConfig::default()).0
    }
}

async fn wait_until_ready(handle: &ControllerHandle) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if handle.snapshot().await?.acquisition == AcquisitionState::Ready {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(false)
}

async fn run_routine(settings: RigSettings, path: &Path, simulate: bool) -> Result<()> {
    let program = RoutineProgram::load(path)?;
    for skipped in program.skipped() {
        eprintln!("skipping {skipped}");
    }
    if program.is_empty() {
        bail!("{} contains no runnable commands", path.display());
    }

    let devices = device_set(&settings, simulate);
    let (handle, task) = Controller::spawn(settings, devices)?;

    let mut status = handle.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(message) => println!("{} {message}", message.at.format("%H:%M:%S%.3f")),
                Err(RecvError::Lagged(missed)) => warn!(missed, "status output fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if !wait_until_ready(&handle).await? {
        warn!(timeout_s = READY_TIMEOUT.as_secs(), "spectrometer not ready, starting the routine anyway");
    }

    let progress = tokio::select! {
        progress = handle.run_routine(program) => progress?,
        _ = signal::ctrl_c() => {
            info!("interrupted, stopping routine");
            handle.send(ControllerCommand::StopRoutine)?;
            RoutineProgress::Stopped
        }
    };
    info!(?progress, "routine finished");

    handle.shutdown()?;
    task.await.context("controller task failed")?;
    printer.abort();
    Ok(())
}

// =============================================================================
// parse / crc
// =============================================================================

fn parse_routine(path: &Path, json: bool) -> Result<()> {
    let program = RoutineProgram::load(path)?;
    if json {
        let skipped: Vec<_> = program
            .skipped()
            .iter()
            .map(|e| {
                serde_json::json!({
                    "line": e.line,
                    "text": e.text,
                    "reason": e.reason,
                })
            })
            .collect();
        let out = serde_json::json!({
            "name": program.name(),
            "commands": program.commands(),
            "skipped": skipped,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{} ({} commands)", program.name(), program.len());
    for (i, command) in program.commands().iter().enumerate() {
        println!("{:>4}  {command}", i + 1);
    }
    for skipped in program.skipped() {
        println!("skipped {skipped}");
    }
    Ok(())
}

fn parse_hex(tokens: &[String]) -> Result<Vec<u8>> {
    let digits: String = tokens
        .iter()
        .flat_map(|t| t.split(|c: char| c == ',' || c.is_whitespace()))
        .map(|t| t.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            let pair = &digits[i..i + 2];
            u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex byte '{pair}'"))
        })
        .collect()
}

fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_accepts_spaced_and_packed_forms() {
        let spaced = parse_hex(&["02".into(), "03".into(), "00".into(), "58".into()]).unwrap();
        let packed = parse_hex(&["0x02030058".into()]).unwrap();
        assert_eq!(spaced, vec![0x02, 0x03, 0x00, 0x58]);
        assert_eq!(spaced, packed);
        assert!(parse_hex(&["123".into()]).is_err());
        assert!(parse_hex(&["zz".into()]).is_err());
    }

    #[test]
    fn formats_upper_case_pairs() {
        assert_eq!(format_hex(&[0x0a, 0xff, 0x00]), "0A FF 00");
    }

    #[test]
    fn cli_parses_negative_angles() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
        #[cfg(feature = "serial")]
        {
            let cli = Cli::try_parse_from(["specrig", "move-motor", "COM3", "-12.5"]).unwrap();
            assert!(matches!(cli.command, Commands::MoveMotor { angle, .. } if angle == -12.5));
        }
    }
}
