//! Routine scripts.
//!
//! One command per line; blank lines and `#` comments are ignored; keywords
//! are case-insensitive.
//!
//! ```text
//! wait <ms>
//! log <text>
//! motor move <degrees>
//! filter position <1-9>
//! integration <ms>
//! spectrometer start | stop | save [<name>]
//! data start | stop
//! plot
//! ```
//!
//! Parsing is lenient: a line that cannot be interpreted is logged and skipped
//! so that one typo does not abort a long unattended run. The skipped lines
//! are kept on the [`RoutineProgram`] for reporting.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use rig_core::error::RoutineParseError;
use serde::Serialize;
use tracing::{debug, warn};

/// Highest filter slot.
const MAX_FILTER_POSITION: u8 = 9;

/// One routine command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Suspend for `ms`.
    Wait {
        /// Milliseconds.
        ms: u64,
    },
    /// Report `text` as a status message.
    Log {
        /// Message.
        text: String,
    },
    /// Move the motor, then settle.
    MoveMotor {
        /// Target angle in degrees.
        angle_deg: f64,
    },
    /// Move the filter wheel, then settle.
    SetFilter {
        /// Slot 1-9.
        position: u8,
    },
    /// Start continuous measurement.
    SpectrometerStart,
    /// Stop measurement.
    SpectrometerStop,
    /// Save the current scan.
    SpectrometerSave {
        /// Optional label.
        name: Option<String>,
    },
    /// Apply a new integration time.
    SetIntegration {
        /// Milliseconds.
        ms: f64,
    },
    /// Keep the current scan as the routine's final data (`plot`).
    Snapshot,
    /// Start continuous data saving.
    DataStart,
    /// Stop continuous data saving.
    DataStop,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Wait { ms } => write!(f, "wait {ms}"),
            Command::Log { text } => write!(f, "log {text}"),
            Command::MoveMotor { angle_deg } => write!(f, "motor move {angle_deg}"),
            Command::SetFilter { position } => write!(f, "filter position {position}"),
            Command::SpectrometerStart => write!(f, "spectrometer start"),
            Command::SpectrometerStop => write!(f, "spectrometer stop"),
            Command::SpectrometerSave { name: None } => write!(f, "spectrometer save"),
            Command::SpectrometerSave { name: Some(name) } => write!(f, "spectrometer save {name}"),
            Command::SetIntegration { ms } => write!(f, "integration {ms}"),
            Command::Snapshot => write!(f, "plot"),
            Command::DataStart => write!(f, "data start"),
            Command::DataStop => write!(f, "data stop"),
        }
    }
}

fn number<T: std::str::FromStr>(token: Option<&str>, what: &str) -> Result<T, String> {
    let token = token.ok_or_else(|| format!("missing {what}"))?;
    token
        .parse()
        .map_err(|_| format!("invalid {what} '{token}'"))
}

/// Parse one line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: usize, text: &str) -> Result<Option<Command>, RoutineParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let fail = |reason: String| RoutineParseError {
        line,
        text: trimmed.to_string(),
        reason,
    };

    let mut tokens = trimmed.split_whitespace();
    let keyword = tokens.next().unwrap_or_default().to_ascii_lowercase();
    let sub = tokens.next();
    let sub_lower = sub.map(str::to_ascii_lowercase);

    let command = match (keyword.as_str(), sub_lower.as_deref()) {
        ("wait", _) => Command::Wait {
            ms: number(sub, "wait time").map_err(fail)?,
        },
        ("log", _) => Command::Log {
            text: sub.map(|first| {
                std::iter::once(first).chain(tokens.by_ref()).collect::<Vec<_>>().join(" ")
            })
            .unwrap_or_default(),
        },
        ("motor", Some("move")) => {
            let angle_deg: f64 = number(tokens.next(), "angle").map_err(fail)?;
            if !angle_deg.is_finite() {
                return Err(fail(format!("invalid angle '{angle_deg}'")));
            }
            Command::MoveMotor { angle_deg }
        }
        ("filter", Some("position")) => {
            let position: u8 = number(tokens.next(), "filter position").map_err(fail)?;
            if !(1..=MAX_FILTER_POSITION).contains(&position) {
                return Err(fail(format!(
                    "filter position {position} outside 1-{MAX_FILTER_POSITION}"
                )));
            }
            Command::SetFilter { position }
        }
        ("integration", _) => {
            let ms: f64 = number(sub, "integration time").map_err(fail)?;
            if !ms.is_finite() {
                return Err(fail(format!("invalid integration time '{ms}'")));
            }
            Command::SetIntegration { ms }
        }
        ("spectrometer", Some("start")) => Command::SpectrometerStart,
        ("spectrometer", Some("stop")) => Command::SpectrometerStop,
        ("spectrometer", Some("save")) => {
            let rest: Vec<_> = tokens.by_ref().collect();
            Command::SpectrometerSave {
                name: (!rest.is_empty()).then(|| rest.join(" ")),
            }
        }
        ("data", Some("start")) => Command::DataStart,
        ("data", Some("stop")) => Command::DataStop,
        ("plot", _) => Command::Snapshot,
        _ => return Err(fail("unknown command".to_string())),
    };
    Ok(Some(command))
}

/// A parsed routine.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineProgram {
    name: String,
    commands: Vec<Command>,
    skipped: Vec<RoutineParseError>,
}

impl RoutineProgram {
    /// Parse `text`, skipping lines that cannot be interpreted.
    pub fn parse(name: impl Into<String>, text: &str) -> Self {
        let name = name.into();
        let mut commands = Vec::new();
        let mut skipped = Vec::new();
        for (index, line) in text.lines().enumerate() {
            match parse_line(index + 1, line) {
                Ok(Some(command)) => commands.push(command),
                Ok(None) => {}
                Err(e) => {
                    warn!(routine = %name, error = %e, "skipping routine line");
                    skipped.push(e);
                }
            }
        }
        debug!(routine = %name, commands = commands.len(), skipped = skipped.len(), "routine parsed");
        Self {
            name,
            commands,
            skipped,
        }
    }

    /// Read and parse a routine file; the name is the file stem.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read routine {}", path.display()))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "routine".to_string());
        Ok(Self::parse(name, &text))
    }

    /// Routine name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commands in execution order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Lines that were skipped.
    pub fn skipped(&self) -> &[RoutineParseError] {
        &self.skipped
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// No commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
