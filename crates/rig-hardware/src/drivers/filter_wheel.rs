//! Nine-slot filter wheel, ASCII protocol at 4800 baud.
//!
//! Commands are CR-terminated: `F1r` resets to slot 1, `F1<n>` moves to slot
//! `n`, `?` asks for the current slot. The wheel answers a query with the
//! slot number on its own line.
//!
//! After a move or reset the driver waits for the wheel to turn, flushes the
//! interim response, queries `?` and parses the answer. When the answer is
//! missing or unparseable the slot is inferred from the command that was sent.

use std::thread;
use std::time::Duration;

use rig_core::error::{ConfigurationError, ConnectError, RigResult};
use rig_core::serial::{LinkSettings, PortOpener, SerialLink};
use tracing::{debug, info, instrument, warn};

/// Filter wheel baud rate.
pub const BAUD: u32 = 4800;
/// Highest slot number.
pub const MAX_POSITION: u8 = 9;
/// Slot assumed after a reset.
pub const RESET_POSITION: u8 = 1;

/// Delays around a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterTiming {
    /// Wait after the move command before querying.
    pub after_move: Duration,
    /// Wait after the query before reading.
    pub after_query: Duration,
}

impl Default for FilterTiming {
    fn default() -> Self {
        Self {
            after_move: Duration::from_millis(1000),
            after_query: Duration::from_millis(500),
        }
    }
}

impl FilterTiming {
    /// No delays (simulation and tests).
    pub fn immediate() -> Self {
        Self {
            after_move: Duration::ZERO,
            after_query: Duration::ZERO,
        }
    }
}

/// A wheel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCommand {
    /// `F1r`
    Reset,
    /// `F1<n>`
    MoveTo(u8),
    /// `?`
    Query,
}

impl FilterCommand {
    /// Validated move.
    pub fn move_to(position: u8) -> Result<Self, ConfigurationError> {
        if (1..=MAX_POSITION).contains(&position) {
            Ok(FilterCommand::MoveTo(position))
        } else {
            Err(ConfigurationError::OutOfRange {
                field: "filter position",
                value: i64::from(position),
                min: 1,
                max: i64::from(MAX_POSITION),
            })
        }
    }

    /// Wire bytes including the CR terminator.
    pub fn to_wire(self) -> Vec<u8> {
        match self {
            FilterCommand::Reset => b"F1r\r".to_vec(),
            FilterCommand::MoveTo(n) => format!("F1{}\r", n).into_bytes(),
            FilterCommand::Query => b"?\r".to_vec(),
        }
    }

    /// Slot implied by the command when the wheel does not say.
    pub fn implied_position(self) -> Option<u8> {
        match self {
            FilterCommand::Reset => Some(RESET_POSITION),
            FilterCommand::MoveTo(n) => Some(n),
            FilterCommand::Query => None,
        }
    }
}

/// Where a reported slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSource {
    /// Parsed from the wheel's answer.
    Reported,
    /// Inferred from the command.
    Inferred,
}

/// Outcome of a wheel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterReport {
    /// Slot after the command, if known.
    pub position: Option<u8>,
    /// How the slot was determined.
    pub source: PositionSource,
    /// Raw answer text.
    pub response: String,
}

/// Parse a query answer: digits only, within 1..=9.
pub fn parse_position(response: &str) -> Option<u8> {
    let text = response.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<u8>()
        .ok()
        .filter(|p| (1..=MAX_POSITION).contains(p))
}

/// Anything the filter worker can drive.
pub trait FilterDevice: Send {
    /// Execute one command and report the resulting slot.
    fn execute(&mut self, command: FilterCommand) -> RigResult<FilterReport>;
}

/// Connected filter wheel.
#[derive(Debug)]
pub struct FilterWheel {
    link: SerialLink,
    timing: FilterTiming,
}

impl FilterWheel {
    /// Open the wheel's port.
    pub fn connect(
        opener: &dyn PortOpener,
        port: &str,
        timing: FilterTiming,
    ) -> Result<Self, ConnectError> {
        let link = SerialLink::open(opener, LinkSettings::new(port, BAUD))?;
        info!(port, "filter wheel connected");
        Ok(Self { link, timing })
    }

    /// Wrap an already opened link.
    pub fn from_link(link: SerialLink, timing: FilterTiming) -> Self {
        Self { link, timing }
    }
}

impl FilterDevice for FilterWheel {
    #[instrument(skip(self), fields(port = %self.link.port()))]
    fn execute(&mut self, command: FilterCommand) -> RigResult<FilterReport> {
        self.link.clear_input()?;
        self.link.send(&command.to_wire())?;

        if command != FilterCommand::Query {
            thread::sleep(self.timing.after_move);
            self.link.clear_input()?;
            self.link.send(&FilterCommand::Query.to_wire())?;
            thread::sleep(self.timing.after_query);
        }

        let response = self.link.receive_line()?;
        if let Some(position) = parse_position(&response) {
            debug!(position, "wheel reported position");
            return Ok(FilterReport {
                position: Some(position),
                source: PositionSource::Reported,
                response,
            });
        }

        let position = command.implied_position();
        warn!(response = %response, ?position, "unusable wheel answer, inferring position");
        Ok(FilterReport {
            position,
            source: PositionSource::Inferred,
            response,
        })
    }
}

/// Validate and execute a move on any device.
pub fn move_to(device: &mut dyn FilterDevice, position: u8) -> RigResult<FilterReport> {
    let command = FilterCommand::move_to(position)?;
    device.execute(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::error::RigError;
    use rig_core::serial::{ScriptedPort, ScriptedPortHandle};

    fn wheel(responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) -> (FilterWheel, ScriptedPortHandle) {
        let (port, handle) = ScriptedPort::new(responder);
        let link = SerialLink::from_port(LinkSettings::new("mock", BAUD), Box::new(port));
        (FilterWheel::from_link(link, FilterTiming::immediate()), handle)
    }

    #[test]
    fn command_wire_format() {
        assert_eq!(FilterCommand::Reset.to_wire(), b"F1r\r");
        assert_eq!(FilterCommand::MoveTo(5).to_wire(), b"F15\r");
        assert_eq!(FilterCommand::Query.to_wire(), b"?\r");
        assert!(FilterCommand::move_to(0).is_err());
        assert!(FilterCommand::move_to(10).is_err());
    }

    #[test]
    fn position_parsing_is_strict() {
        assert_eq!(parse_position(" 4\r"), Some(4));
        assert_eq!(parse_position("F14"), None);
        assert_eq!(parse_position(""), None);
        assert_eq!(parse_position("12"), None);
    }

    #[test]
    fn move_reports_queried_position() {
        let (mut wheel, handle) = wheel(|req| (req == b"?\r").then(|| b"3\r\n".to_vec()));
        let report = move_to(&mut wheel, 3).unwrap();
        assert_eq!(report.position, Some(3));
        assert_eq!(report.source, PositionSource::Reported);
        assert_eq!(handle.written(), vec![b"F13\r".to_vec(), b"?\r".to_vec()]);
        assert_eq!(handle.discards(), 2);
    }

    #[test]
    fn silent_wheel_infers_from_command() {
        let (mut wheel, _) = wheel(|_| None);
        let report = move_to(&mut wheel, 7).unwrap();
        assert_eq!(report.position, Some(7));
        assert_eq!(report.source, PositionSource::Inferred);

        let reset = wheel.execute(FilterCommand::Reset).unwrap();
        assert_eq!(reset.position, Some(RESET_POSITION));
    }

    #[test]
    fn unanswered_query_is_unknown() {
        let (mut wheel, handle) = wheel(|_| Some(b"??\r\n".to_vec()));
        let report = wheel.execute(FilterCommand::Query).unwrap();
        assert_eq!(report.position, None);
        assert_eq!(report.response, "??");
        assert_eq!(handle.written().len(), 1);
    }

    #[test]
    fn out_of_range_move_never_reaches_the_wire() {
        let (mut wheel, handle) = wheel(|_| None);
        assert!(matches!(move_to(&mut wheel, 12), Err(RigError::Configuration(_))));
        assert!(handle.written().is_empty());
    }
}
