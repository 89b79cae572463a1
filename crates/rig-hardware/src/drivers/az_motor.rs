//! Oriental Motor AZ-series stepper driver over Modbus RTU.
//!
//! The driver has no explicit handshake, so baud discovery is a heuristic:
//! each rate in [`BAUD_RATES`] is tried with 8-E-1 framing, a 2-register
//! read is sent, and the first rate that produces any reply within
//! [`DISCOVERY_TIMEOUT`] wins.
//!
//! Moves use the direct-operation block at register 0x0058: one 36-byte
//! write-multiple request carrying data number, method, target position
//! (steps, big-endian signed), speed, acceleration, deceleration, current
//! and two trigger fields.
//!
//! All calls block for up to the link timeout; they run on the motor worker
//! thread, never on the control thread.

use std::time::Duration;

use rig_core::error::{ConnectError, MoveError, ProtocolError, TransportError};
use rig_core::serial::{LinkSettings, Parity, PortOpener, SerialLink};
use tracing::{debug, info, instrument, warn};

use super::modbus::{is_write_ack, verify_crc, ModbusFrame};

/// Baud rates in probing order.
pub const BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115200, 230400];
/// Default Modbus slave address.
pub const DEFAULT_SLAVE_ID: u8 = 2;
/// Motor steps per degree.
pub const STEPS_PER_DEGREE: f64 = 100.0;
/// Direct-operation register block.
pub const OPERATION_REGISTER: u16 = 0x0058;
/// Per-read timeout during discovery and moves.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(500);

const DISCOVERY_REGISTERS: u16 = 2;
const DISCOVERY_READ_LEN: usize = 5;
const ACK_LEN: usize = 8;

const DATA_NUMBER: u32 = 1;
const METHOD: u32 = 1;
const SPEED: u32 = 10_000;
const ACCELERATION: u32 = 8000;
const DECELERATION: u32 = 8000;
const CURRENT: u32 = 1000;
const TRIGGER: u32 = 1;
const EXECUTE: u32 = 1;

/// Length of the move payload.
pub const MOVE_PAYLOAD_LEN: usize = 36;

/// Convert degrees to motor steps, truncating toward zero and clamping to
/// the signed 32-bit range.
pub fn angle_to_steps(angle_deg: f64) -> i32 {
    if angle_deg.is_nan() {
        return 0;
    }
    let steps = (angle_deg * STEPS_PER_DEGREE).trunc();
    steps.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
}

/// A requested move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveCommand {
    /// Target angle in degrees.
    pub angle_deg: f64,
    /// Derived, clamped step count.
    pub steps: i32,
}

impl MoveCommand {
    /// Build a move to `angle_deg`.
    pub fn new(angle_deg: f64) -> Self {
        Self {
            angle_deg,
            steps: angle_to_steps(angle_deg),
        }
    }

    /// The 36-byte direct-operation payload.
    pub fn payload(&self) -> [u8; MOVE_PAYLOAD_LEN] {
        let mut out = [0u8; MOVE_PAYLOAD_LEN];
        let fields: [[u8; 4]; 9] = [
            DATA_NUMBER.to_be_bytes(),
            METHOD.to_be_bytes(),
            self.steps.to_be_bytes(),
            SPEED.to_be_bytes(),
            ACCELERATION.to_be_bytes(),
            DECELERATION.to_be_bytes(),
            CURRENT.to_be_bytes(),
            TRIGGER.to_be_bytes(),
            EXECUTE.to_be_bytes(),
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields.iter()) {
            chunk.copy_from_slice(field);
        }
        out
    }

    /// Complete request frame for `slave`.
    pub fn frame(&self, slave: u8) -> Result<ModbusFrame, ProtocolError> {
        ModbusFrame::write_multiple_registers(slave, OPERATION_REGISTER, &self.payload())
    }
}

/// The read used during baud discovery.
pub fn discovery_frame(slave: u8) -> ModbusFrame {
    ModbusFrame::read_holding_registers(slave, OPERATION_REGISTER, DISCOVERY_REGISTERS)
}

fn link_settings(port: &str, baud: u32) -> LinkSettings {
    LinkSettings::new(port, baud)
        .with_parity(Parity::Even)
        .with_timeout(DISCOVERY_TIMEOUT)
}

/// Find the baud rate the motor answers at.
///
/// Returns the open link and the baud. `Transport(..)` means the port never
/// opened at any rate; `NoResponse` means it opened but nothing answered.
#[instrument(skip(opener), fields(port = %port))]
pub fn discover_baud(
    opener: &dyn PortOpener,
    port: &str,
    slave: u8,
) -> Result<(SerialLink, u32), ConnectError> {
    let query = discovery_frame(slave);
    let mut last_open_error: Option<TransportError> = None;
    let mut opened_any = false;

    for baud in BAUD_RATES {
        let mut link = match SerialLink::open(opener, link_settings(port, baud)) {
            Ok(link) => link,
            Err(e) => {
                debug!(baud, error = %e, "open failed");
                last_open_error = Some(e);
                continue;
            }
        };
        opened_any = true;

        if let Err(e) = link.send(query.as_bytes()) {
            debug!(baud, error = %e, "discovery write failed");
            continue;
        }
        match link.receive(DISCOVERY_READ_LEN) {
            Ok(reply) if !reply.is_empty() => {
                info!(baud, "motor answered discovery read");
                return Ok((link, baud));
            }
            Ok(_) => debug!(baud, "no reply"),
            Err(e) => debug!(baud, error = %e, "discovery read failed"),
        }
        link.close();
    }

    match (opened_any, last_open_error) {
        (false, Some(e)) => Err(ConnectError::Transport(e)),
        _ => Err(ConnectError::NoResponse {
            port: port.to_string(),
            attempts: BAUD_RATES.len(),
        }),
    }
}

/// Send one move on an open link and check the acknowledgement.
pub fn send_move(link: &mut SerialLink, slave: u8, command: &MoveCommand) -> Result<(), MoveError> {
    let frame = command.frame(slave)?;
    link.clear_input()?;
    link.send(frame.as_bytes())?;
    let reply = link.receive(ACK_LEN)?;

    if !is_write_ack(&reply) {
        return Err(MoveError::NoAck);
    }
    if reply.len() == ACK_LEN {
        verify_crc(&reply)?;
    }
    Ok(())
}

/// Anything the motor worker can drive.
pub trait MotorDevice: Send {
    /// Move to an absolute angle, blocking until acknowledged or timed out.
    fn move_to(&mut self, angle_deg: f64) -> Result<(), MoveError>;

    /// Negotiated baud rate, if any.
    fn baud(&self) -> Option<u32>;
}

/// A connected AZ-series motor.
#[derive(Debug)]
pub struct AzMotor {
    link: SerialLink,
    slave: u8,
    angle_deg: Option<f64>,
}

impl AzMotor {
    /// Discover the baud rate on `port` and keep the link.
    pub fn connect(opener: &dyn PortOpener, port: &str, slave: u8) -> Result<Self, ConnectError> {
        let (link, baud) = discover_baud(opener, port, slave)?;
        info!(port, baud, "motor connected");
        Ok(Self {
            link,
            slave,
            angle_deg: None,
        })
    }

    /// Last acknowledged angle.
    pub fn angle(&self) -> Option<f64> {
        self.angle_deg
    }

    /// The owned link.
    pub fn link(&self) -> &SerialLink {
        &self.link
    }
}

impl MotorDevice for AzMotor {
    #[instrument(skip(self), fields(port = %self.link.port()))]
    fn move_to(&mut self, angle_deg: f64) -> Result<(), MoveError> {
        let command = MoveCommand::new(angle_deg);
        match send_move(&mut self.link, self.slave, &command) {
            Ok(()) => {
                self.angle_deg = Some(angle_deg);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, steps = command.steps, "move failed");
                Err(e)
            }
        }
    }

    fn baud(&self) -> Option<u32> {
        Some(self.link.baud())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::serial::{DynPort, ScriptedPort, ScriptedPortHandle};
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn steps_clamp_instead_of_wrapping() {
        assert_eq!(angle_to_steps(45.0), 4500);
        assert_eq!(angle_to_steps(-12.345), -1234);
        assert_eq!(angle_to_steps(21_474_836.0), 2_147_483_600);
        assert_eq!(angle_to_steps(21_474_837.0), i32::MAX);
        assert_eq!(angle_to_steps(1.0e12), i32::MAX);
        assert_eq!(angle_to_steps(-1.0e12), i32::MIN);
        assert_eq!(angle_to_steps(f64::NAN), 0);
    }

    #[test]
    fn move_payload_layout() {
        let payload = MoveCommand::new(45.0).payload();
        assert_eq!(&payload[0..4], &[0, 0, 0, 1]);
        assert_eq!(&payload[4..8], &[0, 0, 0, 1]);
        assert_eq!(&payload[8..12], &4500i32.to_be_bytes());
        assert_eq!(&payload[12..16], &10_000u32.to_be_bytes());
        assert_eq!(&payload[16..24], &[0x00, 0x00, 0x1F, 0x40, 0x00, 0x00, 0x1F, 0x40]);
        assert_eq!(&payload[24..28], &1000u32.to_be_bytes());
        assert_eq!(&payload[28..36], &[0, 0, 0, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn negative_angles_encode_twos_complement() {
        let payload = MoveCommand::new(-1.0).payload();
        assert_eq!(&payload[8..12], &[0xFF, 0xFF, 0xFF, 0x9C]);
    }

    fn echo_ack(request: &[u8]) -> Option<Vec<u8>> {
        let body = request[..6].to_vec();
        let crc = super::super::modbus::crc16(&body);
        let mut reply = body;
        reply.extend_from_slice(&crc.to_le_bytes());
        Some(reply)
    }

    fn scripted_link(responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) -> (SerialLink, ScriptedPortHandle) {
        let (port, handle) = ScriptedPort::new(responder);
        (SerialLink::from_port(link_settings("mock", 9600), Box::new(port)), handle)
    }

    #[test]
    fn move_succeeds_on_echoed_function_code() {
        let (mut link, handle) = scripted_link(echo_ack);
        send_move(&mut link, 2, &MoveCommand::new(90.0)).unwrap();

        let written = handle.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].len(), 45);
        assert!(verify_crc(&written[0]).is_ok());
        assert_eq!(handle.discards(), 1);
    }

    #[test]
    fn short_echo_is_accepted() {
        let (mut link, _) = scripted_link(|req| Some(req[..6].to_vec()));
        assert!(send_move(&mut link, 2, &MoveCommand::new(1.0)).is_ok());
    }

    #[test]
    fn exception_reply_is_no_ack() {
        let (mut link, _) = scripted_link(|_| Some(vec![0x02, 0x90, 0x02, 0xCD, 0xC1, 0x00]));
        assert_eq!(
            send_move(&mut link, 2, &MoveCommand::new(1.0)),
            Err(MoveError::NoAck)
        );
    }

    #[test]
    fn silence_is_no_ack() {
        let (mut link, _) = scripted_link(|_| None);
        assert_eq!(
            send_move(&mut link, 2, &MoveCommand::new(1.0)),
            Err(MoveError::NoAck)
        );
    }

    #[test]
    fn corrupted_full_reply_is_protocol_error() {
        let (mut link, _) = scripted_link(|req| {
            let mut reply = echo_ack(req)?;
            reply[7] ^= 0xFF;
            Some(reply)
        });
        assert!(matches!(
            send_move(&mut link, 2, &MoveCommand::new(1.0)),
            Err(MoveError::Protocol(_))
        ));
    }

    #[test]
    fn discovery_picks_first_answering_baud() {
        let tried = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&tried);
        let opener = move |settings: &LinkSettings| -> Result<DynPort, TransportError> {
            log.lock().push(settings.baud);
            assert_eq!(settings.parity, Parity::Even);
            let answers = settings.baud == 38400;
            let (port, _) = ScriptedPort::new(move |_| answers.then(|| vec![0x02, 0x03, 0x04]));
            Ok(Box::new(port))
        };

        let (link, baud) = discover_baud(&opener, "mock", 2).unwrap();
        assert_eq!(baud, 38400);
        assert_eq!(link.baud(), 38400);
        assert_eq!(*tried.lock(), vec![9600, 19200, 38400]);
    }

    #[test]
    fn discovery_without_reply_is_no_response() {
        let opener = |_: &LinkSettings| -> Result<DynPort, TransportError> {
            Ok(Box::new(ScriptedPort::silent().0))
        };
        assert_eq!(
            discover_baud(&opener, "mock", 2).unwrap_err(),
            ConnectError::NoResponse {
                port: "mock".into(),
                attempts: 6
            }
        );
    }

    #[test]
    fn discovery_on_missing_port_reports_transport() {
        let opener = |s: &LinkSettings| -> Result<DynPort, TransportError> {
            Err(TransportError::PortUnavailable {
                port: s.port.clone(),
                reason: "not found".into(),
            })
        };
        assert!(matches!(
            discover_baud(&opener, "missing", 2),
            Err(ConnectError::Transport(TransportError::PortUnavailable { .. }))
        ));
    }

    #[test]
    fn connected_motor_tracks_acknowledged_angle() {
        let opener = |_: &LinkSettings| -> Result<DynPort, TransportError> {
            let (port, _) = ScriptedPort::new(|req: &[u8]| {
                if req[1] == 0x03 {
                    Some(vec![0x02, 0x03, 0x04, 0, 0])
                } else {
                    echo_ack(req)
                }
            });
            Ok(Box::new(port))
        };
        let mut motor = AzMotor::connect(&opener, "mock", 2).unwrap();
        assert_eq!(motor.angle(), None);
        motor.move_to(30.0).unwrap();
        assert_eq!(motor.angle(), Some(30.0));
        assert_eq!(motor.baud(), Some(9600));
    }
}
