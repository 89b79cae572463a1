//! Serial transport for device workers.
//!
//! Every instrument on the rig sits behind its own serial link, and every link
//! is owned by exactly one worker thread. The transport is therefore blocking:
//! a read waits at most the link timeout and then returns whatever arrived.
//!
//! # Types
//!
//! - [`PortIo`]: byte stream plus input-buffer discard (real port or mock)
//! - [`DynPort`]: type-erased boxed port
//! - [`PortOpener`]: opens a [`DynPort`] for a [`LinkSettings`]
//! - [`SerialLink`]: exclusively-owned open link with framed helpers
//! - [`ScriptedPort`]: in-memory port driven by a responder closure
//!
//! # Example
//!
//! ```rust,ignore
//! use rig_core::serial::{LinkSettings, Parity, SerialLink, SystemPortOpener};
//!
//! let settings = LinkSettings::new("/dev/ttyUSB0", 9600).with_parity(Parity::Even);
//! let mut link = SerialLink::open(&SystemPortOpener, settings)?;
//! link.clear_input()?;
//! link.send(&frame)?;
//! let reply = link.receive(8)?;
//! ```

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::TransportError;

// =============================================================================
// Port Trait
// =============================================================================

/// Blocking serial byte stream.
///
/// Reads must return `ErrorKind::TimedOut` (or `WouldBlock`) once the port
/// timeout elapses with no data, the way `serialport` ports behave.
pub trait PortIo: Read + Write + Send {
    /// Discard any bytes waiting in the input buffer.
    fn discard_input(&mut self) -> io::Result<()>;
}

/// Type-erased boxed serial port.
pub type DynPort = Box<dyn PortIo>;

/// Opens ports for a worker.
///
/// Implemented for closures so tests can hand out scripted ports per baud.
pub trait PortOpener: Send + Sync {
    /// Open the port described by `settings`.
    fn open(&self, settings: &LinkSettings) -> Result<DynPort, TransportError>;
}

impl<F> PortOpener for F
where
    F: Fn(&LinkSettings) -> Result<DynPort, TransportError> + Send + Sync,
{
    fn open(&self, settings: &LinkSettings) -> Result<DynPort, TransportError> {
        self(settings)
    }
}

// =============================================================================
// Link Settings
// =============================================================================

/// Parity bit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Byte timing and framing of one physical port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    /// Port identifier (`/dev/ttyUSB0`, `COM4`).
    pub port: String,
    /// Baud rate.
    pub baud: u32,
    /// Data bits per character (5-8).
    pub data_bits: u8,
    /// Parity mode.
    pub parity: Parity,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
    /// Read timeout.
    pub timeout: Duration,
}

impl LinkSettings {
    /// 8-N-1 with a one second timeout.
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            timeout: Duration::from_secs(1),
        }
    }

    /// Override the parity mode.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Override the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// =============================================================================
// System Ports
// =============================================================================

#[cfg(feature = "serial")]
struct SystemPort(Box<dyn serialport::SerialPort>);

#[cfg(feature = "serial")]
impl Read for SystemPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

#[cfg(feature = "serial")]
impl Write for SystemPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

#[cfg(feature = "serial")]
impl PortIo for SystemPort {
    fn discard_input(&mut self) -> io::Result<()> {
        self.0
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Opens operating-system serial ports through `serialport`.
#[cfg(feature = "serial")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortOpener;

#[cfg(feature = "serial")]
impl PortOpener for SystemPortOpener {
    fn open(&self, settings: &LinkSettings) -> Result<DynPort, TransportError> {
        let data_bits = match settings.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        let stop_bits = if settings.stop_bits == 2 {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        };

        let port = serialport::new(&settings.port, settings.baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(serialport::FlowControl::None)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| TransportError::PortUnavailable {
                port: settings.port.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(SystemPort(port)))
    }
}

// =============================================================================
// Serial Link
// =============================================================================

/// An exclusively-owned open serial link.
///
/// Commands on one link are strictly sequential: one request, one reply read,
/// then the next request. The link is never shared between components.
pub struct SerialLink {
    settings: LinkSettings,
    io: Option<DynPort>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("settings", &self.settings)
            .field("open", &self.io.is_some())
            .finish()
    }
}

impl SerialLink {
    /// Open a link with the given opener.
    pub fn open(opener: &dyn PortOpener, settings: LinkSettings) -> Result<Self, TransportError> {
        let io = opener.open(&settings)?;
        Ok(Self {
            settings,
            io: Some(io),
        })
    }

    /// Wrap an already opened port.
    pub fn from_port(settings: LinkSettings, io: DynPort) -> Self {
        Self {
            settings,
            io: Some(io),
        }
    }

    /// Port identifier.
    pub fn port(&self) -> &str {
        &self.settings.port
    }

    /// Negotiated baud rate.
    pub fn baud(&self) -> u32 {
        self.settings.baud
    }

    /// Link framing and timing.
    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Whether the link still holds an open port.
    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    /// Release the port.
    pub fn close(&mut self) {
        if self.io.take().is_some() {
            trace!(port = %self.settings.port, "serial link closed");
        }
    }

    fn io_mut(&mut self) -> Result<&mut DynPort, TransportError> {
        let port = &self.settings.port;
        self.io
            .as_mut()
            .ok_or_else(|| TransportError::Closed(port.clone()))
    }

    fn io_error(&self, err: &io::Error) -> TransportError {
        TransportError::Io {
            port: self.settings.port.clone(),
            reason: err.to_string(),
        }
    }

    /// Discard stale input before a request.
    pub fn clear_input(&mut self) -> Result<(), TransportError> {
        let result = self.io_mut()?.discard_input();
        result.map_err(|e| self.io_error(&e))
    }

    /// Write the whole buffer.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!(port = %self.settings.port, len = bytes.len(), "tx");
        let io = self.io_mut()?;
        let result = io.write_all(bytes).and_then(|()| io.flush());
        result.map_err(|e| self.io_error(&e))
    }

    /// Read up to `max` bytes, stopping early when the link timeout elapses.
    ///
    /// An empty vector means nothing arrived within the timeout.
    pub fn receive(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + self.settings.timeout;
        let mut out = Vec::with_capacity(max);
        let mut chunk = [0u8; 64];

        while out.len() < max {
            let want = (max - out.len()).min(chunk.len());
            let read = self.io_mut()?.read(&mut chunk[..want]);
            match read {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(&e)),
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        trace!(port = %self.settings.port, len = out.len(), "rx");
        Ok(out)
    }

    /// Read one `\n`-terminated line; a partial line is returned on timeout.
    ///
    /// The terminator and surrounding whitespace are stripped.
    pub fn receive_line(&mut self) -> Result<String, TransportError> {
        let deadline = Instant::now() + self.settings.timeout;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            let read = self.io_mut()?.read(&mut byte);
            match read {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(&e)),
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }
}

// =============================================================================
// Scripted Port (tests and simulation)
// =============================================================================

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

struct ScriptState {
    responder: Responder,
    pending: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    discards: usize,
}

/// In-memory port whose replies come from a responder closure.
///
/// Each `write` is passed to the responder; whatever it returns becomes
/// readable. Reads with nothing pending fail with `TimedOut` immediately,
/// mimicking an idle device.
pub struct ScriptedPort {
    state: Arc<Mutex<ScriptState>>,
}

/// Inspection handle kept by the test after the port is handed to a link.
#[derive(Clone)]
pub struct ScriptedPortHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedPort {
    /// Create a port and its inspection handle.
    pub fn new<F>(responder: F) -> (Self, ScriptedPortHandle)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let state = Arc::new(Mutex::new(ScriptState {
            responder: Box::new(responder),
            pending: VecDeque::new(),
            written: Vec::new(),
            discards: 0,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            ScriptedPortHandle { state },
        )
    }

    /// A port that never answers.
    pub fn silent() -> (Self, ScriptedPortHandle) {
        Self::new(|_| None)
    }
}

impl ScriptedPortHandle {
    /// Every write seen so far, one entry per `write` call.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    /// Number of input discards requested.
    pub fn discards(&self) -> usize {
        self.state.lock().discards
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.pending.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.written.push(buf.to_vec());
        if let Some(reply) = (state.responder)(buf) {
            state.pending.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PortIo for ScriptedPort {
    fn discard_input(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.discards += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_with(responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) -> (SerialLink, ScriptedPortHandle) {
        let (port, handle) = ScriptedPort::new(responder);
        let link = SerialLink::from_port(
            LinkSettings::new("mock", 9600).with_timeout(Duration::from_millis(50)),
            Box::new(port),
        );
        (link, handle)
    }

    #[test]
    fn receive_returns_at_most_max_bytes() {
        let (mut link, _) = link_with(|_| Some(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
        link.send(&[0xAA]).unwrap();
        assert_eq!(link.receive(8).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(link.receive(8).unwrap(), vec![9, 10]);
    }

    #[test]
    fn receive_on_silent_port_is_empty() {
        let (port, _) = ScriptedPort::silent();
        let mut link = SerialLink::from_port(LinkSettings::new("mock", 9600), Box::new(port));
        link.send(b"?\r").unwrap();
        assert!(link.receive(5).unwrap().is_empty());
    }

    #[test]
    fn clear_input_drops_stale_bytes() {
        let (mut link, handle) = link_with(|_| Some(b"stale".to_vec()));
        link.send(b"x").unwrap();
        link.clear_input().unwrap();
        assert!(link.receive(5).unwrap().is_empty());
        assert_eq!(handle.discards(), 1);
    }

    #[test]
    fn receive_line_strips_terminator() {
        let (mut link, handle) = link_with(|_| Some(b" 5\r\n".to_vec()));
        link.send(b"?\r").unwrap();
        assert_eq!(link.receive_line().unwrap(), "5");
        assert_eq!(handle.written(), vec![b"?\r".to_vec()]);
    }

    #[test]
    fn closed_link_rejects_io() {
        let (mut link, _) = link_with(|_| None);
        link.close();
        assert!(!link.is_open());
        assert!(matches!(link.send(b"x"), Err(TransportError::Closed(_))));
    }

    #[test]
    fn closures_act_as_openers() {
        let opener = |settings: &LinkSettings| -> Result<DynPort, TransportError> {
            if settings.baud == 19200 {
                Ok(Box::new(ScriptedPort::silent().0))
            } else {
                Err(TransportError::PortUnavailable {
                    port: settings.port.clone(),
                    reason: "busy".into(),
                })
            }
        };
        assert!(SerialLink::open(&opener, LinkSettings::new("p", 19200)).is_ok());
        assert!(SerialLink::open(&opener, LinkSettings::new("p", 9600)).is_err());
    }
}
