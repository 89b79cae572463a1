//! Error taxonomy for the rig controller.
//!
//! Every failure the core can observe falls into one of five families, each
//! with its own enum so callers can decide retry policy per component:
//!
//! - **`ConnectError`**: port unavailable, no device response, wrong baud.
//!   Surfaced to the operator. Only the very first automatic spectrometer
//!   connection is retried.
//! - **`ProtocolError`** / **`MoveError`**: CRC mismatch, short or absent
//!   acknowledgement. A failed single operation; the protocol layer never
//!   retries on its own.
//! - **`MeasurementError`**: the vendor SDK returned a non-success status.
//!   Drives the tiered recovery state machine.
//! - **`ConfigurationError`**: values rejected before reaching hardware.
//! - **`RoutineParseError`**: a malformed routine line. Logged and skipped.
//!
//! [`RigError`] aggregates all of them with `#[from]` so that `?` works across
//! layers. Results cross the worker/control boundary as values, never panics.

use thiserror::Error;

/// Convenience alias for results using the rig error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

// =============================================================================
// Transport Errors
// =============================================================================

/// Failures of the byte-level serial transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The port could not be opened (missing device, permission, busy).
    #[error("Serial port '{port}' unavailable: {reason}")]
    PortUnavailable {
        /// Port identifier, e.g. `/dev/ttyUSB0` or `COM4`.
        port: String,
        /// Reason reported by the operating system.
        reason: String,
    },

    /// Read or write on an open link failed.
    #[error("Serial I/O error on '{port}': {reason}")]
    Io {
        /// Port identifier.
        port: String,
        /// Underlying I/O error text.
        reason: String,
    },

    /// The link was closed before the operation.
    #[error("Serial link '{0}' is closed")]
    Closed(String),
}

// =============================================================================
// Connection Errors
// =============================================================================

/// Failures while establishing a device connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Port could not be opened at all.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A non-serial device (vendor SDK) could not be opened.
    #[error("Device '{device}' unavailable: {reason}")]
    DeviceUnavailable {
        /// Device description.
        device: String,
        /// Reason reported by the driver.
        reason: String,
    },

    /// The port opened but no baud rate produced a reply to the discovery read.
    #[error("No response from device on '{port}' after probing {attempts} baud rates")]
    NoResponse {
        /// Port identifier.
        port: String,
        /// Number of baud rates tried.
        attempts: usize,
    },
}

// =============================================================================
// Protocol Errors
// =============================================================================

/// Frame-level integrity failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Trailing checksum does not match the recomputed one.
    #[error("CRC mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    CrcMismatch {
        /// CRC read from the frame.
        received: u16,
        /// CRC recomputed over the frame body.
        computed: u16,
    },

    /// Frame too short to contain the expected fields.
    #[error("Frame too short: {len} bytes, need at least {min}")]
    ShortFrame {
        /// Bytes received.
        len: usize,
        /// Minimum acceptable length.
        min: usize,
    },

    /// Register payload is not a whole number of registers or too long.
    #[error("Register payload of {0} bytes is not a whole number of registers (max 246 bytes)")]
    InvalidPayload(usize),

    /// Reply missing or not echoing the request function code.
    #[error("Missing or malformed acknowledgement")]
    NoAck,
}

/// Failure of a single motor move.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoveError {
    /// No reply, or the reply did not echo the write function code.
    #[error("Motor did not acknowledge the move")]
    NoAck,

    /// A complete reply arrived but failed integrity checks.
    #[error("Motor reply rejected: {0}")]
    Protocol(#[from] ProtocolError),

    /// The link failed while writing or reading.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =============================================================================
// Measurement / Configuration / Routine Errors
// =============================================================================

/// A vendor SDK call reported a non-success status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Spectrometer {operation} failed with status {status}: {message}")]
pub struct MeasurementError {
    /// SDK primitive that failed (`init`, `prepare`, `measure`, ...).
    pub operation: String,
    /// Vendor status code.
    pub status: i32,
    /// Human readable detail.
    pub message: String,
}

impl MeasurementError {
    /// Create a measurement error for an SDK operation.
    pub fn new(operation: impl Into<String>, status: i32, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }
}

/// Values rejected before they reach hardware.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// Integration time outside 1..=10000 ms.
    #[error("Integration time {0} ms outside 1-10000 ms")]
    IntegrationOutOfRange(f64),

    /// A bounded numeric field is outside its range.
    #[error("{field} = {value} outside {min}-{max}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: i64,
        /// Inclusive minimum.
        min: i64,
        /// Inclusive maximum.
        max: i64,
    },

    /// Settings failed semantic validation.
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// A routine line that could not be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {reason} ('{text}')")]
pub struct RoutineParseError {
    /// 1-based line number in the source text.
    pub line: usize,
    /// The trimmed line.
    pub text: String,
    /// Why it was skipped.
    pub reason: String,
}

// =============================================================================
// Aggregate Error
// =============================================================================

/// Primary error type for the rig controller.
#[derive(Error, Debug)]
pub enum RigError {
    /// Connection could not be established.
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    /// Serial link failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame integrity failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Motor move failed.
    #[error("Move error: {0}")]
    Move(#[from] MoveError),

    /// Vendor SDK failure.
    #[error("Measurement error: {0}")]
    Measurement(#[from] MeasurementError),

    /// Rejected configuration value.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Routine line could not be parsed.
    #[error("Routine parse error: {0}")]
    RoutineParse(#[from] RoutineParseError),

    /// Operation not permitted in the current lifecycle state.
    ///
    /// **Recovery Strategy**: wait for the state change (e.g. connection
    /// complete, stop confirmed) and retry.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// Lifecycle state at the time of the request.
        state: String,
    },

    /// File I/O failure (record sinks, snapshots).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RigError {
    /// Shorthand for [`RigError::InvalidState`].
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        RigError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}
