//! Dedicated device worker threads.
//!
//! Every serial device is owned by exactly one worker thread. The thread owns
//! the driver (and through it the [`SerialLink`](rig_core::serial::SerialLink)),
//! takes requests from a std channel one at a time, and reports every outcome
//! as a [`DeviceEvent`] on the controller's tokio channel. Workers never touch
//! shared state; the controller is the only writer.
//!
//! ```text
//!  controller ──WorkerHandle::send──▶ [motor thread]  ──DeviceEvent──┐
//!             ──WorkerHandle::send──▶ [filter thread] ──DeviceEvent──┤──▶ controller
//!                                     [thp poller]    ──DeviceEvent──┘
//! ```

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use rig_core::error::{ConnectError, MoveError, TransportError};
use rig_core::hardware_state::ThpReading;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::drivers::az_motor::MotorDevice;
use crate::drivers::filter_wheel::{FilterCommand, FilterDevice, FilterReport};
use crate::drivers::thp_sensor::{ThpError, ThpSource};

// =============================================================================
// Events
// =============================================================================

/// Outcome reported by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// From the motor worker.
    Motor(MotorEvent),
    /// From the filter wheel worker.
    Filter(FilterEvent),
    /// From the THP poller.
    Thp(ThpEvent),
}

/// Motor worker outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum MotorEvent {
    /// Discovery succeeded.
    Connected {
        /// Port name.
        port: String,
        /// Negotiated baud, if the device has one.
        baud: Option<u32>,
    },
    /// Discovery failed; the worker has exited.
    ConnectFailed {
        /// Port name.
        port: String,
        /// Why.
        error: ConnectError,
    },
    /// A move was acknowledged.
    Moved {
        /// Target angle.
        angle_deg: f64,
    },
    /// A move was not acknowledged.
    MoveFailed {
        /// Target angle.
        angle_deg: f64,
        /// Why.
        error: MoveError,
    },
}

/// Filter wheel worker outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterEvent {
    /// Port opened.
    Connected {
        /// Port name.
        port: String,
    },
    /// Port could not be opened; the worker has exited.
    ConnectFailed {
        /// Port name.
        port: String,
        /// Why.
        error: ConnectError,
    },
    /// A command completed.
    Report {
        /// Command sent.
        command: FilterCommand,
        /// Position after it.
        report: FilterReport,
    },
    /// A command failed.
    Failed {
        /// Command sent.
        command: FilterCommand,
        /// Error text.
        error: String,
    },
}

/// THP poller outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum ThpEvent {
    /// A fresh sample.
    Reading(ThpReading),
    /// A failed read; polling continues.
    Failed(ThpError),
}

// =============================================================================
// Handles
// =============================================================================

#[derive(Debug)]
enum WorkerMessage<R> {
    Request(R),
    Shutdown,
}

/// Controller-side handle to a worker thread.
///
/// Dropping the handle asks the worker to stop and joins it.
#[derive(Debug)]
pub struct WorkerHandle<R> {
    name: String,
    tx: mpsc::Sender<WorkerMessage<R>>,
    join: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> WorkerHandle<R> {
    fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(mpsc::Receiver<WorkerMessage<R>>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(rx))?;
        Ok(Self {
            name: name.to_string(),
            tx,
            join: Some(join),
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a request. Fails once the worker has exited.
    pub fn send(&self, request: R) -> Result<(), TransportError> {
        self.tx
            .send(WorkerMessage::Request(request))
            .map_err(|_| TransportError::Closed(self.name.clone()))
    }
}

impl<R> Drop for WorkerHandle<R> {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMessage::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

/// Requests accepted by the motor worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotorRequest {
    /// Move to an absolute angle in degrees.
    MoveTo(f64),
}

// =============================================================================
// Motor
// =============================================================================

/// Start the motor worker.
///
/// `connect` runs on the worker thread (baud discovery blocks for several
/// seconds on a silent port). With `home_on_connect` the motor is moved to
/// 0° right after a successful connect.
pub fn spawn_motor<F>(
    port: impl Into<String>,
    connect: F,
    home_on_connect: bool,
    events: UnboundedSender<DeviceEvent>,
) -> std::io::Result<WorkerHandle<MotorRequest>>
where
    F: FnOnce() -> Result<Box<dyn MotorDevice>, ConnectError> + Send + 'static,
{
    let port = port.into();
    WorkerHandle::spawn("motor-worker", move |rx| {
        let mut device = match connect() {
            Ok(device) => device,
            Err(error) => {
                warn!(port = %port, error = %error, "Motor connect failed");
                let _ = events.send(DeviceEvent::Motor(MotorEvent::ConnectFailed { port, error }));
                return;
            }
        };
        info!(port = %port, baud = ?device.baud(), "Motor connected");
        let connected = MotorEvent::Connected {
            port: port.clone(),
            baud: device.baud(),
        };
        if events.send(DeviceEvent::Motor(connected)).is_err() {
            return;
        }

        let mut execute = |MotorRequest::MoveTo(angle_deg): MotorRequest| {
            let event = match device.move_to(angle_deg) {
                Ok(()) => MotorEvent::Moved { angle_deg },
                Err(error) => MotorEvent::MoveFailed { angle_deg, error },
            };
            events.send(DeviceEvent::Motor(event)).is_ok()
        };

        if home_on_connect && !execute(MotorRequest::MoveTo(0.0)) {
            return;
        }
        while let Ok(WorkerMessage::Request(request)) = rx.recv() {
            if !execute(request) {
                break;
            }
        }
        debug!(port = %port, "Motor worker exiting");
    })
}

// =============================================================================
// Filter wheel
// =============================================================================

/// Start the filter wheel worker.
pub fn spawn_filter<F>(
    port: impl Into<String>,
    connect: F,
    events: UnboundedSender<DeviceEvent>,
) -> std::io::Result<WorkerHandle<FilterCommand>>
where
    F: FnOnce() -> Result<Box<dyn FilterDevice>, ConnectError> + Send + 'static,
{
    let port = port.into();
    WorkerHandle::spawn("filter-worker", move |rx| {
        let mut device = match connect() {
            Ok(device) => device,
            Err(error) => {
                warn!(port = %port, error = %error, "Filter wheel connect failed");
                let _ = events.send(DeviceEvent::Filter(FilterEvent::ConnectFailed { port, error }));
                return;
            }
        };
        info!(port = %port, "Filter wheel connected");
        let connected = FilterEvent::Connected { port: port.clone() };
        if events.send(DeviceEvent::Filter(connected)).is_err() {
            return;
        }

        while let Ok(WorkerMessage::Request(command)) = rx.recv() {
            let event = match device.execute(command) {
                Ok(report) => FilterEvent::Report { command, report },
                Err(e) => FilterEvent::Failed {
                    command,
                    error: e.to_string(),
                },
            };
            if events.send(DeviceEvent::Filter(event)).is_err() {
                break;
            }
        }
        debug!(port = %port, "Filter worker exiting");
    })
}

// =============================================================================
// THP poller
// =============================================================================

/// Start the THP poller.
///
/// Reads immediately, then every `interval`. Sending `()` through the handle
/// forces an extra read.
pub fn spawn_thp_poller(
    mut source: Box<dyn ThpSource>,
    interval: Duration,
    events: UnboundedSender<DeviceEvent>,
) -> std::io::Result<WorkerHandle<()>> {
    WorkerHandle::spawn("thp-poller", move |rx| loop {
        let event = match source.read() {
            Ok(reading) => ThpEvent::Reading(reading),
            Err(e) => {
                debug!(error = %e, "THP read failed");
                ThpEvent::Failed(e)
            }
        };
        if events.send(DeviceEvent::Thp(event)).is_err() {
            break;
        }
        match rx.recv_timeout(interval) {
            Ok(WorkerMessage::Request(())) | Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(WorkerMessage::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    })
}
