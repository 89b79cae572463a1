//! Temperature / humidity / pressure sensor.
//!
//! The sensor answers `p\r\n` with a JSON document, possibly split over
//! several lines:
//!
//! ```json
//! {"Sensors":[{"ID":"A1","Temperature":21.4,"Humidity":38.0,"Pressure":1012.6}]}
//! ```
//!
//! Lines are accumulated until the buffer parses or the read window closes.
//! Only the first sensor is reported.

use std::thread;
use std::time::{Duration, Instant};

use rig_core::error::TransportError;
use rig_core::hardware_state::ThpReading;
use rig_core::serial::{LinkSettings, PortOpener, SerialLink};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

/// Sensor baud rate.
pub const BAUD: u32 = 9600;
/// Default read window.
pub const READ_WINDOW: Duration = Duration::from_secs(1);

const REQUEST: &[u8] = b"p\r\n";
const IDLE_PAUSE: Duration = Duration::from_millis(50);

/// THP read failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThpError {
    /// Port could not be opened or used.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Nothing arrived within the read window.
    #[error("No response from THP sensor on '{0}'")]
    NoResponse(String),

    /// Text arrived but never formed a valid document.
    #[error("Malformed THP response: {0:?}")]
    Malformed(String),

    /// The document had no sensor entries.
    #[error("THP response contains no sensors")]
    NoSensors,
}

#[derive(Debug, Deserialize)]
struct ThpDocument {
    #[serde(rename = "Sensors", default)]
    sensors: Vec<SensorEntry>,
}

#[derive(Debug, Deserialize)]
struct SensorEntry {
    #[serde(rename = "ID")]
    id: Option<serde_json::Value>,
    #[serde(rename = "Temperature")]
    temperature: f64,
    #[serde(rename = "Humidity")]
    humidity: f64,
    #[serde(rename = "Pressure")]
    pressure: f64,
}

/// Decode a complete response document.
pub fn parse_response(text: &str) -> Result<ThpReading, ThpError> {
    let doc: ThpDocument =
        serde_json::from_str(text).map_err(|_| ThpError::Malformed(text.to_string()))?;
    let first = doc.sensors.into_iter().next().ok_or(ThpError::NoSensors)?;
    let sensor_id = first.id.map(|v| match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    });
    Ok(ThpReading {
        sensor_id,
        temperature_c: first.temperature,
        humidity_pct: first.humidity,
        pressure_hpa: first.pressure,
    })
}

/// Something that yields THP samples.
pub trait ThpSource: Send {
    /// Take one sample.
    fn read(&mut self) -> Result<ThpReading, ThpError>;
}

/// A THP sensor on a serial port; the port is opened for each read.
pub struct ThpSensor<O> {
    opener: O,
    port: String,
    window: Duration,
}

impl<O: PortOpener> ThpSensor<O> {
    /// Sensor on `port` with the default read window.
    pub fn new(opener: O, port: impl Into<String>) -> Self {
        Self {
            opener,
            port: port.into(),
            window: READ_WINDOW,
        }
    }

    /// Override the read window.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Request and accumulate one response on an open link.
pub fn read_document(link: &mut SerialLink, window: Duration) -> Result<ThpReading, ThpError> {
    link.clear_input()?;
    link.send(REQUEST)?;

    let started = Instant::now();
    let mut buffer = String::new();
    while started.elapsed() < window {
        let line = link.receive_line()?;
        if line.is_empty() {
            thread::sleep(IDLE_PAUSE);
            continue;
        }
        buffer.push_str(&line);
        match parse_response(&buffer) {
            Err(ThpError::Malformed(_)) => continue,
            result => return result,
        }
    }

    if buffer.is_empty() {
        Err(ThpError::NoResponse(link.port().to_string()))
    } else {
        parse_response(&buffer)
    }
}

impl<O: PortOpener> ThpSource for ThpSensor<O> {
    #[instrument(skip(self), fields(port = %self.port))]
    fn read(&mut self) -> Result<ThpReading, ThpError> {
        let settings = LinkSettings::new(self.port.clone(), BAUD).with_timeout(self.window);
        let mut link = SerialLink::open(&self.opener, settings)?;
        let result = read_document(&mut link, self.window);
        link.close();
        if let Ok(reading) = &result {
            debug!(temperature = reading.temperature_c, humidity = reading.humidity_pct, "thp sample");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::serial::{DynPort, ScriptedPort};

    #[test]
    fn parses_first_sensor() {
        let reading = parse_response(
            r#"{"Sensors":[{"ID":"A1","Temperature":21.4,"Humidity":38.0,"Pressure":1012.6},{"ID":"B2","Temperature":0,"Humidity":0,"Pressure":0}]}"#,
        )
        .unwrap();
        assert_eq!(reading.sensor_id.as_deref(), Some("A1"));
        assert_eq!(reading.temperature_c, 21.4);
        assert_eq!(reading.pressure_hpa, 1012.6);
    }

    #[test]
    fn numeric_ids_are_kept_as_text() {
        let reading =
            parse_response(r#"{"Sensors":[{"ID":7,"Temperature":1,"Humidity":2,"Pressure":3}]}"#)
                .unwrap();
        assert_eq!(reading.sensor_id.as_deref(), Some("7"));
    }

    #[test]
    fn empty_sensor_list_is_reported() {
        assert_eq!(parse_response(r#"{"Sensors":[]}"#), Err(ThpError::NoSensors));
        assert!(matches!(parse_response("{\"Sens"), Err(ThpError::Malformed(_))));
    }

    #[test]
    fn accumulates_split_document() {
        let opener = |_: &LinkSettings| -> Result<DynPort, TransportError> {
            let (port, _) = ScriptedPort::new(|req| {
                (req == REQUEST).then(|| {
                    b"{\"Sensors\":[{\"ID\":\"A1\",\r\n\"Temperature\":20.0,\"Humidity\":50.5,\"Pressure\":990.0}]}\r\n"
                        .to_vec()
                })
            });
            Ok(Box::new(port))
        };
        let mut sensor = ThpSensor::new(opener, "mock").with_window(Duration::from_millis(200));
        let reading = sensor.read().unwrap();
        assert_eq!(reading.humidity_pct, 50.5);
    }

    #[test]
    fn silent_sensor_times_out() {
        let opener = |_: &LinkSettings| -> Result<DynPort, TransportError> {
            Ok(Box::new(ScriptedPort::silent().0))
        };
        let mut sensor = ThpSensor::new(opener, "mock").with_window(Duration::from_millis(120));
        assert_eq!(sensor.read(), Err(ThpError::NoResponse("mock".into())));
    }
}
