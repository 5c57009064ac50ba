//! Serial ingest: hub frames → state store and broker
//!
//! Each line from the hub is handled on its own; nothing a single line does
//! can stop the loop. Per DEVICE frame:
//!
//! 1. LED values are converted from hex to `R,G,B`
//! 2. RF receiver frames are checked against the calibrated weather sensor,
//!    and protocol 5 packets are decoded into temperature and humidity
//! 3. Everything else is stored, published (throttled) and, for non-LED
//!    devices, announced through the notifier

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeContext;
use crate::codec::{decode_sensor_packet, hex_to_rgb_triple, SensorReading};
use crate::error::{BridgeError, Result};
use crate::frame::{DeviceUpdate, HubFrame};
use crate::interface::HubReader;
use crate::sinks::SensorSample;

/// R,G,B value of an LED that is off
const LED_OFF_TRIPLE: &str = "0,0,0";

/// Source name of RF weather sensor samples
pub const WEATHER_SOURCE: &str = "rf-weather";

/// What handling one line amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Blank line
    Empty,
    /// Not UTF-8 or not a frame
    Rejected,
    /// Hub acknowledgement
    Ack,
    /// Hub reported errors
    HubErrors(usize),
    /// Valid JSON of no known kind
    Unknown,
    /// Weather reading published as temperature and humidity
    Weather(SensorReading),
    /// Device state published
    Device {
        /// Device id
        device_id: u32,
        /// Value as stored and published
        value: String,
    },
}

/// Reads the hub and republishes its state
#[derive(Clone)]
pub struct SerialIngest {
    ctx: BridgeContext,
}

impl SerialIngest {
    /// Create an ingest loop over a bridge context
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }

    /// Read lines until cancelled or the link goes away.
    ///
    /// Returns `Err(Disconnected)` on EOF so the caller can decide whether
    /// to shut the bridge down. Transient read errors are logged and retried.
    pub async fn run<R>(&self, mut reader: HubReader<R>, cancel: CancellationToken) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        info!(link = reader.name(), "Serial ingest started");
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_frame() => read,
            };

            match read {
                Ok(Some(line)) => {
                    self.handle_line(&line);
                }
                Ok(None) => {}
                Err(e) if !e.is_recoverable() => {
                    error!(link = reader.name(), error = %e, code = e.error_code(), "Serial link closed");
                    self.ctx.notifier.notify("Serial link closed", None);
                    return Err(e);
                }
                Err(e) => {
                    self.ctx.record_frame_rejected();
                    warn!(error = %e, code = e.error_code(), "Serial read error");
                    self.ctx
                        .notifier
                        .notify(&format!("Serial read error: {}", e), None);
                    if !e.is_protocol_error() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }
        info!("Serial ingest stopped");
        Ok(())
    }

    /// Handle one line from the hub
    pub fn handle_line(&self, raw: &[u8]) -> LineOutcome {
        let Ok(text) = std::str::from_utf8(raw) else {
            warn!(raw = ?raw, "Invalid data received");
            self.ctx.record_frame_rejected();
            self.ctx
                .notifier
                .notify(&format!("Invalid data: {}", String::from_utf8_lossy(raw)), None);
            return LineOutcome::Rejected;
        };

        let line = text.trim();
        if line.is_empty() {
            debug!("Blank line from hub");
            return LineOutcome::Empty;
        }
        self.ctx.record_frame_received();

        let frame = match HubFrame::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(line, error = %e, "Invalid data received");
                self.ctx.record_frame_rejected();
                self.ctx.notifier.notify(&format!("Invalid data: {}", line), None);
                return LineOutcome::Rejected;
            }
        };

        match frame {
            HubFrame::Error(entries) => {
                for entry in &entries {
                    error!(code = %entry.code, message = %entry.message, "Hub reported error");
                }
                LineOutcome::HubErrors(entries.len())
            }
            HubFrame::Ack => {
                info!(line, "ACK");
                LineOutcome::Ack
            }
            HubFrame::Unknown => {
                warn!(line, "Unknown format");
                self.ctx
                    .notifier
                    .notify(&format!("Unknown serial data: {}", line), None);
                LineOutcome::Unknown
            }
            HubFrame::Device(update) => self.handle_device(update, line),
        }
    }

    fn handle_device(&self, update: DeviceUpdate, line: &str) -> LineOutcome {
        let devices = &self.ctx.config.devices;
        let device_id = update.device_id;

        let value = if devices.is_led(device_id) {
            hex_to_rgb_triple(&update.value).into_string()
        } else {
            update.value.clone()
        };

        if device_id == devices.rf_receiver {
            if let Some(reading) = self.handle_rf(&update, &value, line) {
                return LineOutcome::Weather(reading);
            }
        }

        self.ctx.state.set(device_id.to_string(), value.clone());
        self.ctx.publisher.publish_device(device_id, None, &value);

        if devices.is_led(device_id) {
            let on = if value == LED_OFF_TRIPLE { "false" } else { "true" };
            self.ctx.publisher.publish_device(device_id, Some("on"), on);
            debug!(device_id, value = %value, on, "LED state published");
        } else {
            info!(device_id, value = %value, "Device state published");
            self.ctx
                .notifier
                .notify(&format!("Published: {} -> {}", device_id, value), None);
        }

        LineOutcome::Device { device_id, value }
    }

    /// Weather handling for the RF receiver; `None` falls through to the
    /// generic publish
    fn handle_rf(&self, update: &DeviceUpdate, value: &str, line: &str) -> Option<SensorReading> {
        let devices = &self.ctx.config.devices;
        let decoded = decode_sensor_packet(value);
        if let Some(anomaly) = self.rf_anomaly(update, decoded.as_ref().ok()) {
            warn!(code = anomaly.error_code(), line, "{}", anomaly);
        }

        if update.protocol != devices.weather_protocol {
            return None;
        }

        let reading = match decoded {
            Ok(reading) if reading.valid => reading,
            Ok(reading) => {
                info!(raw = value, reason = %reading.reason, "Non-temperature protocol {} data", update.protocol);
                return None;
            }
            Err(e) => {
                info!(raw = value, error = %e, "Undecodable protocol {} data", update.protocol);
                return None;
            }
        };

        debug!(
            raw = value,
            house = reading.house,
            station = reading.station,
            temperature = reading.temperature,
            humidity = reading.humidity,
            id = reading.id,
            unknown = reading.unknown,
            "Parsed sensor data"
        );

        let temperature = format!("{:.1}", reading.temperature);
        let humidity = reading.humidity.to_string();

        self.ctx.state.set(devices.temperature.to_string(), temperature.clone());
        self.ctx.publisher.publish_device(devices.temperature, None, &temperature);
        self.ctx.state.set(devices.humidity.to_string(), humidity.clone());
        self.ctx.publisher.publish_device(devices.humidity, None, &humidity);

        let sample = SensorSample {
            source_name: WEATHER_SOURCE.to_string(),
            source_id: Some(format!("{}-{}", reading.house, reading.station)),
            channel: Some(reading.station.to_string()),
            temperature: Some(reading.temperature),
            humidity: Some(f64::from(reading.humidity)),
        };
        self.ctx.record_sample(sample);

        Some(reading)
    }

    /// Frames on the RF receiver that do not look like the calibrated
    /// weather sensor
    fn rf_anomaly(&self, update: &DeviceUpdate, reading: Option<&SensorReading>) -> Option<BridgeError> {
        let devices = &self.ctx.config.devices;
        if update.protocol != devices.weather_protocol {
            return Some(BridgeError::ProtocolAnomaly(format!(
                "suspicious RF frame: unexpected protocol {}",
                update.protocol
            )));
        }
        let reading = reading?;
        if reading.house != devices.expected_house || reading.station != devices.expected_station {
            return Some(BridgeError::ProtocolAnomaly(format!(
                "suspicious RF frame: house {} station {} is not the calibrated sensor",
                reading.house, reading.station
            )));
        }
        None
    }
}
