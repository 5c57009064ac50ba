//! Serial port link to the NinjaCape
//!
//! Opens the UART with tokio-serial and splits it so the ingest loop owns
//! the read half while the command channel owns the write half.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use crate::channel::StreamSink;
use crate::config::{SerialConfig, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS, MAX_LINE_LENGTH};
use crate::error::{BridgeError, Result};
use crate::interface::HubReader;

/// Serial port parameters for the hub
#[derive(Debug, Clone)]
pub struct SerialLink {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Bound on one read
    read_timeout: Duration,

    /// Longest accepted line
    max_line_length: usize,
}

impl SerialLink {
    /// Create a link description for a port
    pub fn new(port: impl AsRef<Path>) -> Self {
        Self {
            port_path: port.as_ref().to_path_buf(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            max_line_length: MAX_LINE_LENGTH,
        }
    }

    /// Create from serial configuration
    pub fn from_config(config: &SerialConfig) -> Self {
        Self {
            port_path: config.port.clone(),
            baud_rate: config.baud_rate,
            read_timeout: config.read_timeout,
            max_line_length: config.max_line_length,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Name used in logs
    pub fn name(&self) -> String {
        format!("serial:{}", self.port_path.display())
    }

    /// Open the port and split it into a line reader and a frame sink
    pub fn open(
        &self,
    ) -> Result<(
        HubReader<ReadHalf<SerialStream>>,
        StreamSink<WriteHalf<SerialStream>>,
    )> {
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Opening serial port");

        if !self.port_path.exists() {
            return Err(BridgeError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .timeout(self.read_timeout)
            .open_native_async()
            .map_err(|e| BridgeError::PortOpenFailed {
                port: self.port_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = HubReader::new(read_half, self.name())
            .with_timeout(self.read_timeout)
            .with_max_line_length(self.max_line_length);
        let sink = StreamSink::new(write_half, self.name());

        info!(port = %self.port_path.display(), "Serial port opened");
        Ok((reader, sink))
    }
}
