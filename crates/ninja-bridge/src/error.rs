//! Error types for NinjaCape bridge operations
//!
//! Every fallible path in the bridge reports through [`BridgeError`]. Most
//! variants are recoverable: the ingest loops log them, skip the offending
//! frame or message, and carry on. Only startup failures (opening the serial
//! link, reaching the broker) are treated as fatal by the binary.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Serial/Link Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// No writer is attached to the outbound command channel
    #[error("Serial link not ready")]
    LinkNotReady,

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    /// Serial port disconnected (EOF)
    #[error("Serial port disconnected")]
    Disconnected,

    // ===== Codec/Protocol Errors =====
    /// Malformed color string, sensor packet or JSON line
    #[error("Format error: {0}")]
    Format(String),

    /// Frame longer than the line buffer allows
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Bytes buffered without a newline
        size: usize,
        /// Maximum allowed line length
        max: usize,
    },

    /// The hub sent something well-formed but unexpected
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    /// Topic does not carry a device id where one is expected
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    // ===== External Sink Errors =====
    /// Notifier, time-series or persistence backend failed
    #[error("External sink failure ({sink}): {reason}")]
    ExternalSink {
        /// Which sink failed
        sink: &'static str,
        /// Failure reason
        reason: String,
    },

    // ===== MQTT Errors =====
    /// MQTT client or connection error
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Broker did not acknowledge the connection in time
    #[error("MQTT broker not reachable after {duration_ms}ms")]
    BrokerTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Shorthand for a [`BridgeError::Format`]
    pub fn format(reason: impl Into<String>) -> Self {
        BridgeError::Format(reason.into())
    }

    /// Shorthand for a [`BridgeError::ExternalSink`]
    pub fn sink(sink: &'static str, reason: impl ToString) -> Self {
        BridgeError::ExternalSink {
            sink,
            reason: reason.to_string(),
        }
    }

    /// Check if the loop that hit this error can simply carry on
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            BridgeError::PortNotFound(_)
                | BridgeError::PortOpenFailed { .. }
                | BridgeError::Disconnected
                | BridgeError::BrokerTimeout { .. }
                | BridgeError::InvalidConfig(_)
                | BridgeError::ChannelClosed
        )
    }

    /// Check if this is a protocol error (bad data from the hub or broker)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Format(_)
                | BridgeError::FrameTooLarge { .. }
                | BridgeError::ProtocolAnomaly(_)
                | BridgeError::InvalidTopic(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::PortNotFound(_) => "PORT_NOT_FOUND",
            BridgeError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            BridgeError::LinkNotReady => "LINK_NOT_READY",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::Format(_) => "FORMAT_ERROR",
            BridgeError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            BridgeError::ProtocolAnomaly(_) => "PROTOCOL_ANOMALY",
            BridgeError::InvalidTopic(_) => "INVALID_TOPIC",
            BridgeError::ExternalSink { .. } => "EXTERNAL_SINK_FAILURE",
            BridgeError::Mqtt(_) => "MQTT_ERROR",
            BridgeError::BrokerTimeout { .. } => "BROKER_TIMEOUT",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
            BridgeError::ChannelError(_) => "CHANNEL_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Format(err.to_string())
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        BridgeError::sink("persistence", err)
    }
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        BridgeError::Mqtt(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for BridgeError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        BridgeError::Mqtt(err.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::InvalidConfig(err.to_string())
    }
}

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for BridgeError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => BridgeError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                BridgeError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BridgeError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BridgeError::LinkNotReady.error_code(), "LINK_NOT_READY");
        assert_eq!(BridgeError::format("bad").error_code(), "FORMAT_ERROR");
        assert_eq!(
            BridgeError::sink("notifier", "timeout").error_code(),
            "EXTERNAL_SINK_FAILURE"
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(BridgeError::LinkNotReady.is_recoverable());
        assert!(BridgeError::format("x").is_recoverable());
        assert!(BridgeError::ReadError("glitch".to_string()).is_recoverable());
        assert!(!BridgeError::Disconnected.is_recoverable());
        assert!(!BridgeError::BrokerTimeout { duration_ms: 5000 }.is_recoverable());
    }

    #[test]
    fn test_is_protocol_error() {
        assert!(BridgeError::format("x").is_protocol_error());
        assert!(BridgeError::ProtocolAnomaly("ack".to_string()).is_protocol_error());
        assert!(!BridgeError::LinkNotReady.is_protocol_error());
    }

    #[test]
    fn test_json_error_is_format() {
        let err: BridgeError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, BridgeError::Format(_)));
    }

    #[test]
    fn test_sink_display() {
        let err = BridgeError::sink("influx", "connection refused");
        assert!(err.to_string().contains("influx"));
        assert!(err.to_string().contains("connection refused"));
    }
}
