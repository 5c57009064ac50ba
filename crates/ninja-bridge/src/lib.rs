//! NinjaCape serial hub ⇄ MQTT bridge
//!
//! This crate connects a NinjaCape-style home automation hub, which speaks
//! newline-delimited JSON over a serial port, to an MQTT broker. Device state
//! reported by the hub is published as retained messages; commands published
//! to the broker are written back to the hub. A scheduler blinks the status
//! and eyes LEDs on the hour and keeps them dark at night.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Link** - Serial port split into a line reader and a frame sink
//! 2. **Codec** - Hub frames, colors and RF weather sensor packets
//! 3. **Pipeline** - State store, throttle cache and the single-writer command channel
//! 4. **Loops** - Serial ingest, MQTT handler and LED scheduler on one tokio runtime
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ninja_bridge::{BridgeConfigBuilder, BridgeContext, NinjaBridge, SerialLink, SystemClock};
//!
//! let config = BridgeConfigBuilder::new()
//!     .serial_port("/dev/ttyS1")
//!     .broker("localhost", 1883)
//!     .build();
//!
//! let session = MqttSession::connect(&config.mqtt).await?;
//! let (reader, writer) = SerialLink::from_config(&config.serial).open()?;
//! let ctx = BridgeContext::new(config, client_publisher(session.client()), notifier, timeseries, store);
//! let (bridge, handle) = NinjaBridge::new(ctx, Arc::new(SystemClock))?;
//! bridge.run(reader, writer, Some(session)).await?;
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port link (requires `libudev-dev` on Linux)
//!
//! # Message Flow
//!
//! ## Hub → MQTT
//!
//! 1. `HubReader` splits the serial stream into lines
//! 2. `HubFrame::parse` classifies ERROR / ACK / DEVICE
//! 3. LED colors become `R,G,B`; RF weather packets become temperature and humidity
//! 4. `StateStore` records the value
//! 5. `ThrottleCache` decides whether the value is worth re-publishing
//! 6. `StatePublisher` publishes `{input}/{id}` (retained)
//!
//! ## MQTT → Hub
//!
//! 1. `MqttHandler` receives `{output}/{id}` or `{output}/{id}/on`
//! 2. `R,G,B` payloads are normalised to hex
//! 3. `CommandChannel` writes one DEVICE frame to the hub

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Foundations
pub mod config;
pub mod error;

// Link and wire format
pub mod codec;
pub mod frame;
pub mod interface;

// Shared pipeline state
pub mod cache;
pub mod channel;
pub mod state;

// Collaborators
pub mod sinks;

// Loops
pub mod bridge;
pub mod ingest;
pub mod mqtt;
pub mod scheduler;

// Testing utilities
pub mod test_utils;

pub use config::{
    BridgeConfig, BridgeConfigBuilder, DeviceConfig, MqttConfig, NotifierConfig,
    PersistenceConfig, ScheduleConfig, SerialConfig, ThrottleConfig, TimeSeriesConfig,
};
pub use error::{BridgeError, Result};

pub use codec::{
    decode_sensor_packet, hex_to_rgb_triple, normalize_color, rgb_triple_to_hex,
    ColorConversion, SensorReading,
};
pub use frame::{DeviceUpdate, HubCommand, HubError, HubFrame};
pub use interface::HubReader;

#[cfg(feature = "serial")]
pub use interface::SerialLink;

pub use cache::{CacheStats, ThrottleCache, ThrottleKey};
pub use channel::{ChannelStats, CommandChannel, FrameSink, StreamSink};
pub use state::StateStore;

pub use sinks::{
    InfluxSink, MemoryStore, Notifier, NullNotifier, NullTimeSeries, PersistenceStore,
    PushoverNotifier, SensorSample, SqliteStore, TimeSeriesSink,
};

pub use bridge::{BridgeContext, BridgeHandle, BridgeStats, NinjaBridge};
pub use ingest::{LineOutcome, SerialIngest};
pub use mqtt::{client_publisher, MessageOutcome, MqttHandler, MqttSession, PublishCallback, StatePublisher};
pub use scheduler::{
    choose_blink_color, local_time_to_utc, Clock, LedMode, Scheduler, SchedulerHandle, SystemClock,
};

pub use test_utils::TestFixture;

pub use config::{
    ALERT_DEVICE_ID, DEFAULT_BAUD_RATE, DEFAULT_THROTTLE_WINDOW_SECS, EYES_LED_ID, HUMIDITY_ID,
    RF_RECEIVER_ID, STATUS_LED_ID, TEMPERATURE_ID,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(STATUS_LED_ID, 999);
        assert_eq!(EYES_LED_ID, 1007);
        assert_eq!(RF_RECEIVER_ID, 11);
        assert_eq!(HUMIDITY_ID, 30);
        assert_eq!(TEMPERATURE_ID, 31);
        assert_eq!(DEFAULT_BAUD_RATE, 9600);
        assert_eq!(DEFAULT_THROTTLE_WINDOW_SECS, 300);
    }
}
