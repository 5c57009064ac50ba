//! Configuration types for the NinjaCape bridge
//!
//! This module provides configuration structures for the serial link, the
//! MQTT session, well-known device ids, throttling, the LED scheduler and the
//! external sinks. Every section has sane defaults so an empty TOML file
//! yields a working bridge for a stock NinjaCape.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Default baud rate of the NinjaCape serial link
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default bound on a single serial read
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5000;

/// Longest line accepted from the hub before the buffer is discarded
pub const MAX_LINE_LENGTH: usize = 4096;

/// Status LED on the cape
pub const STATUS_LED_ID: u32 = 999;

/// Eyes LED on the cape
pub const EYES_LED_ID: u32 = 1007;

/// 433MHz RF receiver
pub const RF_RECEIVER_ID: u32 = 11;

/// Virtual device carrying decoded humidity
pub const HUMIDITY_ID: u32 = 30;

/// Virtual device carrying decoded temperature
pub const TEMPERATURE_ID: u32 = 31;

/// Device whose commands also raise a push notification
pub const ALERT_DEVICE_ID: u32 = 674;

/// Protocol number of the weather sensor on the RF receiver
pub const WEATHER_SENSOR_PROTOCOL: u32 = 5;

/// Default throttle window for noisy devices
pub const DEFAULT_THROTTLE_WINDOW_SECS: u64 = 300;

/// Color both LEDs fall back to when nothing better is known
pub const DEFAULT_LED_COLOR: &str = "0000FF";

/// Main configuration for the bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Serial link to the hub
    #[serde(default)]
    pub serial: SerialConfig,

    /// MQTT broker session and topic prefixes
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Well-known device ids
    #[serde(default)]
    pub devices: DeviceConfig,

    /// Republish throttling
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// LED scheduler
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Durable key-value store
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Push notifications
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Time-series sink for sensor readings
    #[serde(default)]
    pub timeseries: TimeSeriesConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BridgeError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Fill notifier credentials from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Fill notifier credentials from an arbitrary lookup.
    ///
    /// Values already present in the file win over the environment.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.notifier.user_key.is_none() {
            self.notifier.user_key = lookup("PUSHOVER_USER_KEY").filter(|v| !v.is_empty());
        }
        if self.notifier.api_token.is_none() {
            self.notifier.api_token = lookup("PUSHOVER_API_TOKEN").filter(|v| !v.is_empty());
        }
    }

    /// Check the configuration for values that would only fail later
    pub fn validate(&self) -> Result<()> {
        self.schedule.time_zone()?;
        self.schedule.sleep_time()?;
        self.schedule.wake_time()?;

        if self.serial.read_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "serial.read_timeout must be non-zero".to_string(),
            ));
        }
        if self.throttle.window.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "throttle.window must be non-zero".to_string(),
            ));
        }
        if self.schedule.max_blink_count == 0 {
            return Err(BridgeError::InvalidConfig(
                "schedule.max_blink_count must be at least 1".to_string(),
            ));
        }
        for (name, topic) in [
            ("mqtt.output_topic", &self.mqtt.output_topic),
            ("mqtt.input_topic", &self.mqtt.input_topic),
            ("mqtt.debug_topic", &self.mqtt.debug_topic),
        ] {
            if topic.is_empty() || topic.contains(['#', '+']) {
                return Err(BridgeError::InvalidConfig(format!(
                    "{} must be a plain topic prefix, got {:?}",
                    name, topic
                )));
            }
        }
        crate::codec::hex_to_rgb_triple(&self.schedule.default_color)
            .converted()
            .ok_or_else(|| {
                BridgeError::InvalidConfig(format!(
                    "schedule.default_color is not a hex color: {}",
                    self.schedule.default_color
                ))
            })?;
        Ok(())
    }
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Path to the serial device
    #[serde(default = "default_serial_port")]
    pub port: PathBuf,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Bound on one read so the loop can notice shutdown
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Longest accepted line
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_serial_port() -> PathBuf {
    PathBuf::from("/dev/ttyS1")
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(DEFAULT_READ_TIMEOUT_MS)
}

fn default_max_line_length() -> usize {
    MAX_LINE_LENGTH
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: default_read_timeout(),
            max_line_length: MAX_LINE_LENGTH,
        }
    }
}

/// MQTT session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_broker_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Client id presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// How long startup waits for the first ConnAck
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Prefix of command topics (subscribed as `{output_topic}/#`)
    #[serde(default = "default_output_topic")]
    pub output_topic: String,

    /// Prefix of state topics the bridge publishes
    #[serde(default = "default_input_topic")]
    pub input_topic: String,

    /// Prefix of debug topics (subscribed as `{debug_topic}/#`)
    #[serde(default = "default_debug_topic")]
    pub debug_topic: String,

    /// Capacity of the client request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "ninja2mqtt".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_output_topic() -> String {
    "hub-output".to_string()
}

fn default_input_topic() -> String {
    "hub-input".to_string()
}

fn default_debug_topic() -> String {
    "hub-debug".to_string()
}

fn default_request_capacity() -> usize {
    100
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            output_topic: default_output_topic(),
            input_topic: default_input_topic(),
            debug_topic: default_debug_topic(),
            request_capacity: default_request_capacity(),
        }
    }
}

/// Well-known device ids on the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Status LED
    pub status_led: u32,
    /// Eyes LED
    pub eyes_led: u32,
    /// RF receiver
    pub rf_receiver: u32,
    /// Published humidity id
    pub humidity: u32,
    /// Published temperature id
    pub temperature: u32,
    /// Device whose commands raise a notification
    pub alert_device: u32,
    /// RF protocol carrying weather sensor packets
    pub weather_protocol: u32,
    /// House code of the calibrated weather sensor
    pub expected_house: u32,
    /// Station of the calibrated weather sensor
    pub expected_station: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            status_led: STATUS_LED_ID,
            eyes_led: EYES_LED_ID,
            rf_receiver: RF_RECEIVER_ID,
            humidity: HUMIDITY_ID,
            temperature: TEMPERATURE_ID,
            alert_device: ALERT_DEVICE_ID,
            weather_protocol: WEATHER_SENSOR_PROTOCOL,
            expected_house: 1,
            expected_station: 1,
        }
    }
}

impl DeviceConfig {
    /// Check if an id is one of the two LEDs
    pub fn is_led(&self, device_id: u32) -> bool {
        device_id == self.status_led || device_id == self.eyes_led
    }
}

/// Republish throttling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Window during which an unchanged value is not re-published
    #[serde(with = "humantime_serde", default = "default_throttle_window")]
    pub window: Duration,

    /// Devices subject to throttling
    #[serde(default = "default_throttled_ids")]
    pub device_ids: Vec<u32>,
}

fn default_throttle_window() -> Duration {
    Duration::from_secs(DEFAULT_THROTTLE_WINDOW_SECS)
}

fn default_throttled_ids() -> Vec<u32> {
    vec![STATUS_LED_ID, EYES_LED_ID, HUMIDITY_ID, TEMPERATURE_ID]
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window: default_throttle_window(),
            device_ids: default_throttled_ids(),
        }
    }
}

/// LED scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// IANA zone the sleep/wake times and blink hours are expressed in
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// Local time the LEDs go dark (`HH:MM`)
    #[serde(default = "default_sleep_at")]
    pub sleep_at: String,

    /// Local time the LEDs come back (`HH:MM`)
    #[serde(default = "default_wake_at")]
    pub wake_at: String,

    /// How long a blink stays lit
    #[serde(with = "humantime_serde", default = "default_blink_duration")]
    pub blink_on: Duration,

    /// Gap between blinks
    #[serde(with = "humantime_serde", default = "default_blink_duration")]
    pub blink_off: Duration,

    /// Upper bound on blinks in one sequence
    #[serde(default = "default_max_blink_count")]
    pub max_blink_count: u32,

    /// Color restored when neither persisted nor live state is known
    #[serde(default = "default_led_color")]
    pub default_color: String,

    /// How often the scheduler looks at the clock
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
}

fn default_time_zone() -> String {
    "Australia/Melbourne".to_string()
}

fn default_sleep_at() -> String {
    "22:31".to_string()
}

fn default_wake_at() -> String {
    "07:31".to_string()
}

fn default_blink_duration() -> Duration {
    Duration::from_millis(200)
}

fn default_max_blink_count() -> u32 {
    24
}

fn default_led_color() -> String {
    DEFAULT_LED_COLOR.to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            time_zone: default_time_zone(),
            sleep_at: default_sleep_at(),
            wake_at: default_wake_at(),
            blink_on: default_blink_duration(),
            blink_off: default_blink_duration(),
            max_blink_count: default_max_blink_count(),
            default_color: default_led_color(),
            tick_interval: default_tick_interval(),
        }
    }
}

impl ScheduleConfig {
    /// Parsed time zone
    pub fn time_zone(&self) -> Result<Tz> {
        self.time_zone.parse::<Tz>().map_err(|e| {
            BridgeError::InvalidConfig(format!("unknown time zone {:?}: {}", self.time_zone, e))
        })
    }

    /// Parsed sleep time
    pub fn sleep_time(&self) -> Result<NaiveTime> {
        parse_clock_time("schedule.sleep_at", &self.sleep_at)
    }

    /// Parsed wake time
    pub fn wake_time(&self) -> Result<NaiveTime> {
        parse_clock_time("schedule.wake_at", &self.wake_at)
    }
}

fn parse_clock_time(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| {
        BridgeError::InvalidConfig(format!("{} must be HH:MM, got {:?}: {}", field, value, e))
    })
}

/// Durable key-value store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("ninja2mqtt.db")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Push notification configuration (Pushover)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Pushover user key
    #[serde(default)]
    pub user_key: Option<String>,

    /// Pushover application token
    #[serde(default)]
    pub api_token: Option<String>,

    /// Message endpoint
    #[serde(default = "default_pushover_url")]
    pub endpoint: String,

    /// Title used when the caller does not give one
    #[serde(default = "default_title")]
    pub default_title: String,

    /// Request timeout
    #[serde(with = "humantime_serde", default = "default_http_timeout")]
    pub timeout: Duration,
}

fn default_pushover_url() -> String {
    "https://api.pushover.net/1/messages.json".to_string()
}

fn default_title() -> String {
    "NinjaCape Alert".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            user_key: None,
            api_token: None,
            endpoint: default_pushover_url(),
            default_title: default_title(),
            timeout: default_http_timeout(),
        }
    }
}

impl NotifierConfig {
    /// Both credentials are present
    pub fn is_configured(&self) -> bool {
        self.user_key.is_some() && self.api_token.is_some()
    }
}

/// Time-series sink configuration (InfluxDB 1.x line protocol)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesConfig {
    /// Base URL, e.g. `http://localhost:8086`; unset disables the sink
    #[serde(default)]
    pub url: Option<String>,

    /// Target database
    #[serde(default = "default_database")]
    pub database: String,

    /// Measurement name
    #[serde(default = "default_measurement")]
    pub measurement: String,

    /// Request timeout
    #[serde(with = "humantime_serde", default = "default_http_timeout")]
    pub timeout: Duration,
}

fn default_database() -> String {
    "ninjacape".to_string()
}

fn default_measurement() -> String {
    "readings".to_string()
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            url: None,
            database: default_database(),
            measurement: default_measurement(),
            timeout: default_http_timeout(),
        }
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.serial.port = port.into();
        self
    }

    /// Set baud rate
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.serial.baud_rate = baud_rate;
        self
    }

    /// Set broker host and port
    pub fn broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.mqtt.host = host.into();
        self.config.mqtt.port = port;
        self
    }

    /// Set the three topic prefixes
    pub fn topics(
        mut self,
        output: impl Into<String>,
        input: impl Into<String>,
        debug: impl Into<String>,
    ) -> Self {
        self.config.mqtt.output_topic = output.into();
        self.config.mqtt.input_topic = input.into();
        self.config.mqtt.debug_topic = debug.into();
        self
    }

    /// Set the throttle window
    pub fn throttle_window(mut self, window: Duration) -> Self {
        self.config.throttle.window = window;
        self
    }

    /// Set the scheduler time zone
    pub fn time_zone(mut self, tz: impl Into<String>) -> Self {
        self.config.schedule.time_zone = tz.into();
        self
    }

    /// Set sleep and wake times (`HH:MM`)
    pub fn night_window(mut self, sleep_at: impl Into<String>, wake_at: impl Into<String>) -> Self {
        self.config.schedule.sleep_at = sleep_at.into();
        self.config.schedule.wake_at = wake_at.into();
        self
    }

    /// Set blink on/off durations
    pub fn blink_timing(mut self, on: Duration, off: Duration) -> Self {
        self.config.schedule.blink_on = on;
        self.config.schedule.blink_off = off;
        self
    }

    /// Set the persistence database path
    pub fn database(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.persistence.path = path.into();
        self
    }

    /// Set Pushover credentials
    pub fn pushover(mut self, user_key: impl Into<String>, api_token: impl Into<String>) -> Self {
        self.config.notifier.user_key = Some(user_key.into());
        self.config.notifier.api_token = Some(api_token.into());
        self
    }

    /// Set the time-series endpoint
    pub fn timeseries_url(mut self, url: impl Into<String>) -> Self {
        self.config.timeseries.url = Some(url.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.serial.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.serial.port, PathBuf::from("/dev/ttyS1"));
        assert_eq!(config.mqtt.output_topic, "hub-output");
        assert_eq!(config.throttle.window, Duration::from_secs(300));
        assert_eq!(config.throttle.device_ids, vec![999, 1007, 30, 31]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config.schedule.time_zone, "Australia/Melbourne");
        assert_eq!(config.devices.status_led, STATUS_LED_ID);
    }

    #[test]
    fn test_toml_overrides() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [serial]
            port = "/dev/ttyUSB0"
            read_timeout = "2s"

            [throttle]
            window = "1m"
            device_ids = [999]

            [schedule]
            time_zone = "Europe/London"
            blink_on = "50ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.port, PathBuf::from("/dev/ttyUSB0"));
        assert_eq!(config.serial.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.serial.read_timeout, Duration::from_secs(2));
        assert_eq!(config.throttle.window, Duration::from_secs(60));
        assert_eq!(config.throttle.device_ids, vec![999]);
        assert_eq!(config.schedule.blink_on, Duration::from_millis(50));
        assert_eq!(config.schedule.blink_off, Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfigBuilder::new()
            .serial_port("/dev/ttyACM0")
            .broker("broker.local", 1884)
            .night_window("23:00", "06:45")
            .build();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(
            config.schedule.sleep_time().unwrap(),
            NaiveTime::from_hms_opt(23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_validate_rejects_bad_zone() {
        let config = BridgeConfigBuilder::new().time_zone("Mars/Olympus").build();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_time() {
        let config = BridgeConfigBuilder::new().night_window("25:00", "07:31").build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_wildcard_topic() {
        let config = BridgeConfigBuilder::new()
            .topics("hub-output/#", "hub-input", "hub-debug")
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_env_fills_missing_credentials() {
        let mut config = BridgeConfig::default();
        config.apply_env_with(|key| match key {
            "PUSHOVER_USER_KEY" => Some("user".to_string()),
            "PUSHOVER_API_TOKEN" => Some("token".to_string()),
            _ => None,
        });
        assert!(config.notifier.is_configured());
        assert_eq!(config.notifier.user_key.as_deref(), Some("user"));
    }

    #[test]
    fn test_apply_env_keeps_file_values() {
        let mut config = BridgeConfigBuilder::new().pushover("file-user", "file-token").build();
        config.apply_env_with(|_| Some("env".to_string()));
        assert_eq!(config.notifier.user_key.as_deref(), Some("file-user"));
        assert_eq!(config.notifier.api_token.as_deref(), Some("file-token"));
    }

    #[test]
    fn test_is_led() {
        let devices = DeviceConfig::default();
        assert!(devices.is_led(999));
        assert!(devices.is_led(1007));
        assert!(!devices.is_led(11));
    }
}
