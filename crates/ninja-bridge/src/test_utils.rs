//! Test doubles for the bridge
//!
//! In-memory stand-ins for the hub link, the broker, the notifier, the
//! time-series sink and the clock, plus a [`TestFixture`] that wires a
//! complete [`BridgeContext`] out of them.
//!
//! # Example
//!
//! ```rust,ignore
//! use ninja_bridge::test_utils::TestFixture;
//!
//! #[tokio::test]
//! async fn test_led_echo() {
//!     let fixture = TestFixture::new().await;
//!     fixture.ingest().handle_line(br#"{"DEVICE":[{"G":"0","V":0,"D":999,"DA":"FF0000"}]}"#);
//!     assert_eq!(fixture.publisher.messages()[0].1, "255,0,0");
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::BridgeContext;
use crate::channel::FrameSink;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::frame::HubFrame;
use crate::ingest::SerialIngest;
use crate::mqtt::{MqttHandler, PublishCallback};
use crate::scheduler::Clock;
use crate::sinks::{MemoryStore, Notifier, SensorSample, TimeSeriesSink};

/// Hub link that records every frame written to it
///
/// Clones share the recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<String>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingSink {
    /// Create an empty recording
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Raw frames in write order
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// `(device id, value)` of every DEVICE frame written
    pub fn commands(&self) -> Vec<(u32, String)> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| match HubFrame::parse(frame.trim_end()) {
                Ok(HubFrame::Device(update)) => Some((update.device_id, update.value)),
                _ => None,
            })
            .collect()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::WriteError("recording sink set to fail".to_string()));
        }
        self.frames
            .lock()
            .push(String::from_utf8_lossy(frame).into_owned());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Broker stand-in capturing published messages
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<(String, String)>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingPublisher {
    /// Create an empty recording
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback to hand to a [`StatePublisher`](crate::mqtt::StatePublisher)
    pub fn callback(&self) -> PublishCallback {
        let messages = self.messages.clone();
        let fail = self.fail.clone();
        Arc::new(move |topic, payload| {
            if fail.load(Ordering::SeqCst) {
                return Err("broker unavailable".to_string());
            }
            messages.lock().push((topic, payload));
            Ok(())
        })
    }

    /// Make subsequent publishes fail
    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// `(topic, payload)` in publish order
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }

    /// Payloads published on one topic
    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// Notifier that records messages
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl RecordingNotifier {
    /// Create an empty recording
    pub fn new() -> Self {
        Self::default()
    }

    /// Message bodies in order
    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    /// Messages with their titles
    pub fn sent(&self) -> Vec<(String, Option<String>)> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, title: Option<&str>) {
        self.sent
            .lock()
            .push((message.to_string(), title.map(str::to_string)));
    }
}

/// Time-series sink that records samples
#[derive(Debug, Clone, Default)]
pub struct RecordingTimeSeries {
    samples: Arc<Mutex<Vec<SensorSample>>>,
}

impl RecordingTimeSeries {
    /// Create an empty recording
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples recorded so far
    pub fn samples(&self) -> Vec<SensorSample> {
        self.samples.lock().clone()
    }

    /// Wait (up to a second) until at least `count` samples arrived.
    ///
    /// Samples are written from spawned tasks, so tests poll.
    pub async fn wait_for(&self, count: usize) -> Vec<SensorSample> {
        for _ in 0..200 {
            if self.samples.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.samples()
    }
}

#[async_trait]
impl TimeSeriesSink for RecordingTimeSeries {
    async fn record(&self, sample: &SensorSample) -> Result<()> {
        self.samples.lock().push(sample.clone());
        Ok(())
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Clock stopped at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Clock stopped at an RFC 3339 instant
    pub fn from_rfc3339(text: &str) -> std::result::Result<Self, chrono::ParseError> {
        Ok(Self::new(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc)))
    }

    /// Jump to `now`
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Move forward
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Complete in-memory bridge context with every collaborator recorded
pub struct TestFixture {
    /// Context shared by the loops under test
    pub ctx: BridgeContext,
    /// Hub link, attached to `ctx.channel`
    pub sink: RecordingSink,
    /// Broker
    pub publisher: RecordingPublisher,
    /// Notifications
    pub notifier: RecordingNotifier,
    /// Sensor samples
    pub timeseries: RecordingTimeSeries,
    /// Persisted key-value pairs
    pub store: MemoryStore,
}

impl TestFixture {
    /// Fixture over the default configuration
    pub async fn new() -> Self {
        Self::with_config(BridgeConfig::default()).await
    }

    /// Fixture over a custom configuration
    pub async fn with_config(config: BridgeConfig) -> Self {
        let sink = RecordingSink::new();
        let publisher = RecordingPublisher::new();
        let notifier = RecordingNotifier::new();
        let timeseries = RecordingTimeSeries::new();
        let store = MemoryStore::new();

        let ctx = BridgeContext::new(
            config,
            publisher.callback(),
            Arc::new(notifier.clone()),
            Arc::new(timeseries.clone()),
            Arc::new(store.clone()),
        );
        ctx.channel.attach(sink.clone()).await;

        Self {
            ctx,
            sink,
            publisher,
            notifier,
            timeseries,
            store,
        }
    }

    /// MQTT handler without a scheduler
    pub fn mqtt_handler(&self) -> MqttHandler {
        MqttHandler::new(self.ctx.clone(), None)
    }

    /// Serial ingest over the fixture context
    pub fn ingest(&self) -> SerialIngest {
        SerialIngest::new(self.ctx.clone())
    }
}
