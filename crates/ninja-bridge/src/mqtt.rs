//! MQTT side of the bridge
//!
//! - [`StatePublisher`]: device state → broker, through the throttle cache
//! - [`MqttHandler`]: broker commands → hub, plus the debug topics
//! - [`MqttSession`]: rumqttc client and event loop
//!
//! # Topics
//!
//! ```text
//! {output}/{id}        color or value command    → DeviceSet to the hub
//! {output}/{id}/on     "true" no-op, else off    → DeviceSet(id, 000000)
//! {debug}/states       log the state store
//! {debug}/blink        manual blink, payload = count (default 12)
//! {input}/{id}[/on]    published device state (retained)
//! ```

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::BridgeContext;
use crate::cache::ThrottleCache;
use crate::codec::normalize_color;
use crate::config::MqttConfig;
use crate::error::{BridgeError, Result};
use crate::frame::HubCommand;
use crate::scheduler::SchedulerHandle;

/// Payload of the LED off command
pub const LED_OFF: &str = "000000";

/// Blink count used when the debug payload is not a number
pub const DEFAULT_DEBUG_BLINK_COUNT: u32 = 12;

/// Back-off after an event loop error before polling again
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Callback for publishing a retained message to the broker
pub type PublishCallback =
    Arc<dyn Fn(String, String) -> std::result::Result<(), String> + Send + Sync>;

/// Publish callback backed by a rumqttc client.
///
/// Messages are queued without waiting; the event loop delivers them.
pub fn client_publisher(client: AsyncClient) -> PublishCallback {
    Arc::new(move |topic, payload| {
        client
            .try_publish(topic, QoS::AtLeastOnce, true, payload.into_bytes())
            .map_err(|e| e.to_string())
    })
}

#[derive(Default)]
struct PublishCounters {
    published: AtomicU64,
    throttled: AtomicU64,
    failed: AtomicU64,
}

/// Publisher statistics
#[derive(Debug, Clone, Default)]
pub struct PublishStats {
    /// Messages handed to the broker client
    pub published: u64,
    /// Messages suppressed by the throttle cache
    pub throttled: u64,
    /// Messages the client refused
    pub failed: u64,
}

/// Publishes device state under the input prefix
#[derive(Clone)]
pub struct StatePublisher {
    callback: PublishCallback,
    throttle: ThrottleCache,
    input_topic: String,
    counters: Arc<PublishCounters>,
}

impl StatePublisher {
    /// Create a publisher for `{input_topic}/...`
    pub fn new(callback: PublishCallback, throttle: ThrottleCache, input_topic: impl Into<String>) -> Self {
        Self {
            callback,
            throttle,
            input_topic: input_topic.into(),
            counters: Arc::new(PublishCounters::default()),
        }
    }

    /// `{input}/{id}` or `{input}/{id}/{suffix}`
    pub fn device_topic(&self, device_id: u32, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}/{}/{}", self.input_topic, device_id, suffix),
            None => format!("{}/{}", self.input_topic, device_id),
        }
    }

    /// Publish state of a device; returns whether a message went out
    pub fn publish_device(&self, device_id: u32, suffix: Option<&str>, payload: &str) -> bool {
        let topic = self.device_topic(device_id, suffix);
        self.publish(device_id, &topic, payload)
    }

    /// Publish on an explicit topic, throttled by `device_id`
    pub fn publish(&self, device_id: u32, topic: &str, payload: &str) -> bool {
        let now = tokio::time::Instant::now().into_std();
        if !self.throttle.should_publish(device_id, topic, payload, now) {
            self.counters.throttled.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match (self.callback)(topic.to_string(), payload.to_string()) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                info!(topic, payload, "Published");
                true
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(topic, error = %e, "Publish failed");
                false
            }
        }
    }

    /// Get the throttle cache
    pub fn throttle(&self) -> &ThrottleCache {
        &self.throttle
    }

    /// Get publisher statistics
    pub fn stats(&self) -> PublishStats {
        PublishStats {
            published: self.counters.published.load(Ordering::Relaxed),
            throttled: self.counters.throttled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for StatePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePublisher")
            .field("input_topic", &self.input_topic)
            .field("stats", &self.stats())
            .finish()
    }
}

/// What the handler did with one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Dropped without action
    Ignored(&'static str),
    /// `/on` with "true": nothing to do
    NoOp,
    /// Command written to the hub
    Sent {
        /// Target device
        device_id: u32,
        /// Value sent
        value: String,
    },
    /// State dump logged
    StatesDumped(usize),
    /// Blink requested from the scheduler
    BlinkRequested(u32),
}

/// Handles messages arriving from the broker
#[derive(Clone)]
pub struct MqttHandler {
    ctx: BridgeContext,
    scheduler: Option<SchedulerHandle>,
}

impl MqttHandler {
    /// Create a handler; without a scheduler handle debug blinks are refused
    pub fn new(ctx: BridgeContext, scheduler: Option<SchedulerHandle>) -> Self {
        Self { ctx, scheduler }
    }

    /// Handle an incoming publish, logging and notifying on failure
    pub async fn on_publish(&self, publish: &Publish) {
        self.ctx.record_mqtt_message();
        match self
            .handle_message(&publish.topic, &publish.payload, publish.retain)
            .await
        {
            Ok(outcome) => trace!(topic = %publish.topic, ?outcome, "MQTT message handled"),
            Err(e) => {
                error!(topic = %publish.topic, error = %e, code = e.error_code(), "Error processing MQTT message");
                self.ctx
                    .notifier
                    .notify(&format!("MQTT processing error: {}", e), None);
            }
        }
    }

    /// Apply one message
    pub async fn handle_message(&self, topic: &str, payload: &[u8], retained: bool) -> Result<MessageOutcome> {
        let mqtt = &self.ctx.config.mqtt;

        if retained {
            debug!(topic, "Skipped retained message");
            return Ok(MessageOutcome::Ignored("retained"));
        }
        if topic == mqtt.output_topic {
            debug!(topic, "Root output topic ignored");
            return Ok(MessageOutcome::Ignored("root topic"));
        }

        let payload = std::str::from_utf8(payload)
            .map_err(|_| BridgeError::format(format!("payload on {} is not UTF-8", topic)))?;

        if let Some(rest) = strip_prefix_segment(topic, &mqtt.debug_topic) {
            return self.handle_debug(rest, payload);
        }
        if strip_prefix_segment(topic, &mqtt.output_topic).is_none() {
            debug!(topic, "Topic outside command prefix ignored");
            return Ok(MessageOutcome::Ignored("foreign topic"));
        }

        let parts: Vec<&str> = topic.split('/').collect();
        if parts.last() == Some(&"on") {
            let device_id = parse_device_id(topic, parts.len().checked_sub(2).map(|i| parts[i]))?;
            if payload.trim().eq_ignore_ascii_case("true") {
                return Ok(MessageOutcome::NoOp);
            }
            self.ctx
                .channel
                .send(&HubCommand::device_set(device_id, LED_OFF))
                .await?;
            return Ok(MessageOutcome::Sent {
                device_id,
                value: LED_OFF.to_string(),
            });
        }

        let device_id = parse_device_id(topic, parts.last().copied())?;
        let value = normalize_color(payload)?;
        self.ctx.state.set(device_id.to_string(), value.clone());
        self.ctx
            .channel
            .send(&HubCommand::device_set(device_id, value.clone()))
            .await?;

        if device_id == self.ctx.config.devices.alert_device {
            let message = format!("Message from device {}: {}", device_id, value);
            info!(device_id, value = %value, "Alert device commanded");
            self.ctx.notifier.notify(&message, None);
        }

        Ok(MessageOutcome::Sent { device_id, value })
    }

    fn handle_debug(&self, command: &str, payload: &str) -> Result<MessageOutcome> {
        match command {
            "states" => {
                let mut snapshot: Vec<_> = self.ctx.state.get_all().into_iter().collect();
                snapshot.sort();
                info!(count = snapshot.len(), "Current state dump requested via MQTT");
                for (key, value) in &snapshot {
                    info!("  {}: {}", key, value);
                }
                Ok(MessageOutcome::StatesDumped(snapshot.len()))
            }
            "blink" => {
                let payload = payload.trim();
                let count = if !payload.is_empty() && payload.bytes().all(|b| b.is_ascii_digit()) {
                    payload.parse().unwrap_or(DEFAULT_DEBUG_BLINK_COUNT)
                } else {
                    DEFAULT_DEBUG_BLINK_COUNT
                };
                let scheduler = self
                    .scheduler
                    .as_ref()
                    .ok_or(BridgeError::ChannelClosed)?;
                scheduler.request_blink(count)?;
                info!(count, "Manual blink requested");
                Ok(MessageOutcome::BlinkRequested(count))
            }
            other => {
                debug!(command = other, "Unknown debug topic");
                Ok(MessageOutcome::Ignored("unknown debug topic"))
            }
        }
    }
}

// `prefix/rest` → `rest`
fn strip_prefix_segment<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    topic.strip_prefix(prefix)?.strip_prefix('/')
}

fn parse_device_id(topic: &str, segment: Option<&str>) -> Result<u32> {
    segment
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| BridgeError::InvalidTopic(topic.to_string()))
}

/// Connected broker session
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    subscriptions: Vec<String>,
}

impl MqttSession {
    /// Build client options from configuration
    pub fn options(config: &MqttConfig) -> MqttOptions {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options
    }

    /// Connect and wait for the broker to acknowledge.
    ///
    /// Fails with [`BridgeError::BrokerTimeout`] or [`BridgeError::Mqtt`]
    /// if the broker cannot be reached; the caller treats that as fatal.
    pub async fn connect(config: &MqttConfig) -> Result<Self> {
        let (client, mut eventloop) = AsyncClient::new(Self::options(config), config.request_capacity);
        info!(host = %config.host, port = config.port, "Connecting to MQTT broker");

        let wait_for_ack = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => {}
                    Err(e) => return Err(BridgeError::from(e)),
                }
            }
        };
        let ack = tokio::time::timeout(config.connect_timeout, wait_for_ack)
            .await
            .map_err(|_| BridgeError::BrokerTimeout {
                duration_ms: config.connect_timeout.as_millis() as u64,
            })??;
        info!(code = ?ack.code, "Connected to MQTT broker");

        let subscriptions = vec![
            format!("{}/#", config.output_topic),
            format!("{}/#", config.debug_topic),
        ];
        for topic in &subscriptions {
            client.subscribe(topic.as_str(), QoS::AtLeastOnce).await?;
            info!(topic = %topic, "Subscribed");
        }

        Ok(Self {
            client,
            eventloop,
            subscriptions,
        })
    }

    /// Client handle for publishing
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Drive the event loop until cancelled.
    ///
    /// Connection errors are logged and the loop keeps polling, which makes
    /// rumqttc reconnect; subscriptions are re-issued on every ConnAck.
    pub async fn run(mut self, handler: MqttHandler, cancel: CancellationToken) -> Result<()> {
        info!("MQTT event loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handler.on_publish(&publish).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT reconnected");
                        // The request queue is drained by this loop, so waiting on it here could block forever
                        tokio::spawn(resubscribe(self.client.clone(), self.subscriptions.clone()));
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("MQTT broker disconnected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "MQTT connection error");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect request failed");
        }
        info!("MQTT event loop stopped");
        Ok(())
    }
}

/// Re-issue the subscriptions once the event loop has room for them
async fn resubscribe(client: AsyncClient, subscriptions: Vec<String>) {
    for topic in subscriptions {
        match client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
            Ok(()) => info!(topic = %topic, "Re-subscribed"),
            Err(e) => {
                error!(topic = %topic, error = %e, "Re-subscribe failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingPublisher, TestFixture};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, oneshot};

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    async fn read_chunk(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        buf.truncate(n);
        buf
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_device_topic() {
        let publisher = StatePublisher::new(
            RecordingPublisher::new().callback(),
            ThrottleCache::default(),
            "hub-input",
        );
        assert_eq!(publisher.device_topic(31, None), "hub-input/31");
        assert_eq!(publisher.device_topic(999, Some("on")), "hub-input/999/on");
    }

    #[test]
    fn test_publisher_throttles() {
        let recorder = RecordingPublisher::new();
        let publisher = StatePublisher::new(recorder.callback(), ThrottleCache::default(), "hub-input");

        assert!(publisher.publish_device(31, None, "21.5"));
        assert!(!publisher.publish_device(31, None, "21.5"));
        assert!(publisher.publish_device(11, None, "x"));
        assert!(publisher.publish_device(11, None, "x"));

        assert_eq!(recorder.messages().len(), 3);
        let stats = publisher.stats();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.throttled, 1);
    }

    #[test]
    fn test_publisher_counts_failures() {
        let recorder = RecordingPublisher::new();
        recorder.fail_publishes(true);
        let publisher = StatePublisher::new(recorder.callback(), ThrottleCache::default(), "hub-input");
        assert!(!publisher.publish_device(11, None, "x"));
        assert_eq!(publisher.stats().failed, 1);
    }

    #[test]
    fn test_strip_prefix_segment() {
        assert_eq!(strip_prefix_segment("hub-debug/blink", "hub-debug"), Some("blink"));
        assert_eq!(strip_prefix_segment("hub-debugger/blink", "hub-debug"), None);
        assert_eq!(strip_prefix_segment("hub-debug", "hub-debug"), None);
    }

    #[tokio::test]
    async fn test_color_command() {
        let fixture = TestFixture::new().await;
        let handler = fixture.mqtt_handler();

        let outcome = handler
            .handle_message("hub-output/999", b"255,0,0", false)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MessageOutcome::Sent {
                device_id: 999,
                value: "FF0000".to_string()
            }
        );
        assert_eq!(fixture.sink.commands(), vec![(999, "FF0000".to_string())]);
        assert_eq!(fixture.ctx.state.get("999").as_deref(), Some("FF0000"));
    }

    #[tokio::test]
    async fn test_hex_command_passes_through() {
        let fixture = TestFixture::new().await;
        let handler = fixture.mqtt_handler();
        handler
            .handle_message("hub-output/1007", b"00FF00", false)
            .await
            .unwrap();
        assert_eq!(fixture.sink.commands(), vec![(1007, "00FF00".to_string())]);
    }

    #[tokio::test]
    async fn test_on_topic() {
        let fixture = TestFixture::new().await;
        let handler = fixture.mqtt_handler();

        let outcome = handler
            .handle_message("hub-output/999/on", b"TRUE", false)
            .await
            .unwrap();
        assert_eq!(outcome, MessageOutcome::NoOp);
        assert!(fixture.sink.commands().is_empty());

        handler
            .handle_message("hub-output/999/on", b"false", false)
            .await
            .unwrap();
        assert_eq!(fixture.sink.commands(), vec![(999, "000000".to_string())]);
        // Turning off is not mirrored into state
        assert_eq!(fixture.ctx.state.get("999"), None);
    }

    #[tokio::test]
    async fn test_retained_and_root_ignored() {
        let fixture = TestFixture::new().await;
        let handler = fixture.mqtt_handler();

        assert_eq!(
            handler.handle_message("hub-output/999", b"FF0000", true).await.unwrap(),
            MessageOutcome::Ignored("retained")
        );
        assert_eq!(
            handler.handle_message("hub-output", b"FF0000", false).await.unwrap(),
            MessageOutcome::Ignored("root topic")
        );
        assert!(fixture.sink.commands().is_empty());
    }

    #[tokio::test]
    async fn test_alert_device_notifies() {
        let fixture = TestFixture::new().await;
        let handler = fixture.mqtt_handler();
        handler
            .handle_message("hub-output/674", b"1", false)
            .await
            .unwrap();
        assert_eq!(
            fixture.notifier.messages(),
            vec!["Message from device 674: 1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_bad_messages_are_errors() {
        let fixture = TestFixture::new().await;
        let handler = fixture.mqtt_handler();

        assert!(matches!(
            handler.handle_message("hub-output/led", b"FF0000", false).await,
            Err(BridgeError::InvalidTopic(_))
        ));
        assert!(matches!(
            handler.handle_message("hub-output/999", b"1,2", false).await,
            Err(BridgeError::Format(_))
        ));
        assert!(matches!(
            handler.handle_message("hub-output/999", &[0xff, 0xfe], false).await,
            Err(BridgeError::Format(_))
        ));
        assert!(fixture.sink.commands().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_link_is_error() {
        let fixture = TestFixture::new().await;
        fixture.ctx.channel.detach().await;
        let handler = fixture.mqtt_handler();
        assert!(matches!(
            handler.handle_message("hub-output/999", b"FF0000", false).await,
            Err(BridgeError::LinkNotReady)
        ));
    }

    #[tokio::test]
    async fn test_on_publish_notifies_failures() {
        let fixture = TestFixture::new().await;
        let handler = fixture.mqtt_handler();
        let publish = Publish::new("hub-output/999", QoS::AtLeastOnce, "not,a,color");
        handler.on_publish(&publish).await;
        assert_eq!(fixture.notifier.messages().len(), 1);
        assert!(fixture.notifier.messages()[0].starts_with("MQTT processing error"));
    }

    #[tokio::test]
    async fn test_debug_states() {
        let fixture = TestFixture::new().await;
        fixture.ctx.state.set("31", "21.5");
        fixture.ctx.state.set("30", "45");
        let handler = fixture.mqtt_handler();
        assert_eq!(
            handler.handle_message("hub-debug/states", b"", false).await.unwrap(),
            MessageOutcome::StatesDumped(2)
        );
    }

    #[tokio::test]
    async fn test_debug_blink_count() {
        let fixture = TestFixture::new().await;
        let (handle, mut rx) = SchedulerHandle::channel(4);
        let handler = MqttHandler::new(fixture.ctx.clone(), Some(handle));

        assert_eq!(
            handler.handle_message("hub-debug/blink", b"3", false).await.unwrap(),
            MessageOutcome::BlinkRequested(3)
        );
        assert_eq!(
            handler.handle_message("hub-debug/blink", b"soon", false).await.unwrap(),
            MessageOutcome::BlinkRequested(12)
        );
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_resubscribe_with_full_request_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (drop_tx, drop_rx) = oneshot::channel::<()>();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let broker = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            read_chunk(&mut first).await;
            first.write_all(&CONNACK).await.unwrap();
            let _ = drop_rx.await;
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            read_chunk(&mut second).await;
            second.write_all(&CONNACK).await.unwrap();
            loop {
                let chunk = read_chunk(&mut second).await;
                if chunk.is_empty() || seen_tx.send(chunk).is_err() {
                    break;
                }
            }
        });

        let mut config = MqttConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = port;
        config.request_capacity = 10;
        config.keep_alive = Duration::from_secs(60);
        config.connect_timeout = Duration::from_secs(5);

        let session = MqttSession::connect(&config).await.unwrap();
        let client = session.client();

        // Broker outage while ingest keeps publishing
        let mut queued = 0;
        while queued < 100
            && client
                .try_publish("hub-input/11", QoS::AtLeastOnce, true, b"x".to_vec())
                .is_ok()
        {
            queued += 1;
        }
        assert!(queued > 0 && queued < 100);
        drop_tx.send(()).unwrap();

        let fixture = TestFixture::new().await;
        let cancel = CancellationToken::new();
        let event_loop = tokio::spawn(session.run(fixture.mqtt_handler(), cancel.clone()));

        let resumed = tokio::time::timeout(Duration::from_secs(10), async {
            let mut received = Vec::new();
            while let Some(chunk) = seen_rx.recv().await {
                received.extend_from_slice(&chunk);
                if contains(&received, b"hub-output/#") {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(resumed, Ok(true));

        cancel.cancel();
        event_loop.await.unwrap().unwrap();
        broker.abort();
    }
}
