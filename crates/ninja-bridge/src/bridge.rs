//! NinjaBridge - serial hub ⇄ MQTT service
//!
//! This module wires the pieces together and runs them:
//!
//! - Serial → MQTT: [`SerialIngest`] reads hub frames and publishes state
//! - MQTT → Serial: [`MqttHandler`] turns broker commands into hub commands
//! - Clock → Serial: [`Scheduler`] blinks the LEDs and handles night mode
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           NinjaBridge                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌────────────┐   ┌───────────────┐   ┌──────────────────────┐   │
//! │  │ Hub reader │──►│ SerialIngest  │──►│ StatePublisher       │──►│ broker
//! │  └────────────┘   └───────────────┘   │ (ThrottleCache)      │   │
//! │                          │            └──────────────────────┘   │
//! │                          ▼                                       │
//! │                   ┌───────────────┐   ┌──────────────────────┐   │
//! │                   │  StateStore   │◄──│ MqttHandler          │◄──│ broker
//! │                   └───────────────┘   └──────────────────────┘   │
//! │                          ▲                       │               │
//! │                   ┌───────────────┐              ▼               │
//! │                   │  Scheduler    │──►┌──────────────────────┐   │
//! │                   └───────────────┘   │ CommandChannel       │──►│ hub
//! │                                       └──────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ninja_bridge::bridge::{BridgeContext, NinjaBridge};
//!
//! let ctx = BridgeContext::new(config, client_publisher(session.client()), notifier, timeseries, store);
//! let (bridge, handle) = NinjaBridge::new(ctx, Arc::new(SystemClock))?;
//! bridge.run(reader, writer, Some(session)).await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ThrottleCache;
use crate::channel::{CommandChannel, FrameSink};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::ingest::SerialIngest;
use crate::interface::HubReader;
use crate::mqtt::{MqttHandler, MqttSession, PublishCallback, StatePublisher};
use crate::scheduler::{Clock, Scheduler, SchedulerHandle};
use crate::sinks::{Notifier, PersistenceStore, SensorSample, TimeSeriesSink};
use crate::state::StateStore;

/// How often running statistics are logged
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(300);

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Shutdown the bridge
    Shutdown,
}

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Non-blank lines read from the hub
    pub frames_received: u64,
    /// Lines that were not valid frames
    pub frames_rejected: u64,
    /// Messages delivered by the broker
    pub mqtt_messages: u64,
    /// State messages published
    pub publishes: u64,
    /// State messages suppressed by throttling
    pub publishes_throttled: u64,
    /// State messages the broker client refused
    pub publish_failures: u64,
    /// Commands written to the hub
    pub commands_sent: u64,
    /// Commands dropped
    pub commands_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
    mqtt_messages: AtomicU64,
}

/// Everything the three loops share
#[derive(Clone)]
pub struct BridgeContext {
    /// Validated configuration
    pub config: Arc<BridgeConfig>,
    /// Last-known device values
    pub state: StateStore,
    /// Throttled state publisher
    pub publisher: StatePublisher,
    /// Single writer to the hub
    pub channel: CommandChannel,
    /// Push notifications
    pub notifier: Arc<dyn Notifier>,
    /// Sensor sample sink
    pub timeseries: Arc<dyn TimeSeriesSink>,
    /// Durable key-value pairs
    pub persistence: Arc<dyn PersistenceStore>,
    counters: Arc<Counters>,
}

impl BridgeContext {
    /// Build a context; the channel starts without a link attached
    pub fn new(
        config: BridgeConfig,
        publish: PublishCallback,
        notifier: Arc<dyn Notifier>,
        timeseries: Arc<dyn TimeSeriesSink>,
        persistence: Arc<dyn PersistenceStore>,
    ) -> Self {
        let throttle = ThrottleCache::from_config(&config.throttle);
        let publisher = StatePublisher::new(publish, throttle, config.mqtt.input_topic.clone());
        Self {
            config: Arc::new(config),
            state: StateStore::new(),
            publisher,
            channel: CommandChannel::new(),
            notifier,
            timeseries,
            persistence,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Count a line read from the hub
    pub fn record_frame_received(&self) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a line that was not a frame
    pub fn record_frame_rejected(&self) {
        self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a broker delivery
    pub fn record_mqtt_message(&self) {
        self.counters.mqtt_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Hand a sample to the time-series sink without waiting for it
    pub fn record_sample(&self, sample: SensorSample) {
        let sink = self.timeseries.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = sink.record(&sample).await {
                        warn!(source = %sample.source_name, error = %e, "Time-series write failed");
                    }
                });
            }
            Err(_) => warn!("No async runtime, sample dropped"),
        }
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> BridgeStats {
        let publish = self.publisher.stats();
        let channel = self.channel.stats();
        BridgeStats {
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.counters.frames_rejected.load(Ordering::Relaxed),
            mqtt_messages: self.counters.mqtt_messages.load(Ordering::Relaxed),
            publishes: publish.published,
            publishes_throttled: publish.throttled,
            publish_failures: publish.failed,
            commands_sent: channel.commands_sent,
            commands_dropped: channel.commands_dropped,
        }
    }
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("states", &self.state.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Handle for controlling the NinjaBridge
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
    scheduler: SchedulerHandle,
    cancel: CancellationToken,
}

impl BridgeHandle {
    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Queue a manual blink
    pub fn blink(&self, count: u32) -> Result<()> {
        self.scheduler.request_blink(count)
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }

    /// Token cancelled when the bridge stops
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Main bridge service connecting the hub to the broker
pub struct NinjaBridge {
    ctx: BridgeContext,
    scheduler: Scheduler,
    command_rx: mpsc::Receiver<BridgeCommand>,
    cancel: CancellationToken,
}

impl NinjaBridge {
    /// Create a bridge over a context and a clock
    pub fn new(ctx: BridgeContext, clock: Arc<dyn Clock>) -> Result<(Self, BridgeHandle)> {
        let scheduler = Scheduler::new(ctx.clone(), clock)?;
        let (command_tx, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let handle = BridgeHandle {
            command_tx,
            scheduler: scheduler.handle(),
            cancel: cancel.clone(),
        };
        let bridge = Self {
            ctx,
            scheduler,
            command_rx,
            cancel,
        };
        Ok((bridge, handle))
    }

    /// Shared context
    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    /// Run the bridge service
    ///
    /// Attaches `writer` as the hub link, then runs serial ingest, the MQTT
    /// session (when given) and the scheduler until shutdown is requested or
    /// the serial link closes. A closed link is returned as an error.
    pub async fn run<R>(
        mut self,
        reader: HubReader<R>,
        writer: impl FrameSink + 'static,
        mqtt: Option<MqttSession>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        info!("Starting NinjaCape bridge");
        self.ctx.channel.attach(writer).await;

        let cancel = self.cancel.clone();
        let scheduler_handle = self.scheduler.handle();

        let scheduler_task = tokio::spawn(self.scheduler.run(cancel.child_token()));

        let mqtt_task = mqtt.map(|session| {
            let handler = MqttHandler::new(self.ctx.clone(), Some(scheduler_handle));
            tokio::spawn(session.run(handler, cancel.child_token()))
        });

        let ingest = SerialIngest::new(self.ctx.clone());
        let ingest_cancel = cancel.child_token();
        let mut ingest_task = tokio::spawn(async move { ingest.run(reader, ingest_cancel).await });

        let mut stats_timer = tokio::time::interval(STATS_LOG_INTERVAL);
        let mut outcome = Ok(());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Bridge cancelled");
                    break;
                }

                result = &mut ingest_task => {
                    outcome = match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => {
                            error!(error = %e, "Serial ingest stopped");
                            Err(e)
                        }
                        Err(e) => Err(BridgeError::ChannelError(format!("ingest task failed: {}", e))),
                    };
                    break;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        BridgeCommand::GetStats(tx) => {
                            let _ = tx.send(self.ctx.stats());
                        }
                        BridgeCommand::Shutdown => {
                            info!("Bridge shutdown requested");
                            break;
                        }
                    }
                }

                _ = stats_timer.tick() => {
                    let stats = self.ctx.stats();
                    debug!(
                        frames = stats.frames_received,
                        rejected = stats.frames_rejected,
                        published = stats.publishes,
                        throttled = stats.publishes_throttled,
                        commands = stats.commands_sent,
                        dropped = stats.commands_dropped,
                        "Bridge stats"
                    );
                }
            }
        }

        cancel.cancel();
        if !ingest_task.is_finished() {
            if let Err(e) = ingest_task.await {
                warn!(error = %e, "Ingest task ended abnormally");
            }
        }
        if let Err(e) = scheduler_task.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
        if let Some(task) = mqtt_task {
            if let Err(e) = task.await {
                warn!(error = %e, "MQTT task ended abnormally");
            }
        }
        self.ctx.channel.detach().await;

        info!("NinjaCape bridge stopped");
        outcome
    }
}
