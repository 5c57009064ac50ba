//! Outbound command channel to the hub
//!
//! The MQTT handler and the scheduler both write to the one serial port.
//! Every command goes through [`CommandChannel::send`], which holds an async
//! mutex for the write and flush of a whole frame so two writers can never
//! interleave bytes on the wire.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::frame::HubCommand;

/// Writable end of the hub link
#[async_trait]
pub trait FrameSink: Send {
    /// Write one complete frame and flush it
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Name for logging
    fn name(&self) -> &str;
}

/// [`FrameSink`] over any async writer
pub struct StreamSink<W> {
    writer: W,
    name: String,
}

impl<W> StreamSink<W> {
    /// Wrap a writer
    pub fn new(writer: W, name: impl Into<String>) -> Self {
        Self {
            writer,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for StreamSink<W> {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer
            .write_all(frame)
            .await
            .map_err(|e| BridgeError::WriteError(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| BridgeError::WriteError(format!("Flush failed: {}", e)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<W> std::fmt::Debug for StreamSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSink").field("name", &self.name).finish()
    }
}

/// Channel statistics
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// Commands written to the hub
    pub commands_sent: u64,
    /// Commands dropped (link missing or write failed)
    pub commands_dropped: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Single-writer path to the hub
///
/// Cloning shares the attached sink.
#[derive(Clone, Default)]
pub struct CommandChannel {
    sink: Arc<Mutex<Option<Box<dyn FrameSink>>>>,
    counters: Arc<Counters>,
}

impl CommandChannel {
    /// Create a channel with no link attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the writable end of the link, replacing any previous one
    pub async fn attach(&self, sink: impl FrameSink + 'static) {
        info!(link = sink.name(), "Command channel attached");
        *self.sink.lock().await = Some(Box::new(sink));
    }

    /// Detach the link; later sends fail with `LinkNotReady`
    pub async fn detach(&self) -> bool {
        let detached = self.sink.lock().await.take().is_some();
        if detached {
            info!("Command channel detached");
        }
        detached
    }

    /// Check if a link is attached
    pub async fn is_attached(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Serialize and write one command.
    ///
    /// Failures are logged here and returned; the command is not retried.
    pub async fn send(&self, command: &HubCommand) -> Result<()> {
        let frame = command.to_wire()?;

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            warn!(device_id = command.device_id(), "Serial link not ready, command dropped");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(BridgeError::LinkNotReady);
        };

        match sink.write_frame(frame.as_bytes()).await {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                debug!(link = sink.name(), frame = frame.trim_end(), "Sent to hub");
                Ok(())
            }
            Err(e) => {
                error!(link = sink.name(), error = %e, "Hub write failed, command dropped");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Get channel statistics
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            commands_sent: self.counters.sent.load(Ordering::Relaxed),
            commands_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("stats", &self.stats())
            .finish()
    }
}
