//! External collaborators
//!
//! Narrow traits for the pieces of the outside world the bridge talks to,
//! with the production implementation of each:
//!
//! - [`notifier`]: push notifications (Pushover)
//! - [`timeseries`]: sensor samples (InfluxDB 1.x)
//! - [`persist`]: durable key-value pairs (SQLite)
//!
//! Failures in any of them are logged and swallowed by the callers; a dead
//! notification service must never stop LED traffic.

pub mod notifier;
pub mod persist;
pub mod timeseries;

pub use notifier::{NullNotifier, Notifier, PushoverNotifier};
pub use persist::{MemoryStore, PersistenceStore, SqliteStore};
pub use timeseries::{InfluxSink, NullTimeSeries, SensorSample, TimeSeriesSink};
