//! Throttle cache for noisy device publishes
//!
//! Some hub devices repeat the same value every few seconds (the LEDs echo
//! every command, the weather sensor transmits in bursts). Re-publishing
//! each echo floods the broker with retained messages that change nothing.
//!
//! The ThrottleCache remembers the last payload published per
//! `(device_id, topic)` for an allow-list of devices, and suppresses a
//! publish when the payload is unchanged and the previous one is younger
//! than the window.
//!
//! # Throttle Key
//!
//! The topic is part of the key so `hub-input/999` and `hub-input/999/on`
//! are throttled independently.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::ThrottleConfig;

/// Key for throttle cache entries
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ThrottleKey {
    /// Hub device id
    pub device_id: u32,
    /// Full MQTT topic
    pub topic: String,
}

impl ThrottleKey {
    /// Create a key
    pub fn new(device_id: u32, topic: impl Into<String>) -> Self {
        Self {
            device_id,
            topic: topic.into(),
        }
    }
}

impl std::fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.device_id, self.topic)
    }
}

/// Last publish for a key
#[derive(Debug, Clone)]
struct ThrottleRecord {
    payload: String,
    sent_at: Instant,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total publishes checked
    pub total_checks: u64,
    /// Publishes suppressed as unchanged within the window
    pub throttled: u64,
    /// Publishes let through
    pub passed: u64,
    /// Publishes let through only because the window elapsed
    pub window_expirations: u64,
}

impl CacheStats {
    /// Get the throttle rate (0.0 to 1.0)
    pub fn throttle_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.throttled as f64 / self.total_checks as f64
        }
    }
}

struct Inner {
    records: HashMap<ThrottleKey, ThrottleRecord>,
    stats: CacheStats,
}

/// Per (device, topic) publish throttle
///
/// Cloning shares the underlying records.
#[derive(Clone)]
pub struct ThrottleCache {
    inner: Arc<Mutex<Inner>>,
    throttled_ids: Arc<HashSet<u32>>,
    window: Duration,
}

impl std::fmt::Debug for ThrottleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleCache")
            .field("throttled_ids", &self.throttled_ids)
            .field("window", &self.window)
            .field("len", &self.len())
            .finish()
    }
}

impl ThrottleCache {
    /// Create a cache throttling `device_ids` for `window`
    pub fn new(device_ids: impl IntoIterator<Item = u32>, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                records: HashMap::new(),
                stats: CacheStats::default(),
            })),
            throttled_ids: Arc::new(device_ids.into_iter().collect()),
            window,
        }
    }

    /// Create from throttle configuration
    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(config.device_ids.iter().copied(), config.window)
    }

    /// Check if a device is subject to throttling
    pub fn is_throttled_device(&self, device_id: u32) -> bool {
        self.throttled_ids.contains(&device_id)
    }

    /// Decide whether a publish should go out, recording it if so.
    ///
    /// Check and update happen under one lock, so two callers racing with
    /// the same payload cannot both get `true`.
    pub fn should_publish(&self, device_id: u32, topic: &str, payload: &str, now: Instant) -> bool {
        if !self.is_throttled_device(device_id) {
            return true;
        }

        let key = ThrottleKey::new(device_id, topic);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.stats.total_checks += 1;

        let mut expired = false;
        if let Some(record) = inner.records.get(&key) {
            if record.payload == payload {
                if now.saturating_duration_since(record.sent_at) < self.window {
                    inner.stats.throttled += 1;
                    debug!(key = %key, payload, "Throttled unchanged publish");
                    return false;
                }
                expired = true;
            }
        }

        inner.records.insert(
            key,
            ThrottleRecord {
                payload: payload.to_string(),
                sent_at: now,
            },
        );
        inner.stats.passed += 1;
        if expired {
            inner.stats.window_expirations += 1;
        }
        trace!(device_id, topic, payload, "Publish recorded");
        true
    }

    /// Forget every record
    pub fn clear(&self) {
        self.inner.lock().records.clear();
    }

    /// Get the number of records
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Get the configured window
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for ThrottleCache {
    fn default() -> Self {
        Self::from_config(&ThrottleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(300);

    fn cache() -> ThrottleCache {
        ThrottleCache::new([999, 1007, 30, 31], WINDOW)
    }

    #[test]
    fn test_first_publish_passes() {
        let cache = cache();
        let now = Instant::now();
        assert!(cache.should_publish(31, "hub-input/31", "21.5", now));
        assert_eq!(cache.len(), 1);

        let stats = cache.stats();
        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.throttled, 0);
    }

    #[test]
    fn test_identical_repeat_within_window_suppressed() {
        let cache = cache();
        let start = Instant::now();
        assert!(cache.should_publish(31, "hub-input/31", "21.5", start));
        assert!(!cache.should_publish(31, "hub-input/31", "21.5", start + Duration::from_secs(10)));
        assert!(!cache.should_publish(31, "hub-input/31", "21.5", start + Duration::from_secs(299)));
        assert_eq!(cache.stats().throttled, 2);
    }

    #[test]
    fn test_suppression_does_not_refresh_window() {
        let cache = cache();
        let start = Instant::now();
        assert!(cache.should_publish(30, "hub-input/30", "45", start));
        assert!(!cache.should_publish(30, "hub-input/30", "45", start + Duration::from_secs(200)));
        // Window is measured from the last successful publish
        assert!(cache.should_publish(30, "hub-input/30", "45", start + WINDOW));
    }

    #[test]
    fn test_repeat_after_window_passes() {
        let cache = cache();
        let start = Instant::now();
        assert!(cache.should_publish(999, "hub-input/999", "255,0,0", start));
        assert!(cache.should_publish(999, "hub-input/999", "255,0,0", start + Duration::from_secs(301)));
        assert_eq!(cache.stats().window_expirations, 1);
    }

    #[test]
    fn test_changed_payload_passes() {
        let cache = cache();
        let start = Instant::now();
        assert!(cache.should_publish(31, "hub-input/31", "21.5", start));
        assert!(cache.should_publish(31, "hub-input/31", "21.6", start + Duration::from_secs(1)));
        // Flip-flopping back is a change as well
        assert!(cache.should_publish(31, "hub-input/31", "21.5", start + Duration::from_secs(2)));
    }

    #[test]
    fn test_topic_is_part_of_key() {
        let cache = cache();
        let now = Instant::now();
        assert!(cache.should_publish(1007, "hub-input/1007", "true", now));
        assert!(cache.should_publish(1007, "hub-input/1007/on", "true", now));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_unlisted_device_never_throttled() {
        let cache = cache();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(cache.should_publish(11, "hub-input/11", "271402880", now));
        }
        assert!(cache.is_empty());
        assert_eq!(cache.stats().total_checks, 0);
    }

    #[test]
    fn test_clone_shares_data() {
        let cache1 = cache();
        let now = Instant::now();
        assert!(cache1.should_publish(31, "hub-input/31", "20.0", now));

        let cache2 = cache1.clone();
        assert!(!cache2.should_publish(31, "hub-input/31", "20.0", now));
        assert_eq!(cache1.len(), cache2.len());
    }

    #[test]
    fn test_concurrent_identical_publishes_pass_once() {
        let cache = cache();
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.should_publish(999, "hub-input/999", "0,0,255", now))
            })
            .collect();
        let passed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|passed| *passed)
            .count();
        assert_eq!(passed, 1);
    }

    #[test]
    fn test_from_config() {
        let config = ThrottleConfig {
            window: Duration::from_secs(60),
            device_ids: vec![42],
        };
        let cache = ThrottleCache::from_config(&config);
        assert_eq!(cache.window(), Duration::from_secs(60));
        assert!(cache.is_throttled_device(42));
        assert!(!cache.is_throttled_device(999));
    }

    #[test]
    fn test_clear() {
        let cache = cache();
        let now = Instant::now();
        cache.should_publish(31, "hub-input/31", "20.0", now);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.should_publish(31, "hub-input/31", "20.0", now));
    }
}
