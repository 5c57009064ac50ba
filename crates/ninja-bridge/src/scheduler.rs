//! LED scheduler
//!
//! One task owns the clock and every timed LED effect:
//!
//! - daily night mode: LEDs off at `sleep_at`, restored at `wake_at`
//! - hourly blink at minute 0 (count = local hour, 0 → 12)
//! - half-hour beep at minute 30 (single flash)
//! - manual blinks requested over MQTT through [`SchedulerHandle`]
//!
//! Blinks and beeps are skipped while sleeping. The night-mode flag and the
//! pre-sleep LED colors are kept in the [`PersistenceStore`] so a restart
//! resumes the right state.
//!
//! [`PersistenceStore`]: crate::sinks::PersistenceStore

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use rand::seq::SliceRandom;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::BridgeContext;
use crate::codec::normalize_color;
use crate::error::{BridgeError, Result};
use crate::frame::HubCommand;
use crate::mqtt::LED_OFF;

/// Persisted night-mode flag
pub const SLEEP_KEY: &str = "LEDSLEEP";

/// Times the startup command set is written to the hub
const STARTUP_SENDS: usize = 2;

/// Colors a blink may use
pub const BLINK_PALETTE: [&str; 7] = [
    "FF0000", "00FF00", "0000FF", "FFFF00", "00FFFF", "FF00FF", "FFFFFF",
];

/// Persisted pre-sleep color of an LED
pub fn color_key(device_id: u32) -> String {
    format!("LEDCOLOR_{}", device_id)
}

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Night-mode state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    /// LEDs show their colors, animations run
    Awake,
    /// LEDs dark, animations suppressed
    Sleeping,
}

impl LedMode {
    /// Persisted representation
    pub fn as_str(&self) -> &'static str {
        match self {
            LedMode::Awake => "awake",
            LedMode::Sleeping => "sleeping",
        }
    }

    /// Parse the persisted representation; anything unknown is awake
    pub fn from_persisted(value: &str) -> Self {
        if value.eq_ignore_ascii_case("sleeping") || value.eq_ignore_ascii_case("true") {
            LedMode::Sleeping
        } else {
            LedMode::Awake
        }
    }
}

/// Requests accepted by the scheduler task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Blink `count` times using the current colors as baseline
    Blink {
        /// Number of flashes
        count: u32,
    },
}

/// Handle for sending requests to the scheduler task
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Create a handle and the receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SchedulerCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a manual blink without waiting for it to run
    pub fn request_blink(&self, count: u32) -> Result<()> {
        self.tx
            .try_send(SchedulerCommand::Blink { count })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    BridgeError::ChannelError("scheduler busy, blink dropped".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => BridgeError::ChannelClosed,
            })
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// LEDs turned off for the night
    Sleep,
    /// LEDs restored in the morning
    Wake,
    /// Hourly blink with this count
    HourlyBlink(u32),
    /// Half-hour single flash
    HalfHourBeep,
    /// Animation suppressed by night mode
    SkippedSleeping,
}

/// Pick a blink color not currently shown by either LED.
///
/// Falls back to the full palette when every color is in use.
pub fn choose_blink_color(status_before: &str, eyes_before: &str) -> String {
    choose_blink_color_from(&mut rand::thread_rng(), &BLINK_PALETTE, &[status_before, eyes_before])
}

/// [`choose_blink_color`] over an arbitrary palette and generator
pub fn choose_blink_color_from<R: Rng + ?Sized>(rng: &mut R, palette: &[&str], in_use: &[&str]) -> String {
    let available: Vec<&str> = palette
        .iter()
        .copied()
        .filter(|color| !in_use.iter().any(|used| used.eq_ignore_ascii_case(color)))
        .collect();

    let pool = if available.is_empty() { palette } else { available.as_slice() };
    pool.choose(rng)
        .map(|color| color.to_string())
        .unwrap_or_else(|| LED_OFF.to_string())
}

/// Instant a local wall-clock time on `date` falls on, in UTC.
///
/// `None` for times skipped by a daylight-saving jump; the earlier instant
/// for times that occur twice.
pub fn local_time_to_utc(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

fn minute_index(instant: DateTime<Utc>) -> i64 {
    instant.timestamp().div_euclid(60)
}

/// Time-driven LED effects
pub struct Scheduler {
    ctx: BridgeContext,
    clock: Arc<dyn Clock>,
    tz: Tz,
    sleep_at: NaiveTime,
    wake_at: NaiveTime,
    blink_on: Duration,
    blink_off: Duration,
    max_blink_count: u32,
    default_color: String,
    tick_interval: Duration,
    mode: LedMode,
    last_minute: Option<i64>,
    handle: SchedulerHandle,
    commands: mpsc::Receiver<SchedulerCommand>,
}

impl Scheduler {
    /// Create a scheduler from the context's schedule configuration
    pub fn new(ctx: BridgeContext, clock: Arc<dyn Clock>) -> Result<Self> {
        let schedule = &ctx.config.schedule;
        let tz = schedule.time_zone()?;
        let sleep_at = schedule.sleep_time()?;
        let wake_at = schedule.wake_time()?;
        let (handle, commands) = SchedulerHandle::channel(16);

        Ok(Self {
            tz,
            sleep_at,
            wake_at,
            blink_on: schedule.blink_on,
            blink_off: schedule.blink_off,
            max_blink_count: schedule.max_blink_count.max(1),
            default_color: schedule.default_color.to_uppercase(),
            tick_interval: schedule.tick_interval,
            mode: LedMode::Awake,
            last_minute: None,
            handle,
            commands,
            clock,
            ctx,
        })
    }

    /// Handle for queueing manual blinks
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Current night-mode state
    pub fn mode(&self) -> LedMode {
        self.mode
    }

    /// Check if a local time lies inside the night window
    pub fn in_night_window(&self, local: NaiveTime) -> bool {
        if self.sleep_at <= self.wake_at {
            local >= self.sleep_at && local < self.wake_at
        } else {
            local >= self.sleep_at || local < self.wake_at
        }
    }

    /// Run until cancelled.
    ///
    /// A panic inside startup, a tick or a manual blink is logged and the
    /// loop carries on with the next event.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        if AssertUnwindSafe(self.startup()).catch_unwind().await.is_err() {
            error!("Scheduler startup panicked");
        }

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tz = %self.tz, sleep_at = %self.sleep_at, wake_at = %self.wake_at, "Scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = self.commands.recv() => match command {
                    SchedulerCommand::Blink { count } => {
                        if AssertUnwindSafe(self.manual_blink(count)).catch_unwind().await.is_err() {
                            error!(count, "Manual blink panicked");
                        }
                    }
                },
                _ = interval.tick() => {
                    let now = self.clock.now();
                    if AssertUnwindSafe(self.on_tick(now)).catch_unwind().await.is_err() {
                        error!(now = %now, "Scheduler tick panicked");
                    }
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Re-assert the persisted night-mode state.
    ///
    /// Sleeping inside the night window re-sends off; anything else wakes.
    /// The resulting commands go out twice in case the hub missed the first.
    pub async fn startup(&mut self) -> Vec<HubCommand> {
        let now = self.clock.now();
        self.last_minute = Some(minute_index(now));
        self.mode = self.load_mode().await;

        let local = now.with_timezone(&self.tz).time();
        let commands = if self.mode == LedMode::Sleeping && self.in_night_window(local) {
            info!("Resuming night mode");
            self.off_commands()
        } else {
            self.wake_commands().await
        };

        for _ in 0..STARTUP_SENDS {
            for command in &commands {
                self.send(command).await;
            }
        }
        debug!(count = commands.len(), "Startup LED state re-asserted");
        commands
    }

    /// Handle a tick, at most once per wall-clock minute
    pub async fn on_tick(&mut self, now: DateTime<Utc>) -> Vec<TickAction> {
        let minute = minute_index(now);
        if self.last_minute == Some(minute) {
            return Vec::new();
        }
        self.last_minute = Some(minute);
        self.tick(now).await
    }

    /// Run everything due in the minute containing `now`
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<TickAction> {
        let minute = minute_index(now);
        let local = now.with_timezone(&self.tz);
        let date = local.date_naive();
        let mut actions = Vec::new();
        trace!(local = %local, "Scheduler tick");

        if local_time_to_utc(self.tz, date, self.sleep_at).map(minute_index) == Some(minute) {
            self.turn_leds_off().await;
            actions.push(TickAction::Sleep);
        }
        if local_time_to_utc(self.tz, date, self.wake_at).map(minute_index) == Some(minute) {
            self.turn_leds_on().await;
            actions.push(TickAction::Wake);
        }

        let due = match local.minute() {
            0 => Some(TickAction::HourlyBlink(match local.hour() {
                0 => 12,
                hour => hour,
            })),
            30 => Some(TickAction::HalfHourBeep),
            _ => None,
        };

        if let Some(action) = due {
            if self.mode == LedMode::Sleeping {
                debug!(?action, "Night mode, animation skipped");
                actions.push(TickAction::SkippedSleeping);
            } else {
                let count = match action {
                    TickAction::HourlyBlink(count) => count,
                    _ => 1,
                };
                info!(count, "Scheduled blink");
                self.blink_from_live(count).await;
                actions.push(action);
            }
        }

        actions
    }

    /// Enter night mode: snapshot colors, persist, switch both LEDs off
    pub async fn turn_leds_off(&mut self) {
        let current = self.load_mode().await;
        if current == LedMode::Awake {
            for device_id in self.led_ids() {
                if let Some(color) = self.live_color(device_id) {
                    self.persist_set(&color_key(device_id), &color).await;
                }
            }
        }
        self.persist_set(SLEEP_KEY, LedMode::Sleeping.as_str()).await;
        self.mode = LedMode::Sleeping;
        info!("LEDs off for the night");

        for command in self.off_commands() {
            self.send(&command).await;
        }
    }

    /// Leave night mode: restore persisted (else live, else default) colors.
    ///
    /// Returns the restore commands that were sent.
    pub async fn turn_leds_on(&mut self) -> Vec<HubCommand> {
        let commands = self.wake_commands().await;
        for command in &commands {
            self.send(command).await;
        }
        info!("LEDs restored");
        commands
    }

    // Persist Awake and resolve the restore colors, dropping the persisted ones
    async fn wake_commands(&mut self) -> Vec<HubCommand> {
        self.persist_set(SLEEP_KEY, LedMode::Awake.as_str()).await;
        self.mode = LedMode::Awake;

        let mut commands = Vec::with_capacity(2);
        for device_id in self.led_ids() {
            let key = color_key(device_id);
            let persisted = match self.ctx.persistence.get(&key).await {
                Ok(value) => value.and_then(|v| normalize_color(&v).ok()),
                Err(e) => {
                    warn!(key = %key, error = %e, "Could not read persisted color");
                    None
                }
            };
            let color = persisted
                .or_else(|| self.live_color(device_id))
                .unwrap_or_else(|| self.default_color.clone());

            commands.push(HubCommand::device_set(device_id, color));

            if let Err(e) = self.ctx.persistence.delete(&key).await {
                warn!(key = %key, error = %e, "Could not clear persisted color");
            }
        }
        commands
    }

    /// Manual blink; runs even in night mode
    pub async fn manual_blink(&mut self, count: u32) {
        info!(count, "Manual blink");
        self.blink_from_live(count).await;
    }

    async fn blink_from_live(&mut self, count: u32) {
        let status_before = self.baseline_color(self.ctx.config.devices.status_led);
        let eyes_before = self.baseline_color(self.ctx.config.devices.eyes_led);
        let color = choose_blink_color(&status_before, &eyes_before);
        self.blink(count, &color, &status_before, &eyes_before).await;
    }

    /// Flash both LEDs `count` times then restore the given colors
    pub async fn blink(&mut self, count: u32, color: &str, status_before: &str, eyes_before: &str) {
        let count = count.min(self.max_blink_count);
        let [status_led, eyes_led] = self.led_ids();
        debug!(count, color, "Blink sequence");

        for _ in 0..count {
            self.send(&HubCommand::device_set(status_led, color)).await;
            self.send(&HubCommand::device_set(eyes_led, color)).await;
            tokio::time::sleep(self.blink_on).await;
            self.send(&HubCommand::device_set(status_led, LED_OFF)).await;
            self.send(&HubCommand::device_set(eyes_led, LED_OFF)).await;
            tokio::time::sleep(self.blink_off).await;
        }

        self.send(&HubCommand::device_set(status_led, status_before)).await;
        self.send(&HubCommand::device_set(eyes_led, eyes_before)).await;
    }

    fn led_ids(&self) -> [u32; 2] {
        let devices = &self.ctx.config.devices;
        [devices.status_led, devices.eyes_led]
    }

    fn off_commands(&self) -> Vec<HubCommand> {
        self.led_ids()
            .into_iter()
            .map(|id| HubCommand::device_set(id, LED_OFF))
            .collect()
    }

    // Live state holds either hex (from commands) or R,G,B (from the hub)
    fn live_color(&self, device_id: u32) -> Option<String> {
        let value = self.ctx.state.get(&device_id.to_string())?;
        normalize_color(&value).ok()
    }

    fn baseline_color(&self, device_id: u32) -> String {
        self.live_color(device_id)
            .unwrap_or_else(|| self.default_color.clone())
    }

    async fn load_mode(&self) -> LedMode {
        match self.ctx.persistence.get(SLEEP_KEY).await {
            Ok(Some(value)) => LedMode::from_persisted(&value),
            Ok(None) => LedMode::Awake,
            Err(e) => {
                warn!(error = %e, "Could not read night mode, using in-memory state");
                self.mode
            }
        }
    }

    async fn persist_set(&self, key: &str, value: &str) {
        if let Err(e) = self.ctx.persistence.set(key, value).await {
            warn!(key, value, error = %e, "Could not persist");
        }
    }

    async fn send(&self, command: &HubCommand) {
        if let Err(e) = self.ctx.channel.send(command).await {
            debug!(device_id = command.device_id(), error = %e, "Scheduler command not delivered");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tz", &self.tz)
            .field("sleep_at", &self.sleep_at)
            .field("wake_at", &self.wake_at)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::{MemoryStore, PersistenceStore};
    use crate::test_utils::{ManualClock, TestFixture};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const TZ: Tz = chrono_tz::Australia::Melbourne;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        local_time_to_utc(TZ, date, NaiveTime::from_hms_opt(hour, minute, 0).unwrap()).unwrap()
    }

    async fn scheduler_at(fixture: &TestFixture, hour: u32, minute: u32) -> (Scheduler, ManualClock) {
        let clock = ManualClock::new(at(hour, minute));
        let scheduler = Scheduler::new(fixture.ctx.clone(), Arc::new(clock.clone())).unwrap();
        (scheduler, clock)
    }

    #[test]
    fn test_choose_blink_color_avoids_inputs() {
        for _ in 0..200 {
            let color = choose_blink_color("FF0000", "00FF00");
            assert_ne!(color, "FF0000");
            assert_ne!(color, "00FF00");
            assert!(BLINK_PALETTE.contains(&color.as_str()));
        }
    }

    #[test]
    fn test_choose_blink_color_fallback() {
        let mut rng = StdRng::seed_from_u64(7);
        let color = choose_blink_color_from(&mut rng, &["FF0000", "00FF00"], &["FF0000", "00ff00"]);
        assert!(color == "FF0000" || color == "00FF00");
    }

    #[test]
    fn test_local_time_to_utc() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        // AEDT, UTC+11
        let utc = local_time_to_utc(TZ, date, NaiveTime::from_hms_opt(22, 31, 0).unwrap()).unwrap();
        assert_eq!(utc.to_rfc3339(), "2026-01-15T11:31:00+00:00");

        // Clocks jump from 02:00 to 03:00 on 2026-10-04
        let gap = NaiveDate::from_ymd_opt(2026, 10, 4).unwrap();
        assert!(local_time_to_utc(TZ, gap, NaiveTime::from_hms_opt(2, 30, 0).unwrap()).is_none());
    }

    #[test]
    fn test_led_mode_persisted_form() {
        assert_eq!(LedMode::from_persisted("sleeping"), LedMode::Sleeping);
        assert_eq!(LedMode::from_persisted("True"), LedMode::Sleeping);
        assert_eq!(LedMode::from_persisted("awake"), LedMode::Awake);
        assert_eq!(LedMode::from_persisted(""), LedMode::Awake);
    }

    #[tokio::test]
    async fn test_night_window() {
        let fixture = TestFixture::new().await;
        let (scheduler, _) = scheduler_at(&fixture, 12, 0).await;
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(scheduler.in_night_window(t(22, 31)));
        assert!(scheduler.in_night_window(t(3, 0)));
        assert!(!scheduler.in_night_window(t(7, 31)));
        assert!(!scheduler.in_night_window(t(12, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hourly_blink() {
        let fixture = TestFixture::new().await;
        fixture.ctx.state.set("999", "FF0000");
        fixture.ctx.state.set("1007", "0,255,0");
        let (mut scheduler, _) = scheduler_at(&fixture, 3, 0).await;

        let actions = scheduler.tick(at(3, 0)).await;
        assert_eq!(actions, vec![TickAction::HourlyBlink(3)]);

        let commands = fixture.sink.commands();
        // 3 x (on, on, off, off) + restore
        assert_eq!(commands.len(), 3 * 4 + 2);
        let blink_color = commands[0].1.clone();
        assert_ne!(blink_color, "FF0000");
        assert_ne!(blink_color, "00FF00");
        assert_eq!(commands[2], (999, "000000".to_string()));
        assert_eq!(commands[12], (999, "FF0000".to_string()));
        assert_eq!(commands[13], (1007, "00FF00".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_midnight_blinks_twelve() {
        let fixture = TestFixture::new().await;
        let (mut scheduler, _) = scheduler_at(&fixture, 0, 0).await;
        // Midnight falls inside the night window but the flag decides
        assert_eq!(scheduler.tick(at(0, 0)).await, vec![TickAction::HourlyBlink(12)]);
        assert_eq!(fixture.sink.commands().len(), 12 * 4 + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_hour_beep() {
        let fixture = TestFixture::new().await;
        let (mut scheduler, _) = scheduler_at(&fixture, 14, 30).await;
        assert_eq!(scheduler.tick(at(14, 30)).await, vec![TickAction::HalfHourBeep]);
        assert_eq!(fixture.sink.commands().len(), 4 + 2);
        // Nothing known about either LED: restore to the default color
        assert_eq!(fixture.sink.commands()[4], (999, "0000FF".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blink_count_is_bounded() {
        let fixture = TestFixture::new().await;
        let (mut scheduler, _) = scheduler_at(&fixture, 12, 0).await;
        scheduler.blink(500, "FFFFFF", "FF0000", "00FF00").await;
        assert_eq!(fixture.sink.commands().len(), 24 * 4 + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeping_suppresses_animations() {
        let fixture = TestFixture::new().await;
        let (mut scheduler, _) = scheduler_at(&fixture, 22, 31).await;

        scheduler.turn_leds_off().await;
        let off = fixture.sink.commands();
        assert_eq!(off, vec![(999, "000000".to_string()), (1007, "000000".to_string())]);

        assert_eq!(scheduler.tick(at(23, 0)).await, vec![TickAction::SkippedSleeping]);
        assert_eq!(scheduler.tick(at(23, 30)).await, vec![TickAction::SkippedSleeping]);
        assert_eq!(fixture.sink.commands().len(), 2);

        scheduler.turn_leds_on().await;
        assert_eq!(scheduler.tick(at(9, 30)).await, vec![TickAction::HalfHourBeep]);
        assert_eq!(fixture.sink.commands().len(), 2 + 2 + 6);
    }

    #[tokio::test]
    async fn test_sleep_and_wake_transitions() {
        let fixture = TestFixture::new().await;
        fixture.ctx.state.set("999", "255,0,0");
        fixture.ctx.state.set("1007", "00FF00");
        let (mut scheduler, _) = scheduler_at(&fixture, 22, 31).await;

        assert_eq!(scheduler.tick(at(22, 31)).await, vec![TickAction::Sleep]);
        assert_eq!(scheduler.mode(), LedMode::Sleeping);
        assert_eq!(
            fixture.store.get(SLEEP_KEY).await.unwrap().as_deref(),
            Some("sleeping")
        );
        assert_eq!(
            fixture.store.get("LEDCOLOR_999").await.unwrap().as_deref(),
            Some("FF0000")
        );

        // Hub echoes the off state
        fixture.ctx.state.set("999", "0,0,0");
        fixture.ctx.state.set("1007", "0,0,0");

        // Re-running does not snapshot the off color
        scheduler.turn_leds_off().await;
        assert_eq!(
            fixture.store.get("LEDCOLOR_999").await.unwrap().as_deref(),
            Some("FF0000")
        );

        assert_eq!(scheduler.tick(at(7, 31)).await, vec![TickAction::Wake]);
        let commands = fixture.sink.commands();
        assert_eq!(commands[commands.len() - 2], (999, "FF0000".to_string()));
        assert_eq!(commands[commands.len() - 1], (1007, "00FF00".to_string()));
        assert_eq!(fixture.store.get("LEDCOLOR_999").await.unwrap(), None);
        assert_eq!(fixture.store.get(SLEEP_KEY).await.unwrap().as_deref(), Some("awake"));
    }

    #[tokio::test]
    async fn test_wake_falls_back_to_live_then_default() {
        let fixture = TestFixture::new().await;
        fixture.ctx.state.set("1007", "0,0,255");
        let (mut scheduler, _) = scheduler_at(&fixture, 7, 31).await;

        let restored = scheduler.turn_leds_on().await;
        assert_eq!(
            restored,
            vec![
                HubCommand::device_set(999, "0000FF"),
                HubCommand::device_set(1007, "0000FF"),
            ]
        );
    }

    #[tokio::test]
    async fn test_startup_resumes_night_mode() {
        let fixture = TestFixture::new().await;
        fixture.store.set(SLEEP_KEY, "sleeping").await.unwrap();
        fixture.store.set("LEDCOLOR_999", "FF0000").await.unwrap();
        let (mut scheduler, _) = scheduler_at(&fixture, 2, 15).await;

        let sent = scheduler.startup().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(scheduler.mode(), LedMode::Sleeping);
        assert_eq!(
            fixture.sink.commands(),
            vec![
                (999, "000000".to_string()),
                (1007, "000000".to_string()),
                (999, "000000".to_string()),
                (1007, "000000".to_string()),
            ]
        );
        // Colors survive for the morning
        assert!(fixture.store.get("LEDCOLOR_999").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_startup_outside_night_wakes() {
        let fixture = TestFixture::new().await;
        fixture.store.set(SLEEP_KEY, "sleeping").await.unwrap();
        fixture.store.set("LEDCOLOR_999", "FF00FF").await.unwrap();
        let (mut scheduler, _) = scheduler_at(&fixture, 10, 15).await;

        let sent = scheduler.startup().await;
        assert_eq!(scheduler.mode(), LedMode::Awake);
        let commands = fixture.sink.commands();
        // Restore set sent twice, same colors both times
        assert_eq!(sent.len(), 2);
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0], (999, "FF00FF".to_string()));
        assert_eq!(commands[2], (999, "FF00FF".to_string()));
        assert_eq!(commands[..2], commands[2..]);
    }

    #[tokio::test]
    async fn test_on_tick_once_per_minute() {
        let fixture = TestFixture::new().await;
        let (mut scheduler, _) = scheduler_at(&fixture, 22, 30).await;
        let first = at(22, 31);
        assert_eq!(scheduler.on_tick(first).await, vec![TickAction::Sleep]);
        assert!(scheduler
            .on_tick(first + chrono::Duration::seconds(20))
            .await
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_manual_blink_and_clock() {
        let fixture = TestFixture::new().await;
        let (scheduler, clock) = scheduler_at(&fixture, 12, 10).await;
        let handle = scheduler.handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        // Startup restore, sent twice
        assert_eq!(fixture.sink.commands().len(), 4);

        handle.request_blink(2).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fixture.sink.commands().len(), 4 + 2 * 4 + 2);

        clock.set(at(13, 0));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fixture.sink.commands().len(), 4 + 10 + 13 * 4 + 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    /// Store that panics when night mode is written
    struct PanicOnSleep(MemoryStore);

    #[async_trait]
    impl PersistenceStore for PanicOnSleep {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            if key == SLEEP_KEY && value == LedMode::Sleeping.as_str() {
                panic!("store rejected night mode");
            }
            self.0.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.0.delete(key).await
        }

        async fn get_all(&self) -> Result<HashMap<String, String>> {
            self.0.get_all().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_panicking_task() {
        let fixture = TestFixture::new().await;
        let mut ctx = fixture.ctx.clone();
        ctx.persistence = Arc::new(PanicOnSleep(fixture.store.clone()));
        let clock = ManualClock::new(at(22, 30));
        let scheduler = Scheduler::new(ctx, Arc::new(clock.clone())).unwrap();
        let handle = scheduler.handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fixture.sink.commands().len(), 4);

        // Sleep transition panics in the store
        clock.set(at(22, 31));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!task.is_finished());
        assert_eq!(fixture.sink.commands().len(), 4);

        handle.request_blink(1).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fixture.sink.commands().len(), 4 + 4 + 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handle_reports_full_and_closed() {
        let (handle, rx) = SchedulerHandle::channel(1);
        handle.request_blink(1).unwrap();
        assert!(matches!(handle.request_blink(1), Err(BridgeError::ChannelError(_))));
        drop(rx);
        assert!(matches!(handle.request_blink(1), Err(BridgeError::ChannelClosed)));
    }
}
