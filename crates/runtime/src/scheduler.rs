//! Scheduled-slide driver
//!
//! Windowed operators must fire when their window closes even if no new
//! reading arrives. Each device analog owns one cooperative driver task:
//! it parks until the earliest registered expiry (waking early when the
//! registration set changes), fires every due `(attribute, slot)` with
//! the remaining pipeline, and advances the entry by its slide.
//!
//! Expiries are rounded up to a 10 ms grid so entries that should fire
//! together actually share a wake-up.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::analog::DeviceAnalog;
use crate::clock::Clock;
use crate::dispatch::MessageDispatcher;

/// Wake-up rounding grid in milliseconds
pub const SCHEDULE_RESOLUTION_MS: i64 = 10;

/// Round a deadline up onto the firing grid
pub fn round_to_grid(deadline_ms: i64) -> i64 {
    let remainder = deadline_ms.rem_euclid(SCHEDULE_RESOLUTION_MS);
    if remainder == 0 {
        deadline_ms
    } else {
        deadline_ms + (SCHEDULE_RESOLUTION_MS - remainder)
    }
}

struct ScheduleEntry {
    next_expiry_ms: i64,
    targets: Vec<(String, usize)>,
}

/// Registration set keyed by `(window, slide)`
///
/// One entry per distinct key across all of the analog's attributes, so
/// operators sharing a cadence fire in the same wake-up.
pub struct SlideScheduler {
    entries: Mutex<BTreeMap<(i64, i64), ScheduleEntry>>,
    notify: Notify,
}

impl SlideScheduler {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
        }
    }

    /// Register `(attribute, slot)` under its `(window, slide)` cadence
    pub fn register(&self, window_ms: i64, slide_ms: i64, attribute: &str, slot: usize, now_ms: i64) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let entry = entries.entry((window_ms, slide_ms)).or_insert_with(|| ScheduleEntry {
            next_expiry_ms: round_to_grid(now_ms + window_ms),
            targets: Vec::new(),
        });
        let target = (attribute.to_string(), slot);
        if !entry.targets.contains(&target) {
            entry.targets.push(target);
        }
        drop(entries);
        self.notify.notify_one();
    }

    /// Remove every registration (the driver parks until new ones arrive)
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
        self.notify.notify_one();
    }

    /// Earliest registered expiry
    pub fn next_deadline(&self) -> Option<i64> {
        let entries = self.entries.lock().ok()?;
        entries.values().map(|entry| entry.next_expiry_ms).min()
    }

    /// Collect every due target, advancing each entry by its slide
    pub fn take_due(&self, now_ms: i64) -> Vec<(String, usize)> {
        let Ok(mut entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut due = Vec::new();
        for ((_, slide), entry) in entries.iter_mut() {
            if entry.next_expiry_ms <= now_ms {
                due.extend(entry.targets.iter().cloned());
                while entry.next_expiry_ms <= now_ms {
                    entry.next_expiry_ms += (*slide).max(SCHEDULE_RESOLUTION_MS);
                }
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().map(|entries| entries.is_empty()).unwrap_or(true)
    }

    /// Await a change to the registration set
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

impl Default for SlideScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the driver task for one analog
///
/// The task holds only a weak reference; dropping the analog ends the
/// driver at its next wake-up (the analog's own Drop also aborts it).
pub(crate) fn spawn_driver(
    analog: std::sync::Weak<DeviceAnalog>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn MessageDispatcher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (scheduler, deadline) = {
                let Some(analog) = analog.upgrade() else {
                    break;
                };
                let scheduler = Arc::clone(analog.scheduler());
                let deadline = scheduler.next_deadline();
                (scheduler, deadline)
            };

            match deadline {
                None => scheduler.changed().await,
                Some(deadline) => {
                    let wake_at = round_to_grid(deadline);
                    tokio::select! {
                        _ = clock.sleep_until(wake_at) => {
                            let Some(analog) = analog.upgrade() else {
                                break;
                            };
                            let now = clock.now_ms();
                            let due = scheduler.take_due(now);
                            if !due.is_empty() {
                                debug!("Scheduled slide fired {} target(s) at {}", due.len(), now);
                            }
                            for (attribute, slot) in due {
                                let (produced, alerts) =
                                    analog.fire_scheduled(&attribute, slot).await;
                                let mut outbound = Vec::new();
                                if let Some(message) = produced {
                                    outbound.extend(analog.apply_model_pipeline(message).await);
                                }
                                outbound.extend(alerts);
                                if !outbound.is_empty() {
                                    dispatcher.dispatch(outbound);
                                }
                            }
                        }
                        _ = scheduler.changed() => {}
                    }
                }
            }
        }
    })
}
