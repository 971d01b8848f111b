//! Process-wide marketing countdown timer.
//!
//! A single timer record drives "offer ends in N hours" UI. Reads roll the
//! window forward automatically when it has lapsed; only admin-authorized
//! writes change the copy or duration.

use crate::time::{hours, unix_now};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// The countdown window plus its display copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    /// Window start, Unix seconds.
    pub start_time: u64,
    pub duration_hours: u32,
    pub message: String,
    pub price_message: String,
}

impl TimerSettings {
    #[must_use]
    pub fn end_time(&self) -> u64 {
        self.start_time + hours(u64::from(self.duration_hours))
    }

    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.end_time()
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            start_time: unix_now(),
            duration_hours: 48,
            message: "Limited time offer".to_string(),
            price_message: String::new(),
        }
    }
}

/// Admin-writable fields. `start_time` is never set directly; updates restart
/// the window at the current time.
#[derive(Debug, Clone, Deserialize)]
pub struct TimerUpdate {
    pub duration_hours: Option<u32>,
    pub message: Option<String>,
    pub price_message: Option<String>,
}

/// Singleton countdown state.
#[derive(Debug)]
pub struct CountdownTimer {
    settings: RwLock<TimerSettings>,
}

impl CountdownTimer {
    #[must_use]
    pub fn new(settings: TimerSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Current settings, with the window rolled forward if it has expired.
    /// Callers always see a live countdown.
    pub fn current(&self) -> TimerSettings {
        let now = unix_now();
        {
            let settings = self.settings.read().unwrap();
            if !settings.is_expired_at(now) {
                return settings.clone();
            }
        }

        let mut settings = self.settings.write().unwrap();
        // Another reader may have rolled it while we waited for the lock.
        if settings.is_expired_at(now) {
            settings.start_time = now;
            tracing::debug!(
                target: "paygate::timer",
                start_time = now,
                "Countdown window rolled forward"
            );
        }
        settings.clone()
    }

    /// Apply an admin update and restart the window.
    pub fn update(&self, update: TimerUpdate) -> TimerSettings {
        let mut settings = self.settings.write().unwrap();
        if let Some(duration) = update.duration_hours {
            settings.duration_hours = duration;
        }
        if let Some(message) = update.message {
            settings.message = message;
        }
        if let Some(price_message) = update.price_message {
            settings.price_message = price_message;
        }
        settings.start_time = unix_now();
        settings.clone()
    }
}

impl Default for CountdownTimer {
    fn default() -> Self {
        Self::new(TimerSettings::default())
    }
}
