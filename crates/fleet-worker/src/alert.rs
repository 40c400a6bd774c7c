//! Alert state machine.
//!
//! An [`Alert`] tracks whether a watched condition has been continuously
//! observed, since when, and when it last fired. It holds no clock; every
//! time-dependent operation takes `now` explicitly.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Condition tracking state of one work item.
///
/// `active` implies `started_at` is set. `fired_at` only moves while the
/// alert is outside its cooldown window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Alert {
    /// Whether the condition is currently observed.
    pub active: bool,
    /// When the condition was first observed in the current streak.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the alert last fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<DateTime<Utc>>,
}

/// What an observation of the condition allows the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    /// The condition has not held for the required duration yet.
    Pending,
    /// The alert is ready but fired too recently.
    CoolingDown,
    /// The alert may fire now.
    Fire,
}

impl Alert {
    /// Marks the condition as observed starting at `now`.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.active = true;
        self.started_at = Some(now);
    }

    /// Clears all state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Returns true if the condition has held for at least `duration`.
    #[must_use]
    pub fn should_fire(&self, duration: Duration, now: DateTime<Utc>) -> bool {
        self.active
            && self
                .started_at
                .is_some_and(|started| now.signed_duration_since(started) >= delta(duration))
    }

    /// Returns true if the alert fired no more than `cooldown` ago.
    #[must_use]
    pub fn is_cooling_down(&self, cooldown: Duration, now: DateTime<Utc>) -> bool {
        self.fired_at
            .is_some_and(|fired| now.signed_duration_since(fired) <= delta(cooldown))
    }

    /// Records a firing at `at` unless the alert is cooling down.
    ///
    /// Returns true if `fired_at` changed.
    pub fn fire(&mut self, at: DateTime<Utc>, cooldown: Duration) -> bool {
        if self.is_cooling_down(cooldown, at) {
            return false;
        }
        self.fired_at = Some(at);
        true
    }

    /// Records a positive observation and decides whether to fire.
    ///
    /// Starts the alert if it is not active yet.
    pub fn observe(&mut self, now: DateTime<Utc>, duration: Duration, cooldown: Duration) -> AlertDecision {
        if !self.active {
            self.start(now);
        }
        if !self.should_fire(duration, now) {
            AlertDecision::Pending
        } else if self.is_cooling_down(cooldown, now) {
            AlertDecision::CoolingDown
        } else {
            AlertDecision::Fire
        }
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
