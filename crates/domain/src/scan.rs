//! Background poll policy.
//!
//! Decides, from monotonic time, whether the scheduler may open a connection.
//! A pending close confirmation overrides a disabled policy; ordinary
//! refreshes happen at most once per interval.

use std::time::{Duration, Instant};

use crate::time::Timestamp;

/// What the scheduler should do on this check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Skip,
    /// Read status and battery.
    Refresh,
    /// Connect to confirm the valve closed, re-sending the close if needed.
    ConfirmClose,
}

#[derive(Debug, Clone)]
pub struct ScanPolicy {
    enabled: bool,
    interval: Duration,
    confirm_retry: Duration,
    last_attempt: Option<Instant>,
    last_confirm_attempt: Option<Instant>,
    last_success: Option<Timestamp>,
}

impl ScanPolicy {
    #[must_use]
    pub fn new(enabled: bool, interval: Duration, confirm_retry: Duration) -> Self {
        Self {
            enabled,
            interval,
            confirm_retry,
            last_attempt: None,
            last_confirm_attempt: None,
            last_success: None,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Last time a poll completed successfully.
    #[must_use]
    pub fn last_success(&self) -> Option<Timestamp> {
        self.last_success
    }

    /// Toggle scanning. Returns `true` if the flag changed.
    ///
    /// Enabling makes the next check refresh immediately.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled == enabled {
            return false;
        }
        self.enabled = enabled;
        if enabled {
            self.last_attempt = None;
        }
        true
    }

    /// Decide what to do at `now`.
    ///
    /// `close_due` is set when a session's predicted expiry has passed
    /// without a confirmed close.
    ///
    /// The refresh interval runs from the last recorded attempt, successful
    /// or not, so an unreachable device is tried once per interval rather
    /// than on every check.
    #[must_use]
    pub fn decide(&self, now: Instant, close_due: bool) -> PollDecision {
        if close_due && elapsed_at_least(self.last_confirm_attempt, now, self.confirm_retry) {
            return PollDecision::ConfirmClose;
        }
        if self.enabled && elapsed_at_least(self.last_attempt, now, self.interval) {
            return PollDecision::Refresh;
        }
        PollDecision::Skip
    }

    /// Note that the decided connection was actually attempted.
    pub fn record_attempt(&mut self, decision: PollDecision, now: Instant) {
        match decision {
            PollDecision::Refresh => self.last_attempt = Some(now),
            PollDecision::ConfirmClose => self.last_confirm_attempt = Some(now),
            PollDecision::Skip => {}
        }
    }

    pub fn record_success(&mut self, at: Timestamp) {
        self.last_success = Some(at);
    }

    /// Forget the confirm-close rate limit once no close is pending.
    pub fn clear_confirm(&mut self) {
        self.last_confirm_attempt = None;
    }
}

fn elapsed_at_least(since: Option<Instant>, now: Instant, period: Duration) -> bool {
    since.is_none_or(|at| now.saturating_duration_since(at) >= period)
}
