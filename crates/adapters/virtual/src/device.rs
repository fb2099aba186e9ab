//! Valve model of the simulated controller.
//!
//! Behaves like the firmware does: a timed open closes itself when the
//! device's own countdown reaches zero, whether or not anyone is connected.

use std::time::Duration;

use tokio::time::Instant;

use valvehub_domain::command::Command;
use valvehub_domain::protocol::Response;

#[derive(Debug, Clone)]
pub(crate) struct SimulatedValve {
    open: bool,
    closes_at: Option<Instant>,
    battery_percent: u8,
}

impl SimulatedValve {
    pub(crate) fn new(battery_percent: u8) -> Self {
        Self {
            open: false,
            closes_at: None,
            battery_percent,
        }
    }

    pub(crate) fn set_battery(&mut self, percent: u8) {
        self.battery_percent = percent;
    }

    pub(crate) fn is_open(&mut self, now: Instant) -> bool {
        self.settle(now);
        self.open
    }

    /// Seconds left on the device's countdown, rounded up.
    pub(crate) fn remaining_seconds(&mut self, now: Instant) -> Option<u32> {
        self.settle(now);
        let left = self.closes_at?.saturating_duration_since(now);
        let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
        Some(u32::try_from(secs).unwrap_or(u32::MAX))
    }

    /// Apply `command` at `now` and produce the firmware's answer.
    pub(crate) fn apply(&mut self, command: Command, now: Instant) -> Response {
        self.settle(now);
        match command {
            Command::OpenValve => {
                self.open = true;
                self.closes_at = None;
                Response::Ack
            }
            Command::OpenValveTimed(minutes) => {
                self.open = true;
                self.closes_at =
                    Some(now + Duration::from_secs(u64::from(minutes.as_seconds())));
                Response::Ack
            }
            Command::CloseValve => {
                self.open = false;
                self.closes_at = None;
                Response::Ack
            }
            Command::QueryStatus => Response::StatusReport {
                open: self.open,
                remaining_seconds: self.remaining_seconds(now).filter(|secs| *secs > 0),
            },
            Command::QueryBattery => Response::BatteryReport {
                percent: self.battery_percent,
            },
        }
    }

    fn settle(&mut self, now: Instant) {
        if self.closes_at.is_some_and(|at| at <= now) {
            self.open = false;
            self.closes_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valvehub_domain::command::IrrigationMinutes;

    fn ten() -> Command {
        Command::OpenValveTimed(IrrigationMinutes::new(10).unwrap())
    }

    #[test]
    fn should_report_closed_when_new() {
        let mut valve = SimulatedValve::new(90);
        let now = Instant::now();
        assert_eq!(
            valve.apply(Command::QueryStatus, now),
            Response::StatusReport {
                open: false,
                remaining_seconds: None
            }
        );
    }

    #[test]
    fn should_count_down_timed_open() {
        let mut valve = SimulatedValve::new(90);
        let start = Instant::now();
        assert_eq!(valve.apply(ten(), start), Response::Ack);

        let later = start + Duration::from_secs(120);
        assert_eq!(
            valve.apply(Command::QueryStatus, later),
            Response::StatusReport {
                open: true,
                remaining_seconds: Some(480)
            }
        );
    }

    #[test]
    fn should_close_itself_at_expiry() {
        let mut valve = SimulatedValve::new(90);
        let start = Instant::now();
        valve.apply(ten(), start);

        assert!(valve.is_open(start + Duration::from_secs(599)));
        assert!(!valve.is_open(start + Duration::from_secs(600)));
        assert_eq!(valve.remaining_seconds(start + Duration::from_secs(600)), None);
    }

    #[test]
    fn should_stay_open_without_timer() {
        let mut valve = SimulatedValve::new(90);
        let start = Instant::now();
        valve.apply(Command::OpenValve, start);

        assert!(valve.is_open(start + Duration::from_secs(86_400)));
        assert_eq!(valve.remaining_seconds(start), None);
    }

    #[test]
    fn should_round_partial_seconds_up() {
        let mut valve = SimulatedValve::new(90);
        let start = Instant::now();
        valve.apply(ten(), start);
        assert_eq!(
            valve.remaining_seconds(start + Duration::from_millis(1_500)),
            Some(599)
        );
    }

    #[test]
    fn should_report_battery() {
        let mut valve = SimulatedValve::new(90);
        valve.set_battery(12);
        assert_eq!(
            valve.apply(Command::QueryBattery, Instant::now()),
            Response::BatteryReport { percent: 12 }
        );
    }
}
