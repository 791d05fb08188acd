//! # Device Schedules
//!
//! Timed commands owned by a device. The hub's scheduling pass asks each
//! enabled schedule [`Schedule::is_due`] once per second, sends its stored
//! command once, and records the execution with [`Schedule::mark_executed`].
//!
//! Time-of-day and weekday matching use `chrono` on epoch milliseconds shifted
//! by the hub's configured UTC offset.
//!
//! Daily and Weekly schedules set `next_execution` to "24 hours after the last
//! run". That value is informational only; matching is always done against
//! the configured times.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, FixedOffset, TimeZone, Timelike, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::FleetError;
use crate::logutil::log_name;

/// Longest command a schedule may carry (one Command fragment).
pub const MAX_SCHEDULE_COMMAND: usize = 32;
/// Minimum gap between two executions of the same schedule.
pub const EXECUTION_GUARD_MS: u64 = 60_000;

const DAY_MS: u64 = 24 * 3600 * 1000;

/// Day-of-week bits, Sunday first.
pub mod days {
    pub const SUNDAY: u8 = 0x01;
    pub const MONDAY: u8 = 0x02;
    pub const TUESDAY: u8 = 0x04;
    pub const WEDNESDAY: u8 = 0x08;
    pub const THURSDAY: u8 = 0x10;
    pub const FRIDAY: u8 = 0x20;
    pub const SATURDAY: u8 = 0x40;
    pub const WEEKDAYS: u8 = MONDAY | TUESDAY | WEDNESDAY | THURSDAY | FRIDAY;
    pub const WEEKEND: u8 = SATURDAY | SUNDAY;
    pub const ALL: u8 = 0x7F;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleKind {
    OneTime,
    Daily,
    Weekly,
    Interval,
}

/// Hour and minute of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpec {
    pub hour: u8,
    pub minute: u8,
}

impl TimeSpec {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeSpec {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || FleetError::InvalidSchedule(format!("invalid time '{}'", s));
        let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
        let hour = h.parse::<u8>().map_err(|_| bad())?;
        let minute = m.parse::<u8>().map_err(|_| bad())?;
        TimeSpec::new(hour, minute).ok_or_else(bad)
    }
}

impl Serialize for TimeSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimeSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    pub enabled: bool,
    #[serde(default)]
    pub times: Vec<TimeSpec>,
    pub days_mask: u8,
    #[serde(default)]
    pub interval_seconds: u32,
    #[serde(default)]
    pub last_execution: u64,
    #[serde(default)]
    pub next_execution: u64,
    #[serde(default)]
    pub execution_count: u32,
    command: Vec<u8>,
}

impl Schedule {
    pub fn new(id: u32, name: &str, kind: ScheduleKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            enabled: true,
            times: Vec::new(),
            days_mask: days::ALL,
            interval_seconds: 0,
            last_execution: 0,
            next_execution: 0,
            execution_count: 0,
            command: Vec::new(),
        }
    }

    pub fn with_times(mut self, times: &[TimeSpec]) -> Self {
        self.times = times.to_vec();
        self
    }

    pub fn with_days(mut self, mask: u8) -> Self {
        self.days_mask = mask & days::ALL;
        self
    }

    pub fn with_interval(mut self, seconds: u32) -> Self {
        self.interval_seconds = seconds;
        self
    }

    /// One-time execution instant in epoch milliseconds.
    pub fn at(mut self, when_ms: u64) -> Self {
        self.next_execution = when_ms;
        self
    }

    /// Commands longer than one fragment are truncated.
    pub fn with_command(mut self, data: &[u8]) -> Self {
        self.set_command(data);
        self
    }

    pub fn set_command(&mut self, data: &[u8]) {
        let n = data.len().min(MAX_SCHEDULE_COMMAND);
        self.command = data[..n].to_vec();
    }

    pub fn command(&self) -> &[u8] {
        &self.command
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        let invalid = |m: &str| Err(FleetError::InvalidSchedule(m.to_string()));
        if self.name.trim().is_empty() {
            return invalid("name is empty");
        }
        if self.command.is_empty() {
            return invalid("no command data");
        }
        match self.kind {
            ScheduleKind::OneTime if self.next_execution == 0 => invalid("one-time schedule has no execution time"),
            ScheduleKind::Daily | ScheduleKind::Weekly if self.times.is_empty() => {
                invalid("daily/weekly schedule has no execution times")
            }
            ScheduleKind::Weekly if self.days_mask == 0 => invalid("weekly schedule has no days"),
            ScheduleKind::Interval if self.interval_seconds == 0 => invalid("interval is zero"),
            _ => Ok(()),
        }
    }

    /// Whether the schedule should fire at `now`.
    ///
    /// Nothing fires within [`EXECUTION_GUARD_MS`] of the last execution,
    /// whatever the kind. Daily and weekly times match for a whole minute, so
    /// this keeps them from firing on every check tick. It also caps interval
    /// schedules at one run per minute: a 10 s interval executed at `t` is not
    /// due at `t + 10_000`, only from `t + 60_000` on.
    pub fn is_due(&self, now: u64, utc_offset_secs: i32) -> bool {
        if !self.enabled {
            return false;
        }
        if self.last_execution > 0 && now.saturating_sub(self.last_execution) < EXECUTION_GUARD_MS {
            return false;
        }
        match self.kind {
            ScheduleKind::OneTime => self.execution_count == 0 && now >= self.next_execution,
            ScheduleKind::Daily => self.time_matches(now, utc_offset_secs),
            ScheduleKind::Weekly => {
                self.day_matches(now, utc_offset_secs) && self.time_matches(now, utc_offset_secs)
            }
            ScheduleKind::Interval => {
                self.last_execution == 0
                    || now.saturating_sub(self.last_execution) >= u64::from(self.interval_seconds) * 1000
            }
        }
    }

    pub fn mark_executed(&mut self, now: u64) {
        self.last_execution = now;
        self.execution_count += 1;
        self.next_execution = self.calculate_next_execution(now);
        debug!(
            "Executed schedule {} (count: {})",
            log_name(&self.name),
            self.execution_count
        );
    }

    pub fn calculate_next_execution(&self, now: u64) -> u64 {
        match self.kind {
            ScheduleKind::OneTime => 0,
            ScheduleKind::Interval => now + u64::from(self.interval_seconds) * 1000,
            ScheduleKind::Daily | ScheduleKind::Weekly => now + DAY_MS,
        }
    }

    pub fn reset_execution_count(&mut self) {
        self.execution_count = 0;
    }

    fn time_matches(&self, now: u64, offset: i32) -> bool {
        let Some((_, hour, minute)) = wall_clock(now, offset) else {
            return false;
        };
        self.times.iter().any(|t| t.hour == hour && t.minute == minute)
    }

    fn day_matches(&self, now: u64, offset: i32) -> bool {
        match wall_clock(now, offset) {
            Some((weekday, _, _)) => self.days_mask & (1 << weekday) != 0,
            None => false,
        }
    }
}

/// (weekday from Sunday, hour, minute) of `now_ms` at the given UTC offset.
fn wall_clock(now_ms: u64, utc_offset_secs: i32) -> Option<(u32, u8, u8)> {
    let offset = FixedOffset::east_opt(utc_offset_secs)?;
    let utc = Utc.timestamp_millis_opt(i64::try_from(now_ms).ok()?).single()?;
    let local = utc.with_timezone(&offset);
    Some((
        local.weekday().num_days_from_sunday(),
        local.hour() as u8,
        local.minute() as u8,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> u64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp_millis() as u64
    }

    #[test]
    fn interval_due_first_then_after_interval() {
        let mut s = Schedule::new(1, "Dose", ScheduleKind::Interval)
            .with_interval(10)
            .with_command(&[1, 5]);
        let t = 1_000_000;
        assert!(s.is_due(t, 0));
        s.mark_executed(t);
        assert_eq!(s.next_execution, t + 10_000);
        assert!(!s.is_due(t + 9_999, 0));
        // guard interval still suppresses it
        assert!(!s.is_due(t + 10_000, 0));
        assert!(s.is_due(t + EXECUTION_GUARD_MS, 0));
    }

    #[test]
    fn weekend_schedule_never_due_on_wednesday() {
        let s = Schedule::new(2, "Weekend lights", ScheduleKind::Weekly)
            .with_times(&[TimeSpec::new(8, 30).unwrap()])
            .with_days(days::WEEKEND)
            .with_command(&[1]);
        // 2024-01-03 was a Wednesday
        assert!(!s.is_due(ms(2024, 1, 3, 8, 30), 0));
        assert!(s.is_due(ms(2024, 1, 6, 8, 30), 0));
        assert!(s.is_due(ms(2024, 1, 7, 8, 30), 0));
        assert!(!s.is_due(ms(2024, 1, 7, 8, 31), 0));
    }

    #[test]
    fn daily_respects_utc_offset() {
        let s = Schedule::new(3, "Lights on", ScheduleKind::Daily)
            .with_times(&[TimeSpec::new(9, 0).unwrap()])
            .with_command(&[1]);
        let utc_seven = ms(2024, 3, 10, 7, 0);
        assert!(!s.is_due(utc_seven, 0));
        assert!(s.is_due(utc_seven, 2 * 3600));
    }

    #[test]
    fn one_time_fires_once() {
        let mut s = Schedule::new(4, "Feed", ScheduleKind::OneTime)
            .at(5_000)
            .with_command(&[1, 2]);
        assert!(!s.is_due(4_999, 0));
        assert!(s.is_due(5_000, 0));
        s.mark_executed(5_000);
        assert_eq!(s.next_execution, 0);
        assert!(!s.is_due(500_000, 0));
    }

    #[test]
    fn disabled_is_never_due() {
        let mut s = Schedule::new(5, "x", ScheduleKind::Interval)
            .with_interval(1)
            .with_command(&[1]);
        s.enabled = false;
        assert!(!s.is_due(0, 0));
    }

    #[test]
    fn validation_rules() {
        assert!(Schedule::new(1, "n", ScheduleKind::Interval).with_interval(5).validate().is_err());
        assert!(Schedule::new(1, "", ScheduleKind::Interval)
            .with_interval(5)
            .with_command(&[1])
            .validate()
            .is_err());
        assert!(Schedule::new(1, "n", ScheduleKind::Daily).with_command(&[1]).validate().is_err());
        assert!(Schedule::new(1, "n", ScheduleKind::OneTime).with_command(&[1]).validate().is_err());
        assert!(Schedule::new(1, "n", ScheduleKind::Interval).with_command(&[1]).validate().is_err());
        assert!(Schedule::new(1, "n", ScheduleKind::Interval)
            .with_interval(5)
            .with_command(&[1])
            .validate()
            .is_ok());
    }

    #[test]
    fn command_is_truncated_and_times_serialize_as_strings() {
        let s = Schedule::new(9, "Long", ScheduleKind::Daily)
            .with_times(&[TimeSpec::new(7, 5).unwrap()])
            .with_command(&[0xAB; 40]);
        assert_eq!(s.command().len(), MAX_SCHEDULE_COMMAND);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["times"][0], "07:05");
        assert_eq!(json["type"], "DAILY");
        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
        assert!("24:00".parse::<TimeSpec>().is_err());
    }
}
