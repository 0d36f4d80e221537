//! Heartbeat health-check evaluation with quiet-hours support (spec 4.5).

use async_trait::async_trait;
use chrono::NaiveTime;
use chrono_tz::Tz;

/// One configured health check (spec 3 auxiliary state: per-heartbeat
/// check last_check_at, last_alert_at, consecutive_errors).
#[async_trait]
pub trait HeartbeatCheck: Send + Sync {
    /// Stable, unique name used as the store key.
    fn name(&self) -> &str;
    /// Owning user, notified on alert.
    fn user_id(&self) -> i64;
    /// Minutes between runs.
    fn interval_minutes(&self) -> i64;
    /// Minutes to wait before re-alerting on a still-unhealthy check.
    fn cooldown_minutes(&self) -> i64;
    /// Quiet-hours window (start, end) in the check's timezone, if any.
    fn quiet_hours(&self) -> Option<(NaiveTime, NaiveTime)>;
    /// The check's timezone, for quiet-hours evaluation.
    fn timezone(&self) -> Tz;
    /// Run the check; `true` means healthy.
    async fn run(&self) -> bool;
}

/// Whether `now` falls inside a quiet-hours window, supporting windows
/// that cross midnight (e.g. `22:00-07:00`, spec 8 invariant 6).
pub fn in_quiet_hours(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    #[test]
    fn straight_window_suppresses_inside_only() {
        assert!(in_quiet_hours(t(10, 0), t(9, 0), t(17, 0)));
        assert!(!in_quiet_hours(t(8, 0), t(9, 0), t(17, 0)));
        assert!(!in_quiet_hours(t(17, 0), t(9, 0), t(17, 0)));
    }

    #[test]
    fn cross_midnight_window_suppresses_both_day_components() {
        assert!(in_quiet_hours(t(23, 0), t(22, 0), t(7, 0)));
        assert!(in_quiet_hours(t(3, 0), t(22, 0), t(7, 0)));
        assert!(!in_quiet_hours(t(12, 0), t(22, 0), t(7, 0)));
        assert!(!in_quiet_hours(t(7, 0), t(22, 0), t(7, 0)));
    }
}
