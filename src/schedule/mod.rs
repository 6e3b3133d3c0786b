/// Schedule clock
///
/// Pure functions turning a route start time into scheduled arrivals and
/// rendering how early or late a bus is at a waypoint.
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::route::{Waypoint, WaypointKind, WaypointStatus};

pub mod tables;

/// Duration text the backend uses for a control stop the bus never reached
pub const SKIPPED_SENTINEL: &str = "No pasó por el paradero";
/// Duration text of a completed intermediate reference point
pub const INTERMEDIATE_COMPLETED: &str = "Completado";
/// Duration text of an intermediate reference point abandoned on timeout
pub const INTERMEDIATE_TIMED_OUT: &str = "Tiempo agotado, no pasó";

/// A schedule more than this far from the reference belongs to the adjacent day
const ROLLOVER_HOURS: i64 = 12;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid clock time: {0}")]
    InvalidTime(String),
}

/// Scheduled arrival of the `index`-th control stop, minute resolution.
pub fn scheduled_time_of(index: usize, route_start: NaiveTime, route_code: &str) -> Option<NaiveTime> {
    let minutes = *tables::offsets_for(route_code, route_start).get(index)?;
    let start = truncate_to_minute(route_start);
    let (time, _) = start.overflowing_add_signed(Duration::minutes(minutes));
    Some(time)
}

/// All scheduled arrivals for a route start, one per control stop
pub fn scheduled_times(route_start: NaiveTime, route_code: &str) -> Vec<NaiveTime> {
    (0..tables::offsets_for(route_code, route_start).len())
        .filter_map(|index| scheduled_time_of(index, route_start, route_code))
        .collect()
}

/// Place a wall-clock schedule on the calendar relative to `reference`.
///
/// The schedule lands on the reference's date unless that puts it more than
/// 12 hours in the past (next day) or in the future (previous day).
pub fn scheduled_at(scheduled: NaiveTime, reference: NaiveDateTime) -> NaiveDateTime {
    let candidate = reference.date().and_time(scheduled);
    let window = Duration::hours(ROLLOVER_HOURS);
    if reference - candidate > window {
        candidate + Duration::days(1)
    } else if candidate - reference > window {
        candidate - Duration::days(1)
    } else {
        candidate
    }
}

/// Signed seconds between the schedule and `reference`, positive when late
pub fn delay_seconds(scheduled: NaiveTime, reference: NaiveDateTime) -> i64 {
    let diff = reference - scheduled_at(scheduled, reference);
    diff.num_milliseconds().div_euclid(1000)
}

/// Running delay of an active waypoint: empty until due, then `+M:SS`
pub fn format_live_delay(diff_seconds: i64) -> String {
    if diff_seconds < 0 {
        return String::new();
    }
    format!("+{}:{:02}", diff_seconds / 60, diff_seconds % 60)
}

/// Final delay of a completed waypoint, e.g. `+2min 15seg`, `-30seg`, `0seg`
pub fn format_final_delay(diff_seconds: i64) -> String {
    let sign = if diff_seconds < 0 { "-" } else { "+" };
    let magnitude = diff_seconds.abs();
    let minutes = magnitude / 60;
    let seconds = magnitude % 60;

    match (minutes, seconds) {
        (0, 0) => "0seg".to_string(),
        (m, 0) => format!("{sign}{m}min"),
        (0, s) => format!("{sign}{s}seg"),
        (m, s) => format!("{sign}{m}min {s}seg"),
    }
}

/// Display duration of a waypoint at `now`
pub fn compute_duration(waypoint: &Waypoint, now: NaiveDateTime) -> String {
    if waypoint.kind == WaypointKind::IntermediateReference {
        // Dwell time is tracked through `activated_at` but never rendered
        return match waypoint.status {
            WaypointStatus::Completed => INTERMEDIATE_COMPLETED.to_string(),
            WaypointStatus::Skipped => INTERMEDIATE_TIMED_OUT.to_string(),
            WaypointStatus::Pending | WaypointStatus::Active => String::new(),
        };
    }

    match waypoint.status {
        WaypointStatus::Skipped => SKIPPED_SENTINEL.to_string(),
        WaypointStatus::Completed => match (waypoint.scheduled_time, waypoint.actual_time) {
            (Some(scheduled), Some(actual)) => format_final_delay(delay_seconds(scheduled, actual)),
            _ => String::new(),
        },
        WaypointStatus::Active => waypoint
            .scheduled_time
            .map(|scheduled| format_live_delay(delay_seconds(scheduled, now)))
            .unwrap_or_default(),
        WaypointStatus::Pending => String::new(),
    }
}

/// Normalize an operator-entered clock time to 24-hour form.
///
/// Accepts `14:05`, `14:05:09`, `2:05:09 PM` and the Spanish `2:05:09 p. m.`.
pub fn normalize_clock_time(input: &str) -> Result<NaiveTime, ScheduleError> {
    let compact: String = input
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .collect();

    let (clock, meridiem) = if let Some(clock) = compact.strip_suffix("am") {
        (clock, Some("AM"))
    } else if let Some(clock) = compact.strip_suffix("pm") {
        (clock, Some("PM"))
    } else {
        (compact.as_str(), None)
    };

    let parsed = match meridiem {
        Some(meridiem) => {
            let twelve_hour = format!("{clock} {meridiem}");
            NaiveTime::parse_from_str(&twelve_hour, "%I:%M:%S %p")
                .or_else(|_| NaiveTime::parse_from_str(&twelve_hour, "%I:%M %p"))
        }
        None => NaiveTime::parse_from_str(clock, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(clock, "%H:%M")),
    };

    parsed.map_err(|_| ScheduleError::InvalidTime(input.to_string()))
}

/// Parse the route start sent by the backend.
///
/// Usually `HH:MM:SS`; full timestamps are accepted and reduced to their time.
pub fn parse_route_start(input: &str) -> Result<NaiveTime, ScheduleError> {
    let trimmed = input.trim();
    if let Ok(time) = normalize_clock_time(trimmed) {
        return Ok(time);
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|datetime| datetime.time())
        .ok_or_else(|| ScheduleError::InvalidTime(input.to_string()))
}

/// Attach a clock time to a date, dropping sub-second precision
pub fn on_date(date: NaiveDate, time: NaiveTime) -> NaiveDateTime {
    date.and_time(time.with_nanosecond(0).unwrap_or(time))
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_math::Coordinate;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap().and_time(t(h, m, s))
    }

    fn control(status: WaypointStatus, scheduled: NaiveTime) -> Waypoint {
        let mut waypoint = Waypoint::control(
            "2",
            "CHANCHAMAYO",
            "Control 1",
            Some(scheduled),
            Coordinate::new(-7.147637, -78.522551),
            25.0,
        );
        waypoint.status = status;
        waypoint
    }

    #[test]
    fn first_arrival_for_route_5_at_ten_past_six() {
        assert_eq!(scheduled_time_of(0, t(6, 10, 0), "5"), Some(t(6, 20, 0)));
        assert_eq!(scheduled_times(t(6, 10, 0), "5").len(), 7);
    }

    #[test]
    fn scheduled_times_have_minute_resolution() {
        assert_eq!(scheduled_time_of(0, t(6, 10, 45), "5"), Some(t(6, 20, 0)));
    }

    #[test]
    fn schedule_past_midnight_wraps() {
        assert_eq!(scheduled_time_of(5, t(23, 50, 0), "12"), Some(t(0, 20, 0)));
    }

    #[test]
    fn index_beyond_table_has_no_schedule() {
        assert_eq!(scheduled_time_of(6, t(6, 0, 0), "12"), None);
    }

    #[test]
    fn rollover_only_when_more_than_twelve_hours_behind() {
        assert_eq!(scheduled_at(t(0, 5, 0), at(23, 50, 0)), at(0, 5, 0) + Duration::days(1));
        assert_eq!(scheduled_at(t(8, 0, 0), at(9, 0, 0)), at(8, 0, 0));
        assert_eq!(scheduled_at(t(8, 0, 0), at(20, 0, 0)), at(8, 0, 0));
    }

    #[test]
    fn schedule_before_midnight_belongs_to_previous_day() {
        assert_eq!(scheduled_at(t(23, 55, 0), at(0, 5, 0)), at(23, 55, 0) - Duration::days(1));
        assert_eq!(scheduled_at(t(20, 0, 0), at(8, 0, 0)), at(20, 0, 0));
    }

    #[test]
    fn arrival_after_midnight_is_late_not_early() {
        let diff = delay_seconds(t(23, 55, 0), at(0, 5, 0));
        assert_eq!(diff, 600);
        assert_eq!(format_final_delay(diff), "+10min");
        assert_eq!(format_live_delay(diff), "+10:00");
    }

    #[test]
    fn late_completion_renders_minutes_and_seconds() {
        assert_eq!(format_final_delay(delay_seconds(t(8, 0, 0), at(8, 2, 15))), "+2min 15seg");
    }

    #[test]
    fn early_completion_renders_seconds_only() {
        assert_eq!(format_final_delay(delay_seconds(t(8, 0, 0), at(7, 59, 30))), "-30seg");
    }

    #[test]
    fn final_delay_omits_zero_components() {
        assert_eq!(format_final_delay(0), "0seg");
        assert_eq!(format_final_delay(120), "+2min");
        assert_eq!(format_final_delay(-125), "-2min 5seg");
        assert_eq!(format_final_delay(-180), "-3min");
    }

    #[test]
    fn live_delay_hidden_until_due() {
        assert_eq!(format_live_delay(-1), "");
        assert_eq!(format_live_delay(0), "+0:00");
        assert_eq!(format_live_delay(65), "+1:05");
        assert_eq!(format_live_delay(754), "+12:34");
    }

    #[test]
    fn duration_by_status() {
        let scheduled = t(8, 0, 0);

        let active = control(WaypointStatus::Active, scheduled);
        assert_eq!(compute_duration(&active, at(7, 58, 0)), "");
        assert_eq!(compute_duration(&active, at(8, 1, 7)), "+1:07");

        let mut completed = control(WaypointStatus::Completed, scheduled);
        completed.actual_time = Some(at(8, 2, 15));
        assert_eq!(compute_duration(&completed, at(9, 0, 0)), "+2min 15seg");

        let skipped = control(WaypointStatus::Skipped, scheduled);
        assert_eq!(compute_duration(&skipped, at(9, 0, 0)), SKIPPED_SENTINEL);

        let pending = control(WaypointStatus::Pending, scheduled);
        assert_eq!(compute_duration(&pending, at(9, 0, 0)), "");
    }

    #[test]
    fn intermediate_duration_never_shows_dwell_time() {
        let mut waypoint = Waypoint::intermediate(
            "2.1",
            "LA CENA",
            "Punto Referencia",
            Coordinate::new(-7.146683, -78.521093),
            25.0,
        );
        waypoint.status = WaypointStatus::Active;
        waypoint.activated_at = Some(at(8, 0, 0));
        assert_eq!(compute_duration(&waypoint, at(8, 30, 0)), "");

        waypoint.status = WaypointStatus::Completed;
        assert_eq!(compute_duration(&waypoint, at(8, 30, 0)), INTERMEDIATE_COMPLETED);

        waypoint.status = WaypointStatus::Skipped;
        assert_eq!(compute_duration(&waypoint, at(8, 30, 0)), INTERMEDIATE_TIMED_OUT);
    }

    #[test]
    fn normalizes_twelve_hour_input() {
        assert_eq!(normalize_clock_time("2:05:09 PM").unwrap(), t(14, 5, 9));
        assert_eq!(normalize_clock_time("2:05:09 p. m.").unwrap(), t(14, 5, 9));
        assert_eq!(normalize_clock_time("12:00:01 a. m.").unwrap(), t(0, 0, 1));
        assert_eq!(normalize_clock_time("12:30 PM").unwrap(), t(12, 30, 0));
        assert_eq!(normalize_clock_time("07:15:00").unwrap(), t(7, 15, 0));
        assert_eq!(normalize_clock_time("7:15").unwrap(), t(7, 15, 0));
        assert!(normalize_clock_time("quarter past seven").is_err());
        assert!(normalize_clock_time("13:00 PM").is_err());
    }

    #[test]
    fn route_start_accepts_timestamps() {
        assert_eq!(parse_route_start("06:10:00").unwrap(), t(6, 10, 0));
        assert_eq!(parse_route_start("2025-03-14T06:10:00").unwrap(), t(6, 10, 0));
        assert_eq!(parse_route_start("2025-03-14 06:10:00.000").unwrap(), t(6, 10, 0));
        assert!(parse_route_start("").is_err());
    }
}
