/// Offset tables for scheduled arrivals
///
/// Each route code maps to rows keyed by the second-of-day at which the route
/// starts. A row applies to starts inside its half-open `[start, end)` window and
/// lists, per control stop, the minutes after the start at which the bus is due.
/// The spacing was measured on the street and widens as morning traffic builds.
use chrono::{NaiveTime, Timelike};

#[derive(Debug, Clone, Copy)]
pub struct OffsetRow {
    /// Second of day, inclusive
    pub start: u32,
    /// Second of day, exclusive
    pub end: u32,
    /// Minutes after the route start, one entry per control stop
    pub minutes: &'static [i64],
}

impl OffsetRow {
    pub fn covers(&self, second_of_day: u32) -> bool {
        second_of_day >= self.start && second_of_day < self.end
    }
}

const fn hms(h: u32, m: u32, s: u32) -> u32 {
    h * 3600 + m * 60 + s
}

const fn row(start: u32, end: u32, minutes: &'static [i64]) -> OffsetRow {
    OffsetRow {
        start,
        end,
        minutes,
    }
}

/// Route 5, LA PERLA - SAN JUAN
pub static ROUTE_5: &[OffsetRow] = &[
    row(hms(6, 0, 0), hms(6, 8, 0), &[9, 36, 52, 68, 85, 115, 123]),
    row(hms(6, 8, 0), hms(6, 15, 0), &[10, 36, 53, 69, 87, 117, 125]),
    row(hms(6, 15, 0), hms(6, 22, 0), &[10, 37, 54, 70, 88, 118, 123]),
    row(hms(6, 22, 0), hms(6, 29, 0), &[10, 39, 56, 72, 90, 120, 130]),
    row(hms(6, 29, 0), hms(6, 36, 0), &[10, 41, 58, 74, 92, 122, 132]),
    row(hms(6, 36, 0), hms(6, 43, 0), &[11, 44, 60, 76, 93, 123, 133]),
    row(hms(6, 43, 0), hms(6, 44, 0), &[12, 45, 64, 85, 105, 137, 147]),
];

/// Route 6, SAN JUAN - LA PERLA
pub static ROUTE_6: &[OffsetRow] = &[
    row(hms(4, 55, 0), hms(5, 2, 0), &[4, 13, 32, 46, 56, 76, 96]),
    row(hms(5, 2, 0), hms(5, 9, 0), &[4, 13, 32, 46, 57, 77, 97]),
    row(hms(5, 9, 0), hms(5, 15, 0), &[4, 13, 33, 47, 57, 77, 97]),
    row(hms(5, 15, 0), hms(5, 20, 0), &[4, 13, 34, 48, 58, 78, 98]),
    row(hms(5, 20, 0), hms(5, 25, 0), &[4, 13, 34, 49, 60, 80, 100]),
    row(hms(5, 25, 0), hms(5, 30, 0), &[4, 13, 35, 50, 62, 82, 102]),
    row(hms(5, 30, 0), hms(5, 35, 0), &[4, 13, 35, 51, 62, 82, 102]),
    row(hms(5, 35, 0), hms(5, 40, 0), &[4, 13, 35, 51, 62, 83, 103]),
    row(hms(5, 40, 0), hms(5, 45, 0), &[4, 13, 36, 52, 62, 83, 103]),
    row(hms(5, 45, 0), hms(5, 50, 0), &[4, 13, 38, 53, 63, 84, 104]),
    row(hms(5, 50, 0), hms(5, 55, 0), &[5, 14, 38, 54, 64, 85, 105]),
    row(hms(5, 55, 0), hms(6, 0, 0), &[5, 15, 39, 55, 65, 87, 107]),
    row(hms(6, 0, 0), hms(6, 5, 0), &[5, 15, 40, 56, 66, 88, 108]),
    row(hms(6, 5, 0), hms(6, 10, 0), &[5, 15, 41, 58, 68, 90, 110]),
    row(hms(6, 10, 0), hms(6, 15, 0), &[5, 15, 41, 59, 69, 92, 112]),
    row(hms(6, 15, 0), hms(6, 20, 0), &[5, 15, 42, 60, 70, 94, 114]),
    row(hms(6, 20, 0), hms(6, 25, 0), &[5, 15, 43, 61, 71, 96, 116]),
    row(hms(6, 25, 0), hms(6, 30, 0), &[5, 15, 44, 63, 73, 98, 118]),
    row(hms(6, 30, 0), hms(6, 35, 0), &[5, 15, 45, 64, 74, 100, 120]),
    row(hms(6, 35, 0), hms(6, 40, 0), &[5, 15, 46, 66, 76, 102, 122]),
    row(hms(6, 40, 0), hms(6, 45, 0), &[5, 15, 47, 67, 78, 105, 125]),
    row(hms(6, 45, 0), hms(6, 50, 0), &[5, 15, 48, 68, 80, 107, 127]),
    row(hms(6, 50, 0), hms(6, 55, 0), &[5, 15, 48, 68, 82, 110, 130]),
    row(hms(6, 55, 0), hms(7, 0, 0), &[5, 15, 48, 68, 84, 112, 132]),
    row(hms(7, 0, 0), hms(7, 5, 0), &[5, 15, 48, 68, 85, 115, 135]),
    row(hms(7, 5, 0), hms(7, 10, 0), &[5, 15, 48, 68, 86, 116, 136]),
    row(hms(7, 10, 0), hms(7, 15, 0), &[5, 15, 48, 68, 87, 117, 137]),
    row(hms(7, 15, 0), hms(7, 20, 0), &[5, 15, 48, 68, 88, 118, 138]),
    row(hms(7, 20, 0), hms(7, 25, 0), &[5, 15, 48, 68, 88, 118, 138]),
    row(hms(7, 25, 0), hms(7, 26, 0), &[5, 15, 48, 72, 92, 122, 142]),
];

/// Flat spacing for routes without a measured table
pub static DEFAULT: &[OffsetRow] = &[row(0, hms(24, 0, 0), &[2, 8, 13, 19, 25, 30])];

/// Rows for a route code
pub fn table_for(route_code: &str) -> &'static [OffsetRow] {
    match route_code.trim() {
        "5" => ROUTE_5,
        "6" => ROUTE_6,
        _ => DEFAULT,
    }
}

/// Offsets for a route starting at `route_start`.
///
/// Starts outside every window saturate to the last row.
pub fn offsets_for(route_code: &str, route_start: NaiveTime) -> &'static [i64] {
    let table = table_for(route_code);
    let second_of_day = route_start.num_seconds_from_midnight();

    table
        .iter()
        .find(|row| row.covers(second_of_day))
        .or_else(|| table.last())
        .map(|row| row.minutes)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn tables_are_contiguous_and_ordered() {
        for table in [ROUTE_5, ROUTE_6] {
            for pair in table.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
                assert!(pair[0].start < pair[0].end);
            }
        }
    }

    #[test]
    fn route_5_window_boundaries() {
        assert_eq!(offsets_for("5", t(6, 10, 0))[0], 10);
        assert_eq!(offsets_for("5", t(6, 7, 59))[0], 9);
        assert_eq!(offsets_for("5", t(6, 8, 0))[1], 36);
        assert_eq!(offsets_for("5", t(6, 14, 59))[2], 53);
        assert_eq!(offsets_for("5", t(6, 15, 0))[2], 54);
    }

    #[test]
    fn out_of_window_saturates_to_last_row() {
        assert_eq!(offsets_for("5", t(5, 0, 0)), &[12, 45, 64, 85, 105, 137, 147]);
        assert_eq!(offsets_for("5", t(9, 0, 0)), &[12, 45, 64, 85, 105, 137, 147]);
        assert_eq!(offsets_for("6", t(8, 0, 0)), &[5, 15, 48, 72, 92, 122, 142]);
    }

    #[test]
    fn unknown_route_uses_default_spacing() {
        assert_eq!(offsets_for("12", t(6, 0, 0)), &[2, 8, 13, 19, 25, 30]);
    }
}
