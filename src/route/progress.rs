/// Route progress state machine
///
/// Owns the waypoint sequence of the current assignment and turns position
/// fixes, operator input and timer ticks into completion events. It never
/// talks to the network; events are returned to the caller.
use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::catalog;
use super::event::{CompletionEvent, RouteAssignment};
use super::{Route, RouteError, WaypointStatus};
use crate::geo_math::Coordinate;
use crate::models::HistoryEntry;
use crate::schedule;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSettings {
    pub geofence_radius_m: f64,
    /// Dwell time after which an active intermediate reference is abandoned
    pub intermediate_timeout: Option<Duration>,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            geofence_radius_m: 25.0,
            intermediate_timeout: Some(Duration::minutes(10)),
        }
    }
}

/// One sample of the position feed
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PositionFix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp: None,
        }
    }

    /// The receiver reports a zero coordinate when it has no fix
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite() && self.latitude != 0.0 && self.longitude != 0.0
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

pub struct RouteProgress {
    assignment: RouteAssignment,
    local_hardware_id: String,
    settings: ProgressSettings,
    route: Route,
}

impl RouteProgress {
    /// Build the route for an assignment and replay the server history onto it
    pub fn new(
        assignment: RouteAssignment,
        local_hardware_id: &str,
        settings: ProgressSettings,
        history: &[HistoryEntry],
        now: NaiveDateTime,
    ) -> Self {
        let route = build_from_history(&assignment, settings, history, now);

        let progress = Self {
            assignment,
            local_hardware_id: local_hardware_id.to_string(),
            settings,
            route,
        };

        if progress.is_view_only() {
            warn!(
                assigned = %progress.assignment.assigned_hardware_id,
                local = %progress.local_hardware_id,
                "Device is not assigned to this route, reports will be refused"
            );
        }
        progress
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn assignment(&self) -> &RouteAssignment {
        &self.assignment
    }

    pub fn local_hardware_id(&self) -> &str {
        &self.local_hardware_id
    }

    /// Events are still produced but delivery will refuse them
    pub fn is_view_only(&self) -> bool {
        self.assignment.assigned_hardware_id != self.local_hardware_id
    }

    /// Rebuild from scratch for a new assignment
    pub fn replace_assignment(&mut self, assignment: RouteAssignment, history: &[HistoryEntry], now: NaiveDateTime) {
        info!(
            assignment = %assignment.assignment_code,
            route = %assignment.route_code,
            "Assignment changed, rebuilding route"
        );
        self.route = build_from_history(&assignment, self.settings, history, now);
        self.assignment = assignment;
    }

    /// Rebuild from scratch after the server history changed
    pub fn replace_history(&mut self, history: &[HistoryEntry], now: NaiveDateTime) {
        self.route = build_from_history(&self.assignment, self.settings, history, now);
    }

    /// Apply a position fix. At most one waypoint transitions per fix.
    pub fn on_position(&mut self, fix: &PositionFix, now: NaiveDateTime) -> Option<CompletionEvent> {
        if !fix.is_valid() {
            debug!(lat = fix.latitude, lon = fix.longitude, "Ignoring position without fix");
            return None;
        }
        let position = fix.coordinate();

        let index = self
            .route
            .waypoints()
            .iter()
            .position(|w| w.is_open() && w.contains(position))?;

        let mut next = self.route.clone();
        {
            let waypoint = &mut next.waypoints_mut()[index];
            waypoint.status = WaypointStatus::Completed;
            waypoint.actual_time = Some(truncate_to_second(now));
            waypoint.display_duration = schedule::compute_duration(waypoint, now);
        }
        advance_after(&mut next, index, now);

        self.commit(next, index)
    }

    /// Operator marks a waypoint as reached at a given clock time
    pub fn complete_manually(
        &mut self,
        waypoint_id: &str,
        clock_time: &str,
        now: NaiveDateTime,
    ) -> Result<CompletionEvent, RouteError> {
        let index = self
            .route
            .index_of_id(waypoint_id)
            .ok_or_else(|| RouteError::UnknownWaypoint(waypoint_id.to_string()))?;

        let current = &self.route.waypoints()[index];
        if current.status.is_final() {
            return Err(RouteError::AlreadyFinal(current.id.clone(), current.status.as_str()));
        }

        let time = schedule::normalize_clock_time(clock_time).map_err(|e| RouteError::InvalidTime(e.to_string()))?;

        let mut next = self.route.clone();
        {
            let waypoint = &mut next.waypoints_mut()[index];
            waypoint.status = WaypointStatus::Completed;
            waypoint.actual_time = Some(schedule::on_date(now.date(), time));
            waypoint.display_duration = schedule::compute_duration(waypoint, now);
        }
        advance_after(&mut next, index, now);

        next_checked(&self.route, &next)?;
        self.route = next;
        let waypoint = &self.route.waypoints()[index];
        info!(waypoint = %waypoint.name, time = %time, "Waypoint completed manually");
        CompletionEvent::capture(waypoint, &self.assignment, &self.local_hardware_id)
            .ok_or_else(|| RouteError::UnknownWaypoint(waypoint_id.to_string()))
    }

    /// Once-per-second housekeeping: abandon an intermediate reference that
    /// dwelled too long, otherwise refresh the active waypoint's duration.
    pub fn tick(&mut self, now: NaiveDateTime) -> Option<CompletionEvent> {
        let index = self.route.active_index()?;

        if let Some(event) = self.expire_intermediate(index, now) {
            return Some(event);
        }

        let waypoint = &mut self.route.waypoints_mut()[index];
        waypoint.display_duration = schedule::compute_duration(waypoint, now);
        None
    }

    fn expire_intermediate(&mut self, index: usize, now: NaiveDateTime) -> Option<CompletionEvent> {
        let timeout = self.settings.intermediate_timeout?;
        let waypoint = &self.route.waypoints()[index];
        if !waypoint.is_intermediate() {
            return None;
        }
        let activated_at = waypoint.activated_at?;
        if now - activated_at < timeout {
            return None;
        }

        let mut next = self.route.clone();
        {
            let waypoint = &mut next.waypoints_mut()[index];
            waypoint.status = WaypointStatus::Skipped;
            waypoint.display_duration = schedule::compute_duration(waypoint, now);
        }
        advance_after(&mut next, index, now);

        self.commit(next, index)
    }

    /// Swap in a successor route, or keep the current one if it is illegal
    fn commit(&mut self, next: Route, index: usize) -> Option<CompletionEvent> {
        if let Err(e) = next_checked(&self.route, &next) {
            error!(error = %e, "Rejected route transition");
            return None;
        }
        self.route = next;

        let waypoint = &self.route.waypoints()[index];
        info!(
            waypoint = %waypoint.name,
            id = %waypoint.id,
            status = waypoint.status.as_str(),
            duration = %waypoint.display_duration,
            "Waypoint transition"
        );
        CompletionEvent::capture(waypoint, &self.assignment, &self.local_hardware_id)
    }
}

fn next_checked(current: &Route, next: &Route) -> Result<(), RouteError> {
    current.check_successor(next)
}

fn truncate_to_second(time: NaiveDateTime) -> NaiveDateTime {
    time.with_nanosecond(0).unwrap_or(time)
}

/// Deactivate everything, then activate the first open waypoint after `index`
fn advance_after(route: &mut Route, index: usize, now: NaiveDateTime) {
    deactivate_all(route);
    if let Some(next) = route.first_open_after(index) {
        activate(route, next, now);
    }
}

fn deactivate_all(route: &mut Route) {
    for waypoint in route.waypoints_mut() {
        if waypoint.status == WaypointStatus::Active {
            waypoint.status = WaypointStatus::Pending;
            waypoint.activated_at = None;
            waypoint.display_duration.clear();
        }
    }
}

fn activate(route: &mut Route, index: usize, now: NaiveDateTime) {
    let waypoint = &mut route.waypoints_mut()[index];
    waypoint.status = WaypointStatus::Active;
    if waypoint.is_intermediate() {
        waypoint.activated_at = Some(now);
    }
    waypoint.display_duration = schedule::compute_duration(waypoint, now);
}

/// Build the pristine route and replay the reported history onto it
fn build_from_history(
    assignment: &RouteAssignment,
    settings: ProgressSettings,
    history: &[HistoryEntry],
    now: NaiveDateTime,
) -> Route {
    let mut route = catalog::build_route(&assignment.route_code, assignment.route_start, settings.geofence_radius_m);
    if route.is_empty() {
        warn!(route = %assignment.route_code, "No stop list for route");
        return route;
    }

    let mut highest: Option<usize> = None;

    for entry in history {
        let Some(index) = route.index_of_name(&entry.control_name) else {
            warn!(control = %entry.control_name, "History entry matches no waypoint");
            continue;
        };

        let waypoint = &mut route.waypoints_mut()[index];
        if entry.is_skipped() {
            waypoint.status = WaypointStatus::Skipped;
            waypoint.actual_time = None;
        } else {
            waypoint.status = WaypointStatus::Completed;
            waypoint.actual_time = schedule::normalize_clock_time(&entry.actual_time)
                .ok()
                .map(|time| schedule::on_date(now.date(), time));
        }

        if waypoint.is_intermediate() {
            waypoint.scheduled_time = None;
            waypoint.display_duration.clear();
        } else {
            if let Ok(time) = schedule::normalize_clock_time(&entry.estimated_time) {
                waypoint.scheduled_time = Some(time);
            }
            waypoint.display_duration = entry.volado.trim().to_string();
        }

        highest = Some(highest.map_or(index, |h: usize| h.max(index)));
    }

    deactivate_all(&mut route);
    let next = match highest {
        Some(h) => route.first_open_after(h).or_else(|| route.first_open()),
        None => route.first_open(),
    };
    if let Some(next) = next {
        activate(&mut route, next, now);
    }

    if let Err(e) = route.check_invariants() {
        error!(error = %e, "Route rebuilt from history violates invariants");
    }

    let (completed, skipped, open) = route.counts();
    info!(
        route = %assignment.route_code,
        completed,
        skipped,
        open,
        active = ?route.active().map(|w| w.name.as_str()),
        "Route built from history"
    );
    route
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{INTERMEDIATE_COMPLETED, INTERMEDIATE_TIMED_OUT, SKIPPED_SENTINEL};
    use chrono::{NaiveDate, NaiveTime};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn assignment(route_code: &str) -> RouteAssignment {
        RouteAssignment {
            assignment_code: "9912".to_string(),
            route_code: route_code.to_string(),
            device_id: "W1234".to_string(),
            driver_code: "77".to_string(),
            started_at: "05:00:00".to_string(),
            registered_at: "2025-03-14T04:50:00".to_string(),
            assigned_hardware_id: "hw-1".to_string(),
            route_start: NaiveTime::from_hms_opt(5, 0, 0).unwrap(),
        }
    }

    fn entry(name: &str, estimated: &str, actual: &str, volado: &str) -> HistoryEntry {
        HistoryEntry {
            codasig: "9912".to_string(),
            deviceid: "W1234".to_string(),
            control_name: name.to_string(),
            estimated_time: estimated.to_string(),
            actual_time: actual.to_string(),
            volado: volado.to_string(),
            fecha: String::new(),
        }
    }

    fn progress(history: &[HistoryEntry]) -> RouteProgress {
        RouteProgress::new(assignment("6"), "hw-1", ProgressSettings::default(), history, at(5, 0, 0))
    }

    fn fix_at(progress: &RouteProgress, id: &str) -> PositionFix {
        let index = progress.route().index_of_id(id).unwrap();
        let center = progress.route().waypoints()[index].center;
        PositionFix::new(center.latitude, center.longitude)
    }

    fn active_count(route: &Route) -> usize {
        route
            .waypoints()
            .iter()
            .filter(|w| w.status == WaypointStatus::Active)
            .count()
    }

    #[test]
    fn fresh_route_activates_first_stop() {
        let p = progress(&[]);
        assert_eq!(p.route().active_index(), Some(0));
        assert_eq!(active_count(p.route()), 1);
        assert!(!p.is_view_only());
    }

    #[test]
    fn skipped_stop_in_history_does_not_become_active() {
        let history = vec![
            entry("UNC", "05:02", "05:01:40", "-20seg"),
            entry("OVALO MUSICAL", "05:08", "", SKIPPED_SENTINEL),
            entry("MAESTRO", "05:13", "05:14:05", "+1min 5seg"),
        ];
        let p = progress(&history);
        let route = p.route();

        assert_eq!(route.waypoints()[1].status, WaypointStatus::Skipped);
        assert_eq!(route.waypoints()[1].display_duration, SKIPPED_SENTINEL);
        // The reference point between the two stays pending
        assert_eq!(route.waypoints()[2].status, WaypointStatus::Pending);
        assert_eq!(route.active_index(), Some(4));
        assert_eq!(route.waypoints()[3].actual_time, Some(at(5, 14, 5)));
        assert_eq!(route.waypoints()[3].display_duration, "+1min 5seg");
    }

    #[test]
    fn rebuilding_from_same_history_is_deterministic() {
        let history = vec![
            entry(" unc ", "05:02", "05:01:40", "-20seg"),
            entry("MAESTRO", "05:13", "05:14:05", "+1min 5seg"),
            entry("NOT A STOP", "05:20", "05:20:00", "0seg"),
        ];
        let mut p = progress(&history);
        let first = p.route().active_index();
        p.replace_history(&history, at(5, 30, 0));
        assert_eq!(p.route().active_index(), first);
        assert_eq!(first, Some(4));
    }

    #[test]
    fn history_overrides_computed_schedule() {
        let p = progress(&[entry("UNC", "05:04", "05:05:00", "+1min")]);
        assert_eq!(
            p.route().waypoints()[0].scheduled_time,
            Some(NaiveTime::from_hms_opt(5, 4, 0).unwrap())
        );
    }

    #[test]
    fn fully_reported_history_leaves_nothing_active() {
        let p = progress(&[]);
        let names: Vec<String> = p.route().waypoints().iter().map(|w| w.name.clone()).collect();
        let history: Vec<HistoryEntry> = names
            .iter()
            .map(|name| entry(name, "05:02", "05:02:00", "0seg"))
            .collect();

        let done = progress(&history);
        assert_eq!(done.route().active_index(), None);
        assert!(done.route().is_finished());
        assert!(done.route().terminal_reached());
    }

    #[test]
    fn entering_geofence_completes_and_advances() {
        let mut p = progress(&[]);
        let fix = fix_at(&p, "1");

        let event = p.on_position(&fix, at(5, 1, 40)).unwrap();
        assert_eq!(event.waypoint_id, "1");
        assert_eq!(event.duration, "-2min 20seg");
        assert_eq!(event.actual_time, Some(at(5, 1, 40)));
        assert_eq!(p.route().active_index(), Some(1));
        assert_eq!(active_count(p.route()), 1);
    }

    #[test]
    fn same_position_twice_transitions_once() {
        let mut p = progress(&[]);
        let fix = fix_at(&p, "1");

        assert!(p.on_position(&fix, at(5, 1, 0)).is_some());
        assert!(p.on_position(&fix, at(5, 1, 1)).is_none());
        assert_eq!(p.route().counts().0, 1);
    }

    #[test]
    fn a_single_zero_coordinate_means_no_fix() {
        assert!(PositionFix::new(-7.165555, -78.496362).is_valid());
        assert!(!PositionFix::new(-7.165555, 0.0).is_valid());
        assert!(!PositionFix::new(0.0, -78.496362).is_valid());
    }

    #[test]
    fn far_and_invalid_positions_do_nothing() {
        let mut p = progress(&[]);
        let before = p.route().clone();

        assert!(p.on_position(&PositionFix::new(0.0, 0.0), at(5, 1, 0)).is_none());
        assert!(p.on_position(&PositionFix::new(-7.165555, 0.0), at(5, 1, 0)).is_none());
        assert!(p.on_position(&PositionFix::new(0.0, -78.496362), at(5, 1, 0)).is_none());
        assert!(p.on_position(&PositionFix::new(f64::NAN, -78.5), at(5, 1, 0)).is_none());
        assert!(p.on_position(&PositionFix::new(-12.0, -77.0), at(5, 1, 0)).is_none());
        assert_eq!(p.route(), &before);
    }

    #[test]
    fn jumping_ahead_leaves_earlier_stops_pending() {
        let mut p = progress(&[]);
        let fix = fix_at(&p, "4");

        let event = p.on_position(&fix, at(5, 20, 0)).unwrap();
        assert_eq!(event.waypoint_id, "4");
        assert_eq!(p.route().waypoints()[0].status, WaypointStatus::Pending);
        assert_eq!(p.route().active().unwrap().id, "5");
    }

    #[test]
    fn completed_intermediate_reports_completado() {
        let mut p = progress(&[]);
        let fix = fix_at(&p, "2.3");

        let event = p.on_position(&fix, at(5, 10, 0)).unwrap();
        assert_eq!(event.duration, INTERMEDIATE_COMPLETED);
        assert_eq!(event.scheduled_time, None);
    }

    #[test]
    fn manual_completion_accepts_twelve_hour_input() {
        let mut p = progress(&[]);

        let event = p.complete_manually("1", "5:03:10 a. m.", at(5, 4, 0)).unwrap();
        assert_eq!(event.actual_time, Some(at(5, 3, 10)));
        assert_eq!(event.duration, "-50seg");
        assert_eq!(p.route().active().unwrap().id, "2");

        assert_eq!(
            p.complete_manually("1", "05:05", at(5, 5, 0)),
            Err(RouteError::AlreadyFinal("1".to_string(), "completed"))
        );
        assert!(matches!(
            p.complete_manually("99", "05:05", at(5, 5, 0)),
            Err(RouteError::UnknownWaypoint(_))
        ));
        assert!(matches!(
            p.complete_manually("2", "soon", at(5, 5, 0)),
            Err(RouteError::InvalidTime(_))
        ));
    }

    #[test]
    fn intermediate_times_out_and_is_skipped() {
        let history = vec![
            entry("UNC", "05:02", "05:02:00", "0seg"),
            entry("OVALO MUSICAL", "05:08", "05:08:00", "0seg"),
        ];
        let mut p = RouteProgress::new(assignment("6"), "hw-1", ProgressSettings::default(), &history, at(5, 9, 0));
        assert_eq!(p.route().active().unwrap().id, "2.3");

        assert!(p.tick(at(5, 18, 59)).is_none());
        let event = p.tick(at(5, 19, 0)).unwrap();
        assert_eq!(event.waypoint_id, "2.3");
        assert_eq!(event.duration, INTERMEDIATE_TIMED_OUT);
        assert_eq!(p.route().waypoints()[2].status, WaypointStatus::Skipped);
        assert_eq!(p.route().active().unwrap().id, "3");
    }

    #[test]
    fn tick_refreshes_live_delay() {
        let mut p = progress(&[]);
        assert!(p.tick(at(5, 3, 59)).is_none());
        assert_eq!(p.route().active().unwrap().display_duration, "");
        assert!(p.tick(at(5, 5, 5)).is_none());
        assert_eq!(p.route().active().unwrap().display_duration, "+1:05");
    }

    #[test]
    fn unassigned_device_still_tracks_progress() {
        let mut p = RouteProgress::new(assignment("6"), "hw-other", ProgressSettings::default(), &[], at(5, 0, 0));
        assert!(p.is_view_only());

        let fix = fix_at(&p, "1");
        let event = p.on_position(&fix, at(5, 2, 0)).unwrap();
        assert!(!event.is_authorized());
    }

    #[test]
    fn unknown_route_has_no_waypoints() {
        let mut p = RouteProgress::new(assignment("42"), "hw-1", ProgressSettings::default(), &[], at(5, 0, 0));
        assert!(p.route().is_empty());
        assert!(p.tick(at(5, 1, 0)).is_none());
        assert!(p.on_position(&PositionFix::new(-7.1, -78.5), at(5, 1, 0)).is_none());
    }
}
