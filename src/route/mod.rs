/// Route model
///
/// A route is an ordered list of waypoints built once per assignment. It is
/// never spliced in place: every transition clones the previous sequence,
/// mutates the clone and only swaps it in after the invariants hold.
use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::geo_math::{haversine_distance, Coordinate};

pub mod catalog;
pub mod event;
pub mod progress;

pub use event::{CompletionEvent, Outcome, RouteAssignment};
pub use progress::{PositionFix, ProgressSettings, RouteProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointKind {
    /// Scheduled stop where arrival is reported against a timetable
    ControlStop,
    /// Reference point between two control stops, no schedule
    IntermediateReference,
    /// Last scheduled stop of the route
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointStatus {
    Pending,
    Active,
    Completed,
    Skipped,
}

impl WaypointStatus {
    /// Completed and skipped are terminal
    pub fn is_final(&self) -> bool {
        matches!(self, WaypointStatus::Completed | WaypointStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WaypointStatus::Pending => "pending",
            WaypointStatus::Active => "active",
            WaypointStatus::Completed => "completed",
            WaypointStatus::Skipped => "skipped",
        }
    }
}

/// One stop or reference point on a route
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waypoint {
    /// Stable id; dotted sub-ids (`2.1`) are reference points between control stops
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: WaypointKind,
    /// Wall-clock arrival due time, `None` for intermediate references
    pub scheduled_time: Option<NaiveTime>,
    pub center: Coordinate,
    pub geofence_radius_m: f64,
    pub status: WaypointStatus,
    /// Local arrival time, set on completion
    pub actual_time: Option<NaiveDateTime>,
    pub display_duration: String,
    /// When an intermediate reference became active, used to measure dwell time
    pub activated_at: Option<NaiveDateTime>,
}

impl Waypoint {
    pub fn control(
        id: &str,
        name: &str,
        description: &str,
        scheduled_time: Option<NaiveTime>,
        center: Coordinate,
        geofence_radius_m: f64,
    ) -> Self {
        Self::new(id, name, description, WaypointKind::ControlStop, scheduled_time, center, geofence_radius_m)
    }

    pub fn intermediate(
        id: &str,
        name: &str,
        description: &str,
        center: Coordinate,
        geofence_radius_m: f64,
    ) -> Self {
        Self::new(id, name, description, WaypointKind::IntermediateReference, None, center, geofence_radius_m)
    }

    fn new(
        id: &str,
        name: &str,
        description: &str,
        kind: WaypointKind,
        scheduled_time: Option<NaiveTime>,
        center: Coordinate,
        geofence_radius_m: f64,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            kind,
            scheduled_time,
            center,
            geofence_radius_m,
            status: WaypointStatus::Pending,
            actual_time: None,
            display_duration: String::new(),
            activated_at: None,
        }
    }

    pub fn is_intermediate(&self) -> bool {
        self.kind == WaypointKind::IntermediateReference
    }

    /// Pending or active, i.e. still reachable
    pub fn is_open(&self) -> bool {
        !self.status.is_final()
    }

    pub fn distance_to(&self, position: Coordinate) -> f64 {
        haversine_distance(position, self.center)
    }

    /// Whether `position` lies inside this waypoint's geofence
    pub fn contains(&self, position: Coordinate) -> bool {
        self.distance_to(position) <= self.geofence_radius_m
    }

    /// Names are compared trimmed and case-insensitively; backend records
    /// carry stray whitespace.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.trim().eq_ignore_ascii_case(name.trim())
    }
}

/// Ordered sequence of waypoints for one route code
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    route_code: String,
    waypoints: Vec<Waypoint>,
}

impl Route {
    pub fn new(route_code: &str, waypoints: Vec<Waypoint>) -> Self {
        Self {
            route_code: route_code.to_string(),
            waypoints,
        }
    }

    pub fn route_code(&self) -> &str {
        &self.route_code
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub(crate) fn waypoints_mut(&mut self) -> &mut [Waypoint] {
        &mut self.waypoints
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Waypoint> {
        self.waypoints.get(index)
    }

    pub fn active_index(&self) -> Option<usize> {
        self.waypoints
            .iter()
            .position(|w| w.status == WaypointStatus::Active)
    }

    pub fn active(&self) -> Option<&Waypoint> {
        self.active_index().map(|index| &self.waypoints[index])
    }

    pub fn index_of_id(&self, id: &str) -> Option<usize> {
        self.waypoints.iter().position(|w| w.id == id)
    }

    pub fn index_of_name(&self, name: &str) -> Option<usize> {
        self.waypoints.iter().position(|w| w.matches_name(name))
    }

    /// First open waypoint strictly after `index`
    pub fn first_open_after(&self, index: usize) -> Option<usize> {
        self.waypoints
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, w)| w.is_open())
            .map(|(i, _)| i)
    }

    pub fn first_open(&self) -> Option<usize> {
        self.waypoints.iter().position(|w| w.is_open())
    }

    /// The last waypoint has reached a final status
    pub fn terminal_reached(&self) -> bool {
        self.waypoints
            .last()
            .map(|w| w.status.is_final())
            .unwrap_or(false)
    }

    /// No waypoint can transition any more
    pub fn is_finished(&self) -> bool {
        self.waypoints.iter().all(|w| w.status.is_final())
    }

    /// (completed, skipped, open) counts
    pub fn counts(&self) -> (usize, usize, usize) {
        let completed = self
            .waypoints
            .iter()
            .filter(|w| w.status == WaypointStatus::Completed)
            .count();
        let skipped = self
            .waypoints
            .iter()
            .filter(|w| w.status == WaypointStatus::Skipped)
            .count();
        (completed, skipped, self.waypoints.len() - completed - skipped)
    }

    /// Check the invariants every reachable route state must satisfy
    pub fn check_invariants(&self) -> Result<(), RouteError> {
        let active: Vec<String> = self
            .waypoints
            .iter()
            .filter(|w| w.status == WaypointStatus::Active)
            .map(|w| w.id.clone())
            .collect();

        if active.len() > 1 {
            return Err(RouteError::MultipleActive(active));
        }

        Ok(())
    }

    /// Check that `next` is a legal successor of this route: same waypoints
    /// in the same order, and no waypoint left a final status.
    pub fn check_successor(&self, next: &Route) -> Result<(), RouteError> {
        if self.route_code != next.route_code || self.waypoints.len() != next.waypoints.len() {
            return Err(RouteError::ShapeChanged);
        }

        for (before, after) in self.waypoints.iter().zip(&next.waypoints) {
            if before.id != after.id || before.scheduled_time != after.scheduled_time {
                return Err(RouteError::ShapeChanged);
            }
            if before.status.is_final() && after.status != before.status {
                return Err(RouteError::StatusRegression(before.id.clone()));
            }
        }

        next.check_invariants()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouteError {
    #[error("More than one active waypoint: {0:?}")]
    MultipleActive(Vec<String>),
    #[error("Waypoint {0} left a final status")]
    StatusRegression(String),
    #[error("Waypoint sequence changed shape")]
    ShapeChanged,
    #[error("Unknown waypoint: {0}")]
    UnknownWaypoint(String),
    #[error("Waypoint {0} is already {1}")]
    AlreadyFinal(String, &'static str),
    #[error("Invalid time: {0}")]
    InvalidTime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(statuses: &[WaypointStatus]) -> Route {
        let waypoints = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut w = Waypoint::control(
                    &(i + 1).to_string(),
                    &format!("STOP {}", i + 1),
                    "",
                    None,
                    Coordinate::new(-7.0 - i as f64 * 0.01, -78.5),
                    25.0,
                );
                w.status = *status;
                w
            })
            .collect();
        Route::new("9", waypoints)
    }

    use WaypointStatus::*;

    #[test]
    fn two_active_waypoints_violate_invariant() {
        let r = route(&[Active, Pending, Active]);
        assert_eq!(
            r.check_invariants(),
            Err(RouteError::MultipleActive(vec!["1".to_string(), "3".to_string()]))
        );
        assert!(route(&[Completed, Active, Pending]).check_invariants().is_ok());
        assert!(route(&[Completed, Skipped, Completed]).check_invariants().is_ok());
    }

    #[test]
    fn successor_may_not_reopen_final_waypoints() {
        let before = route(&[Completed, Active, Pending]);
        let after = route(&[Pending, Completed, Active]);
        assert_eq!(
            before.check_successor(&after),
            Err(RouteError::StatusRegression("1".to_string()))
        );

        let legal = route(&[Completed, Completed, Active]);
        assert!(before.check_successor(&legal).is_ok());
    }

    #[test]
    fn successor_must_keep_shape() {
        let before = route(&[Active, Pending]);
        let after = route(&[Active, Pending, Pending]);
        assert_eq!(before.check_successor(&after), Err(RouteError::ShapeChanged));
    }

    #[test]
    fn open_lookups() {
        let r = route(&[Completed, Pending, Skipped, Pending]);
        assert_eq!(r.first_open(), Some(1));
        assert_eq!(r.first_open_after(1), Some(3));
        assert_eq!(r.first_open_after(3), None);
        assert!(!r.terminal_reached());
        assert_eq!(r.counts(), (1, 1, 2));
    }

    #[test]
    fn name_matching_ignores_padding_and_case() {
        let mut w = route(&[Pending]).waypoints()[0].clone();
        w.name = "REAL PLAZA ".to_string();
        assert!(w.matches_name("real plaza"));
        assert!(!w.matches_name("REAL"));
    }
}
