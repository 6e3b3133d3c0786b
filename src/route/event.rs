use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;

use super::{Waypoint, WaypointKind, WaypointStatus};

/// Identifiers of the route instance the backend assigned to this vehicle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteAssignment {
    /// Assignment code (`codasig`)
    pub assignment_code: String,
    /// Route code (`codruta`), selects stop list and timetable
    pub route_code: String,
    /// Vehicle identifier the backend tracks (`deviceID`)
    pub device_id: String,
    /// Driver code (`codconductor`)
    pub driver_code: String,
    /// Route start as sent by the backend (`fechaini`)
    pub started_at: String,
    /// Registration timestamp as sent by the backend (`fecreg`)
    pub registered_at: String,
    /// Hardware identifier allowed to report for this route (`androidID`)
    pub assigned_hardware_id: String,
    /// Parsed route start
    pub route_start: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Skipped,
}

/// Immutable fact: a waypoint reached a final status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionEvent {
    pub waypoint_id: String,
    pub waypoint_name: String,
    pub kind: WaypointKind,
    pub outcome: Outcome,
    pub scheduled_time: Option<NaiveTime>,
    pub actual_time: Option<NaiveDateTime>,
    pub duration: String,
    pub assignment: RouteAssignment,
    /// Hardware identifier of the device that observed the transition
    pub local_hardware_id: String,
}

impl CompletionEvent {
    /// Capture a waypoint that just reached a final status.
    ///
    /// Returns `None` for waypoints that are still open.
    pub fn capture(waypoint: &Waypoint, assignment: &RouteAssignment, local_hardware_id: &str) -> Option<Self> {
        let outcome = match waypoint.status {
            WaypointStatus::Completed => Outcome::Completed,
            WaypointStatus::Skipped => Outcome::Skipped,
            WaypointStatus::Pending | WaypointStatus::Active => return None,
        };

        Some(Self {
            waypoint_id: waypoint.id.clone(),
            waypoint_name: waypoint.name.clone(),
            kind: waypoint.kind,
            outcome,
            scheduled_time: waypoint.scheduled_time,
            actual_time: waypoint.actual_time,
            duration: waypoint.display_duration.clone(),
            assignment: assignment.clone(),
            local_hardware_id: local_hardware_id.to_string(),
        })
    }

    /// This device is the one assigned to report for the route
    pub fn is_authorized(&self) -> bool {
        self.assignment.assigned_hardware_id == self.local_hardware_id
    }
}
