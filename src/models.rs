/// Wire types of the dispatch backend
use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::route::{CompletionEvent, Outcome, RouteAssignment};
use crate::schedule::{self, ScheduleError, SKIPPED_SENTINEL};

/// The backend mixes numbers and strings for identifiers; accept both
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}

/// Response of the assignment lookup (`GET /urbano/{plate}`)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssignmentResponse {
    #[serde(deserialize_with = "string_or_number", default)]
    pub codigo: String,
    #[serde(deserialize_with = "string_or_number", default)]
    pub fechaini: String,
    #[serde(deserialize_with = "string_or_number", default)]
    pub fechafin: String,
    #[serde(deserialize_with = "string_or_number", default)]
    pub codruta: String,
    #[serde(rename = "deviceID", deserialize_with = "string_or_number", default)]
    pub device_id: String,
    #[serde(deserialize_with = "string_or_number", default)]
    pub isruta: String,
    #[serde(rename = "androidID", deserialize_with = "string_or_number", default)]
    pub android_id: String,
    #[serde(deserialize_with = "string_or_number", default)]
    pub fecreg: String,
    #[serde(deserialize_with = "string_or_number", default)]
    pub codconductor: String,
}

impl AssignmentResponse {
    /// A route is in progress for this vehicle
    pub fn is_active(&self) -> bool {
        self.isruta.trim() == "1"
    }

    pub fn into_assignment(self) -> Result<RouteAssignment, ScheduleError> {
        let route_start = schedule::parse_route_start(&self.fechaini)?;
        Ok(RouteAssignment {
            assignment_code: self.codigo,
            route_code: self.codruta,
            device_id: self.device_id,
            driver_code: self.codconductor,
            started_at: self.fechaini,
            registered_at: self.fecreg,
            assigned_hardware_id: self.android_id,
            route_start,
        })
    }
}

/// One previously reported control (`GET /logurb/{assignment}`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HistoryEntry {
    #[serde(deserialize_with = "string_or_number", default)]
    pub codasig: String,
    #[serde(deserialize_with = "string_or_number", default)]
    pub deviceid: String,
    #[serde(rename = "nom_control", deserialize_with = "string_or_number", default)]
    pub control_name: String,
    #[serde(rename = "hora_estimada", deserialize_with = "string_or_number", default)]
    pub estimated_time: String,
    #[serde(rename = "hora_llegada", deserialize_with = "string_or_number", default)]
    pub actual_time: String,
    /// Signed delay text, or the skipped sentinel
    #[serde(deserialize_with = "string_or_number", default)]
    pub volado: String,
    #[serde(deserialize_with = "string_or_number", default)]
    pub fecha: String,
}

impl HistoryEntry {
    pub fn is_skipped(&self) -> bool {
        self.volado.trim() == SKIPPED_SENTINEL
    }
}

/// Body of a completion report (`POST /enviocontrol`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub codasig: String,
    pub deviceid: String,
    pub codconductor: String,
    pub codruta: String,
    pub nom_control: String,
    pub hora_registro: String,
    pub hora_inicio: String,
    pub hora_estimada: String,
    pub hora_llegada: String,
    pub volado: String,
    pub fecha: String,
}

impl ControlPayload {
    /// Build the report for an event, stamped with the local send time.
    ///
    /// Skipped waypoints always carry the skipped sentinel so the backend
    /// history reads back as skipped.
    pub fn from_event(event: &CompletionEvent, sent_at: NaiveDateTime) -> Self {
        let assignment = &event.assignment;
        let volado = match event.outcome {
            Outcome::Skipped => SKIPPED_SENTINEL.to_string(),
            Outcome::Completed => event.duration.clone(),
        };

        Self {
            codasig: assignment.assignment_code.clone(),
            deviceid: assignment.device_id.clone(),
            codconductor: assignment.driver_code.clone(),
            codruta: assignment.route_code.clone(),
            nom_control: event.waypoint_name.clone(),
            hora_registro: assignment.registered_at.clone(),
            hora_inicio: assignment.started_at.clone(),
            hora_estimada: event
                .scheduled_time
                .map(|t| t.format("%H:%M").to_string())
                .unwrap_or_default(),
            hora_llegada: event
                .actual_time
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default(),
            volado,
            fecha: sent_at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        }
    }
}

/// Last known state of a fleet vehicle (`GET /ruta/{route}`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FleetVehicle {
    #[serde(rename = "deviceID", deserialize_with = "string_or_number", default)]
    pub device_id: String,
    #[serde(rename = "lastValidLatitude")]
    pub latitude: f64,
    #[serde(rename = "lastValidLongitude")]
    pub longitude: f64,
    #[serde(rename = "lastValidSpeed", default)]
    pub speed: f64,
    #[serde(rename = "direccion", deserialize_with = "string_or_number", default)]
    pub heading: String,
}
