/// Fixed stop lists per route code
use chrono::NaiveTime;

use super::{Route, Waypoint, WaypointKind};
use crate::geo_math::Coordinate;
use crate::schedule;

/// Static description of a stop before a schedule is attached
struct StopSpec {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    latitude: f64,
    longitude: f64,
    intermediate: bool,
}

const fn control(id: &'static str, name: &'static str, description: &'static str, latitude: f64, longitude: f64) -> StopSpec {
    StopSpec {
        id,
        name,
        description,
        latitude,
        longitude,
        intermediate: false,
    }
}

const fn reference(id: &'static str, name: &'static str, description: &'static str, latitude: f64, longitude: f64) -> StopSpec {
    StopSpec {
        id,
        name,
        description,
        latitude,
        longitude,
        intermediate: true,
    }
}

static ROUTE_5: &[StopSpec] = &[
    control("1", "METRO ANGAMOS", "Punto de Inicio", -7.148202, -78.524142),
    control("2", "CHANCHAMAYO", "Control 1", -7.147637, -78.522551),
    reference("2.1", "LA CENA", "Punto Referencia", -7.146683, -78.521093),
    control("3", "PARQUE SOMBRERO", "Punto de Inicio", -7.147526, -78.520503),
    reference("4.1", "CHEPEN", "Punto Referencia", -7.149042, -78.518761),
    control("5", "EL GRAN CHEF", "Control 1", -7.146014, -78.518702),
    reference("6.1", "REPSOL", "Punto Referencia", -7.145605, -78.516017),
    control("7", "BIKER PLANER", "Punto de Inicio", -7.145223, -78.509451),
    reference("7.1", "REAL PLAZA ", "Punto Referencia", -7.154644, -78.506331),
    control("8", "GRIFO", "Punto de Inicio", -7.154644, -78.506331),
    control("9", "LINEA", "Control 1", -7.165613, -78.499419),
];

static ROUTE_6: &[StopSpec] = &[
    control("1", "UNC", "Punto de inicio", -7.165555, -78.496362),
    control("2", "OVALO MUSICAL", "Paradero 1", -7.165588, -78.502314),
    reference("2.3", "PI 1", "PI 02 Tiendas Efe", -7.165458, -78.508561),
    control("3", "MAESTRO", "Paradero 2", -7.161996, -78.504526),
    control("4", "GYM IMPERIO", "Paradero 3", -7.158236, -78.506438),
    control("5", "OPEN", "Paradero 4", -7.151312, -78.506442),
    control("6", "CASA DIEGO", "Paradero 5", -7.151252, -78.501388),
];

fn stops_for(route_code: &str) -> &'static [StopSpec] {
    match route_code.trim() {
        "5" => ROUTE_5,
        "6" => ROUTE_6,
        _ => &[],
    }
}

/// Human readable label of a route code
pub fn route_label(route_code: &str) -> &'static str {
    match route_code.trim() {
        "5" => "LA PERLA - SAN JUAN (A)",
        "6" => "SAN JUAN - LA PERLA (B)",
        _ => "desconocida",
    }
}

/// Build the pristine route for a code and start time.
///
/// Control stops take scheduled times in order; reference points get none.
/// The last stop is the terminal. Unknown codes yield an empty route.
pub fn build_route(route_code: &str, route_start: NaiveTime, geofence_radius_m: f64) -> Route {
    let mut control_index = 0;
    let specs = stops_for(route_code);
    let last = specs.len().saturating_sub(1);

    let waypoints = specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let center = Coordinate::new(spec.latitude, spec.longitude);
            if spec.intermediate {
                return Waypoint::intermediate(spec.id, spec.name, spec.description, center, geofence_radius_m);
            }

            let scheduled = schedule::scheduled_time_of(control_index, route_start, route_code);
            control_index += 1;

            let mut waypoint = Waypoint::control(spec.id, spec.name, spec.description, scheduled, center, geofence_radius_m);
            if i == last {
                waypoint.kind = WaypointKind::Terminal;
            }
            waypoint
        })
        .collect();

    Route::new(route_code, waypoints)
}
