use serde::{Deserialize, Serialize};

/// Earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// WGS84 coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Coordinate as `(x, y)` = `(lon, lat)`, the order geometry libraries expect
    pub fn lon_lat(&self) -> (f64, f64) {
        (self.longitude, self.latitude)
    }
}

/// Calculate distance between two coordinates using Haversine formula
/// Returns distance in meters
pub fn haversine_distance(from: Coordinate, to: Coordinate) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let delta_lat = (to.latitude - from.latitude).to_radians();
    let delta_lon = (to.longitude - from.longitude).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);

    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}
