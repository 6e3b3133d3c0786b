/// Fleet ranking
///
/// Orders every vehicle on a route by how far it still has to travel to the
/// route's anchor and estimates the headway, in minutes, between vehicles
/// that are next to each other in that order.
use std::time::Duration;

use geo::{Contains, LineString, Point, Polygon};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::DateroClient;
use crate::geo_math::{haversine_distance, Coordinate};
use crate::models::FleetVehicle;

/// Assumed closing speed between two buses
const MEETING_SPEED_KMH: f64 = 12.0;
/// Closer than this, two buses are considered one minute apart
const MEETING_FLOOR_KM: f64 = 0.1;

/// Area whose vehicles must pass through `via` before heading to the anchor
pub struct Zone {
    area: Polygon<f64>,
    via: Coordinate,
}

impl Zone {
    /// `ring` is (longitude, latitude) pairs
    fn new(ring: &[(f64, f64)], via: Coordinate) -> Self {
        Self {
            area: Polygon::new(LineString::from(ring.to_vec()), vec![]),
            via,
        }
    }

    pub fn contains(&self, position: Coordinate) -> bool {
        let (lon, lat) = position.lon_lat();
        self.area.contains(&Point::new(lon, lat))
    }
}

pub enum RankingProfile {
    /// Route through the via-point of the first zone containing the vehicle
    ViaZones { zones: Vec<Zone>, anchor: Coordinate },
    /// Straight to the anchor
    Direct { anchor: Coordinate },
}

impl RankingProfile {
    /// Ranking profile of a route code, `None` for routes without one
    pub fn for_route(route_code: &str) -> Option<Self> {
        match route_code.trim() {
            "5" => Some(Self::ViaZones {
                zones: vec![
                    Zone::new(
                        &[
                            (-77.119612, -12.063256),
                            (-77.10320485760168, -12.062187483161281),
                            (-77.103686, -12.085317),
                            (-77.123571, -12.074871),
                            (-77.119612, -12.063256),
                        ],
                        Coordinate::new(-12.063198, -77.104613),
                    ),
                    Zone::new(
                        &[
                            (-77.064769, -12.063818),
                            (-77.037979, -12.062651),
                            (-77.048257, -12.078347),
                            (-77.074629, -12.077401),
                            (-77.064769, -12.063818),
                        ],
                        Coordinate::new(-12.064717, -77.040597),
                    ),
                    Zone::new(
                        &[
                            (-77.080662, -12.059805),
                            (-77.073899, -12.059043),
                            (-77.07386, -12.074222),
                            (-77.080858, -12.074126),
                            (-77.080662, -12.059805),
                        ],
                        Coordinate::new(-12.07055, -77.077941),
                    ),
                ],
                anchor: Coordinate::new(-12.182918, -76.955801),
            }),
            "6" => Some(Self::Direct {
                anchor: Coordinate::new(-12.072085, -77.114060),
            }),
            _ => None,
        }
    }

    /// Distance left to the anchor in km, rounded to two decimals
    pub fn remaining_km(&self, position: Coordinate) -> f64 {
        let meters = match self {
            Self::ViaZones { zones, anchor } => match zones.iter().find(|z| z.contains(position)) {
                Some(zone) => leg_m(position, zone.via) + leg_m(zone.via, *anchor),
                None => leg_m(position, *anchor),
            },
            Self::Direct { anchor } => leg_m(position, *anchor),
        };
        round2(meters / 1000.0)
    }
}

fn leg_m(from: Coordinate, to: Coordinate) -> f64 {
    haversine_distance(from, to).round()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedVehicle {
    pub device_id: String,
    pub distance_km: f64,
    pub position: Coordinate,
    pub speed: f64,
    pub heading: String,
    pub is_own: bool,
    /// Minutes to the neighbour on the operator's side, 0 for the operator
    pub gap_minutes: Option<i64>,
}

/// Minutes for two buses to meet at the assumed closing speed
pub fn meeting_gap_minutes(a: Coordinate, b: Coordinate) -> i64 {
    let km = haversine_distance(a, b) / 1000.0;
    if km < MEETING_FLOOR_KM {
        return 1;
    }
    (km / MEETING_SPEED_KMH * 60.0).round() as i64
}

/// Sort the fleet by remaining distance and fill in headways around `own_device`
pub fn rank(profile: &RankingProfile, vehicles: Vec<FleetVehicle>, own_device: &str) -> Vec<RankedVehicle> {
    let mut ranked: Vec<RankedVehicle> = vehicles
        .into_iter()
        .filter(|v| v.latitude.is_finite() && v.longitude.is_finite())
        .map(|v| {
            let position = Coordinate::new(v.latitude, v.longitude);
            RankedVehicle {
                is_own: v.device_id.trim().eq_ignore_ascii_case(own_device.trim()),
                distance_km: profile.remaining_km(position),
                device_id: v.device_id,
                position,
                speed: v.speed,
                heading: v.heading,
                gap_minutes: None,
            }
        })
        .collect();

    ranked.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));

    if let Some(own) = ranked.iter().position(|v| v.is_own) {
        ranked[own].gap_minutes = Some(0);
        for i in (0..own).rev() {
            ranked[i].gap_minutes = Some(meeting_gap_minutes(ranked[i].position, ranked[i + 1].position));
        }
        for i in own + 1..ranked.len() {
            ranked[i].gap_minutes = Some(meeting_gap_minutes(ranked[i].position, ranked[i - 1].position));
        }
    }

    ranked
}

/// Up to `span` vehicles ahead of the operator and `span - 1` behind
pub fn visible_window(ranked: &[RankedVehicle], span: usize) -> &[RankedVehicle] {
    let Some(own) = ranked.iter().position(|v| v.is_own) else {
        return &[];
    };
    let start = own.saturating_sub(span);
    let end = (own + span).min(ranked.len());
    &ranked[start..end]
}

/// Periodically refreshes the ranking of one route
pub struct FleetMonitor {
    client: DateroClient,
    route_code: String,
    own_device: String,
    interval: Duration,
    ranking: watch::Sender<Vec<RankedVehicle>>,
}

impl FleetMonitor {
    pub fn spawn(
        client: DateroClient,
        route_code: &str,
        own_device: &str,
        interval: Duration,
    ) -> watch::Receiver<Vec<RankedVehicle>> {
        let (ranking, rx) = watch::channel(Vec::new());
        let monitor = Self {
            client,
            route_code: route_code.to_string(),
            own_device: own_device.to_string(),
            interval,
            ranking,
        };
        tokio::spawn(monitor.run());
        rx
    }

    async fn run(self) {
        let Some(profile) = RankingProfile::for_route(&self.route_code) else {
            warn!(route = %self.route_code, "No fleet ranking for route");
            return;
        };

        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;

            let ranked = match self.client.fetch_fleet(&self.route_code).await {
                Ok(vehicles) => rank(&profile, vehicles, &self.own_device),
                Err(e) => {
                    warn!(route = %self.route_code, error = %e, "Failed to fetch fleet");
                    Vec::new()
                }
            };
            debug!(route = %self.route_code, vehicles = ranked.len(), "Fleet ranking refreshed");

            if self.ranking.send(ranked).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle(id: &str, latitude: f64, longitude: f64) -> FleetVehicle {
        FleetVehicle {
            device_id: id.to_string(),
            latitude,
            longitude,
            speed: 20.0,
            heading: String::new(),
        }
    }

    #[test]
    fn zone_vehicle_goes_through_via_point() {
        let profile = RankingProfile::for_route("5").unwrap();
        let inside = Coordinate::new(-12.071, -77.112);
        let via = Coordinate::new(-12.063198, -77.104613);
        let anchor = Coordinate::new(-12.182918, -76.955801);

        let expected = round2((leg_m(inside, via) + leg_m(via, anchor)) / 1000.0);
        assert_eq!(profile.remaining_km(inside), expected);
        assert!(profile.remaining_km(inside) > round2(leg_m(inside, anchor) / 1000.0));
    }

    #[test]
    fn outside_zones_goes_straight() {
        let profile = RankingProfile::for_route("5").unwrap();
        let outside = Coordinate::new(-12.15, -76.98);
        let anchor = Coordinate::new(-12.182918, -76.955801);
        assert_eq!(profile.remaining_km(outside), round2(leg_m(outside, anchor) / 1000.0));
    }

    #[test]
    fn unknown_route_has_no_profile() {
        assert!(RankingProfile::for_route("7").is_none());
    }

    #[test]
    fn meeting_gap_floor_and_rounding() {
        let a = Coordinate::new(-12.0, -77.0);
        assert_eq!(meeting_gap_minutes(a, Coordinate::new(-12.0003, -77.0)), 1);

        // 0.018 degrees of latitude is about 2 km, i.e. 10 minutes at 12 km/h
        assert_eq!(meeting_gap_minutes(a, Coordinate::new(-12.018, -77.0)), 10);
    }

    #[test]
    fn ranking_sorts_and_propagates_gaps_from_own_vehicle() {
        let profile = RankingProfile::for_route("6").unwrap();
        let vehicles = vec![
            vehicle("FAR", -12.0, -77.114060),
            vehicle("near", -12.070, -77.114060),
            vehicle("MINE", -12.040, -77.114060),
        ];

        let ranked = rank(&profile, vehicles, "mine");
        let ids: Vec<&str> = ranked.iter().map(|v| v.device_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "MINE", "FAR"]);
        assert!(ranked[1].is_own);
        assert_eq!(ranked[1].gap_minutes, Some(0));
        // 0.03 degrees is about 3.3 km
        assert_eq!(ranked[0].gap_minutes, Some(17));
        // 0.04 degrees is about 4.4 km
        assert_eq!(ranked[2].gap_minutes, Some(22));
    }

    #[test]
    fn no_gaps_without_own_vehicle() {
        let profile = RankingProfile::for_route("6").unwrap();
        let ranked = rank(&profile, vec![vehicle("A", -12.0, -77.1)], "B");
        assert_eq!(ranked[0].gap_minutes, None);
        assert!(visible_window(&ranked, 3).is_empty());
    }

    #[test]
    fn window_around_own_vehicle() {
        let profile = RankingProfile::for_route("6").unwrap();
        let vehicles = (0..10)
            .map(|i| vehicle(&format!("V{i}"), -12.072085 + i as f64 * 0.01, -77.114060))
            .collect();

        let ranked = rank(&profile, vehicles, "V5");
        let window: Vec<&str> = visible_window(&ranked, 3)
            .iter()
            .map(|v| v.device_id.as_str())
            .collect();
        assert_eq!(window, vec!["V2", "V3", "V4", "V5", "V6", "V7"]);
    }
}
