//! Relay endpoint selection

use serde::{Deserialize, Serialize};

/// Mean earth radius in meters
const EARTH_RADIUS_M: f64 = 6371e3;

/// A point on the globe in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance in meters (haversine)
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        let p1 = self.lat.to_radians();
        let p2 = other.lat.to_radians();
        let delta_p = p2 - p1;
        let delta_lambda = (other.lng - self.lng).to_radians();

        let a = (delta_p / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (delta_lambda / 2.0).sin().powi(2);
        2.0 * a.sqrt().atan2((1.0 - a).sqrt()) * EARTH_RADIUS_M
    }
}

/// A relay a session can connect to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub url: String,
    pub location: GeoPoint,
    #[serde(default)]
    pub zone: String,
}

/// Pick the relay closest to `position`
///
/// Ties keep the first relay in list order. Relays with non-finite
/// coordinates are skipped.
pub fn nearest_relay<'a>(position: &GeoPoint, relays: &'a [RelayEndpoint]) -> Option<&'a RelayEndpoint> {
    relays
        .iter()
        .map(|relay| (relay, position.distance_to(&relay.location)))
        .filter(|(_, distance)| distance.is_finite())
        .fold(None, |best: Option<(&RelayEndpoint, f64)>, (relay, distance)| match best {
            Some((_, best_distance)) if best_distance <= distance => best,
            _ => Some((relay, distance)),
        })
        .map(|(relay, distance)| {
            tracing::debug!("Nearest relay {} ({:.0} km)", relay.url, distance / 1000.0);
            relay
        })
}
