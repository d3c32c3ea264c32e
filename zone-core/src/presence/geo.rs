//! Great-circle distance for relay load-balancing (spec §4.5).

use crate::domain::GeoLocation;

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Haversine great-circle distance between two points, in kilometers.
#[must_use]
pub fn distance_km(a: GeoLocation, b: GeoLocation) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_point_has_zero_distance() {
        let p = GeoLocation { lat: 40.7, lon: -74.0 };
        assert!(distance_km(p, p) < 1e-6);
    }

    #[test]
    fn roughly_matches_known_distance() {
        // New York to London is approximately 5,570 km.
        let ny = GeoLocation { lat: 40.7128, lon: -74.0060 };
        let london = GeoLocation { lat: 51.5074, lon: -0.1278 };
        let km = distance_km(ny, london);
        assert!((5400.0..5750.0).contains(&km), "distance was {km}");
    }
}
