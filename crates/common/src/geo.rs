//! Locations carried on orders and couriers.

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the great-circle distance.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to `other` in kilometres (haversine formula).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_KM * c
    }
}

/// A postal address with an optional geocoded position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

impl Address {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            location: None,
        }
    }

    pub fn at(text: impl Into<String>, location: GeoPoint) -> Self {
        Self {
            text: text.into(),
            location: Some(location),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let p = GeoPoint::new(41.3874, 2.1686);
        assert!(p.distance_km(&p).abs() < 1e-9);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = GeoPoint::new(40.4168, -3.7038);
        let b = GeoPoint::new(41.3874, 2.1686);
        assert!((a.distance_km(&b) - b.distance_km(&a)).abs() < 1e-9);
    }

    #[test]
    fn madrid_to_barcelona() {
        let madrid = GeoPoint::new(40.4168, -3.7038);
        let barcelona = GeoPoint::new(41.3874, 2.1686);
        let d = madrid.distance_km(&barcelona);
        assert!((d - 505.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn address_without_location_omits_field() {
        let json = serde_json::to_value(Address::new("Main St 1")).unwrap();
        assert_eq!(json, serde_json::json!({ "text": "Main St 1" }));
    }
}
