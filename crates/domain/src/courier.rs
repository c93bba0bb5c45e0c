//! Courier entities and candidate ranking.

use chrono::{DateTime, Utc};
use common::{ConcurrencyToken, CourierId, GeoPoint, OrderId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Availability of a courier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CourierStatus {
    Available,
    Busy,
    Offline,
}

impl CourierStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CourierStatus::Available => "AVAILABLE",
            CourierStatus::Busy => "BUSY",
            CourierStatus::Offline => "OFFLINE",
        }
    }
}

impl std::fmt::Display for CourierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CourierStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(CourierStatus::Available),
            "BUSY" => Ok(CourierStatus::Busy),
            "OFFLINE" => Ok(CourierStatus::Offline),
            other => Err(DomainError::UnknownCourierStatus(other.to_string())),
        }
    }
}

/// A courier as owned by the courier service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Courier {
    pub id: CourierId,
    pub name: String,
    pub status: CourierStatus,
    /// Last reported position; `None` until the first telemetry update.
    pub location: Option<GeoPoint>,
    /// Order the courier is bound to while BUSY.
    pub current_order_id: Option<OrderId>,
    pub token: ConcurrencyToken,
    pub updated_at: DateTime<Utc>,
}

impl Courier {
    pub fn new(name: impl Into<String>, location: Option<GeoPoint>) -> Self {
        Self {
            id: CourierId::new(),
            name: name.into(),
            status: CourierStatus::Available,
            location,
            current_order_id: None,
            token: ConcurrencyToken::initial(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == CourierStatus::Available
    }
}

/// A courier worth trying, with the token it was read at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub courier_id: CourierId,
    pub token: ConcurrencyToken,
    /// Distance to the pickup point, when both positions are known.
    pub distance_km: Option<f64>,
}

/// Orders available couriers by great-circle distance to `pickup`.
///
/// Couriers without a known position (or every courier, when the pickup
/// point itself is not geocoded) follow the measured ones in input order
/// instead of being dropped. At most `limit` candidates are returned.
pub fn rank_candidates(
    couriers: &[Courier],
    pickup: Option<&GeoPoint>,
    limit: usize,
) -> Vec<Candidate> {
    let mut ranked: Vec<Candidate> = couriers
        .iter()
        .filter(|c| c.is_available())
        .map(|c| Candidate {
            courier_id: c.id,
            token: c.token,
            distance_km: match (pickup, c.location.as_ref()) {
                (Some(pickup), Some(at)) => Some(at.distance_km(pickup)),
                _ => None,
            },
        })
        .collect();

    // Stable sort keeps the input order among unmeasured couriers.
    ranked.sort_by(|a, b| match (a.distance_km, b.distance_km) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn courier(name: &str, location: Option<GeoPoint>) -> Courier {
        Courier::new(name, location)
    }

    #[test]
    fn nearest_available_courier_first() {
        let pickup = GeoPoint::new(40.4168, -3.7038); // Madrid
        let far = courier("far", Some(GeoPoint::new(41.3874, 2.1686))); // Barcelona
        let near = courier("near", Some(GeoPoint::new(40.4530, -3.6883)));
        let mut busy = courier("busy", Some(pickup));
        busy.status = CourierStatus::Busy;

        let ranked = rank_candidates(&[far.clone(), busy, near.clone()], Some(&pickup), 5);

        let ids: Vec<_> = ranked.iter().map(|c| c.courier_id).collect();
        assert_eq!(ids, vec![near.id, far.id]);
        assert!(ranked[0].distance_km.unwrap() < 5.0);
    }

    #[test]
    fn couriers_without_location_are_last_not_dropped() {
        let pickup = GeoPoint::new(0.0, 0.0);
        let blind = courier("blind", None);
        let seen = courier("seen", Some(GeoPoint::new(10.0, 10.0)));

        let ranked = rank_candidates(&[blind.clone(), seen.clone()], Some(&pickup), 5);
        let ids: Vec<_> = ranked.iter().map(|c| c.courier_id).collect();
        assert_eq!(ids, vec![seen.id, blind.id]);
        assert!(ranked[1].distance_km.is_none());
    }

    #[test]
    fn ungeocoded_pickup_keeps_input_order() {
        let a = courier("a", Some(GeoPoint::new(1.0, 1.0)));
        let b = courier("b", None);

        let ranked = rank_candidates(&[a.clone(), b.clone()], None, 5);
        let ids: Vec<_> = ranked.iter().map(|c| c.courier_id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn nobody_available() {
        let mut offline = courier("off", None);
        offline.status = CourierStatus::Offline;
        assert!(rank_candidates(&[offline], None, 5).is_empty());
    }

    #[test]
    fn limit_is_respected() {
        let couriers: Vec<_> = (0..10).map(|i| courier(&format!("c{i}"), None)).collect();
        assert_eq!(rank_candidates(&couriers, None, 3).len(), 3);
    }

    #[test]
    fn status_names() {
        for status in [CourierStatus::Available, CourierStatus::Busy, CourierStatus::Offline] {
            assert_eq!(status.as_str().parse::<CourierStatus>().unwrap(), status);
        }
    }
}
