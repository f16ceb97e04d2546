use std::time::Duration;

use uuid::Uuid;

use crate::geo::{haversine_km, LocationCache};
use crate::trip::GeoPoint;

const DRIVER_AVG_SPEED_KMH: f64 = 30.0;
const TRIP_AVG_SPEED_KMH: f64 = 35.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EtaEstimate {
    pub driver_eta: Duration,
    pub trip_eta: Duration,
    pub driver_id: Option<Uuid>,
}

/// Straight-line estimates over last-known positions. Deliberately
/// naive: no routing, no traffic.
#[derive(Clone)]
pub struct EtaService {
    locations: LocationCache,
}

impl EtaService {
    pub fn new(locations: LocationCache) -> Self {
        Self { locations }
    }

    pub fn estimate(&self, pickup: GeoPoint, dropoff: GeoPoint) -> EtaEstimate {
        let mut best: Option<(Uuid, Duration)> = None;
        for snapshot in self.locations.all() {
            if !snapshot.point.is_valid() {
                continue;
            }
            let eta = travel_time(snapshot.point, pickup, DRIVER_AVG_SPEED_KMH);
            match best {
                Some((_, current)) if eta >= current => {}
                _ => best = Some((snapshot.driver_id, eta)),
            }
        }

        let (driver_id, driver_eta) = match best {
            Some((driver_id, eta)) => (Some(driver_id), eta),
            None => (None, Duration::ZERO),
        };

        EtaEstimate {
            driver_eta,
            trip_eta: travel_time(pickup, dropoff, TRIP_AVG_SPEED_KMH),
            driver_id,
        }
    }
}

fn travel_time(from: GeoPoint, to: GeoPoint, speed_kmh: f64) -> Duration {
    let distance_km = haversine_km(from, to);
    Duration::from_secs_f64(distance_km / speed_kmh * 3600.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use time::OffsetDateTime;

    use crate::geo::LocationSnapshot;

    fn snapshot(driver_id: Uuid, point: GeoPoint) -> LocationSnapshot {
        LocationSnapshot {
            driver_id,
            point,
            speed: 8.0,
            accuracy: 5.0,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn closest_driver_wins() {
        let cache = LocationCache::new();
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        cache.upsert(snapshot(far, GeoPoint::new(37.8100, -122.4000)));
        cache.upsert(snapshot(near, GeoPoint::new(37.7750, -122.4195)));

        let service = EtaService::new(cache);
        let estimate = service.estimate(
            GeoPoint::new(37.7749, -122.4194),
            GeoPoint::new(37.8000, -122.4000),
        );

        assert_eq!(estimate.driver_id, Some(near));
        assert!(estimate.driver_eta < Duration::from_secs(60));
        assert!(estimate.trip_eta > Duration::ZERO);
    }

    #[test]
    fn empty_fleet_yields_no_driver() {
        let service = EtaService::new(LocationCache::new());
        let estimate = service.estimate(
            GeoPoint::new(37.7749, -122.4194),
            GeoPoint::new(37.8000, -122.4000),
        );

        assert_eq!(estimate.driver_id, None);
        assert_eq!(estimate.driver_eta, Duration::ZERO);
    }

    #[test]
    fn trip_eta_scales_with_distance() {
        let service = EtaService::new(LocationCache::new());
        let short = service
            .estimate(
                GeoPoint::new(37.7749, -122.4194),
                GeoPoint::new(37.7800, -122.4150),
            )
            .trip_eta;
        let long = service
            .estimate(
                GeoPoint::new(37.7749, -122.4194),
                GeoPoint::new(37.9000, -122.3000),
            )
            .trip_eta;
        assert!(long > short);
    }
}
