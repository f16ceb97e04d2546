use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::ports::geo::GeoIndex;
use crate::ports::BoxFuture;
use crate::trip::GeoPoint;
use crate::DomainResult;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let sin_dlat = (dlat / 2.0).sin();
    let sin_dlng = (dlng / 2.0).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlng * sin_dlng;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Last-known driver position as reported by the location stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationSnapshot {
    pub driver_id: Uuid,
    pub point: GeoPoint,
    pub speed: f64,
    pub accuracy: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// In-process snapshot cache consumed by the ETA estimator. The
/// location-ingestion collaborator owns the refresh cadence.
#[derive(Clone, Default)]
pub struct LocationCache {
    inner: Arc<RwLock<HashMap<Uuid, LocationSnapshot>>>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, snapshot: LocationSnapshot) {
        let mut guard = self.inner.write().expect("location cache lock");
        guard.insert(snapshot.driver_id, snapshot);
    }

    pub fn snapshot(&self, driver_id: Uuid) -> Option<LocationSnapshot> {
        let guard = self.inner.read().expect("location cache lock");
        guard.get(&driver_id).cloned()
    }

    pub fn all(&self) -> Vec<LocationSnapshot> {
        let guard = self.inner.read().expect("location cache lock");
        guard.values().cloned().collect()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryGeoIndex {
    inner: Arc<RwLock<HashMap<Uuid, GeoPoint>>>,
}

impl InMemoryGeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn driver_count(&self) -> usize {
        self.inner.read().expect("geo index lock").len()
    }
}

impl GeoIndex for InMemoryGeoIndex {
    fn nearby(
        &self,
        point: GeoPoint,
        radius_km: f64,
        k: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<Uuid>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.read().expect("geo index lock");
            let mut candidates: Vec<(Uuid, f64)> = guard
                .iter()
                .filter(|(_, location)| location.is_valid())
                .map(|(driver_id, location)| (*driver_id, haversine_km(*location, point)))
                .filter(|(_, distance)| *distance <= radius_km)
                .collect();
            candidates.sort_by(|left, right| {
                left.1
                    .partial_cmp(&right.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            candidates.truncate(k);
            Ok(candidates.into_iter().map(|(driver_id, _)| driver_id).collect())
        })
    }

    fn upsert_location(&self, driver_id: Uuid, point: GeoPoint) -> BoxFuture<'_, DomainResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.write().expect("geo index lock");
            guard.insert(driver_id, point);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pickup() -> GeoPoint {
        GeoPoint::new(37.7749, -122.4194)
    }

    #[tokio::test]
    async fn nearby_sorts_ascending_by_distance() {
        let index = InMemoryGeoIndex::new();
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        index
            .upsert_location(far, GeoPoint::new(37.7760, -122.4180))
            .await
            .unwrap();
        index
            .upsert_location(near, GeoPoint::new(37.7750, -122.4195))
            .await
            .unwrap();

        let found = index.nearby(pickup(), 5.0, 5).await.unwrap();
        assert_eq!(found, vec![near, far]);
    }

    #[tokio::test]
    async fn nearby_respects_radius_and_limit() {
        let index = InMemoryGeoIndex::new();
        let close = Uuid::new_v4();
        index
            .upsert_location(close, GeoPoint::new(37.7750, -122.4195))
            .await
            .unwrap();
        index
            .upsert_location(Uuid::new_v4(), GeoPoint::new(38.5, -121.5))
            .await
            .unwrap();

        let found = index.nearby(pickup(), 5.0, 5).await.unwrap();
        assert_eq!(found, vec![close]);

        index
            .upsert_location(Uuid::new_v4(), GeoPoint::new(37.7751, -122.4193))
            .await
            .unwrap();
        let found = index.nearby(pickup(), 5.0, 1).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn malformed_locations_never_match() {
        let index = InMemoryGeoIndex::new();
        index
            .upsert_location(Uuid::new_v4(), GeoPoint::new(f64::NAN, -122.0))
            .await
            .unwrap();
        index
            .upsert_location(Uuid::new_v4(), GeoPoint::new(120.0, 50.0))
            .await
            .unwrap();

        let found = index.nearby(pickup(), 10_000.0, 10).await.unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn haversine_matches_known_distance() {
        // SFO -> LAX is roughly 543 km.
        let sfo = GeoPoint::new(37.6213, -122.3790);
        let lax = GeoPoint::new(33.9416, -118.4085);
        let distance = haversine_km(sfo, lax);
        assert!((530.0..560.0).contains(&distance), "{distance}");
    }

    #[test]
    fn location_cache_upserts_by_driver() {
        let cache = LocationCache::new();
        let driver = Uuid::new_v4();
        cache.upsert(LocationSnapshot {
            driver_id: driver,
            point: pickup(),
            speed: 8.0,
            accuracy: 5.0,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        });
        cache.upsert(LocationSnapshot {
            driver_id: driver,
            point: GeoPoint::new(37.7760, -122.4180),
            speed: 9.0,
            accuracy: 5.0,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        });

        assert_eq!(cache.all().len(), 1);
        let snapshot = cache.snapshot(driver).expect("snapshot");
        assert_eq!(snapshot.point, GeoPoint::new(37.7760, -122.4180));
    }
}
