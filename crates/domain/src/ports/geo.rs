use uuid::Uuid;

use super::BoxFuture;
use crate::trip::GeoPoint;
use crate::DomainResult;

/// Spatial lookup over the live fleet. `nearby` returns at most `k`
/// driver ids sorted ascending by great-circle distance; malformed
/// entries are silently skipped. `upsert_location` is the ingestion
/// hook for the external location stream; the refresh cadence is not
/// owned here.
pub trait GeoIndex: Send + Sync {
    fn nearby(
        &self,
        point: GeoPoint,
        radius_km: f64,
        k: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<Uuid>>>;

    fn upsert_location(&self, driver_id: Uuid, point: GeoPoint) -> BoxFuture<'_, DomainResult<()>>;
}
