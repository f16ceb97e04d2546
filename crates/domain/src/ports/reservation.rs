use std::time::Duration;

use uuid::Uuid;

use super::BoxFuture;
use crate::DomainResult;

/// Exclusive driver lock with TTL. `try_reserve` must be an atomic
/// set-if-absent: it returns true exactly once per driver in any TTL
/// window. `release` is an unconditional delete, safe if absent.
pub trait ReservationStore: Send + Sync {
    fn try_reserve(
        &self,
        driver_id: Uuid,
        trip_id: Uuid,
        ttl: Duration,
    ) -> BoxFuture<'_, DomainResult<bool>>;

    fn release(&self, driver_id: Uuid) -> BoxFuture<'_, DomainResult<()>>;
}
