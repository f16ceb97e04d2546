use uuid::Uuid;

use super::BoxFuture;
use crate::trip::Trip;
use crate::DomainResult;

/// Selects and reserves a driver for a trip. `reserve_driver` fails
/// with `NoCandidate` when no free driver is in range.
pub trait MatchingEngine: Send + Sync {
    fn reserve_driver(&self, trip: &Trip) -> BoxFuture<'_, DomainResult<Uuid>>;
    fn release_driver(&self, driver_id: Uuid) -> BoxFuture<'_, DomainResult<()>>;
}
