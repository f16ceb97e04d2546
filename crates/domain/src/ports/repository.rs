use uuid::Uuid;

use super::BoxFuture;
use crate::trip::{Trip, TripEvent};
use crate::DomainResult;

pub trait TripRepository: Send + Sync {
    /// Inserts a new trip; fails with `AlreadyExists` on a duplicate id.
    fn create_trip(&self, trip: &Trip) -> BoxFuture<'_, DomainResult<Trip>>;

    fn get_trip_by_id(&self, id: Uuid) -> BoxFuture<'_, DomainResult<Trip>>;

    /// Writes the trip with `version := stored.version + 1`. Durable
    /// implementations reject a stale `trip.version` with `VersionConflict`.
    fn update_trip(&self, trip: &Trip) -> BoxFuture<'_, DomainResult<Trip>>;

    /// Appends an event to the outbox-bearing table and returns it with
    /// the store-assigned id.
    fn create_trip_event(&self, event: &TripEvent) -> BoxFuture<'_, DomainResult<TripEvent>>;

    /// Trip update and event append in one transactional scope. Durable
    /// implementations commit both rows atomically; without that the
    /// outbox loses its at-least-once guarantee.
    fn update_trip_with_event(
        &self,
        trip: &Trip,
        event: &TripEvent,
    ) -> BoxFuture<'_, DomainResult<Trip>>;
}
