use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::DomainError;
use crate::ports::idempotency::IdempotencyStore;
use crate::ports::publisher::EventPublisher;
use crate::ports::repository::TripRepository;
use crate::ports::BoxFuture;
use crate::trip::{Trip, TripEvent};
use crate::DomainResult;

#[derive(Default)]
struct RepositoryState {
    trips: HashMap<Uuid, Trip>,
    events: Vec<TripEvent>,
}

/// Repository for tests and local runs. The version check is relaxed:
/// updates bump the stored version unconditionally.
#[derive(Clone, Default)]
pub struct InMemoryTripRepository {
    inner: Arc<Mutex<RepositoryState>>,
}

impl InMemoryTripRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip_count(&self) -> usize {
        self.inner.lock().expect("trip repository lock").trips.len()
    }

    pub fn events(&self) -> Vec<TripEvent> {
        self.inner
            .lock()
            .expect("trip repository lock")
            .events
            .clone()
    }
}

impl TripRepository for InMemoryTripRepository {
    fn create_trip(&self, trip: &Trip) -> BoxFuture<'_, DomainResult<Trip>> {
        let trip = trip.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut state = inner.lock().expect("trip repository lock");
            if state.trips.contains_key(&trip.id) {
                return Err(DomainError::AlreadyExists);
            }
            state.trips.insert(trip.id, trip.clone());
            Ok(trip)
        })
    }

    fn get_trip_by_id(&self, id: Uuid) -> BoxFuture<'_, DomainResult<Trip>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let state = inner.lock().expect("trip repository lock");
            state.trips.get(&id).cloned().ok_or(DomainError::NotFound)
        })
    }

    fn update_trip(&self, trip: &Trip) -> BoxFuture<'_, DomainResult<Trip>> {
        let trip = trip.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut state = inner.lock().expect("trip repository lock");
            let stored_version = match state.trips.get(&trip.id) {
                Some(existing) => existing.version,
                None => return Err(DomainError::NotFound),
            };
            let mut updated = trip;
            updated.version = stored_version + 1;
            state.trips.insert(updated.id, updated.clone());
            Ok(updated)
        })
    }

    fn create_trip_event(&self, event: &TripEvent) -> BoxFuture<'_, DomainResult<TripEvent>> {
        let event = event.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut state = inner.lock().expect("trip repository lock");
            let mut stored = event;
            stored.id = state.events.len() as i64 + 1;
            state.events.push(stored.clone());
            Ok(stored)
        })
    }

    fn update_trip_with_event(
        &self,
        trip: &Trip,
        event: &TripEvent,
    ) -> BoxFuture<'_, DomainResult<Trip>> {
        let trip = trip.clone();
        let event = event.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut state = inner.lock().expect("trip repository lock");
            let stored_version = match state.trips.get(&trip.id) {
                Some(existing) => existing.version,
                None => return Err(DomainError::NotFound),
            };
            let mut updated = trip;
            updated.version = stored_version + 1;
            state.trips.insert(updated.id, updated.clone());
            let mut stored_event = event;
            stored_event.id = state.events.len() as i64 + 1;
            state.events.push(stored_event);
            Ok(updated)
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("idempotency store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn get(&self, key: &str) -> BoxFuture<'_, DomainResult<Option<Vec<u8>>>> {
        let key = key.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.lock().expect("idempotency store lock");
            Ok(guard.get(&key).cloned())
        })
    }

    fn put(&self, key: &str, payload: &[u8]) -> BoxFuture<'_, DomainResult<()>> {
        let key = key.to_string();
        let payload = payload.to_vec();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("idempotency store lock");
            guard.insert(key, payload);
            Ok(())
        })
    }
}

/// Collects published events; the test double for the in-process
/// fan-out path.
#[derive(Clone, Default)]
pub struct InMemoryEventPublisher {
    inner: Arc<Mutex<Vec<TripEvent>>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TripEvent> {
        self.inner.lock().expect("event publisher lock").clone()
    }
}

impl EventPublisher for InMemoryEventPublisher {
    fn publish(&self, event: &TripEvent) -> BoxFuture<'_, DomainResult<()>> {
        let event = event.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.lock().expect("event publisher lock").push(event);
            Ok(())
        })
    }
}

/// Used when no bus is configured; the outbox remains the durable path.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventPublisher;

impl EventPublisher for NoopEventPublisher {
    fn publish(&self, _event: &TripEvent) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::trip::{GeoPoint, TripStatus};
    use time::OffsetDateTime;

    fn trip() -> Trip {
        Trip {
            id: Uuid::new_v4(),
            rider_id: Uuid::new_v4(),
            driver_id: None,
            pickup: GeoPoint::new(37.7749, -122.4194),
            dropoff: GeoPoint::new(37.8000, -122.4000),
            vehicle_type: "sedan".to_string(),
            status: TripStatus::Requested,
            requested_at: OffsetDateTime::UNIX_EPOCH,
            accepted_at: None,
            started_at: None,
            finished_at: None,
            cancelled_at: None,
            cancelled_by: None,
            price_cents: 0,
            version: 1,
        }
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let repo = InMemoryTripRepository::new();
        let trip = trip();
        repo.create_trip(&trip).await.unwrap();
        let err = repo.create_trip(&trip).await.unwrap_err();
        assert!(matches!(err, DomainError::AlreadyExists));
    }

    #[tokio::test]
    async fn update_bumps_version_from_stored_state() {
        let repo = InMemoryTripRepository::new();
        let created = repo.create_trip(&trip()).await.unwrap();

        let mut next = created.clone();
        next.status = TripStatus::CancelledByRider;
        let updated = repo.update_trip(&next).await.unwrap();
        assert_eq!(updated.version, created.version + 1);

        let fetched = repo.get_trip_by_id(created.id).await.unwrap();
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.status, TripStatus::CancelledByRider);
    }

    #[tokio::test]
    async fn missing_trip_is_not_found() {
        let repo = InMemoryTripRepository::new();
        let err = repo.get_trip_by_id(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
        let err = repo.update_trip(&trip()).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[tokio::test]
    async fn events_receive_monotonic_ids() {
        let repo = InMemoryTripRepository::new();
        let created = repo.create_trip(&trip()).await.unwrap();
        let event = TripEvent {
            id: 0,
            trip_id: created.id,
            event_type: crate::trip::TripEventType::TripRequested,
            topic: "trip.events".to_string(),
            payload: serde_json::json!({}),
            created_at: OffsetDateTime::UNIX_EPOCH,
        };

        let first = repo.create_trip_event(&event).await.unwrap();
        let second = repo.create_trip_event(&event).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
    }

    #[tokio::test]
    async fn idempotency_store_is_last_writer_wins() {
        let store = InMemoryIdempotencyStore::new();
        assert_eq!(store.get("k1").await.unwrap(), None);

        store.put("k1", b"first").await.unwrap();
        store.put("k1", b"second").await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(store.len(), 1);
    }
}
