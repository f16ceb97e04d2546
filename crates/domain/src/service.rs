use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DomainError;
use crate::ports::clock::Clock;
use crate::ports::idempotency::IdempotencyStore;
use crate::ports::matching::MatchingEngine;
use crate::ports::publisher::EventPublisher;
use crate::ports::repository::TripRepository;
use crate::trip::{CancelReason, GeoPoint, Trip, TripEvent, TripEventType, TripStatus};
use crate::DomainResult;

pub const DEFAULT_EVENT_TOPIC: &str = "trip.events";

#[derive(Clone, Debug)]
pub struct CreateTripInput {
    pub rider_id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTripResponse {
    pub trip_id: Uuid,
    pub status: TripStatus,
}

/// Orchestrates the trip lifecycle: guards every transition through the
/// state table, persists with the event row in one scope, and releases
/// driver reservations on terminal transitions.
#[derive(Clone)]
pub struct TripService {
    repo: Arc<dyn TripRepository>,
    publisher: Arc<dyn EventPublisher>,
    matcher: Option<Arc<dyn MatchingEngine>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    clock: Arc<dyn Clock>,
    topic: String,
}

impl TripService {
    pub fn new(
        repo: Arc<dyn TripRepository>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            publisher,
            matcher: None,
            idempotency: None,
            clock,
            topic: DEFAULT_EVENT_TOPIC.to_string(),
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn MatchingEngine>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub async fn create_trip(
        &self,
        idempotency_key: &str,
        input: CreateTripInput,
    ) -> DomainResult<CreateTripResponse> {
        if !idempotency_key.is_empty() {
            if let Some(store) = &self.idempotency {
                if let Some(cached) = store.get(idempotency_key).await? {
                    return decode_create_response(&cached);
                }
            }
        }

        let now = self.clock.now();
        let trip = Trip {
            id: Uuid::new_v4(),
            rider_id: input.rider_id,
            driver_id: None,
            pickup: input.pickup,
            dropoff: input.dropoff,
            vehicle_type: input.vehicle_type,
            status: TripStatus::Requested,
            requested_at: now,
            accepted_at: None,
            started_at: None,
            finished_at: None,
            cancelled_at: None,
            cancelled_by: None,
            price_cents: 0,
            version: 1,
        };

        let mut current = self.repo.create_trip(&trip).await?;
        self.record_event(self.event_for(
            &current,
            TripEventType::TripRequested,
            json!({ "rider_id": current.rider_id }),
        ))
        .await;

        if let Some(matcher) = &self.matcher {
            match matcher.reserve_driver(&current).await {
                Ok(driver_id) => {
                    let mut assigned = current.clone();
                    assigned.driver_id = Some(driver_id);
                    assigned.status = TripStatus::DriverAssigned;
                    let event = self.event_for(
                        &assigned,
                        TripEventType::DriverAssigned,
                        json!({ "driver_id": driver_id }),
                    );
                    match self.repo.update_trip_with_event(&assigned, &event).await {
                        Ok(updated) => {
                            self.fan_out(&event).await;
                            current = updated;
                        }
                        Err(err) => {
                            // The reservation would otherwise dangle until TTL.
                            if let Err(release_err) = matcher.release_driver(driver_id).await {
                                warn!(
                                    trip_id = %current.id,
                                    driver_id = %driver_id,
                                    error = %release_err,
                                    "reservation release after failed assignment"
                                );
                            }
                            return Err(err);
                        }
                    }
                }
                Err(DomainError::NoCandidate) => {
                    debug!(trip_id = %current.id, "no driver available");
                }
                Err(err) => {
                    warn!(trip_id = %current.id, error = %err, "driver matching failed");
                }
            }
        }

        let response = CreateTripResponse {
            trip_id: current.id,
            status: current.status,
        };
        if !idempotency_key.is_empty() {
            if let Some(store) = &self.idempotency {
                let payload = serde_json::to_vec(&response)
                    .map_err(|err| DomainError::Store(err.to_string()))?;
                store.put(idempotency_key, &payload).await?;
            }
        }
        Ok(response)
    }

    pub async fn get_trip(&self, trip_id: Uuid) -> DomainResult<Trip> {
        self.repo.get_trip_by_id(trip_id).await
    }

    pub async fn accept_trip(&self, trip_id: Uuid, driver_id: Uuid) -> DomainResult<Trip> {
        let trip = self.repo.get_trip_by_id(trip_id).await?;

        match trip.driver_id {
            Some(assigned) if assigned == driver_id => {}
            _ => return Err(DomainError::DriverMismatch),
        }
        if trip.status == TripStatus::DriverAccepted {
            return Ok(trip);
        }
        if !trip.status.can_transition_to(TripStatus::DriverAccepted) {
            return Err(DomainError::InvalidTransition);
        }

        let mut next = trip;
        next.status = TripStatus::DriverAccepted;
        next.accepted_at = Some(self.clock.now());

        let event = self.event_for(
            &next,
            TripEventType::DriverAccepted,
            json!({ "driver_id": driver_id }),
        );
        let updated = self.repo.update_trip_with_event(&next, &event).await?;
        self.fan_out(&event).await;
        Ok(updated)
    }

    pub async fn cancel_trip(&self, trip_id: Uuid, reason: CancelReason) -> DomainResult<Trip> {
        let trip = self.repo.get_trip_by_id(trip_id).await?;

        let target = reason.cancel_status();
        if trip.status == target {
            return Ok(trip);
        }
        if !trip.status.can_transition_to(target) {
            return Err(DomainError::InvalidTransition);
        }

        let assigned_driver = trip.driver_id;
        let mut next = trip;
        next.status = target;
        next.cancelled_at = Some(self.clock.now());
        next.cancelled_by = Some(reason);

        let event = self.event_for(
            &next,
            TripEventType::TripCancelled,
            json!({ "reason": reason.as_str() }),
        );
        let updated = self.repo.update_trip_with_event(&next, &event).await?;
        self.fan_out(&event).await;
        self.release_reservation(updated.id, assigned_driver).await;
        Ok(updated)
    }

    pub async fn start_trip(&self, trip_id: Uuid) -> DomainResult<Trip> {
        let trip = self.repo.get_trip_by_id(trip_id).await?;

        if trip.status == TripStatus::InProgress {
            return Ok(trip);
        }
        if !trip.status.can_transition_to(TripStatus::InProgress) {
            return Err(DomainError::InvalidTransition);
        }

        let mut next = trip;
        next.status = TripStatus::InProgress;
        next.started_at = Some(self.clock.now());

        let event = self.event_for(&next, TripEventType::TripStarted, json!({}));
        let updated = self.repo.update_trip_with_event(&next, &event).await?;
        self.fan_out(&event).await;
        Ok(updated)
    }

    pub async fn complete_trip(&self, trip_id: Uuid, price_cents: i64) -> DomainResult<Trip> {
        let trip = self.repo.get_trip_by_id(trip_id).await?;

        if trip.status == TripStatus::Completed {
            return Ok(trip);
        }
        if !trip.status.can_transition_to(TripStatus::Completed) {
            return Err(DomainError::InvalidTransition);
        }

        let assigned_driver = trip.driver_id;
        let mut next = trip;
        next.status = TripStatus::Completed;
        next.finished_at = Some(self.clock.now());
        next.price_cents = price_cents;

        let event = self.event_for(
            &next,
            TripEventType::TripFinished,
            json!({ "price_cents": price_cents }),
        );
        let updated = self.repo.update_trip_with_event(&next, &event).await?;
        self.fan_out(&event).await;
        self.release_reservation(updated.id, assigned_driver).await;
        Ok(updated)
    }

    fn event_for(
        &self,
        trip: &Trip,
        event_type: TripEventType,
        payload: serde_json::Value,
    ) -> TripEvent {
        TripEvent {
            id: 0,
            trip_id: trip.id,
            event_type,
            topic: self.topic.clone(),
            payload,
            created_at: self.clock.now(),
        }
    }

    /// Creation-time event: the outbox write and the fan-out are both
    /// best-effort here, matching failure must not fail the trip.
    async fn record_event(&self, event: TripEvent) {
        if let Err(err) = self.repo.create_trip_event(&event).await {
            warn!(trip_id = %event.trip_id, error = %err, "trip event append failed");
        }
        self.fan_out(&event).await;
    }

    async fn fan_out(&self, event: &TripEvent) {
        if let Err(err) = self.publisher.publish(event).await {
            debug!(trip_id = %event.trip_id, error = %err, "in-process publish failed");
        }
    }

    async fn release_reservation(&self, trip_id: Uuid, driver_id: Option<Uuid>) {
        let (Some(matcher), Some(driver_id)) = (&self.matcher, driver_id) else {
            return;
        };
        if let Err(err) = matcher.release_driver(driver_id).await {
            warn!(trip_id = %trip_id, driver_id = %driver_id, error = %err, "reservation release failed");
        }
    }
}

fn decode_create_response(payload: &[u8]) -> DomainResult<CreateTripResponse> {
    if payload.is_empty() {
        return Err(DomainError::Store("empty idempotent payload".to_string()));
    }
    let response: CreateTripResponse = serde_json::from_slice(payload)
        .map_err(|err| DomainError::Store(format!("idempotent payload decode: {err}")))?;
    if response.trip_id.is_nil() {
        return Err(DomainError::Store(
            "idempotent payload missing trip id".to_string(),
        ));
    }
    Ok(response)
}
