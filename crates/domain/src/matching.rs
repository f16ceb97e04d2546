use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DomainError;
use crate::ports::geo::GeoIndex;
use crate::ports::matching::MatchingEngine;
use crate::ports::reservation::ReservationStore;
use crate::ports::BoxFuture;
use crate::trip::Trip;
use crate::DomainResult;

const ASSIGNMENT_ATTEMPTS_TOTAL: &str = "assignment_attempts_total";
const MATCHING_TIME_SECONDS: &str = "matching_time_seconds";

#[derive(Clone, Copy, Debug)]
pub struct MatcherConfig {
    pub radius_km: f64,
    pub top_k: usize,
    pub reserve_ttl: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            radius_km: 5.0,
            top_k: 5,
            reserve_ttl: Duration::from_secs(10),
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
        }
    }
}

impl MatcherConfig {
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if !self.radius_km.is_finite() || self.radius_km <= 0.0 {
            self.radius_km = defaults.radius_km;
        }
        if self.top_k == 0 {
            self.top_k = defaults.top_k;
        }
        if self.reserve_ttl.is_zero() {
            self.reserve_ttl = defaults.reserve_ttl;
        }
        if self.max_attempts == 0 {
            self.max_attempts = defaults.max_attempts;
        }
        if self.base_backoff.is_zero() {
            self.base_backoff = defaults.base_backoff;
        }
        self
    }
}

/// Nearest-neighbour assignment over the geo index, with an exclusive
/// reservation per driver and exponential backoff between contended
/// attempts.
#[derive(Clone)]
pub struct Matcher {
    geo: Arc<dyn GeoIndex>,
    store: Arc<dyn ReservationStore>,
    config: MatcherConfig,
}

impl Matcher {
    pub fn new(geo: Arc<dyn GeoIndex>, store: Arc<dyn ReservationStore>, config: MatcherConfig) -> Self {
        Self {
            geo,
            store,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> MatcherConfig {
        self.config
    }

    async fn reserve(&self, trip: Trip) -> DomainResult<Uuid> {
        let started = Instant::now();
        let mut last_err: Option<DomainError> = None;

        for attempt in 1..=self.config.max_attempts {
            let candidates = match self
                .geo
                .nearby(trip.pickup, self.config.radius_km, self.config.top_k)
                .await
            {
                Ok(candidates) => candidates,
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            };
            debug!(
                trip_id = %trip.id,
                attempt,
                candidate_count = candidates.len(),
                "matching candidates"
            );
            // An empty index cannot become non-empty by retrying here.
            if candidates.is_empty() {
                break;
            }

            for driver_id in candidates {
                match self
                    .store
                    .try_reserve(driver_id, trip.id, self.config.reserve_ttl)
                    .await
                {
                    Ok(true) => {
                        counter!(ASSIGNMENT_ATTEMPTS_TOTAL, "result" => "success").increment(1);
                        histogram!(MATCHING_TIME_SECONDS, "result" => "success")
                            .record(started.elapsed().as_secs_f64());
                        info!(trip_id = %trip.id, driver_id = %driver_id, attempt, "driver reserved");
                        return Ok(driver_id);
                    }
                    Ok(false) => {
                        counter!(ASSIGNMENT_ATTEMPTS_TOTAL, "result" => "contended").increment(1);
                    }
                    Err(err) => {
                        warn!(trip_id = %trip.id, driver_id = %driver_id, error = %err, "reservation failed");
                        last_err = Some(err);
                    }
                }
            }

            if attempt < self.config.max_attempts {
                let backoff = self.config.base_backoff * 2u32.saturating_pow(attempt - 1);
                debug!(trip_id = %trip.id, backoff_ms = backoff.as_millis() as u64, "matcher backoff");
                tokio::time::sleep(backoff).await;
            }
        }

        histogram!(MATCHING_TIME_SECONDS, "result" => "failure")
            .record(started.elapsed().as_secs_f64());
        Err(last_err.unwrap_or(DomainError::NoCandidate))
    }
}

impl MatchingEngine for Matcher {
    fn reserve_driver(&self, trip: &Trip) -> BoxFuture<'_, DomainResult<Uuid>> {
        let trip = trip.clone();
        Box::pin(async move { self.reserve(trip).await })
    }

    fn release_driver(&self, driver_id: Uuid) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move { self.store.release(driver_id).await })
    }
}

#[derive(Clone, Debug)]
struct ReservationEntry {
    trip_id: Uuid,
    expires_at: Option<Instant>,
}

#[derive(Clone, Default)]
pub struct InMemoryReservationStore {
    inner: Arc<Mutex<HashMap<Uuid, ReservationEntry>>>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserved_for(&self, driver_id: Uuid) -> Option<Uuid> {
        let mut guard = self.inner.lock().expect("reservation store lock");
        if let Some(entry) = guard.get(&driver_id) {
            if Self::is_expired(entry.expires_at) {
                guard.remove(&driver_id);
                return None;
            }
            return Some(entry.trip_id);
        }
        None
    }

    fn is_expired(expires_at: Option<Instant>) -> bool {
        match expires_at {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

impl ReservationStore for InMemoryReservationStore {
    fn try_reserve(
        &self,
        driver_id: Uuid,
        trip_id: Uuid,
        ttl: Duration,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("reservation store lock");
            if let Some(entry) = guard.get(&driver_id) {
                if !Self::is_expired(entry.expires_at) {
                    return Ok(false);
                }
                guard.remove(&driver_id);
            }
            let expires_at = if ttl.is_zero() {
                None
            } else {
                Some(Instant::now() + ttl)
            };
            guard.insert(driver_id, ReservationEntry { trip_id, expires_at });
            Ok(true)
        })
    }

    fn release(&self, driver_id: Uuid) -> BoxFuture<'_, DomainResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("reservation store lock");
            guard.remove(&driver_id);
            Ok(())
        })
    }
}
