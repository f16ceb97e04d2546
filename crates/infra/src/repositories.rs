use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use ridelink_domain::error::DomainError;
use ridelink_domain::ports::repository::TripRepository;
use ridelink_domain::ports::BoxFuture;
use ridelink_domain::trip::{CancelReason, GeoPoint, Trip, TripEvent, TripStatus};
use ridelink_domain::DomainResult;

const SELECT_TRIP: &str = r"
SELECT id, rider_id, driver_id, pickup_lat, pickup_lng, dropoff_lat, dropoff_lng,
       vehicle_type, status, requested_at, accepted_at, started_at, finished_at,
       cancelled_at, cancelled_by, price_cents, version
FROM trips WHERE id = $1
";

const INSERT_TRIP: &str = r"
INSERT INTO trips (id, rider_id, driver_id, pickup_lat, pickup_lng, dropoff_lat, dropoff_lng,
                   vehicle_type, status, requested_at, accepted_at, started_at, finished_at,
                   cancelled_at, cancelled_by, price_cents, version)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
";

// The version predicate is the optimistic lock; a stale writer matches
// zero rows.
const UPDATE_TRIP: &str = r"
UPDATE trips
SET driver_id = $2, status = $3, accepted_at = $4, started_at = $5, finished_at = $6,
    cancelled_at = $7, cancelled_by = $8, price_cents = $9, version = version + 1
WHERE id = $1 AND version = $10
RETURNING id, rider_id, driver_id, pickup_lat, pickup_lng, dropoff_lat, dropoff_lng,
          vehicle_type, status, requested_at, accepted_at, started_at, finished_at,
          cancelled_at, cancelled_by, price_cents, version
";

const INSERT_OUTBOX: &str = r"
INSERT INTO outbox (topic, payload) VALUES ($1, $2) RETURNING id
";

#[derive(sqlx::FromRow)]
struct TripRow {
    id: Uuid,
    rider_id: Uuid,
    driver_id: Option<Uuid>,
    pickup_lat: f64,
    pickup_lng: f64,
    dropoff_lat: f64,
    dropoff_lng: f64,
    vehicle_type: String,
    status: String,
    requested_at: OffsetDateTime,
    accepted_at: Option<OffsetDateTime>,
    started_at: Option<OffsetDateTime>,
    finished_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    cancelled_by: Option<String>,
    price_cents: i64,
    version: i64,
}

impl TripRow {
    fn into_trip(self) -> DomainResult<Trip> {
        let status = TripStatus::parse(&self.status)
            .ok_or_else(|| DomainError::Store(format!("unknown trip status '{}'", self.status)))?;
        let cancelled_by = match self.cancelled_by.as_deref() {
            Some(value) => Some(CancelReason::parse(value).ok_or_else(|| {
                DomainError::Store(format!("unknown cancel reason '{value}'"))
            })?),
            None => None,
        };
        Ok(Trip {
            id: self.id,
            rider_id: self.rider_id,
            driver_id: self.driver_id,
            pickup: GeoPoint::new(self.pickup_lat, self.pickup_lng),
            dropoff: GeoPoint::new(self.dropoff_lat, self.dropoff_lng),
            vehicle_type: self.vehicle_type,
            status,
            requested_at: self.requested_at,
            accepted_at: self.accepted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            cancelled_at: self.cancelled_at,
            cancelled_by,
            price_cents: self.price_cents,
            version: self.version,
        })
    }
}

fn map_sqlx(err: sqlx::Error) -> DomainError {
    match &err {
        sqlx::Error::RowNotFound => DomainError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => DomainError::AlreadyExists,
        _ => DomainError::Store(err.to_string()),
    }
}

/// Durable repository. `update_trip_with_event` commits the trip row
/// and its outbox row in one transaction; losing that pairing would
/// break the outbox's at-least-once guarantee.
#[derive(Clone)]
pub struct PgTripRepository {
    pool: PgPool,
}

impl PgTripRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn update_trip_row(conn: &mut PgConnection, trip: &Trip) -> DomainResult<Trip> {
    let row: Option<TripRow> = sqlx::query_as(UPDATE_TRIP)
        .bind(trip.id)
        .bind(trip.driver_id)
        .bind(trip.status.as_str())
        .bind(trip.accepted_at)
        .bind(trip.started_at)
        .bind(trip.finished_at)
        .bind(trip.cancelled_at)
        .bind(trip.cancelled_by.map(CancelReason::as_str))
        .bind(trip.price_cents)
        .bind(trip.version)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx)?;

    match row {
        Some(row) => row.into_trip(),
        None => {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM trips WHERE id = $1)")
                .bind(trip.id)
                .fetch_one(&mut *conn)
                .await
                .map_err(map_sqlx)?;
            if exists {
                Err(DomainError::VersionConflict)
            } else {
                Err(DomainError::NotFound)
            }
        }
    }
}

async fn insert_event_row(conn: &mut PgConnection, event: &TripEvent) -> DomainResult<TripEvent> {
    let payload = serde_json::to_vec(&event.envelope())
        .map_err(|err| DomainError::Store(err.to_string()))?;
    let id: i64 = sqlx::query_scalar(INSERT_OUTBOX)
        .bind(&event.topic)
        .bind(&payload)
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx)?;
    let mut stored = event.clone();
    stored.id = id;
    Ok(stored)
}

impl TripRepository for PgTripRepository {
    fn create_trip(&self, trip: &Trip) -> BoxFuture<'_, DomainResult<Trip>> {
        let trip = trip.clone();
        Box::pin(async move {
            sqlx::query(INSERT_TRIP)
                .bind(trip.id)
                .bind(trip.rider_id)
                .bind(trip.driver_id)
                .bind(trip.pickup.lat)
                .bind(trip.pickup.lng)
                .bind(trip.dropoff.lat)
                .bind(trip.dropoff.lng)
                .bind(&trip.vehicle_type)
                .bind(trip.status.as_str())
                .bind(trip.requested_at)
                .bind(trip.accepted_at)
                .bind(trip.started_at)
                .bind(trip.finished_at)
                .bind(trip.cancelled_at)
                .bind(trip.cancelled_by.map(CancelReason::as_str))
                .bind(trip.price_cents)
                .bind(trip.version)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            Ok(trip)
        })
    }

    fn get_trip_by_id(&self, id: Uuid) -> BoxFuture<'_, DomainResult<Trip>> {
        Box::pin(async move {
            let row: Option<TripRow> = sqlx::query_as(SELECT_TRIP)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
            row.ok_or(DomainError::NotFound)?.into_trip()
        })
    }

    fn update_trip(&self, trip: &Trip) -> BoxFuture<'_, DomainResult<Trip>> {
        let trip = trip.clone();
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
            update_trip_row(&mut conn, &trip).await
        })
    }

    fn create_trip_event(&self, event: &TripEvent) -> BoxFuture<'_, DomainResult<TripEvent>> {
        let event = event.clone();
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
            insert_event_row(&mut conn, &event).await
        })
    }

    fn update_trip_with_event(
        &self,
        trip: &Trip,
        event: &TripEvent,
    ) -> BoxFuture<'_, DomainResult<Trip>> {
        let trip = trip.clone();
        let event = event.clone();
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
            let updated = update_trip_row(&mut tx, &trip).await?;
            insert_event_row(&mut tx, &event).await?;
            tx.commit().await.map_err(map_sqlx)?;
            Ok(updated)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::db;
    use ridelink_domain::trip::TripEventType;

    async fn test_pool() -> Option<PgPool> {
        let dsn = std::env::var("POSTGRES_DSN")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok()?;
        let pool = db::connect_pool(&dsn).await.ok()?;
        db::ensure_schema(&pool).await.ok()?;
        Some(pool)
    }

    fn trip() -> Trip {
        Trip {
            id: Uuid::new_v4(),
            rider_id: Uuid::new_v4(),
            driver_id: None,
            pickup: GeoPoint::new(37.7749, -122.4194),
            dropoff: GeoPoint::new(37.8000, -122.4000),
            vehicle_type: "sedan".to_string(),
            status: TripStatus::Requested,
            requested_at: OffsetDateTime::now_utc(),
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
    async fn create_and_get_round_trip() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = PgTripRepository::new(pool);

        let created = repo.create_trip(&trip()).await.expect("create");
        let fetched = repo.get_trip_by_id(created.id).await.expect("get");
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.status, TripStatus::Requested);
        assert_eq!(fetched.version, 1);

        let err = repo.create_trip(&created).await.unwrap_err();
        assert!(matches!(err, DomainError::AlreadyExists));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = PgTripRepository::new(pool);
        let created = repo.create_trip(&trip()).await.expect("create");

        let mut next = created.clone();
        next.status = TripStatus::CancelledByRider;
        next.cancelled_at = Some(OffsetDateTime::now_utc());
        next.cancelled_by = Some(CancelReason::Rider);
        let updated = repo.update_trip(&next).await.expect("update");
        assert_eq!(updated.version, 2);

        // Replays the stale version=1 write.
        let err = repo.update_trip(&next).await.unwrap_err();
        assert!(matches!(err, DomainError::VersionConflict));

        let err = repo.update_trip(&trip()).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[tokio::test]
    async fn transactional_update_persists_trip_and_event_together() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = PgTripRepository::new(pool.clone());
        let created = repo.create_trip(&trip()).await.expect("create");

        let mut next = created.clone();
        next.status = TripStatus::DriverAssigned;
        next.driver_id = Some(Uuid::new_v4());
        let event = TripEvent {
            id: 0,
            trip_id: created.id,
            event_type: TripEventType::DriverAssigned,
            topic: "trip.events".to_string(),
            payload: json!({ "driver_id": next.driver_id }),
            created_at: OffsetDateTime::now_utc(),
        };

        let updated = repo
            .update_trip_with_event(&next, &event)
            .await
            .expect("update with event");
        assert_eq!(updated.version, 2);

        let (topic, published): (String, bool) = sqlx::query_as(
            "SELECT topic, published FROM outbox WHERE id = (SELECT max(id) FROM outbox)",
        )
        .fetch_one(&pool)
        .await
        .expect("outbox row");
        assert_eq!(topic, "trip.events");
        assert!(!published);
    }
}
