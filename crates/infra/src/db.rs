use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub const CREATE_TRIPS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS trips (
    id           UUID PRIMARY KEY,
    rider_id     UUID NOT NULL,
    driver_id    UUID,
    pickup_lat   DOUBLE PRECISION NOT NULL,
    pickup_lng   DOUBLE PRECISION NOT NULL,
    dropoff_lat  DOUBLE PRECISION NOT NULL,
    dropoff_lng  DOUBLE PRECISION NOT NULL,
    vehicle_type TEXT NOT NULL,
    status       TEXT NOT NULL,
    requested_at TIMESTAMPTZ NOT NULL,
    accepted_at  TIMESTAMPTZ,
    started_at   TIMESTAMPTZ,
    finished_at  TIMESTAMPTZ,
    cancelled_at TIMESTAMPTZ,
    cancelled_by TEXT,
    price_cents  BIGINT NOT NULL DEFAULT 0,
    version      BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trips_rider_id ON trips (rider_id);
";

pub const CREATE_OUTBOX_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS outbox (
    id         BIGSERIAL PRIMARY KEY,
    topic      TEXT NOT NULL,
    payload    BYTEA NOT NULL,
    published  BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_outbox_unpublished ON outbox (id) WHERE published = false;
";

pub async fn connect_pool(dsn: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(dsn)
        .await
}

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(CREATE_TRIPS_TABLE).execute(pool).await?;
    sqlx::raw_sql(CREATE_OUTBOX_TABLE).execute(pool).await?;
    Ok(())
}
