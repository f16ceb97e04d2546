use axum::{
    extract::{Path, Query, State},
    http::{
        header::{HeaderValue, CONTENT_TYPE},
        HeaderMap, StatusCode,
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use ridelink_domain::geo::LocationSnapshot;
use ridelink_domain::ports::geo::GeoIndex;
use ridelink_domain::service::{CreateTripInput, CreateTripResponse};
use ridelink_domain::trip::{CancelReason, GeoPoint, Trip};

use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

pub fn router(state: AppState) -> Router {
    let mut read = Router::new()
        .route("/v1/trips/:id", get(get_trip))
        .route("/v1/eta", get(get_eta));
    let mut write = Router::new()
        .route("/v1/trips", post(create_trip))
        .route("/v1/trips/:id/cancel", post(cancel_trip))
        .route("/v1/trips/:id/start", post(start_trip))
        .route("/v1/trips/:id/complete", post(complete_trip))
        .route("/v1/drivers/:id/location", post(upsert_driver_location));

    if !state.config.is_test() {
        read = read.layer(app_middleware::rate_limit_layer(
            state.config.rate_read_rps,
            state.config.rate_read_burst,
        ));
        write = write.layer(app_middleware::rate_limit_layer(
            state.config.rate_write_rps,
            state.config.rate_write_burst,
        ));
    }

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(read)
        .merge(write)
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
    })
}

async fn metrics() -> Response {
    let Some(body) = observability::render_metrics() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    response
}

#[derive(Debug, Deserialize, Validate)]
struct GeoPointRequest {
    #[validate(range(min = -90.0, max = 90.0))]
    lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    lng: f64,
}

impl GeoPointRequest {
    fn into_point(self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

#[derive(Debug, Deserialize, Validate)]
struct CreateTripRequest {
    #[validate(length(min = 1, max = 64))]
    rider_id: String,
    #[validate(nested)]
    pickup: GeoPointRequest,
    #[validate(nested)]
    dropoff: GeoPointRequest,
    #[validate(length(min = 1, max = 64))]
    vehicle_type: String,
}

async fn create_trip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTripRequest>,
) -> Result<(StatusCode, Json<CreateTripResponse>), ApiError> {
    validation::validate(&payload)?;
    let rider_id = Uuid::parse_str(&payload.rider_id)
        .map_err(|_| ApiError::Validation("invalid rider_id".to_string()))?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let response = state
        .trips
        .create_trip(
            idempotency_key,
            CreateTripInput {
                rider_id,
                pickup: payload.pickup.into_point(),
                dropoff: payload.dropoff.into_point(),
                vehicle_type: payload.vehicle_type,
            },
        )
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "trip creation failed");
            ApiError::from(err)
        })?;

    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_trip(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Trip>, ApiError> {
    let trip_id = parse_trip_id(&id)?;
    let trip = state.trips.get_trip(trip_id).await?;
    Ok(Json(trip))
}

#[derive(Debug, Deserialize)]
struct CancelQuery {
    actor: String,
}

async fn cancel_trip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<Trip>, ApiError> {
    let trip_id = parse_trip_id(&id)?;
    let reason = CancelReason::parse(&query.actor)
        .ok_or_else(|| ApiError::Validation("actor must be 'rider' or 'driver'".to_string()))?;
    let trip = state.trips.cancel_trip(trip_id, reason).await?;
    Ok(Json(trip))
}

async fn start_trip(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Trip>, ApiError> {
    let trip_id = parse_trip_id(&id)?;
    let trip = state.trips.start_trip(trip_id).await?;
    Ok(Json(trip))
}

#[derive(Debug, Deserialize)]
struct CompleteTripRequest {
    price_cents: i64,
}

async fn complete_trip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CompleteTripRequest>,
) -> Result<Json<Trip>, ApiError> {
    let trip_id = parse_trip_id(&id)?;
    if payload.price_cents < 0 {
        return Err(ApiError::Validation(
            "price_cents must be non-negative".to_string(),
        ));
    }
    let trip = state
        .trips
        .complete_trip(trip_id, payload.price_cents)
        .await?;
    Ok(Json(trip))
}

#[derive(Debug, Deserialize, Validate)]
struct EtaQuery {
    #[validate(range(min = -90.0, max = 90.0))]
    pickup_lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pickup_lng: f64,
    #[validate(range(min = -90.0, max = 90.0))]
    dropoff_lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    dropoff_lng: f64,
}

#[derive(Serialize)]
struct EtaResponse {
    driver_eta_sec: u64,
    trip_eta_sec: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    driver_id: Option<Uuid>,
}

async fn get_eta(
    State(state): State<AppState>,
    Query(query): Query<EtaQuery>,
) -> Result<Json<EtaResponse>, ApiError> {
    validation::validate(&query)?;
    let estimate = state.eta.estimate(
        GeoPoint::new(query.pickup_lat, query.pickup_lng),
        GeoPoint::new(query.dropoff_lat, query.dropoff_lng),
    );
    Ok(Json(EtaResponse {
        driver_eta_sec: estimate.driver_eta.as_secs(),
        trip_eta_sec: estimate.trip_eta.as_secs(),
        driver_id: estimate.driver_id,
    }))
}

#[derive(Debug, Deserialize, Validate)]
struct LocationUpdateRequest {
    #[validate(range(min = -90.0, max = 90.0))]
    lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    lng: f64,
    speed: Option<f64>,
    accuracy: Option<f64>,
}

/// Thin ingestion hook for the driver-location stream: refreshes both
/// the matcher's geo index and the ETA snapshot cache.
async fn upsert_driver_location(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<LocationUpdateRequest>,
) -> Result<StatusCode, ApiError> {
    validation::validate(&payload)?;
    let driver_id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::Validation("invalid driver id".to_string()))?;
    let point = GeoPoint::new(payload.lat, payload.lng);

    state.geo.upsert_location(driver_id, point).await?;
    state.locations.upsert(LocationSnapshot {
        driver_id,
        point,
        speed: payload.speed.unwrap_or(0.0),
        accuracy: payload.accuracy.unwrap_or(0.0),
        updated_at: time::OffsetDateTime::now_utc(),
    });
    Ok(StatusCode::NO_CONTENT)
}

fn parse_trip_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::Validation("invalid trip id".to_string()))
}
