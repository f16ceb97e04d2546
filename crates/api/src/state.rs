use std::sync::Arc;

use ridelink_domain::eta::EtaService;
use ridelink_domain::geo::{InMemoryGeoIndex, LocationCache};
use ridelink_domain::matching::{InMemoryReservationStore, Matcher};
use ridelink_domain::memory::{
    InMemoryEventPublisher, InMemoryIdempotencyStore, InMemoryTripRepository, NoopEventPublisher,
};
use ridelink_domain::ports::clock::SystemClock;
use ridelink_domain::ports::geo::GeoIndex;
use ridelink_domain::ports::idempotency::IdempotencyStore;
use ridelink_domain::ports::publisher::EventPublisher;
use ridelink_domain::ports::repository::TripRepository;
use ridelink_domain::ports::reservation::ReservationStore;
use ridelink_domain::service::TripService;
use ridelink_infra::bus::{NatsBus, NatsEventPublisher};
use ridelink_infra::config::AppConfig;
use ridelink_infra::db;
use ridelink_infra::geo::RedisGeoIndex;
use ridelink_infra::idempotency::RedisIdempotencyStore;
use ridelink_infra::repositories::PgTripRepository;
use ridelink_infra::reservation::RedisReservationStore;

/// Capability implementations behind the service; production swaps in
/// durable backends, tests inject in-memory doubles.
pub struct StateParts {
    pub repo: Arc<dyn TripRepository>,
    pub publisher: Arc<dyn EventPublisher>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub geo: Arc<dyn GeoIndex>,
    pub reservations: Arc<dyn ReservationStore>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub trips: TripService,
    pub eta: EtaService,
    pub locations: LocationCache,
    pub geo: Arc<dyn GeoIndex>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let parts = parts_for_config(&config).await?;
        Ok(Self::with_parts(config, parts))
    }

    pub fn with_parts(config: AppConfig, parts: StateParts) -> Self {
        let matcher = Arc::new(Matcher::new(
            parts.geo.clone(),
            parts.reservations,
            config.matcher_config(),
        ));
        let trips = TripService::new(parts.repo, parts.publisher, Arc::new(SystemClock))
            .with_matcher(matcher)
            .with_idempotency(parts.idempotency)
            .with_topic(config.bus_subject.clone());
        let locations = LocationCache::new();
        let eta = EtaService::new(locations.clone());
        Self {
            config,
            trips,
            eta,
            locations,
            geo: parts.geo,
        }
    }
}

async fn parts_for_config(config: &AppConfig) -> anyhow::Result<StateParts> {
    let backend = config.data_backend.trim().to_ascii_lowercase();
    match backend.as_str() {
        "memory" | "mem" | "in-memory" | "in_memory" => {
            if config.is_production() {
                anyhow::bail!(
                    "in-memory backend is not allowed in production; configure DATA_BACKEND=postgres"
                );
            }
            Ok(memory_parts())
        }
        "postgres" | "pg" => {
            let dsn = config.database_dsn();
            if dsn.is_empty() {
                anyhow::bail!("DATA_BACKEND=postgres requires POSTGRES_DSN or DATABASE_URL");
            }
            if config.redis_addr.is_empty() {
                anyhow::bail!("DATA_BACKEND=postgres requires REDIS_ADDR");
            }

            let pool = db::connect_pool(dsn).await?;
            db::ensure_schema(&pool).await?;
            let repo = Arc::new(PgTripRepository::new(pool));

            let redis_url = config.redis_url();
            let reservations = Arc::new(RedisReservationStore::connect(&redis_url).await?);
            let geo = Arc::new(RedisGeoIndex::connect(&redis_url).await?);
            let idempotency = Arc::new(RedisIdempotencyStore::connect(&redis_url).await?);

            let publisher: Arc<dyn EventPublisher> = if config.nats_url.is_empty() {
                Arc::new(NoopEventPublisher)
            } else {
                let bus = Arc::new(NatsBus::connect(&config.nats_url).await?);
                Arc::new(NatsEventPublisher::new(bus, config.bus_subject.clone()))
            };

            Ok(StateParts {
                repo,
                publisher,
                idempotency,
                geo,
                reservations,
            })
        }
        _ => anyhow::bail!("unsupported DATA_BACKEND '{}'", config.data_backend),
    }
}

fn memory_parts() -> StateParts {
    StateParts {
        repo: Arc::new(InMemoryTripRepository::new()),
        publisher: Arc::new(InMemoryEventPublisher::new()),
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        geo: Arc::new(InMemoryGeoIndex::new()),
        reservations: Arc::new(InMemoryReservationStore::new()),
    }
}
