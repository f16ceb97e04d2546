use std::time::Duration;

use redis::aio::ConnectionManager;

use ridelink_domain::error::DomainError;
use ridelink_domain::ports::idempotency::IdempotencyStore;
use ridelink_domain::ports::BoxFuture;
use ridelink_domain::DomainResult;

const DEFAULT_PREFIX: &str = "ridelink:idemp";
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 24);

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    manager: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str) -> DomainResult<Self> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> DomainResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| DomainError::Store(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| DomainError::Store(err.to_string()))?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn get(&self, key: &str) -> BoxFuture<'_, DomainResult<Option<Vec<u8>>>> {
        let cache_key = self.cache_key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<Vec<u8>> = redis::cmd("GET")
                .arg(&cache_key)
                .query_async(&mut conn)
                .await
                .map_err(|err| DomainError::Store(err.to_string()))?;
            Ok(value)
        })
    }

    fn put(&self, key: &str, payload: &[u8]) -> BoxFuture<'_, DomainResult<()>> {
        let cache_key = self.cache_key(key);
        let payload = payload.to_vec();
        let ttl_ms = self.ttl.as_millis().max(1) as u64;
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: String = redis::cmd("SET")
                .arg(&cache_key)
                .arg(payload)
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|err| DomainError::Store(err.to_string()))?;
            Ok(())
        })
    }
}
