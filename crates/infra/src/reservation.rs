use std::time::Duration;

use redis::aio::ConnectionManager;
use uuid::Uuid;

use ridelink_domain::error::DomainError;
use ridelink_domain::ports::reservation::ReservationStore;
use ridelink_domain::ports::BoxFuture;
use ridelink_domain::DomainResult;

const DEFAULT_PREFIX: &str = "reserve:driver:";

/// SET NX PX is the whole locking protocol: one writer per key per TTL
/// window, no fencing tokens.
#[derive(Clone)]
pub struct RedisReservationStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisReservationStore {
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
        })
    }

    fn key(&self, driver_id: Uuid) -> String {
        format!("{}{driver_id}", self.prefix)
    }

    fn ttl_ms(ttl: Duration) -> u64 {
        let ms = ttl.as_millis() as u64;
        if ms == 0 {
            10_000
        } else {
            ms
        }
    }
}

impl ReservationStore for RedisReservationStore {
    fn try_reserve(
        &self,
        driver_id: Uuid,
        trip_id: Uuid,
        ttl: Duration,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let key = self.key(driver_id);
        let ttl_ms = Self::ttl_ms(ttl);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let result: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(trip_id.to_string())
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|err| DomainError::Store(err.to_string()))?;
            Ok(result.is_some())
        })
    }

    fn release(&self, driver_id: Uuid) -> BoxFuture<'_, DomainResult<()>> {
        let key = self.key(driver_id);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = redis::cmd("DEL")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|err| DomainError::Store(err.to_string()))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Option<RedisReservationStore> {
        let url = std::env::var("REDIS_ADDR")
            .map(|addr| {
                if addr.contains("://") {
                    addr
                } else {
                    format!("redis://{addr}")
                }
            })
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let prefix = format!("test:reserve:{}:", Uuid::new_v4().simple());
        RedisReservationStore::connect_with_prefix(&url, prefix)
            .await
            .ok()
    }

    #[tokio::test]
    async fn reserve_is_exclusive_per_driver() {
        let Some(store) = store().await else {
            return;
        };
        let driver = Uuid::new_v4();

        assert!(store
            .try_reserve(driver, Uuid::new_v4(), Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .try_reserve(driver, Uuid::new_v4(), Duration::from_secs(10))
            .await
            .unwrap());

        store.release(driver).await.unwrap();
        assert!(store
            .try_reserve(driver, Uuid::new_v4(), Duration::from_secs(10))
            .await
            .unwrap());
        store.release(driver).await.unwrap();
    }

    #[tokio::test]
    async fn reservation_expires_with_ttl() {
        let Some(store) = store().await else {
            return;
        };
        let driver = Uuid::new_v4();

        assert!(store
            .try_reserve(driver, Uuid::new_v4(), Duration::from_millis(50))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store
            .try_reserve(driver, Uuid::new_v4(), Duration::from_millis(50))
            .await
            .unwrap());
    }
}
