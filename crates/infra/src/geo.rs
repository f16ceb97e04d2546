use redis::aio::ConnectionManager;
use uuid::Uuid;

use ridelink_domain::error::DomainError;
use ridelink_domain::ports::geo::GeoIndex;
use ridelink_domain::ports::BoxFuture;
use ridelink_domain::trip::GeoPoint;
use ridelink_domain::DomainResult;

const DEFAULT_KEY: &str = "driver:locs";

/// Redis GEO commands back the fleet index. Sharding by vehicle type is
/// a construction-time concern: build one index per shard key.
#[derive(Clone)]
pub struct RedisGeoIndex {
    manager: ConnectionManager,
    key: String,
}

impl RedisGeoIndex {
    pub async fn connect(redis_url: &str) -> DomainResult<Self> {
        Self::connect_with_key(redis_url, DEFAULT_KEY).await
    }

    pub async fn connect_with_key(redis_url: &str, key: impl Into<String>) -> DomainResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| DomainError::Store(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| DomainError::Store(err.to_string()))?;
        Ok(Self {
            manager,
            key: key.into(),
        })
    }

    pub fn sharded(&self, vehicle_type: &str) -> Self {
        if vehicle_type.is_empty() {
            return self.clone();
        }
        Self {
            manager: self.manager.clone(),
            key: format!("{}:{vehicle_type}", self.key),
        }
    }
}

impl GeoIndex for RedisGeoIndex {
    fn nearby(
        &self,
        point: GeoPoint,
        radius_km: f64,
        k: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<Uuid>>> {
        let key = self.key.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let members: Vec<String> = redis::cmd("GEOSEARCH")
                .arg(&key)
                .arg("FROMLONLAT")
                .arg(point.lng)
                .arg(point.lat)
                .arg("BYRADIUS")
                .arg(radius_km)
                .arg("km")
                .arg("ASC")
                .arg("COUNT")
                .arg(k as i64)
                .query_async(&mut conn)
                .await
                .map_err(|err| DomainError::Store(err.to_string()))?;

            // Entries that are not driver ids cannot match; drop them.
            Ok(members
                .iter()
                .filter_map(|member| Uuid::parse_str(member).ok())
                .collect())
        })
    }

    fn upsert_location(&self, driver_id: Uuid, point: GeoPoint) -> BoxFuture<'_, DomainResult<()>> {
        let key = self.key.clone();
        Box::pin(async move {
            if !point.is_valid() {
                return Err(DomainError::Validation(
                    "location out of WGS84 range".to_string(),
                ));
            }
            let mut conn = self.manager.clone();
            let _: i64 = redis::cmd("GEOADD")
                .arg(&key)
                .arg(point.lng)
                .arg(point.lat)
                .arg(driver_id.to_string())
                .query_async(&mut conn)
                .await
                .map_err(|err| DomainError::Store(err.to_string()))?;
            Ok(())
        })
    }
}
