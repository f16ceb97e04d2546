use std::time::Duration;

use serde::Deserialize;

use ridelink_domain::matching::MatcherConfig;

use crate::outbox::DispatcherConfig;

// The source history carried two spellings for the matcher knobs; only
// the MATCH_* names are accepted and the stragglers fail fast.
const LEGACY_MATCHER_KEYS: [(&str, &str); 2] = [
    ("CANDIDATE_LIMIT", "MATCH_TOPK"),
    ("SEARCH_RADIUS_KM", "MATCH_RADIUS_KM"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub http_addr: String,
    pub log_level: String,
    pub data_backend: String,
    pub postgres_dsn: String,
    pub database_url: String,
    pub redis_addr: String,
    pub nats_url: String,
    pub bus_subject: String,
    pub match_radius_km: f64,
    pub match_topk: usize,
    pub reserve_ttl_sec: u64,
    pub match_max_attempts: u32,
    pub match_backoff_ms: u64,
    pub outbox_poll_ms: u64,
    pub outbox_batch: usize,
    pub outbox_retry_max: u32,
    pub rate_read_rps: u64,
    pub rate_read_burst: u32,
    pub rate_write_rps: u64,
    pub rate_write_burst: u32,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        reject_legacy_matcher_keys(std::env::vars().map(|(key, _)| key))?;
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("http_addr", "0.0.0.0:8080")?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("postgres_dsn", "")?
            .set_default("database_url", "")?
            .set_default("redis_addr", "")?
            .set_default("nats_url", "")?
            .set_default("bus_subject", "trip.events")?
            .set_default("match_radius_km", 5.0)?
            .set_default("match_topk", 5)?
            .set_default("reserve_ttl_sec", 10)?
            .set_default("match_max_attempts", 5)?
            .set_default("match_backoff_ms", 50)?
            .set_default("outbox_poll_ms", 200)?
            .set_default("outbox_batch", 100)?
            .set_default("outbox_retry_max", 3)?
            .set_default("rate_read_rps", 100)?
            .set_default("rate_read_burst", 200)?
            .set_default("rate_write_rps", 50)?
            .set_default("rate_write_burst", 100)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn is_test(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("test")
    }

    /// POSTGRES_DSN wins; DATABASE_URL is the compatibility alias.
    pub fn database_dsn(&self) -> &str {
        if self.postgres_dsn.is_empty() {
            &self.database_url
        } else {
            &self.postgres_dsn
        }
    }

    pub fn redis_url(&self) -> String {
        if self.redis_addr.contains("://") {
            self.redis_addr.clone()
        } else {
            format!("redis://{}", self.redis_addr)
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            radius_km: self.match_radius_km,
            top_k: self.match_topk,
            reserve_ttl: Duration::from_secs(self.reserve_ttl_sec),
            max_attempts: self.match_max_attempts,
            base_backoff: Duration::from_millis(self.match_backoff_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(self.outbox_poll_ms),
            batch_size: self.outbox_batch,
            retry_max: self.outbox_retry_max,
        }
    }
}

fn reject_legacy_matcher_keys(
    present: impl Iterator<Item = String>,
) -> Result<(), config::ConfigError> {
    for key in present {
        for (legacy, canonical) in LEGACY_MATCHER_KEYS {
            if key.eq_ignore_ascii_case(legacy) {
                return Err(config::ConfigError::Message(format!(
                    "ambiguous matcher config: {legacy} is not supported, set {canonical}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_matcher_keys_are_rejected() {
        let err = reject_legacy_matcher_keys(
            ["PATH", "CANDIDATE_LIMIT"].into_iter().map(String::from),
        )
        .unwrap_err();
        assert!(err.to_string().contains("MATCH_TOPK"));

        let err = reject_legacy_matcher_keys(
            ["search_radius_km"].into_iter().map(String::from),
        )
        .unwrap_err();
        assert!(err.to_string().contains("MATCH_RADIUS_KM"));
    }

    #[test]
    fn canonical_keys_pass() {
        reject_legacy_matcher_keys(
            ["MATCH_TOPK", "MATCH_RADIUS_KM", "HTTP_ADDR"]
                .into_iter()
                .map(String::from),
        )
        .expect("canonical keys");
    }

    #[test]
    fn dsn_prefers_postgres_dsn_over_database_url() {
        let config = AppConfig {
            app_env: "test".into(),
            http_addr: "0.0.0.0:8080".into(),
            log_level: "info".into(),
            data_backend: "memory".into(),
            postgres_dsn: "postgres://primary".into(),
            database_url: "postgres://fallback".into(),
            redis_addr: "127.0.0.1:6379".into(),
            nats_url: String::new(),
            bus_subject: "trip.events".into(),
            match_radius_km: 5.0,
            match_topk: 5,
            reserve_ttl_sec: 10,
            match_max_attempts: 5,
            match_backoff_ms: 50,
            outbox_poll_ms: 200,
            outbox_batch: 100,
            outbox_retry_max: 3,
            rate_read_rps: 100,
            rate_read_burst: 200,
            rate_write_rps: 50,
            rate_write_burst: 100,
        };
        assert_eq!(config.database_dsn(), "postgres://primary");

        let mut fallback = config.clone();
        fallback.postgres_dsn = String::new();
        assert_eq!(fallback.database_dsn(), "postgres://fallback");
    }

    #[test]
    fn redis_url_gains_scheme_when_missing() {
        let mut config = AppConfig {
            app_env: "test".into(),
            http_addr: "0.0.0.0:8080".into(),
            log_level: "info".into(),
            data_backend: "memory".into(),
            postgres_dsn: String::new(),
            database_url: String::new(),
            redis_addr: "127.0.0.1:6379".into(),
            nats_url: String::new(),
            bus_subject: "trip.events".into(),
            match_radius_km: 5.0,
            match_topk: 5,
            reserve_ttl_sec: 10,
            match_max_attempts: 5,
            match_backoff_ms: 50,
            outbox_poll_ms: 200,
            outbox_batch: 100,
            outbox_retry_max: 3,
            rate_read_rps: 100,
            rate_read_burst: 200,
            rate_write_rps: 50,
            rate_write_burst: 100,
        };
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379");
        config.redis_addr = "rediss://cache:6380".into();
        assert_eq!(config.redis_url(), "rediss://cache:6380");
    }
}
