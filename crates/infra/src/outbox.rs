use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use ridelink_domain::error::DomainError;
use ridelink_domain::DomainResult;

use crate::bus::{BusMessage, BusPublisher, HEADER_TRACEPARENT};

const OUTBOX_PUBLISH_TOTAL: &str = "outbox_publish_total";
const OUTBOX_FAIL_TOTAL: &str = "outbox_fail_total";
const OUTBOX_LAG_SECONDS: &str = "outbox_lag_seconds";

// SKIP LOCKED partitions pending rows between concurrent workers
// without blocking; a locked row is simply someone else's batch.
const SELECT_PENDING: &str = r"
SELECT id, topic, payload, created_at
FROM outbox
WHERE published = false
ORDER BY id
LIMIT $1
FOR UPDATE SKIP LOCKED
";

const MARK_PUBLISHED: &str = "UPDATE outbox SET published = true WHERE id = ANY($1)";

#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub retry_max: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            batch_size: 100,
            retry_max: 3,
        }
    }
}

impl DispatcherConfig {
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.poll_interval.is_zero() {
            self.poll_interval = defaults.poll_interval;
        }
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.retry_max == 0 {
            self.retry_max = defaults.retry_max;
        }
        self
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    topic: String,
    payload: Vec<u8>,
    created_at: OffsetDateTime,
}

/// Drains committed outbox rows to the bus with at-least-once delivery.
/// A row is re-published only after a crash between publish and mark;
/// consumers deduplicate.
pub struct OutboxDispatcher {
    pool: PgPool,
    bus: Arc<dyn BusPublisher>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(pool: PgPool, bus: Arc<dyn BusPublisher>, config: DispatcherConfig) -> Self {
        Self {
            pool,
            bus,
            config: config.normalized(),
        }
    }

    /// Polls until `shutdown` flips. The open transaction of an aborted
    /// batch rolls back on drop, leaving its rows for the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DomainResult<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return Ok(()),
            }
            if *shutdown.borrow() {
                return Ok(());
            }
            if let Err(err) = self.process_batch(&mut shutdown).await {
                error!(error = %err, "outbox batch failed");
            }
        }
    }

    pub async fn process_batch(&self, shutdown: &mut watch::Receiver<bool>) -> DomainResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| DomainError::Store(err.to_string()))?;
        let rows: Vec<OutboxRow> = sqlx::query_as(SELECT_PENDING)
            .bind(self.config.batch_size as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|err| DomainError::Store(err.to_string()))?;

        if rows.is_empty() {
            gauge!(OUTBOX_LAG_SECONDS).set(0.0);
            tx.commit()
                .await
                .map_err(|err| DomainError::Store(err.to_string()))?;
            return Ok(());
        }

        let traceparent = batch_traceparent();
        let mut ids = Vec::with_capacity(rows.len());
        let mut max_lag = 0.0f64;
        let now = OffsetDateTime::now_utc();
        for row in &rows {
            if let Err(err) =
                publish_with_retry(self.bus.as_ref(), &self.config, row, &traceparent, shutdown)
                    .await
            {
                // Abort the whole batch; unmarked rows come back next tick.
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "outbox rollback failed");
                }
                return Err(err);
            }
            ids.push(row.id);
            max_lag = max_lag.max((now - row.created_at).as_seconds_f64().max(0.0));
        }

        if let Err(err) = self.bus.flush().await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "outbox rollback failed");
            }
            return Err(err);
        }

        sqlx::query(MARK_PUBLISHED)
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|err| DomainError::Store(err.to_string()))?;
        tx.commit()
            .await
            .map_err(|err| DomainError::Store(err.to_string()))?;

        counter!(OUTBOX_PUBLISH_TOTAL).increment(ids.len() as u64);
        gauge!(OUTBOX_LAG_SECONDS).set(max_lag);
        debug!(rows = ids.len(), max_lag_seconds = max_lag, "outbox batch published");
        Ok(())
    }
}

async fn publish_with_retry(
    bus: &dyn BusPublisher,
    config: &DispatcherConfig,
    row: &OutboxRow,
    traceparent: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> DomainResult<()> {
    if row.topic.is_empty() {
        return Err(DomainError::Store(format!(
            "outbox row {} missing topic",
            row.id
        )));
    }

    let message = BusMessage {
        subject: row.topic.clone(),
        headers: vec![(HEADER_TRACEPARENT.to_string(), traceparent.to_string())],
        payload: row.payload.clone(),
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match bus.publish(&message).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(error = %err, attempt, outbox_id = row.id, "outbox publish failed");
                if attempt >= config.retry_max {
                    counter!(OUTBOX_FAIL_TOTAL).increment(1);
                    return Err(err);
                }
                let backoff = Duration::from_millis(u64::from(attempt * attempt) * 100);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        return Err(DomainError::Store(
                            "shutdown during publish backoff".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

/// W3C trace context for the batch. Spans here have no upstream parent,
/// so the ids are minted per batch.
fn batch_traceparent() -> String {
    let trace_id = Uuid::new_v4().simple().to_string();
    let span_uuid = Uuid::new_v4().simple().to_string();
    format!("00-{trace_id}-{}-01", &span_uuid[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use ridelink_domain::ports::BoxFuture;

    use crate::db;

    #[derive(Default)]
    struct FlakyBus {
        fail_for: AtomicU32,
        published: Mutex<Vec<BusMessage>>,
        flushes: AtomicU32,
    }

    impl FlakyBus {
        fn failing(times: u32) -> Self {
            Self {
                fail_for: AtomicU32::new(times),
                ..Self::default()
            }
        }

        fn published(&self) -> Vec<BusMessage> {
            self.published.lock().expect("published lock").clone()
        }
    }

    impl BusPublisher for FlakyBus {
        fn publish(&self, message: &BusMessage) -> BoxFuture<'_, DomainResult<()>> {
            let message = message.clone();
            Box::pin(async move {
                if self.fail_for.load(Ordering::SeqCst) > 0 {
                    self.fail_for.fetch_sub(1, Ordering::SeqCst);
                    return Err(DomainError::Bus("simulated bus outage".into()));
                }
                self.published.lock().expect("published lock").push(message);
                Ok(())
            })
        }

        fn flush(&self) -> BoxFuture<'_, DomainResult<()>> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(()) })
        }
    }

    fn row(id: i64) -> OutboxRow {
        OutboxRow {
            id,
            topic: "trip.events".to_string(),
            payload: br#"{"id":1}"#.to_vec(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test(start_paused = true)]
    async fn publish_retries_through_transient_failures() {
        let bus = FlakyBus::failing(3);
        let config = DispatcherConfig {
            retry_max: 5,
            ..DispatcherConfig::default()
        };
        let (_tx, mut shutdown) = shutdown_pair();

        let started = tokio::time::Instant::now();
        publish_with_retry(&bus, &config, &row(1), "00-abc-def-01", &mut shutdown)
            .await
            .expect("publish after retries");

        // attempt^2 * 100ms: 100 + 400 + 900.
        assert_eq!(started.elapsed(), Duration::from_millis(1400));
        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "trip.events");
    }

    #[tokio::test(start_paused = true)]
    async fn publish_gives_up_after_retry_max() {
        let bus = FlakyBus::failing(10);
        let config = DispatcherConfig {
            retry_max: 3,
            ..DispatcherConfig::default()
        };
        let (_tx, mut shutdown) = shutdown_pair();

        let err = publish_with_retry(&bus, &config, &row(7), "00-abc-def-01", &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Bus(_)));
        assert!(bus.published().is_empty());
        // All retry_max attempts burned against the outage.
        assert_eq!(bus.fail_for.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn missing_topic_is_rejected_without_publishing() {
        let bus = FlakyBus::default();
        let config = DispatcherConfig::default();
        let (_tx, mut shutdown) = shutdown_pair();

        let mut bad = row(3);
        bad.topic = String::new();
        let err = publish_with_retry(&bus, &config, &bad, "00-abc-def-01", &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Store(_)));
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_the_backoff_wait() {
        let bus = Arc::new(FlakyBus::failing(10));
        let config = DispatcherConfig {
            retry_max: 5,
            ..DispatcherConfig::default()
        };
        let (tx, mut shutdown) = shutdown_pair();

        let bus_ref = bus.clone();
        let handle = tokio::spawn(async move {
            publish_with_retry(
                bus_ref.as_ref(),
                &config,
                &row(9),
                "00-abc-def-01",
                &mut shutdown,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).expect("signal shutdown");
        let result = handle.await.expect("join");
        assert!(result.is_err());
    }

    #[test]
    fn traceparent_has_w3c_shape() {
        let header = batch_traceparent();
        let parts: Vec<&str> = header.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "00");
        assert_eq!(parts[1].len(), 32);
        assert_eq!(parts[2].len(), 16);
        assert_eq!(parts[3], "01");
    }

    #[test]
    fn zero_config_values_fall_back_to_defaults() {
        let config = DispatcherConfig {
            poll_interval: Duration::ZERO,
            batch_size: 0,
            retry_max: 0,
        }
        .normalized();
        let defaults = DispatcherConfig::default();
        assert_eq!(config.poll_interval, defaults.poll_interval);
        assert_eq!(config.batch_size, defaults.batch_size);
        assert_eq!(config.retry_max, defaults.retry_max);
    }

    async fn test_pool() -> Option<PgPool> {
        let dsn = std::env::var("POSTGRES_DSN")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok()?;
        let pool = db::connect_pool(&dsn).await.ok()?;
        db::ensure_schema(&pool).await.ok()?;
        Some(pool)
    }

    #[tokio::test]
    async fn batch_marks_rows_published_exactly_once() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let topic = format!("test.outbox.{}", Uuid::new_v4().simple());
        sqlx::query("INSERT INTO outbox (topic, payload) VALUES ($1, $2)")
            .bind(&topic)
            .bind(br#"{"seq":1}"#.as_slice())
            .execute(&pool)
            .await
            .expect("insert outbox row");

        let bus = Arc::new(FlakyBus::failing(2));
        let dispatcher = OutboxDispatcher::new(
            pool.clone(),
            bus.clone(),
            DispatcherConfig {
                poll_interval: Duration::from_millis(20),
                batch_size: 10,
                retry_max: 5,
            },
        );

        let (_tx, mut shutdown) = shutdown_pair();
        dispatcher
            .process_batch(&mut shutdown)
            .await
            .expect("first batch");

        let published: bool =
            sqlx::query_scalar("SELECT published FROM outbox WHERE topic = $1")
                .bind(&topic)
                .fetch_one(&pool)
                .await
                .expect("row state");
        assert!(published);
        assert_eq!(
            bus.published()
                .iter()
                .filter(|message| message.subject == topic)
                .count(),
            1
        );

        // A second pass finds nothing new for this topic.
        dispatcher
            .process_batch(&mut shutdown)
            .await
            .expect("second batch");
        assert_eq!(
            bus.published()
                .iter()
                .filter(|message| message.subject == topic)
                .count(),
            1
        );
    }
}
