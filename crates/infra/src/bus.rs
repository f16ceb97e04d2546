use std::str::FromStr;
use std::sync::Arc;

use ridelink_domain::error::DomainError;
use ridelink_domain::ports::publisher::EventPublisher;
use ridelink_domain::ports::BoxFuture;
use ridelink_domain::trip::TripEvent;
use ridelink_domain::DomainResult;

pub const HEADER_EVENT_TYPE: &str = "x-event-type";
pub const HEADER_TRACEPARENT: &str = "traceparent";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

/// Raw bus writer used by the outbox dispatcher. `publish` may buffer;
/// `flush` must not return before buffered messages are on the wire.
pub trait BusPublisher: Send + Sync {
    fn publish(&self, message: &BusMessage) -> BoxFuture<'_, DomainResult<()>>;
    fn flush(&self) -> BoxFuture<'_, DomainResult<()>>;
}

#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(nats_url: &str) -> DomainResult<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|err| DomainError::Bus(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> async_nats::Client {
        self.client.clone()
    }
}

impl BusPublisher for NatsBus {
    fn publish(&self, message: &BusMessage) -> BoxFuture<'_, DomainResult<()>> {
        let subject = message.subject.clone();
        let payload = message.payload.clone();
        let mut headers = async_nats::HeaderMap::new();
        for (name, value) in &message.headers {
            if let (Ok(name), Ok(value)) = (
                async_nats::header::HeaderName::from_str(name),
                async_nats::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        Box::pin(async move {
            self.client
                .publish_with_headers(subject, headers, payload.into())
                .await
                .map_err(|err| DomainError::Bus(err.to_string()))
        })
    }

    fn flush(&self) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            self.client
                .flush()
                .await
                .map_err(|err| DomainError::Bus(err.to_string()))
        })
    }
}

/// In-process fan-out path of the trip service. Best-effort by design;
/// the outbox carries the durable copy.
#[derive(Clone)]
pub struct NatsEventPublisher {
    bus: Arc<NatsBus>,
    subject: String,
}

impl NatsEventPublisher {
    pub fn new(bus: Arc<NatsBus>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }
}

impl EventPublisher for NatsEventPublisher {
    fn publish(&self, event: &TripEvent) -> BoxFuture<'_, DomainResult<()>> {
        let subject = if event.topic.is_empty() {
            self.subject.clone()
        } else {
            event.topic.clone()
        };
        let message = BusMessage {
            subject,
            headers: vec![(
                HEADER_EVENT_TYPE.to_string(),
                event.event_type.as_str().to_string(),
            )],
            payload: serde_json::to_vec(&event.envelope()).unwrap_or_default(),
        };
        Box::pin(async move { self.bus.publish(&message).await })
    }
}
