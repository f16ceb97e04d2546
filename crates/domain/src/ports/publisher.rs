use super::BoxFuture;
use crate::trip::TripEvent;
use crate::DomainResult;

/// Bus-facing writer. The service uses it for low-latency in-process
/// fan-out; the durable path is the outbox.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &TripEvent) -> BoxFuture<'_, DomainResult<()>>;
}
