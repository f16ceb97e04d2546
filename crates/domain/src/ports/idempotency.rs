use super::BoxFuture;
use crate::DomainResult;

/// Maps a caller-supplied idempotency key to the serialized response of
/// the first call. Values are opaque bytes; concurrent puts are
/// last-writer-wins with identical payloads expected.
pub trait IdempotencyStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, DomainResult<Option<Vec<u8>>>>;
    fn put(&self, key: &str, payload: &[u8]) -> BoxFuture<'_, DomainResult<()>>;
}
