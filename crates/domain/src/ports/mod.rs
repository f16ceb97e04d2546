use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod clock;
pub mod geo;
pub mod idempotency;
pub mod matching;
pub mod publisher;
pub mod repository;
pub mod reservation;
