pub mod bus;
pub mod config;
pub mod db;
pub mod geo;
pub mod idempotency;
pub mod logging;
pub mod outbox;
pub mod repositories;
pub mod reservation;
