pub mod error;
pub mod eta;
pub mod geo;
pub mod matching;
pub mod memory;
pub mod ports;
pub mod service;
pub mod trip;

pub type DomainResult<T> = Result<T, error::DomainError>;
