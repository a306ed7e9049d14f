//! Upstream protection: quota accounting and failure isolation

pub mod circuit;
pub mod rate_limit;

pub use circuit::{CircuitBreaker, CircuitState};
pub use rate_limit::TokenBucket;
