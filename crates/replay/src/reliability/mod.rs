//! Reliability primitives

mod retry;

pub use retry::RetryPolicy;
