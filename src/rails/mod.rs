//! Cross-cutting safety rails shared by every mode.

pub mod circuit_breaker;
pub mod trust;

pub use circuit_breaker::{CircuitBreakerEntry, CircuitBreakerState, FailureRecord};
pub use trust::TrustState;
