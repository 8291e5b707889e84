// src/circuit_breaker/mod.rs
mod breaker;

pub use breaker::{CircuitBreakerManager, CircuitBreakerState, CircuitSnapshot};
