//! Resilience primitives for stage calls.
//!
//! Covers single-attempt transport, retry with backoff, per-target circuit
//! breaking, and background recovery of dead-lettered messages.

pub mod circuit_breaker;
pub mod recovery;
pub mod retry;
pub mod transport;
