//! Property-based tests for caching and health statistics using proptest.
//!
//! These tests verify invariants that routing and caching depend on:
//!
//! - Cache keys are deterministic and sensitive to temperature
//! - Canonical JSON stays pure ASCII for arbitrary text
//! - Success rate stays within [0, 1] under any outcome sequence
//! - Latency EMA converges to a constant latency
