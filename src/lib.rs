//! Gatekeeper - per-principal admission control for a cluster coordinator.
//!
//! Messages from registered clients are throttled per principal by token
//! bucket limiters with bounded queues. Clients sharing a principal share a
//! limiter and a pair of message counters; principals without rules of
//! their own fall back to an aggregate default limiter.

pub mod config;
pub mod console;
pub mod error;
pub mod gateway;
pub mod ratelimit;
