//! Admission gateway between inbound client messages and the coordinator.
//!
//! The gateway counts every message, runs it through the limiter of its
//! sender's principal and hands admitted messages to the dispatch channel.

mod client;
mod service;

pub use client::ClientId;
pub use service::{Admission, AdmissionGateway, Dispatch};
