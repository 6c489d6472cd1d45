//! Per-principal message accounting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

/// Received/processed counters for one principal.
///
/// Counters are updated with atomic operations so snapshots can be taken
/// while admissions are in flight.
#[derive(Debug, Default)]
pub struct MessageCounters {
    received: AtomicU64,
    processed: AtomicU64,
}

impl MessageCounters {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Count one admitted message.
    pub fn add_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Message counters keyed by principal.
///
/// A record exists only while the principal has live clients; the registry
/// adds and removes records as clients come and go.
#[derive(Debug, Default)]
pub struct MessageAccounting {
    counters: DashMap<String, Arc<MessageCounters>>,
}

impl MessageAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `principal` with zeroed counters.
    ///
    /// Existing counters are left untouched.
    pub fn track(&self, principal: &str) {
        self.counters
            .entry(principal.to_string())
            .or_insert_with(|| Arc::new(MessageCounters::default()));
    }

    /// Stop tracking `principal`, discarding its counters.
    pub fn untrack(&self, principal: &str) -> bool {
        self.counters.remove(principal).is_some()
    }

    /// Count a message that arrived from `principal`.
    pub fn record_received(&self, principal: &str) {
        match self.counters.get(principal) {
            Some(counters) => {
                counters.received.fetch_add(1, Ordering::SeqCst);
            }
            None => trace!(principal = %principal, "No counters for principal, message not counted"),
        }
    }

    /// Count a message from `principal` that was admitted for dispatch.
    pub fn record_processed(&self, principal: &str) {
        if let Some(counters) = self.counters.get(principal) {
            counters.add_processed();
        }
    }

    /// Counters for `principal`, if it is tracked.
    pub fn get(&self, principal: &str) -> Option<Arc<MessageCounters>> {
        self.counters.get(principal).map(|c| Arc::clone(c.value()))
    }

    pub fn contains(&self, principal: &str) -> bool {
        self.counters.contains_key(principal)
    }

    /// Number of tracked principals.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// All counters as named metrics, sorted by name.
    ///
    /// Each tracked principal contributes
    /// `frameworks/<principal>/messages_received` and
    /// `frameworks/<principal>/messages_processed`.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let mut metrics = BTreeMap::new();
        for entry in self.counters.iter() {
            // Read processed first so a concurrent admission can never make
            // the snapshot show processed > received.
            let processed = entry.value().processed();
            let received = entry.value().received();
            metrics.insert(received_metric(entry.key()), received);
            metrics.insert(processed_metric(entry.key()), processed);
        }
        metrics
    }

    /// The snapshot rendered as a flat JSON object.
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.snapshot()
                .into_iter()
                .map(|(name, value)| (name, serde_json::Value::from(value)))
                .collect(),
        )
    }
}

/// Metric name for messages received from `principal`.
pub fn received_metric(principal: &str) -> String {
    format!("frameworks/{}/messages_received", principal)
}

/// Metric name for messages processed for `principal`.
pub fn processed_metric(principal: &str) -> String {
    format!("frameworks/{}/messages_processed", principal)
}
