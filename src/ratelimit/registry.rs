//! Mapping from principals to their limiters and accounting records.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::counter::MessageAccounting;
use super::key::LimiterKey;
use super::limiter::TokenBucketLimiter;
use super::rules::{BucketLimit, RateLimitConfig};

/// Owns every limiter in the process and the per-principal reference counts.
///
/// Dedicated limiters are created lazily on first lookup and discarded once
/// the last client of their principal is released. The aggregate-default and
/// unlimited limiters live as long as the registry.
pub struct LimiterRegistry {
    /// Explicit rules, by principal
    limits: HashMap<String, BucketLimit>,
    aggregate_default: Option<Arc<TokenBucketLimiter>>,
    unlimited: Arc<TokenBucketLimiter>,
    accounting: MessageAccounting,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    /// Lazily created dedicated limiters
    dedicated: HashMap<String, Arc<TokenBucketLimiter>>,
    /// Live clients per principal
    references: HashMap<String, usize>,
}

impl LimiterRegistry {
    /// Create a registry for a validated configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        let aggregate_default = config.aggregate_default().map(|limit| {
            info!(
                qps = ?limit.qps,
                capacity = ?limit.capacity,
                "Aggregate default rate limit enabled"
            );
            Arc::new(TokenBucketLimiter::new(LimiterKey::AggregateDefault, limit))
        });

        Self {
            limits: config.principal_limits(),
            aggregate_default,
            unlimited: Arc::new(TokenBucketLimiter::unlimited()),
            accounting: MessageAccounting::new(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// The limiter that applies to `principal`.
    ///
    /// A principal with an explicit rule gets its own limiter; otherwise the
    /// shared aggregate-default limiter, or the unlimited sentinel when no
    /// aggregate default is configured. Dedicated limiters are only discarded
    /// by [`LimiterRegistry::release`], so callers should resolve principals
    /// they have acquired.
    pub fn resolve(&self, principal: &str) -> Arc<TokenBucketLimiter> {
        if let Some(limit) = self.limits.get(principal) {
            let mut state = self.state.lock();
            let limiter = state
                .dedicated
                .entry(principal.to_string())
                .or_insert_with(|| {
                    debug!(
                        principal = %principal,
                        qps = ?limit.qps,
                        capacity = ?limit.capacity,
                        "Creating rate limiter"
                    );
                    Arc::new(TokenBucketLimiter::new(
                        LimiterKey::Principal(principal.to_string()),
                        *limit,
                    ))
                });
            return Arc::clone(limiter);
        }

        match &self.aggregate_default {
            Some(limiter) => Arc::clone(limiter),
            None => Arc::clone(&self.unlimited),
        }
    }

    /// Like [`LimiterRegistry::resolve`], but never creates a limiter.
    pub fn lookup(&self, principal: &str) -> Option<Arc<TokenBucketLimiter>> {
        if self.limits.contains_key(principal) {
            return self.state.lock().dedicated.get(principal).cloned();
        }

        match &self.aggregate_default {
            Some(limiter) => Some(Arc::clone(limiter)),
            None => Some(Arc::clone(&self.unlimited)),
        }
    }

    /// Register one more live client under `principal`.
    ///
    /// The first client creates the principal's accounting record.
    pub fn acquire(&self, principal: &str) -> usize {
        let mut state = self.state.lock();
        let count = state.references.entry(principal.to_string()).or_insert(0);
        *count += 1;

        if *count == 1 {
            self.accounting.track(principal);
            debug!(principal = %principal, "Tracking messages for principal");
        }
        *count
    }

    /// Drop one live client of `principal`.
    ///
    /// When the last client goes away the accounting record is removed and a
    /// dedicated limiter is discarded along with its queued admissions.
    /// Releasing an unknown principal is a no-op.
    pub fn release(&self, principal: &str) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            let Some(count) = state.references.get_mut(principal) else {
                warn!(principal = %principal, "Release of principal without live clients");
                return 0;
            };

            *count -= 1;
            if *count > 0 {
                return *count;
            }

            state.references.remove(principal);
            self.accounting.untrack(principal);
            state.dedicated.remove(principal)
        };

        debug!(principal = %principal, "Stopped tracking messages for principal");

        if let Some(limiter) = discarded {
            let cancelled = limiter.cancel_all();
            debug!(principal = %principal, cancelled = cancelled, "Discarded rate limiter");
        }
        0
    }

    /// Live clients currently registered under `principal`.
    pub fn references(&self, principal: &str) -> usize {
        self.state
            .lock()
            .references
            .get(principal)
            .copied()
            .unwrap_or(0)
    }

    /// Whether `principal` currently has a dedicated limiter.
    pub fn has_dedicated(&self, principal: &str) -> bool {
        self.state.lock().dedicated.contains_key(principal)
    }

    /// Number of dedicated limiters currently alive.
    pub fn dedicated_count(&self) -> usize {
        self.state.lock().dedicated.len()
    }

    pub fn accounting(&self) -> &MessageAccounting {
        &self.accounting
    }

    /// Cancel queued admissions in every limiter.
    pub fn cancel_all(&self) -> usize {
        let dedicated: Vec<Arc<TokenBucketLimiter>> =
            self.state.lock().dedicated.values().cloned().collect();

        let mut cancelled = dedicated.iter().map(|l| l.cancel_all()).sum::<usize>();
        if let Some(limiter) = &self.aggregate_default {
            cancelled += limiter.cancel_all();
        }
        cancelled
    }
}
