//! Token bucket limiter with a FIFO admission queue.
//!
//! A limiter admits at most one request per `1 / qps` seconds. Requests that
//! are not immediately eligible wait in arrival order; a driver task spawned
//! on the tokio runtime releases the queue head each time the bucket becomes
//! eligible again.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::key::LimiterKey;
use super::rules::BucketLimit;

/// Identifies a queued admission.
///
/// Ids are unique across every limiter in the process, so an id from a
/// discarded limiter never matches an admission in its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdmissionId(u64);

impl fmt::Display for AdmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of scheduling an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// The callback already ran; the request was admitted on the spot.
    Ready,
    /// The request waits in the queue and runs its callback when admitted.
    Queued(AdmissionId),
}

static NEXT_ADMISSION_ID: AtomicU64 = AtomicU64::new(1);

type OnAdmit = Box<dyn FnOnce() + Send + 'static>;

/// A request waiting for its turn.
struct Waiter {
    id: AdmissionId,
    owner: String,
    on_admit: OnAdmit,
}

#[derive(Default)]
struct BucketState {
    queue: VecDeque<Waiter>,
    /// When the most recent admission was released
    last_admit: Option<Instant>,
    driver_running: bool,
}

impl BucketState {
    /// `None` when the next slot lies beyond what the clock can represent.
    fn next_eligible(&self, interval: Option<Duration>, now: Instant) -> Option<Instant> {
        match (self.last_admit, interval) {
            (Some(last), Some(interval)) => last
                .checked_add(interval)
                .map(|next| std::cmp::max(now, next)),
            _ => Some(now),
        }
    }

    fn eligible_now(&self, interval: Option<Duration>, now: Instant) -> bool {
        self.queue.is_empty() && self.next_eligible(interval, now).is_some_and(|at| at <= now)
    }
}

/// Rate limiter for one principal or for a shared pool of principals.
///
/// `admit` never rejects. Callers enforce the capacity bound beforehand with
/// [`TokenBucketLimiter::has_capacity`].
pub struct TokenBucketLimiter {
    key: LimiterKey,
    limit: BucketLimit,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    /// Create a new limiter with the given rate and capacity.
    pub fn new(key: LimiterKey, limit: BucketLimit) -> Self {
        Self {
            key,
            limit,
            state: Mutex::new(BucketState::default()),
        }
    }

    /// The sentinel limiter: no rate, no capacity.
    pub fn unlimited() -> Self {
        Self::new(LimiterKey::Unlimited, BucketLimit::UNLIMITED)
    }

    pub fn key(&self) -> &LimiterKey {
        &self.key
    }

    pub fn limit(&self) -> BucketLimit {
        self.limit
    }

    pub fn qps(&self) -> Option<f64> {
        self.limit.qps
    }

    pub fn capacity(&self) -> Option<usize> {
        self.limit.capacity
    }

    /// Number of admissions currently waiting.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Number of admissions waiting on behalf of `owner`.
    pub fn queued_for(&self, owner: &str) -> usize {
        self.state
            .lock()
            .queue
            .iter()
            .filter(|waiter| waiter.owner == owner)
            .count()
    }

    /// When the most recent admission was released.
    pub fn last_admit(&self) -> Option<Instant> {
        self.state.lock().last_admit
    }

    /// Whether one more admission may be queued without exceeding capacity.
    ///
    /// A request that would be admitted on the spot never occupies the
    /// queue, so it always fits. Unlimited limiters never queue at all.
    pub fn has_capacity(&self) -> bool {
        let Some(capacity) = self.limit.capacity else {
            return true;
        };
        if self.limit.qps.is_none() {
            return true;
        }

        let state = self.state.lock();
        if state.queue.len() < capacity {
            return true;
        }
        state.eligible_now(self.limit.interval(), Instant::now())
    }

    /// Schedule an admission on behalf of `owner`.
    ///
    /// `on_admit` runs exactly once, no sooner than
    /// `max(now, last_admit + 1 / qps)` and after every admission queued
    /// before it, unless the admission is cancelled first. When the request
    /// is eligible immediately, `on_admit` runs before this call returns.
    ///
    /// `on_admit` runs with the limiter locked, so a cancellation either
    /// removes the admission or returns after its callback has finished. The
    /// callback must not call back into the limiter.
    ///
    /// Queued admissions are released by a tokio task, so this must be called
    /// from within a tokio runtime.
    pub fn admit<F>(self: &Arc<Self>, owner: &str, on_admit: F) -> Permit
    where
        F: FnOnce() + Send + 'static,
    {
        let interval = self.limit.interval();
        let mut state = self.state.lock();
        let now = Instant::now();

        if state.eligible_now(interval, now) {
            state.last_admit = Some(now);
            trace!(limiter = %self.key, owner = %owner, "Admitted immediately");
            on_admit();
            return Permit::Ready;
        }

        let id = AdmissionId(NEXT_ADMISSION_ID.fetch_add(1, Ordering::Relaxed));
        state.queue.push_back(Waiter {
            id,
            owner: owner.to_string(),
            on_admit: Box::new(on_admit),
        });

        trace!(
            limiter = %self.key,
            owner = %owner,
            admission = %id,
            queued = state.queue.len(),
            "Admission queued"
        );

        if !state.driver_running {
            state.driver_running = true;
            tokio::spawn(Arc::clone(self).drive());
        }

        Permit::Queued(id)
    }

    /// Remove a queued admission without running it.
    ///
    /// Returns `false` if the admission was already released or cancelled.
    pub fn cancel(&self, id: AdmissionId) -> bool {
        self.cancel_where(id, |_| true)
    }

    /// Remove a queued admission only if `owner` submitted it.
    ///
    /// Returns `false` if the admission belongs to someone else, or was
    /// already released or cancelled.
    pub fn cancel_for(&self, owner: &str, id: AdmissionId) -> bool {
        self.cancel_where(id, |waiter| waiter.owner == owner)
    }

    fn cancel_where(&self, id: AdmissionId, allowed: impl Fn(&Waiter) -> bool) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state
                .queue
                .iter()
                .position(|waiter| waiter.id == id && allowed(waiter))
            {
                Some(index) => state.queue.remove(index),
                None => None,
            }
        };

        match removed {
            Some(waiter) => {
                debug!(limiter = %self.key, owner = %waiter.owner, admission = %id, "Admission cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every queued admission submitted by `owner`.
    ///
    /// Admissions of other owners keep their place in the queue.
    pub fn cancel_owner(&self, owner: &str) -> usize {
        let cancelled: Vec<Waiter> = {
            let mut state = self.state.lock();
            let (cancelled, kept): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(&mut state.queue)
                .into_iter()
                .partition(|waiter| waiter.owner == owner);
            state.queue = kept.into();
            cancelled
        };

        if !cancelled.is_empty() {
            debug!(
                limiter = %self.key,
                owner = %owner,
                cancelled = cancelled.len(),
                "Cancelled queued admissions"
            );
        }
        cancelled.len()
    }

    /// Cancel every queued admission.
    pub fn cancel_all(&self) -> usize {
        let cancelled = std::mem::take(&mut self.state.lock().queue);

        if !cancelled.is_empty() {
            debug!(limiter = %self.key, cancelled = cancelled.len(), "Cancelled all queued admissions");
        }
        cancelled.len()
    }

    /// Release queued admissions one interval apart until the queue drains.
    async fn drive(self: Arc<Self>) {
        let interval = self.limit.interval();

        loop {
            let deadline = {
                let mut state = self.state.lock();
                let deadline = state.next_eligible(interval, Instant::now());
                match deadline {
                    Some(deadline) if !state.queue.is_empty() => deadline,
                    _ => {
                        // Either drained, or the next slot never comes; the
                        // waiters stay queued until cancelled.
                        state.driver_running = false;
                        return;
                    }
                }
            };

            tokio::time::sleep_until(deadline).await;
            self.release_head(interval);
        }
    }

    /// Admit the queue head if its slot has come.
    fn release_head(&self, interval: Option<Duration>) {
        let mut state = self.state.lock();
        let now = Instant::now();
        // An immediate admission may have moved `last_admit` while the
        // queue was briefly empty.
        if state.next_eligible(interval, now).map_or(true, |at| at > now) {
            return;
        }
        let Some(waiter) = state.queue.pop_front() else {
            return;
        };
        state.last_admit = Some(now);

        trace!(limiter = %self.key, owner = %waiter.owner, admission = %waiter.id, "Admission released");
        (waiter.on_admit)();
    }
}

impl fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("key", &self.key)
            .field("qps", &self.limit.qps)
            .field("capacity", &self.limit.capacity)
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<(usize, Instant)>>>;

    fn limiter(qps: Option<f64>, capacity: Option<usize>) -> Arc<TokenBucketLimiter> {
        Arc::new(TokenBucketLimiter::new(
            LimiterKey::Principal("test".to_string()),
            BucketLimit { qps, capacity },
        ))
    }

    fn record(log: &Log, n: usize) -> impl FnOnce() + Send + 'static {
        let log = Arc::clone(log);
        move || log.lock().push((n, Instant::now()))
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn assert_at(actual: Instant, start: Instant, expected: Duration) {
        let elapsed = actual - start;
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "expected admission at {:?}, got {:?}",
            expected,
            elapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_admits_immediately() {
        let limiter = limiter(None, Some(0));
        let log: Log = Arc::default();

        for n in 0..100 {
            assert_eq!(limiter.admit("a", record(&log, n)), Permit::Ready);
            assert!(limiter.has_capacity());
        }

        assert_eq!(log.lock().len(), 100);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_admission_is_immediate() {
        let limiter = limiter(Some(1.0), None);
        let log: Log = Arc::default();

        assert_eq!(limiter.admit("a", record(&log, 0)), Permit::Ready);
        assert_eq!(log.lock().len(), 1);
        assert!(limiter.last_admit().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_resolves_one_interval_apart_in_order() {
        let limiter = limiter(Some(1.0), None);
        let log: Log = Arc::default();
        let start = Instant::now();

        for n in 0..5 {
            limiter.admit("a", record(&log, n));
        }
        assert_eq!(limiter.queued(), 4);

        tokio::time::sleep(Duration::from_secs(10)).await;

        let log = log.lock();
        assert_eq!(log.len(), 5);
        for (k, (n, at)) in log.iter().enumerate() {
            assert_eq!(*n, k);
            assert_at(*at, start, Duration::from_secs(k as u64));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_admission_waits_full_interval() {
        let limiter = limiter(Some(1.0), None);
        let log: Log = Arc::default();

        limiter.admit("a", record(&log, 0));
        let permit = limiter.admit("a", record(&log, 1));
        assert!(matches!(permit, Permit::Queued(_)));

        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        assert_eq!(log.lock().len(), 1);

        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        assert_eq!(log.lock().len(), 2);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_bucket_admits_immediately_after_interval() {
        let limiter = limiter(Some(2.0), None);
        let log: Log = Arc::default();

        assert_eq!(limiter.admit("a", record(&log, 0)), Permit::Ready);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(limiter.admit("a", record(&log, 1)), Permit::Ready);
        assert!(matches!(limiter.admit("a", record(&log, 2)), Permit::Queued(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_counts_only_queued() {
        let limiter = limiter(Some(1.0), Some(2));
        let log: Log = Arc::default();

        limiter.admit("a", record(&log, 0));
        assert!(limiter.has_capacity());
        limiter.admit("a", record(&log, 1));
        assert!(limiter.has_capacity());
        limiter.admit("a", record(&log, 2));
        assert!(!limiter.has_capacity());

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(limiter.has_capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_only_admits_eligible_requests() {
        let limiter = limiter(Some(1.0), Some(0));
        let log: Log = Arc::default();

        assert!(limiter.has_capacity());
        assert_eq!(limiter.admit("a", record(&log, 0)), Permit::Ready);
        assert!(!limiter.has_capacity());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.has_capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_never_runs() {
        let limiter = limiter(Some(1.0), None);
        let log: Log = Arc::default();

        limiter.admit("a", record(&log, 0));
        let id = match limiter.admit("a", record(&log, 1)) {
            Permit::Queued(id) => id,
            Permit::Ready => panic!("second admission should queue"),
        };

        assert!(limiter.cancel(id));
        assert!(!limiter.cancel(id));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_release_is_noop() {
        let limiter = limiter(Some(1.0), None);
        let log: Log = Arc::default();

        limiter.admit("a", record(&log, 0));
        let Permit::Queued(id) = limiter.admit("a", record(&log, 1)) else {
            panic!("second admission should queue");
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.lock().len(), 2);
        assert!(!limiter.cancel(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_owner_keeps_other_owners() {
        let limiter = limiter(Some(1.0), None);
        let log: Log = Arc::default();
        let start = Instant::now();

        limiter.admit("a", record(&log, 0));
        limiter.admit("b", record(&log, 1));
        limiter.admit("a", record(&log, 2));
        limiter.admit("b", record(&log, 3));

        assert_eq!(limiter.queued_for("a"), 1);
        assert_eq!(limiter.cancel_owner("b"), 2);
        assert_eq!(limiter.cancel_owner("b"), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;

        let log = log.lock();
        let order: Vec<usize> = log.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![0, 2]);
        assert_at(log[1].1, start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_driver() {
        let limiter = limiter(Some(1.0), None);
        let log: Log = Arc::default();

        for n in 0..4 {
            limiter.admit("a", record(&log, n));
        }
        assert_eq!(limiter.cancel_all(), 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(log.lock().len(), 1);

        // The bucket keeps working after the queue was drained.
        assert_eq!(limiter.admit("a", record(&log, 9)), Permit::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_for_checks_owner() {
        let limiter = limiter(Some(1.0), None);
        let log: Log = Arc::default();

        limiter.admit("a", record(&log, 0));
        let Permit::Queued(id) = limiter.admit("b", record(&log, 1)) else {
            panic!("second admission should queue");
        };

        assert!(!limiter.cancel_for("a", id));
        assert_eq!(limiter.queued_for("b"), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let order: Vec<usize> = log.lock().iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_for_removes_own_admission() {
        let limiter = limiter(Some(1.0), None);
        let log: Log = Arc::default();

        limiter.admit("a", record(&log, 0));
        let Permit::Queued(id) = limiter.admit("b", record(&log, 1)) else {
            panic!("second admission should queue");
        };

        assert!(limiter.cancel_for("b", id));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_ids_unique_across_limiters() {
        let first = limiter(Some(1.0), None);
        first.admit("a", || {});
        let Permit::Queued(stale) = first.admit("a", || {}) else {
            panic!("second admission should queue");
        };
        first.cancel_all();

        // A replacement limiter for the same principal.
        let second = limiter(Some(1.0), None);
        let log: Log = Arc::default();
        second.admit("a", record(&log, 0));
        let Permit::Queued(fresh) = second.admit("a", record(&log, 1)) else {
            panic!("second admission should queue");
        };

        assert_ne!(stale, fresh);
        assert!(!second.cancel(stale));
        assert_eq!(second.queued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_runs_callback_with_queue_locked() {
        let limiter = limiter(Some(1.0), None);
        let locked = Arc::new(Mutex::new(Vec::new()));

        limiter.admit("a", || {});
        let weak = Arc::downgrade(&limiter);
        let seen = Arc::clone(&locked);
        limiter.admit("a", move || {
            let limiter = weak.upgrade().expect("limiter alive while driving");
            seen.lock().push(limiter.state.try_lock().is_none());
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        // A concurrent cancel_owner cannot slip between dequeue and dispatch.
        assert_eq!(*locked.lock(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_next_slot_keeps_waiters_queued() {
        let limiter = limiter(Some(1.0e-20), Some(4));
        let log: Log = Arc::default();

        assert_eq!(limiter.admit("a", record(&log, 0)), Permit::Ready);
        assert!(limiter.has_capacity());
        assert!(matches!(limiter.admit("a", record(&log, 1)), Permit::Queued(_)));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(log.lock().len(), 1);
        assert_eq!(limiter.queued(), 1);
        assert_eq!(limiter.cancel_owner("a"), 1);
    }
}
