//! Rate limiting logic and state management.

mod counter;
mod key;
mod limiter;
mod registry;
mod rules;

pub use counter::{processed_metric, received_metric, MessageAccounting, MessageCounters};
pub use key::LimiterKey;
pub use limiter::{AdmissionId, Permit, TokenBucketLimiter};
pub use registry::LimiterRegistry;
pub use rules::{BucketLimit, PrincipalLimit, RateLimitConfig};
