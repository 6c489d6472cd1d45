//! Limiter identity.

/// Identifies which token bucket a limiter represents.
///
/// Principals with an explicit rule get a dedicated bucket; every other
/// principal shares either the aggregate-default bucket or the unlimited
/// sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimiterKey {
    /// Dedicated limiter for one configured principal
    Principal(String),
    /// The bucket shared by all principals without an explicit rule
    AggregateDefault,
    /// Sentinel used when no rule applies at all
    Unlimited,
}

impl LimiterKey {
    /// Whether the registry may discard this limiter once unreferenced.
    pub fn is_dedicated(&self) -> bool {
        matches!(self, LimiterKey::Principal(_))
    }

    /// Convert the key to a string representation for logging.
    pub fn to_string_key(&self) -> String {
        match self {
            LimiterKey::Principal(principal) => format!("principal:{}", principal),
            LimiterKey::AggregateDefault => "aggregate-default".to_string(),
            LimiterKey::Unlimited => "unlimited".to_string(),
        }
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
