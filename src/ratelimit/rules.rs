//! Rate limit rules configuration.
//!
//! Rules assign an admission rate and a queue capacity to individual
//! principals, with an optional aggregate default shared by every principal
//! that has no entry of its own.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};

/// The complete set of rate limit rules for the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Per-principal entries, in configuration order
    #[serde(default)]
    pub limits: Vec<PrincipalLimit>,
    /// Rate shared by all principals without an explicit entry
    #[serde(default)]
    pub aggregate_default_qps: Option<f64>,
    /// Queue capacity of the shared aggregate-default limiter
    #[serde(default)]
    pub aggregate_default_capacity: Option<usize>,
}

/// A rate limit entry for a single principal.
///
/// An entry without `qps` gives the principal an explicitly unlimited rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrincipalLimit {
    /// The principal this entry applies to
    pub principal: String,
    /// Maximum sustained admissions per second
    #[serde(default)]
    pub qps: Option<f64>,
    /// Maximum number of queued (not yet admitted) messages
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// Rate and capacity for one limiter, derived from a rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimit {
    pub qps: Option<f64>,
    pub capacity: Option<usize>,
}

impl BucketLimit {
    /// A limit that never throttles and never queues.
    pub const UNLIMITED: BucketLimit = BucketLimit {
        qps: None,
        capacity: None,
    };

    /// Minimum spacing between two admissions, `None` when unlimited.
    ///
    /// Saturates at [`Duration::MAX`] for rates too small to represent.
    pub fn interval(&self) -> Option<Duration> {
        self.qps
            .map(|qps| Duration::try_from_secs_f64(1.0 / qps).unwrap_or(Duration::MAX))
    }
}

impl From<&PrincipalLimit> for BucketLimit {
    fn from(limit: &PrincipalLimit) -> Self {
        BucketLimit {
            qps: limit.qps,
            capacity: limit.capacity,
        }
    }
}

impl RateLimitConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimitConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the registry relies on.
    ///
    /// Duplicate principals are reported as
    /// [`GatekeeperError::ConfigurationConflict`]; they are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.limits.len());

        for limit in &self.limits {
            if limit.principal.is_empty() {
                return Err(GatekeeperError::Config(
                    "rate limit entry with an empty principal".to_string(),
                ));
            }
            if let Some(qps) = limit.qps {
                check_qps(qps, &limit.principal)?;
            }
            if !seen.insert(limit.principal.as_str()) {
                return Err(GatekeeperError::ConfigurationConflict(
                    limit.principal.clone(),
                ));
            }
        }

        if let Some(qps) = self.aggregate_default_qps {
            check_qps(qps, "aggregate default")?;
        } else if self.aggregate_default_capacity.is_some() {
            return Err(GatekeeperError::Config(
                "aggregate_default_capacity requires aggregate_default_qps".to_string(),
            ));
        }

        Ok(())
    }

    /// Index the per-principal entries for lookup.
    pub fn principal_limits(&self) -> HashMap<String, BucketLimit> {
        self.limits
            .iter()
            .map(|limit| (limit.principal.clone(), BucketLimit::from(limit)))
            .collect()
    }

    /// The shared limit for principals without an entry, if configured.
    pub fn aggregate_default(&self) -> Option<BucketLimit> {
        self.aggregate_default_qps.map(|qps| BucketLimit {
            qps: Some(qps),
            capacity: self.aggregate_default_capacity,
        })
    }
}

fn check_qps(qps: f64, owner: &str) -> Result<()> {
    if !(qps.is_finite() && qps > 0.0) {
        return Err(GatekeeperError::Config(format!(
            "qps for {} must be a positive number, got {}",
            owner, qps
        )));
    }
    if Duration::try_from_secs_f64(1.0 / qps).is_err() {
        return Err(GatekeeperError::Config(format!(
            "qps for {} is too small, got {}",
            owner, qps
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_config() {
        let yaml = r#"
limits:
  - principal: framework1
    qps: 1
    capacity: 2
  - principal: framework2
aggregate_default_qps: 0.5
"#;
        let config = RateLimitConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limits.len(), 2);
        assert_eq!(config.limits[0].qps, Some(1.0));
        assert_eq!(config.limits[0].capacity, Some(2));
        assert_eq!(config.limits[1].qps, None);
        assert_eq!(config.aggregate_default_qps, Some(0.5));
        assert_eq!(config.aggregate_default_capacity, None);
    }

    #[test]
    fn test_empty_config() {
        let config = RateLimitConfig::from_yaml("{}").unwrap();
        assert!(config.limits.is_empty());
        assert!(config.aggregate_default().is_none());
    }

    #[test]
    fn test_duplicate_principal_is_conflict() {
        let yaml = r#"
limits:
  - principal: framework1
    qps: 1
  - principal: framework1
    qps: 2
"#;
        let err = RateLimitConfig::from_yaml(yaml).unwrap_err();
        match err {
            GatekeeperError::ConfigurationConflict(principal) => {
                assert_eq!(principal, "framework1")
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_invalid_qps_rejected() {
        for qps in ["0", "-1", ".nan", ".inf"] {
            let yaml = format!("limits:\n  - principal: p\n    qps: {}\n", qps);
            assert!(
                matches!(
                    RateLimitConfig::from_yaml(&yaml),
                    Err(GatekeeperError::Config(_))
                ),
                "qps {} should be rejected",
                qps
            );
        }
    }

    #[test]
    fn test_vanishing_qps_rejected() {
        let yaml = "limits:\n  - principal: p\n    qps: 1.0e-20\n";
        assert!(matches!(
            RateLimitConfig::from_yaml(yaml),
            Err(GatekeeperError::Config(_))
        ));

        let yaml = "aggregate_default_qps: 1.0e-300\n";
        assert!(matches!(
            RateLimitConfig::from_yaml(yaml),
            Err(GatekeeperError::Config(_))
        ));

        // Slow but representable rates are fine.
        assert!(RateLimitConfig::from_yaml("aggregate_default_qps: 0.001\n").is_ok());
    }

    #[test]
    fn test_aggregate_capacity_requires_qps() {
        let yaml = "aggregate_default_capacity: 10\n";
        assert!(matches!(
            RateLimitConfig::from_yaml(yaml),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_empty_principal_rejected() {
        let yaml = "limits:\n  - principal: \"\"\n    qps: 1\n";
        assert!(RateLimitConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_lookup_tables() {
        let yaml = r#"
limits:
  - principal: framework1
    qps: 4
aggregate_default_qps: 2
aggregate_default_capacity: 10
"#;
        let config = RateLimitConfig::from_yaml(yaml).unwrap();
        let limits = config.principal_limits();
        assert_eq!(limits["framework1"].qps, Some(4.0));
        assert_eq!(limits["framework1"].capacity, None);

        let default = config.aggregate_default().unwrap();
        assert_eq!(default.qps, Some(2.0));
        assert_eq!(default.capacity, Some(10));
    }

    #[test]
    fn test_interval() {
        let limit = BucketLimit {
            qps: Some(4.0),
            capacity: None,
        };
        assert_eq!(limit.interval(), Some(Duration::from_millis(250)));
        assert_eq!(BucketLimit::UNLIMITED.interval(), None);

        let tiny = BucketLimit {
            qps: Some(1.0e-20),
            capacity: None,
        };
        assert_eq!(tiny.interval(), Some(Duration::MAX));
    }
}
