//! Reference-data lookup with retries and a per-run cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ReferenceResolutionError;
use crate::observability::MetricsCollector;

mod table;

pub use table::{ReferenceTable, TableRule};

/// Flattened observation attributes (`instrument.name`, `exposure.type`, ...)
/// used to select references.
pub type ObservationMetadata = BTreeMap<String, Value>;

/// Override value meaning "this reference does not apply".
pub const NOT_APPLICABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceRequirement {
    pub reftype: String,
    pub optional: bool,
}

impl ReferenceRequirement {
    pub fn required(reftype: impl Into<String>) -> Self {
        Self {
            reftype: reftype.into(),
            optional: false,
        }
    }

    pub fn optional(reftype: impl Into<String>) -> Self {
        Self {
            reftype: reftype.into(),
            optional: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceRequest {
    pub requirements: Vec<ReferenceRequirement>,
    /// Per-type identifiers that bypass the service.
    pub overrides: BTreeMap<String, String>,
    pub metadata: ObservationMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceLookup {
    Found {
        identifier: String,
        details: Map<String, Value>,
    },
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("transient service failure: {0}")]
    Transient(String),
    #[error("permanent service failure: {0}")]
    Permanent(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Client contract of the reference-data service.
pub trait ReferenceService: Send + Sync {
    fn lookup(
        &self,
        reftype: &str,
        metadata: &ObservationMetadata,
    ) -> Result<ReferenceLookup, ServiceError>;
}

/// Service used when nothing was configured; every lookup fails permanently.
#[derive(Debug, Default, Clone)]
pub struct UnconfiguredService;

impl ReferenceService for UnconfiguredService {
    fn lookup(
        &self,
        reftype: &str,
        _metadata: &ObservationMetadata,
    ) -> Result<ReferenceLookup, ServiceError> {
        Err(ServiceError::Permanent(format!(
            "no reference service configured for '{reftype}'"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BoundReference {
    Resolved {
        identifier: String,
        #[serde(skip_serializing_if = "Map::is_empty")]
        details: Map<String, Value>,
        cache_hit: bool,
        attempts: u32,
    },
    NotApplicable {
        cache_hit: bool,
    },
    Overridden {
        identifier: String,
    },
    Absent {
        reason: String,
    },
}

impl BoundReference {
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Self::Resolved { identifier, .. } | Self::Overridden { identifier } => {
                Some(identifier)
            }
            _ => None,
        }
    }

    /// Text written to `meta.ref_file.<type>` of a finished result.
    pub fn provenance(&self) -> Option<String> {
        match self {
            Self::Resolved { identifier, .. } | Self::Overridden { identifier } => {
                Some(identifier.clone())
            }
            Self::NotApplicable { .. } => Some(NOT_APPLICABLE.to_string()),
            Self::Absent { .. } => None,
        }
    }

    fn as_cache_hit(&self) -> Self {
        match self {
            Self::Resolved {
                identifier,
                details,
                attempts,
                ..
            } => Self::Resolved {
                identifier: identifier.clone(),
                details: details.clone(),
                cache_hit: true,
                attempts: *attempts,
            },
            Self::NotApplicable { .. } => Self::NotApplicable { cache_hit: true },
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReferenceBinding {
    entries: BTreeMap<String, BoundReference>,
}

impl ReferenceBinding {
    pub fn get(&self, reftype: &str) -> Option<&BoundReference> {
        self.entries.get(reftype)
    }

    pub fn identifier(&self, reftype: &str) -> Option<&str> {
        self.get(reftype).and_then(BoundReference::identifier)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BoundReference)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, reftype: impl Into<String>, bound: BoundReference) {
        self.entries.insert(reftype.into(), bound);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelayStrategy {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: DelayStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: DelayStrategy::Exponential {
                initial_ms: 500,
                multiplier: 2.0,
                max_ms: 10_000,
            },
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: DelayStrategy::Fixed { delay_ms: 0 },
        }
    }

    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay: DelayStrategy::Fixed { delay_ms },
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.delay {
            DelayStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            DelayStrategy::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let scaled = (*initial_ms as f64) * multiplier.max(1.0).powi(exponent);
                let capped = if scaled.is_finite() {
                    scaled.min(*max_ms as f64)
                } else {
                    *max_ms as f64
                };
                Duration::from_millis(capped as u64)
            }
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Bindings already obtained during one run, keyed by reference type and
/// metadata fingerprint.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    entries: HashMap<(String, String), BoundReference>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn metadata_fingerprint(metadata: &ObservationMetadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(metadata).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct ReferenceResolver {
    service: Arc<dyn ReferenceService>,
    policy: RetryPolicy,
    metrics: MetricsCollector,
}

impl ReferenceResolver {
    pub fn new(service: Arc<dyn ReferenceService>, policy: RetryPolicy) -> Self {
        Self {
            service,
            policy,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Bind every requirement of `request`.
    ///
    /// A required type that cannot be looked up fails the whole request; an
    /// optional one is recorded as absent.
    pub fn resolve_references(
        &self,
        request: &ReferenceRequest,
        cache: &mut ReferenceCache,
    ) -> Result<ReferenceBinding, ReferenceResolutionError> {
        let fingerprint = metadata_fingerprint(&request.metadata);
        let mut binding = ReferenceBinding::default();

        for requirement in &request.requirements {
            let reftype = requirement.reftype.as_str();

            if let Some(identifier) = request.overrides.get(reftype) {
                let bound = if identifier.eq_ignore_ascii_case(NOT_APPLICABLE) {
                    BoundReference::NotApplicable { cache_hit: false }
                } else {
                    BoundReference::Overridden {
                        identifier: identifier.clone(),
                    }
                };
                debug!(reftype, ?bound, "Reference overridden");
                binding.insert(reftype, bound);
                continue;
            }

            let key = (reftype.to_string(), fingerprint.clone());
            if let Some(cached) = cache.entries.get(&key) {
                self.metrics.record_cache_hit();
                debug!(reftype, "Reference served from run cache");
                binding.insert(reftype, cached.as_cache_hit());
                continue;
            }

            let bound = match self.lookup(reftype, &request.metadata) {
                Ok((ReferenceLookup::Found { identifier, details }, attempts)) => {
                    info!(reftype, identifier = identifier.as_str(), "Reference resolved");
                    BoundReference::Resolved {
                        identifier,
                        details,
                        cache_hit: false,
                        attempts,
                    }
                }
                Ok((ReferenceLookup::NotApplicable, _)) => {
                    info!(reftype, "Reference not applicable");
                    BoundReference::NotApplicable { cache_hit: false }
                }
                Err(err) if requirement.optional => {
                    warn!(reftype, error = %err, "Optional reference unavailable");
                    binding.insert(
                        reftype,
                        BoundReference::Absent {
                            reason: err.to_string(),
                        },
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            cache.entries.insert(key, bound.clone());
            binding.insert(reftype, bound);
        }

        Ok(binding)
    }

    /// Single lookup with the retry policy applied. Returns the number of
    /// attempts it took.
    pub fn lookup(
        &self,
        reftype: &str,
        metadata: &ObservationMetadata,
    ) -> Result<(ReferenceLookup, u32), ReferenceResolutionError> {
        let max_attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.metrics.record_reference_lookup();
            match self.service.lookup(reftype, metadata) {
                Ok(found) => return Ok((found, attempt)),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        reftype,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Reference lookup failed, retrying"
                    );
                    self.metrics.record_reference_retry();
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(cause) => {
                    return Err(ReferenceResolutionError {
                        reftype: reftype.to_string(),
                        attempts: attempt,
                        cause,
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceResolver")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay: DelayStrategy::Exponential {
                initial_ms: 100,
                multiplier: 2.0,
                max_ms: 1_000,
            },
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(3, 250);
        assert_eq!(policy.delay_for(1), policy.delay_for(3));
    }

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let mut a = ObservationMetadata::new();
        a.insert("instrument.name".into(), Value::from("NIRCAM"));
        a.insert("exposure.type".into(), Value::from("SCI"));
        let mut b = ObservationMetadata::new();
        b.insert("exposure.type".into(), Value::from("SCI"));
        b.insert("instrument.name".into(), Value::from("NIRCAM"));
        assert_eq!(metadata_fingerprint(&a), metadata_fingerprint(&b));
    }

    #[test]
    fn unconfigured_service_fails_permanently() {
        let err = UnconfiguredService
            .lookup("dark", &ObservationMetadata::new())
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
