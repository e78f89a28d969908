use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use calpipe::config::Overrides;
use calpipe::data::DataProduct;
use calpipe::engine::{Engine, RunOptions, StepTarget};
use calpipe::observability::MetricsCollector;
use calpipe::record::ExecutionStatus;
use calpipe::reference::{
    BoundReference, ObservationMetadata, ReferenceCache, ReferenceLookup, ReferenceRequest,
    ReferenceRequirement, ReferenceResolver, ReferenceService, ReferenceTable, RetryPolicy,
    ServiceError, TableRule,
};
use calpipe::settings::EngineSettings;
use serde_json::{Map, Value, json};

/// Fails the first `failures` calls, then answers `<reftype>_0001.fits`.
struct FlakyService {
    failures: u32,
    transient: bool,
    calls: AtomicU32,
}

impl FlakyService {
    fn new(failures: u32, transient: bool) -> Arc<Self> {
        Arc::new(Self {
            failures,
            transient,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReferenceService for FlakyService {
    fn lookup(
        &self,
        reftype: &str,
        _metadata: &ObservationMetadata,
    ) -> Result<ReferenceLookup, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(if self.transient {
                ServiceError::Transient(format!("timeout on call {call}"))
            } else {
                ServiceError::Permanent("no such reference".to_string())
            });
        }
        Ok(ReferenceLookup::Found {
            identifier: format!("{reftype}_0001.fits"),
            details: Map::new(),
        })
    }
}

fn request(requirements: Vec<ReferenceRequirement>) -> ReferenceRequest {
    let mut metadata = BTreeMap::new();
    metadata.insert("instrument.detector".to_string(), json!("NRCA1"));
    ReferenceRequest {
        requirements,
        overrides: BTreeMap::new(),
        metadata,
    }
}

#[test]
fn transient_failures_are_retried_until_success() {
    let service = FlakyService::new(2, true);
    let metrics = MetricsCollector::new();
    let resolver =
        ReferenceResolver::new(service.clone(), RetryPolicy::no_delay(3)).with_metrics(metrics.clone());

    let binding = resolver
        .resolve_references(
            &request(vec![ReferenceRequirement::required("flat")]),
            &mut ReferenceCache::new(),
        )
        .unwrap();

    assert_eq!(service.calls(), 3);
    match binding.get("flat").unwrap() {
        BoundReference::Resolved {
            identifier,
            attempts,
            cache_hit,
            ..
        } => {
            assert_eq!(identifier, "flat_0001.fits");
            assert_eq!(*attempts, 3);
            assert!(!cache_hit);
        }
        other => panic!("unexpected binding {other:?}"),
    }
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.reference_lookups, 3);
    assert_eq!(snapshot.reference_retries, 2);
}

#[test]
fn attempts_stop_at_the_configured_maximum() {
    let service = FlakyService::new(10, true);
    let resolver = ReferenceResolver::new(service.clone(), RetryPolicy::no_delay(3));

    let err = resolver
        .resolve_references(
            &request(vec![ReferenceRequirement::required("dark")]),
            &mut ReferenceCache::new(),
        )
        .unwrap_err();

    assert_eq!(service.calls(), 3);
    assert_eq!(err.reftype, "dark");
    assert_eq!(err.attempts, 3);
    assert!(err.cause.is_transient());
}

#[test]
fn permanent_failure_is_not_retried() {
    let service = FlakyService::new(1, false);
    let resolver = ReferenceResolver::new(service.clone(), RetryPolicy::no_delay(5));

    let err = resolver.lookup("flat", &ObservationMetadata::new()).unwrap_err();

    assert_eq!(service.calls(), 1);
    assert_eq!(err.attempts, 1);
    assert!(!err.cause.is_transient());
}

#[test]
fn missing_optional_reference_is_recorded_as_absent() {
    let service = FlakyService::new(1, false);
    let resolver = ReferenceResolver::new(service, RetryPolicy::no_delay(3));
    let mut cache = ReferenceCache::new();

    let binding = resolver
        .resolve_references(
            &request(vec![ReferenceRequirement::optional("bias")]),
            &mut cache,
        )
        .unwrap();

    assert!(matches!(
        binding.get("bias"),
        Some(BoundReference::Absent { .. })
    ));
    assert!(binding.identifier("bias").is_none());
    assert!(cache.is_empty());
}

#[test]
fn not_applicable_answer_binds_without_identifier() {
    let table = ReferenceTable::from_rules(vec![TableRule::not_applicable("linearity")]);
    let resolver = ReferenceResolver::new(Arc::new(table), RetryPolicy::no_delay(1));

    let binding = resolver
        .resolve_references(
            &request(vec![ReferenceRequirement::required("linearity")]),
            &mut ReferenceCache::new(),
        )
        .unwrap();

    let bound = binding.get("linearity").unwrap();
    assert!(matches!(bound, BoundReference::NotApplicable { .. }));
    assert_eq!(bound.identifier(), None);
    assert_eq!(bound.provenance().as_deref(), Some("N/A"));
}

#[test]
fn repeated_lookup_within_a_run_hits_the_cache() {
    let service = FlakyService::new(0, true);
    let metrics = MetricsCollector::new();
    let resolver =
        ReferenceResolver::new(service.clone(), RetryPolicy::no_delay(3)).with_metrics(metrics.clone());
    let mut cache = ReferenceCache::new();
    let req = request(vec![ReferenceRequirement::required("flat")]);

    resolver.resolve_references(&req, &mut cache).unwrap();
    let second = resolver.resolve_references(&req, &mut cache).unwrap();

    assert_eq!(service.calls(), 1);
    assert!(matches!(
        second.get("flat"),
        Some(BoundReference::Resolved { cache_hit: true, .. })
    ));
    assert_eq!(metrics.snapshot().reference_cache_hits, 1);
}

#[test]
fn different_metadata_is_looked_up_again() {
    let service = FlakyService::new(0, true);
    let resolver = ReferenceResolver::new(service.clone(), RetryPolicy::no_delay(3));
    let mut cache = ReferenceCache::new();
    let first = request(vec![ReferenceRequirement::required("flat")]);
    let mut second = first.clone();
    second
        .metadata
        .insert("instrument.detector".to_string(), json!("NRCB2"));

    resolver.resolve_references(&first, &mut cache).unwrap();
    resolver.resolve_references(&second, &mut cache).unwrap();

    assert_eq!(service.calls(), 2);
    assert_eq!(cache.len(), 2);
}

#[test]
fn override_bypasses_the_service() {
    let service = FlakyService::new(0, true);
    let resolver = ReferenceResolver::new(service.clone(), RetryPolicy::no_delay(3));
    let mut req = request(vec![
        ReferenceRequirement::required("flat"),
        ReferenceRequirement::required("dark"),
    ]);
    req.overrides
        .insert("flat".to_string(), "my_flat.fits".to_string());
    req.overrides.insert("dark".to_string(), "N/A".to_string());

    let binding = resolver
        .resolve_references(&req, &mut ReferenceCache::new())
        .unwrap();

    assert_eq!(service.calls(), 0);
    assert!(matches!(
        binding.get("flat"),
        Some(BoundReference::Overridden { identifier }) if identifier == "my_flat.fits"
    ));
    assert!(matches!(
        binding.get("dark"),
        Some(BoundReference::NotApplicable { .. })
    ));
}

#[test]
fn table_rules_match_on_observation_metadata() {
    let table = ReferenceTable::from_rules(vec![
        TableRule::found("flat", "flat_a.fits").when("instrument.detector", "NRCA1"),
        TableRule::found("flat", "flat_any.fits"),
    ]);
    let mut metadata = ObservationMetadata::new();
    metadata.insert("instrument.detector".to_string(), json!("NRCA1"));
    let mut other = ObservationMetadata::new();
    other.insert("instrument.detector".to_string(), json!("NRCB4"));

    let first = table.lookup("flat", &metadata).unwrap();
    let fallback = table.lookup("flat", &other).unwrap();

    assert!(matches!(first, ReferenceLookup::Found { identifier, .. } if identifier == "flat_a.fits"));
    assert!(matches!(fallback, ReferenceLookup::Found { identifier, .. } if identifier == "flat_any.fits"));
    assert!(table.lookup("dark", &metadata).is_err());
}

fn engine_with(service: Arc<dyn ReferenceService>) -> Engine {
    let settings = EngineSettings {
        disable_parameter_references: true,
        retry: RetryPolicy::no_delay(3),
        ..EngineSettings::default()
    };
    Engine::with_default_steps()
        .with_settings(settings)
        .with_reference_service(service)
}

#[test]
fn step_output_carries_reference_provenance() {
    let service = FlakyService::new(1, true);
    let engine = engine_with(service.clone());
    let input = DataProduct::new("exp", json!([2.0, 4.0]));

    let outcome = engine
        .run(&StepTarget::from("flat_field"), input, &RunOptions::new())
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let result = outcome.result.unwrap();
    assert_eq!(
        result.meta_value("ref_file.flat"),
        Some(&Value::String("flat_0001.fits".to_string()))
    );
    assert_eq!(
        result.meta_value("cal_step.flat"),
        Some(&Value::String("COMPLETE".to_string()))
    );
    assert_eq!(service.calls(), 2);
}

#[test]
fn pre_hook_metadata_selects_the_reference() {
    let table = ReferenceTable::from_rules(vec![
        TableRule::found("flat", "flat_hooked.fits").when("annotated", "true"),
    ]);
    let engine = engine_with(Arc::new(table));
    let options = RunOptions::new().overrides(Overrides::new().call("pre_hooks", "annotate"));

    let outcome = engine
        .run(
            &StepTarget::from("flat_field"),
            DataProduct::new("exp", json!([1.0])),
            &options,
        )
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed, "{:?}", outcome.record.root.error);
    assert_eq!(
        outcome.record.root.references.identifier("flat"),
        Some("flat_hooked.fits")
    );
    assert_eq!(
        outcome.result.unwrap().meta_value("ref_file.flat"),
        Some(&Value::String("flat_hooked.fits".to_string()))
    );
}

#[test]
fn override_parameter_reaches_the_reference_binding() {
    let service = FlakyService::new(0, true);
    let engine = engine_with(service.clone());
    let options =
        RunOptions::new().overrides(Overrides::new().call("override_flat", "custom_flat.fits"));

    let outcome = engine
        .run(
            &StepTarget::from("flat_field"),
            DataProduct::new("exp", json!([1.0])),
            &options,
        )
        .unwrap();

    assert_eq!(service.calls(), 0);
    assert_eq!(
        outcome.record.root.references.identifier("flat"),
        Some("custom_flat.fits")
    );
    assert_eq!(
        outcome.result.unwrap().meta_value("ref_file.flat"),
        Some(&Value::String("custom_flat.fits".to_string()))
    );
}

#[test]
fn unresolvable_required_reference_fails_the_step() {
    let service = FlakyService::new(100, false);
    let engine = engine_with(service.clone());

    let outcome = engine
        .run(
            &StepTarget::from("flat_field"),
            DataProduct::new("exp", json!([1.0])),
            &RunOptions::new(),
        )
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.result.is_none());
    let error = outcome.record.root.error.unwrap();
    assert!(error.contains("reference 'flat'"), "{error}");
    assert_eq!(service.calls(), 1);
}

#[test]
fn pipeline_children_share_the_run_cache() {
    let table = ReferenceTable::from_rules(vec![TableRule::found("flat", "flat_x.fits")]);
    let engine = engine_with(Arc::new(table));
    let spec = calpipe::StepSpec::new("pipeline")
        .named("twice")
        .child(calpipe::StepSpec::new("flat_field").named("first"))
        .child(calpipe::StepSpec::new("flat_field").named("second"));

    let outcome = engine
        .run(
            &StepTarget::Spec(spec),
            DataProduct::new("exp", json!([1.0])),
            &RunOptions::new(),
        )
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let second = outcome.record.step("twice.second").unwrap();
    assert!(matches!(
        second.references.get("flat"),
        Some(BoundReference::Resolved { cache_hit: true, .. })
    ));
    assert_eq!(engine.metrics().snapshot().reference_cache_hits, 1);
}
