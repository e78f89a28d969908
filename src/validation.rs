use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::config::ConfigSource;
use crate::engine::{Engine, RunOptions, StepTarget};
use crate::step::ClassKind;
use crate::step_spec::StepSpec;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Check a spec without running it: structure first, then a full
/// configuration pass when the structure is sound.
pub fn validate_spec(spec: &StepSpec, engine: &Engine) -> ValidationReport {
    let mut report = validate_structure(spec, engine, spec.instance_name());
    if report.is_ok()
        && let Err(err) = engine.configure(
            &StepTarget::Spec(spec.clone()),
            None,
            &RunOptions::default(),
        )
    {
        report
            .errors
            .push(format!("Failed to configure '{}': {err}", spec.instance_name()));
    }
    report
}

pub fn validate_file(path: &Path, engine: &Engine) -> Result<ValidationReport> {
    let location = path.to_string_lossy().to_string();
    let tree = engine
        .config_source()
        .read(&location)
        .with_context(|| format!("Failed to read pipeline definition: {}", path.display()))?;
    let spec = StepSpec::from_tree(&tree, Some(&location))
        .with_context(|| format!("Invalid pipeline definition: {}", path.display()))?;
    Ok(validate_spec(&spec, engine))
}

fn validate_structure(spec: &StepSpec, engine: &Engine, path: &str) -> ValidationReport {
    let mut report = ValidationReport::default();

    let class = match engine.registry().load(&spec.class) {
        Ok(class) => class,
        Err(err) => {
            report.errors.push(format!("Step '{path}': {err}"));
            return report;
        }
    };

    if spec.params.get("skip").and_then(Value::as_bool) == Some(true) {
        report
            .warnings
            .push(format!("Step '{path}' is configured to be skipped"));
    }

    match &class.kind {
        ClassKind::Step(_) => {
            if !spec.steps.is_empty() {
                report.errors.push(format!(
                    "Step '{path}' uses '{}', which is not a pipeline, but lists child steps",
                    class.name
                ));
            }
        }
        ClassKind::Pipeline(blueprint) => {
            let children = if spec.steps.is_empty() {
                &blueprint.steps
            } else {
                &spec.steps
            };
            if children.is_empty() {
                report
                    .errors
                    .push(format!("Pipeline '{path}' must contain at least one step"));
            }
            let mut seen: Vec<&str> = Vec::new();
            for child in children {
                let name = child.instance_name();
                if seen.contains(&name) {
                    report.errors.push(format!(
                        "Pipeline '{path}' has more than one child named '{name}'"
                    ));
                }
                seen.push(name);
                report.merge(validate_structure(child, engine, &format!("{path}.{name}")));
            }
        }
    }

    report
}
