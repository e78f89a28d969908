//! The step contract, step classes and the shared lifecycle driver.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::data::DataProduct;
use crate::params::{ParamSpec, ParameterSet, StepSchema};
use crate::pipeline::{FailurePolicy, Pipeline, PipelineBlueprint};
use crate::reference::{ReferenceBinding, ReferenceRequest, ReferenceRequirement};

/// A unit of processing work.
///
/// Parameters are handed to the factory at configuration time; `run` sees the
/// same values plus the reference bindings through [`StepContext`].
pub trait Step: Send + Sync {
    fn run(&self, input: &DataProduct, ctx: &StepContext) -> Result<DataProduct>;

    /// Input predicate: `Some(reason)` skips the step and passes the input
    /// through unchanged.
    fn skip_reason(&self, _input: &DataProduct, _ctx: &StepContext) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct StepContext {
    pub name: String,
    pub qualified_name: String,
    pub parameters: ParameterSet,
    pub references: ReferenceBinding,
}

impl StepContext {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.parameters.get_f64(name)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.parameters.get_bool(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.parameters.get_str(name)
    }

    pub fn reference(&self, reftype: &str) -> Option<&str> {
        self.references.identifier(reftype)
    }
}

pub type StepFactory = Arc<dyn Fn(&ParameterSet) -> Result<Box<dyn Step>> + Send + Sync>;

#[derive(Clone)]
pub enum ClassKind {
    Step(StepFactory),
    Pipeline(PipelineBlueprint),
}

/// Everything the registry knows about a loadable step or pipeline.
#[derive(Clone)]
pub struct StepClass {
    pub name: String,
    /// Fully qualified path, e.g. `calpipe.steps.FlatFieldStep`.
    pub path: String,
    /// Short name used in `cal_step` provenance.
    pub alias: String,
    pub description: String,
    pub schema: StepSchema,
    pub references: Vec<ReferenceRequirement>,
    pub kind: ClassKind,
}

static COMMON_PARAMS: Lazy<StepSchema> = Lazy::new(|| {
    StepSchema::new()
        .param(ParamSpec::boolean("skip").default(false).doc("Skip this step"))
        .param(
            ParamSpec::boolean("save_results")
                .default(false)
                .doc("Save the step result"),
        )
        .param(
            ParamSpec::string("output_file")
                .nullable()
                .doc("File to save the result to"),
        )
        .param(
            ParamSpec::string("output_dir")
                .nullable()
                .doc("Directory for saved results"),
        )
        .param(
            ParamSpec::string("suffix")
                .nullable()
                .doc("Suffix appended to saved file names"),
        )
        .param(
            ParamSpec::list("pre_hooks")
                .default(Value::Array(Vec::new()))
                .doc("Steps run on the input before this one"),
        )
        .param(
            ParamSpec::list("post_hooks")
                .default(Value::Array(Vec::new()))
                .doc("Steps run on the result after this one"),
        )
});

/// Parameters every step accepts.
pub fn common_schema() -> &'static StepSchema {
    &COMMON_PARAMS
}

impl StepClass {
    pub fn step<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ParameterSet) -> Result<Box<dyn Step>> + Send + Sync + 'static,
    {
        Self::with_kind(name.into(), ClassKind::Step(Arc::new(factory)))
    }

    pub fn pipeline(name: impl Into<String>, blueprint: PipelineBlueprint) -> Self {
        Self::with_kind(name.into(), ClassKind::Pipeline(blueprint))
    }

    fn with_kind(name: String, kind: ClassKind) -> Self {
        Self {
            path: name.clone(),
            alias: name.clone(),
            name,
            description: String::new(),
            schema: StepSchema::new(),
            references: Vec::new(),
            kind,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn schema(mut self, schema: StepSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.schema.insert(spec);
        self
    }

    pub fn reference(mut self, requirement: ReferenceRequirement) -> Self {
        self.references.push(requirement);
        self
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(self.kind, ClassKind::Pipeline(_))
    }

    /// Common parameters, then the class's own, then reference overrides and
    /// (for pipelines) the failure policy.
    pub fn effective_schema(&self) -> StepSchema {
        let mut schema = common_schema().merged(&self.schema);
        for requirement in &self.references {
            schema.insert(
                ParamSpec::string(format!("override_{}", requirement.reftype))
                    .nullable()
                    .doc(format!(
                        "Use this {} reference instead of asking the service ('N/A' to disable)",
                        requirement.reftype
                    )),
            );
        }
        if let ClassKind::Pipeline(blueprint) = &self.kind {
            schema.insert(
                ParamSpec::choice("on_failure", &["abort", "continue"])
                    .default(blueprint.failure_policy.as_str())
                    .doc("What to do when a child step fails"),
            );
        }
        schema
    }
}

impl fmt::Debug for StepClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepClass")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("alias", &self.alias)
            .field("pipeline", &self.is_pipeline())
            .field("params", &self.schema.names())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Unconfigured,
    Configured,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn can_transition(self, next: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, next),
            (Unconfigured, Configured)
                | (Configured, Running)
                | (Configured, Skipped)
                | (Configured, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid step transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: StepState,
    pub to: StepState,
}

/// State machine shared by steps and pipelines.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: StepState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: StepState::Unconfigured,
        }
    }
}

impl Lifecycle {
    pub fn configured() -> Self {
        Self {
            state: StepState::Configured,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn advance(&mut self, next: StepState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

pub enum Component {
    Step(Box<dyn Step>),
    Pipeline(Pipeline),
}

/// A step instance with its parameters bound and, for pipelines, its whole
/// child tree built.
pub struct ConfiguredStep {
    pub name: String,
    pub qualified_name: String,
    pub class_name: String,
    pub alias: String,
    pub references: Vec<ReferenceRequirement>,
    pub parameters: ParameterSet,
    pub component: Component,
    pub pre_hooks: Vec<ConfiguredStep>,
    pub post_hooks: Vec<ConfiguredStep>,
}

impl ConfiguredStep {
    pub fn is_pipeline(&self) -> bool {
        matches!(self.component, Component::Pipeline(_))
    }

    pub fn children(&self) -> &[ConfiguredStep] {
        match &self.component {
            Component::Pipeline(pipeline) => pipeline.children(),
            Component::Step(_) => &[],
        }
    }

    pub fn failure_policy(&self) -> Option<FailurePolicy> {
        match &self.component {
            Component::Pipeline(pipeline) => Some(pipeline.policy()),
            Component::Step(_) => None,
        }
    }

    /// Child by qualified name relative to this step, e.g. `inner.flat`.
    pub fn find(&self, path: &str) -> Option<&ConfiguredStep> {
        let mut current = self;
        for segment in path.split('.') {
            current = current.children().iter().find(|c| c.name == segment)?;
        }
        Some(current)
    }

    /// Reference request for `input`, honouring `override_<type>` parameters.
    pub fn reference_request(&self, input: &DataProduct) -> ReferenceRequest {
        let overrides = self
            .references
            .iter()
            .filter_map(|req| {
                self.parameters
                    .get_str(&format!("override_{}", req.reftype))
                    .map(|id| (req.reftype.clone(), id.to_string()))
            })
            .collect();
        ReferenceRequest {
            requirements: self.references.clone(),
            overrides,
            metadata: input.observation_metadata(),
        }
    }

    pub fn context(&self, references: ReferenceBinding) -> StepContext {
        StepContext {
            name: self.name.clone(),
            qualified_name: self.qualified_name.clone(),
            parameters: self.parameters.clone(),
            references,
        }
    }
}

impl fmt::Debug for ConfiguredStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredStep")
            .field("qualified_name", &self.qualified_name)
            .field("class", &self.class_name)
            .field("parameters", &self.parameters)
            .field("children", &self.children())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_rejects_running_twice() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.advance(StepState::Configured).unwrap();
        lifecycle.advance(StepState::Running).unwrap();
        assert!(lifecycle.advance(StepState::Running).is_err());
        lifecycle.advance(StepState::Completed).unwrap();
        assert!(lifecycle.state().is_terminal());
        assert!(lifecycle.advance(StepState::Failed).is_err());
    }

    #[test]
    fn skip_happens_before_running() {
        assert!(StepState::Configured.can_transition(StepState::Skipped));
        assert!(!StepState::Running.can_transition(StepState::Skipped));
        assert!(!StepState::Unconfigured.can_transition(StepState::Running));
    }

    #[test]
    fn effective_schema_adds_reference_overrides() {
        let class = StepClass::step("flat", |_| anyhow::bail!("unused"))
            .param(ParamSpec::float("scale").default(1.0))
            .reference(ReferenceRequirement::required("flat"));
        let schema = class.effective_schema();
        assert!(schema.contains("skip"));
        assert!(schema.contains("scale"));
        assert!(schema.get("override_flat").is_some_and(|p| p.nullable));
        assert!(!schema.contains("on_failure"));
    }
}
