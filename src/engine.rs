//! Loading, configuring and driving steps.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{Level, debug, error, info, warn};

use crate::config::{ConfigSource, ConfigTree, FileConfigSource, Overrides};
use crate::data::{DataProduct, JsonResultStore, ResultStore};
use crate::error::{ConfigurationError, EngineError, StepLoadError, StepRuntimeError};
use crate::observability::MetricsCollector;
use crate::params::{ParamSource, ParameterSet};
use crate::pipeline::{ChildExecutor, Pipeline, StepOutcome};
use crate::record::{ExecutionRecord, ExecutionStatus, StepRecord};
use crate::reference::{
    ReferenceBinding, ReferenceCache, ReferenceLookup, ReferenceResolver, ReferenceService,
    UnconfiguredService,
};
use crate::registry::StepRegistry;
use crate::resolver::{ConfigLayer, check_child_blocks, descend, reject_child_blocks, resolve};
use crate::settings::EngineSettings;
use crate::step::{ClassKind, Component, ConfiguredStep, Lifecycle, StepClass, StepState};
use crate::step_spec::StepSpec;
use crate::steps;

/// What to run: a registered identifier, a config file or a ready spec.
#[derive(Debug, Clone)]
pub enum StepTarget {
    Identifier(String),
    File(PathBuf),
    Spec(StepSpec),
}

impl From<&str> for StepTarget {
    fn from(identifier: &str) -> Self {
        Self::Identifier(identifier.to_string())
    }
}

impl From<StepSpec> for StepTarget {
    fn from(spec: StepSpec) -> Self {
        Self::Spec(spec)
    }
}

/// Cooperative stop signal, checked before each step starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub overrides: Overrides,
    /// Named config files, applied in order.
    pub config_files: Vec<String>,
    pub record_path: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn config_file(mut self, location: impl Into<String>) -> Self {
        self.config_files.push(location.into());
        self
    }

    pub fn record_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = Some(path.into());
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub result: Option<DataProduct>,
    pub record: ExecutionRecord,
}

pub struct Engine {
    registry: StepRegistry,
    settings: EngineSettings,
    config_source: Arc<dyn ConfigSource>,
    references: Arc<dyn ReferenceService>,
    store: Arc<dyn ResultStore>,
    metrics: MetricsCollector,
}

impl Engine {
    pub fn new(registry: StepRegistry) -> Self {
        Self {
            registry,
            settings: EngineSettings::default(),
            config_source: Arc::new(FileConfigSource::new()),
            references: Arc::new(UnconfiguredService),
            store: Arc::new(JsonResultStore),
            metrics: MetricsCollector::new(),
        }
    }

    /// Engine with the bundled steps registered.
    pub fn with_default_steps() -> Self {
        let mut registry = StepRegistry::new();
        steps::register_defaults(&mut registry);
        Self::new(registry)
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_reference_service(mut self, service: Arc<dyn ReferenceService>) -> Self {
        self.references = service;
        self
    }

    pub fn with_config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = source;
        self
    }

    pub fn with_result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = store;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn config_source(&self) -> &dyn ConfigSource {
        self.config_source.as_ref()
    }

    pub fn result_store(&self) -> &dyn ResultStore {
        self.store.as_ref()
    }

    pub fn reference_resolver(&self) -> ReferenceResolver {
        ReferenceResolver::new(self.references.clone(), self.settings.retry.clone())
            .with_metrics(self.metrics.clone())
    }

    /// Turn a target into a spec without configuring anything.
    pub fn load_spec(&self, target: &StepTarget) -> Result<StepSpec, EngineError> {
        match target {
            StepTarget::Spec(spec) => Ok(spec.clone()),
            StepTarget::File(path) => self.read_spec(&path.to_string_lossy()),
            StepTarget::Identifier(identifier) => match self.registry.load(identifier) {
                Ok(class) => Ok(StepSpec::new(class.name.clone())),
                Err(_) if is_config_path(identifier) && self.config_source.exists(identifier) => {
                    self.read_spec(identifier)
                }
                Err(err) => Err(err.into()),
            },
        }
    }

    fn read_spec(&self, location: &str) -> Result<StepSpec, EngineError> {
        let tree = self.config_source.read(location)?;
        Ok(StepSpec::from_tree(&tree, Some(location))?)
    }

    /// Resolve parameters for the whole tree and construct every step.
    ///
    /// Nothing runs here; every configuration and load error surfaces before
    /// the first step starts.
    pub fn configure(
        &self,
        target: &StepTarget,
        input: Option<&DataProduct>,
        options: &RunOptions,
    ) -> Result<ConfiguredStep, EngineError> {
        let spec = self.load_spec(target)?;
        let class = self.registry.load(&spec.class)?;
        let name = spec.instance_name().to_string();

        let mut layers = Vec::new();
        if let Some(input) = input
            && let Some(layer) = self.parameter_reference(&class, input)?
        {
            layers.push(layer);
        }
        layers.extend(self.spec_layers(&spec, &class)?);
        if let Some(input) = input
            && let Some(layer) = self.discovered_config(&name, &class, input)?
        {
            layers.push(layer);
        }
        for location in &options.config_files {
            let tree = self.config_source.read(location)?;
            self.check_class(&tree, &class, location)?;
            layers.push(ConfigLayer::new(ParamSource::ConfigFile(location.clone()), tree));
        }
        if !options.overrides.explicit().is_empty() {
            layers.push(ConfigLayer::new(
                ParamSource::Override,
                options.overrides.explicit().clone(),
            ));
        }
        if !options.overrides.call_tree().is_empty() {
            layers.push(ConfigLayer::new(
                ParamSource::Call,
                options.overrides.call_tree().clone(),
            ));
        }

        let configured = self.build(&spec, class, name.clone(), name, layers)?;
        info!(
            step = configured.qualified_name.as_str(),
            class = configured.class_name.as_str(),
            children = configured.children().len(),
            "Step configured"
        );
        Ok(configured)
    }

    /// Configure `target` for `input` and run it.
    pub fn run(
        &self,
        target: &StepTarget,
        input: DataProduct,
        options: &RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        let configured = self.configure(target, Some(&input), options)?;
        Ok(self.run_configured(&configured, input, options))
    }

    /// Run an already configured step tree. Always yields a record.
    pub fn run_configured(
        &self,
        step: &ConfiguredStep,
        input: DataProduct,
        options: &RunOptions,
    ) -> RunOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut driver = RunDriver {
            engine: self,
            resolver: self.reference_resolver(),
            cache: ReferenceCache::new(),
            cancel: options.cancel.clone(),
        };
        let outcome = driver.execute(step, &input, true);
        self.metrics.record_total_duration(clock.elapsed());

        let record = ExecutionRecord::new(started_at, outcome.record, options.cancel.is_cancelled());
        let destination = options
            .record_path
            .clone()
            .or_else(|| self.settings.record_path.clone());
        if let Some(path) = destination {
            match record.write(&path) {
                Ok(()) => info!(record = %path.display(), "Execution record written"),
                Err(err) => warn!(
                    record = %path.display(),
                    error = format!("{err:#}"),
                    "Failed to write execution record"
                ),
            }
        }

        info!(
            step = step.qualified_name.as_str(),
            status = %record.status,
            duration_ms = clock.elapsed().as_secs_f64() * 1_000.0,
            "Run finished"
        );
        RunOutcome {
            status: record.status,
            result: outcome.output,
            record,
        }
    }

    fn parameter_reference(
        &self,
        class: &StepClass,
        input: &DataProduct,
    ) -> Result<Option<ConfigLayer>, ConfigurationError> {
        if self.settings.disable_parameter_references {
            debug!("Parameter references disabled");
            return Ok(None);
        }
        let reftype = format!("pars-{}", class.name.to_lowercase());
        match self
            .reference_resolver()
            .lookup(&reftype, &input.observation_metadata())
        {
            Ok((ReferenceLookup::Found { identifier, .. }, _)) => {
                let mut tree = self.config_source.read(&identifier)?;
                tree.remove("class");
                tree.remove("name");
                info!(reftype = reftype.as_str(), identifier = identifier.as_str(), "Using parameter reference");
                Ok(Some(ConfigLayer::new(
                    ParamSource::ParameterReference(identifier),
                    tree,
                )))
            }
            Ok((ReferenceLookup::NotApplicable, _)) => {
                debug!(reftype = reftype.as_str(), "Parameter reference not applicable");
                Ok(None)
            }
            Err(err) => {
                debug!(reftype = reftype.as_str(), error = %err, "No parameter reference");
                Ok(None)
            }
        }
    }

    /// A spec's referenced config file, then its inline parameters.
    fn spec_layers(
        &self,
        spec: &StepSpec,
        class: &StepClass,
    ) -> Result<Vec<ConfigLayer>, ConfigurationError> {
        let mut layers = Vec::with_capacity(2);
        if let Some(location) = &spec.config_file {
            let tree = self.config_source.read(location)?;
            self.check_class(&tree, class, location)?;
            layers.push(ConfigLayer::new(spec.file_source(location), tree));
        }
        layers.push(spec.layer());
        Ok(layers)
    }

    /// `<step name>.yaml|.yml|.json` next to the input.
    fn discovered_config(
        &self,
        name: &str,
        class: &StepClass,
        input: &DataProduct,
    ) -> Result<Option<ConfigLayer>, ConfigurationError> {
        if !self.settings.discover_config {
            return Ok(None);
        }
        let Some(dir) = input.source.as_deref().and_then(Path::parent) else {
            return Ok(None);
        };
        for ext in ["yaml", "yml", "json"] {
            let location = dir.join(format!("{name}.{ext}")).to_string_lossy().to_string();
            if self.config_source.exists(&location) {
                let tree = self.config_source.read(&location)?;
                self.check_class(&tree, class, &location)?;
                info!(config = location.as_str(), "Discovered configuration next to input");
                return Ok(Some(ConfigLayer::new(ParamSource::ConfigFile(location), tree)));
            }
        }
        Ok(None)
    }

    fn check_class(
        &self,
        tree: &ConfigTree,
        class: &StepClass,
        location: &str,
    ) -> Result<(), ConfigurationError> {
        let Some(declared) = tree.get("class").and_then(Value::as_str) else {
            return Ok(());
        };
        match self.registry.load(declared) {
            Ok(found) if found.name == class.name => Ok(()),
            _ => Err(ConfigurationError::InvalidStructure {
                step: class.name.clone(),
                message: format!(
                    "config file '{location}' is for class '{declared}', not '{}'",
                    class.name
                ),
            }),
        }
    }

    fn build(
        &self,
        spec: &StepSpec,
        class: Arc<StepClass>,
        name: String,
        qualified_name: String,
        layers: Vec<ConfigLayer>,
    ) -> Result<ConfiguredStep, EngineError> {
        let policy = self.settings.unknown_parameters;
        let schema = class.effective_schema();
        let parameters = resolve(&qualified_name, &schema, &layers, policy)?;

        let component = match &class.kind {
            ClassKind::Step(factory) => {
                if !spec.steps.is_empty() {
                    return Err(StepLoadError::InvalidDefinition {
                        identifier: qualified_name,
                        message: format!("'{}' is not a pipeline and cannot have child steps", class.name),
                    }
                    .into());
                }
                reject_child_blocks(&qualified_name, &layers, policy)?;
                let step = factory(&parameters).map_err(|err| StepLoadError::Construction {
                    class: class.name.clone(),
                    message: format!("{err:#}"),
                })?;
                Component::Step(step)
            }
            ClassKind::Pipeline(blueprint) => {
                let child_specs = if spec.steps.is_empty() {
                    &blueprint.steps
                } else {
                    &spec.steps
                };
                let names: Vec<String> = child_specs
                    .iter()
                    .map(|child| child.instance_name().to_string())
                    .collect();
                if let Some(duplicate) = first_duplicate(&names) {
                    return Err(StepLoadError::InvalidDefinition {
                        identifier: qualified_name,
                        message: format!("duplicate child step name '{duplicate}'"),
                    }
                    .into());
                }
                check_child_blocks(&qualified_name, &layers, &names, policy)?;

                let mut children = Vec::with_capacity(child_specs.len());
                for (position, (child_spec, child_name)) in
                    child_specs.iter().zip(&names).enumerate()
                {
                    let child_class = self.registry.load(&child_spec.class)?;
                    let mut child_layers = self.spec_layers(child_spec, &child_class)?;
                    child_layers.extend(descend(
                        &qualified_name,
                        &layers,
                        child_name,
                        position,
                        self.config_source.as_ref(),
                    )?);
                    children.push(self.build(
                        child_spec,
                        child_class,
                        child_name.clone(),
                        format!("{qualified_name}.{child_name}"),
                        child_layers,
                    )?);
                }
                let failure_policy = parameters
                    .get_str("on_failure")
                    .and_then(|text| text.parse().ok())
                    .unwrap_or(blueprint.failure_policy);
                Component::Pipeline(Pipeline::new(failure_policy, children))
            }
        };

        let pre_hooks = self.build_hooks(&parameters, "pre_hooks", &qualified_name)?;
        let post_hooks = self.build_hooks(&parameters, "post_hooks", &qualified_name)?;
        debug!(step = qualified_name.as_str(), params_hash = parameters.fingerprint().as_str(), "Parameters resolved");

        Ok(ConfiguredStep {
            name,
            qualified_name,
            class_name: class.name.clone(),
            alias: class.alias.clone(),
            references: class.references.clone(),
            parameters,
            component,
            pre_hooks,
            post_hooks,
        })
    }

    /// Hooks are step identifiers configured with their defaults only.
    fn build_hooks(
        &self,
        parameters: &ParameterSet,
        key: &str,
        qualified_name: &str,
    ) -> Result<Vec<ConfiguredStep>, EngineError> {
        parameters
            .get_strings(key)
            .iter()
            .enumerate()
            .map(|(idx, identifier)| {
                let class = self.registry.load(identifier)?;
                let spec = StepSpec::new(class.name.clone());
                let layers = vec![spec.layer()];
                self.build(
                    &spec,
                    class.clone(),
                    class.name.clone(),
                    format!("{qualified_name}.{key}.{idx}"),
                    layers,
                )
            })
            .collect()
    }
}

/// Where a result of `step` is saved: `<output_dir>/<basename>_<suffix>.<ext>`.
///
/// With `output_file` set its stem becomes the basename and the suffix is
/// only added when one was configured explicitly.
pub fn output_path(step: &ConfiguredStep, output: &DataProduct, extension: &str) -> PathBuf {
    let params = &step.parameters;
    let suffix = params.get_str("suffix");
    let (dir, file_name) = match params.get_str("output_file") {
        Some(file) => {
            let path = Path::new(file);
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| file.to_string());
            let file_name = match suffix {
                Some(suffix) => format!("{stem}_{suffix}.{extension}"),
                None => format!("{stem}.{extension}"),
            };
            (
                path.parent().map(Path::to_path_buf).unwrap_or_default(),
                file_name,
            )
        }
        None => {
            let suffix = suffix
                .map(str::to_string)
                .unwrap_or_else(|| step.name.to_lowercase());
            (
                PathBuf::new(),
                format!("{}_{suffix}.{extension}", output.basename()),
            )
        }
    };
    params
        .get_str("output_dir")
        .map(PathBuf::from)
        .unwrap_or(dir)
        .join(file_name)
}

fn is_config_path(identifier: &str) -> bool {
    Path::new(identifier)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_lowercase().as_str(), "yaml" | "yml" | "json"))
}

fn first_duplicate(names: &[String]) -> Option<&str> {
    names
        .iter()
        .enumerate()
        .find(|(idx, name)| names[..*idx].contains(name))
        .map(|(_, name)| name.as_str())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drives one run: the lifecycle of every step, reference caching and
/// cancellation.
struct RunDriver<'e> {
    engine: &'e Engine,
    resolver: ReferenceResolver,
    cache: ReferenceCache,
    cancel: CancellationToken,
}

impl RunDriver<'_> {
    fn execute(
        &mut self,
        step: &ConfiguredStep,
        input: &DataProduct,
        standalone: bool,
    ) -> StepOutcome {
        let span = tracing::span!(Level::INFO, "step", step = step.qualified_name.as_str());
        let _span_guard = span.enter();
        let clock = Instant::now();
        let mut record = StepRecord::begin(step, input);
        let mut lifecycle = Lifecycle::configured();

        if self.cancel.is_cancelled() {
            info!("Run cancelled before step started");
            record.status = ExecutionStatus::Cancelled;
            return StepOutcome {
                record,
                output: None,
            };
        }

        let metrics = self.engine.metrics.clone();
        let _timer = metrics.start_step(&step.qualified_name);

        if let Some(reason) = self.skip_reason(step, input, standalone) {
            info!(reason = reason.as_str(), "Step skipped");
            advance(&mut lifecycle, StepState::Skipped);
            metrics.record_step_skip(&step.qualified_name);
            record.status = ExecutionStatus::Skipped;
            record.skip_reason = Some(reason);
            record.output = Some(input.identity());
            record.duration_ms = clock.elapsed().as_secs_f64() * 1_000.0;
            return StepOutcome {
                record,
                output: Some(input.clone()),
            };
        }

        debug!(class = step.class_name.as_str(), "Step started");
        let (status, output) = match self.run_body(step, input, &mut record, &mut lifecycle) {
            Ok((status, output)) => (status, Some(output)),
            Err(message) => {
                record.error = Some(message);
                (ExecutionStatus::Failed, None)
            }
        };

        let terminal = match status {
            ExecutionStatus::Completed | ExecutionStatus::CompletedWithErrors => StepState::Completed,
            _ => StepState::Failed,
        };
        advance(&mut lifecycle, terminal);
        record.status = status;
        record.output = output.as_ref().map(DataProduct::identity);
        record.duration_ms = clock.elapsed().as_secs_f64() * 1_000.0;

        match status {
            ExecutionStatus::Failed => {
                metrics.record_step_failure(&step.qualified_name);
                error!(
                    error = record.error.as_deref().unwrap_or_default(),
                    "Step failed"
                );
            }
            ExecutionStatus::CompletedWithErrors => warn!(
                error = record.error.as_deref().unwrap_or_default(),
                "Step completed with errors"
            ),
            _ => info!(status = %status, duration_ms = record.duration_ms, "Step finished"),
        }

        StepOutcome { record, output }
    }

    fn skip_reason(
        &self,
        step: &ConfiguredStep,
        input: &DataProduct,
        standalone: bool,
    ) -> Option<String> {
        if step.parameters.get_bool("skip").unwrap_or(false) {
            if standalone {
                info!("Step run as standalone, so skip set to False");
            } else {
                return Some("skip parameter set".to_string());
            }
        }
        match &step.component {
            Component::Step(imp) => {
                imp.skip_reason(input, &step.context(ReferenceBinding::default()))
            }
            Component::Pipeline(_) => None,
        }
    }

    fn run_body(
        &mut self,
        step: &ConfiguredStep,
        input: &DataProduct,
        record: &mut StepRecord,
        lifecycle: &mut Lifecycle,
    ) -> Result<(ExecutionStatus, DataProduct), String> {
        advance(lifecycle, StepState::Running);

        let mut current = input.clone();
        for hook in &step.pre_hooks {
            current = self.run_hook(hook, &current, record)?;
        }

        let references = if step.references.is_empty() {
            ReferenceBinding::default()
        } else {
            let request = step.reference_request(&current);
            self.resolver
                .resolve_references(&request, &mut self.cache)
                .map_err(|err| err.to_string())?
        };
        record.references = references.clone();

        let (status, mut output) = match &step.component {
            Component::Step(imp) => {
                let ctx = step.context(references.clone());
                let message = match panic::catch_unwind(AssertUnwindSafe(|| imp.run(&current, &ctx))) {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(format!("{err:#}")),
                    Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
                };
                match message {
                    Ok(output) => (ExecutionStatus::Completed, output),
                    Err(message) => {
                        return Err(StepRuntimeError {
                            step: step.qualified_name.clone(),
                            message,
                        }
                        .to_string());
                    }
                }
            }
            Component::Pipeline(pipeline) => {
                let run = pipeline.run(&current, self);
                record.children = run.children;
                record.error = run.error.clone();
                match run.output {
                    // A cancelled run hands back the last good product untouched.
                    Some(output) if run.status == ExecutionStatus::Cancelled => {
                        return Ok((ExecutionStatus::Cancelled, output));
                    }
                    Some(output) => (run.status, output),
                    None => return Err(run.error.unwrap_or_else(|| "pipeline failed".to_string())),
                }
            }
        };

        if let Component::Step(_) = step.component {
            output.set_meta(&format!("cal_step.{}", step.alias), "COMPLETE");
            for (reftype, bound) in references.iter() {
                if let Some(identifier) = bound.provenance() {
                    output.set_meta(&format!("ref_file.{reftype}"), identifier);
                }
            }
        }

        for hook in &step.post_hooks {
            output = self.run_hook(hook, &output, record)?;
        }

        if let Some(path) = self.save_result(step, &output)? {
            record.saved_to = Some(path);
        }
        Ok((status, output))
    }

    fn run_hook(
        &mut self,
        hook: &ConfiguredStep,
        input: &DataProduct,
        record: &mut StepRecord,
    ) -> Result<DataProduct, String> {
        let outcome = self.execute(hook, input, false);
        let status = outcome.record.status;
        let error = outcome.record.error.clone();
        record.hooks.push(outcome.record);
        match outcome.output {
            Some(output) if status.is_success() => Ok(output),
            _ => Err(format!(
                "hook '{}' {}: {}",
                hook.class_name,
                status,
                error.unwrap_or_default()
            )),
        }
    }

    fn save_result(
        &self,
        step: &ConfiguredStep,
        output: &DataProduct,
    ) -> Result<Option<PathBuf>, String> {
        let save = step.parameters.get_bool("save_results").unwrap_or(false);
        if !save && step.parameters.get_str("output_file").is_none() {
            return Ok(None);
        }
        let store = self.engine.result_store();
        let path = output_path(step, output, store.extension());
        store
            .save(output, &path)
            .map_err(|err| format!("failed to save result: {err:#}"))?;
        info!(path = %path.display(), "Result saved");
        Ok(Some(path))
    }
}

impl ChildExecutor for RunDriver<'_> {
    fn execute_child(&mut self, child: &ConfiguredStep, input: &DataProduct) -> StepOutcome {
        self.execute(child, input, false)
    }
}

fn advance(lifecycle: &mut Lifecycle, next: StepState) {
    if let Err(err) = lifecycle.advance(next) {
        error!(error = %err, "Step lifecycle violated");
    }
}
