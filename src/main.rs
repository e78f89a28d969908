use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use calpipe::config::{Overrides, parse_assignment};
use calpipe::data::{DataProduct, JsonResultStore, ResultStore};
use calpipe::engine::{Engine, RunOptions, StepTarget};
use calpipe::export::write_parameters;
use calpipe::observability::{MetricsSnapshot, log_snapshot};
use calpipe::record::ExecutionStatus;
use calpipe::reference::ReferenceTable;
use calpipe::resolver::UnknownParamPolicy;
use calpipe::settings::EngineSettings;
use calpipe::validation::validate_file;
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use serde_json::{Value, to_writer_pretty};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let Cli { verbose, command } = Cli::parse();

    let otlp_endpoint = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(verbose, otlp_endpoint.as_deref())?;

    let command_result = match command {
        Commands::Run {
            target,
            input,
            engine,
            record,
            save_parameters,
            output,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            otlp_endpoint: _,
        } => run_command(RunArgs {
            target,
            input,
            engine,
            record,
            save_parameters,
            output,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        }),
        Commands::Configure {
            target,
            input,
            engine,
            output,
        } => configure_command(target, input, engine, output),
        Commands::ListSteps => list_steps(),
        Commands::ShowParams { step } => show_params(&step),
        Commands::Validate { file } => validate_command(file),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "calpipe", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(verbose: bool, otlp_endpoint: Option<&str>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![KeyValue::new("service.name", "calpipe")],
                )))
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{endpoint}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel."
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct RunArgs {
    target: String,
    input: Option<String>,
    engine: EngineArgs,
    record: Option<PathBuf>,
    save_parameters: Option<PathBuf>,
    output: Option<PathBuf>,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
}

fn run_command(args: RunArgs) -> Result<()> {
    let engine = build_engine(&args.engine)?;
    let target = StepTarget::Identifier(args.target.clone());
    let mut options = args.engine.run_options()?;
    if let Some(record) = &args.record {
        options = options.record_to(record);
    }

    let inputs = expand_inputs(args.input.as_deref())?;
    if inputs.is_empty() {
        warn!("No inputs matched. Nothing to process.");
        return Ok(());
    }
    if inputs.len() > 1 && (args.output.is_some() || args.record.is_some()) {
        bail!("--output and --record accept a single input; {} matched", inputs.len());
    }

    let mut failures = 0usize;
    let mut cancelled = 0usize;
    for input in inputs {
        let label = input.name.clone();
        let configured = engine.configure(&target, Some(&input), &options)?;
        if let Some(path) = &args.save_parameters {
            write_parameters(&configured, path)?;
            info!(parameters = %path.display(), "Resolved parameters written");
        }

        let outcome = engine.run_configured(&configured, input, &options);
        match outcome.status {
            ExecutionStatus::Failed => {
                failures += 1;
                let reason = outcome
                    .record
                    .root
                    .error
                    .clone()
                    .unwrap_or_else(|| "see execution record".to_string());
                error!(input = %label, "Run failed: {reason}");
            }
            ExecutionStatus::Cancelled => {
                cancelled += 1;
                warn!(input = %label, "Run cancelled before all steps ran");
            }
            status => info!(input = %label, status = %status, "Run finished"),
        }

        if let Some(path) = &args.output
            && let Some(result) = &outcome.result
        {
            engine
                .result_store()
                .save(result, path)
                .with_context(|| format!("Failed to save result: {}", path.display()))?;
            info!(output = %path.display(), "Result written");
        }
    }

    report_metrics(
        &engine.metrics().snapshot(),
        args.print_metrics,
        args.metrics_json.as_deref(),
        args.metrics_prometheus.as_deref(),
    )?;

    incomplete_runs(failures, cancelled)
}

fn incomplete_runs(failures: usize, cancelled: usize) -> Result<()> {
    match (failures, cancelled) {
        (0, 0) => Ok(()),
        (failures, 0) => bail!("{failures} run(s) failed"),
        (0, cancelled) => bail!("{cancelled} run(s) cancelled"),
        (failures, cancelled) => bail!("{failures} run(s) failed, {cancelled} cancelled"),
    }
}

fn configure_command(
    target: String,
    input: Option<PathBuf>,
    engine_args: EngineArgs,
    output: PathBuf,
) -> Result<()> {
    let engine = build_engine(&engine_args)?;
    let options = engine_args.run_options()?;
    let input = input
        .map(|path| {
            JsonResultStore
                .load(&path)
                .with_context(|| format!("Failed to load input: {}", path.display()))
        })
        .transpose()?;
    let configured = engine.configure(&StepTarget::Identifier(target), input.as_ref(), &options)?;
    write_parameters(&configured, &output)?;
    info!(parameters = %output.display(), step = %configured.qualified_name, "Resolved parameters written");
    Ok(())
}

fn list_steps() -> Result<()> {
    let engine = Engine::with_default_steps();
    println!("Available steps:");
    for class in engine.registry().classes() {
        let kind = if class.is_pipeline() { "pipeline" } else { "step" };
        println!("- {} ({kind}, {}): {}", class.name, class.path, class.description);
    }
    Ok(())
}

fn show_params(identifier: &str) -> Result<()> {
    let engine = Engine::with_default_steps();
    let class = engine.registry().load(identifier)?;
    println!("{} ({})", class.name, class.path);
    if !class.description.is_empty() {
        println!("  {}", class.description);
    }
    for spec in class.effective_schema().iter() {
        let default = spec
            .default_value()
            .map(|value| value.to_string())
            .unwrap_or_else(|| "<required>".to_string());
        let nullable = if spec.nullable { ", nullable" } else { "" };
        print!("  {} = {default}  [{}{nullable}]", spec.name, spec.ty);
        if spec.doc.is_empty() {
            println!();
        } else {
            println!("  {}", spec.doc);
        }
    }
    for requirement in &class.references {
        let kind = if requirement.optional { "optional" } else { "required" };
        println!("  reference {} ({kind})", requirement.reftype);
    }
    Ok(())
}

fn validate_command(file: PathBuf) -> Result<()> {
    let engine = Engine::with_default_steps();
    let report = validate_file(&file, &engine)?;

    for warning in &report.warnings {
        warn!(file = %file.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %file.display(), "Pipeline definition is valid");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %file.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn build_engine(args: &EngineArgs) -> Result<Engine> {
    let mut settings = match &args.settings {
        Some(path) => EngineSettings::load(path)?,
        None => EngineSettings::default(),
    }
    .apply_env()?;

    if let Some(policy) = args.unknown_parameters {
        settings.unknown_parameters = policy;
    }
    if let Some(attempts) = args.max_attempts {
        settings.retry.max_attempts = attempts;
    }
    if let Some(delay) = args.retry_delay_ms {
        settings.set_base_delay_ms(delay);
    }

    let mut engine = Engine::with_default_steps().with_settings(settings);
    if let Some(path) = &args.references {
        let table = ReferenceTable::load(path)?;
        info!(references = %path.display(), rules = table.rules.len(), "Reference table loaded");
        engine = engine.with_reference_service(Arc::new(table));
    }
    Ok(engine)
}

/// Each input argument is a path or a glob pattern over product files.
/// Without one the step runs on an empty product.
fn expand_inputs(pattern: Option<&str>) -> Result<Vec<DataProduct>> {
    let Some(pattern) = pattern else {
        return Ok(vec![DataProduct::new("input", Value::Null)]);
    };
    let path = Path::new(pattern);
    if path.exists() {
        return Ok(vec![load_input(path)?]);
    }

    let mut paths = Vec::new();
    for entry in glob::glob(pattern).with_context(|| format!("Invalid input pattern: {pattern}"))? {
        paths.push(entry.with_context(|| format!("Failed to expand input pattern: {pattern}"))?);
    }
    paths.sort();
    paths.iter().map(|path| load_input(path)).collect()
}

fn load_input(path: &Path) -> Result<DataProduct> {
    JsonResultStore
        .load(path)
        .with_context(|| format!("Failed to load input: {}", path.display()))
}

fn report_metrics(
    snapshot: &MetricsSnapshot,
    print_metrics: bool,
    metrics_json: Option<&Path>,
    metrics_prometheus: Option<&Path>,
) -> Result<()> {
    if print_metrics {
        log_snapshot(snapshot);
    }
    if let Some(path) = metrics_json {
        create_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        create_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "calpipe",
    version,
    about = "Configurable step and pipeline runner for calibration workflows"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct EngineArgs {
    /// Config file applied on top of the step definition (repeatable)
    #[arg(long = "config", value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Vec<String>,
    /// Explicit override, e.g. `--set flat_field.scale=2`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
    /// Call-time argument; beats every other source
    #[arg(long = "call", value_name = "KEY=VALUE")]
    call: Vec<String>,
    /// Reference table used to select calibration references
    #[arg(long, value_hint = ValueHint::FilePath)]
    references: Option<PathBuf>,
    #[arg(long, value_hint = ValueHint::FilePath)]
    settings: Option<PathBuf>,
    #[arg(long = "unknown-parameters", value_enum)]
    unknown_parameters: Option<UnknownParamPolicy>,
    #[arg(long = "max-attempts")]
    max_attempts: Option<u32>,
    #[arg(long = "retry-delay-ms")]
    retry_delay_ms: Option<u64>,
}

impl EngineArgs {
    fn run_options(&self) -> Result<RunOptions> {
        let mut overrides = Overrides::new();
        for assignment in &self.set {
            let (key, value) = parse_assignment(assignment)?;
            overrides.insert(&key, value);
        }
        for assignment in &self.call {
            let (key, value) = parse_assignment(assignment)?;
            overrides.insert_call(&key, value);
        }
        let mut options = RunOptions::new().overrides(overrides);
        for location in &self.config {
            options = options.config_file(location.clone());
        }
        Ok(options)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Configure and run a step or pipeline
    Run {
        /// Registered step name, alias, class path or definition file
        target: String,
        /// Input product file or glob pattern
        input: Option<String>,
        #[command(flatten)]
        engine: EngineArgs,
        /// Write the execution record (JSON for .json, YAML otherwise)
        #[arg(long, value_hint = ValueHint::FilePath)]
        record: Option<PathBuf>,
        #[arg(long = "save-parameters", value_hint = ValueHint::FilePath)]
        save_parameters: Option<PathBuf>,
        /// Write the final product here
        #[arg(long, short, value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Resolve parameters without running and write them as YAML
    Configure {
        target: String,
        input: Option<PathBuf>,
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(long, short, value_hint = ValueHint::FilePath)]
        output: PathBuf,
    },
    ListSteps,
    /// Print the parameter schema of a step
    ShowParams { step: String },
    Validate {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_runs_fail_the_command() {
        assert!(incomplete_runs(0, 0).is_ok());
        assert_eq!(
            incomplete_runs(0, 2).unwrap_err().to_string(),
            "2 run(s) cancelled"
        );
        assert_eq!(
            incomplete_runs(1, 1).unwrap_err().to_string(),
            "1 run(s) failed, 1 cancelled"
        );
    }
}
