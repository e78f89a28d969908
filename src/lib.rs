pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod export;
pub mod observability;
pub mod params;
pub mod pipeline;
pub mod record;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod settings;
pub mod step;
pub mod step_spec;
pub mod steps;
pub mod validation;

pub use config::{ConfigSource, FileConfigSource, MemoryConfigSource, Overrides};
pub use data::{DataProduct, JsonResultStore, ResultStore};
pub use engine::{CancellationToken, Engine, RunOptions, RunOutcome, StepTarget};
pub use error::{
    ConfigurationError, EngineError, ReferenceResolutionError, StepLoadError, StepRuntimeError,
};
pub use params::{ParamSource, ParamSpec, ParamType, ParameterSet, StepSchema};
pub use pipeline::{FailurePolicy, PipelineBlueprint};
pub use record::{ExecutionRecord, ExecutionStatus, StepRecord};
pub use reference::{
    ReferenceBinding, ReferenceLookup, ReferenceRequirement, ReferenceService, ReferenceTable,
    RetryPolicy, ServiceError,
};
pub use registry::StepRegistry;
pub use resolver::UnknownParamPolicy;
pub use settings::EngineSettings;
pub use step::{Step, StepClass, StepContext};
pub use step_spec::StepSpec;
