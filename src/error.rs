use thiserror::Error;

use crate::reference::ServiceError;

/// Bad, unknown or uncoercible parameter input. Always fatal to the
/// configuration phase of the affected step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("step '{step}': unknown parameter '{name}'")]
    UnknownParameter { step: String, name: String },
    #[error("step '{step}': steps block '{name}' does not match any child step")]
    UnknownChildStep { step: String, name: String },
    #[error("step '{step}': parameter '{name}' expects {expected}, got {value}")]
    Coercion {
        step: String,
        name: String,
        expected: String,
        value: String,
    },
    #[error("step '{step}': parameter '{name}' value {value} is outside {allowed}")]
    OutOfRange {
        step: String,
        name: String,
        value: String,
        allowed: String,
    },
    #[error("step '{step}': parameter '{name}' has no default and no value was supplied")]
    MissingValue { step: String, name: String },
    #[error("step '{step}': {message}")]
    InvalidStructure { step: String, message: String },
    #[error("failed to read configuration '{location}': {message}")]
    Source { location: String, message: String },
}

/// A reference lookup that failed permanently or ran out of attempts.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("reference '{reftype}' could not be resolved after {attempts} attempt(s): {cause}")]
pub struct ReferenceResolutionError {
    pub reftype: String,
    pub attempts: u32,
    #[source]
    pub cause: ServiceError,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepLoadError {
    #[error("unknown step '{identifier}'. Available steps: {available}")]
    Unknown {
        identifier: String,
        available: String,
    },
    #[error("'{identifier}' is not a valid step definition: {message}")]
    InvalidDefinition { identifier: String, message: String },
    #[error("failed to construct step '{class}': {message}")]
    Construction { class: String, message: String },
}

/// Failure raised from inside a step's `run`, captured at the step boundary.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("step '{step}' failed: {message}")]
pub struct StepRuntimeError {
    pub step: String,
    pub message: String,
}

/// Errors that stop a run before any execution record exists.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Load(#[from] StepLoadError),
}
