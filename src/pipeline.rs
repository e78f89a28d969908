use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::DataProduct;
use crate::record::{ExecutionStatus, StepRecord};
use crate::step::ConfiguredStep;
use crate::step_spec::StepSpec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop at the first failed child.
    #[default]
    Abort,
    /// Record the failure and feed the failed child's input to the next one.
    Continue,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Continue => "continue",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "continue" => Ok(Self::Continue),
            other => Err(format!("unknown failure policy '{other}'")),
        }
    }
}

/// Default children and failure policy of a pipeline class.
#[derive(Debug, Clone, Default)]
pub struct PipelineBlueprint {
    pub steps: Vec<StepSpec>,
    pub failure_policy: FailurePolicy,
}

impl PipelineBlueprint {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self {
            steps,
            failure_policy: FailurePolicy::Abort,
        }
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Result of running one child.
#[derive(Debug)]
pub struct StepOutcome {
    pub record: StepRecord,
    pub output: Option<DataProduct>,
}

/// Runs one child on behalf of a pipeline. The engine supplies this so that
/// nested pipelines are driven by the same lifecycle code as plain steps.
pub trait ChildExecutor {
    fn execute_child(&mut self, child: &ConfiguredStep, input: &DataProduct) -> StepOutcome;
}

#[derive(Debug)]
pub struct PipelineRun {
    pub output: Option<DataProduct>,
    pub status: ExecutionStatus,
    pub children: Vec<StepRecord>,
    pub error: Option<String>,
}

/// Configured children of a pipeline, run in declared order.
pub struct Pipeline {
    policy: FailurePolicy,
    children: Vec<ConfiguredStep>,
}

impl Pipeline {
    pub fn new(policy: FailurePolicy, children: Vec<ConfiguredStep>) -> Self {
        Self { policy, children }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn children(&self) -> &[ConfiguredStep] {
        &self.children
    }

    pub fn run(&self, input: &DataProduct, executor: &mut dyn ChildExecutor) -> PipelineRun {
        let mut current = input.clone();
        let mut records = Vec::with_capacity(self.children.len());
        let mut failures: Vec<String> = Vec::new();
        let mut cancelled = false;

        for child in &self.children {
            let outcome = executor.execute_child(child, &current);
            let status = outcome.record.status;
            let failure = outcome
                .record
                .error
                .clone()
                .unwrap_or_else(|| format!("step '{}' {}", child.qualified_name, status));
            records.push(outcome.record);

            match status {
                ExecutionStatus::Completed | ExecutionStatus::Skipped => {
                    if let Some(output) = outcome.output {
                        current = output;
                    }
                }
                ExecutionStatus::Cancelled => cancelled = true,
                ExecutionStatus::CompletedWithErrors | ExecutionStatus::Failed => {
                    if status == ExecutionStatus::CompletedWithErrors
                        && let Some(output) = outcome.output
                    {
                        current = output;
                    }
                    failures.push(failure.clone());
                    match self.policy {
                        FailurePolicy::Abort => {
                            warn!(
                                step = child.qualified_name.as_str(),
                                error = failure.as_str(),
                                "Child failed, aborting pipeline"
                            );
                            return PipelineRun {
                                output: None,
                                status: ExecutionStatus::Failed,
                                children: records,
                                error: Some(failure),
                            };
                        }
                        FailurePolicy::Continue => {
                            warn!(
                                step = child.qualified_name.as_str(),
                                error = failure.as_str(),
                                "Child failed, continuing with its input"
                            );
                        }
                    }
                }
            }
        }

        let status = if cancelled {
            ExecutionStatus::Cancelled
        } else if failures.is_empty() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::CompletedWithErrors
        };
        info!(children = records.len(), %status, "Pipeline finished");
        PipelineRun {
            output: Some(current),
            status,
            children: records,
            error: (!failures.is_empty()).then(|| failures.join("; ")),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("policy", &self.policy)
            .field("children", &self.children)
            .finish()
    }
}
