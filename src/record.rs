//! Provenance records of a run.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::data::DataProduct;
use crate::params::ParameterSet;
use crate::reference::ReferenceBinding;
use crate::step::ConfiguredStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    CompletedWithErrors,
    Skipped,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Produced a usable result.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithErrors | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub qualified_name: String,
    pub class: String,
    pub status: ExecutionStatus,
    pub parameters: ParameterSet,
    pub params_hash: String,
    #[serde(skip_serializing_if = "ReferenceBinding::is_empty")]
    pub references: ReferenceBinding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepRecord>,
}

impl StepRecord {
    /// Fresh record for `step` about to run on `input`.
    pub fn begin(step: &ConfiguredStep, input: &DataProduct) -> Self {
        Self {
            name: step.name.clone(),
            qualified_name: step.qualified_name.clone(),
            class: step.class_name.clone(),
            status: ExecutionStatus::Cancelled,
            parameters: step.parameters.clone(),
            params_hash: step.parameters.fingerprint(),
            references: ReferenceBinding::default(),
            skip_reason: None,
            error: None,
            started_at: Utc::now(),
            duration_ms: 0.0,
            input: input.identity(),
            output: None,
            saved_to: None,
            hooks: Vec::new(),
            children: Vec::new(),
        }
    }

    /// This record, its children, then its hooks, each subtree depth first.
    pub fn walk(&self) -> Vec<&StepRecord> {
        let mut out = vec![self];
        for child in self.children.iter().chain(&self.hooks) {
            out.extend(child.walk());
        }
        out
    }
}

/// Record tree of one top-level run. Written at the end of the run whatever
/// its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub engine_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub cancelled: bool,
    pub root: StepRecord,
}

impl ExecutionRecord {
    pub fn new(started_at: DateTime<Utc>, root: StepRecord, cancelled: bool) -> Self {
        Self {
            run_id: format!(
                "{}-{}",
                started_at.format("%Y%m%dT%H%M%S%.3fZ"),
                std::process::id()
            ),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at,
            finished_at: Utc::now(),
            status: root.status,
            cancelled,
            root,
        }
    }

    /// Look a step up by qualified name (`detector1.flat_field`).
    pub fn step(&self, qualified_name: &str) -> Option<&StepRecord> {
        self.root
            .walk()
            .into_iter()
            .find(|record| record.qualified_name == qualified_name)
    }

    /// Every step record, depth first.
    pub fn steps(&self) -> Vec<&StepRecord> {
        self.root.walk()
    }

    /// JSON for `.json`, YAML otherwise.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create record directory: {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create execution record: {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::to_writer_pretty(file, self)
                .with_context(|| format!("Failed to write execution record: {}", path.display()))?;
        } else {
            serde_yaml::to_writer(file, self)
                .with_context(|| format!("Failed to write execution record: {}", path.display()))?;
        }
        Ok(())
    }
}
