use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::reference::{DelayStrategy, RetryPolicy};
use crate::resolver::UnknownParamPolicy;

pub const ENV_UNKNOWN_PARAMETERS: &str = "CALPIPE_UNKNOWN_PARAMETERS";
pub const ENV_MAX_ATTEMPTS: &str = "CALPIPE_MAX_ATTEMPTS";
pub const ENV_RETRY_DELAY_MS: &str = "CALPIPE_RETRY_DELAY_MS";
pub const ENV_RETRY_BACKOFF: &str = "CALPIPE_RETRY_BACKOFF";
pub const ENV_DISABLE_PARAMETER_REFERENCES: &str = "CALPIPE_DISABLE_PARAMETER_REFERENCES";
pub const ENV_DISCOVER_CONFIG: &str = "CALPIPE_DISCOVER_CONFIG";

/// Engine-wide behaviour, read from a YAML file and the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub unknown_parameters: UnknownParamPolicy,
    pub retry: RetryPolicy,
    /// Skip the `pars-<step>` parameter reference lookup.
    pub disable_parameter_references: bool,
    /// Look for `<step name>.yaml` next to the input.
    pub discover_config: bool,
    pub record_path: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            unknown_parameters: UnknownParamPolicy::Reject,
            retry: RetryPolicy::default(),
            disable_parameter_references: false,
            discover_config: true,
            record_path: None,
        }
    }
}

impl EngineSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings: EngineSettings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings YAML: {}", path.display()))?;
        Ok(settings)
    }

    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_UNKNOWN_PARAMETERS) {
            self.unknown_parameters = value
                .parse()
                .map_err(|err: String| anyhow!("{ENV_UNKNOWN_PARAMETERS}: {err}"))?;
        }
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            let attempts: u32 = value
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_ATTEMPTS} must be a positive integer"))?;
            if attempts == 0 {
                bail!("{ENV_MAX_ATTEMPTS} must be a positive integer, got 0");
            }
            self.retry.max_attempts = attempts;
        }
        if let Some(value) = lookup(ENV_RETRY_BACKOFF) {
            let base = self.base_delay_ms();
            self.retry.delay = match value.trim().to_lowercase().as_str() {
                "fixed" => DelayStrategy::Fixed { delay_ms: base },
                "exponential" => DelayStrategy::Exponential {
                    initial_ms: base,
                    multiplier: 2.0,
                    max_ms: base.saturating_mul(20).max(10_000),
                },
                other => {
                    return Err(anyhow!(
                        "{ENV_RETRY_BACKOFF}: expected 'fixed' or 'exponential', got '{other}'"
                    ));
                }
            };
        }
        if let Some(value) = lookup(ENV_RETRY_DELAY_MS) {
            let delay: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("{ENV_RETRY_DELAY_MS} must be milliseconds"))?;
            self.set_base_delay_ms(delay);
        }
        if let Some(value) = lookup(ENV_DISABLE_PARAMETER_REFERENCES) {
            self.disable_parameter_references = is_truthy(&value);
        }
        if let Some(value) = lookup(ENV_DISCOVER_CONFIG) {
            self.discover_config = is_truthy(&value);
        }
        debug!(settings = ?self, "Engine settings resolved");
        Ok(self)
    }

    pub fn base_delay_ms(&self) -> u64 {
        match self.retry.delay {
            DelayStrategy::Fixed { delay_ms } => delay_ms,
            DelayStrategy::Exponential { initial_ms, .. } => initial_ms,
        }
    }

    pub fn set_base_delay_ms(&mut self, delay: u64) {
        match &mut self.retry.delay {
            DelayStrategy::Fixed { delay_ms } => *delay_ms = delay,
            DelayStrategy::Exponential { initial_ms, .. } => *initial_ms = delay,
        }
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "t" | "yes" | "y" | "on" | "1"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn environment_overrides_file_values() {
        let settings = EngineSettings::default()
            .apply_env_from(env(&[
                (ENV_UNKNOWN_PARAMETERS, "warn"),
                (ENV_MAX_ATTEMPTS, "5"),
                (ENV_RETRY_BACKOFF, "fixed"),
                (ENV_RETRY_DELAY_MS, "20"),
                (ENV_DISABLE_PARAMETER_REFERENCES, "True"),
                (ENV_DISCOVER_CONFIG, "no"),
            ]))
            .unwrap();
        assert_eq!(settings.unknown_parameters, UnknownParamPolicy::Warn);
        assert_eq!(settings.retry, RetryPolicy::fixed(5, 20));
        assert!(settings.disable_parameter_references);
        assert!(!settings.discover_config);
    }

    #[test]
    fn bad_environment_value_is_an_error() {
        assert!(
            EngineSettings::default()
                .apply_env_from(env(&[(ENV_MAX_ATTEMPTS, "lots")]))
                .is_err()
        );
        let err = EngineSettings::default()
            .apply_env_from(env(&[(ENV_MAX_ATTEMPTS, "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("positive integer"));
    }

    #[test]
    fn yaml_file_fills_missing_fields_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(
            &path,
            "unknown_parameters: pass-through\nretry:\n  max_attempts: 2\n  delay:\n    kind: fixed\n    delay_ms: 0\n",
        )
        .unwrap();
        let settings = EngineSettings::load(&path).unwrap();
        assert_eq!(settings.unknown_parameters, UnknownParamPolicy::PassThrough);
        assert_eq!(settings.retry, RetryPolicy::no_delay(2));
        assert!(settings.discover_config);
    }
}
