//! Layered parameter resolution.
//!
//! A step's effective parameters are built from an ordered list of
//! [`ConfigLayer`]s. Layers are ranked by their [`ParamSource`] category;
//! within a category the later layer wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ConfigSource, ConfigTree};
use crate::error::ConfigurationError;
use crate::params::{ParamSource, ParameterSet, ResolvedParam, StepSchema};

/// Keys that describe structure rather than parameters.
pub const RESERVED_KEYS: &[&str] = &["class", "name", "steps", "config_file", "meta"];

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownParamPolicy {
    #[default]
    Reject,
    Warn,
    PassThrough,
}

impl std::str::FromStr for UnknownParamPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "warn" | "warn-and-drop" => Ok(Self::Warn),
            "pass-through" | "passthrough" | "pass_through" => Ok(Self::PassThrough),
            other => Err(format!(
                "unknown parameter policy '{other}' (expected reject, warn or pass-through)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLayer {
    pub source: ParamSource,
    pub values: ConfigTree,
}

impl ConfigLayer {
    pub fn new(source: ParamSource, values: ConfigTree) -> Self {
        Self { source, values }
    }
}

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Resolve one step's parameters against its schema.
///
/// Every declared parameter ends up with exactly one value. Keys outside the
/// schema follow `policy`, or pass through when the schema is open-ended.
pub fn resolve(
    step: &str,
    schema: &StepSchema,
    layers: &[ConfigLayer],
    policy: UnknownParamPolicy,
) -> Result<ParameterSet, ConfigurationError> {
    let policy = if schema.is_open_ended() {
        UnknownParamPolicy::PassThrough
    } else {
        policy
    };

    let mut winners: BTreeMap<String, (Value, ParamSource)> = BTreeMap::new();
    for layer in ranked(layers) {
        for (key, value) in &layer.values {
            if is_reserved(key) {
                continue;
            }
            if !schema.contains(key) {
                match policy {
                    UnknownParamPolicy::Reject => {
                        return Err(ConfigurationError::UnknownParameter {
                            step: step.to_string(),
                            name: key.clone(),
                        });
                    }
                    UnknownParamPolicy::Warn => {
                        warn!(step, parameter = key.as_str(), source = %layer.source, "Dropping unknown parameter");
                        continue;
                    }
                    UnknownParamPolicy::PassThrough => {}
                }
            }
            winners.insert(key.clone(), (value.clone(), layer.source.clone()));
        }
    }

    let mut params = ParameterSet::default();
    for spec in schema.iter() {
        let (value, source) = match winners.remove(&spec.name) {
            Some((raw, source)) => (spec.coerce(step, &raw)?, source),
            None => {
                let value = spec
                    .default_value()
                    .ok_or_else(|| ConfigurationError::MissingValue {
                        step: step.to_string(),
                        name: spec.name.clone(),
                    })?;
                (spec.coerce(step, &value)?, ParamSource::Default)
            }
        };
        params.insert(
            spec.name.clone(),
            ResolvedParam {
                value,
                source,
                spec: Some(spec.clone()),
            },
        );
    }

    for (name, (value, source)) in winners {
        debug!(step, parameter = name.as_str(), "Passing through undeclared parameter");
        params.insert(
            name,
            ResolvedParam {
                value,
                source,
                spec: None,
            },
        );
    }

    Ok(params)
}

/// Stable sort by category: declaration order decides within a category.
fn ranked(layers: &[ConfigLayer]) -> Vec<&ConfigLayer> {
    let mut ordered: Vec<&ConfigLayer> = layers.iter().collect();
    ordered.sort_by_key(|layer| layer.source.rank());
    ordered
}

fn steps_block<'a>(
    step: &str,
    layer: &'a ConfigLayer,
) -> Result<Option<&'a ConfigTree>, ConfigurationError> {
    match layer.values.get("steps") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(ConfigurationError::InvalidStructure {
            step: step.to_string(),
            message: format!("'steps' must be a mapping of child blocks, found {other}"),
        }),
    }
}

/// Layers addressed to child `child` (at zero-based `position`) of `parent`.
///
/// For each parent layer the position-keyed block is applied before the
/// name-keyed one. A block's `config_file` is read through `source` and
/// placed just before the block, in the same category as the parent layer.
pub fn descend(
    parent: &str,
    layers: &[ConfigLayer],
    child: &str,
    position: usize,
    source: &dyn ConfigSource,
) -> Result<Vec<ConfigLayer>, ConfigurationError> {
    let position_key = position.to_string();
    let mut child_layers = Vec::new();
    for layer in layers {
        let Some(blocks) = steps_block(parent, layer)? else {
            continue;
        };
        for key in [position_key.as_str(), child] {
            let Some(block) = blocks.get(key) else {
                continue;
            };
            let Value::Object(block) = block else {
                return Err(ConfigurationError::InvalidStructure {
                    step: parent.to_string(),
                    message: format!("steps block '{key}' must be a mapping"),
                });
            };
            if let Some(location) = block.get("config_file").and_then(Value::as_str) {
                let referenced = read_child_file(child, location, source)?;
                child_layers.push(ConfigLayer::new(
                    layer.source.with_location(location),
                    referenced,
                ));
            }
            child_layers.push(ConfigLayer::new(layer.source.clone(), block.clone()));
        }
    }
    Ok(child_layers)
}

fn read_child_file(
    child: &str,
    location: &str,
    source: &dyn ConfigSource,
) -> Result<ConfigTree, ConfigurationError> {
    let tree = source.read(location)?;
    if let Some(name) = tree.get("name").and_then(Value::as_str)
        && name != child
    {
        return Err(ConfigurationError::InvalidStructure {
            step: child.to_string(),
            message: format!(
                "config file '{location}' is for step '{name}', cannot apply it to '{child}'"
            ),
        });
    }
    Ok(tree)
}

/// Check that every `steps` block names a child by name or position.
pub fn check_child_blocks(
    step: &str,
    layers: &[ConfigLayer],
    children: &[String],
    policy: UnknownParamPolicy,
) -> Result<(), ConfigurationError> {
    for layer in layers {
        let Some(blocks) = steps_block(step, layer)? else {
            continue;
        };
        for key in blocks.keys() {
            let by_name = children.iter().any(|child| child == key);
            let by_position = key.parse::<usize>().is_ok_and(|idx| idx < children.len());
            if !(by_name || by_position) {
                unknown_block(step, key, policy)?;
            }
        }
    }
    Ok(())
}

/// An atomic step has no children, so any `steps` block is unknown.
pub fn reject_child_blocks(
    step: &str,
    layers: &[ConfigLayer],
    policy: UnknownParamPolicy,
) -> Result<(), ConfigurationError> {
    for layer in layers {
        if let Some(blocks) = steps_block(step, layer)? {
            for key in blocks.keys() {
                unknown_block(step, key, policy)?;
            }
        }
    }
    Ok(())
}

fn unknown_block(step: &str, key: &str, policy: UnknownParamPolicy) -> Result<(), ConfigurationError> {
    match policy {
        UnknownParamPolicy::Reject => Err(ConfigurationError::UnknownChildStep {
            step: step.to_string(),
            name: key.to_string(),
        }),
        UnknownParamPolicy::Warn => {
            warn!(step, block = key, "Dropping steps block that matches no child");
            Ok(())
        }
        UnknownParamPolicy::PassThrough => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigSource;
    use crate::params::ParamSpec;
    use serde_json::json;

    fn tree(value: Value) -> ConfigTree {
        value.as_object().cloned().unwrap_or_default()
    }

    fn schema() -> StepSchema {
        StepSchema::new()
            .param(ParamSpec::integer("param1").default(1))
            .param(ParamSpec::float("scale").default(1.0).min(0.0))
    }

    #[test]
    fn later_layer_in_same_category_wins() {
        let layers = vec![
            ConfigLayer::new(ParamSource::ConfigFile("a.yaml".into()), tree(json!({"param1": 2}))),
            ConfigLayer::new(ParamSource::ConfigFile("b.yaml".into()), tree(json!({"param1": 3}))),
        ];
        let params = resolve("s", &schema(), &layers, UnknownParamPolicy::Reject).unwrap();
        assert_eq!(params.get_i64("param1"), Some(3));
        assert_eq!(
            params.source("param1"),
            Some(&ParamSource::ConfigFile("b.yaml".into()))
        );
    }

    #[test]
    fn category_dominates_declaration_order() {
        let layers = vec![
            ConfigLayer::new(ParamSource::Call, tree(json!({"param1": 10}))),
            ConfigLayer::new(ParamSource::Spec, tree(json!({"param1": 7}))),
        ];
        let params = resolve("s", &schema(), &layers, UnknownParamPolicy::Reject).unwrap();
        assert_eq!(params.get_i64("param1"), Some(10));
    }

    #[test]
    fn defaults_are_coerced_and_range_checked() {
        let loose = StepSchema::new().param(ParamSpec::float("gain").default(2));
        let params = resolve("s", &loose, &[], UnknownParamPolicy::Reject).unwrap();
        assert_eq!(params.get("gain"), Some(&json!(2.0)));
        assert!(params.get("gain").unwrap().is_f64());

        let broken = StepSchema::new().param(ParamSpec::float("gain").default(-1.0).min(0.0));
        let err = resolve("s", &broken, &[], UnknownParamPolicy::Reject).unwrap_err();
        assert!(matches!(err, ConfigurationError::OutOfRange { ref name, .. } if name == "gain"));
    }

    #[test]
    fn reserved_keys_are_not_parameters() {
        let layers = vec![ConfigLayer::new(
            ParamSource::Spec,
            tree(json!({"class": "x", "name": "y", "meta": {}, "param1": 4})),
        )];
        let params = resolve("s", &schema(), &layers, UnknownParamPolicy::Reject).unwrap();
        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["param1", "scale"]);
    }

    #[test]
    fn open_ended_schema_passes_unknown_keys() {
        let open = schema().open_ended();
        let layers = vec![ConfigLayer::new(ParamSource::Spec, tree(json!({"extra": "x"})))];
        let params = resolve("s", &open, &layers, UnknownParamPolicy::Reject).unwrap();
        assert_eq!(params.get_str("extra"), Some("x"));
        assert!(params.entry("extra").unwrap().spec.is_none());
    }

    #[test]
    fn missing_required_value_is_reported() {
        let required = StepSchema::new().param(ParamSpec::string("mode"));
        let err = resolve("s", &required, &[], UnknownParamPolicy::Reject).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingValue { .. }));
    }

    #[test]
    fn descend_orders_file_position_and_name_blocks() {
        let source = MemoryConfigSource::new().with("child.yaml", tree(json!({"param1": 5})));
        let layers = vec![ConfigLayer::new(
            ParamSource::ConfigFile("pipe.yaml".into()),
            tree(json!({"steps": {
                "flat": {"config_file": "child.yaml", "scale": 2.0},
                "1": {"param1": 6}
            }})),
        )];
        let child = descend("pipe", &layers, "flat", 1, &source).unwrap();
        assert_eq!(child.len(), 3);
        assert_eq!(child[0].values["param1"], json!(6));
        assert_eq!(child[1].source, ParamSource::ConfigFile("child.yaml".into()));
        assert_eq!(child[2].values["scale"], json!(2.0));
    }

    #[test]
    fn child_file_name_must_match() {
        let source = MemoryConfigSource::new().with("other.yaml", tree(json!({"name": "dark"})));
        let layers = vec![ConfigLayer::new(
            ParamSource::Override,
            tree(json!({"steps": {"flat": {"config_file": "other.yaml"}}})),
        )];
        assert!(descend("pipe", &layers, "flat", 0, &source).is_err());
    }

    #[test]
    fn unmatched_blocks_follow_policy() {
        let layers = vec![ConfigLayer::new(
            ParamSource::Override,
            tree(json!({"steps": {"nope": {"x": 1}}})),
        )];
        let children = vec!["flat".to_string()];
        assert!(check_child_blocks("pipe", &layers, &children, UnknownParamPolicy::Reject).is_err());
        assert!(check_child_blocks("pipe", &layers, &children, UnknownParamPolicy::Warn).is_ok());
        assert!(reject_child_blocks("flat", &layers, UnknownParamPolicy::Reject).is_err());
    }
}
