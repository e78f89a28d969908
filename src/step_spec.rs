use serde_json::Value;

use crate::config::ConfigTree;
use crate::error::StepLoadError;
use crate::params::ParamSource;
use crate::resolver::ConfigLayer;

/// Declarative description of a step or pipeline instance.
///
/// `params` keeps inline parameters and any map-form `steps` override
/// blocks; a list-form `steps` entry becomes `steps` children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepSpec {
    pub class: String,
    pub name: Option<String>,
    pub params: ConfigTree,
    pub config_file: Option<String>,
    pub steps: Vec<StepSpec>,
    /// Location the spec was read from, if any.
    pub origin: Option<String>,
}

impl StepSpec {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn config_file(mut self, location: impl Into<String>) -> Self {
        self.config_file = Some(location.into());
        self
    }

    pub fn child(mut self, child: StepSpec) -> Self {
        self.steps.push(child);
        self
    }

    /// Instance name: explicit name, else the class reference.
    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.class)
    }

    pub fn from_tree(tree: &ConfigTree, origin: Option<&str>) -> Result<Self, StepLoadError> {
        let identifier = origin.unwrap_or("<inline>");
        let invalid = |message: String| StepLoadError::InvalidDefinition {
            identifier: identifier.to_string(),
            message,
        };

        let class = match tree.get("class") {
            Some(Value::String(class)) if !class.trim().is_empty() => class.trim().to_string(),
            Some(other) => return Err(invalid(format!("'class' must be a string, found {other}"))),
            None => return Err(invalid("missing 'class' key".into())),
        };
        let name = match tree.get("name") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name.clone()),
            Some(other) => return Err(invalid(format!("'name' must be a string, found {other}"))),
        };
        let config_file = match tree.get("config_file") {
            None | Some(Value::Null) => None,
            Some(Value::String(location)) => Some(location.clone()),
            Some(other) => {
                return Err(invalid(format!(
                    "'config_file' must be a string, found {other}"
                )));
            }
        };

        let mut params = ConfigTree::new();
        let mut steps = Vec::new();
        for (key, value) in tree {
            match (key.as_str(), value) {
                ("class" | "name" | "config_file", _) => {}
                ("steps", Value::Array(items)) => {
                    for (idx, item) in items.iter().enumerate() {
                        let Value::Object(child) = item else {
                            return Err(invalid(format!("child {idx} must be a mapping")));
                        };
                        steps.push(Self::from_tree(child, origin)?);
                    }
                }
                _ => {
                    params.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(Self {
            class,
            name,
            params,
            config_file,
            steps,
            origin: origin.map(str::to_string),
        })
    }

    /// Inline parameters as a layer: a config file if the spec came from
    /// one, otherwise the spec category.
    pub fn layer(&self) -> ConfigLayer {
        let source = match &self.origin {
            Some(location) => ParamSource::ConfigFile(location.clone()),
            None => ParamSource::Spec,
        };
        ConfigLayer::new(source, self.params.clone())
    }

    /// Same category as [`StepSpec::layer`], attributed to `location`.
    pub fn file_source(&self, location: &str) -> ParamSource {
        self.layer().source.with_location(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_steps_become_children() {
        let tree = json!({
            "class": "pipeline",
            "name": "P",
            "on_failure": "continue",
            "steps": [
                {"class": "StepA"},
                {"class": "StepB", "param1": 7}
            ]
        });
        let spec = StepSpec::from_tree(tree.as_object().unwrap(), None).unwrap();
        assert_eq!(spec.instance_name(), "P");
        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[1].params["param1"], json!(7));
        assert!(!spec.params.contains_key("steps"));
        assert_eq!(spec.layer().source, ParamSource::Spec);
    }

    #[test]
    fn map_steps_stay_as_override_blocks() {
        let tree = json!({"class": "detector1", "steps": {"flat_field": {"scale": 2}}});
        let spec = StepSpec::from_tree(tree.as_object().unwrap(), Some("run.yaml")).unwrap();
        assert!(spec.steps.is_empty());
        assert_eq!(spec.params["steps"]["flat_field"]["scale"], json!(2));
        assert_eq!(
            spec.layer().source,
            ParamSource::ConfigFile("run.yaml".into())
        );
    }

    #[test]
    fn class_is_required() {
        let tree = json!({"name": "x"});
        assert!(matches!(
            StepSpec::from_tree(tree.as_object().unwrap(), None),
            Err(StepLoadError::InvalidDefinition { .. })
        ));
    }
}
