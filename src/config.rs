//! Configuration sources and caller overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Result, bail};
use serde_json::{Map, Value};

use crate::error::ConfigurationError;

/// Nested key/value mapping read from any configuration source.
pub type ConfigTree = Map<String, Value>;

pub trait ConfigSource: Send + Sync {
    fn read(&self, location: &str) -> Result<ConfigTree, ConfigurationError>;
    fn exists(&self, location: &str) -> bool;
}

/// Reads YAML or JSON files, picked by extension (`.json` is JSON, anything
/// else is parsed as YAML).
///
/// Relative `config_file` entries inside the tree are rewritten against the
/// directory of the file that names them.
#[derive(Debug, Default, Clone)]
pub struct FileConfigSource;

impl FileConfigSource {
    pub fn new() -> Self {
        Self
    }
}

impl ConfigSource for FileConfigSource {
    fn read(&self, location: &str) -> Result<ConfigTree, ConfigurationError> {
        let path = Path::new(location);
        let content = std::fs::read_to_string(path).map_err(|err| source_error(location, err))?;
        let value = parse_document(path, &content).map_err(|err| source_error(location, err))?;
        let mut tree = match value {
            Value::Object(map) => map,
            Value::Null => ConfigTree::new(),
            other => {
                return Err(source_error(
                    location,
                    format!("expected a mapping at the top level, found {other}"),
                ));
            }
        };
        if let Some(dir) = path.parent() {
            rebase_config_files(&mut tree, dir);
        }
        Ok(tree)
    }

    fn exists(&self, location: &str) -> bool {
        Path::new(location).is_file()
    }
}

/// In-memory sources keyed by location, for callers that build configuration
/// programmatically.
#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    trees: RwLock<HashMap<String, ConfigTree>>,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, location: impl Into<String>, tree: ConfigTree) -> Self {
        self.insert(location, tree);
        self
    }

    pub fn insert(&self, location: impl Into<String>, tree: ConfigTree) {
        if let Ok(mut guard) = self.trees.write() {
            guard.insert(location.into(), tree);
        }
    }
}

impl ConfigSource for MemoryConfigSource {
    fn read(&self, location: &str) -> Result<ConfigTree, ConfigurationError> {
        self.trees
            .read()
            .ok()
            .and_then(|guard| guard.get(location).cloned())
            .ok_or_else(|| source_error(location, "no such configuration"))
    }

    fn exists(&self, location: &str) -> bool {
        self.trees
            .read()
            .map(|guard| guard.contains_key(location))
            .unwrap_or(false)
    }
}

fn parse_document(path: &Path, content: &str) -> Result<Value> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        Ok(serde_json::from_str(content)?)
    } else {
        Ok(serde_yaml::from_str(content)?)
    }
}

fn source_error(location: &str, err: impl ToString) -> ConfigurationError {
    ConfigurationError::Source {
        location: location.to_string(),
        message: err.to_string(),
    }
}

fn rebase_config_files(tree: &mut ConfigTree, dir: &Path) {
    for (key, value) in tree.iter_mut() {
        match value {
            Value::String(location) if key == "config_file" => {
                let candidate = PathBuf::from(location.as_str());
                if candidate.is_relative() {
                    *location = dir.join(candidate).to_string_lossy().to_string();
                }
            }
            Value::Object(child) => rebase_config_files(child, dir),
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(child) = item {
                        rebase_config_files(child, dir);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Caller-supplied overrides, addressed with dotted keys.
///
/// `param` targets the top-level step; `StepB.param1` targets parameter
/// `param1` of child `StepB` and is stored as `steps.StepB.param1`. The long
/// form with explicit `steps` segments is accepted as well.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    explicit: ConfigTree,
    call: ConfigTree,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit programmatic or command-line override.
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        insert_dotted(&mut self.explicit, key, value.into());
        self
    }

    /// Per-invocation keyword override, the highest precedence.
    pub fn call(mut self, key: &str, value: impl Into<Value>) -> Self {
        insert_dotted(&mut self.call, key, value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        insert_dotted(&mut self.explicit, key, value.into());
    }

    pub fn insert_call(&mut self, key: &str, value: impl Into<Value>) {
        insert_dotted(&mut self.call, key, value.into());
    }

    pub fn explicit(&self) -> &ConfigTree {
        &self.explicit
    }

    pub fn call_tree(&self) -> &ConfigTree {
        &self.call
    }

    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty() && self.call.is_empty()
    }
}

fn insert_dotted(tree: &mut ConfigTree, key: &str, value: Value) {
    let mut segments: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
    let Some(param) = segments.pop() else {
        return;
    };
    let mut current = tree;
    for segment in segments.into_iter().filter(|s| *s != "steps") {
        current = descend_mut(current, "steps");
        current = descend_mut(current, segment);
    }
    current.insert(param.to_string(), value);
}

fn descend_mut<'a>(tree: &'a mut ConfigTree, key: &str) -> &'a mut ConfigTree {
    let slot = tree
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(ConfigTree::new()));
    if !slot.is_object() {
        *slot = Value::Object(ConfigTree::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just replaced with a mapping"),
    }
}

/// Parse `key=value`. The value stays a string; coercion happens against the
/// declared schema.
pub fn parse_assignment(text: &str) -> Result<(String, Value)> {
    let Some((key, value)) = text.split_once('=') else {
        bail!("Expected key=value, got '{text}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Missing parameter name in '{text}'");
    }
    Ok((key.to_string(), Value::String(value.trim().to_string())))
}
