use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::ConfigTree;
use crate::step::ConfiguredStep;

/// Resolved parameters of a configured tree, shaped like a config file:
/// `class`, `name`, the step's parameters and a `steps` block per child.
///
/// Feeding the result back as a config file reproduces the same
/// parameters.
pub fn parameter_tree(step: &ConfiguredStep) -> ConfigTree {
    let mut tree = step_block(step);
    let mut meta = Map::new();
    meta.insert(
        "generated_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    meta.insert("params_hash".to_string(), Value::String(tree_hash(step)));
    tree.insert("meta".to_string(), Value::Object(meta));
    tree
}

fn step_block(step: &ConfiguredStep) -> ConfigTree {
    let mut tree = ConfigTree::new();
    tree.insert("class".to_string(), Value::String(step.class_name.clone()));
    tree.insert("name".to_string(), Value::String(step.name.clone()));
    for (name, param) in step.parameters.iter() {
        tree.insert(name.to_string(), param.value.clone());
    }
    let children = step.children();
    if !children.is_empty() {
        let blocks = children
            .iter()
            .map(|child| (child.name.clone(), Value::Object(step_block(child))))
            .collect();
        tree.insert("steps".to_string(), Value::Object(blocks));
    }
    tree
}

/// Hash over every step's qualified name and parameter fingerprint.
pub fn tree_hash(step: &ConfiguredStep) -> String {
    let mut hasher = Sha256::new();
    hash_into(&mut hasher, step);
    format!("{:x}", hasher.finalize())
}

fn hash_into(hasher: &mut Sha256, step: &ConfiguredStep) {
    hasher.update(step.qualified_name.as_bytes());
    hasher.update(step.parameters.fingerprint().as_bytes());
    for child in step.children() {
        hash_into(hasher, child);
    }
}

pub fn write_parameters(step: &ConfiguredStep, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create parameter file: {}", path.display()))?;
    serde_yaml::to_writer(file, &parameter_tree(step))
        .with_context(|| format!("Failed to write parameter file: {}", path.display()))?;
    Ok(())
}
