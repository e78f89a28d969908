use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::reference::ObservationMetadata;

/// Metadata sections the engine writes itself; they never take part in
/// reference selection.
const PROVENANCE_SECTIONS: &[&str] = &["cal_step", "ref_file"];

/// A data product flowing between steps: an opaque payload plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProduct {
    pub name: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub data: Value,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl DataProduct {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            meta: Map::new(),
            data,
            source: None,
        }
    }

    pub fn with_meta(mut self, dotted: &str, value: impl Into<Value>) -> Self {
        self.set_meta(dotted, value);
        self
    }

    /// Content identity: `<name>@<first 16 hex digits of sha256>`.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(serde_json::to_vec(&self.meta).unwrap_or_default());
        hasher.update(serde_json::to_vec(&self.data).unwrap_or_default());
        let digest = format!("{:x}", hasher.finalize());
        format!("{}@{}", self.name, &digest[..16])
    }

    /// Set `meta.a.b.c`, creating intermediate sections.
    pub fn set_meta(&mut self, dotted: &str, value: impl Into<Value>) {
        let mut segments: Vec<&str> = dotted.split('.').collect();
        let Some(leaf) = segments.pop() else {
            return;
        };
        let mut current = &mut self.meta;
        for segment in segments {
            let slot = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Value::Object(next) = slot else {
                return;
            };
            current = next;
        }
        current.insert(leaf.to_string(), value.into());
    }

    pub fn meta_value(&self, dotted: &str) -> Option<&Value> {
        let mut segments = dotted.split('.');
        let first = segments.next()?;
        let mut current = self.meta.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Scalar metadata flattened to dotted keys, minus provenance sections.
    pub fn observation_metadata(&self) -> ObservationMetadata {
        let mut flat = ObservationMetadata::new();
        for (key, value) in &self.meta {
            if PROVENANCE_SECTIONS.contains(&key.as_str()) {
                continue;
            }
            flatten_into(&mut flat, key, value);
        }
        flat
    }

    /// File stem of the source if loaded from disk, else the product name.
    pub fn basename(&self) -> String {
        self.source
            .as_ref()
            .and_then(|path| path.file_stem())
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone())
    }
}

fn flatten_into(flat: &mut ObservationMetadata, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(flat, &format!("{prefix}.{key}"), child);
            }
        }
        other => {
            flat.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Durable storage for data products.
pub trait ResultStore: Send + Sync {
    fn save(&self, product: &DataProduct, destination: &Path) -> Result<()>;
    fn load(&self, source: &Path) -> Result<DataProduct>;

    /// File extension this store writes.
    fn extension(&self) -> &str {
        "json"
    }
}

/// Stores products as pretty-printed JSON documents.
#[derive(Debug, Default, Clone)]
pub struct JsonResultStore;

impl ResultStore for JsonResultStore {
    fn save(&self, product: &DataProduct, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory: {}", parent.display())
            })?;
        }
        let file = File::create(destination)
            .with_context(|| format!("Failed to create result file: {}", destination.display()))?;
        serde_json::to_writer_pretty(file, product)
            .with_context(|| format!("Failed to write result: {}", destination.display()))?;
        Ok(())
    }

    fn load(&self, source: &Path) -> Result<DataProduct> {
        let content = fs::read_to_string(source)
            .with_context(|| format!("Failed to read input file: {}", source.display()))?;
        let mut product: DataProduct = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse data product JSON: {}", source.display()))?;
        product.source = Some(source.to_path_buf());
        Ok(product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn identity_follows_content() {
        let a = DataProduct::new("exp1", json!([1, 2, 3]));
        let mut b = a.clone();
        assert_eq!(a.identity(), b.identity());
        b.data = json!([1, 2, 4]);
        assert_ne!(a.identity(), b.identity());
        assert!(a.identity().starts_with("exp1@"));
    }

    #[test]
    fn observation_metadata_skips_provenance() {
        let product = DataProduct::new("exp", Value::Null)
            .with_meta("instrument.name", "NIRCAM")
            .with_meta("instrument.detector", "NRCA1")
            .with_meta("cal_step.dark", "COMPLETE");
        let flat = product.observation_metadata();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat["instrument.detector"], json!("NRCA1"));
        assert_eq!(product.meta_value("cal_step.dark"), Some(&json!("COMPLETE")));
    }

    #[test]
    fn json_store_keeps_source_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("exp.json");
        let product = DataProduct::new("exp", json!({"pixels": [1.0, 2.0]}));
        JsonResultStore.save(&product, &path).unwrap();
        let loaded = JsonResultStore.load(&path).unwrap();
        assert_eq!(loaded.data, product.data);
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.basename(), "exp");
    }
}
