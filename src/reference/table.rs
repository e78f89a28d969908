use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{ObservationMetadata, ReferenceLookup, ReferenceService, ServiceError};

/// Offline reference service backed by a list of exact-match rules.
///
/// ```yaml
/// rules:
///   - reftype: dark
///     match: { instrument.name: NIRCAM, exposure.readpatt: RAPID }
///     identifier: dark_0042.json
///   - reftype: flat
///     match: { instrument.name: MIRI }
///     not_applicable: true
/// ```
///
/// The first rule whose criteria all equal the observation metadata wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferenceTable {
    #[serde(default)]
    pub rules: Vec<TableRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableRule {
    pub reftype: String,
    #[serde(default, rename = "match")]
    pub criteria: Map<String, Value>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub not_applicable: bool,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl ReferenceTable {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read reference table: {}", path.display()))?;
        let table: ReferenceTable = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse reference table YAML: {}", path.display()))?;
        Ok(table)
    }

    pub fn from_rules(rules: Vec<TableRule>) -> Self {
        Self { rules }
    }
}

impl TableRule {
    pub fn found(reftype: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            reftype: reftype.into(),
            criteria: Map::new(),
            identifier: Some(identifier.into()),
            not_applicable: false,
            details: Map::new(),
        }
    }

    pub fn not_applicable(reftype: impl Into<String>) -> Self {
        Self {
            reftype: reftype.into(),
            criteria: Map::new(),
            identifier: None,
            not_applicable: true,
            details: Map::new(),
        }
    }

    pub fn when(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.criteria.insert(key.into(), value.into());
        self
    }

    fn matches(&self, reftype: &str, metadata: &ObservationMetadata) -> bool {
        self.reftype == reftype
            && self.criteria.iter().all(|(key, expected)| {
                metadata
                    .get(key)
                    .is_some_and(|actual| loosely_equal(actual, expected))
            })
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::String(a), b) | (b, Value::String(a)) => a == &b.to_string(),
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => false,
    }
}

impl ReferenceService for ReferenceTable {
    fn lookup(
        &self,
        reftype: &str,
        metadata: &ObservationMetadata,
    ) -> Result<ReferenceLookup, ServiceError> {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.matches(reftype, metadata))
            .ok_or_else(|| {
                ServiceError::Permanent(format!("no '{reftype}' reference matches the observation"))
            })?;
        if rule.not_applicable {
            return Ok(ReferenceLookup::NotApplicable);
        }
        let identifier = rule.identifier.clone().ok_or_else(|| {
            ServiceError::Permanent(format!(
                "rule for '{reftype}' has neither identifier nor not_applicable"
            ))
        })?;
        Ok(ReferenceLookup::Found {
            identifier,
            details: rule.details.clone(),
        })
    }
}
