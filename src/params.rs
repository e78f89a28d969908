//! Declared parameter schemas, value coercion and resolved parameter sets.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Boolean,
    Integer,
    Float,
    String,
    List,
    Choice(Vec<String>),
    Any,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => write!(f, "boolean"),
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::String => write!(f, "string"),
            Self::List => write!(f, "list"),
            Self::Choice(choices) => write!(f, "option({})", choices.join(", ")),
            Self::Any => write!(f, "any"),
        }
    }
}

/// One declared parameter.
///
/// A parameter without a default is required unless it is nullable, in which
/// case its effective default is `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub default: Option<Value>,
    pub nullable: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub doc: String,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            nullable: false,
            min: None,
            max: None,
            doc: String::new(),
        }
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Boolean)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Float)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::String)
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::List)
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Any)
    }

    pub fn choice(name: impl Into<String>, choices: &[&str]) -> Self {
        Self::new(
            name,
            ParamType::Choice(choices.iter().map(|c| c.to_string()).collect()),
        )
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    /// Effective default, if the parameter has one.
    pub fn default_value(&self) -> Option<Value> {
        match &self.default {
            Some(value) => Some(value.clone()),
            None if self.nullable => Some(Value::Null),
            None => None,
        }
    }

    /// Coerce a raw input value to the declared type and check its range.
    pub fn coerce(&self, step: &str, raw: &Value) -> Result<Value, ConfigurationError> {
        if raw.is_null() || (self.nullable && is_none_literal(raw)) {
            if self.nullable {
                return Ok(Value::Null);
            }
            return Err(self.coercion_error(step, raw));
        }

        let value = match &self.ty {
            ParamType::Boolean => value_as_bool(raw).map(Value::Bool),
            ParamType::Integer => value_as_i64(raw).map(Value::from),
            ParamType::Float => value_as_f64(raw).map(Value::from),
            ParamType::String => value_as_string(raw).map(Value::String),
            ParamType::List => value_as_list(raw).map(Value::Array),
            ParamType::Choice(choices) => {
                let text = value_as_string(raw).ok_or_else(|| self.coercion_error(step, raw))?;
                if !choices.contains(&text) {
                    return Err(ConfigurationError::OutOfRange {
                        step: step.to_string(),
                        name: self.name.clone(),
                        value: render(raw),
                        allowed: format!("[{}]", choices.join(", ")),
                    });
                }
                Some(Value::String(text))
            }
            ParamType::Any => Some(raw.clone()),
        }
        .ok_or_else(|| self.coercion_error(step, raw))?;

        self.check_range(step, &value)?;
        Ok(value)
    }

    fn check_range(&self, step: &str, value: &Value) -> Result<(), ConfigurationError> {
        let Some(number) = value.as_f64() else {
            return Ok(());
        };
        let below = self.min.is_some_and(|min| number < min);
        let above = self.max.is_some_and(|max| number > max);
        if below || above {
            let lower = self.min.map(|m| m.to_string()).unwrap_or_else(|| "-inf".into());
            let upper = self.max.map(|m| m.to_string()).unwrap_or_else(|| "inf".into());
            return Err(ConfigurationError::OutOfRange {
                step: step.to_string(),
                name: self.name.clone(),
                value: render(value),
                allowed: format!("[{lower}, {upper}]"),
            });
        }
        Ok(())
    }

    fn coercion_error(&self, step: &str, raw: &Value) -> ConfigurationError {
        ConfigurationError::Coercion {
            step: step.to_string(),
            name: self.name.clone(),
            expected: self.ty.to_string(),
            value: render(raw),
        }
    }
}

/// Ordered set of declared parameters for a step class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepSchema {
    params: Vec<ParamSpec>,
    open_ended: bool,
}

impl StepSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter declaration.
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.insert(spec);
        self
    }

    pub fn insert(&mut self, spec: ParamSpec) {
        match self.params.iter_mut().find(|p| p.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.params.push(spec),
        }
    }

    /// Accept parameters outside the declared set.
    pub fn open_ended(mut self) -> Self {
        self.open_ended = true;
        self
    }

    pub fn is_open_ended(&self) -> bool {
        self.open_ended
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Declarations of `other` replace same-named declarations of `self`.
    pub fn merged(&self, other: &StepSchema) -> StepSchema {
        let mut merged = self.clone();
        for spec in other.iter() {
            merged.insert(spec.clone());
        }
        merged.open_ended = self.open_ended || other.open_ended;
        merged
    }
}

/// Where an effective parameter value came from, lowest precedence first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum ParamSource {
    Default,
    ParameterReference(String),
    Spec,
    ConfigFile(String),
    Override,
    Call,
}

impl ParamSource {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Default => 0,
            Self::ParameterReference(_) => 1,
            Self::Spec => 2,
            Self::ConfigFile(_) => 3,
            Self::Override => 4,
            Self::Call => 5,
        }
    }

    /// Same category, attributed to a different location where the category
    /// carries one.
    pub fn with_location(&self, location: impl Into<String>) -> Self {
        match self {
            Self::ConfigFile(_) => Self::ConfigFile(location.into()),
            Self::ParameterReference(_) => Self::ParameterReference(location.into()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for ParamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::ParameterReference(location) => write!(f, "parameter-reference:{location}"),
            Self::Spec => write!(f, "spec"),
            Self::ConfigFile(location) => write!(f, "config-file:{location}"),
            Self::Override => write!(f, "override"),
            Self::Call => write!(f, "call"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedParam {
    pub value: Value,
    pub source: ParamSource,
    /// `None` for values accepted under the pass-through policy.
    #[serde(skip)]
    pub spec: Option<ParamSpec>,
}

/// Fully resolved parameters for one step invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ParameterSet {
    entries: BTreeMap<String, ResolvedParam>,
}

impl ParameterSet {
    pub(crate) fn insert(&mut self, name: impl Into<String>, param: ResolvedParam) {
        self.entries.insert(name.into(), param);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|p| &p.value)
    }

    pub fn entry(&self, name: &str) -> Option<&ResolvedParam> {
        self.entries.get(name)
    }

    pub fn source(&self, name: &str) -> Option<&ParamSource> {
        self.entries.get(name).map(|p| &p.source)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedParam)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_strings(&self, name: &str) -> Vec<String> {
        self.get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Plain name → value mapping.
    pub fn values(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// SHA-256 over the ordered name/value pairs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let serialized = serde_json::to_vec(&self.values()).unwrap_or_default();
        hasher.update(serialized);
        format!("{:x}", hasher.finalize())
    }
}

fn is_none_literal(value: &Value) -> bool {
    matches!(value, Value::String(s) if matches!(s.trim(), "None" | "null" | "~"))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(num) => num.as_u64().and_then(|n| match n {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "on" | "1" => Some(true),
            "false" | "f" | "no" | "n" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(num) => num.as_i64().or_else(|| {
            num.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(num) => num.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|f: &f64| f.is_finite())
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(num) => Some(num.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_as_list(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::String(s) if s.trim().is_empty() => Some(Vec::new()),
        Value::String(s) => Some(
            s.split(',')
                .map(|item| Value::String(item.trim().to_string()))
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strings_coerce_to_declared_types() {
        assert_eq!(
            ParamSpec::boolean("b").coerce("s", &json!("yes")).unwrap(),
            json!(true)
        );
        assert_eq!(
            ParamSpec::integer("i").coerce("s", &json!(" 42 ")).unwrap(),
            json!(42)
        );
        assert_eq!(
            ParamSpec::float("f").coerce("s", &json!("2.5")).unwrap(),
            json!(2.5)
        );
        assert_eq!(
            ParamSpec::list("l").coerce("s", &json!("a, b")).unwrap(),
            json!(["a", "b"])
        );
        assert_eq!(
            ParamSpec::integer("i").coerce("s", &json!(3.0)).unwrap(),
            json!(3)
        );
    }

    #[test]
    fn coercion_failure_names_parameter_and_value() {
        let err = ParamSpec::integer("nframes")
            .coerce("ramp", &json!("many"))
            .unwrap_err();
        match &err {
            ConfigurationError::Coercion { name, value, .. } => {
                assert_eq!(name, "nframes");
                assert_eq!(value, "'many'");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("nframes"));
    }

    #[test]
    fn nullable_accepts_none_literal() {
        let spec = ParamSpec::string("output_dir").nullable();
        assert_eq!(spec.coerce("s", &json!("None")).unwrap(), Value::Null);
        assert_eq!(spec.default_value(), Some(Value::Null));
        assert!(ParamSpec::float("x").coerce("s", &Value::Null).is_err());
    }

    #[test]
    fn range_and_choices_are_enforced() {
        let spec = ParamSpec::float("scale").range(0.0, 10.0);
        assert!(matches!(
            spec.coerce("s", &json!(11)),
            Err(ConfigurationError::OutOfRange { .. })
        ));
        let choice = ParamSpec::choice("mode", &["abort", "continue"]);
        assert_eq!(
            choice.coerce("s", &json!("continue")).unwrap(),
            json!("continue")
        );
        assert!(choice.coerce("s", &json!("retry")).is_err());
    }

    #[test]
    fn merged_schema_replaces_declarations() {
        let base = StepSchema::new().param(ParamSpec::boolean("skip").default(false));
        let class = StepSchema::new()
            .param(ParamSpec::boolean("skip").default(true))
            .param(ParamSpec::float("scale").default(1.0));
        let merged = base.merged(&class);
        assert_eq!(merged.names(), vec!["skip", "scale"]);
        assert_eq!(merged.get("skip").unwrap().default, Some(json!(true)));
    }
}
