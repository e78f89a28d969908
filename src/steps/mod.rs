//! Bundled demonstration steps.

use anyhow::{Result, anyhow, bail};
use serde_json::Value;

use crate::data::DataProduct;
use crate::params::{ParamSpec, ParameterSet};
use crate::pipeline::{FailurePolicy, PipelineBlueprint};
use crate::reference::ReferenceRequirement;
use crate::registry::StepRegistry;
use crate::step::{Step, StepClass, StepContext};
use crate::step_spec::StepSpec;

pub fn register_defaults(registry: &mut StepRegistry) {
    registry.register(
        StepClass::step("dark_current", |params| {
            Ok(Box::new(DarkCurrentStep::from_params(params)?))
        })
        .path("calpipe.steps.DarkCurrentStep")
        .alias("dark")
        .describe("Subtract a constant dark level from every pixel")
        .param(
            ParamSpec::float("dark_level")
                .default(0.0)
                .doc("Level subtracted from each pixel"),
        )
        .reference(ReferenceRequirement::required("dark")),
    );
    registry.register(
        StepClass::step("flat_field", |params| {
            Ok(Box::new(FlatFieldStep::from_params(params)?))
        })
        .path("calpipe.steps.FlatFieldStep")
        .alias("flat")
        .describe("Divide pixels by the flat-field scale")
        .param(
            ParamSpec::float("scale")
                .default(1.0)
                .doc("Flat-field normalisation; zero is rejected at run time"),
        )
        .reference(ReferenceRequirement::required("flat")),
    );
    registry.register(
        StepClass::step("annotate", |params| {
            Ok(Box::new(AnnotateStep::from_params(params)?))
        })
        .path("calpipe.steps.AnnotateStep")
        .describe("Write a metadata value")
        .param(
            ParamSpec::string("key")
                .default("annotated")
                .doc("Dotted metadata key"),
        )
        .param(ParamSpec::any("value").default("true")),
    );
    registry.register(
        StepClass::step("clip", |params| Ok(Box::new(ClipStep::from_params(params)?)))
            .path("calpipe.steps.ClipStep")
            .describe("Clamp pixels into [min, max]")
            .param(ParamSpec::float("min").nullable())
            .param(ParamSpec::float("max").nullable()),
    );
    registry.register(
        StepClass::pipeline("pipeline", PipelineBlueprint::default())
            .path("calpipe.pipeline.Pipeline")
            .describe("Generic pipeline; children come from the definition"),
    );
    registry.register(
        StepClass::pipeline(
            "detector1",
            PipelineBlueprint::new(vec![
                StepSpec::new("dark_current"),
                StepSpec::new("flat_field"),
            ])
            .on_failure(FailurePolicy::Abort),
        )
        .path("calpipe.pipeline.Detector1Pipeline")
        .describe("Dark subtraction followed by flat fielding"),
    );
}

struct DarkCurrentStep {
    level: f64,
}

impl DarkCurrentStep {
    fn from_params(params: &ParameterSet) -> Result<Self> {
        let level = params
            .get_f64("dark_level")
            .ok_or_else(|| anyhow!("dark_current requires 'dark_level'"))?;
        Ok(Self { level })
    }
}

impl Step for DarkCurrentStep {
    fn run(&self, input: &DataProduct, ctx: &StepContext) -> Result<DataProduct> {
        let mut output = input.clone();
        output.data = map_pixels(&input.data, &|pixel| pixel - self.level)?;
        output.set_meta("dark_current.level", self.level);
        if let Some(reference) = ctx.reference("dark") {
            output.set_meta("dark_current.reference", reference);
        }
        Ok(output)
    }
}

struct FlatFieldStep {
    scale: f64,
}

impl FlatFieldStep {
    fn from_params(params: &ParameterSet) -> Result<Self> {
        let scale = params
            .get_f64("scale")
            .ok_or_else(|| anyhow!("flat_field requires 'scale'"))?;
        Ok(Self { scale })
    }
}

impl Step for FlatFieldStep {
    fn run(&self, input: &DataProduct, _ctx: &StepContext) -> Result<DataProduct> {
        if self.scale == 0.0 {
            bail!("flat-field scale must be non-zero");
        }
        let mut output = input.clone();
        output.data = map_pixels(&input.data, &|pixel| pixel / self.scale)?;
        Ok(output)
    }

    fn skip_reason(&self, input: &DataProduct, _ctx: &StepContext) -> Option<String> {
        (!input.data.is_array()).then(|| "input carries no pixel array".to_string())
    }
}

struct AnnotateStep {
    key: String,
    value: Value,
}

impl AnnotateStep {
    fn from_params(params: &ParameterSet) -> Result<Self> {
        let key = params
            .get_str("key")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("annotate step requires 'key' parameter"))?
            .to_string();
        let value = params
            .get("value")
            .cloned()
            .unwrap_or(Value::String("true".to_string()));
        Ok(Self { key, value })
    }
}

impl Step for AnnotateStep {
    fn run(&self, input: &DataProduct, _ctx: &StepContext) -> Result<DataProduct> {
        let mut output = input.clone();
        output.set_meta(&self.key, self.value.clone());
        Ok(output)
    }
}

struct ClipStep {
    min: Option<f64>,
    max: Option<f64>,
}

impl ClipStep {
    fn from_params(params: &ParameterSet) -> Result<Self> {
        let min = params.get_f64("min");
        let max = params.get_f64("max");
        if let (Some(lo), Some(hi)) = (min, max)
            && lo > hi
        {
            bail!("clip min {lo} is greater than max {hi}");
        }
        Ok(Self { min, max })
    }
}

impl Step for ClipStep {
    fn run(&self, input: &DataProduct, _ctx: &StepContext) -> Result<DataProduct> {
        let mut output = input.clone();
        output.data = map_pixels(&input.data, &|pixel| {
            let pixel = self.min.map_or(pixel, |lo| pixel.max(lo));
            self.max.map_or(pixel, |hi| pixel.min(hi))
        })?;
        Ok(output)
    }
}

/// Apply `f` to every number in a (possibly nested) array payload.
fn map_pixels(data: &Value, f: &dyn Fn(f64) -> f64) -> Result<Value> {
    match data {
        Value::Array(items) => items
            .iter()
            .map(|item| map_pixels(item, f))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Number(num) => {
            let pixel = num
                .as_f64()
                .ok_or_else(|| anyhow!("pixel value {num} is not representable"))?;
            Ok(Value::from(f(pixel)))
        }
        Value::Null => Ok(Value::Null),
        other => bail!("expected numeric pixel data, found {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pixels_map_through_nested_arrays() {
        let data = json!([[1.0, 2.0], [3.0, null]]);
        let doubled = map_pixels(&data, &|p| p * 2.0).unwrap();
        assert_eq!(doubled, json!([[2.0, 4.0], [6.0, null]]));
        assert!(map_pixels(&json!(["x"]), &|p| p).is_err());
    }

    #[test]
    fn defaults_are_registered() {
        let mut registry = StepRegistry::new();
        register_defaults(&mut registry);
        assert_eq!(
            registry.known_steps(),
            vec!["annotate", "clip", "dark_current", "detector1", "flat_field", "pipeline"]
        );
        assert!(registry.load("flat").unwrap().references[0].reftype == "flat");
        assert!(registry.load("detector1").unwrap().is_pipeline());
    }
}
