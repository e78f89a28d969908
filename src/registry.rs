use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::error::StepLoadError;
use crate::params::ParameterSet;
use crate::step::{Step, StepClass};

/// Explicit table of loadable step classes.
///
/// Classes are found by registered name, alias or qualified path.
#[derive(Debug, Default, Clone)]
pub struct StepRegistry {
    classes: HashMap<String, Arc<StepClass>>,
    lookup: HashMap<String, String>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: StepClass) {
        let name = class.name.clone();
        for key in [class.alias.clone(), class.path.clone()] {
            if key != name {
                self.lookup.insert(key, name.clone());
            }
        }
        self.classes.insert(name, Arc::new(class));
    }

    /// Register an atomic step with no declared parameters beyond the common
    /// ones.
    pub fn register_step<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ParameterSet) -> Result<Box<dyn Step>> + Send + Sync + 'static,
    {
        self.register(StepClass::step(name, factory));
    }

    pub fn load(&self, identifier: &str) -> Result<Arc<StepClass>, StepLoadError> {
        let identifier = identifier.trim();
        self.classes
            .get(identifier)
            .or_else(|| {
                self.lookup
                    .get(identifier)
                    .and_then(|name| self.classes.get(name))
            })
            .cloned()
            .ok_or_else(|| StepLoadError::Unknown {
                identifier: identifier.to_string(),
                available: self.known_steps().join(", "),
            })
    }

    pub fn known_steps(&self) -> Vec<String> {
        let mut names: Vec<_> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered classes sorted by name.
    pub fn classes(&self) -> Vec<Arc<StepClass>> {
        let mut classes: Vec<_> = self.classes.values().cloned().collect();
        classes.sort_by(|a, b| a.name.cmp(&b.name));
        classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataProduct;
    use crate::step::StepContext;

    struct Echo;

    impl Step for Echo {
        fn run(&self, input: &DataProduct, _ctx: &StepContext) -> Result<DataProduct> {
            Ok(input.clone())
        }
    }

    #[test]
    fn loads_by_name_alias_and_path() {
        let mut registry = StepRegistry::new();
        registry.register(
            StepClass::step("flat_field", |_| Ok(Box::new(Echo) as Box<dyn Step>))
                .alias("flat")
                .path("calpipe.steps.FlatFieldStep"),
        );
        assert_eq!(registry.load("flat_field").unwrap().name, "flat_field");
        assert_eq!(registry.load("flat").unwrap().name, "flat_field");
        assert_eq!(
            registry.load("calpipe.steps.FlatFieldStep").unwrap().name,
            "flat_field"
        );
    }

    #[test]
    fn unknown_identifier_lists_available_steps() {
        let mut registry = StepRegistry::new();
        registry.register_step("b", |_| Ok(Box::new(Echo) as Box<dyn Step>));
        registry.register_step("a", |_| Ok(Box::new(Echo) as Box<dyn Step>));
        let err = registry.load("nope").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown step 'nope'. Available steps: a, b"
        );
    }
}
