//! Processor registry: maps a service name to its processor.
//!
//! Built once at startup with [`ProcessorRegistry::builder`]; lookups are
//! plain `HashMap` reads afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use pipewright_core::error::CoreError;
use pipewright_core::metadata::{validate_service_name, ProcessorMetadata};
use pipewright_db::models::service::NewService;
use serde_json::Value;

use crate::computation::Computation;
use crate::context::ProcessingContext;

/// A handler for one kind of service.
pub trait ServiceProcessor: Send + Sync + 'static {
    /// Name, description and argument descriptors. The name is the key the
    /// processor is registered under.
    fn metadata(&self) -> ProcessorMetadata;

    /// Build the computation that processes `ctx.record`. The result is
    /// stored on the record when it succeeds.
    fn process(&self, ctx: ProcessingContext) -> Computation<Value>;
}

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn ServiceProcessor>>,
}

impl ProcessorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceProcessor>> {
        self.processors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    /// Metadata of every registered processor, sorted by name.
    pub fn all_metadata(&self) -> Vec<ProcessorMetadata> {
        let mut all: Vec<ProcessorMetadata> =
            self.processors.values().map(|p| p.metadata()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn metadata(&self, name: &str) -> Option<ProcessorMetadata> {
        self.processors.get(name).map(|p| p.metadata())
    }

    /// Reject a submission with an unknown name or arguments that do not
    /// match the processor's descriptors.
    pub fn validate(&self, service: &NewService) -> Result<(), CoreError> {
        validate_service_name(&service.name)?;
        let processor = self.processors.get(&service.name).ok_or_else(|| {
            CoreError::Validation(format!("No processor registered for '{}'", service.name))
        })?;
        processor
            .metadata()
            .validate(&service.args, &service.dictionary_args)
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    processors: HashMap<String, Arc<dyn ServiceProcessor>>,
}

impl RegistryBuilder {
    pub fn register(self, processor: impl ServiceProcessor) -> Self {
        self.register_arc(Arc::new(processor))
    }

    /// Register a shared processor. A later registration under the same name
    /// replaces the earlier one.
    pub fn register_arc(mut self, processor: Arc<dyn ServiceProcessor>) -> Self {
        let name = processor.metadata().name;
        if self.processors.insert(name.clone(), processor).is_some() {
            tracing::warn!(processor = %name, "Processor registered twice, keeping the last");
        }
        self
    }

    pub fn build(self) -> ProcessorRegistry {
        ProcessorRegistry {
            processors: self.processors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pipewright_core::metadata::{ArgDescriptor, ArgKind};
    use serde_json::json;

    struct Named(&'static str);

    impl ServiceProcessor for Named {
        fn metadata(&self) -> ProcessorMetadata {
            ProcessorMetadata::new(self.0, "test processor")
                .with_arg(ArgDescriptor::required("count", ArgKind::Integer, "how many"))
                .with_min_positional_args(1)
        }

        fn process(&self, _ctx: ProcessingContext) -> Computation<Value> {
            Computation::completed(Value::Null)
        }
    }

    fn registry() -> ProcessorRegistry {
        ProcessorRegistry::builder()
            .register(Named("zeta"))
            .register(Named("alpha"))
            .build()
    }

    #[test]
    fn metadata_is_sorted_by_name() {
        let names: Vec<String> = registry().all_metadata().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(registry().metadata("missing").is_none());
    }

    #[test]
    fn unknown_name_is_a_validation_error() {
        let err = registry().validate(&NewService::new("nope")).unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("nope"));
    }

    #[test]
    fn arguments_are_checked_against_descriptors() {
        let registry = registry();
        let bad = NewService::new("alpha").with_dictionary_arg("count", json!("three"));
        assert_matches!(registry.validate(&bad), Err(CoreError::Validation(_)));

        let good = NewService::new("alpha")
            .with_args(["input.tif"])
            .with_dictionary_arg("count", json!(3));
        assert!(registry.validate(&good).is_ok());
    }
}
