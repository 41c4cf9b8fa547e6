//! Processor metadata: declared argument descriptors and submission validation.
//!
//! Every registered processor publishes a [`ProcessorMetadata`]. The engine
//! validates a submission against it before the record is persisted, so a
//! malformed submission never reaches `QUEUED`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::define_text_enum;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a service (processor) name.
const MAX_NAME_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

define_text_enum! {
    /// JSON type expected for a named argument.
    ArgKind {
        String => "string",
        Integer => "integer",
        Number => "number",
        Boolean => "boolean",
        List => "list",
        Object => "object",
        Any => "any",
    }
}

impl ArgKind {
    /// Whether `value` is acceptable for this kind.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Integer => value.is_i64() || value.is_u64(),
            ArgKind::Number => value.is_number(),
            ArgKind::Boolean => value.is_boolean(),
            ArgKind::List => value.is_array(),
            ArgKind::Object => value.is_object(),
            ArgKind::Any => true,
        }
    }
}

/// A named (dictionary) argument accepted by a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgDescriptor {
    pub name: String,
    pub kind: ArgKind,
    pub required: bool,
    pub description: String,
    /// Used in place of a missing required argument.
    pub default: Option<Value>,
}

impl ArgDescriptor {
    pub fn required(name: impl Into<String>, kind: ArgKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: description.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ArgKind, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Self-description of a processor, exposed through the management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorMetadata {
    pub name: String,
    pub description: String,
    pub args: Vec<ArgDescriptor>,
    /// Minimum number of positional arguments.
    pub min_positional_args: usize,
}

impl ProcessorMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: Vec::new(),
            min_positional_args: 0,
        }
    }

    pub fn with_arg(mut self, arg: ArgDescriptor) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_min_positional_args(mut self, count: usize) -> Self {
        self.min_positional_args = count;
        self
    }

    pub fn arg(&self, name: &str) -> Option<&ArgDescriptor> {
        self.args.iter().find(|a| a.name == name)
    }

    /// Validate a submission's arguments against the declared descriptors.
    ///
    /// Undeclared dictionary arguments are accepted and passed through. All
    /// problems are reported together in one `Validation` error.
    pub fn validate(&self, args: &[String], dictionary_args: &Map<String, Value>) -> Result<(), CoreError> {
        let mut problems = Vec::new();

        if args.len() < self.min_positional_args {
            problems.push(format!(
                "expected at least {} positional argument(s), got {}",
                self.min_positional_args,
                args.len()
            ));
        }

        for descriptor in &self.args {
            match dictionary_args.get(&descriptor.name) {
                Some(value) if !descriptor.kind.accepts(value) => problems.push(format!(
                    "argument '{}' must be of type {}",
                    descriptor.name, descriptor.kind
                )),
                Some(_) => {}
                None if descriptor.required && descriptor.default.is_none() => {
                    problems.push(format!("missing required argument '{}'", descriptor.name))
                }
                None => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "{}: {}",
                self.name,
                problems.join("; ")
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

/// Validate a service (processor) name.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_NAME_LEN` characters.
/// - Must contain only alphanumeric, hyphen, underscore, or dot characters.
pub fn validate_service_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation("Service name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Service name must not exceed {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(format!(
            "Service name '{name}' may only contain alphanumerics, '-', '_' or '.'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn metadata() -> ProcessorMetadata {
        ProcessorMetadata::new("stitch", "Stitch tiles")
            .with_arg(ArgDescriptor::required("input", ArgKind::String, "input dir"))
            .with_arg(ArgDescriptor::optional("threads", ArgKind::Integer, "thread count"))
            .with_arg(
                ArgDescriptor::required("mode", ArgKind::String, "mode").with_default(json!("fast")),
            )
            .with_min_positional_args(1)
    }

    fn dict(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    // -- validate ------------------------------------------------------------

    #[test]
    fn accepts_complete_arguments() {
        let args = vec!["a".to_string()];
        assert!(metadata()
            .validate(&args, &dict(json!({"input": "/data", "threads": 4})))
            .is_ok());
    }

    #[test]
    fn accepts_undeclared_arguments() {
        let args = vec!["a".to_string()];
        assert!(metadata()
            .validate(&args, &dict(json!({"input": "/data", "extra": [1, 2]})))
            .is_ok());
    }

    #[test]
    fn reports_missing_required_argument() {
        let args = vec!["a".to_string()];
        let err = metadata().validate(&args, &Map::new()).unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("missing required argument 'input'"));
    }

    #[test]
    fn reports_wrong_type_and_positional_count_together() {
        let err = metadata()
            .validate(&[], &dict(json!({"input": "/d", "threads": "four"})))
            .unwrap_err();
        let CoreError::Validation(msg) = err else {
            panic!("expected validation error");
        };
        assert!(msg.contains("positional"));
        assert!(msg.contains("'threads' must be of type integer"));
    }

    #[test]
    fn arg_kind_number_accepts_integers() {
        assert!(ArgKind::Number.accepts(&json!(3)));
        assert!(!ArgKind::Integer.accepts(&json!(3.5)));
    }

    // -- validate_service_name -----------------------------------------------

    #[test]
    fn service_name_rules() {
        assert!(validate_service_name("lsm.stitch-v2_x").is_ok());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("has space").is_err());
        assert!(validate_service_name(&"a".repeat(129)).is_err());
    }
}
