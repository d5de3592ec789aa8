//! Stage parameter schema: typed descriptors, positional binding, defaults,
//! validators and secret redaction (spec §4.4).
//!
//! Grounded on the teacher's `config::field`/`config::params` split, folded
//! into one module since this crate keeps a single config surface rather
//! than the teacher's duplicated `params.rs`/`extraction.rs` pair.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)key|secret|token|password").unwrap())
}

/// Whether a parameter name looks like it carries a credential, per the
/// shared redaction rule (spec §4.4).
pub fn looks_secret(name: &str) -> bool {
    secret_pattern().is_match(name)
}

/// Render a value for logs, redacting it if its field name looks secret.
pub fn redacted_display(name: &str, value: &Value) -> String {
    if looks_secret(name) {
        "<redacted>".to_string()
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        }
    }
}

type Validator = fn(&Value) -> Result<(), String>;

/// One parameter a stage type declares in its schema.
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    /// Position in the DSL's positional argument list, if it may be bound
    /// that way (spec §4.4 "positional binding").
    pub position: Option<usize>,
    pub validator: Option<Validator>,
}

impl ParamSpec {
    pub fn new(name: &'static str, kind: ParamType) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
            position: None,
            validator: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn positional(mut self, index: usize) -> Self {
        self.position = Some(index);
        self
    }

    pub fn validate_with(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn is_secret(&self) -> bool {
        looks_secret(self.name)
    }
}

/// The full declared schema for a stage type.
#[derive(Default)]
pub struct ParamSchema {
    pub specs: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new(specs: Vec<ParamSpec>) -> Self {
        Self { specs }
    }

    /// Bind named args and positional args against this schema, applying
    /// defaults and running validators. Named args win over positional
    /// ones for the same parameter.
    pub fn bind(
        &self,
        named: &HashMap<String, Value>,
        positional: &[Value],
    ) -> Result<HashMap<String, Value>, ParamError> {
        let mut bound = HashMap::new();

        for spec in &self.specs {
            let mut value = named.get(spec.name).cloned();
            if value.is_none() {
                if let Some(pos) = spec.position {
                    value = positional.get(pos).cloned();
                }
            }
            let value = match value.or_else(|| spec.default.clone()) {
                Some(v) => v,
                None if spec.required => {
                    return Err(ParamError::Missing(spec.name.to_string()));
                }
                None => continue,
            };

            if !spec.kind.matches(&value) {
                return Err(ParamError::WrongType {
                    name: spec.name.to_string(),
                    expected: spec.kind.name(),
                    got: value.clone(),
                });
            }

            if let Some(validator) = spec.validator {
                validator(&value).map_err(|reason| ParamError::Invalid {
                    name: spec.name.to_string(),
                    reason,
                })?;
            }

            bound.insert(spec.name.to_string(), value);
        }

        // Surface unknown named args early rather than silently dropping
        // typos in a pipeline expression.
        for key in named.keys() {
            if !self.specs.iter().any(|s| s.name == key) {
                return Err(ParamError::Unknown(key.clone()));
            }
        }

        Ok(bound)
    }
}

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("missing required parameter '{0}'")]
    Missing(String),
    #[error("parameter '{name}' expected {expected}, got {got}")]
    WrongType {
        name: String,
        expected: &'static str,
        got: Value,
    },
    #[error("parameter '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },
    #[error("unknown parameter '{0}'")]
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParamSchema {
        ParamSchema::new(vec![
            ParamSpec::new("path", ParamType::String).required().positional(0),
            ParamSpec::new("threshold", ParamType::Number).default(json!(0.5)),
            ParamSpec::new("api_key", ParamType::String),
        ])
    }

    #[test]
    fn binds_positional_and_applies_defaults() {
        let bound = schema()
            .bind(&HashMap::new(), &[json!("in.wav")])
            .unwrap();
        assert_eq!(bound["path"], json!("in.wav"));
        assert_eq!(bound["threshold"], json!(0.5));
    }

    #[test]
    fn named_overrides_positional_and_default() {
        let mut named = HashMap::new();
        named.insert("threshold".to_string(), json!(0.9));
        let bound = schema().bind(&named, &[json!("in.wav")]).unwrap();
        assert_eq!(bound["threshold"], json!(0.9));
    }

    #[test]
    fn missing_required_errors() {
        let err = schema().bind(&HashMap::new(), &[]).unwrap_err();
        assert!(matches!(err, ParamError::Missing(name) if name == "path"));
    }

    #[test]
    fn wrong_type_errors() {
        let mut named = HashMap::new();
        named.insert("path".to_string(), json!(42));
        let err = schema().bind(&named, &[]).unwrap_err();
        assert!(matches!(err, ParamError::WrongType { .. }));
    }

    #[test]
    fn unknown_named_arg_errors() {
        let mut named = HashMap::new();
        named.insert("path".to_string(), json!("x"));
        named.insert("bogus".to_string(), json!(1));
        let err = schema().bind(&named, &[]).unwrap_err();
        assert!(matches!(err, ParamError::Unknown(name) if name == "bogus"));
    }

    #[test]
    fn secret_fields_are_redacted() {
        assert!(looks_secret("api_key"));
        assert!(looks_secret("Password"));
        assert!(!looks_secret("path"));
        assert_eq!(redacted_display("api_key", &json!("sk-xyz")), "<redacted>");
        assert_eq!(redacted_display("path", &json!("in.wav")), "\"in.wav\"");
    }
}
