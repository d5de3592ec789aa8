//! The pipeline expression DSL (spec §6, SPEC_FULL §2.3): parses `-e`
//! inline expressions, `-f` expression files, and `-c <id>@<file>` YAML
//! documents (a map of named expressions in the same grammar) into a
//! [`crate::core::runtime::GraphSpec`].

pub mod lexer;
pub mod parser;

use std::collections::HashMap;

use thiserror::Error;

use crate::core::runtime::GraphSpec;
pub use parser::{parse_pipeline, ParseError, VarResolver};

#[derive(Debug, Error)]
pub enum DslError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("YAML pipeline document is malformed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("pipeline id '{0}' not found in YAML document")]
    UnknownPipelineId(String),
}

/// Parse a YAML document of named pipeline expressions (`-c` flag) and
/// select `id`.
pub fn parse_yaml_pipeline(
    yaml: &str,
    id: &str,
    argv: &[String],
    env: &HashMap<String, String>,
) -> Result<GraphSpec, DslError> {
    let document: HashMap<String, String> = serde_yaml::from_str(yaml)?;
    let expr = document
        .get(id)
        .ok_or_else(|| DslError::UnknownPipelineId(id.to_string()))?;
    Ok(parse_pipeline(expr, argv, env)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_named_pipeline_from_yaml_document() {
        let yaml = "main: \"file() | vad()\"\nalt: \"file() | sentence()\"\n";
        let graph = parse_yaml_pipeline(yaml, "alt", &[], &HashMap::new()).unwrap();
        assert_eq!(graph.nodes[1].type_name, "sentence");
    }

    #[test]
    fn unknown_pipeline_id_errors() {
        let yaml = "main: \"file()\"\n";
        let err = parse_yaml_pipeline(yaml, "missing", &[], &HashMap::new()).unwrap_err();
        assert!(matches!(err, DslError::UnknownPipelineId(id) if id == "missing"));
    }
}
