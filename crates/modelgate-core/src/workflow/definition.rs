//! Pipeline definition parsing, validation, and discovery.
//!
//! Pipelines are YAML files under `{data_dir}/pipelines/`. Parsing always
//! validates, so any `PipelineDefinition` returned from here is
//! structurally sound.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use modelgate_types::pipeline::PipelineDefinition;
use thiserror::Error;

/// Errors that can occur while loading pipelines.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline '{pipeline}' has {steps} steps but {executors} executors")]
    ExecutorMismatch {
        pipeline: String,
        steps: usize,
        executors: usize,
    },
}

/// Parse a YAML string into a validated `PipelineDefinition`.
pub fn parse_pipeline_yaml(yaml: &str) -> Result<PipelineDefinition, DefinitionError> {
    let def: PipelineDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Validate structural constraints on a `PipelineDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, hyphens and underscores
/// - At least one step exists
/// - Step names are non-empty and unique
/// - Step timeouts, when set, are positive
pub fn validate_definition(def: &PipelineDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(DefinitionError::Validation(
            "pipeline name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::Validation(format!(
            "pipeline name '{}' contains invalid characters (only alphanumerics, hyphens and underscores allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::Validation(
            "pipeline must have at least one step".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if step.name.is_empty() {
            return Err(DefinitionError::Validation(
                "step name must not be empty".to_string(),
            ));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate step name: '{}'",
                step.name
            )));
        }
        if step.timeout_secs == Some(0) {
            return Err(DefinitionError::Validation(format!(
                "step '{}' has a zero timeout",
                step.name
            )));
        }
    }

    Ok(())
}

/// Load a pipeline definition from a YAML file.
pub fn load_pipeline_file(path: &Path) -> Result<PipelineDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline_yaml(&content)
}

/// Discover all pipeline YAML files under `base_dir`, recursively.
///
/// Files that fail to parse or validate are logged and skipped.
pub fn discover_pipelines(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, PipelineDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.1.name.cmp(&b.1.name));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, PipelineDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_pipeline_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(err) => {
                    tracing::warn!(?path, error = %err, "skipping invalid pipeline file");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const T2V: &str = r#"
name: text-to-video
description: generate then upscale
steps:
  - name: generate
    model: gen-x
    provider: acme
    executor:
      type: http
      url: http://localhost:9000/generate
  - name: upscale
    model: upscaler
    timeout_secs: 600
    executor:
      type: http
      url: http://localhost:9000/upscale
      method: PUT
      headers:
        x-tenant: demo
"#;

    #[test]
    fn parses_valid_pipeline() {
        let def = parse_pipeline_yaml(T2V).unwrap();
        assert_eq!(def.name, "text-to-video");
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].timeout_secs, Some(600));
        assert_eq!(def.required_models(), vec!["gen-x", "upscaler"]);
    }

    #[test]
    fn rejects_bad_name() {
        let yaml = T2V.replace("name: text-to-video", "name: \"text to video\"");
        let err = parse_pipeline_yaml(&yaml).unwrap_err();
        assert!(matches!(err, DefinitionError::Validation(_)));
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let yaml = T2V.replace("name: upscale", "name: generate");
        let err = parse_pipeline_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step name"));
    }

    #[test]
    fn rejects_empty_steps() {
        let err = parse_pipeline_yaml("name: empty\nsteps: []\n").unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn rejects_unknown_executor_type() {
        let yaml = T2V.replace("type: http", "type: grpc");
        assert!(matches!(
            parse_pipeline_yaml(&yaml).unwrap_err(),
            DefinitionError::Parse(_)
        ));
    }

    #[test]
    fn discovers_recursively_and_skips_invalid() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("video");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("t2v.yaml"), T2V).unwrap();
        std::fs::write(tmp.path().join("broken.yml"), "name: [").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_pipelines(tmp.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.name, "text-to-video");
    }

    #[test]
    fn missing_directory_is_empty() {
        let tmp = TempDir::new().unwrap();
        let found = discover_pipelines(&tmp.path().join("nope")).unwrap();
        assert!(found.is_empty());
    }
}
