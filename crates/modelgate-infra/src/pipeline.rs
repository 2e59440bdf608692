//! Builds the runtime pipeline registry from YAML files on disk.

use std::path::{Path, PathBuf};

use modelgate_core::workflow::definition::{DefinitionError, discover_pipelines};
use modelgate_core::workflow::executor::BoxStepExecutor;
use modelgate_core::workflow::registry::{Pipeline, PipelineRegistry};
use modelgate_types::pipeline::PipelineDefinition;
use reqwest::Client;
use thiserror::Error;

use crate::executor::{HttpExecutorError, HttpStepExecutor};

#[derive(Debug, Error)]
pub enum PipelineLoadError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("pipeline '{pipeline}' step '{step}': {source}")]
    Executor {
        pipeline: String,
        step: String,
        #[source]
        source: HttpExecutorError,
    },

    #[error(transparent)]
    Client(HttpExecutorError),
}

/// Pipeline directory inside the data directory.
pub fn pipelines_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("pipelines")
}

/// Discover `{data_dir}/pipelines/**/*.yaml` and build executors for every
/// step.
pub fn load_registry(data_dir: &Path) -> Result<PipelineRegistry, PipelineLoadError> {
    let client = HttpStepExecutor::default_client().map_err(PipelineLoadError::Client)?;
    let discovered = discover_pipelines(&pipelines_dir(data_dir))?;
    build_registry(discovered, &client)
}

/// Build a registry from already-parsed definitions. On duplicate names the
/// first definition wins.
pub fn build_registry(
    definitions: Vec<(PathBuf, PipelineDefinition)>,
    client: &Client,
) -> Result<PipelineRegistry, PipelineLoadError> {
    let mut registry = PipelineRegistry::new();
    for (path, definition) in definitions {
        if registry.get(&definition.name).is_some() {
            tracing::warn!(?path, pipeline = %definition.name, "duplicate pipeline name, ignoring file");
            continue;
        }

        let mut executors = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            let executor = HttpStepExecutor::from_config(client.clone(), &step.executor).map_err(
                |source| PipelineLoadError::Executor {
                    pipeline: definition.name.clone(),
                    step: step.name.clone(),
                    source,
                },
            )?;
            executors.push(BoxStepExecutor::new(executor));
        }

        tracing::debug!(?path, pipeline = %definition.name, steps = executors.len(), "pipeline loaded");
        registry.register(Pipeline::new(definition, executors)?);
    }
    Ok(registry)
}
