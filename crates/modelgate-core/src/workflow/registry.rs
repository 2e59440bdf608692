//! Runtime registry of pipelines and their step executors.

use std::collections::HashMap;
use std::sync::Arc;

use modelgate_types::pipeline::{PipelineDefinition, StepDefinition};

use super::definition::{DefinitionError, validate_definition};
use super::executor::BoxStepExecutor;

/// A validated definition paired with one executor per step.
#[derive(Debug)]
pub struct Pipeline {
    definition: PipelineDefinition,
    executors: Vec<Arc<BoxStepExecutor>>,
}

impl Pipeline {
    pub fn new(
        definition: PipelineDefinition,
        executors: Vec<BoxStepExecutor>,
    ) -> Result<Self, DefinitionError> {
        validate_definition(&definition)?;
        if executors.len() != definition.steps.len() {
            return Err(DefinitionError::ExecutorMismatch {
                pipeline: definition.name.clone(),
                steps: definition.steps.len(),
                executors: executors.len(),
            });
        }
        Ok(Self {
            definition,
            executors: executors.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Step definition and executor at `index`.
    pub fn step(&self, index: u32) -> Option<(&StepDefinition, Arc<BoxStepExecutor>)> {
        let step = self.definition.step(index)?;
        let executor = self.executors.get(index as usize)?.clone();
        Some((step, executor))
    }
}

#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline, replacing any previous one with the same name.
    pub fn register(&mut self, pipeline: Pipeline) -> Option<Arc<Pipeline>> {
        let name = pipeline.name().to_string();
        self.pipelines.insert(name, Arc::new(pipeline))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(name).cloned()
    }

    /// Registered pipelines, sorted by name.
    pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        let mut pipelines: Vec<Arc<Pipeline>> = self.pipelines.values().cloned().collect();
        pipelines.sort_by(|a, b| a.name().cmp(b.name()));
        pipelines
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
