//! Shared fixtures for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use modelgate_types::job::{Job, JobKind};
use modelgate_types::pipeline::{ExecutorConfig, PipelineDefinition, StepDefinition};
use serde_json::{Value, json};

use crate::workflow::executor::{BoxStepExecutor, StepContext, StepError, StepExecutor};
use crate::workflow::registry::{Pipeline, PipelineRegistry};

pub fn http_step(name: &str, model: Option<&str>) -> StepDefinition {
    StepDefinition {
        name: name.to_string(),
        model: model.map(str::to_string),
        provider: None,
        timeout_secs: None,
        executor: ExecutorConfig::Http {
            url: format!("http://localhost/{name}"),
            method: "POST".to_string(),
            headers: HashMap::new(),
        },
    }
}

pub enum Script {
    Return(Result<Value, StepError>),
    Panic(&'static str),
    /// Block until the step is cancelled (or timed out by the runner).
    Hang,
}

/// Step executor that plays back a script, then echoes.
///
/// Clones share call counters and the script, so a test can keep a handle
/// after handing the executor to a pipeline.
#[derive(Clone, Default)]
pub struct ScriptedStep {
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<Value>>>,
    script: Arc<Mutex<VecDeque<Script>>>,
}

impl ScriptedStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, script: Script) -> Self {
        self.script.lock().unwrap().push_back(script);
        self
    }

    pub fn then_err(self, err: StepError) -> Self {
        self.then(Script::Return(Err(err)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap().clone()
    }
}

impl StepExecutor for ScriptedStep {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(ctx.input.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Return(result)) => result,
            Some(Script::Panic(msg)) => panic!("{msg}"),
            Some(Script::Hang) => {
                ctx.cancel.cancelled().await;
                Err(StepError::Other("cancelled".to_string()))
            }
            None => Ok(json!({ "step": ctx.step_name, "input": ctx.input })),
        }
    }
}

pub fn pipeline(name: &str, steps: Vec<(StepDefinition, ScriptedStep)>) -> Pipeline {
    let (definitions, executors): (Vec<_>, Vec<_>) = steps
        .into_iter()
        .map(|(def, step)| (def, BoxStepExecutor::new(step)))
        .unzip();
    Pipeline::new(
        PipelineDefinition {
            name: name.to_string(),
            description: None,
            steps: definitions,
        },
        executors,
    )
    .unwrap()
}

pub fn registry(pipelines: Vec<Pipeline>) -> Arc<PipelineRegistry> {
    let mut registry = PipelineRegistry::new();
    for pipeline in pipelines {
        registry.register(pipeline);
    }
    Arc::new(registry)
}

pub fn job_for(pipeline: &Pipeline, input: Value) -> Job {
    let def = pipeline.definition();
    let kind = if def.steps.len() == 1 {
        JobKind::Simple
    } else {
        JobKind::Workflow
    };
    Job::new(kind, def.name.clone(), def.required_models(), input)
}
