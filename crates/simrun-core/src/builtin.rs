//! Built-in `step-simulation` computation.
//!
//! Iterates the logistic map `x' = rate * x * (1 - x)` for a number of
//! steps. Deterministic, cheap and checkpointable, which makes it useful for
//! exercising orchestration end to end.
//!
//! Parameters (model source JSON provides defaults, configuration overrides):
//! `steps`, `rate`, `initial`, `step_millis`, `checkpoint_every`, `fail_at_step`.

use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::computation::{ComputationError, ComputationHandle, RunContext, SetupRequest, SetupStrategy};
use crate::DEFAULT_SETUP_STRATEGY;

/// Setup strategy producing [`StepSimulation`] handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepSimulationSetup;

impl SetupStrategy for StepSimulationSetup {
    fn name(&self) -> &str {
        DEFAULT_SETUP_STRATEGY
    }

    fn setup(&self, request: SetupRequest<'_>) -> Result<Box<dyn ComputationHandle>, ComputationError> {
        let mut params: Map<String, Value> = if request.model.source.trim().is_empty() {
            Map::new()
        } else {
            match serde_json::from_str::<Value>(&request.model.source) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(ComputationError::Setup(format!(
                        "model '{}' is not a JSON object",
                        request.model.reference
                    )))
                }
                Err(e) => {
                    return Err(ComputationError::Setup(format!(
                        "model '{}' is not valid JSON: {}",
                        request.model.reference, e
                    )))
                }
            }
        };
        for (name, value) in &request.config.parameters {
            params.insert(name.clone(), value.clone());
        }

        let mut sim = StepSimulation {
            steps: read_u64(&params, "steps")?.unwrap_or(10),
            rate: read_f64(&params, "rate")?.unwrap_or(3.7),
            value: read_f64(&params, "initial")?.unwrap_or(0.5),
            step: 0,
            step_delay: Duration::from_millis(read_u64(&params, "step_millis")?.unwrap_or(0)),
            checkpoint_every: read_u64(&params, "checkpoint_every")?.unwrap_or(0),
            fail_at_step: read_u64(&params, "fail_at_step")?,
        };

        if !(0.0..=1.0).contains(&sim.value) {
            return Err(ComputationError::Setup(format!(
                "initial value {} outside [0, 1]",
                sim.value
            )));
        }

        if let Some(checkpoint) = request.resume {
            sim.step = checkpoint.step;
            sim.value = checkpoint
                .state
                .get("value")
                .and_then(Value::as_f64)
                .ok_or_else(|| ComputationError::Setup("checkpoint lacks 'value'".to_string()))?;
            debug!(task_id = %request.task_id, step = sim.step, "Resuming step simulation from checkpoint");
        }

        Ok(Box::new(sim))
    }
}

/// Running state of a step simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSimulation {
    steps: u64,
    rate: f64,
    value: f64,
    step: u64,
    step_delay: Duration,
    checkpoint_every: u64,
    fail_at_step: Option<u64>,
}

impl StepSimulation {
    /// Current value of the iterated map.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Steps completed so far.
    pub fn step(&self) -> u64 {
        self.step
    }
}

impl ComputationHandle for StepSimulation {
    fn run(&mut self, ctx: &RunContext) -> Result<(), ComputationError> {
        while self.step < self.steps {
            if ctx.is_stop_requested() {
                return Err(ComputationError::Stopped);
            }
            if self.fail_at_step == Some(self.step) {
                return Err(ComputationError::Execution(format!(
                    "injected failure at step {}",
                    self.step
                )));
            }

            self.value = self.rate * self.value * (1.0 - self.value);
            self.step += 1;

            ctx.publish("step", json!(self.step));
            ctx.publish("value", json!(self.value));

            if self.checkpoint_every > 0 && self.step % self.checkpoint_every == 0 {
                ctx.checkpoint(self.step, json!({ "value": self.value }));
            }
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
        }
        Ok(())
    }
}

fn read_u64(params: &Map<String, Value>, name: &str) -> Result<Option<u64>, ComputationError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ComputationError::Setup(format!("parameter '{}' must be a non-negative integer", name))),
    }
}

fn read_f64(params: &Map<String, Value>, name: &str) -> Result<Option<f64>, ComputationError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| ComputationError::Setup(format!("parameter '{}' must be a number", name))),
    }
}
