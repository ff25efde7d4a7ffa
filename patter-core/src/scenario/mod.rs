//! Declarative dialog scenarios: wire format, expression language,
//! template substitution, pure step evaluation, and the action registry.

pub mod actions;
pub mod expr;
pub mod model;
pub mod processor;
pub mod template;

pub use actions::{ActionContext, ActionHandler, ActionRegistry};
pub use model::{
    FAULT_STEP, InputKind, InputSpec, NextRef, Scenario, ScenarioError, ScenarioGraph, Step,
};
pub use processor::{ActionInvocation, ProcessorError, StepResult, render_step, resolve_next};
