//! Scenario graph wire format and load-time compilation.
//!
//! The JSON wire format is a stable data contract; parsing and serializing
//! must round-trip faithfully. Compilation parses every condition expression
//! and input pattern up front, so a malformed scenario is rejected when it
//! is loaded rather than mid-conversation.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::expr::Expr;
use crate::types::{Button, MediaRef};

/// Sentinel step id marking a conversation that hit a fatal error. Only
/// `/reset` escapes it.
pub const FAULT_STEP: &str = "fault";

fn default_wire_version() -> String {
    "1.0".to_string()
}

/// The scenario graph exactly as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioGraph {
    #[serde(default = "default_wire_version")]
    pub version: String,
    pub start_step: String,
    #[serde(default)]
    pub variables: HashMap<String, VarMeta>,
    pub steps: HashMap<String, Step>,
    /// Rendered by `/help`; a built-in default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    /// When set, any inbound message materializes a dialog as if the user
    /// had sent `/start`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VarMeta {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub var_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Message(MessageStep),
    ConditionalMessage(ConditionalMessageStep),
    Action(ActionStep),
}

impl Step {
    pub fn expected_input(&self) -> Option<&InputSpec> {
        match self {
            Self::Message(s) => s.expected_input.as_ref(),
            Self::ConditionalMessage(s) => s.expected_input.as_ref(),
            Self::Action(_) => None,
        }
    }

    pub fn buttons(&self) -> &[Button] {
        match self {
            Self::Message(s) => &s.buttons,
            Self::ConditionalMessage(s) => &s.buttons,
            Self::Action(_) => &[],
        }
    }

    pub fn next_ref(&self) -> Option<&NextRef> {
        match self {
            Self::Message(s) => s.next_step.as_ref(),
            Self::ConditionalMessage(s) => s.next_step.as_ref(),
            Self::Action(s) => s.next_step.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageBody {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageStep {
    pub message: MessageBody,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_input: Option<InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<NextRef>,
}

/// Like a message step, but the content is picked by the first matching
/// condition; `message`/`media` act as the fallback variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionalMessageStep {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<MessageVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageBody>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_input: Option<InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<NextRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageVariant {
    #[serde(rename = "if")]
    pub condition: String,
    pub message: MessageBody,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStep {
    pub action: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<NextRef>,
}

/// Either a literal step id or a conditional dispatch list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NextRef {
    Step(String),
    Conditional {
        #[serde(default)]
        conditions: Vec<CondNext>,
        #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
        fallback: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CondNext {
    #[serde(rename = "if")]
    pub condition: String,
    pub then: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Text,
    Button,
    Number,
    Date,
    Email,
    Phone,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSpec {
    #[serde(rename = "type")]
    pub kind: InputKind,
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ── Compiled form ───────────────────────────────────────────────────────

/// Where a step goes next, with conditions parsed.
#[derive(Debug, Clone)]
pub(crate) enum CompiledNext {
    End,
    Step(String),
    Conditional {
        conditions: Vec<(Expr, String)>,
        fallback: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledStep {
    /// Parsed variant conditions, parallel to the step's `variants`.
    pub variants: Vec<Expr>,
    pub next: CompiledNext,
    /// Compiled `expected_input.pattern`, when declared.
    pub pattern: Option<Regex>,
}

/// A scenario loaded from the store and compiled for execution. Immutable;
/// a new scenario version is a new `Scenario`.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    pub bot_id: String,
    pub version: i64,
    pub graph: ScenarioGraph,
    compiled: HashMap<String, CompiledStep>,
}

/// Load-time scenario rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioError {
    Parse(String),
    UnknownStartStep(String),
    UnknownNextStep { step: String, target: String },
    UndeclaredVariable { step: String, variable: String },
    MissingButtons { step: String },
    BadCondition { step: String, detail: String },
    BadPattern { step: String, detail: String },
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "invalid scenario JSON: {msg}"),
            Self::UnknownStartStep(s) => write!(f, "start step '{s}' does not exist"),
            Self::UnknownNextStep { step, target } => {
                write!(f, "step '{step}' points to unknown step '{target}'")
            }
            Self::UndeclaredVariable { step, variable } => {
                write!(f, "step '{step}' collects undeclared variable '{variable}'")
            }
            Self::MissingButtons { step } => {
                write!(f, "step '{step}' expects button input but declares no buttons")
            }
            Self::BadCondition { step, detail } => {
                write!(f, "step '{step}' has a malformed condition: {detail}")
            }
            Self::BadPattern { step, detail } => {
                write!(f, "step '{step}' has an invalid pattern: {detail}")
            }
        }
    }
}

impl std::error::Error for ScenarioError {}

impl Scenario {
    /// Parse scenario JSON and compile it.
    pub fn from_json(
        id: &str,
        bot_id: &str,
        version: i64,
        json: &str,
    ) -> Result<Self, ScenarioError> {
        let graph: ScenarioGraph =
            serde_json::from_str(json).map_err(|e| ScenarioError::Parse(e.to_string()))?;
        Self::from_graph(id, bot_id, version, graph)
    }

    /// Validate a parsed graph and compile its expressions and patterns.
    pub fn from_graph(
        id: &str,
        bot_id: &str,
        version: i64,
        graph: ScenarioGraph,
    ) -> Result<Self, ScenarioError> {
        if !graph.steps.contains_key(&graph.start_step) {
            return Err(ScenarioError::UnknownStartStep(graph.start_step.clone()));
        }

        let mut compiled = HashMap::new();
        for (step_id, step) in &graph.steps {
            compiled.insert(step_id.clone(), compile_step(&graph, step_id, step)?);
        }

        Ok(Self {
            id: id.to_string(),
            bot_id: bot_id.to_string(),
            version,
            graph,
            compiled,
        })
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.graph.steps.get(step_id)
    }

    pub fn has_step(&self, step_id: &str) -> bool {
        self.graph.steps.contains_key(step_id)
    }

    pub fn help_text(&self) -> Option<&str> {
        self.graph.help.as_deref()
    }

    /// Compiled `pattern` regex of the step's expected input, if any.
    pub fn input_pattern(&self, step_id: &str) -> Option<&Regex> {
        self.compiled.get(step_id)?.pattern.as_ref()
    }

    pub(crate) fn compiled_step(&self, step_id: &str) -> Option<&CompiledStep> {
        self.compiled.get(step_id)
    }
}

fn compile_step(
    graph: &ScenarioGraph,
    step_id: &str,
    step: &Step,
) -> Result<CompiledStep, ScenarioError> {
    // Parse variant conditions (conditional_message only).
    let mut variants = Vec::new();
    if let Step::ConditionalMessage(s) = step {
        for variant in &s.variants {
            let expr = Expr::parse(&variant.condition).map_err(|e| ScenarioError::BadCondition {
                step: step_id.to_string(),
                detail: e.to_string(),
            })?;
            variants.push(expr);
        }
    }

    // Compile next-step resolution.
    let next = match step.next_ref() {
        None => CompiledNext::End,
        Some(NextRef::Step(target)) => {
            require_step(graph, step_id, target)?;
            CompiledNext::Step(target.clone())
        }
        Some(NextRef::Conditional { conditions, fallback }) => {
            let mut compiled_conditions = Vec::new();
            for cond in conditions {
                require_step(graph, step_id, &cond.then)?;
                let expr = Expr::parse(&cond.condition).map_err(|e| ScenarioError::BadCondition {
                    step: step_id.to_string(),
                    detail: e.to_string(),
                })?;
                compiled_conditions.push((expr, cond.then.clone()));
            }
            if let Some(target) = fallback {
                require_step(graph, step_id, target)?;
            }
            CompiledNext::Conditional {
                conditions: compiled_conditions,
                fallback: fallback.clone(),
            }
        }
    };

    // Validate and compile expected input.
    let mut pattern = None;
    if let Some(spec) = step.expected_input() {
        if !graph.variables.contains_key(&spec.variable) {
            return Err(ScenarioError::UndeclaredVariable {
                step: step_id.to_string(),
                variable: spec.variable.clone(),
            });
        }
        if spec.kind == InputKind::Button && step.buttons().is_empty() {
            return Err(ScenarioError::MissingButtons {
                step: step_id.to_string(),
            });
        }
        if let Some(raw) = &spec.pattern {
            pattern = Some(Regex::new(raw).map_err(|e| ScenarioError::BadPattern {
                step: step_id.to_string(),
                detail: e.to_string(),
            })?);
        }
    }

    Ok(CompiledStep {
        variants,
        next,
        pattern,
    })
}

fn require_step(graph: &ScenarioGraph, step_id: &str, target: &str) -> Result<(), ScenarioError> {
    if graph.steps.contains_key(target) {
        Ok(())
    } else {
        Err(ScenarioError::UnknownNextStep {
            step: step_id.to_string(),
            target: target.to_string(),
        })
    }
}
