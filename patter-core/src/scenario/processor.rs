//! Pure step evaluation.
//!
//! The processor never touches I/O: it renders a step's content against the
//! collected data, resolves where the conversation goes next, and surfaces
//! action invocations for the dialog manager to execute. Condition failures
//! at runtime evaluate to `false` and are logged; structural problems
//! (unknown step ids) are fatal and surface as `ProcessorError`.

use serde_json::{Map, Value};

use super::expr::EvalError;
use super::model::{CompiledNext, ConditionalMessageStep, Scenario, Step};
use super::template;
use crate::types::OutgoingMessage;

/// Result of entering a step.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    /// Rendered content, absent for action steps.
    pub message: Option<OutgoingMessage>,
    /// Input expected before the conversation can move on. Cloned from the
    /// step so the validator can score the next inbound event.
    pub expects: Option<super::model::InputSpec>,
    /// Action to invoke, for action steps.
    pub action: Option<ActionInvocation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionInvocation {
    pub name: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorError {
    UnknownStep(String),
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownStep(id) => write!(f, "unknown step '{id}'"),
        }
    }
}

impl std::error::Error for ProcessorError {}

/// Render the content of `step_id` against `data`.
pub fn render_step(
    scenario: &Scenario,
    step_id: &str,
    data: &Map<String, Value>,
) -> Result<StepResult, ProcessorError> {
    let step = scenario
        .step(step_id)
        .ok_or_else(|| ProcessorError::UnknownStep(step_id.to_string()))?;

    let result = match step {
        Step::Message(s) => StepResult {
            message: Some(render_message(scenario, &s.message.text, &s.media, &s.buttons, data)),
            expects: s.expected_input.clone(),
            action: None,
        },
        Step::ConditionalMessage(s) => StepResult {
            message: render_conditional(scenario, step_id, s, data),
            expects: s.expected_input.clone(),
            action: None,
        },
        Step::Action(s) => StepResult {
            message: None,
            expects: None,
            action: Some(ActionInvocation {
                name: s.action.clone(),
                params: s.params.clone(),
            }),
        },
    };

    Ok(result)
}

fn render_message(
    scenario: &Scenario,
    text: &str,
    media: &[crate::types::MediaRef],
    buttons: &[crate::types::Button],
    data: &Map<String, Value>,
) -> OutgoingMessage {
    let variables = &scenario.graph.variables;
    OutgoingMessage {
        text: template::render(text, variables, data),
        buttons: buttons
            .iter()
            .map(|b| crate::types::Button {
                text: template::render(&b.text, variables, data),
                value: b.value.clone(),
            })
            .collect(),
        media: media.to_vec(),
    }
}

fn render_conditional(
    scenario: &Scenario,
    step_id: &str,
    step: &ConditionalMessageStep,
    data: &Map<String, Value>,
) -> Option<OutgoingMessage> {
    let compiled = scenario.compiled_step(step_id)?;

    for (idx, expr) in compiled.variants.iter().enumerate() {
        match expr.eval_bool(data) {
            Ok(true) => {
                let variant = &step.variants[idx];
                return Some(render_message(
                    scenario,
                    &variant.message.text,
                    &variant.media,
                    &step.buttons,
                    data,
                ));
            }
            Ok(false) => {}
            Err(e) => log_condition_error(step_id, &e),
        }
    }

    step.message.as_ref().map(|body| {
        render_message(scenario, &body.text, &step.media, &step.buttons, data)
    })
}

/// Resolve the step that follows `step_id` given the current data, or
/// `None` when the conversation ends there.
pub fn resolve_next(
    scenario: &Scenario,
    step_id: &str,
    data: &Map<String, Value>,
) -> Result<Option<String>, ProcessorError> {
    let compiled = scenario
        .compiled_step(step_id)
        .ok_or_else(|| ProcessorError::UnknownStep(step_id.to_string()))?;

    match &compiled.next {
        CompiledNext::End => Ok(None),
        CompiledNext::Step(target) => Ok(Some(target.clone())),
        CompiledNext::Conditional { conditions, fallback } => {
            for (expr, target) in conditions {
                match expr.eval_bool(data) {
                    Ok(true) => return Ok(Some(target.clone())),
                    Ok(false) => {}
                    Err(e) => log_condition_error(step_id, &e),
                }
            }
            Ok(fallback.clone())
        }
    }
}

fn log_condition_error(step_id: &str, e: &EvalError) {
    log::warn!("condition error in step '{step_id}', treating as false: {e}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::model::InputKind;
    use serde_json::json;

    fn scenario(json: &str) -> Scenario {
        Scenario::from_json("s1", "bot1", 1, json).unwrap()
    }

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    const BRANCHING: &str = r#"{
        "start_step": "classify",
        "variables": {"age": {"type": "number"}},
        "steps": {
            "classify": {
                "type": "message",
                "message": {"text": "How old are you?"},
                "expected_input": {"type": "number", "variable": "age"},
                "next_step": {
                    "conditions": [{"if": "age >= 18", "then": "adult"}],
                    "else": "minor"
                }
            },
            "adult": {"type": "message", "message": {"text": "Welcome"}},
            "minor": {"type": "message", "message": {"text": "Sorry"}}
        }
    }"#;

    #[test]
    fn renders_text_with_substitution() {
        let s = scenario(
            r#"{"start_step":"greet","variables":{"user_name":{"default":"guest"}},"steps":{
                "greet": {"type":"message","message":{"text":"Hello {{user_name}}"}}
            }}"#,
        );
        let result = render_step(&s, "greet", &data(&[("user_name", json!("Ada"))])).unwrap();
        assert_eq!(result.message.unwrap().text, "Hello Ada");

        let result = render_step(&s, "greet", &data(&[])).unwrap();
        assert_eq!(result.message.unwrap().text, "Hello guest");
    }

    #[test]
    fn attaches_expected_input_to_result() {
        let s = scenario(BRANCHING);
        let result = render_step(&s, "classify", &data(&[])).unwrap();
        let spec = result.expects.unwrap();
        assert_eq!(spec.kind, InputKind::Number);
        assert_eq!(spec.variable, "age");
    }

    #[test]
    fn conditional_next_picks_first_match() {
        let s = scenario(BRANCHING);
        assert_eq!(
            resolve_next(&s, "classify", &data(&[("age", json!(21))])).unwrap(),
            Some("adult".into())
        );
        assert_eq!(
            resolve_next(&s, "classify", &data(&[("age", json!("17"))])).unwrap(),
            Some("minor".into())
        );
    }

    #[test]
    fn missing_variable_falls_through_to_else() {
        let s = scenario(BRANCHING);
        // `age` missing: the condition errors, evaluates as false, `else` wins.
        assert_eq!(
            resolve_next(&s, "classify", &data(&[])).unwrap(),
            Some("minor".into())
        );
    }

    #[test]
    fn terminal_step_resolves_to_none() {
        let s = scenario(BRANCHING);
        assert_eq!(resolve_next(&s, "adult", &data(&[])).unwrap(), None);
    }

    #[test]
    fn no_matching_condition_and_no_else_ends_conversation() {
        let s = scenario(
            r#"{"start_step":"a","variables":{"x":{}},"steps":{
                "a": {"type":"message","message":{"text":"hi"},
                      "next_step":{"conditions":[{"if":"x == 1","then":"b"}]}},
                "b": {"type":"message","message":{"text":"bye"}}
            }}"#,
        );
        assert_eq!(resolve_next(&s, "a", &data(&[("x", json!(2))])).unwrap(), None);
    }

    #[test]
    fn conditional_message_selects_variant() {
        let s = scenario(
            r#"{"start_step":"verdict","variables":{"age":{}},"steps":{
                "verdict": {
                    "type": "conditional_message",
                    "variants": [
                        {"if": "age >= 18", "message": {"text": "Welcome"}}
                    ],
                    "message": {"text": "Sorry"}
                }
            }}"#,
        );
        let adult = render_step(&s, "verdict", &data(&[("age", json!(20))])).unwrap();
        assert_eq!(adult.message.unwrap().text, "Welcome");

        let minor = render_step(&s, "verdict", &data(&[("age", json!(12))])).unwrap();
        assert_eq!(minor.message.unwrap().text, "Sorry");

        // Missing variable: variant condition is false, fallback applies.
        let unknown = render_step(&s, "verdict", &data(&[])).unwrap();
        assert_eq!(unknown.message.unwrap().text, "Sorry");
    }

    #[test]
    fn action_step_surfaces_invocation() {
        let s = scenario(
            r#"{"start_step":"act","variables":{},"steps":{
                "act": {"type":"action","action":"set_variable",
                        "params":{"name":"done","value":true},
                        "next_step":"end"},
                "end": {"type":"message","message":{"text":"ok"}}
            }}"#,
        );
        let result = render_step(&s, "act", &data(&[])).unwrap();
        assert!(result.message.is_none());
        let action = result.action.unwrap();
        assert_eq!(action.name, "set_variable");
        assert_eq!(resolve_next(&s, "act", &data(&[])).unwrap(), Some("end".into()));
    }

    #[test]
    fn unknown_step_is_fatal() {
        let s = scenario(BRANCHING);
        assert_eq!(
            render_step(&s, "ghost", &data(&[])).unwrap_err(),
            ProcessorError::UnknownStep("ghost".into())
        );
    }

    #[test]
    fn button_labels_are_templated() {
        let s = scenario(
            r#"{"start_step":"pick","variables":{"dish":{"default":"soup"}},"steps":{
                "pick": {"type":"message","message":{"text":"Order?"},
                         "buttons":[{"text":"Order {{dish}}","value":"order"}],
                         "expected_input":{"type":"button","variable":"dish"}}
            }}"#,
        );
        let result = render_step(&s, "pick", &data(&[])).unwrap();
        let msg = result.message.unwrap();
        assert_eq!(msg.buttons[0].text, "Order soup");
        assert_eq!(msg.buttons[0].value, "order");
    }
}
