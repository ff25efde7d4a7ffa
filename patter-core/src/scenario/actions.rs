//! Registered action handlers.
//!
//! Action steps name a handler from a fixed, code-level registry; scenarios
//! can never supply code of their own. Embedding applications register
//! domain handlers (HR registration, CRM lookups, ...) at startup; the
//! builtins cover collected-data manipulation.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Map, Value};

/// Context passed to an action handler: the step's literal params plus the
/// dialog's collected data.
pub struct ActionContext<'a> {
    pub bot_id: &'a str,
    pub chat_id: &'a str,
    pub params: &'a Map<String, Value>,
    pub data: &'a Map<String, Value>,
}

/// A handler returns variable updates to merge into the collected data, or
/// an error message. Errors park the conversation in the fault sub-state.
pub trait ActionHandler: Send + Sync {
    fn call(&self, ctx: &ActionContext<'_>) -> Result<Map<String, Value>, String>;
}

impl<F> ActionHandler for F
where
    F: Fn(&ActionContext<'_>) -> Result<Map<String, Value>, String> + Send + Sync,
{
    fn call(&self, ctx: &ActionContext<'_>) -> Result<Map<String, Value>, String> {
        self(ctx)
    }
}

#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in handler set.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("set_variable", set_variable);
        registry.register("clear_variables", clear_variables);
        registry.register("record_timestamp", record_timestamp);
        registry
    }

    pub fn register<H: ActionHandler + 'static>(&mut self, name: &str, handler: H) {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ActionHandler> {
        self.handlers.get(name).map(|h| h.as_ref())
    }
}

/// `set_variable {name, value}`: write one collected variable.
fn set_variable(ctx: &ActionContext<'_>) -> Result<Map<String, Value>, String> {
    let name = ctx
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "set_variable requires a string 'name' param".to_string())?;
    let value = ctx
        .params
        .get("value")
        .cloned()
        .ok_or_else(|| "set_variable requires a 'value' param".to_string())?;

    let mut updates = Map::new();
    updates.insert(name.to_string(), value);
    Ok(updates)
}

/// `clear_variables {names: [..]}`: null out the named variables.
fn clear_variables(ctx: &ActionContext<'_>) -> Result<Map<String, Value>, String> {
    let names = ctx
        .params
        .get("names")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "clear_variables requires a 'names' list param".to_string())?;

    let mut updates = Map::new();
    for name in names {
        let name = name
            .as_str()
            .ok_or_else(|| "clear_variables names must be strings".to_string())?;
        updates.insert(name.to_string(), Value::Null);
    }
    Ok(updates)
}

/// `record_timestamp {variable}`: write the current time (RFC 3339).
fn record_timestamp(ctx: &ActionContext<'_>) -> Result<Map<String, Value>, String> {
    let variable = ctx
        .params
        .get("variable")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "record_timestamp requires a string 'variable' param".to_string())?;

    let mut updates = Map::new();
    updates.insert(variable.to_string(), Value::String(Utc::now().to_rfc3339()));
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(params: &'a Map<String, Value>, data: &'a Map<String, Value>) -> ActionContext<'a> {
        ActionContext {
            bot_id: "bot1",
            chat_id: "chat1",
            params,
            data,
        }
    }

    fn params(raw: Value) -> Map<String, Value> {
        raw.as_object().unwrap().clone()
    }

    #[test]
    fn set_variable_writes_one_update() {
        let registry = ActionRegistry::builtin();
        let p = params(json!({"name": "greeted", "value": true}));
        let d = Map::new();
        let updates = registry.get("set_variable").unwrap().call(&ctx(&p, &d)).unwrap();
        assert_eq!(updates.get("greeted"), Some(&json!(true)));
    }

    #[test]
    fn set_variable_requires_params() {
        let registry = ActionRegistry::builtin();
        let p = params(json!({"value": 1}));
        let d = Map::new();
        assert!(registry.get("set_variable").unwrap().call(&ctx(&p, &d)).is_err());
    }

    #[test]
    fn clear_variables_nulls_out_names() {
        let registry = ActionRegistry::builtin();
        let p = params(json!({"names": ["a", "b"]}));
        let d = Map::new();
        let updates = registry.get("clear_variables").unwrap().call(&ctx(&p, &d)).unwrap();
        assert_eq!(updates.get("a"), Some(&Value::Null));
        assert_eq!(updates.get("b"), Some(&Value::Null));
    }

    #[test]
    fn unknown_handler_is_absent() {
        let registry = ActionRegistry::builtin();
        assert!(registry.get("register_with_hr").is_none());
    }

    #[test]
    fn custom_handlers_can_be_registered() {
        let mut registry = ActionRegistry::builtin();
        registry.register("register_with_hr", |ctx: &ActionContext<'_>| {
            let mut updates = Map::new();
            let name = ctx.data.get("user_name").cloned().unwrap_or(Value::Null);
            updates.insert("hr_registered".into(), json!(true));
            updates.insert("hr_name".into(), name);
            Ok(updates)
        });

        let p = Map::new();
        let mut d = Map::new();
        d.insert("user_name".into(), json!("Ada"));
        let updates = registry
            .get("register_with_hr")
            .unwrap()
            .call(&ctx(&p, &d))
            .unwrap();
        assert_eq!(updates.get("hr_registered"), Some(&json!(true)));
        assert_eq!(updates.get("hr_name"), Some(&json!("Ada")));
    }
}
