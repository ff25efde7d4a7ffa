//! `{{name}}` placeholder substitution for message templates.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::model::VarMeta;

/// Substitute `{{name}}` placeholders in `template`.
///
/// Single-pass and non-recursive: substituted values are never re-scanned.
/// `{{{{` escapes a literal `{{`. An undefined variable resolves to its
/// declared default if present, else the empty string. An unterminated
/// placeholder is logged and the remainder is kept literally.
pub fn render(
    template: &str,
    variables: &HashMap<String, VarMeta>,
    data: &Map<String, Value>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];

        // `{{{{` is the escape for a literal `{{`.
        if let Some(stripped) = after.strip_prefix("{{") {
            out.push_str("{{");
            rest = stripped;
            continue;
        }

        match after.find("}}") {
            Some(close) => {
                let name = after[..close].trim();
                out.push_str(&lookup(name, variables, data));
                rest = &after[close + 2..];
            }
            None => {
                log::warn!("unterminated placeholder in template; keeping it literal");
                out.push_str("{{");
                out.push_str(after);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

fn lookup(name: &str, variables: &HashMap<String, VarMeta>, data: &Map<String, Value>) -> String {
    if let Some(value) = data.get(name) {
        return value_to_string(value);
    }
    if let Some(meta) = variables.get(name) {
        if let Some(default) = &meta.default {
            return value_to_string(default);
        }
    }
    String::new()
}

/// Render a collected value the way a user would read it: strings without
/// quotes, whole numbers without a fractional part, null as empty.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Option<Value>)]) -> HashMap<String, VarMeta> {
        pairs
            .iter()
            .map(|(name, default)| {
                (
                    name.to_string(),
                    VarMeta {
                        var_type: Some("string".into()),
                        default: default.clone(),
                    },
                )
            })
            .collect()
    }

    fn collected(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn substitutes_collected_values() {
        let result = render(
            "Hello {{user_name}}, table for {{guests}}?",
            &vars(&[]),
            &collected(&[("user_name", json!("Ada")), ("guests", json!(4))]),
        );
        assert_eq!(result, "Hello Ada, table for 4?");
    }

    #[test]
    fn undefined_variable_uses_declared_default() {
        let result = render(
            "Hello {{user_name}}!",
            &vars(&[("user_name", Some(json!("guest")))]),
            &collected(&[]),
        );
        assert_eq!(result, "Hello guest!");
    }

    #[test]
    fn undefined_variable_without_default_is_empty() {
        let result = render("Hello {{user_name}}!", &vars(&[]), &collected(&[]));
        assert_eq!(result, "Hello !");
    }

    #[test]
    fn quadruple_brace_escapes_literal() {
        let result = render(
            "Use {{{{name}} syntax, {{user_name}}",
            &vars(&[]),
            &collected(&[("user_name", json!("Ada"))]),
        );
        assert_eq!(result, "Use {{name}} syntax, Ada");
    }

    #[test]
    fn substitution_is_single_pass() {
        // A value containing a placeholder must not be expanded again.
        let result = render(
            "{{a}}",
            &vars(&[]),
            &collected(&[("a", json!("{{b}}")), ("b", json!("nope"))]),
        );
        assert_eq!(result, "{{b}}");
    }

    #[test]
    fn unterminated_placeholder_kept_literal() {
        let result = render("Hello {{user_name", &vars(&[]), &collected(&[]));
        assert_eq!(result, "Hello {{user_name");
    }

    #[test]
    fn whole_numbers_render_without_fraction() {
        assert_eq!(value_to_string(&json!(17)), "17");
        assert_eq!(value_to_string(&json!(17.5)), "17.5");
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!(["a", 1])), r#"["a",1]"#);
    }

    #[test]
    fn whitespace_inside_placeholder_is_tolerated() {
        let result = render(
            "Hi {{ user_name }}",
            &vars(&[]),
            &collected(&[("user_name", json!("Ada"))]),
        );
        assert_eq!(result, "Hi Ada");
    }
}
