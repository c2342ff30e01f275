// The `${...}` template language
//
// Placeholders hold JMESPath expressions evaluated against the run context,
// plus the `now±N{s,m,h,d}` time-arithmetic shorthand. A path miss is a
// hard render error, never a silent empty string.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::context::{format_instant, RunContext};
use crate::error::TemplateError;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("placeholder regex"))
}

fn time_shorthand_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^now([+-])(\d+)([smhd])$").expect("time shorthand regex"))
}

/// Render a `with` value recursively: strings are scanned for placeholders,
/// arrays and objects recurse, other literals pass through.
pub fn render_value(value: &Value, ctx: &RunContext) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|v| render_value(v, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render one string. A string that is exactly one placeholder splices the
/// evaluated value in natively; otherwise every placeholder is replaced by
/// its string form.
pub fn render_string(s: &str, ctx: &RunContext) -> Result<Value, TemplateError> {
    let re = placeholder_re();
    if !re.is_match(s) {
        return Ok(Value::String(s.to_string()));
    }

    // Whole-string single placeholder: native type splice
    if let Some(caps) = re.captures(s) {
        let whole = caps.get(0).expect("match");
        if whole.start() == 0 && whole.end() == s.len() {
            return eval_expr(caps[1].trim(), ctx);
        }
    }

    let mut out = String::new();
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let m = caps.get(0).expect("match");
        out.push_str(&s[last..m.start()]);
        let value = eval_expr(caps[1].trim(), ctx)?;
        out.push_str(&stringify(&value));
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Evaluate a bare expression: the time shorthand first, then JMESPath
/// against the context. A null result means the path missed.
pub fn eval_expr(expr: &str, ctx: &RunContext) -> Result<Value, TemplateError> {
    if let Some(instant) = eval_time_shorthand(expr, ctx)? {
        return Ok(instant);
    }

    let result = match eval_simple_path(expr, ctx.as_value()) {
        Some(v) => v,
        None => jmespath_eval(expr, ctx.as_value())?,
    };
    if result.is_null() {
        return Err(TemplateError::new(format!("unresolved reference: {}", expr)));
    }
    Ok(result)
}

/// Resolve a plain dotted path (`params.x`, `steps.y.z`) directly, keeping
/// number representations exactly as they appear in the context. Returns
/// None when the expression needs the full JMESPath evaluator; a path miss
/// resolves to null so the caller reports it as unresolved.
fn eval_simple_path(expr: &str, root: &Value) -> Option<Value> {
    if matches!(expr, "true" | "false" | "null") {
        return None;
    }
    let simple = !expr.is_empty()
        && expr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !simple || expr.starts_with('.') || expr.ends_with('.') || expr.contains("..") {
        return None;
    }
    let mut cur = root;
    for segment in expr.split('.') {
        match cur.get(segment) {
            Some(next) => cur = next,
            None => return Some(Value::Null),
        }
    }
    Some(cur.clone())
}

/// Evaluate an `if` value. A string carrying placeholders is rendered
/// first; a bare string is a JMESPath expression. Falsy follows JMESPath
/// rules: null, false, empty string, empty array, empty object.
pub fn eval_condition(raw: &str, ctx: &RunContext) -> Result<bool, TemplateError> {
    let value = if raw.contains("${") {
        render_string(raw, ctx)?
    } else {
        // `if: "false"`-style literals are accepted alongside paths
        match raw.trim() {
            "true" => return Ok(true),
            "false" => return Ok(false),
            expr => eval_expr(expr, ctx)?,
        }
    };
    Ok(is_truthy(&value))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval_time_shorthand(expr: &str, ctx: &RunContext) -> Result<Option<Value>, TemplateError> {
    if expr == "now" {
        return Ok(Some(Value::String(format_instant(ctx.now()))));
    }
    let Some(caps) = time_shorthand_re().captures(expr) else {
        return Ok(None);
    };

    let amount: i64 = caps[2]
        .parse()
        .map_err(|_| TemplateError::new(format!("time offset out of range: {}", expr)))?;
    let delta = match &caps[3] {
        "s" => chrono::Duration::seconds(amount),
        "m" => chrono::Duration::minutes(amount),
        "h" => chrono::Duration::hours(amount),
        "d" => chrono::Duration::days(amount),
        _ => unreachable!("regex limits units"),
    };
    let shifted = if &caps[1] == "+" {
        ctx.now() + delta
    } else {
        ctx.now() - delta
    };
    Ok(Some(Value::String(format_instant(shifted))))
}

fn jmespath_eval(expr: &str, root: &Value) -> Result<Value, TemplateError> {
    let compiled = jmespath::compile(expr)
        .map_err(|e| TemplateError::new(format!("invalid expression '{}': {}", expr, e)))?;
    let data = jmespath::Variable::from_json(&root.to_string())
        .map_err(|e| TemplateError::new(format!("context not representable: {}", e)))?;
    let result = compiled
        .search(data)
        .map_err(|e| TemplateError::new(format!("expression '{}' failed: {}", expr, e)))?;
    serde_json::to_value(&*result).map_err(|e| {
        TemplateError::new(format!("expression '{}' result not serializable: {}", expr, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn ctx_with(params: Value) -> RunContext {
        let params = params.as_object().unwrap().clone();
        let empty = serde_json::Map::new();
        RunContext::new(&params, &empty, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn plain_strings_pass_through() {
        let ctx = ctx_with(json!({}));
        assert_eq!(
            render_string("no placeholders here", &ctx).unwrap(),
            json!("no placeholders here")
        );
    }

    #[test]
    fn single_placeholder_splices_native_type() {
        let ctx = ctx_with(json!({"count": 3, "tags": ["a", "b"]}));
        assert_eq!(render_string("${params.count}", &ctx).unwrap(), json!(3));
        assert_eq!(render_string("${params.tags}", &ctx).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn mixed_string_stringifies() {
        let ctx = ctx_with(json!({"count": 3, "name": "batch"}));
        assert_eq!(
            render_string("${params.name} has ${params.count} items", &ctx).unwrap(),
            json!("batch has 3 items")
        );
    }

    #[test]
    fn now_and_arithmetic() {
        let ctx = ctx_with(json!({}));
        assert_eq!(eval_expr("now", &ctx).unwrap(), json!("2024-06-01T12:00:00Z"));
        assert_eq!(eval_expr("now+1h", &ctx).unwrap(), json!("2024-06-01T13:00:00Z"));
        assert_eq!(eval_expr("now-15m", &ctx).unwrap(), json!("2024-06-01T11:45:00Z"));
        assert_eq!(eval_expr("now+1d", &ctx).unwrap(), json!("2024-06-02T12:00:00Z"));
        assert_eq!(eval_expr("now+90s", &ctx).unwrap(), json!("2024-06-01T12:01:30Z"));
    }

    #[test]
    fn missing_path_is_a_hard_error() {
        let ctx = ctx_with(json!({}));
        let err = render_string("${steps.missing.value}", &ctx).unwrap_err();
        assert!(err.detail.contains("unresolved reference"));
    }

    #[test]
    fn nested_values_render_recursively() {
        let ctx = ctx_with(json!({"user": "ada"}));
        let rendered = render_value(
            &json!({"greeting": "hi ${params.user}", "list": ["${params.user}"], "n": 7}),
            &ctx,
        )
        .unwrap();
        assert_eq!(rendered, json!({"greeting": "hi ada", "list": ["ada"], "n": 7}));
    }

    #[test]
    fn condition_truthiness() {
        let ctx = ctx_with(json!({"on": true, "off": false, "empty": "", "list": [1]}));
        assert!(eval_condition("params.on", &ctx).unwrap());
        assert!(!eval_condition("params.off", &ctx).unwrap());
        assert!(!eval_condition("params.empty", &ctx).unwrap());
        assert!(eval_condition("params.list", &ctx).unwrap());
        assert!(eval_condition("true", &ctx).unwrap());
        assert!(!eval_condition("false", &ctx).unwrap());
    }

    #[test]
    fn condition_with_placeholder_renders_first() {
        let ctx = ctx_with(json!({"mode": "dry"}));
        assert!(eval_condition("${params.mode}", &ctx).unwrap());
    }

    #[test]
    fn condition_on_missing_path_errors() {
        let ctx = ctx_with(json!({}));
        assert!(eval_condition("params.absent", &ctx).is_err());
    }

    #[test]
    fn jmespath_functions_are_available() {
        let ctx = ctx_with(json!({"items": [1, 2, 3]}));
        let len = eval_expr("length(params.items)", &ctx).unwrap();
        assert_eq!(len.as_f64(), Some(3.0));
    }
}
