//! Template rendering for automations, powered by minijinja.
//!
//! Used for service-call `data` in automation actions and for template
//! conditions. Context variables are passed as JSON (`trigger`, ...).
//! With a state machine, `states('entity_id')` and
//! `is_state('entity_id', 'home')` are available.
//!
//! Custom filters: int, float, round, default, iif, lower, upper, trim, replace

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use minijinja::{Environment, Value};

use crate::state::StateMachine;

/// Shared template environment (filters registered once).
static ENV: OnceLock<Environment<'static>> = OnceLock::new();

fn env() -> &'static Environment<'static> {
    ENV.get_or_init(|| {
        let mut env = Environment::new();

        env.add_filter("int", filter_int);
        env.add_filter("float", filter_float);
        env.add_filter("round", filter_round);
        env.add_filter("default", filter_default);
        env.add_filter("iif", filter_iif);
        env.add_filter("lower", filter_lower);
        env.add_filter("upper", filter_upper);
        env.add_filter("trim", filter_trim);
        env.add_filter("replace", filter_replace);

        env.add_function("float", fn_float);
        env.add_function("int", fn_int);
        env.add_function("bool", fn_bool);

        env
    })
}

/// Render a template string with JSON context variables.
pub fn render(template: &str, vars: &serde_json::Value) -> Result<String, String> {
    render_in(env(), template, vars)
}

/// Render a template that may look up entity states.
pub fn render_with_state_machine(
    template: &str,
    vars: &serde_json::Value,
    state_machine: &StateMachine,
) -> Result<String, String> {
    let snapshot: Arc<HashMap<String, String>> = Arc::new(
        state_machine
            .get_all()
            .into_iter()
            .map(|s| (s.entity_id, s.state))
            .collect(),
    );

    let mut env = env().clone();
    let states = snapshot.clone();
    env.add_function("states", move |entity_id: String| -> String {
        states
            .get(&entity_id)
            .cloned()
            .unwrap_or_else(|| crate::state::STATE_UNKNOWN.to_string())
    });
    env.add_function("is_state", move |entity_id: String, state: String| -> bool {
        snapshot.get(&entity_id) == Some(&state)
    });
    render_in(&env, template, vars)
}

fn render_in(env: &Environment<'_>, template: &str, vars: &serde_json::Value) -> Result<String, String> {
    let tmpl = env
        .template_from_str(template)
        .map_err(|e| format!("template parse error: {}", e))?;
    tmpl.render(Value::from_serialize(vars))
        .map_err(|e| format!("template render error: {}", e))
}

/// Whether a string contains template markup.
pub fn is_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

/// Render every template string inside `data`, leaving other values as-is.
pub fn render_data(
    data: &serde_json::Value,
    vars: &serde_json::Value,
    state_machine: &StateMachine,
) -> serde_json::Value {
    match data {
        serde_json::Value::String(s) if is_template(s) => {
            match render_with_state_machine(s, vars, state_machine) {
                Ok(rendered) => serde_json::Value::String(rendered),
                Err(e) => {
                    tracing::warn!("Template error in service data: {}", e);
                    data.clone()
                }
            }
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|v| render_data(v, vars, state_machine)).collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_data(v, vars, state_machine)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ── Custom Filters ──────────────────────────────────────

fn filter_int(value: Value) -> Value {
    if let Some(s) = value.as_str() {
        Value::from(s.parse::<i64>().unwrap_or(0))
    } else if let Some(f) = as_f64(&value) {
        Value::from(f as i64)
    } else {
        Value::from(0i64)
    }
}

fn filter_float(value: Value) -> Value {
    if let Some(s) = value.as_str() {
        Value::from(s.parse::<f64>().unwrap_or(0.0))
    } else if let Some(f) = as_f64(&value) {
        Value::from(f)
    } else {
        Value::from(0.0f64)
    }
}

fn filter_round(value: Value, precision: Option<Value>) -> Value {
    let p = precision.and_then(|v| as_f64(&v)).unwrap_or(0.0) as i32;
    if let Some(f) = as_f64(&value) {
        let factor = 10f64.powi(p);
        Value::from((f * factor).round() / factor)
    } else {
        value
    }
}

fn filter_default(value: Value, default: Option<Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.unwrap_or_else(|| Value::from(""))
    } else {
        value
    }
}

fn filter_iif(value: Value, if_true: Value, if_false: Option<Value>) -> Value {
    let falsy = value.is_undefined()
        || value.is_none()
        || value == Value::from(false)
        || value == Value::from(0i64)
        || (value.as_str() == Some(""));
    if !falsy {
        if_true
    } else {
        if_false.unwrap_or_else(|| Value::from(""))
    }
}

fn filter_lower(value: Value) -> Value {
    Value::from(value.to_string().to_lowercase())
}

fn filter_upper(value: Value) -> Value {
    Value::from(value.to_string().to_uppercase())
}

fn filter_trim(value: Value) -> Value {
    Value::from(value.to_string().trim().to_string())
}

fn filter_replace(value: Value, old: Value, new: Value) -> Value {
    Value::from(value.to_string().replace(&old.to_string(), &new.to_string()))
}

// ── Global Functions ────────────────────────────────────

fn fn_float(value: Value, default: Option<Value>) -> Value {
    if let Some(s) = value.as_str() {
        match s.parse::<f64>() {
            Ok(f) => Value::from(f),
            Err(_) => default.unwrap_or(Value::from(0.0f64)),
        }
    } else if let Some(f) = as_f64(&value) {
        Value::from(f)
    } else {
        default.unwrap_or(Value::from(0.0f64))
    }
}

fn fn_int(value: Value, default: Option<Value>) -> Value {
    if let Some(s) = value.as_str() {
        match s.parse::<i64>() {
            Ok(i) => Value::from(i),
            Err(_) => match s.parse::<f64>() {
                Ok(f) => Value::from(f as i64),
                Err(_) => default.unwrap_or(Value::from(0i64)),
            },
        }
    } else if let Some(f) = as_f64(&value) {
        Value::from(f as i64)
    } else {
        default.unwrap_or(Value::from(0i64))
    }
}

fn fn_bool(value: Value) -> Value {
    let truthy = if let Some(s) = value.as_str() {
        matches!(s.to_lowercase().as_str(), "true" | "yes" | "on" | "enable" | "1")
    } else if let Some(f) = as_f64(&value) {
        f != 0.0
    } else {
        !value.is_undefined() && !value.is_none()
    };
    Value::from(truthy)
}

fn as_f64(v: &Value) -> Option<f64> {
    if let Ok(i) = i64::try_from(v.clone()) {
        Some(i as f64)
    } else if let Ok(f) = f64::try_from(v.clone()) {
        Some(f)
    } else if let Some(s) = v.as_str() {
        s.parse::<f64>().ok()
    } else {
        None
    }
}
