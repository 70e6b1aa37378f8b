//! Builtin callables for local runs and tests.
//!
//! | name        | args                              | result                     |
//! |-------------|-----------------------------------|----------------------------|
//! | `echo`      | anything                          | the args unchanged         |
//! | `concat`    | `{parts: [..], separator?}`       | parts joined as a string   |
//! | `uppercase` | a string or `{text}`              | the upper-cased string     |
//! | `length`    | a string, array or object         | its length                 |
//! | `sum`       | an array of numbers or `{values}` | the numeric sum            |
//! | `sleep`     | `{ms, value?}`                    | `value` after `ms` millis  |

use std::time::Duration;

use flowline_core::expression::stringify;
use flowline_core::workflow::{Capability, CapabilityError, HandlerMap};
use serde_json::{Value, json};

/// Names served by [`BuiltinCallables`].
pub const BUILTIN_NAMES: &[&str] = &["echo", "concat", "uppercase", "length", "sum", "sleep"];

/// Register every builtin under its own name.
pub fn register_builtins(mut handlers: HandlerMap) -> HandlerMap {
    for name in BUILTIN_NAMES {
        handlers = handlers.register_callable(name, BuiltinCallables);
    }
    handlers
}

/// Dispatches on the invoked name.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinCallables;

impl Capability for BuiltinCallables {
    async fn invoke(&self, name: &str, args: Value) -> Result<Value, CapabilityError> {
        match name {
            "echo" => Ok(args),
            "concat" => concat(&args),
            "uppercase" => uppercase(&args),
            "length" => length(&args),
            "sum" => sum(&args),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(args.get("value").cloned().unwrap_or(Value::Null))
            }
            other => Err(CapabilityError::NotFound {
                kind: "callable",
                name: other.to_string(),
            }),
        }
    }
}

fn concat(args: &Value) -> Result<Value, CapabilityError> {
    let parts = args
        .get("parts")
        .and_then(Value::as_array)
        .ok_or_else(|| CapabilityError::Failed("concat expects {parts: [...]}".to_string()))?;
    let separator = args.get("separator").and_then(Value::as_str).unwrap_or("");
    let joined = parts.iter().map(stringify).collect::<Vec<_>>().join(separator);
    Ok(Value::String(joined))
}

fn uppercase(args: &Value) -> Result<Value, CapabilityError> {
    let text = match args {
        Value::String(s) => s.as_str(),
        other => other
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::Failed("uppercase expects a string or {text}".to_string()))?,
    };
    Ok(Value::String(text.to_uppercase()))
}

fn length(args: &Value) -> Result<Value, CapabilityError> {
    let len = match args {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(CapabilityError::Failed(format!(
                "length expects a string, array or object, got {other}"
            )));
        }
    };
    Ok(json!(len))
}

fn sum(args: &Value) -> Result<Value, CapabilityError> {
    let values = match args {
        Value::Array(items) => items,
        other => other
            .get("values")
            .and_then(Value::as_array)
            .ok_or_else(|| CapabilityError::Failed("sum expects an array or {values}".to_string()))?,
    };

    let mut total_int: i64 = 0;
    let mut total_float = 0.0;
    let mut integral = true;
    for value in values {
        match (value.as_i64(), value.as_f64()) {
            (Some(i), _) if integral => match total_int.checked_add(i) {
                Some(t) => total_int = t,
                None => {
                    integral = false;
                    total_float = total_int as f64 + i as f64;
                }
            },
            (_, Some(f)) => {
                if integral {
                    integral = false;
                    total_float = total_int as f64;
                }
                total_float += f;
            }
            _ => return Err(CapabilityError::Failed(format!("sum expects numbers, got {value}"))),
        }
    }
    Ok(if integral { json!(total_int) } else { json!(total_float) })
}
