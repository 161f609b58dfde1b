//! JSON marshalling for the value model.
//!
//! Marshalling is structural: lists become arrays, objects and any-objects
//! become JSON objects, `none` becomes `null`, `Some(x)` flattens to `x`.
//! Function values and iterators have no JSON form. Cycles are broken by a
//! visited set and reported as errors rather than looping.
//!
//! Unmarshalling comes in two forms: the generic one (JSON objects turn into
//! any-objects, integral numbers into ints) and the type-directed one, which
//! shapes the result into a known target type, notably materializing an int
//! when a JSON float meets an integer target.

use std::sync::Arc;

use crate::ast::Type;
use crate::error::RuntimeError;
use crate::value::{Value, ValueRef, value_ref};

/// Marshal a value into a `serde_json` tree.
pub fn marshal(value: &Value) -> Result<serde_json::Value, RuntimeError> {
    let mut visited = Vec::new();
    marshal_guarded(value, &mut visited)
}

/// Render a value as JSON text, optionally pretty-printed.
pub fn to_json_string(value: &Value, pretty: bool) -> Result<String, RuntimeError> {
    let tree = marshal(value)?;
    let rendered = if pretty {
        serde_json::to_string_pretty(&tree)
    } else {
        serde_json::to_string(&tree)
    };
    rendered.map_err(|err| RuntimeError::json(err.to_string()))
}

/// Parse JSON text into a value (generic mapping).
pub fn parse(text: &str) -> Result<Value, RuntimeError> {
    let tree: serde_json::Value =
        serde_json::from_str(text).map_err(|err| RuntimeError::json(err.to_string()))?;
    Ok(unmarshal(&tree))
}

fn marshal_guarded(
    value: &Value,
    visited: &mut Vec<usize>,
) -> Result<serde_json::Value, RuntimeError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Bool(b) => serde_json::Value::from(*b),
        Value::String(s) => serde_json::Value::from(s.clone()),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(marshal_ref(item, visited)?);
            }
            serde_json::Value::Array(out)
        }
        Value::Object(fields) | Value::AnyObject(fields) => {
            let mut map = serde_json::Map::new();
            for (key, field) in fields {
                map.insert(key.clone(), marshal_ref(field, visited)?);
            }
            serde_json::Value::Object(map)
        }
        Value::Option(inner) => match inner {
            Some(wrapped) => marshal_ref(wrapped, visited)?,
            None => serde_json::Value::Null,
        },
        Value::Range {
            start,
            end,
            end_inclusive,
        } => serde_json::json!({
            "start": start,
            "end": end,
            "end_inclusive": end_inclusive,
        }),
        Value::Iterator(_) | Value::VmFunction(_) | Value::BuiltinFunction(_) => {
            return Err(RuntimeError::json(format!(
                "cannot encode value of type {} as JSON",
                value.kind()
            )));
        }
    })
}

fn marshal_ref(
    handle: &ValueRef,
    visited: &mut Vec<usize>,
) -> Result<serde_json::Value, RuntimeError> {
    let addr = Arc::as_ptr(handle) as usize;
    if visited.contains(&addr) {
        return Err(RuntimeError::json("cannot encode cyclic value as JSON"));
    }
    visited.push(addr);
    let result = marshal_guarded(&handle.read(), visited);
    visited.pop();
    result
}

/// Generic unmarshalling: objects become any-objects, integral numbers ints.
pub fn unmarshal(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::List(items.iter().map(|item| value_ref(unmarshal(item))).collect())
        }
        serde_json::Value::Object(map) => Value::AnyObject(
            map.iter()
                .map(|(key, item)| (key.clone(), value_ref(unmarshal(item))))
                .collect(),
        ),
    }
}

/// Type-directed unmarshalling.
pub fn unmarshal_typed(json: &serde_json::Value, target: &Type) -> Result<Value, RuntimeError> {
    match target {
        Type::Any => Ok(unmarshal(json)),
        Type::Null => match json {
            serde_json::Value::Null => Ok(Value::Null),
            other => Err(shape_error(target, other)),
        },
        Type::Int => match json {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else {
                    // A JSON float meeting an integer target materializes an int.
                    Ok(Value::Int(n.as_f64().unwrap_or(0.0) as i64))
                }
            }
            other => Err(shape_error(target, other)),
        },
        Type::Float => match json {
            serde_json::Value::Number(n) => Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN))),
            other => Err(shape_error(target, other)),
        },
        Type::Bool => match json {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            other => Err(shape_error(target, other)),
        },
        Type::String => match json {
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            other => Err(shape_error(target, other)),
        },
        Type::List(element) => match json {
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(value_ref(unmarshal_typed(item, element)?));
                }
                Ok(Value::List(out))
            }
            other => Err(shape_error(target, other)),
        },
        Type::Object(fields) => match json {
            serde_json::Value::Object(map) => {
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    let Some(item) = map.get(&field.name) else {
                        return Err(RuntimeError::json(format!(
                            "missing JSON field `{}`",
                            field.name
                        )));
                    };
                    out.push((field.name.clone(), value_ref(unmarshal_typed(item, &field.ty)?)));
                }
                Ok(Value::Object(out))
            }
            other => Err(shape_error(target, other)),
        },
        Type::AnyObject => match json {
            serde_json::Value::Object(_) => Ok(unmarshal(json)),
            other => Err(shape_error(target, other)),
        },
        Type::Option(inner) => match json {
            serde_json::Value::Null => Ok(Value::Option(None)),
            other => Ok(Value::Option(Some(value_ref(unmarshal_typed(
                other, inner,
            )?)))),
        },
        Type::Range | Type::Function { .. } => Err(RuntimeError::json(format!(
            "cannot decode JSON into {}",
            target
        ))),
    }
}

fn shape_error(target: &Type, json: &serde_json::Value) -> RuntimeError {
    let got = match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    };
    RuntimeError::json(format!("expected JSON {}, found {}", target, got))
}
