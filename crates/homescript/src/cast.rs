//! Recursive value casts against the analyzer's type lattice.
//!
//! Two flavours share one implementation: the non-lossy form
//! (`allow_casts = false`) only validates shape and is used for runtime type
//! checks on `let` declarations and invocation arguments; the lossy form
//! additionally permits `bool <-> int <-> float`, `object <-> any-object`
//! (when the field sets match), and element-wise list conversion.
//!
//! Failures carry a dotted/indexed path (`.users[3].age`) pointing at the
//! innermost mismatch.

use thiserror::Error;

use crate::ast::Type;
use crate::value::{Value, ValueKind, value_ref};

/// A failed cast, with the path to the offending element.
#[derive(Debug, Clone, Error)]
#[error("type cast failed at `{path}`: {message}")]
pub struct CastFail {
    /// Dotted/indexed path from the cast root; empty at the root itself.
    pub path: String,
    pub message: String,
}

impl CastFail {
    fn mismatch(path: &str, expected: &Type, got: ValueKind) -> Self {
        Self {
            path: if path.is_empty() {
                ".".to_string()
            } else {
                path.to_string()
            },
            message: format!("cannot cast {} to {}", got, expected),
        }
    }
}

/// Deep-cast `value` to `target`.
pub fn deep_cast(value: &Value, target: &Type, allow_casts: bool) -> Result<Value, CastFail> {
    cast_at(value, target, allow_casts, "")
}

fn cast_at(value: &Value, target: &Type, allow: bool, path: &str) -> Result<Value, CastFail> {
    match target {
        Type::Any => Ok(value.deep_clone()),
        Type::Null => match value {
            Value::Null => Ok(Value::Null),
            other => Err(CastFail::mismatch(path, target, other.kind())),
        },
        Type::Int => match value {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) if allow => Ok(Value::Int(*f as i64)),
            Value::Bool(b) if allow => Ok(Value::Int(i64::from(*b))),
            other => Err(CastFail::mismatch(path, target, other.kind())),
        },
        Type::Float => match value {
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::Int(i) if allow => Ok(Value::Float(*i as f64)),
            Value::Bool(b) if allow => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            other => Err(CastFail::mismatch(path, target, other.kind())),
        },
        Type::Bool => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Int(i) if allow => Ok(Value::Bool(*i != 0)),
            Value::Float(f) if allow => Ok(Value::Bool(*f != 0.0)),
            other => Err(CastFail::mismatch(path, target, other.kind())),
        },
        Type::String => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            other => Err(CastFail::mismatch(path, target, other.kind())),
        },
        Type::Range => match value {
            range @ Value::Range { .. } => Ok(range.clone()),
            other => Err(CastFail::mismatch(path, target, other.kind())),
        },
        Type::List(element) => match value {
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{}]", path, index);
                    let cast = cast_at(&item.read(), element, allow, &item_path)?;
                    out.push(value_ref(cast));
                }
                Ok(Value::List(out))
            }
            other => Err(CastFail::mismatch(path, target, other.kind())),
        },
        Type::Object(target_fields) => {
            let fields = match value {
                Value::Object(fields) => fields,
                Value::AnyObject(fields) if allow => fields,
                other => return Err(CastFail::mismatch(path, target, other.kind())),
            };
            if fields.len() != target_fields.len() {
                return Err(CastFail {
                    path: if path.is_empty() { ".".into() } else { path.into() },
                    message: format!(
                        "field count mismatch: expected {} fields, got {}",
                        target_fields.len(),
                        fields.len()
                    ),
                });
            }
            let mut out = Vec::with_capacity(target_fields.len());
            for target_field in target_fields {
                let field_path = format!("{}.{}", path, target_field.name);
                let Some((_, field_value)) =
                    fields.iter().find(|(name, _)| *name == target_field.name)
                else {
                    return Err(CastFail {
                        path: field_path,
                        message: format!("missing field `{}`", target_field.name),
                    });
                };
                let cast = cast_at(&field_value.read(), &target_field.ty, allow, &field_path)?;
                out.push((target_field.name.clone(), value_ref(cast)));
            }
            Ok(Value::Object(out))
        }
        Type::AnyObject => match value {
            Value::AnyObject(fields) => Ok(Value::AnyObject(clone_fields(fields))),
            Value::Object(fields) if allow => Ok(Value::AnyObject(clone_fields(fields))),
            other => Err(CastFail::mismatch(path, target, other.kind())),
        },
        Type::Option(inner) => match value {
            Value::Option(None) => Ok(Value::Option(None)),
            Value::Option(Some(wrapped)) => {
                let cast = cast_at(&wrapped.read(), inner, allow, path)?;
                Ok(Value::Option(Some(value_ref(cast))))
            }
            // A bare value casts into `Some`.
            other => {
                let cast = cast_at(other, inner, allow, path)?;
                Ok(Value::Option(Some(value_ref(cast))))
            }
        },
        Type::Function { .. } => match value {
            func @ (Value::VmFunction(_) | Value::BuiltinFunction(_)) => Ok(func.clone()),
            other => Err(CastFail::mismatch(path, target, other.kind())),
        },
    }
}

fn clone_fields(fields: &[(String, crate::value::ValueRef)]) -> Vec<(String, crate::value::ValueRef)> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), value_ref(value.read().deep_clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ObjectTypeField;

    fn list_of(values: Vec<Value>) -> Value {
        Value::List(values.into_iter().map(value_ref).collect())
    }

    #[test]
    fn test_any_accepts_everything() {
        let value = list_of(vec![Value::Int(1)]);
        assert!(deep_cast(&value, &Type::Any, false).is_ok());
    }

    #[test]
    fn test_scalar_casts_gated() {
        assert!(deep_cast(&Value::Bool(true), &Type::Int, false).is_err());
        let cast = deep_cast(&Value::Bool(true), &Type::Int, true).unwrap();
        assert!(cast.is_equal(&Value::Int(1)));

        let cast = deep_cast(&Value::Float(3.9), &Type::Int, true).unwrap();
        assert!(cast.is_equal(&Value::Int(3)));
    }

    #[test]
    fn test_option_wraps_bare_values() {
        let target = Type::Option(Box::new(Type::Int));
        let cast = deep_cast(&Value::Int(7), &target, false).unwrap();
        assert!(cast.is_equal(&Value::Option(Some(value_ref(Value::Int(7))))));

        let cast = deep_cast(&Value::Option(None), &target, false).unwrap();
        assert!(cast.is_equal(&Value::Option(None)));
    }

    #[test]
    fn test_error_path_is_indexed() {
        let target = Type::List(Box::new(Type::Object(vec![ObjectTypeField::new(
            "age",
            Type::Int,
        )])));
        let bad = list_of(vec![
            Value::Object(vec![("age".to_string(), value_ref(Value::Int(1)))]),
            Value::Object(vec![("age".to_string(), value_ref(Value::String("x".into())))]),
        ]);
        let err = deep_cast(&bad, &target, false).unwrap_err();
        assert_eq!(err.path, "[1].age");
        assert!(err.to_string().contains("cannot cast str to int"));
    }

    #[test]
    fn test_object_anyobject_roundtrip() {
        let object = Value::Object(vec![("x".to_string(), value_ref(Value::Int(1)))]);
        assert!(deep_cast(&object, &Type::AnyObject, false).is_err());
        let any = deep_cast(&object, &Type::AnyObject, true).unwrap();
        assert_eq!(any.kind(), ValueKind::AnyObject);

        let back = deep_cast(
            &any,
            &Type::Object(vec![ObjectTypeField::new("x", Type::Int)]),
            true,
        )
        .unwrap();
        assert!(back.is_equal(&object));
    }

    #[test]
    fn test_idempotence() {
        let target = Type::Option(Box::new(Type::Float));
        let once = deep_cast(&Value::Int(2), &target, true).unwrap();
        let twice = deep_cast(&once, &target, true).unwrap();
        assert!(once.is_equal(&twice));
    }
}
