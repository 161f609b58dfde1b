//! Field access and per-kind method builtins.
//!
//! `Member` resolves a field name against a receiver: data fields on objects
//! come back as the stored handle (so assignment through them mutates the
//! aggregate), everything else resolves to a builtin function bound to the
//! receiver. Any-objects reserve dot access for their methods; their data
//! lives behind the arrow operator ([`member_anyobj`]).

use crate::cast::deep_cast;
use crate::error::{FatalKind, Interrupt, RuntimeError};
use crate::executor::HostCtx;
use crate::json;
use crate::value::{Builtin, Value, ValueKind, ValueRef, value_ref};

/// Resolve `receiver.field`, yielding a pushable handle.
///
/// Unknown fields are value errors; the core escalates them to fatal
/// interrupts at the faulting span.
pub fn member(receiver: &ValueRef, field: &str) -> Result<ValueRef, RuntimeError> {
    // Data fields on fixed objects shadow methods.
    if let Value::Object(fields) = &*receiver.read()
        && let Some((_, handle)) = fields.iter().find(|(name, _)| name == field)
    {
        return Ok(handle.clone());
    }

    let kind = receiver.read().kind();
    match method_for(kind, field, receiver) {
        Some(builtin) => Ok(value_ref(Value::BuiltinFunction(builtin))),
        None => Err(RuntimeError::value(format!(
            "value of type {} has no field `{}`",
            kind, field
        ))),
    }
}

/// Resolve `receiver->field` on an any-object (or object), yielding an option.
pub fn member_anyobj(receiver: &ValueRef, field: &str) -> Result<Value, RuntimeError> {
    match &*receiver.read() {
        Value::AnyObject(fields) | Value::Object(fields) => Ok(Value::Option(
            fields
                .iter()
                .find(|(name, _)| name == field)
                .map(|(_, handle)| handle.clone()),
        )),
        other => Err(RuntimeError::value(format!(
            "arrow access requires an object, got {}",
            other.kind()
        ))),
    }
}

fn method_for(kind: ValueKind, field: &str, receiver: &ValueRef) -> Option<Builtin> {
    let recv = receiver.clone();
    match (kind, field) {
        // --- shared ---
        (
            ValueKind::Int
            | ValueKind::Float
            | ValueKind::Bool
            | ValueKind::String
            | ValueKind::Option
            | ValueKind::Object
            | ValueKind::AnyObject,
            "to_string",
        ) => Some(Builtin::new(move |_ctx, _args| {
            Ok(Some(Value::String(recv.read().display())))
        })),

        // --- int ---
        (ValueKind::Int, "to_range") => Some(Builtin::new(move |ctx, _args| {
            let end = recv.read().as_int().ok_or_else(|| bad_receiver(ctx))?;
            Ok(Some(Value::Range {
                start: 0,
                end,
                end_inclusive: false,
            }))
        })),

        // --- float ---
        (ValueKind::Float, "is_int") => Some(Builtin::new(move |ctx, _args| {
            let f = recv.read().as_float().ok_or_else(|| bad_receiver(ctx))?;
            Ok(Some(Value::Bool(f.fract() == 0.0)))
        })),
        (ValueKind::Float, "trunc") => Some(Builtin::new(move |ctx, _args| {
            let f = recv.read().as_float().ok_or_else(|| bad_receiver(ctx))?;
            Ok(Some(Value::Int(f.trunc() as i64)))
        })),
        (ValueKind::Float, "round") => Some(Builtin::new(move |ctx, _args| {
            let f = recv.read().as_float().ok_or_else(|| bad_receiver(ctx))?;
            Ok(Some(Value::Int(f.round() as i64)))
        })),

        // --- string ---
        (ValueKind::String, "len") => Some(Builtin::new(move |_ctx, _args| {
            let len = recv.read().as_str().map(|s| s.chars().count()).unwrap_or(0);
            Ok(Some(Value::Int(len as i64)))
        })),
        (ValueKind::String, "replace") => Some(Builtin::new(move |ctx, args| {
            let old = str_arg(ctx, &args, 0)?;
            let new = str_arg(ctx, &args, 1)?;
            let s = recv.read().display();
            Ok(Some(Value::String(s.replace(&old, &new))))
        })),
        (ValueKind::String, "repeat") => Some(Builtin::new(move |ctx, args| {
            let count = int_arg(ctx, &args, 0)?;
            if count < 0 {
                return Err(ctx.fatal(RuntimeError::value("repeat count must not be negative")));
            }
            let s = recv.read().display();
            Ok(Some(Value::String(s.repeat(count as usize))))
        })),
        (ValueKind::String, "split") => Some(Builtin::new(move |ctx, args| {
            let sep = str_arg(ctx, &args, 0)?;
            let s = recv.read().display();
            let parts: Vec<ValueRef> = if sep.is_empty() {
                s.chars()
                    .map(|c| value_ref(Value::String(c.to_string())))
                    .collect()
            } else {
                s.split(&sep)
                    .map(|part| value_ref(Value::String(part.to_string())))
                    .collect()
            };
            Ok(Some(Value::List(parts)))
        })),
        (ValueKind::String, "contains") => Some(Builtin::new(move |ctx, args| {
            let needle = str_arg(ctx, &args, 0)?;
            let s = recv.read().display();
            Ok(Some(Value::Bool(s.contains(&needle))))
        })),
        (ValueKind::String, "to_lower") => Some(Builtin::new(move |_ctx, _args| {
            Ok(Some(Value::String(recv.read().display().to_lowercase())))
        })),
        (ValueKind::String, "to_upper") => Some(Builtin::new(move |_ctx, _args| {
            Ok(Some(Value::String(recv.read().display().to_uppercase())))
        })),
        (ValueKind::String, "parse_int") => Some(Builtin::new(move |ctx, _args| {
            let s = recv.read().display();
            match s.trim().parse::<i64>() {
                Ok(i) => Ok(Some(Value::Int(i))),
                Err(_) => Err(ctx.throw(format!("cannot parse `{}` to int", s))),
            }
        })),
        (ValueKind::String, "parse_float") => Some(Builtin::new(move |ctx, _args| {
            let s = recv.read().display();
            match s.trim().parse::<f64>() {
                Ok(f) => Ok(Some(Value::Float(f))),
                Err(_) => Err(ctx.throw(format!("cannot parse `{}` to float", s))),
            }
        })),
        (ValueKind::String, "parse_bool") => Some(Builtin::new(move |ctx, _args| {
            let s = recv.read().display();
            match s.trim() {
                "true" | "on" => Ok(Some(Value::Bool(true))),
                "false" | "off" => Ok(Some(Value::Bool(false))),
                other => Err(ctx.throw(format!("cannot parse `{}` to bool", other))),
            }
        })),
        (ValueKind::String, "parse_json") => Some(Builtin::new(move |ctx, _args| {
            let s = recv.read().display();
            json::parse(&s).map(Some).map_err(|err| ctx.fatal(err))
        })),

        // --- option ---
        (ValueKind::Option, "is_some") => Some(Builtin::new(move |_ctx, _args| {
            let is_some = matches!(&*recv.read(), Value::Option(Some(_)));
            Ok(Some(Value::Bool(is_some)))
        })),
        (ValueKind::Option, "is_none") => Some(Builtin::new(move |_ctx, _args| {
            let is_none = matches!(&*recv.read(), Value::Option(None));
            Ok(Some(Value::Bool(is_none)))
        })),
        (ValueKind::Option, "unwrap") => Some(Builtin::new(move |ctx, _args| {
            match &*recv.read() {
                Value::Option(Some(inner)) => Ok(Some(inner.read().clone())),
                _ => Err(ctx.fatal_kind(
                    FatalKind::OptionUnwrapError,
                    "called `unwrap` on a none value",
                )),
            }
        })),
        (ValueKind::Option, "unwrap_or") => Some(Builtin::new(move |ctx, args| {
            let fallback = arg(ctx, &args, 0)?;
            match &*recv.read() {
                Value::Option(Some(inner)) => Ok(Some(inner.read().clone())),
                _ => Ok(Some(fallback.read().clone())),
            }
        })),
        (ValueKind::Option, "expect") => Some(Builtin::new(move |ctx, args| {
            let message = str_arg(ctx, &args, 0)?;
            match &*recv.read() {
                Value::Option(Some(inner)) => Ok(Some(inner.read().clone())),
                _ => Err(ctx.fatal_kind(FatalKind::OptionUnwrapError, message)),
            }
        })),

        // --- range ---
        (ValueKind::Range, "start") => Some(Builtin::new(move |ctx, _args| {
            let Value::Range { start, .. } = *recv.read() else {
                return Err(bad_receiver(ctx));
            };
            Ok(Some(Value::Int(start)))
        })),
        (ValueKind::Range, "end") => Some(Builtin::new(move |ctx, _args| {
            let Value::Range { end, .. } = *recv.read() else {
                return Err(bad_receiver(ctx));
            };
            Ok(Some(Value::Int(end)))
        })),
        (ValueKind::Range, "diff") => Some(Builtin::new(move |ctx, _args| {
            let Value::Range { start, end, .. } = *recv.read() else {
                return Err(bad_receiver(ctx));
            };
            Ok(Some(Value::Int((end - start).abs())))
        })),
        (ValueKind::Range, "rev") => Some(Builtin::new(move |ctx, _args| {
            let Value::Range {
                start,
                end,
                end_inclusive,
            } = *recv.read()
            else {
                return Err(bad_receiver(ctx));
            };
            let reversed = if end_inclusive {
                Value::Range {
                    start: end,
                    end: start,
                    end_inclusive: true,
                }
            } else if start < end {
                Value::Range {
                    start: end - 1,
                    end: start,
                    end_inclusive: true,
                }
            } else if start > end {
                Value::Range {
                    start: end + 1,
                    end: start,
                    end_inclusive: true,
                }
            } else {
                Value::Range {
                    start,
                    end,
                    end_inclusive: false,
                }
            };
            Ok(Some(reversed))
        })),

        // --- object / any-object ---
        (ValueKind::Object | ValueKind::AnyObject, "keys") => {
            Some(Builtin::new(move |_ctx, _args| {
                let keys = match &*recv.read() {
                    Value::Object(fields) | Value::AnyObject(fields) => fields
                        .iter()
                        .map(|(name, _)| value_ref(Value::String(name.clone())))
                        .collect(),
                    _ => Vec::new(),
                };
                Ok(Some(Value::List(keys)))
            }))
        }
        (
            ValueKind::Object | ValueKind::AnyObject | ValueKind::List,
            method @ ("to_json" | "to_json_indent"),
        ) => {
            let pretty = method == "to_json_indent";
            Some(Builtin::new(move |ctx, _args| {
                json::to_json_string(&recv.read(), pretty)
                    .map(|text| Some(Value::String(text)))
                    .map_err(|err| ctx.fatal(err))
            }))
        }
        (ValueKind::AnyObject, "set") => Some(Builtin::new(move |ctx, args| {
            let key = str_arg(ctx, &args, 0)?;
            let new_value = arg(ctx, &args, 1)?;
            let mut guard = recv.write();
            if let Value::AnyObject(fields) = &mut *guard {
                match fields.iter_mut().find(|(name, _)| *name == key) {
                    Some((_, slot)) => *slot = new_value,
                    None => fields.push((key, new_value)),
                }
            }
            Ok(None)
        })),
        (ValueKind::AnyObject, "get") => Some(Builtin::new(move |ctx, args| {
            let key = str_arg(ctx, &args, 0)?;
            let found = match &*recv.read() {
                Value::AnyObject(fields) => fields
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, handle)| handle.clone()),
                _ => None,
            };
            Ok(Some(Value::Option(found)))
        })),
        (ValueKind::AnyObject, "get_type") => Some(Builtin::new(move |ctx, args| {
            let key = str_arg(ctx, &args, 0)?;
            let found = match &*recv.read() {
                Value::AnyObject(fields) => fields
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, handle)| value_ref(Value::String(handle.read().kind().to_string()))),
                _ => None,
            };
            Ok(Some(Value::Option(found)))
        })),

        // --- list ---
        (ValueKind::List, "len") => Some(Builtin::new(move |_ctx, _args| {
            let len = match &*recv.read() {
                Value::List(items) => items.len(),
                _ => 0,
            };
            Ok(Some(Value::Int(len as i64)))
        })),
        (ValueKind::List, "contains") => Some(Builtin::new(move |ctx, args| {
            let needle = arg(ctx, &args, 0)?;
            let found = match &*recv.read() {
                Value::List(items) => items
                    .iter()
                    .any(|item| item.read().is_equal(&needle.read())),
                _ => false,
            };
            Ok(Some(Value::Bool(found)))
        })),
        (ValueKind::List, "join") => Some(Builtin::new(move |ctx, args| {
            let sep = str_arg(ctx, &args, 0)?;
            let parts: Vec<String> = match &*recv.read() {
                Value::List(items) => items.iter().map(|item| item.read().display()).collect(),
                _ => Vec::new(),
            };
            Ok(Some(Value::String(parts.join(&sep))))
        })),
        (ValueKind::List, "push") => Some(Builtin::new(move |ctx, args| {
            let element = arg(ctx, &args, 0)?;
            if let Value::List(items) = &mut *recv.write() {
                items.push(element);
            }
            Ok(None)
        })),
        (ValueKind::List, "pop") => Some(Builtin::new(move |_ctx, _args| {
            let popped = match &mut *recv.write() {
                Value::List(items) => items.pop(),
                _ => None,
            };
            Ok(Some(Value::Option(popped)))
        })),

        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn arg(ctx: &HostCtx<'_>, args: &[ValueRef], index: usize) -> Result<ValueRef, Interrupt> {
    args.get(index).cloned().ok_or_else(|| {
        ctx.fatal(RuntimeError::value(format!(
            "missing argument {}",
            index + 1
        )))
    })
}

fn str_arg(ctx: &HostCtx<'_>, args: &[ValueRef], index: usize) -> Result<String, Interrupt> {
    let handle = arg(ctx, args, index)?;
    let guard = handle.read();
    guard.as_str().map(str::to_string).ok_or_else(|| {
        ctx.fatal(RuntimeError::value(format!(
            "argument {} must be a str, got {}",
            index + 1,
            guard.kind()
        )))
    })
}

fn int_arg(ctx: &HostCtx<'_>, args: &[ValueRef], index: usize) -> Result<i64, Interrupt> {
    let handle = arg(ctx, args, index)?;
    let guard = handle.read();
    guard.as_int().ok_or_else(|| {
        ctx.fatal(RuntimeError::value(format!(
            "argument {} must be an int, got {}",
            index + 1,
            guard.kind()
        )))
    })
}

fn bad_receiver(ctx: &HostCtx<'_>) -> Interrupt {
    ctx.fatal(RuntimeError::value("method receiver changed kind"))
}

/// Cast helper used by invocation validation; re-exported here so the VM and
/// the harness share one spelling.
pub fn cast_value(
    value: &Value,
    target: &crate::ast::Type,
    allow: bool,
) -> Result<Value, RuntimeError> {
    deep_cast(value, target, allow)
        .map_err(|err| RuntimeError::new(FatalKind::CastError, err.to_string()))
}
