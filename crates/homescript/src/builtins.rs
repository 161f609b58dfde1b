//! Default scope additions and host reducers wired into every VM.
//!
//! These wrap the executor: `print`/`println`/`debug` feed its string sink,
//! `assert`/`assert_eq` raise catchable exceptions, `exit` produces the
//! structured exit interrupt. The `sys` builtin module exposes `time` with
//! `now`, `add_days`, and a cancellation-aware `sleep`. The host-call table
//! carries the list-push reducer that list literals lower onto.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::compiler::LIST_PUSH;
use crate::error::{Interrupt, RuntimeError};
use crate::executor::HostCtx;
use crate::value::{Builtin, BuiltinFn, Value, ValueRef, value_ref};

/// Globals published under their plain source names.
pub fn scope_additions() -> HashMap<String, Value> {
    let mut additions = HashMap::new();

    additions.insert(
        "print".to_string(),
        builtin(|ctx, args| {
            ctx.executor
                .write_string(&join_args(&args))
                .map_err(|err| ctx.host_err(err))?;
            Ok(None)
        }),
    );
    additions.insert(
        "println".to_string(),
        builtin(|ctx, args| {
            let mut text = join_args(&args);
            text.push('\n');
            ctx.executor
                .write_string(&text)
                .map_err(|err| ctx.host_err(err))?;
            Ok(None)
        }),
    );
    additions.insert(
        "debug".to_string(),
        builtin(|ctx, args| {
            let mut text = join_args(&args);
            tracing::debug!(target: "homescript::script", "{}", text);
            text.push('\n');
            ctx.executor
                .write_string(&text)
                .map_err(|err| ctx.host_err(err))?;
            Ok(None)
        }),
    );

    additions.insert(
        "assert".to_string(),
        builtin(|ctx, args| {
            let passed = args
                .first()
                .and_then(|arg| arg.read().as_bool())
                .unwrap_or(false);
            if !passed {
                return Err(ctx.throw("assertion failed"));
            }
            Ok(None)
        }),
    );
    additions.insert(
        "assert_eq".to_string(),
        builtin(|ctx, args| {
            let (Some(lhs), Some(rhs)) = (args.first(), args.get(1)) else {
                return Err(ctx.fatal(RuntimeError::value("assert_eq takes two arguments")));
            };
            if !lhs.read().is_equal(&rhs.read()) {
                return Err(ctx.throw(format!(
                    "assertion failed: `{}` != `{}`",
                    lhs.read().display(),
                    rhs.read().display()
                )));
            }
            Ok(None)
        }),
    );

    additions.insert(
        "exit".to_string(),
        builtin(|ctx, args| {
            let code = args
                .first()
                .and_then(|arg| arg.read().as_int())
                .ok_or_else(|| ctx.fatal(RuntimeError::value("exit requires an int code")))?;
            Err(Interrupt::Exit(code))
        }),
    );

    additions
}

/// Host reducers reachable through `HostCall`.
pub fn host_calls() -> HashMap<String, BuiltinFn> {
    let mut calls: HashMap<String, BuiltinFn> = HashMap::new();

    // `__internal_list_push(element, list) -> list`; arguments arrive in
    // popped order (element first, the list below it).
    calls.insert(
        LIST_PUSH.to_string(),
        Builtin::new(|ctx: &HostCtx<'_>, args: Vec<ValueRef>| {
            let (Some(element), Some(list)) = (args.first(), args.get(1)) else {
                return Err(ctx.fatal(RuntimeError::value("list push requires two arguments")));
            };
            {
                let mut guard = list.write();
                match &mut *guard {
                    Value::List(items) => items.push(element.clone()),
                    other => {
                        return Err(ctx.fatal(RuntimeError::value(format!(
                            "cannot push onto value of type {}",
                            other.kind()
                        ))));
                    }
                }
            }
            Ok(Some(list.read().clone()))
        })
        .0,
    );

    calls
}

/// Members of the VM-provided builtin modules, keyed by `(module, item)`.
pub fn builtin_imports() -> HashMap<(String, String), Value> {
    let mut imports = HashMap::new();
    imports.insert(
        ("sys".to_string(), "time".to_string()),
        time_module(),
    );
    imports
}

fn time_module() -> Value {
    let mut fields: Vec<(String, ValueRef)> = Vec::new();

    fields.push((
        "now".to_string(),
        value_ref(builtin(|_ctx, _args| {
            let unix_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as i64)
                .unwrap_or(0);
            Ok(Some(time_object(unix_ms)))
        })),
    ));

    fields.push((
        "add_days".to_string(),
        value_ref(builtin(|ctx, args| {
            let unix_ms = args
                .first()
                .and_then(|arg| match &*arg.read() {
                    Value::Object(fields) => fields
                        .iter()
                        .find(|(name, _)| name == "unix_ms")
                        .and_then(|(_, value)| value.read().as_int()),
                    _ => None,
                })
                .ok_or_else(|| {
                    ctx.fatal(RuntimeError::value("add_days requires a time object"))
                })?;
            let days = args
                .get(1)
                .and_then(|arg| arg.read().as_int())
                .ok_or_else(|| ctx.fatal(RuntimeError::value("add_days requires an int")))?;
            Ok(Some(time_object(unix_ms + days * 86_400_000)))
        })),
    ));

    fields.push((
        "sleep".to_string(),
        value_ref(builtin(|ctx, args| {
            let seconds = match args.first().map(|arg| arg.read().clone()) {
                Some(Value::Int(i)) => i as f64,
                Some(Value::Float(f)) => f,
                _ => {
                    return Err(ctx.fatal(RuntimeError::value("sleep requires a number")));
                }
            };
            let duration = Duration::from_secs_f64(seconds.max(0.0));
            if !ctx.cancel.sleep(duration) {
                let reason = ctx
                    .cancel
                    .cause()
                    .unwrap_or_else(|| "cancelled".to_string());
                return Err(Interrupt::Termination {
                    reason,
                    span: ctx.span.clone(),
                });
            }
            Ok(None)
        })),
    ));

    Value::Object(fields)
}

fn time_object(unix_ms: i64) -> Value {
    Value::Object(vec![(
        "unix_ms".to_string(),
        value_ref(Value::Int(unix_ms)),
    )])
}

fn builtin<F>(f: F) -> Value
where
    F: Fn(&HostCtx<'_>, Vec<ValueRef>) -> Result<Option<Value>, Interrupt>
        + Send
        + Sync
        + 'static,
{
    Value::BuiltinFunction(Builtin::new(f))
}

fn join_args(args: &[ValueRef]) -> String {
    args.iter()
        .map(|arg| arg.read().display())
        .collect::<Vec<_>>()
        .join(" ")
}
