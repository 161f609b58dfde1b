//! The runtime value model.
//!
//! Every Homescript value is one variant of the closed [`Value`] sum type.
//! Aggregates (lists, objects, any-objects, options) hold [`ValueRef`] handles
//! to their elements: `GetVarImm`, `Member`, and `Index` push the handle
//! itself, which is what lets `Assign` mutate the referenced storage and lets
//! several cores share a global aggregate behind its per-value lock.
//!
//! Cycles between aggregates are permitted; display (and JSON marshalling in
//! the `json` module) break them with a visited set.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::ast::Type;
use crate::error::{Interrupt, RuntimeError};
use crate::executor::HostCtx;

/// A shared, lock-guarded handle to one runtime value.
pub type ValueRef = Arc<RwLock<Value>>;

/// Wrap a value into a fresh handle.
pub fn value_ref(value: Value) -> ValueRef {
    Arc::new(RwLock::new(value))
}

/// The signature of a host-side callable: executor access, cancellation,
/// the call-site span (inside [`HostCtx`]) and the argument handles.
/// `Ok(None)` means the callee produced no value (its type is `null`).
pub type BuiltinFn =
    Arc<dyn Fn(&HostCtx<'_>, Vec<ValueRef>) -> Result<Option<Value>, Interrupt> + Send + Sync>;

/// A builtin function value. Equality is identity.
#[derive(Clone)]
pub struct Builtin(pub BuiltinFn);

impl Builtin {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&HostCtx<'_>, Vec<ValueRef>) -> Result<Option<Value>, Interrupt>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin-function>")
    }
}

/// A stateful iterator producing `(value, more?)` pairs.
///
/// Once `more?` turns false the iterator is exhausted; restarting is not a
/// contract. Cloning shares the underlying state.
#[derive(Clone)]
pub struct ValueIterator(Arc<Mutex<dyn FnMut() -> (ValueRef, bool) + Send>>);

impl ValueIterator {
    pub fn new<F>(step: F) -> Self
    where
        F: FnMut() -> (ValueRef, bool) + Send + 'static,
    {
        Self(Arc::new(Mutex::new(step)))
    }

    /// Advance the iterator one step.
    pub fn advance(&self) -> (ValueRef, bool) {
        (self.0.lock())()
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ValueIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<iterator>")
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A Homescript runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    List(Vec<ValueRef>),
    /// Closed key set, fixed at compile time. Pairs keep insertion order for
    /// deterministic display; equality ignores it.
    Object(Vec<(String, ValueRef)>),
    /// Open key set for dynamic / JSON-shaped data.
    AnyObject(Vec<(String, ValueRef)>),
    Option(Option<ValueRef>),
    Range {
        start: i64,
        end: i64,
        end_inclusive: bool,
    },
    Iterator(ValueIterator),
    /// A by-name reference to a compiled function.
    VmFunction(String),
    BuiltinFunction(Builtin),
}

/// Discriminant of a [`Value`], used in error messages and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Int,
    Float,
    Bool,
    String,
    List,
    Object,
    AnyObject,
    Option,
    Range,
    Iterator,
    VmFunction,
    BuiltinFunction,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Null => write!(f, "null"),
            ValueKind::Int => write!(f, "int"),
            ValueKind::Float => write!(f, "float"),
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::String => write!(f, "str"),
            ValueKind::List => write!(f, "list"),
            ValueKind::Object => write!(f, "object"),
            ValueKind::AnyObject => write!(f, "any-object"),
            ValueKind::Option => write!(f, "option"),
            ValueKind::Range => write!(f, "range"),
            ValueKind::Iterator => write!(f, "iterator"),
            ValueKind::VmFunction => write!(f, "vm-function"),
            ValueKind::BuiltinFunction => write!(f, "builtin-function"),
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Bool(_) => ValueKind::Bool,
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Object(_) => ValueKind::Object,
            Value::AnyObject(_) => ValueKind::AnyObject,
            Value::Option(_) => ValueKind::Option,
            Value::Range { .. } => ValueKind::Range,
            Value::Iterator(_) => ValueKind::Iterator,
            Value::VmFunction(_) => ValueKind::VmFunction,
            Value::BuiltinFunction(_) => ValueKind::BuiltinFunction,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The canonical display form.
    pub fn display(&self) -> String {
        let mut visited = Vec::new();
        self.display_indented(0, &mut visited)
    }

    fn display_indented(&self, indent: usize, visited: &mut Vec<usize>) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 {
                    format!("{}.0", f)
                } else {
                    f.to_string()
                }
            }
            Value::Bool(b) => b.to_string(),
            Value::String(s) => s.clone(),
            Value::List(items) => {
                let inner: Vec<String> = items
                    .iter()
                    .map(|item| Self::display_ref(item, indent, visited))
                    .collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Object(fields) | Value::AnyObject(fields) => {
                if fields.is_empty() {
                    return "{}".to_string();
                }
                let pad = " ".repeat((indent + 1) * 4);
                let inner: Vec<String> = fields
                    .iter()
                    .map(|(key, value)| {
                        format!(
                            "{}{}: {}",
                            pad,
                            key,
                            Self::display_ref(value, indent + 1, visited)
                        )
                    })
                    .collect();
                format!(
                    "{{\n{},\n{}}}",
                    inner.join(",\n"),
                    " ".repeat(indent * 4)
                )
            }
            Value::Option(inner) => match inner {
                Some(value) => format!("Some({})", Self::display_ref(value, indent, visited)),
                None => "none".to_string(),
            },
            Value::Range {
                start,
                end,
                end_inclusive,
            } => {
                if *end_inclusive {
                    format!("{}..={}", start, end)
                } else {
                    format!("{}..{}", start, end)
                }
            }
            Value::Iterator(_) => "<iterator>".to_string(),
            Value::VmFunction(_) => "<vm-function>".to_string(),
            Value::BuiltinFunction(_) => "<builtin-function>".to_string(),
        }
    }

    fn display_ref(handle: &ValueRef, indent: usize, visited: &mut Vec<usize>) -> String {
        let addr = Arc::as_ptr(handle) as usize;
        if visited.contains(&addr) {
            return "<cycle>".to_string();
        }
        visited.push(addr);
        let rendered = handle.read().display_indented(indent, visited);
        visited.pop();
        rendered
    }

    /// Structural equality. Containers compare element-wise, object field
    /// order is irrelevant, functions compare by identity (name for VM
    /// functions, pointer for builtins).
    pub fn is_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.read().is_equal(&y.read()))
            }
            (Value::Object(a), Value::Object(b)) | (Value::AnyObject(a), Value::AnyObject(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter()
                            .find(|(other_key, _)| other_key == key)
                            .is_some_and(|(_, other_value)| {
                                value.read().is_equal(&other_value.read())
                            })
                    })
            }
            (Value::Option(a), Value::Option(b)) => match (a, b) {
                (None, None) => true,
                (Some(x), Some(y)) => x.read().is_equal(&y.read()),
                _ => false,
            },
            (
                Value::Range {
                    start: a_start,
                    end: a_end,
                    end_inclusive: a_incl,
                },
                Value::Range {
                    start: b_start,
                    end: b_end,
                    end_inclusive: b_incl,
                },
            ) => a_start == b_start && a_end == b_end && a_incl == b_incl,
            (Value::Iterator(a), Value::Iterator(b)) => a.ptr_eq(b),
            (Value::VmFunction(a), Value::VmFunction(b)) => a == b,
            (Value::BuiltinFunction(a), Value::BuiltinFunction(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }

    /// Deep clone: scalars copy, aggregates recreate their handles
    /// recursively. Iterators and builtins share their state.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| value_ref(item.read().deep_clone()))
                    .collect(),
            ),
            Value::Object(fields) => Value::Object(Self::clone_fields(fields)),
            Value::AnyObject(fields) => Value::AnyObject(Self::clone_fields(fields)),
            Value::Option(inner) => Value::Option(
                inner
                    .as_ref()
                    .map(|value| value_ref(value.read().deep_clone())),
            ),
            other => other.clone(),
        }
    }

    fn clone_fields(fields: &[(String, ValueRef)]) -> Vec<(String, ValueRef)> {
        fields
            .iter()
            .map(|(key, value)| (key.clone(), value_ref(value.read().deep_clone())))
            .collect()
    }

    /// Create an iterator over this value.
    ///
    /// Only ranges, lists, strings, and iterators iterate; anything else is a
    /// `ValueError` (the analyzer rules it out in well-typed programs).
    pub fn make_iterator(&self) -> Result<ValueIterator, RuntimeError> {
        match self {
            Value::Range {
                start,
                end,
                end_inclusive,
            } => Ok(range_iterator(*start, *end, *end_inclusive)),
            Value::List(items) => {
                let items = items.clone();
                let mut index = 0;
                Ok(ValueIterator::new(move || {
                    if index < items.len() {
                        let item = items[index].clone();
                        index += 1;
                        (item, true)
                    } else {
                        (value_ref(Value::Null), false)
                    }
                }))
            }
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let mut index = 0;
                Ok(ValueIterator::new(move || {
                    if index < chars.len() {
                        let ch = Value::String(chars[index].to_string());
                        index += 1;
                        (value_ref(ch), true)
                    } else {
                        (value_ref(Value::Null), false)
                    }
                }))
            }
            Value::Iterator(iter) => Ok(iter.clone()),
            other => Err(RuntimeError::value(format!(
                "value of type {} is not iterable",
                other.kind()
            ))),
        }
    }

    /// The default value the compiler seeds for a declared type (used for
    /// singletons before the host instance is loaded).
    pub fn default_of(ty: &Type) -> Value {
        match ty {
            Type::Any | Type::Null => Value::Null,
            Type::Int => Value::Int(0),
            Type::Float => Value::Float(0.0),
            Type::Bool => Value::Bool(false),
            Type::String => Value::String(String::new()),
            Type::Range => Value::Range {
                start: 0,
                end: 0,
                end_inclusive: false,
            },
            Type::List(_) => Value::List(Vec::new()),
            Type::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|field| (field.name.clone(), value_ref(Value::default_of(&field.ty))))
                    .collect(),
            ),
            Type::AnyObject => Value::AnyObject(Vec::new()),
            Type::Option(_) => Value::Option(None),
            Type::Function { .. } => Value::Null,
        }
    }
}

/// Iterate a range forward or backward depending on endpoint order.
fn range_iterator(start: i64, end: i64, end_inclusive: bool) -> ValueIterator {
    let step: i64 = if end >= start { 1 } else { -1 };
    let mut current = start;
    let mut done = false;
    ValueIterator::new(move || {
        let exhausted = if done {
            true
        } else if step > 0 {
            if end_inclusive {
                current > end
            } else {
                current >= end
            }
        } else if end_inclusive {
            current < end
        } else {
            current <= end
        };
        if exhausted {
            done = true;
            return (value_ref(Value::Null), false);
        }
        let item = current;
        current += step;
        (value_ref(Value::Int(item)), true)
    })
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(values: Vec<Value>) -> Value {
        Value::List(values.into_iter().map(value_ref).collect())
    }

    #[test]
    fn test_display_scalars() {
        assert_eq!(Value::Null.display(), "null");
        assert_eq!(Value::Int(42).display(), "42");
        assert_eq!(Value::Float(2.0).display(), "2.0");
        assert_eq!(Value::Float(2.5).display(), "2.5");
        assert_eq!(Value::Bool(true).display(), "true");
        assert_eq!(Value::String("hi".into()).display(), "hi");
    }

    #[test]
    fn test_display_aggregates() {
        let list = list_of(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(list.display(), "[1, 2]");

        let object = Value::Object(vec![
            ("a".to_string(), value_ref(Value::Int(1))),
            ("b".to_string(), value_ref(Value::String("x".into()))),
        ]);
        assert_eq!(object.display(), "{\n    a: 1,\n    b: x,\n}");

        assert_eq!(
            Value::Option(Some(value_ref(Value::Int(3)))).display(),
            "Some(3)"
        );
        assert_eq!(Value::Option(None).display(), "none");
    }

    #[test]
    fn test_display_cycle_guard() {
        let inner = value_ref(Value::AnyObject(Vec::new()));
        let outer = Value::AnyObject(vec![("self".to_string(), inner.clone())]);
        *inner.write() = outer.clone();
        let rendered = outer.display();
        assert!(rendered.contains("<cycle>"));
    }

    #[test]
    fn test_equality() {
        assert!(Value::Int(1).is_equal(&Value::Int(1)));
        assert!(!Value::Int(1).is_equal(&Value::Float(1.0)));

        let a = list_of(vec![Value::Int(1), Value::Int(2)]);
        let b = list_of(vec![Value::Int(1), Value::Int(2)]);
        assert!(a.is_equal(&b));

        // Field order does not matter for objects.
        let x = Value::Object(vec![
            ("a".to_string(), value_ref(Value::Int(1))),
            ("b".to_string(), value_ref(Value::Int(2))),
        ]);
        let y = Value::Object(vec![
            ("b".to_string(), value_ref(Value::Int(2))),
            ("a".to_string(), value_ref(Value::Int(1))),
        ]);
        assert!(x.is_equal(&y));

        // NaN is not equal to itself.
        assert!(!Value::Float(f64::NAN).is_equal(&Value::Float(f64::NAN)));
    }

    #[test]
    fn test_deep_clone_is_detached() {
        let original = list_of(vec![Value::Int(1)]);
        let clone = original.deep_clone();
        if let (Value::List(a), Value::List(b)) = (&original, &clone) {
            *a[0].write() = Value::Int(99);
            assert!(b[0].read().is_equal(&Value::Int(1)));
        } else {
            panic!("expected lists");
        }
    }

    #[test]
    fn test_range_iteration_forward() {
        let range = Value::Range {
            start: 0,
            end: 3,
            end_inclusive: false,
        };
        let iter = range.make_iterator().unwrap();
        let mut seen = Vec::new();
        loop {
            let (value, more) = iter.advance();
            if !more {
                break;
            }
            seen.push(value.read().as_int().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_range_iteration_backward_inclusive() {
        let range = Value::Range {
            start: 3,
            end: 1,
            end_inclusive: true,
        };
        let iter = range.make_iterator().unwrap();
        let mut seen = Vec::new();
        loop {
            let (value, more) = iter.advance();
            if !more {
                break;
            }
            seen.push(value.read().as_int().unwrap());
        }
        assert_eq!(seen, vec![3, 2, 1]);
    }

    #[test]
    fn test_string_iteration_by_char() {
        let iter = Value::String("héj".into()).make_iterator().unwrap();
        let mut seen = Vec::new();
        loop {
            let (value, more) = iter.advance();
            if !more {
                break;
            }
            seen.push(value.read().as_str().unwrap().to_string());
        }
        assert_eq!(seen, vec!["h", "é", "j"]);
    }

    #[test]
    fn test_default_of() {
        assert!(Value::default_of(&Type::Int).is_equal(&Value::Int(0)));
        assert!(Value::default_of(&Type::Option(Box::new(Type::Int)))
            .is_equal(&Value::Option(None)));
        let object = Value::default_of(&Type::Object(vec![crate::ast::ObjectTypeField::new(
            "on",
            Type::Bool,
        )]));
        assert_eq!(object.display(), "{\n    on: false,\n}");
    }
}
