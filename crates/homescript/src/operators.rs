//! Binary, comparison, and unary operators for the value model.
//!
//! Arithmetic is defined on matching pairs only: `(int, int)` and
//! `(float, float)`; the analyzer guarantees operands match, so mixed pairs
//! are reported as value errors rather than coerced. `+` additionally
//! concatenates strings, and the bitwise operators double as logical
//! `or`/`and`/`xor` on booleans. Division and remainder by zero are fatal.

use crate::error::RuntimeError;
use crate::value::Value;

/// Binary operators backed by dedicated opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Shl,
    Shr,
    BitOr,
    BitAnd,
    BitXor,
}

/// Relational operators (`<`, `<=`, `>`, `>=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

/// Apply a binary operator to two values.
pub fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ => Err(type_mismatch("+", left, right)),
        },
        BinaryOp::Sub => numeric(left, right, "-", |a, b| Ok(a.wrapping_sub(b)), |a, b| a - b),
        BinaryOp::Mul => numeric(left, right, "*", |a, b| Ok(a.wrapping_mul(b)), |a, b| a * b),
        BinaryOp::Div => numeric(
            left,
            right,
            "/",
            |a, b| {
                a.checked_div(b)
                    .ok_or_else(|| RuntimeError::value("division by zero"))
            },
            |a, b| a / b,
        ),
        BinaryOp::Rem => numeric(
            left,
            right,
            "%",
            |a, b| {
                a.checked_rem(b)
                    .ok_or_else(|| RuntimeError::value("division by zero"))
            },
            |a, b| a % b,
        ),
        BinaryOp::Pow => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                if *b < 0 {
                    return Err(RuntimeError::value("negative integer exponent"));
                }
                let exp = u32::try_from(*b)
                    .map_err(|_| RuntimeError::value("integer exponent out of range"))?;
                a.checked_pow(exp)
                    .map(Value::Int)
                    .ok_or_else(|| RuntimeError::value("integer overflow in exponentiation"))
            }
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a.powf(*b))),
            _ => Err(type_mismatch("**", left, right)),
        },
        BinaryOp::Shl => int_shift(left, right, "<<", i64::wrapping_shl),
        BinaryOp::Shr => int_shift(left, right, ">>", i64::wrapping_shr),
        BinaryOp::BitOr => bitwise(left, right, "|", |a, b| a | b, |a, b| a || b),
        BinaryOp::BitAnd => bitwise(left, right, "&", |a, b| a & b, |a, b| a && b),
        BinaryOp::BitXor => bitwise(left, right, "^", |a, b| a ^ b, |a, b| a ^ b),
    }
}

/// Apply a relational operator, producing a boolean.
pub fn apply_compare(op: CompareOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let result = match (left, right) {
        (Value::Int(a), Value::Int(b)) => match op {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        },
        (Value::Float(a), Value::Float(b)) => match op {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        },
        _ => return Err(type_mismatch("comparison", left, right)),
    };
    Ok(Value::Bool(result))
}

/// Arithmetic negation on int/float.
pub fn negate(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(RuntimeError::value(format!(
            "cannot negate value of type {}",
            other.kind()
        ))),
    }
}

/// Logical negation on bool.
pub fn logical_not(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Bool(b) => Ok(Value::Bool(!b)),
        other => Err(RuntimeError::value(format!(
            "logical not requires bool, got {}",
            other.kind()
        ))),
    }
}

/// Bitwise complement on int.
pub fn bit_not(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Int(i) => Ok(Value::Int(!i)),
        other => Err(RuntimeError::value(format!(
            "bitwise not requires int, got {}",
            other.kind()
        ))),
    }
}

fn numeric<I, F>(
    left: &Value,
    right: &Value,
    op: &str,
    int_op: I,
    float_op: F,
) -> Result<Value, RuntimeError>
where
    I: Fn(i64, i64) -> Result<i64, RuntimeError>,
    F: Fn(f64, f64) -> f64,
{
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b).map(Value::Int),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        _ => Err(type_mismatch(op, left, right)),
    }
}

fn int_shift(
    left: &Value,
    right: &Value,
    op: &str,
    shift: fn(i64, u32) -> i64,
) -> Result<Value, RuntimeError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b < 0 {
                return Err(RuntimeError::value("negative shift amount"));
            }
            Ok(Value::Int(shift(*a, *b as u32)))
        }
        _ => Err(type_mismatch(op, left, right)),
    }
}

fn bitwise<I, B>(
    left: &Value,
    right: &Value,
    op: &str,
    int_op: I,
    bool_op: B,
) -> Result<Value, RuntimeError>
where
    I: Fn(i64, i64) -> i64,
    B: Fn(bool, bool) -> bool,
{
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(bool_op(*a, *b))),
        _ => Err(type_mismatch(op, left, right)),
    }
}

fn type_mismatch(op: &str, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::value(format!(
        "operator `{}` is not defined for {} and {}",
        op,
        left.kind(),
        right.kind()
    ))
}
