//! Tree-walking evaluator for the expression AST.
//!
//! Evaluation is pure with respect to streams and the node tree: name and
//! enum resolution go through [`Context`], which may force lazy instances
//! but performs no other side effects. Numeric behavior:
//!
//! - integer ops stay in `i64` until they overflow, then promote to BigInt;
//!   mixed BigInt/int arithmetic promotes to BigInt, floats widen both;
//! - `/` on integers is floor division, `%` is floored modulo (result takes
//!   the sign of the divisor, so `(-7) % 3 == 2`);
//! - `+` concatenates when either operand is a string;
//! - `==`/`!=` use deep equality for arrays and byte sequences.

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::expr::methods;
use crate::expr::parser::{BinaryOp, Expr, UnaryOp};
use crate::value::Value;
use num_bigint::BigInt;
use num_traits::cast::ToPrimitive;
use num_traits::Zero;
use std::cmp::Ordering;

pub fn eval(expr: &Expr, ctx: &mut Context) -> Result<Value> {
    match expr {
        Expr::Int(v) => Ok(Value::Int(*v)),
        Expr::BigInt(v) => Ok(Value::BigInt(v.clone())),
        Expr::Float(v) => Ok(Value::Float(*v)),
        Expr::Str(s) => Ok(Value::string(s)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx)?);
            }
            Ok(Value::array(out))
        }
        Expr::Ident(name) => ctx.lookup_ident(name),
        Expr::EnumRef(path) => ctx.resolve_enum_ref(path),
        Expr::Unary(op, operand) => {
            let v = eval(operand, ctx)?;
            apply_unary(*op, v)
        }
        Expr::Binary(BinaryOp::And, l, r) => {
            if expect_bool(eval(l, ctx)?)? {
                Ok(Value::Bool(expect_bool(eval(r, ctx)?)?))
            } else {
                Ok(Value::Bool(false))
            }
        }
        Expr::Binary(BinaryOp::Or, l, r) => {
            if expect_bool(eval(l, ctx)?)? {
                Ok(Value::Bool(true))
            } else {
                Ok(Value::Bool(expect_bool(eval(r, ctx)?)?))
            }
        }
        Expr::Binary(op, l, r) => {
            let lv = eval(l, ctx)?;
            let rv = eval(r, ctx)?;
            apply_binary(*op, &lv, &rv)
        }
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if expect_bool(eval(cond, ctx)?)? {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }
        Expr::Member(recv, name) => {
            let rv = eval(recv, ctx)?;
            member(&rv, name, ctx)
        }
        Expr::Call(recv, name, args) => {
            let rv = eval(recv, ctx)?;
            let mut argv = Vec::with_capacity(args.len());
            for a in args {
                argv.push(eval(a, ctx)?);
            }
            match &rv {
                Value::Object(_) | Value::Stream(_) => Err(Error::parse(format!(
                    "`{name}` is not callable on {}",
                    rv.kind_name()
                ))),
                _ => methods::call(&rv, name, &argv),
            }
        }
        Expr::Index(recv, idx) => {
            let rv = eval(recv, ctx)?;
            let iv = eval(idx, ctx)?;
            index(&rv, &iv)
        }
    }
}

fn member(recv: &Value, name: &str, ctx: &mut Context) -> Result<Value> {
    match recv {
        Value::Object(id) => ctx.object_member(*id, name),
        Value::Stream(s) => {
            let s = s.borrow();
            match name {
                "pos" => Ok(Value::Int(s.pos() as i64)),
                "size" => Ok(Value::Int(s.size() as i64)),
                "eof" => Ok(Value::Bool(s.is_eof())),
                other => Err(Error::parse(format!("unknown stream member `{other}`"))),
            }
        }
        other => methods::call(other, name, &[]),
    }
}

fn index(recv: &Value, idx: &Value) -> Result<Value> {
    let i = idx
        .as_int()
        .ok_or_else(|| Error::parse(format!("index must be an integer, got {}", idx.kind_name())))?;
    match recv {
        Value::Array(items) => {
            let at = usize::try_from(i)
                .ok()
                .filter(|at| *at < items.len())
                .ok_or_else(|| {
                    Error::parse(format!("index {i} out of range for array of {}", items.len()))
                })?;
            Ok(items[at].clone())
        }
        Value::Bytes(bytes) => {
            let at = usize::try_from(i)
                .ok()
                .filter(|at| *at < bytes.len())
                .ok_or_else(|| {
                    Error::parse(format!("index {i} out of range for {} bytes", bytes.len()))
                })?;
            Ok(Value::Int(bytes[at] as i64))
        }
        other => Err(Error::parse(format!("cannot index {}", other.kind_name()))),
    }
}

fn apply_unary(op: UnaryOp, v: Value) -> Result<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!expect_bool(v)?)),
        UnaryOp::Neg => match v {
            Value::Int(i) => Ok(i
                .checked_neg()
                .map(Value::Int)
                .unwrap_or_else(|| Value::BigInt(-BigInt::from(i)))),
            Value::BigInt(b) => Ok(Value::from_bigint(-b)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(Error::parse(format!("cannot negate {}", other.kind_name()))),
        },
    }
}

pub(crate) fn expect_bool(v: Value) -> Result<bool> {
    v.as_bool()
        .ok_or_else(|| Error::parse(format!("expected boolean, got {}", v.kind_name())))
}

/// The numeric view of a value, with enum tags collapsing to their integer.
enum Num {
    I(i64),
    B(BigInt),
    F(f64),
}

fn as_num(v: &Value) -> Option<Num> {
    match v {
        Value::Int(i) => Some(Num::I(*i)),
        Value::BigInt(b) => Some(Num::B(b.clone())),
        Value::Float(f) => Some(Num::F(*f)),
        Value::Enum(e) => Some(Num::I(e.value)),
        _ => None,
    }
}

fn to_f64(n: &Num) -> f64 {
    match n {
        Num::I(i) => *i as f64,
        Num::B(b) => b.to_f64().unwrap_or(f64::NAN),
        Num::F(f) => *f,
    }
}

fn to_big(n: Num) -> BigInt {
    match n {
        Num::I(i) => BigInt::from(i),
        Num::B(b) => b,
        Num::F(_) => unreachable!("float operands take the f64 path"),
    }
}

pub(crate) fn apply_binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare_values(l, r)?;
            let res = match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::Ge => ord != Ordering::Less,
                _ => unreachable!(),
            };
            return Ok(Value::Bool(res));
        }
        BinaryOp::Add => {
            if matches!(l, Value::Str(_)) || matches!(r, Value::Str(_)) {
                let mut s = methods::stringify(l)?;
                s.push_str(&methods::stringify(r)?);
                return Ok(Value::string(s));
            }
        }
        BinaryOp::And | BinaryOp::Or => {
            // Handled with short-circuiting in `eval`; direct calls apply strictly.
            let lb = expect_bool(l.clone())?;
            let rb = expect_bool(r.clone())?;
            return Ok(Value::Bool(match op {
                BinaryOp::And => lb && rb,
                _ => lb || rb,
            }));
        }
        _ => {}
    }

    let (ln, rn) = match (as_num(l), as_num(r)) {
        (Some(ln), Some(rn)) => (ln, rn),
        _ => {
            return Err(Error::parse(format!(
                "operator {op:?} not defined for {} and {}",
                l.kind_name(),
                r.kind_name()
            )))
        }
    };

    if matches!(ln, Num::F(_)) || matches!(rn, Num::F(_)) {
        let (lf, rf) = (to_f64(&ln), to_f64(&rn));
        return float_binary(op, lf, rf);
    }

    match (ln, rn) {
        (Num::I(a), Num::I(b)) => int_binary(op, a, b),
        (ln, rn) => big_binary(op, to_big(ln), to_big(rn)),
    }
}

fn float_binary(op: BinaryOp, a: f64, b: f64) -> Result<Value> {
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(Error::parse("division by zero"));
            }
            a / b
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(Error::parse("modulo by zero"));
            }
            let m = a % b;
            if m != 0.0 && (m < 0.0) != (b < 0.0) {
                m + b
            } else {
                m
            }
        }
        other => {
            return Err(Error::parse(format!(
                "operator {other:?} not defined for floats"
            )))
        }
    }))
}

fn int_binary(op: BinaryOp, a: i64, b: i64) -> Result<Value> {
    match op {
        BinaryOp::Add => Ok(a
            .checked_add(b)
            .map(Value::Int)
            .unwrap_or_else(|| Value::BigInt(BigInt::from(a) + b))),
        BinaryOp::Sub => Ok(a
            .checked_sub(b)
            .map(Value::Int)
            .unwrap_or_else(|| Value::BigInt(BigInt::from(a) - b))),
        BinaryOp::Mul => Ok(a
            .checked_mul(b)
            .map(Value::Int)
            .unwrap_or_else(|| Value::BigInt(BigInt::from(a) * b))),
        BinaryOp::Div => {
            if b == 0 {
                return Err(Error::parse("division by zero"));
            }
            let q = a / b;
            let m = a % b;
            Ok(Value::Int(if m != 0 && (m < 0) != (b < 0) {
                q - 1
            } else {
                q
            }))
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(Error::parse("modulo by zero"));
            }
            let m = a % b;
            Ok(Value::Int(if m != 0 && (m < 0) != (b < 0) {
                m + b
            } else {
                m
            }))
        }
        BinaryOp::BitAnd => Ok(Value::Int(a & b)),
        BinaryOp::BitOr => Ok(Value::Int(a | b)),
        BinaryOp::BitXor => Ok(Value::Int(a ^ b)),
        BinaryOp::Shl => {
            let shift = shift_amount(b)?;
            if shift < 64 {
                let wide = (a as i128) << shift;
                if let Ok(narrow) = i64::try_from(wide) {
                    return Ok(Value::Int(narrow));
                }
            }
            Ok(Value::from_bigint(BigInt::from(a) << shift))
        }
        BinaryOp::Shr => {
            let shift = shift_amount(b)?;
            Ok(Value::Int(a >> shift.min(63)))
        }
        other => Err(Error::parse(format!(
            "operator {other:?} not defined for integers"
        ))),
    }
}

fn big_binary(op: BinaryOp, a: BigInt, b: BigInt) -> Result<Value> {
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b.is_zero() {
                return Err(Error::parse("division by zero"));
            }
            let q = &a / &b;
            let m = &a - &q * &b;
            if !m.is_zero() && (m.sign() != b.sign()) {
                q - 1
            } else {
                q
            }
        }
        BinaryOp::Mod => {
            if b.is_zero() {
                return Err(Error::parse("modulo by zero"));
            }
            let m = &a % &b;
            if !m.is_zero() && (m.sign() != b.sign()) {
                m + b
            } else {
                m
            }
        }
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::Shl => {
            let shift = shift_amount(b.to_i64().ok_or_else(|| Error::parse("shift amount too large"))?)?;
            a << shift
        }
        BinaryOp::Shr => {
            let shift = shift_amount(b.to_i64().ok_or_else(|| Error::parse("shift amount too large"))?)?;
            a >> shift
        }
        other => {
            return Err(Error::parse(format!(
                "operator {other:?} not defined for integers"
            )))
        }
    };
    Ok(Value::from_bigint(v))
}

fn shift_amount(b: i64) -> Result<usize> {
    usize::try_from(b).map_err(|_| Error::parse(format!("negative shift amount {b}")))
}

/// Deep equality across the value kinds that support it. Mismatched kinds
/// compare unequal, except numbers (which compare numerically across
/// int/BigInt/float/enum) and byte sequences against integer arrays.
pub(crate) fn values_equal(l: &Value, r: &Value) -> bool {
    if let (Some(ln), Some(rn)) = (as_num(l), as_num(r)) {
        return num_cmp(&ln, &rn) == Some(Ordering::Equal);
    }
    match (l, r) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Bytes(a), Value::Bytes(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Bytes(bytes), Value::Array(items)) | (Value::Array(items), Value::Bytes(bytes)) => {
            bytes.len() == items.len()
                && bytes
                    .iter()
                    .zip(items.iter())
                    .all(|(b, v)| v.as_int() == Some(*b as i64))
        }
        (Value::Object(a), Value::Object(b)) => a == b,
        _ => false,
    }
}

fn num_cmp(l: &Num, r: &Num) -> Option<Ordering> {
    match (l, r) {
        (Num::I(a), Num::I(b)) => Some(a.cmp(b)),
        (Num::B(a), Num::B(b)) => Some(a.cmp(b)),
        (Num::I(a), Num::B(b)) => Some(BigInt::from(*a).cmp(b)),
        (Num::B(a), Num::I(b)) => Some(a.cmp(&BigInt::from(*b))),
        _ => to_f64(l).partial_cmp(&to_f64(r)),
    }
}

/// Ordering for `<`/`<=`/`>`/`>=` and for `min`/`max`/`sort`.
pub(crate) fn compare_values(l: &Value, r: &Value) -> Result<Ordering> {
    if let (Some(ln), Some(rn)) = (as_num(l), as_num(r)) {
        return num_cmp(&ln, &rn)
            .ok_or_else(|| Error::parse("cannot order NaN"));
    }
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Ok(a.cmp(b)),
        _ => Err(Error::parse(format!(
            "cannot order {} against {}",
            l.kind_name(),
            r.kind_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod arithmetic {
        use super::*;

        fn int_op(op: BinaryOp, a: i64, b: i64) -> Value {
            apply_binary(op, &Value::Int(a), &Value::Int(b)).unwrap()
        }

        #[test]
        fn floored_modulo() {
            assert!(matches!(int_op(BinaryOp::Mod, -7, 3), Value::Int(2)));
            assert!(matches!(int_op(BinaryOp::Mod, 7, -3), Value::Int(-2)));
            assert!(matches!(int_op(BinaryOp::Mod, 7, 3), Value::Int(1)));
        }

        #[test]
        fn floor_division() {
            assert!(matches!(int_op(BinaryOp::Div, -7, 2), Value::Int(-4)));
            assert!(matches!(int_op(BinaryOp::Div, 7, 2), Value::Int(3)));
        }

        #[test]
        fn overflow_promotes_to_bigint() {
            let v = int_op(BinaryOp::Add, i64::MAX, 1);
            assert!(matches!(v, Value::BigInt(_)));
            let v = int_op(BinaryOp::Mul, i64::MAX, 2);
            assert!(matches!(v, Value::BigInt(_)));
        }

        #[test]
        fn shift_promotes_when_wide() {
            assert!(matches!(int_op(BinaryOp::Shl, 1, 40), Value::Int(_)));
            assert!(matches!(int_op(BinaryOp::Shl, 1, 80), Value::BigInt(_)));
        }

        #[test]
        fn mixed_bigint_arithmetic() {
            let big = Value::BigInt(BigInt::from(u64::MAX));
            let v = apply_binary(BinaryOp::Add, &big, &Value::Int(1)).unwrap();
            assert!(matches!(v, Value::BigInt(_)));
            let back = apply_binary(BinaryOp::Sub, &v, &big).unwrap();
            assert!(matches!(back, Value::Int(1)));
        }

        #[test]
        fn floats_widen() {
            let v = apply_binary(BinaryOp::Add, &Value::Int(1), &Value::Float(0.5)).unwrap();
            assert!(matches!(v, Value::Float(f) if f == 1.5));
        }

        #[test]
        fn division_by_zero_fails() {
            assert!(apply_binary(BinaryOp::Div, &Value::Int(1), &Value::Int(0)).is_err());
            assert!(apply_binary(BinaryOp::Mod, &Value::Int(1), &Value::Int(0)).is_err());
        }
    }

    mod strings {
        use super::*;

        #[test]
        fn plus_concatenates_with_coercion() {
            let v = apply_binary(BinaryOp::Add, &Value::string("v"), &Value::Int(2)).unwrap();
            assert!(matches!(v, Value::Str(s) if &*s == "v2"));
        }

        #[test]
        fn lexicographic_order() {
            let v = apply_binary(BinaryOp::Lt, &Value::string("abc"), &Value::string("abd")).unwrap();
            assert!(matches!(v, Value::Bool(true)));
        }
    }

    mod equality {
        use super::*;

        #[test]
        fn numeric_across_kinds() {
            assert!(values_equal(&Value::Int(1), &Value::Float(1.0)));
            assert!(values_equal(
                &Value::Int(7),
                &Value::BigInt(BigInt::from(7))
            ));
        }

        #[test]
        fn bytes_against_int_array() {
            let bytes = Value::bytes(vec![0x4d, 0x5a]);
            let array = Value::array(vec![Value::Int(0x4d), Value::Int(0x5a)]);
            assert!(values_equal(&bytes, &array));
            let wrong = Value::array(vec![Value::Int(0x4d), Value::Int(0x00)]);
            assert!(!values_equal(&bytes, &wrong));
        }

        #[test]
        fn arrays_deep() {
            let a = Value::array(vec![Value::array(vec![Value::Int(1)])]);
            let b = Value::array(vec![Value::array(vec![Value::Int(1)])]);
            assert!(values_equal(&a, &b));
        }
    }
}
