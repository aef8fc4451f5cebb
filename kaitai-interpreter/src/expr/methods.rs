//! Method and pseudo-property dispatch for primitive receivers.
//!
//! Dispatch is a static match over `(receiver kind, method name)` and fails
//! closed: an unknown combination is a `ParseError`, never a silent `nil`.
//! Zero-argument methods double as properties (`x.length`, `x.to_i`).

use crate::errors::{Error, Result};
use crate::expr::eval::compare_values;
use crate::stream::decode_bytes;
use crate::value::Value;
use std::cmp::Ordering;

pub fn call(recv: &Value, name: &str, args: &[Value]) -> Result<Value> {
    match recv {
        Value::Int(_) | Value::BigInt(_) | Value::Enum(_) => int_method(recv, name, args),
        Value::Float(f) => float_method(*f, name, args),
        Value::Bool(b) => bool_method(*b, name, args),
        Value::Str(s) => str_method(s, name, args),
        Value::Bytes(b) => bytes_method(b, name, args),
        Value::Array(items) => array_method(items, name, args),
        other => Err(unknown(other, name)),
    }
}

fn unknown(recv: &Value, name: &str) -> Error {
    Error::parse(format!(
        "unknown method `{name}` on {}",
        recv.kind_name()
    ))
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if (min..=max).contains(&args.len()) {
        Ok(())
    } else {
        Err(Error::parse(format!(
            "method `{name}` takes {min}..={max} arguments, got {}",
            args.len()
        )))
    }
}

fn int_arg(name: &str, v: &Value) -> Result<i64> {
    v.as_int()
        .ok_or_else(|| Error::parse(format!("method `{name}` expects an integer argument")))
}

fn str_arg<'a>(name: &'a str, v: &'a Value) -> Result<&'a str> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(Error::parse(format!(
            "method `{name}` expects a string argument, got {}",
            other.kind_name()
        ))),
    }
}

/// String form of a value, as used by `.to_s` and string concatenation.
pub(crate) fn stringify(v: &Value) -> Result<String> {
    match v {
        Value::Int(i) => Ok(i.to_string()),
        Value::BigInt(b) => Ok(b.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Str(s) => Ok(s.to_string()),
        Value::Enum(e) => Ok(match &e.label {
            Some(label) => label.to_string(),
            None => e.value.to_string(),
        }),
        other => Err(Error::parse(format!(
            "cannot convert {} to string",
            other.kind_name()
        ))),
    }
}

fn int_method(recv: &Value, name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "to_s" => {
            arity(name, args, 0, 0)?;
            Ok(Value::string(stringify(recv)?))
        }
        "to_i" => {
            arity(name, args, 0, 0)?;
            match recv {
                Value::Enum(e) => Ok(Value::Int(e.value)),
                other => Ok(other.clone()),
            }
        }
        _ => Err(unknown(recv, name)),
    }
}

fn float_method(f: f64, name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "to_i" => {
            arity(name, args, 0, 0)?;
            Ok(Value::Int(f.trunc() as i64))
        }
        "to_s" => {
            arity(name, args, 0, 0)?;
            Ok(Value::string(f.to_string()))
        }
        _ => Err(unknown(&Value::Float(f), name)),
    }
}

fn bool_method(b: bool, name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "to_i" => {
            arity(name, args, 0, 0)?;
            Ok(Value::Int(b as i64))
        }
        _ => Err(unknown(&Value::Bool(b), name)),
    }
}

fn str_method(s: &str, name: &str, args: &[Value]) -> Result<Value> {
    let chars: Vec<char> = s.chars().collect();
    match name {
        "length" | "size" => {
            arity(name, args, 0, 0)?;
            Ok(Value::Int(chars.len() as i64))
        }
        "to_s" => {
            arity(name, args, 0, 0)?;
            Ok(Value::string(s))
        }
        "to_i" => {
            arity(name, args, 0, 1)?;
            let base = match args.first() {
                Some(v) => int_arg(name, v)? as u32,
                None => 10,
            };
            if !(2..=36).contains(&base) {
                return Err(Error::parse(format!("to_i base {base} out of range")));
            }
            i64::from_str_radix(s.trim(), base)
                .map(Value::Int)
                .map_err(|_| Error::parse(format!("cannot parse {s:?} as base-{base} integer")))
        }
        "reverse" => {
            arity(name, args, 0, 0)?;
            Ok(Value::string(chars.iter().rev().collect::<String>()))
        }
        "first" | "last" => {
            arity(name, args, 0, 0)?;
            let c = if name == "first" {
                chars.first()
            } else {
                chars.last()
            };
            c.map(|c| Value::string(c.to_string()))
                .ok_or_else(|| Error::parse("`first`/`last` on empty string"))
        }
        "min" | "max" => {
            arity(name, args, 0, 0)?;
            let c = if name == "min" {
                chars.iter().min()
            } else {
                chars.iter().max()
            };
            c.map(|c| Value::string(c.to_string()))
                .ok_or_else(|| Error::parse("`min`/`max` on empty string"))
        }
        "sort" => {
            arity(name, args, 0, 0)?;
            let mut sorted = chars;
            sorted.sort_unstable();
            Ok(Value::string(sorted.into_iter().collect::<String>()))
        }
        "substring" | "slice" => {
            arity(name, args, 1, 2)?;
            let (start, end) = slice_bounds(name, args, chars.len())?;
            Ok(Value::string(chars[start..end].iter().collect::<String>()))
        }
        "upcase" => {
            arity(name, args, 0, 0)?;
            Ok(Value::string(s.to_uppercase()))
        }
        "downcase" => {
            arity(name, args, 0, 0)?;
            Ok(Value::string(s.to_lowercase()))
        }
        "capitalize" => {
            arity(name, args, 0, 0)?;
            let mut cs = s.chars();
            let out = match cs.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &cs.as_str().to_lowercase(),
                None => String::new(),
            };
            Ok(Value::string(out))
        }
        "strip" => {
            arity(name, args, 0, 0)?;
            Ok(Value::string(s.trim()))
        }
        "lstrip" => {
            arity(name, args, 0, 0)?;
            Ok(Value::string(s.trim_start()))
        }
        "rstrip" => {
            arity(name, args, 0, 0)?;
            Ok(Value::string(s.trim_end()))
        }
        "starts_with" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(s.starts_with(str_arg(name, &args[0])?)))
        }
        "ends_with" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(s.ends_with(str_arg(name, &args[0])?)))
        }
        "split" => {
            arity(name, args, 1, 1)?;
            let sep = str_arg(name, &args[0])?;
            let parts = s.split(sep).map(Value::string).collect();
            Ok(Value::array(parts))
        }
        "replace" => {
            arity(name, args, 2, 2)?;
            let from = str_arg(name, &args[0])?;
            let to = str_arg(name, &args[1])?;
            Ok(Value::string(s.replacen(from, to, 1)))
        }
        "replace_all" => {
            arity(name, args, 2, 2)?;
            let from = str_arg(name, &args[0])?;
            let to = str_arg(name, &args[1])?;
            Ok(Value::string(s.replace(from, to)))
        }
        "pad_left" | "pad_right" => {
            arity(name, args, 1, 2)?;
            let width = int_arg(name, &args[0])?;
            let width = usize::try_from(width)
                .map_err(|_| Error::parse(format!("negative pad width {width}")))?;
            let fill = match args.get(1) {
                Some(v) => {
                    let f = str_arg(name, v)?;
                    f.chars()
                        .next()
                        .ok_or_else(|| Error::parse("pad fill must not be empty"))?
                }
                None => ' ',
            };
            if chars.len() >= width {
                return Ok(Value::string(s));
            }
            let pad: String = std::iter::repeat(fill).take(width - chars.len()).collect();
            Ok(Value::string(if name == "pad_left" {
                pad + s
            } else {
                s.to_string() + &pad
            }))
        }
        "includes" | "contains" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(s.contains(str_arg(name, &args[0])?)))
        }
        "index_of" => {
            arity(name, args, 1, 1)?;
            let needle = str_arg(name, &args[0])?;
            let at = match s.find(needle) {
                Some(byte_idx) => s[..byte_idx].chars().count() as i64,
                None => -1,
            };
            Ok(Value::Int(at))
        }
        _ => Err(unknown(&Value::string(s), name)),
    }
}

fn bytes_method(bytes: &[u8], name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "length" | "size" => {
            arity(name, args, 0, 0)?;
            Ok(Value::Int(bytes.len() as i64))
        }
        "first" | "last" => {
            arity(name, args, 0, 0)?;
            let b = if name == "first" {
                bytes.first()
            } else {
                bytes.last()
            };
            b.map(|b| Value::Int(*b as i64))
                .ok_or_else(|| Error::parse("`first`/`last` on empty byte sequence"))
        }
        "min" | "max" => {
            arity(name, args, 0, 0)?;
            let b = if name == "min" {
                bytes.iter().min()
            } else {
                bytes.iter().max()
            };
            b.map(|b| Value::Int(*b as i64))
                .ok_or_else(|| Error::parse("`min`/`max` on empty byte sequence"))
        }
        "reverse" => {
            arity(name, args, 0, 0)?;
            Ok(Value::bytes(bytes.iter().rev().copied().collect()))
        }
        "sort" => {
            arity(name, args, 0, 0)?;
            let mut sorted = bytes.to_vec();
            sorted.sort_unstable();
            Ok(Value::bytes(sorted))
        }
        "slice" => {
            arity(name, args, 1, 2)?;
            let (start, end) = slice_bounds(name, args, bytes.len())?;
            Ok(Value::bytes(bytes[start..end].to_vec()))
        }
        "includes" | "contains" => {
            arity(name, args, 1, 1)?;
            let needle = int_arg(name, &args[0])?;
            Ok(Value::Bool(bytes.iter().any(|b| *b as i64 == needle)))
        }
        "index_of" => {
            arity(name, args, 1, 1)?;
            let needle = int_arg(name, &args[0])?;
            let at = bytes
                .iter()
                .position(|b| *b as i64 == needle)
                .map(|i| i as i64)
                .unwrap_or(-1);
            Ok(Value::Int(at))
        }
        "to_s" => {
            arity(name, args, 1, 1)?;
            let encoding = str_arg(name, &args[0])?;
            Ok(Value::string(decode_bytes(bytes, encoding)?))
        }
        _ => Err(unknown(&Value::bytes(bytes.to_vec()), name)),
    }
}

fn array_method(items: &[Value], name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "length" | "size" => {
            arity(name, args, 0, 0)?;
            Ok(Value::Int(items.len() as i64))
        }
        "first" | "last" => {
            arity(name, args, 0, 0)?;
            let v = if name == "first" {
                items.first()
            } else {
                items.last()
            };
            v.cloned()
                .ok_or_else(|| Error::parse("`first`/`last` on empty array"))
        }
        "min" | "max" => {
            arity(name, args, 0, 0)?;
            let mut iter = items.iter();
            let mut best = iter
                .next()
                .ok_or_else(|| Error::parse("`min`/`max` on empty array"))?;
            for v in iter {
                let ord = compare_values(v, best)?;
                let better = if name == "min" {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };
                if better {
                    best = v;
                }
            }
            Ok(best.clone())
        }
        "reverse" => {
            arity(name, args, 0, 0)?;
            Ok(Value::array(items.iter().rev().cloned().collect()))
        }
        "sort" => {
            arity(name, args, 0, 0)?;
            let mut sorted = items.to_vec();
            let mut failure = None;
            sorted.sort_by(|a, b| match compare_values(a, b) {
                Ok(ord) => ord,
                Err(e) => {
                    failure.get_or_insert(e);
                    Ordering::Equal
                }
            });
            match failure {
                Some(e) => Err(e),
                None => Ok(Value::array(sorted)),
            }
        }
        "slice" => {
            arity(name, args, 1, 2)?;
            let (start, end) = slice_bounds(name, args, items.len())?;
            Ok(Value::array(items[start..end].to_vec()))
        }
        "includes" | "contains" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(items.iter().any(|v| {
                crate::expr::eval::values_equal(v, &args[0])
            })))
        }
        "index_of" => {
            arity(name, args, 1, 1)?;
            let at = items
                .iter()
                .position(|v| crate::expr::eval::values_equal(v, &args[0]))
                .map(|i| i as i64)
                .unwrap_or(-1);
            Ok(Value::Int(at))
        }
        _ => Err(unknown(&Value::array(items.to_vec()), name)),
    }
}

/// Normalizes `slice`/`substring` bounds the way the expression language
/// defines them: negative indices count from the end, everything clamps.
fn slice_bounds(name: &str, args: &[Value], len: usize) -> Result<(usize, usize)> {
    let norm = |raw: i64| -> usize {
        let idx = if raw < 0 { raw + len as i64 } else { raw };
        idx.clamp(0, len as i64) as usize
    };
    let start = norm(int_arg(name, &args[0])?);
    let end = match args.get(1) {
        Some(v) => norm(int_arg(name, v)?),
        None => len,
    };
    Ok((start, start.max(end)))
}
