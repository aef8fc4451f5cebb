//! The type interpreter: drives a stream from a compiled schema,
//! materializing the object tree.
//!
//! Every user-type execution follows the same shape: allocate a node bound
//! to `(parent, root, io, params)`, walk the `seq` attributes in order
//! (condition, position override, effective stream, size, processing,
//! decode, `contents`/`valid` checks, enum tagging, repetition), then
//! freeze `_sizeof` and leave the declared instances behind as lazy slots.
//!
//! Failure policy: the first error aborts the parse with its original
//! position; nothing is rolled back, the partial tree is simply dropped.
//!
//! # Entry points
//!
//! - [`execute`]: parse a byte buffer as the schema's top-level type.
//! - [`force_instance`]: resolve a lazy instance on a node, memoizing the
//!   result and rejecting re-entrant (cyclic) evaluation.

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::expr::eval::{eval, expect_bool, values_equal};
use crate::expr::Expr;
use crate::process;
use crate::process::ProcessAlgo;
use crate::schema::model::{
    Attr, CompiledSchema, Endian, EndianSpec, Primitive, ProcessSpec, Repeat, SwitchType, TypeRef,
    Valid,
};
use crate::stream::{decode_bytes, BitOrder, KaitaiStream, SharedStream};
use crate::value::{EnumValue, InstanceSlot, NodeData, NodeId, ObjectArena, Value};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

/// Parses `data` as the schema's top-level type, returning the root node.
pub(crate) fn execute(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    data: Vec<u8>,
) -> Result<NodeId> {
    let io = KaitaiStream::shared(data);
    exec_user_type(schema, arena, Rc::new(Vec::new()), io, None, None, Vec::new())
}

pub(crate) fn exec_user_type(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    type_path: Rc<Vec<String>>,
    io: SharedStream,
    parent: Option<NodeId>,
    root: Option<NodeId>,
    args: Vec<Value>,
) -> Result<NodeId> {
    let ty = schema.type_at(&type_path).ok_or_else(|| {
        Error::parse(format!("unresolved type `{}`", type_path.join("::")))
    })?;
    if args.len() != ty.params.len() {
        return Err(Error::parse(format!(
            "type `{}` expects {} argument(s), got {}",
            display_type(schema, &type_path),
            ty.params.len(),
            args.len()
        )));
    }

    let params: IndexMap<String, Value> = ty
        .params
        .iter()
        .zip(args)
        .map(|(p, v)| (p.id.clone(), v))
        .collect();
    let instances: IndexMap<String, InstanceSlot> = ty
        .instances
        .keys()
        .map(|k| (k.clone(), InstanceSlot::Pending))
        .collect();

    let start_pos = io.borrow().pos();
    let prospective = NodeId(arena.len());
    let root_id = root.unwrap_or(prospective);
    let node = arena.alloc(NodeData {
        type_path: type_path.clone(),
        fields: IndexMap::new(),
        params,
        instances,
        start_pos,
        sizeof: 0,
        finalized: false,
        io: io.clone(),
        parent,
        root: root_id,
        endian: None,
    });

    for attr in &ty.seq {
        parse_attr(schema, arena, node, attr, &io)?;
    }

    let end = io.borrow().pos();
    let data = arena.get_mut(node);
    data.sizeof = end.saturating_sub(start_pos);
    data.finalized = true;
    Ok(node)
}

fn display_type(schema: &CompiledSchema, path: &[String]) -> String {
    if path.is_empty() {
        schema.meta_id().to_string()
    } else {
        path.join("::")
    }
}

fn parse_attr(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    attr: &Attr,
    io: &SharedStream,
) -> Result<()> {
    if let Some(cond) = &attr.cond {
        if !eval_bool_in(schema, arena, node, io, None, cond)? {
            return Ok(());
        }
    }
    let value = read_attr_value(schema, arena, node, attr, io)?;
    if let Some(id) = &attr.id {
        arena.get_mut(node).fields.insert(id.clone(), value);
    }
    Ok(())
}

/// Reads one attribute's value: resolves the effective stream, applies a
/// `pos` override (restoring afterwards), and runs the repeat loop.
/// Shared between `seq` parsing and positioned instances.
fn read_attr_value(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    attr: &Attr,
    io: &SharedStream,
) -> Result<Value> {
    let eff_io = match &attr.io {
        Some(expr) => {
            let v = eval_in(schema, arena, node, io, None, None, expr)?;
            match v {
                Value::Stream(s) => s,
                other => {
                    return Err(Error::parse(format!(
                        "`io` expression must yield a stream, got {}",
                        other.kind_name()
                    )))
                }
            }
        }
        None => io.clone(),
    };

    let saved_pos = match &attr.pos {
        Some(expr) => {
            let target = eval_int_in(schema, arena, node, &eff_io, None, expr)?;
            let target = u64::try_from(target)
                .map_err(|_| Error::parse(format!("negative seek position {target}")))?;
            let old = eff_io.borrow().pos();
            eff_io.borrow_mut().seek(target)?;
            Some(old)
        }
        None => None,
    };

    let result = read_with_repeat(schema, arena, node, attr, &eff_io);
    if let Some(old) = saved_pos {
        eff_io.borrow_mut().seek(old)?;
    }
    result
}

fn read_with_repeat(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    attr: &Attr,
    eff_io: &SharedStream,
) -> Result<Value> {
    match &attr.repeat {
        Repeat::None => read_one(schema, arena, node, attr, eff_io, None),
        Repeat::Expr(count_expr) => {
            let count = eval_int_in(schema, arena, node, eff_io, None, count_expr)?;
            let count = usize::try_from(count)
                .map_err(|_| Error::parse(format!("repeat count must be non-negative, got {count}")))?;
            let mut items = Vec::with_capacity(count);
            for i in 0..count {
                items.push(read_one(schema, arena, node, attr, eff_io, Some(i as i64))?);
            }
            Ok(Value::array(items))
        }
        Repeat::Until(cond) => {
            let mut items = Vec::new();
            let mut i: i64 = 0;
            loop {
                let v = read_one(schema, arena, node, attr, eff_io, Some(i))?;
                items.push(v.clone());
                let done = {
                    let mut ctx = Context::new(schema, arena, node, eff_io.clone());
                    ctx.index = Some(i);
                    ctx.elem = Some(v);
                    expect_bool(eval(cond, &mut ctx)?)?
                };
                if done {
                    break;
                }
                i += 1;
            }
            Ok(Value::array(items))
        }
        Repeat::Eos => {
            let mut items = Vec::new();
            let mut i: i64 = 0;
            while !eff_io.borrow().is_eof() {
                let before = {
                    let s = eff_io.borrow();
                    (s.pos(), s.bits_pending())
                };
                items.push(read_one(schema, arena, node, attr, eff_io, Some(i))?);
                let after = {
                    let s = eff_io.borrow();
                    (s.pos(), s.bits_pending())
                };
                if after == before && !eff_io.borrow().is_eof() {
                    return Err(Error::parse_at(
                        "repeat: eos made no progress; element consumes zero bytes",
                        before.0,
                    ));
                }
                i += 1;
            }
            Ok(Value::array(items))
        }
    }
}

fn read_one(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    attr: &Attr,
    eff_io: &SharedStream,
    index: Option<i64>,
) -> Result<Value> {
    let field_start = eff_io.borrow().pos();

    let mut value = if let Some(expected) = &attr.contents {
        let got = eff_io.borrow_mut().read_bytes(expected.len())?;
        if let Some(i) = expected.iter().zip(&got).position(|(e, g)| e != g) {
            let at = field_start + i as u64;
            let window = eff_io.borrow().context_window(at);
            return Err(Error::validation_at(
                format!(
                    "contents mismatch: expected 0x{:02x}, got 0x{:02x}",
                    expected[i], got[i]
                ),
                at,
            )
            .with_context(window));
        }
        Value::bytes(got)
    } else {
        let sized = match &attr.size {
            Some(expr) => {
                let n = eval_int_in(schema, arena, node, eff_io, index, expr)?;
                Some(u64::try_from(n).map_err(|_| {
                    Error::parse(format!("size must be non-negative, got {n}"))
                })?)
            }
            None if attr.size_eos => Some(eff_io.borrow().remaining()),
            None => None,
        };
        decode_type(schema, arena, node, attr, attr.type_ref.as_ref(), sized, eff_io, index)?
    };

    if let Some(valid) = &attr.valid {
        check_valid(schema, arena, node, valid, &value, eff_io, field_start, index)?;
    }
    if let Some(enum_ref) = &attr.enum_ref {
        value = tag_enum(schema, arena, node, enum_ref, value)?;
    }
    Ok(value)
}

#[allow(clippy::too_many_arguments)]
fn decode_type(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    attr: &Attr,
    type_ref: Option<&TypeRef>,
    sized: Option<u64>,
    eff_io: &SharedStream,
    index: Option<i64>,
) -> Result<Value> {
    match type_ref {
        None => match sized {
            Some(n) => {
                let raw = eff_io.borrow_mut().read_bytes(n as usize)?;
                let bytes = maybe_process(schema, arena, node, attr, raw, index)?;
                let bytes = match attr.terminator {
                    Some(term) => truncate_at(bytes, term, attr.include),
                    None => bytes,
                };
                Ok(Value::bytes(bytes))
            }
            None => match attr.terminator {
                Some(term) => {
                    let bytes = eff_io.borrow_mut().read_bytes_term(
                        term,
                        attr.include,
                        attr.consume,
                        attr.eos_error,
                    )?;
                    Ok(Value::bytes(bytes))
                }
                None => Err(Error::parse("attribute has neither type nor size")),
            },
        },
        Some(TypeRef::Primitive(p)) => {
            decode_primitive(schema, arena, node, attr, *p, sized, eff_io, index)
        }
        Some(TypeRef::User { name, args }) => {
            let type_path = arena.get(node).type_path.clone();
            let resolved = schema
                .resolve_type(&type_path, name)
                .ok_or_else(|| Error::parse(format!("unresolved type `{name}`")))?;
            // Type arguments evaluate left to right in the caller's scope.
            let mut argv = Vec::with_capacity(args.len());
            for a in args {
                argv.push(eval_in(schema, arena, node, eff_io, index, None, a)?);
            }
            let root = arena.get(node).root;
            let child_io = match sized {
                Some(n) => {
                    if attr.process.is_some() {
                        // Processed bytes are a logically independent
                        // region, not a view of the parent.
                        let raw = eff_io.borrow_mut().read_bytes(n as usize)?;
                        let processed = maybe_process(schema, arena, node, attr, raw, index)?;
                        KaitaiStream::shared(processed)
                    } else {
                        let (sub, end) = {
                            let s = eff_io.borrow();
                            let pos = s.pos();
                            (s.substream(pos, n)?, pos + n)
                        };
                        eff_io.borrow_mut().seek(end)?;
                        Rc::new(RefCell::new(sub))
                    }
                }
                None => eff_io.clone(),
            };
            let child = exec_user_type(
                schema,
                arena,
                Rc::new(resolved),
                child_io,
                Some(node),
                Some(root),
                argv,
            )?;
            Ok(Value::Object(child))
        }
        Some(TypeRef::Switch(sw)) => {
            match select_switch(schema, arena, node, sw, eff_io, index)? {
                Some(selected) => {
                    decode_type(schema, arena, node, attr, Some(selected), sized, eff_io, index)
                }
                None => match sized {
                    Some(n) => Ok(Value::bytes(eff_io.borrow_mut().read_bytes(n as usize)?)),
                    None => Err(Error::parse("switch matched no case and has no default")),
                },
            }
        }
    }
}

fn select_switch<'s>(
    schema: &'s CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    sw: &'s SwitchType,
    eff_io: &SharedStream,
    index: Option<i64>,
) -> Result<Option<&'s TypeRef>> {
    let on = eval_in(schema, arena, node, eff_io, index, None, &sw.on)?;
    for (key, ty) in &sw.cases {
        let key_val = eval_in(schema, arena, node, eff_io, index, None, key)?;
        if values_equal(&on, &key_val) {
            return Ok(Some(ty));
        }
    }
    Ok(sw.default.as_deref())
}

#[allow(clippy::too_many_arguments)]
fn decode_primitive(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    attr: &Attr,
    p: Primitive,
    sized: Option<u64>,
    eff_io: &SharedStream,
    index: Option<i64>,
) -> Result<Value> {
    match p {
        Primitive::Str | Primitive::StrZ => {
            let encoding = effective_encoding(schema, arena, node, attr);
            let at = eff_io.borrow().pos();
            match sized {
                Some(n) => {
                    let raw = eff_io.borrow_mut().read_bytes(n as usize)?;
                    let bytes = maybe_process(schema, arena, node, attr, raw, index)?;
                    let term = attr
                        .terminator
                        .or(matches!(p, Primitive::StrZ).then_some(0));
                    let bytes = match term {
                        Some(t) => truncate_at(bytes, t, attr.include),
                        None => bytes,
                    };
                    decode_bytes(&bytes, &encoding)
                        .map(Value::string)
                        .map_err(|e| e.or_pos(at))
                }
                None => {
                    let term = attr.terminator.unwrap_or(0);
                    eff_io
                        .borrow_mut()
                        .read_strz(&encoding, term, attr.include, attr.consume, attr.eos_error)
                        .map(Value::string)
                }
            }
        }
        Primitive::Bits(n) => {
            // The bit count is the whole width; switch cases can reach
            // here without passing the validator's size check.
            if sized.is_some() {
                return Err(Error::parse(format!(
                    "bit-field type b{n} cannot take an explicit size"
                )));
            }
            let order = effective_bit_order(schema, &arena.get(node).type_path);
            let v = eff_io.borrow_mut().read_bits_int(n, order)?;
            Ok(Value::from_u64(v))
        }
        _ => {
            let endian = match p {
                Primitive::U2(e)
                | Primitive::U4(e)
                | Primitive::U8(e)
                | Primitive::S2(e)
                | Primitive::S4(e)
                | Primitive::S8(e)
                | Primitive::F4(e)
                | Primitive::F8(e) => Some(resolved_endian(schema, arena, node, e, index)?),
                _ => None,
            };
            let mut s = eff_io.borrow_mut();
            use Endian::{Be, Le};
            use Primitive::*;
            Ok(match (p, endian) {
                (U1, _) => Value::Int(s.read_u1()? as i64),
                (S1, _) => Value::Int(s.read_s1()? as i64),
                (U2(_), Some(Le)) => Value::Int(s.read_u2le()? as i64),
                (U2(_), Some(Be)) => Value::Int(s.read_u2be()? as i64),
                (U4(_), Some(Le)) => Value::Int(s.read_u4le()? as i64),
                (U4(_), Some(Be)) => Value::Int(s.read_u4be()? as i64),
                (U8(_), Some(Le)) => Value::from_u64(s.read_u8le()?),
                (U8(_), Some(Be)) => Value::from_u64(s.read_u8be()?),
                (S2(_), Some(Le)) => Value::Int(s.read_s2le()? as i64),
                (S2(_), Some(Be)) => Value::Int(s.read_s2be()? as i64),
                (S4(_), Some(Le)) => Value::Int(s.read_s4le()? as i64),
                (S4(_), Some(Be)) => Value::Int(s.read_s4be()? as i64),
                (S8(_), Some(Le)) => Value::Int(s.read_s8le()?),
                (S8(_), Some(Be)) => Value::Int(s.read_s8be()?),
                (F4(_), Some(Le)) => Value::Float(s.read_f4le()? as f64),
                (F4(_), Some(Be)) => Value::Float(s.read_f4be()? as f64),
                (F8(_), Some(Le)) => Value::Float(s.read_f8le()?),
                (F8(_), Some(Be)) => Value::Float(s.read_f8be()?),
                _ => return Err(Error::parse("endianness undetermined for multi-byte read")),
            })
        }
    }
}

/// Endianness for a multi-byte read: explicit type suffix, then this
/// node's cached resolution, then the meta chain from the innermost
/// enclosing type outwards. A switch-endian meta is evaluated against the
/// partially built node; an identifier that is not yet defined there
/// fails with a ParseError rather than defaulting.
fn resolved_endian(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    explicit: Option<Endian>,
    index: Option<i64>,
) -> Result<Endian> {
    if let Some(e) = explicit {
        return Ok(e);
    }
    if let Some(e) = arena.get(node).endian {
        return Ok(e);
    }
    let type_path = arena.get(node).type_path.clone();
    for depth in (0..=type_path.len()).rev() {
        let Some(ty) = schema.type_at(&type_path[..depth]) else {
            continue;
        };
        match &ty.meta.endian {
            None => continue,
            Some(EndianSpec::Fixed(e)) => {
                arena.get_mut(node).endian = Some(*e);
                return Ok(*e);
            }
            Some(EndianSpec::Switch { on, cases }) => {
                let io = arena.get(node).io.clone();
                let on_val = eval_in(schema, arena, node, &io, index, None, on)?;
                for (key, endian) in cases {
                    let key_val = eval_in(schema, arena, node, &io, index, None, key)?;
                    if values_equal(&on_val, &key_val) {
                        arena.get_mut(node).endian = Some(*endian);
                        return Ok(*endian);
                    }
                }
                return Err(Error::parse("endian switch expression matched no case"));
            }
        }
    }
    Err(Error::parse(
        "endianness is undetermined; declare meta.endian or use a suffixed type",
    ))
}

fn effective_bit_order(schema: &CompiledSchema, type_path: &[String]) -> BitOrder {
    for depth in (0..=type_path.len()).rev() {
        if let Some(order) = schema
            .type_at(&type_path[..depth])
            .and_then(|t| t.meta.bit_endian)
        {
            return order;
        }
    }
    BitOrder::Be
}

fn effective_encoding(
    schema: &CompiledSchema,
    arena: &ObjectArena,
    node: NodeId,
    attr: &Attr,
) -> String {
    if let Some(enc) = &attr.encoding {
        return enc.clone();
    }
    let type_path = &arena.get(node).type_path;
    for depth in (0..=type_path.len()).rev() {
        if let Some(enc) = schema
            .type_at(&type_path[..depth])
            .and_then(|t| t.meta.encoding.clone())
        {
            return enc;
        }
    }
    "UTF-8".to_string()
}

fn truncate_at(bytes: Vec<u8>, term: u8, include: bool) -> Vec<u8> {
    match bytes.iter().position(|b| *b == term) {
        Some(i) => bytes[..i + include as usize].to_vec(),
        None => bytes,
    }
}

fn maybe_process(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    attr: &Attr,
    data: Vec<u8>,
    index: Option<i64>,
) -> Result<Vec<u8>> {
    match &attr.process {
        None => Ok(data),
        Some(spec) => run_process(schema, arena, node, spec, data, index),
    }
}

fn run_process(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    spec: &ProcessSpec,
    data: Vec<u8>,
    index: Option<i64>,
) -> Result<Vec<u8>> {
    let io = arena.get(node).io.clone();
    let mut arg = |i: usize| -> Result<Value> {
        let expr: &Expr = spec.args.get(i).ok_or_else(|| {
            Error::parse(format!("process algorithm is missing argument {i}"))
        })?;
        eval_in(schema, arena, node, &io, index, None, expr)
    };
    match &spec.algo {
        ProcessAlgo::Zlib => process::inflate_zlib(&data),
        ProcessAlgo::Xor => {
            let key = match arg(0)? {
                Value::Int(b) if (0..=255).contains(&b) => vec![b as u8],
                Value::Int(b) => {
                    return Err(Error::parse(format!("xor key byte {b} out of range")))
                }
                Value::Bytes(b) => b.to_vec(),
                Value::Str(s) => s.as_bytes().to_vec(),
                other => {
                    return Err(Error::parse(format!(
                        "xor key must be a byte or byte sequence, got {}",
                        other.kind_name()
                    )))
                }
            };
            process::xor(&data, &key)
        }
        ProcessAlgo::Rol | ProcessAlgo::Ror => {
            let amount = arg(0)?.as_int().ok_or_else(|| {
                Error::parse("rol/ror amount must be an integer")
            })?;
            let amount = u64::try_from(amount)
                .map_err(|_| Error::parse(format!("rol/ror amount must be non-negative, got {amount}")))?;
            let group = match spec.args.get(1) {
                Some(_) => {
                    let g = arg(1)?.as_int().ok_or_else(|| {
                        Error::parse("rol/ror group must be an integer")
                    })?;
                    usize::try_from(g)
                        .ok()
                        .filter(|g| *g >= 1)
                        .ok_or_else(|| Error::parse(format!("rol/ror group must be >= 1, got {g}")))?
                }
                None => 1,
            };
            if spec.algo == ProcessAlgo::Rol {
                process::rotate_left(&data, amount, group)
            } else {
                process::rotate_right(&data, amount, group)
            }
        }
        ProcessAlgo::Bswap(n) => process::bswap(&data, *n as usize),
        ProcessAlgo::Other(name) => Err(Error::not_implemented(format!(
            "process algorithm {name:?}"
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
fn check_valid(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    valid: &Valid,
    value: &Value,
    eff_io: &SharedStream,
    field_start: u64,
    index: Option<i64>,
) -> Result<()> {
    let fail = |arena_io: &SharedStream, detail: String| -> Error {
        let window = arena_io.borrow().context_window(field_start);
        Error::validation_at(detail, field_start).with_context(window)
    };
    match valid {
        Valid::Eq(expr) => {
            let want = eval_in(schema, arena, node, eff_io, index, None, expr)?;
            if !values_equal(value, &want) {
                return Err(fail(
                    eff_io,
                    format!("expected {}, got {}", brief(&want), brief(value)),
                ));
            }
        }
        Valid::AnyOf(options) => {
            for option in options {
                let candidate = eval_in(schema, arena, node, eff_io, index, None, option)?;
                if values_equal(value, &candidate) {
                    return Ok(());
                }
            }
            return Err(fail(
                eff_io,
                format!("{} is not among the allowed values", brief(value)),
            ));
        }
        Valid::Range { min, max } => {
            if let Some(min) = min {
                let low = eval_in(schema, arena, node, eff_io, index, None, min)?;
                if crate::expr::eval::compare_values(value, &low)? == Ordering::Less {
                    return Err(fail(
                        eff_io,
                        format!("{} is below the minimum {}", brief(value), brief(&low)),
                    ));
                }
            }
            if let Some(max) = max {
                let high = eval_in(schema, arena, node, eff_io, index, None, max)?;
                if crate::expr::eval::compare_values(value, &high)? == Ordering::Greater {
                    return Err(fail(
                        eff_io,
                        format!("{} is above the maximum {}", brief(value), brief(&high)),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Short human rendering of a value for error messages.
fn brief(v: &Value) -> String {
    match v {
        Value::Bytes(b) if b.len() <= 8 => format!("{b:02x?}"),
        Value::Bytes(b) => format!("{} bytes", b.len()),
        Value::Array(items) => format!("array of {}", items.len()),
        Value::Object(_) => "object".to_string(),
        Value::Stream(_) => "stream".to_string(),
        other => crate::expr::methods::stringify(other).unwrap_or_else(|_| other.kind_name().to_string()),
    }
}

fn tag_enum(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    enum_ref: &str,
    value: Value,
) -> Result<Value> {
    let raw = value.as_int().ok_or_else(|| {
        Error::parse(format!(
            "cannot tag {} with enum `{enum_ref}`",
            value.kind_name()
        ))
    })?;
    let segments: Vec<String> = enum_ref.split("::").map(str::to_string).collect();
    let type_path = arena.get(node).type_path.clone();
    let (name, def) = schema
        .resolve_enum(&type_path, &segments)
        .ok_or_else(|| Error::parse(format!("unresolved enum `{enum_ref}`")))?;
    Ok(Value::Enum(EnumValue {
        enum_name: Rc::from(name),
        label: def.label_of(raw).map(Rc::from),
        value: raw,
    }))
}

/// Whether an instance's `if` condition (if any) holds.
pub(crate) fn instance_enabled(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    name: &str,
) -> Result<bool> {
    let type_path = arena.get(node).type_path.clone();
    let ty = schema
        .type_at(&type_path)
        .ok_or_else(|| Error::parse(format!("unresolved type `{}`", type_path.join("::"))))?;
    match ty.instances.get(name).and_then(|i| i.attr.cond.clone()) {
        None => Ok(true),
        Some(cond) => {
            let io = arena.get(node).io.clone();
            eval_bool_in(schema, arena, node, &io, None, &cond)
        }
    }
}

/// Resolves a lazy instance, memoizing the value on the owning node.
/// Re-entrant access while evaluation is in flight is a reference cycle.
pub(crate) fn force_instance(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    name: &str,
) -> Result<Value> {
    match arena.get(node).instances.get(name) {
        Some(InstanceSlot::Done(v)) => return Ok(v.clone()),
        Some(InstanceSlot::InProgress) => {
            return Err(Error::parse(format!("cyclic instance reference `{name}`")))
        }
        Some(InstanceSlot::Pending) => {}
        None => return Err(Error::parse(format!("unknown instance `{name}`"))),
    }
    if !instance_enabled(schema, arena, node, name)? {
        return Err(Error::parse(format!(
            "instance `{name}` is disabled by its `if` condition"
        )));
    }

    if let Some(slot) = arena.get_mut(node).instances.get_mut(name) {
        *slot = InstanceSlot::InProgress;
    }

    let type_path = arena.get(node).type_path.clone();
    let inst = schema
        .type_at(&type_path)
        .and_then(|t| t.instances.get(name))
        .ok_or_else(|| Error::parse(format!("unknown instance `{name}`")))?
        .clone();

    let result = match &inst.value {
        Some(expr) => {
            let io = arena.get(node).io.clone();
            eval_in(schema, arena, node, &io, None, None, expr)
        }
        None => {
            let io = arena.get(node).io.clone();
            read_attr_value(schema, arena, node, &inst.attr, &io)
        }
    };

    match result {
        Ok(v) => {
            if let Some(slot) = arena.get_mut(node).instances.get_mut(name) {
                *slot = InstanceSlot::Done(v.clone());
            }
            Ok(v)
        }
        Err(e) => {
            if let Some(slot) = arena.get_mut(node).instances.get_mut(name) {
                *slot = InstanceSlot::Pending;
            }
            Err(e)
        }
    }
}

// ---- evaluation helpers ----

fn eval_in(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    io: &SharedStream,
    index: Option<i64>,
    elem: Option<Value>,
    expr: &Expr,
) -> Result<Value> {
    let mut ctx = Context::new(schema, arena, node, io.clone());
    ctx.index = index;
    ctx.elem = elem;
    eval(expr, &mut ctx)
}

fn eval_bool_in(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    io: &SharedStream,
    index: Option<i64>,
    expr: &Expr,
) -> Result<bool> {
    expect_bool(eval_in(schema, arena, node, io, index, None, expr)?)
}

fn eval_int_in(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    node: NodeId,
    io: &SharedStream,
    index: Option<i64>,
    expr: &Expr,
) -> Result<i64> {
    let v = eval_in(schema, arena, node, io, index, None, expr)?;
    v.as_int()
        .ok_or_else(|| Error::parse(format!("expected an integer, got {}", v.kind_name())))
}
