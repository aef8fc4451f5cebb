//! Compiles the raw schema tree into the normalized, executable form.
//!
//! Shorthands are expanded (string `type` vs. switch object, `contents`
//! string vs. byte list, scalar-or-expression fields), every embedded
//! expression is parsed up front, exclusivity rules are checked, and
//! structured diagnostics are collected. Warnings ride along with the
//! compiled schema; `strict` mode promotes them to errors. Structural
//! errors always fail compilation; the interpreter cannot execute a
//! schema that did not normalize.

use crate::errors::{Error, Result};
use crate::expr::{parse_arg_list, parse_expr, Expr};
use crate::process::ProcessAlgo;
use crate::schema::imports;
use crate::schema::model::{
    Attr, CompiledSchema, Diagnostic, Endian, EndianSpec, EnumDef, Instance, Meta, Param,
    Primitive, ProcessSpec, Repeat, Severity, SwitchType, TypeRef, UserType, Valid,
};
use crate::schema::raw::{
    RawAttr, RawContentItem, RawContents, RawEndian, RawMeta, RawProcess, RawScalar, RawSchema,
    RawTypeRef, RawValid,
};
use crate::stream::BitOrder;
use std::collections::HashMap;

/// Supplies the text of imported schemas; the core performs no file I/O.
pub trait ImportResolver {
    fn resolve(&self, path: &str) -> Option<String>;
}

/// In-memory resolver keyed by import path.
#[derive(Debug, Default)]
pub struct MapResolver(pub HashMap<String, String>);

impl ImportResolver for MapResolver {
    fn resolve(&self, path: &str) -> Option<String> {
        self.0.get(path).cloned()
    }
}

pub struct CompileOptions<'a> {
    /// Promote warnings to compile errors.
    pub strict: bool,
    /// When false, warning-level diagnostics are not collected.
    pub validate: bool,
    pub resolver: Option<&'a dyn ImportResolver>,
}

impl Default for CompileOptions<'_> {
    fn default() -> Self {
        CompileOptions {
            strict: false,
            validate: true,
            resolver: None,
        }
    }
}

pub fn compile(text: &str, opts: &CompileOptions) -> Result<CompiledSchema> {
    let raw: RawSchema = serde_yaml::from_str(text)
        .map_err(|e| Error::validation(format!("YAML parsing error: {e}")))?;
    compile_raw(&raw, opts)
}

pub(crate) fn compile_raw(raw: &RawSchema, opts: &CompileOptions) -> Result<CompiledSchema> {
    let mut ctx = Ctx {
        diags: Vec::new(),
        validate: opts.validate,
    };

    if raw.meta.as_ref().and_then(|m| m.id.as_ref()).is_none() {
        ctx.warn("meta", "missing meta.id; defaulting root type name to `root`");
    }

    let mut root = compile_type(raw, "", &mut ctx);
    imports::merge(&mut root, opts.resolver, "", &mut ctx);

    let (errors, warnings): (Vec<_>, Vec<_>) = ctx
        .diags
        .into_iter()
        .partition(|d| d.severity == Severity::Error);

    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(Diagnostic::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::validation(joined));
    }
    if opts.strict && !warnings.is_empty() {
        let joined = warnings
            .iter()
            .map(Diagnostic::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::validation(format!("strict mode: {joined}")));
    }

    Ok(CompiledSchema { root, warnings })
}

pub(crate) struct Ctx {
    pub diags: Vec<Diagnostic>,
    validate: bool,
}

impl Ctx {
    pub fn error(&mut self, path: &str, message: impl Into<String>) {
        self.diags.push(Diagnostic {
            severity: Severity::Error,
            path: path.to_string(),
            message: message.into(),
        });
    }

    pub fn warn(&mut self, path: &str, message: impl Into<String>) {
        if self.validate {
            self.diags.push(Diagnostic {
                severity: Severity::Warning,
                path: path.to_string(),
                message: message.into(),
            });
        }
    }
}

fn join(path: &str, seg: &str) -> String {
    if path.is_empty() {
        seg.to_string()
    } else {
        format!("{path}/{seg}")
    }
}

fn is_valid_id(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some('a'..='z') | Some('_'))
        && chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
}

pub(crate) fn compile_type(raw: &RawSchema, path: &str, ctx: &mut Ctx) -> UserType {
    let meta = raw
        .meta
        .as_ref()
        .map(|m| compile_meta(m, &join(path, "meta"), ctx))
        .unwrap_or_default();

    let params = raw
        .params
        .iter()
        .map(|p| {
            if !is_valid_id(&p.id) {
                ctx.warn(&join(path, "params"), format!("parameter id {:?} is not a valid identifier", p.id));
            }
            Param {
                id: p.id.clone(),
                type_hint: p.ty.clone(),
                enum_hint: p.enum_ref.clone(),
            }
        })
        .collect();

    let mut seq = Vec::with_capacity(raw.seq.len());
    for (i, raw_attr) in raw.seq.iter().enumerate() {
        let attr_path = join(path, &format!("seq/{i}"));
        if raw_attr.id.is_none() {
            ctx.error(&attr_path, "seq attribute is missing an id");
        }
        let (attr, value) = compile_attr(raw_attr, raw_attr.id.clone(), &attr_path, ctx);
        if value.is_some() {
            ctx.error(&attr_path, "`value` is only allowed on instances");
        }
        seq.push(attr);
    }

    let mut instances = indexmap::IndexMap::new();
    for (name, raw_attr) in &raw.instances {
        let inst_path = join(path, &format!("instances/{name}"));
        if !is_valid_id(name) {
            ctx.warn(&inst_path, format!("instance id {name:?} is not a valid identifier"));
        }
        let (attr, value) = compile_attr(raw_attr, Some(name.clone()), &inst_path, ctx);
        if value.is_some() && has_io_attrs(raw_attr) {
            ctx.error(&inst_path, "a value instance cannot carry I/O attributes");
        }
        if value.is_none() && attr.type_ref.is_none() && attr.size.is_none() && !attr.size_eos {
            ctx.error(&inst_path, "instance needs either a `value` or something to read");
        }
        instances.insert(name.clone(), Instance { attr, value });
    }

    let mut types = indexmap::IndexMap::new();
    for (name, sub) in &raw.types {
        let type_path = join(path, &format!("types/{name}"));
        if !is_valid_id(name) {
            ctx.warn(&type_path, format!("type name {name:?} is not a valid identifier"));
        }
        types.insert(name.clone(), compile_type(sub, &type_path, ctx));
    }

    let mut enums = indexmap::IndexMap::new();
    for (name, mapping) in &raw.enums {
        let enum_path = join(path, &format!("enums/{name}"));
        enums.insert(name.clone(), compile_enum(mapping, &enum_path, ctx));
    }

    for key in raw.extra.keys() {
        ctx.warn(path, format!("unknown key {key:?}"));
    }

    UserType {
        meta,
        params,
        seq,
        instances,
        types,
        enums,
        doc: raw.doc.clone(),
    }
}

fn has_io_attrs(raw: &RawAttr) -> bool {
    raw.ty.is_some()
        || raw.size.is_some()
        || raw.size_eos.is_some()
        || raw.pos.is_some()
        || raw.io.is_some()
        || raw.process.is_some()
        || raw.repeat.is_some()
        || raw.contents.is_some()
        || raw.terminator.is_some()
}

fn compile_meta(raw: &RawMeta, path: &str, ctx: &mut Ctx) -> Meta {
    let endian = raw.endian.as_ref().and_then(|e| match e {
        RawEndian::Fixed(s) => match s.as_str() {
            "le" => Some(EndianSpec::Fixed(Endian::Le)),
            "be" => Some(EndianSpec::Fixed(Endian::Be)),
            other => {
                ctx.error(path, format!("endian must be `le` or `be`, got {other:?}"));
                None
            }
        },
        RawEndian::Switch { switch_on, cases } => {
            let on = match parse_expr(switch_on) {
                Ok(e) => e,
                Err(e) => {
                    ctx.error(path, format!("bad endian switch expression: {e}"));
                    return None;
                }
            };
            let mut compiled = Vec::new();
            for (key, val) in cases {
                let Some(key_expr) = case_key_expr(key, path, ctx) else {
                    continue;
                };
                match val.as_str() {
                    Some("le") => compiled.push((key_expr, Endian::Le)),
                    Some("be") => compiled.push((key_expr, Endian::Be)),
                    other => ctx.error(path, format!("endian case must map to `le` or `be`, got {other:?}")),
                }
            }
            Some(EndianSpec::Switch { on, cases: compiled })
        }
    });

    let bit_endian = raw.bit_endian.as_deref().and_then(|s| match s {
        "le" => Some(BitOrder::Le),
        "be" => Some(BitOrder::Be),
        other => {
            ctx.error(path, format!("bit-endian must be `le` or `be`, got {other:?}"));
            None
        }
    });

    for key in raw.extra.keys() {
        ctx.warn(path, format!("unknown meta key {key:?}"));
    }

    Meta {
        id: raw.id.clone(),
        endian,
        bit_endian,
        encoding: raw.encoding.clone(),
        imports: raw.imports.clone(),
    }
}

fn scalar_expr(s: &RawScalar, path: &str, ctx: &mut Ctx) -> Option<Expr> {
    match s {
        RawScalar::Bool(b) => Some(Expr::Bool(*b)),
        RawScalar::Int(i) => Some(Expr::Int(*i)),
        RawScalar::Float(f) => Some(Expr::Float(*f)),
        RawScalar::Str(text) => match parse_expr(text) {
            Ok(e) => Some(e),
            Err(e) => {
                ctx.error(path, format!("bad expression {text:?}: {e}"));
                None
            }
        },
    }
}

fn case_key_expr(key: &serde_yaml::Value, path: &str, ctx: &mut Ctx) -> Option<Expr> {
    match key {
        serde_yaml::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Expr::Int(i)),
            None => {
                ctx.error(path, format!("case key {n} is not an integer"));
                None
            }
        },
        serde_yaml::Value::Bool(b) => Some(Expr::Bool(*b)),
        serde_yaml::Value::String(s) => match parse_expr(s) {
            Ok(e) => Some(e),
            Err(e) => {
                ctx.error(path, format!("bad case key {s:?}: {e}"));
                None
            }
        },
        other => {
            ctx.error(path, format!("unsupported case key {other:?}"));
            None
        }
    }
}

/// Splits `name(arg, arg)` into name and argument expressions.
fn split_invocation<'a>(s: &'a str, path: &str, ctx: &mut Ctx) -> Option<(&'a str, Vec<Expr>)> {
    match s.find('(') {
        None => Some((s, Vec::new())),
        Some(open) => {
            if !s.ends_with(')') {
                ctx.error(path, format!("unbalanced parentheses in {s:?}"));
                return None;
            }
            let args = match parse_arg_list(&s[open + 1..s.len() - 1]) {
                Ok(args) => args,
                Err(e) => {
                    ctx.error(path, format!("bad arguments in {s:?}: {e}"));
                    return None;
                }
            };
            Some((s[..open].trim_end(), args))
        }
    }
}

fn compile_type_name(s: &str, path: &str, ctx: &mut Ctx) -> Option<TypeRef> {
    let s = s.trim();
    let (name, args) = split_invocation(s, path, ctx)?;
    if let Some(prim) = Primitive::parse(name) {
        if !args.is_empty() {
            ctx.error(path, format!("built-in type {name:?} takes no arguments"));
            return None;
        }
        return Some(TypeRef::Primitive(prim));
    }
    Some(TypeRef::User {
        name: name.to_string(),
        args,
    })
}

fn compile_type_ref(raw: &RawTypeRef, path: &str, ctx: &mut Ctx) -> Option<TypeRef> {
    match raw {
        RawTypeRef::Name(s) => compile_type_name(s, path, ctx),
        RawTypeRef::Switch { switch_on, cases } => {
            let on = scalar_expr(switch_on, path, ctx)?;
            let mut compiled = Vec::new();
            let mut default = None;
            for (key, val) in cases {
                let Some(type_name) = val.as_str() else {
                    ctx.error(path, format!("switch case value must be a type name, got {val:?}"));
                    continue;
                };
                let Some(ty) = compile_type_name(type_name, path, ctx) else {
                    continue;
                };
                if key.as_str() == Some("_") {
                    if default.replace(Box::new(ty)).is_some() {
                        ctx.error(path, "duplicate `_` default case");
                    }
                    continue;
                }
                if let Some(key_expr) = case_key_expr(key, path, ctx) {
                    compiled.push((key_expr, ty));
                }
            }
            Some(TypeRef::Switch(SwitchType {
                on,
                cases: compiled,
                default,
            }))
        }
    }
}

fn contents_bytes(c: &RawContents, path: &str, ctx: &mut Ctx) -> Option<Vec<u8>> {
    match c {
        RawContents::Str(s) => Some(s.as_bytes().to_vec()),
        RawContents::List(items) => {
            let mut out = Vec::new();
            for item in items {
                match item {
                    RawContentItem::Int(i) if (0..=255).contains(i) => out.push(*i as u8),
                    RawContentItem::Int(i) => {
                        ctx.error(path, format!("contents byte {i} out of range"));
                        return None;
                    }
                    RawContentItem::Str(s) => out.extend_from_slice(s.as_bytes()),
                }
            }
            Some(out)
        }
    }
}

fn compile_process(raw: &RawProcess, path: &str, ctx: &mut Ctx) -> Option<ProcessSpec> {
    let (algo, args) = match raw {
        RawProcess::Str(s) => {
            let (name, args) = split_invocation(s.trim(), path, ctx)?;
            (ProcessAlgo::from_name(name), args)
        }
        RawProcess::Obj { algorithm, args } => {
            let mut compiled = Vec::new();
            for a in args {
                compiled.push(scalar_expr(a, path, ctx)?);
            }
            (ProcessAlgo::from_name(algorithm), compiled)
        }
    };
    if let ProcessAlgo::Other(name) = &algo {
        ctx.warn(path, format!("unknown process algorithm {name:?}; parsing will fail if reached"));
    }
    Some(ProcessSpec { algo, args })
}

fn compile_valid(raw: &RawValid, path: &str, ctx: &mut Ctx) -> Option<Valid> {
    match raw {
        RawValid::Shorthand(s) => Some(Valid::Eq(scalar_expr(s, path, ctx)?)),
        RawValid::Detailed {
            eq,
            any_of,
            min,
            max,
        } => {
            if let Some(eq) = eq {
                if any_of.is_some() || min.is_some() || max.is_some() {
                    ctx.warn(path, "`eq` overrides other valid constraints");
                }
                return Some(Valid::Eq(scalar_expr(eq, path, ctx)?));
            }
            if let Some(options) = any_of {
                let mut compiled = Vec::new();
                for o in options {
                    compiled.push(scalar_expr(o, path, ctx)?);
                }
                return Some(Valid::AnyOf(compiled));
            }
            if min.is_none() && max.is_none() {
                ctx.error(path, "empty `valid` constraint");
                return None;
            }
            let min = match min {
                Some(s) => Some(scalar_expr(s, path, ctx)?),
                None => None,
            };
            let max = match max {
                Some(s) => Some(scalar_expr(s, path, ctx)?),
                None => None,
            };
            Some(Valid::Range { min, max })
        }
    }
}

fn compile_attr(
    raw: &RawAttr,
    id: Option<String>,
    path: &str,
    ctx: &mut Ctx,
) -> (Attr, Option<Expr>) {
    let mut attr = Attr {
        id,
        ..Attr::default()
    };

    if let Some(attr_id) = &attr.id {
        if !is_valid_id(attr_id) {
            ctx.warn(path, format!("attribute id {attr_id:?} is not a valid identifier"));
        }
    }

    attr.type_ref = raw.ty.as_ref().and_then(|t| compile_type_ref(t, path, ctx));
    attr.size = raw.size.as_ref().and_then(|s| scalar_expr(s, path, ctx));
    attr.size_eos = raw.size_eos.unwrap_or(false);
    attr.cond = raw.cond.as_ref().and_then(|s| scalar_expr(s, path, ctx));
    attr.pos = raw.pos.as_ref().and_then(|s| scalar_expr(s, path, ctx));
    attr.io = raw.io.as_ref().and_then(|s| match parse_expr(s) {
        Ok(e) => Some(e),
        Err(e) => {
            ctx.error(path, format!("bad io expression {s:?}: {e}"));
            None
        }
    });
    attr.contents = raw.contents.as_ref().and_then(|c| contents_bytes(c, path, ctx));
    attr.encoding = raw.encoding.clone();
    attr.process = raw.process.as_ref().and_then(|p| compile_process(p, path, ctx));
    attr.enum_ref = raw.enum_ref.clone();
    attr.valid = raw.valid.as_ref().and_then(|v| compile_valid(v, path, ctx));
    attr.doc = raw.doc.clone();

    attr.terminator = match raw.terminator {
        None => None,
        Some(t) if (0..=255).contains(&t) => Some(t as u8),
        Some(t) => {
            ctx.error(path, format!("terminator {t} out of byte range"));
            None
        }
    };
    attr.consume = raw.consume.unwrap_or(true);
    attr.include = raw.include.unwrap_or(false);
    attr.eos_error = raw.eos_error.unwrap_or(true);

    attr.repeat = match raw.repeat.as_deref() {
        None => {
            if raw.repeat_expr.is_some() || raw.repeat_until.is_some() {
                ctx.error(path, "repeat-expr/repeat-until require a `repeat` key");
            }
            Repeat::None
        }
        Some("expr") => match &raw.repeat_expr {
            Some(s) => scalar_expr(s, path, ctx).map(Repeat::Expr).unwrap_or_default(),
            None => {
                ctx.error(path, "repeat: expr requires repeat-expr");
                Repeat::None
            }
        },
        Some("until") => match &raw.repeat_until {
            Some(s) => scalar_expr(s, path, ctx).map(Repeat::Until).unwrap_or_default(),
            None => {
                ctx.error(path, "repeat: until requires repeat-until");
                Repeat::None
            }
        },
        Some("eos") => Repeat::Eos,
        Some(other) => {
            ctx.error(path, format!("unknown repeat kind {other:?}"));
            Repeat::None
        }
    };

    check_attr(raw, &attr, path, ctx);

    let value = raw.value.as_ref().and_then(|s| scalar_expr(s, path, ctx));
    (attr, value)
}

fn check_attr(raw: &RawAttr, attr: &Attr, path: &str, ctx: &mut Ctx) {
    if attr.contents.is_some() {
        if attr.type_ref.is_some() {
            ctx.error(path, "`contents` excludes `type`");
        }
        if attr.size.is_some() || attr.size_eos {
            ctx.error(path, "`contents` implies its own size");
        }
    }
    if attr.size.is_some() && attr.size_eos {
        ctx.error(path, "`size` and `size-eos` are mutually exclusive");
    }
    if attr.process.is_some() && attr.size.is_none() && !attr.size_eos && attr.contents.is_none() {
        ctx.error(path, "`process` requires sized input (`size` or `size-eos`)");
    }
    if attr.include && !attr.consume {
        ctx.warn(path, "`include` without `consume` leaves the terminator in the stream");
    }

    match &attr.type_ref {
        Some(TypeRef::Primitive(p)) => {
            if p.byte_width().is_some() && (attr.size.is_some() || attr.size_eos) {
                ctx.error(path, "fixed-width primitive cannot take an explicit size");
            }
            if matches!(p, Primitive::Bits(_)) && (attr.size.is_some() || attr.size_eos) {
                ctx.error(path, "bit-field type cannot take an explicit size");
            }
            if matches!(p, Primitive::Str)
                && attr.size.is_none()
                && !attr.size_eos
                && attr.terminator.is_none()
            {
                ctx.error(path, "`str` needs `size`, `size-eos` or `terminator`");
            }
            if attr.enum_ref.is_some()
                && !matches!(
                    p,
                    Primitive::U1
                        | Primitive::U2(_)
                        | Primitive::U4(_)
                        | Primitive::U8(_)
                        | Primitive::S1
                        | Primitive::S2(_)
                        | Primitive::S4(_)
                        | Primitive::S8(_)
                        | Primitive::Bits(_)
                )
            {
                ctx.warn(path, "`enum` on a non-integer type has no effect");
            }
        }
        None if attr.type_ref.is_none()
            && attr.size.is_none()
            && !attr.size_eos
            && attr.contents.is_none()
            && attr.terminator.is_none()
            && raw.value.is_none() =>
        {
            ctx.error(path, "attribute needs a `type`, `size`, `contents` or `terminator`");
        }
        _ => {}
    }
}

fn parse_int_key(s: &str) -> Option<i64> {
    let t = s.trim();
    let (neg, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let v = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).ok()?
    } else if let Some(oct) = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")) {
        i64::from_str_radix(oct, 8).ok()?
    } else {
        t.parse().ok()?
    };
    Some(if neg { -v } else { v })
}

fn compile_enum(mapping: &serde_yaml::Mapping, path: &str, ctx: &mut Ctx) -> EnumDef {
    let mut def = EnumDef::default();
    for (key, val) in mapping {
        let value = match key {
            serde_yaml::Value::Number(n) => n.as_i64(),
            serde_yaml::Value::String(s) => parse_int_key(s),
            _ => None,
        };
        let Some(value) = value else {
            ctx.error(path, format!("enum key {key:?} is not an integer"));
            continue;
        };
        let name = match val {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Mapping(m) => m
                .iter()
                .find(|(k, _)| k.as_str() == Some("id"))
                .and_then(|(_, v)| v.as_str())
                .map(str::to_owned),
            _ => None,
        };
        let Some(name) = name else {
            ctx.error(path, format!("enum member for {value} has no usable name"));
            continue;
        };
        if def.by_value.insert(value, name.clone()).is_some() {
            ctx.warn(path, format!("duplicate enum value {value}"));
        }
        if def.by_name.insert(name.clone(), value).is_some() {
            ctx.warn(path, format!("duplicate enum member name {name:?}"));
        }
    }
    def
}
