//! Compiled schema tree: the normalized form produced by the validator and
//! executed by the interpreter.
//!
//! All expression-bearing fields hold pre-parsed ASTs, so schema-text
//! problems surface at compile time, not mid-parse. Maps that are sensitive
//! to declaration order (`types`, `enums`, `instances`, parameters) use
//! `IndexMap`.
//!
//! # Core Types
//!
//! - [`CompiledSchema`]: the root handle, immutable and shareable.
//! - [`UserType`]: one type: meta, params, `seq`, instances, nested types,
//!   enums.
//! - [`Attr`]: one sequential attribute or the I/O portion of an instance.
//! - [`TypeRef`]: what an attribute decodes as: built-in primitive, user
//!   type invocation, or a switch descriptor.

use crate::expr::Expr;
use crate::process::ProcessAlgo;
use crate::stream::BitOrder;
use indexmap::IndexMap;
use std::collections::HashMap;

/// Byte order of multi-byte primitive reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Le,
    Be,
}

/// `meta.endian`: fixed, or switched on an expression over the partially
/// built node.
#[derive(Debug, Clone)]
pub enum EndianSpec {
    Fixed(Endian),
    Switch {
        on: Expr,
        cases: Vec<(Expr, Endian)>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub id: Option<String>,
    pub endian: Option<EndianSpec>,
    pub bit_endian: Option<BitOrder>,
    pub encoding: Option<String>,
    pub imports: Vec<String>,
}

/// Built-in primitive types. Multi-byte variants carry the endianness of
/// their type suffix when one was written (`u4le`), `None` when the
/// surrounding meta decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    U1,
    U2(Option<Endian>),
    U4(Option<Endian>),
    U8(Option<Endian>),
    S1,
    S2(Option<Endian>),
    S4(Option<Endian>),
    S8(Option<Endian>),
    F4(Option<Endian>),
    F8(Option<Endian>),
    /// Bit field of 1..=64 bits, read with the effective bit endianness.
    Bits(u32),
    Str,
    StrZ,
}

impl Primitive {
    pub fn parse(name: &str) -> Option<Primitive> {
        let (stem, endian) = match name {
            _ if name.len() > 2 && name.ends_with("le") => (&name[..name.len() - 2], Some(Endian::Le)),
            _ if name.len() > 2 && name.ends_with("be") => (&name[..name.len() - 2], Some(Endian::Be)),
            _ => (name, None),
        };
        let prim = match stem {
            "u1" if endian.is_none() => Primitive::U1,
            "s1" if endian.is_none() => Primitive::S1,
            "u2" => Primitive::U2(endian),
            "u4" => Primitive::U4(endian),
            "u8" => Primitive::U8(endian),
            "s2" => Primitive::S2(endian),
            "s4" => Primitive::S4(endian),
            "s8" => Primitive::S8(endian),
            "f4" => Primitive::F4(endian),
            "f8" => Primitive::F8(endian),
            "str" if endian.is_none() => Primitive::Str,
            "strz" if endian.is_none() => Primitive::StrZ,
            _ => {
                if endian.is_none() {
                    let width: u32 = stem.strip_prefix('b')?.parse().ok()?;
                    if (1..=64).contains(&width) {
                        return Some(Primitive::Bits(width));
                    }
                }
                return None;
            }
        };
        Some(prim)
    }

    /// Fixed byte width, for primitives that have one.
    pub fn byte_width(&self) -> Option<u64> {
        match self {
            Primitive::U1 | Primitive::S1 => Some(1),
            Primitive::U2(_) | Primitive::S2(_) => Some(2),
            Primitive::U4(_) | Primitive::S4(_) | Primitive::F4(_) => Some(4),
            Primitive::U8(_) | Primitive::S8(_) | Primitive::F8(_) => Some(8),
            Primitive::Bits(_) | Primitive::Str | Primitive::StrZ => None,
        }
    }

    /// Whether reading this primitive needs a resolved byte order.
    pub fn needs_endian(&self) -> bool {
        matches!(
            self,
            Primitive::U2(None)
                | Primitive::U4(None)
                | Primitive::U8(None)
                | Primitive::S2(None)
                | Primitive::S4(None)
                | Primitive::S8(None)
                | Primitive::F4(None)
                | Primitive::F8(None)
        )
    }
}

#[derive(Debug, Clone)]
pub enum TypeRef {
    Primitive(Primitive),
    User { name: String, args: Vec<Expr> },
    Switch(SwitchType),
}

#[derive(Debug, Clone)]
pub struct SwitchType {
    pub on: Expr,
    /// Case key expressions paired with the type each selects. Keys are
    /// evaluated at parse time and matched by deep equality.
    pub cases: Vec<(Expr, TypeRef)>,
    pub default: Option<Box<TypeRef>>,
}

#[derive(Debug, Clone, Default)]
pub enum Repeat {
    #[default]
    None,
    Expr(Expr),
    Until(Expr),
    Eos,
}

#[derive(Debug, Clone)]
pub enum Valid {
    Eq(Expr),
    AnyOf(Vec<Expr>),
    Range {
        min: Option<Expr>,
        max: Option<Expr>,
    },
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub algo: ProcessAlgo,
    pub args: Vec<Expr>,
}

/// One attribute of a `seq` (or the read portion of an instance).
#[derive(Debug, Clone)]
pub struct Attr {
    pub id: Option<String>,
    pub type_ref: Option<TypeRef>,
    pub size: Option<Expr>,
    pub size_eos: bool,
    pub repeat: Repeat,
    pub cond: Option<Expr>,
    pub contents: Option<Vec<u8>>,
    pub encoding: Option<String>,
    pub terminator: Option<u8>,
    pub consume: bool,
    pub include: bool,
    pub eos_error: bool,
    pub pos: Option<Expr>,
    pub io: Option<Expr>,
    pub process: Option<ProcessSpec>,
    pub enum_ref: Option<String>,
    pub valid: Option<Valid>,
    pub doc: Option<String>,
}

impl Default for Attr {
    fn default() -> Self {
        Attr {
            id: None,
            type_ref: None,
            size: None,
            size_eos: false,
            repeat: Repeat::None,
            cond: None,
            contents: None,
            encoding: None,
            terminator: None,
            consume: true,
            include: false,
            eos_error: true,
            pos: None,
            io: None,
            process: None,
            enum_ref: None,
            valid: None,
            doc: None,
        }
    }
}

/// A lazily computed field: either a pure `value` expression or a
/// positioned read described by `attr`.
#[derive(Debug, Clone)]
pub struct Instance {
    pub attr: Attr,
    pub value: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub id: String,
    pub type_hint: Option<String>,
    pub enum_hint: Option<String>,
}

/// Integer-to-name mapping, queryable in both directions.
#[derive(Debug, Clone, Default)]
pub struct EnumDef {
    pub by_value: IndexMap<i64, String>,
    pub by_name: HashMap<String, i64>,
}

impl EnumDef {
    pub fn label_of(&self, value: i64) -> Option<&str> {
        self.by_value.get(&value).map(String::as_str)
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserType {
    pub meta: Meta,
    pub params: Vec<Param>,
    pub seq: Vec<Attr>,
    pub instances: IndexMap<String, Instance>,
    pub types: IndexMap<String, UserType>,
    pub enums: IndexMap<String, EnumDef>,
    pub doc: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One structured validator finding.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{tag} at /{}: {}", self.path, self.message)
    }
}

/// The compiled schema: immutable after compilation, shareable between
/// parses.
#[derive(Debug)]
pub struct CompiledSchema {
    pub root: UserType,
    pub warnings: Vec<Diagnostic>,
}

impl CompiledSchema {
    pub fn meta_id(&self) -> &str {
        self.root.meta.id.as_deref().unwrap_or("root")
    }

    /// The type at a path of nested type names; empty path is the root.
    /// Path segments may be composite import keys (`ns::name`).
    pub fn type_at(&self, path: &[String]) -> Option<&UserType> {
        let mut cur = &self.root;
        for seg in path {
            cur = cur.types.get(seg)?;
        }
        Some(cur)
    }

    /// Resolves a type name from the scope of `current`, per the composed
    /// namespace rules: local nested types first, then enclosing types out
    /// to the root, then enclosing type names themselves (recursion), then
    /// the root type's own name, then imports in declaration order.
    pub fn resolve_type(&self, current: &[String], name: &str) -> Option<Vec<String>> {
        if name.contains("::") {
            return self.root.types.contains_key(name).then(|| vec![name.to_string()]);
        }
        for depth in (0..=current.len()).rev() {
            let prefix = &current[..depth];
            if let Some(t) = self.type_at(prefix) {
                if t.types.contains_key(name) {
                    let mut path = prefix.to_vec();
                    path.push(name.to_string());
                    return Some(path);
                }
            }
            if depth > 0 && current[depth - 1] == name {
                return Some(current[..depth].to_vec());
            }
        }
        if self.meta_id() == name {
            return Some(Vec::new());
        }
        for key in self.root.types.keys() {
            if key.rsplit_once("::").is_some_and(|(_, suffix)| suffix == name) {
                return Some(vec![key.clone()]);
            }
        }
        None
    }

    /// Resolves an enum reference path (everything before the member name)
    /// from the scope of `current`. Returns the enum's short name and its
    /// definition.
    pub fn resolve_enum<'a>(
        &'a self,
        current: &[String],
        path: &'a [String],
    ) -> Option<(&'a str, &'a EnumDef)> {
        match path {
            [name] => {
                for depth in (0..=current.len()).rev() {
                    if let Some(def) = self
                        .type_at(&current[..depth])
                        .and_then(|t| t.enums.get(name))
                    {
                        return Some((name.as_str(), def));
                    }
                }
                // Imported enums live at the root under composite keys.
                for (key, def) in &self.root.enums {
                    if key.rsplit_once("::").is_some_and(|(_, suffix)| suffix == name) {
                        return Some((name.as_str(), def));
                    }
                }
                self.root.enums.get(name).map(|def| (name.as_str(), def))
            }
            [type_path @ .., name] => {
                // Composite reference like `ns::enum` arrives as segments.
                let joined = path.join("::");
                for depth in (0..=current.len()).rev() {
                    if let Some(def) = self
                        .type_at(&current[..depth])
                        .and_then(|t| t.enums.get(&joined))
                    {
                        return Some((name.as_str(), def));
                    }
                }
                let mut cur = self.resolve_type(current, &type_path[0])?;
                for seg in &type_path[1..] {
                    cur.push(seg.clone());
                }
                self.type_at(&cur)
                    .and_then(|t| t.enums.get(name))
                    .map(|def| (name.as_str(), def))
            }
            [] => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod primitive_parsing {
        use super::*;

        #[test]
        fn suffixed_and_bare_integers() {
            assert_eq!(Primitive::parse("u1"), Some(Primitive::U1));
            assert_eq!(Primitive::parse("u4le"), Some(Primitive::U4(Some(Endian::Le))));
            assert_eq!(Primitive::parse("s8be"), Some(Primitive::S8(Some(Endian::Be))));
            assert_eq!(Primitive::parse("u2"), Some(Primitive::U2(None)));
        }

        #[test]
        fn bit_fields() {
            assert_eq!(Primitive::parse("b1"), Some(Primitive::Bits(1)));
            assert_eq!(Primitive::parse("b64"), Some(Primitive::Bits(64)));
            assert_eq!(Primitive::parse("b0"), None);
            assert_eq!(Primitive::parse("b65"), None);
        }

        #[test]
        fn strings_and_unknowns() {
            assert_eq!(Primitive::parse("str"), Some(Primitive::Str));
            assert_eq!(Primitive::parse("strz"), Some(Primitive::StrZ));
            assert_eq!(Primitive::parse("my_type"), None);
            assert_eq!(Primitive::parse("u3"), None);
        }

        #[test]
        fn widths() {
            assert_eq!(Primitive::U4(None).byte_width(), Some(4));
            assert_eq!(Primitive::Bits(12).byte_width(), None);
            assert!(Primitive::U2(None).needs_endian());
            assert!(!Primitive::U2(Some(Endian::Le)).needs_endian());
        }
    }

    mod name_resolution {
        use super::*;

        fn schema_with_nested() -> CompiledSchema {
            let mut inner = UserType::default();
            inner.enums.insert("flags".into(), EnumDef::default());
            let mut header = UserType::default();
            header.types.insert("inner".into(), inner);
            let mut root = UserType {
                meta: Meta {
                    id: Some("top".into()),
                    ..Meta::default()
                },
                ..UserType::default()
            };
            root.types.insert("header".into(), header);
            root.types.insert("ns::shared".into(), UserType::default());
            CompiledSchema {
                root,
                warnings: vec![],
            }
        }

        #[test]
        fn local_then_ancestors() {
            let s = schema_with_nested();
            assert_eq!(
                s.resolve_type(&["header".into()], "inner"),
                Some(vec!["header".into(), "inner".into()])
            );
            assert_eq!(s.resolve_type(&["header".into(), "inner".into()], "header"), Some(vec!["header".into()]));
        }

        #[test]
        fn root_name_and_imports() {
            let s = schema_with_nested();
            assert_eq!(s.resolve_type(&[], "top"), Some(vec![]));
            assert_eq!(s.resolve_type(&[], "shared"), Some(vec!["ns::shared".into()]));
            assert_eq!(s.resolve_type(&[], "ns::shared"), Some(vec!["ns::shared".into()]));
            assert_eq!(s.resolve_type(&[], "missing"), None);
        }

        #[test]
        fn enum_lookup_walks_scope() {
            let s = schema_with_nested();
            let path = vec!["header".to_string(), "inner".to_string()];
            assert!(s.resolve_enum(&path, &["flags".into()]).is_some());
            assert!(s.resolve_enum(&[], &["flags".into()]).is_none());
            assert!(s
                .resolve_enum(&[], &["header".into(), "inner".into(), "flags".into()])
                .is_some());
        }
    }
}
