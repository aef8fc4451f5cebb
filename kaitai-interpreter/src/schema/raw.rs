//! Raw serde model of schema text, shorthand-tolerant.
//!
//! This layer only mirrors the YAML shapes; every polymorphic field
//! (`type:` string vs. switch object, `contents:` string vs. list,
//! scalar-or-expression values) is an untagged enum that the validator
//! normalizes into the compiled model. Unrecognized keys are captured via
//! `#[serde(flatten)]` so the validator can warn about them instead of
//! failing the load.

use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct RawSchema {
    pub meta: Option<RawMeta>,
    #[serde(default)]
    pub seq: Vec<RawAttr>,
    #[serde(default)]
    pub instances: IndexMap<String, RawAttr>,
    #[serde(default)]
    pub types: IndexMap<String, RawSchema>,
    /// Enum bodies keep their YAML mapping form; keys may be integers in
    /// any radix the source language allows, values plain names or verbose
    /// `{id: name}` objects.
    #[serde(default)]
    pub enums: IndexMap<String, serde_yaml::Mapping>,
    #[serde(default)]
    pub params: Vec<RawParam>,
    pub doc: Option<String>,
    #[serde(rename = "doc-ref")]
    pub doc_ref: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawMeta {
    pub id: Option<String>,
    pub endian: Option<RawEndian>,
    #[serde(rename = "bit-endian")]
    pub bit_endian: Option<String>,
    pub encoding: Option<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    // Documentation-only meta keys, accepted and ignored.
    pub title: Option<serde_yaml::Value>,
    pub application: Option<serde_yaml::Value>,
    #[serde(rename = "file-extension")]
    pub file_extension: Option<serde_yaml::Value>,
    pub license: Option<serde_yaml::Value>,
    #[serde(rename = "ks-version")]
    pub ks_version: Option<serde_yaml::Value>,
    pub xref: Option<serde_yaml::Value>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawEndian {
    Fixed(String),
    Switch {
        #[serde(rename = "switch-on")]
        switch_on: String,
        cases: serde_yaml::Mapping,
    },
}

/// A YAML scalar that may stand for a literal or an expression string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawScalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawTypeRef {
    Name(String),
    Switch {
        #[serde(rename = "switch-on")]
        switch_on: RawScalar,
        cases: serde_yaml::Mapping,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawContents {
    Str(String),
    List(Vec<RawContentItem>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawContentItem {
    Int(i64),
    Str(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawProcess {
    Str(String),
    Obj {
        algorithm: String,
        #[serde(default)]
        args: Vec<RawScalar>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawValid {
    Shorthand(RawScalar),
    Detailed {
        eq: Option<RawScalar>,
        #[serde(rename = "any-of")]
        any_of: Option<Vec<RawScalar>>,
        min: Option<RawScalar>,
        max: Option<RawScalar>,
    },
}

#[derive(Debug, Deserialize)]
pub struct RawParam {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: Option<String>,
    #[serde(rename = "enum")]
    pub enum_ref: Option<String>,
    pub doc: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawAttr {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub ty: Option<RawTypeRef>,
    pub size: Option<RawScalar>,
    #[serde(rename = "size-eos")]
    pub size_eos: Option<bool>,
    pub repeat: Option<String>,
    #[serde(rename = "repeat-expr")]
    pub repeat_expr: Option<RawScalar>,
    #[serde(rename = "repeat-until")]
    pub repeat_until: Option<RawScalar>,
    #[serde(rename = "if")]
    pub cond: Option<RawScalar>,
    pub contents: Option<RawContents>,
    pub encoding: Option<String>,
    pub terminator: Option<i64>,
    pub consume: Option<bool>,
    pub include: Option<bool>,
    #[serde(rename = "eos-error")]
    pub eos_error: Option<bool>,
    pub pos: Option<RawScalar>,
    pub io: Option<String>,
    pub process: Option<RawProcess>,
    #[serde(rename = "enum")]
    pub enum_ref: Option<String>,
    pub valid: Option<RawValid>,
    /// Instances only: computed value expression.
    pub value: Option<RawScalar>,
    pub doc: Option<String>,
    #[serde(rename = "doc-ref")]
    pub doc_ref: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_schema_parses() {
        let yaml = r#"
meta:
  id: gif
seq:
  - id: header
    type: str
    size: 3
"#;
        let raw: RawSchema = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(raw.meta.unwrap().id.as_deref(), Some("gif"));
        assert_eq!(raw.seq.len(), 1);
        assert!(matches!(raw.seq[0].ty, Some(RawTypeRef::Name(ref n)) if n == "str"));
    }

    #[test]
    fn switch_type_shape() {
        let yaml = r#"
id: body
type:
  switch-on: rec_type
  cases:
    1: rec_a
    2: rec_b
    _: rec_unknown
"#;
        let attr: RawAttr = serde_yaml::from_str(yaml).unwrap();
        match attr.ty {
            Some(RawTypeRef::Switch { cases, .. }) => assert_eq!(cases.len(), 3),
            other => panic!("expected switch, got {other:?}"),
        }
    }

    #[test]
    fn contents_shorthands() {
        let s: RawContents = serde_yaml::from_str(r#""GIF""#).unwrap();
        assert!(matches!(s, RawContents::Str(ref x) if x == "GIF"));

        let l: RawContents = serde_yaml::from_str("[0x4d, 0x5a, \"tail\"]").unwrap();
        match l {
            RawContents::List(items) => {
                assert!(matches!(items[0], RawContentItem::Int(0x4d)));
                assert!(matches!(items[2], RawContentItem::Str(ref x) if x == "tail"));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn size_accepts_int_and_expression() {
        let a: RawAttr = serde_yaml::from_str("{id: x, size: 4}").unwrap();
        assert!(matches!(a.size, Some(RawScalar::Int(4))));
        let a: RawAttr = serde_yaml::from_str("{id: x, size: len - 2}").unwrap();
        assert!(matches!(a.size, Some(RawScalar::Str(ref s)) if s == "len - 2"));
    }

    #[test]
    fn unknown_keys_are_captured() {
        let a: RawAttr = serde_yaml::from_str("{id: x, size: 1, made-up-key: 7}").unwrap();
        assert!(a.extra.contains_key("made-up-key"));
    }

    #[test]
    fn switch_endian_meta() {
        let yaml = r#"
id: fmt
endian:
  switch-on: indicator
  cases:
    0x49: le
    0x4d: be
"#;
        let meta: RawMeta = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(meta.endian, Some(RawEndian::Switch { .. })));
    }
}
