#![doc = include_str!("../../README.MD")]

pub mod context;
pub mod errors;
pub mod expr;
pub mod interpreter;
pub mod process;
pub mod schema;
pub mod serialize;
pub mod stream;
pub mod value;

pub use errors::{Error, ErrorKind, Result};
pub use schema::validator::{CompileOptions, ImportResolver, MapResolver};
pub use schema::CompiledSchema;
pub use stream::{BitOrder, KaitaiStream};
pub use value::Value;

use std::cell::RefCell;
use std::rc::Rc;
use value::{NodeId, ObjectArena};

/// Compiles schema text into the immutable, shareable executable form.
/// Idempotent and pure apart from calls into the import resolver.
pub fn compile_schema(text: &str, options: &CompileOptions) -> Result<CompiledSchema> {
    schema::validator::compile(text, options)
}

/// Compiles `schema_text` and parses `data` against it.
pub fn parse(schema_text: &str, data: &[u8], options: &CompileOptions) -> Result<ParsedDocument> {
    let compiled = Rc::new(compile_schema(schema_text, options)?);
    parse_with_schema(compiled, data)
}

/// Parses `data` against an already compiled schema.
pub fn parse_with_schema(schema: Rc<CompiledSchema>, data: &[u8]) -> Result<ParsedDocument> {
    let mut arena = ObjectArena::new();
    let root = interpreter::execute(&schema, &mut arena, data.to_vec())?;
    Ok(ParsedDocument {
        schema,
        arena: RefCell::new(arena),
        root,
    })
}

/// A parsed object tree. Sequential fields are fully materialized;
/// instances resolve lazily on first access and stay cached on their
/// owning node. Not thread-safe; share the compiled schema instead and
/// parse per thread.
#[derive(Debug)]
pub struct ParsedDocument {
    pub(crate) schema: Rc<CompiledSchema>,
    pub(crate) arena: RefCell<ObjectArena>,
    pub(crate) root: NodeId,
}

impl ParsedDocument {
    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }

    /// Serializes the tree, forcing all instances. Instance failures are
    /// captured per field; cycles collapse to `"[Circular]"`.
    pub fn to_json(&self) -> serde_json::Value {
        serialize::document_to_json(self)
    }

    /// Looks up a value by dotted path with optional bracket indexing,
    /// e.g. `"items[1].value"`. Traversal forces instances it passes
    /// through.
    pub fn value_at(&self, path: &str) -> Result<Value> {
        let mut arena = self.arena.borrow_mut();
        let mut current = Value::Object(self.root);
        for segment in path.split('.') {
            let (name, indices) = parse_segment(segment)?;
            let id = match current {
                Value::Object(id) => id,
                other => {
                    return Err(Error::parse(format!(
                        "cannot access field `{name}` on {}",
                        other.kind_name()
                    )))
                }
            };
            current = object_field(&self.schema, &mut arena, id, name)?;
            for idx in indices {
                current = index_value(&current, idx)?;
            }
        }
        Ok(current)
    }
}

fn parse_segment(segment: &str) -> Result<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Ok((segment, Vec::new()));
    };
    let (name, mut rest) = segment.split_at(open);
    let mut indices = Vec::new();
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('[')
            .and_then(|r| r.split_once(']'))
            .ok_or_else(|| Error::parse(format!("malformed path segment {segment:?}")))?;
        let idx: usize = inner
            .0
            .parse()
            .map_err(|_| Error::parse(format!("bad index in path segment {segment:?}")))?;
        indices.push(idx);
        rest = inner.1;
    }
    Ok((name, indices))
}

fn object_field(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    id: NodeId,
    name: &str,
) -> Result<Value> {
    match name {
        "_root" => return Ok(Value::Object(arena.get(id).root)),
        "_parent" => {
            return arena
                .get(id)
                .parent
                .map(Value::Object)
                .ok_or_else(|| Error::parse("`_parent` is not available on the root object"))
        }
        _ => {}
    }
    let node = arena.get(id);
    if let Some(v) = node.params.get(name) {
        return Ok(v.clone());
    }
    if let Some(v) = node.fields.get(name) {
        return Ok(v.clone());
    }
    if node.instances.contains_key(name) {
        return interpreter::force_instance(schema, arena, id, name);
    }
    Err(Error::parse(format!("object has no field `{name}`")))
}

fn index_value(value: &Value, idx: usize) -> Result<Value> {
    match value {
        Value::Array(items) => items
            .get(idx)
            .cloned()
            .ok_or_else(|| Error::parse(format!("index {idx} out of range"))),
        Value::Bytes(bytes) => bytes
            .get(idx)
            .map(|b| Value::Int(*b as i64))
            .ok_or_else(|| Error::parse(format!("index {idx} out of range"))),
        other => Err(Error::parse(format!("cannot index {}", other.kind_name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(yaml: &str, data: &[u8]) -> ParsedDocument {
        parse(yaml, data, &CompileOptions::default()).expect("parse should succeed")
    }

    fn fail(yaml: &str, data: &[u8]) -> Error {
        parse(yaml, data, &CompileOptions::default()).expect_err("parse should fail")
    }

    fn int_at(doc: &ParsedDocument, path: &str) -> i64 {
        doc.value_at(path)
            .unwrap_or_else(|e| panic!("lookup {path}: {e}"))
            .as_int()
            .unwrap_or_else(|| panic!("{path} is not an integer"))
    }

    fn str_at(doc: &ParsedDocument, path: &str) -> String {
        match doc.value_at(path).unwrap() {
            Value::Str(s) => s.to_string(),
            other => panic!("{path} is not a string: {other:?}"),
        }
    }

    mod scenarios {
        use super::*;

        #[test]
        fn gif_header_strings() {
            let d = doc(
                r#"
meta: { id: gif, encoding: ASCII }
seq:
  - id: header
    type: str
    size: 3
    valid: '"GIF"'
  - id: version
    type: str
    size: 3
"#,
                b"GIF89a",
            );
            assert_eq!(str_at(&d, "header"), "GIF");
            assert_eq!(str_at(&d, "version"), "89a");
        }

        #[test]
        fn mz_magic_and_le_integers() {
            let d = doc(
                r#"
meta: { id: mz, endian: le }
seq:
  - id: magic
    contents: [0x4d, 0x5a]
  - id: version
    type: u2
  - id: count
    type: u4
"#,
                &[0x4d, 0x5a, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00],
            );
            assert_eq!(int_at(&d, "magic[0]"), 77);
            assert_eq!(int_at(&d, "magic[1]"), 90);
            assert_eq!(int_at(&d, "version"), 1);
            assert_eq!(int_at(&d, "count"), 0);
        }

        #[test]
        fn endianness_switched_on_earlier_field() {
            let yaml = r#"
meta:
  id: container
  endian:
    switch-on: byte_order
    cases:
      0: le
      1: be
seq:
  - id: byte_order
    type: u1
  - id: value
    type: u4
"#;
            let d = doc(yaml, &[0x01, 0x01, 0x02, 0x03, 0x04]);
            assert_eq!(int_at(&d, "value"), 0x01020304);
            let d = doc(yaml, &[0x00, 0x01, 0x02, 0x03, 0x04]);
            assert_eq!(int_at(&d, "value"), 0x04030201);
        }

        #[test]
        fn counted_repeat() {
            let d = doc(
                r#"
meta: { id: counted, endian: le }
seq:
  - id: count
    type: u2
  - id: values
    type: u4
    repeat: expr
    repeat-expr: count
"#,
                &[
                    0x03, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x1e, 0x00, 0x00,
                    0x00,
                ],
            );
            assert_eq!(int_at(&d, "count"), 3);
            assert_eq!(int_at(&d, "values[0]"), 10);
            assert_eq!(int_at(&d, "values[1]"), 20);
            assert_eq!(int_at(&d, "values[2]"), 30);
        }

        #[test]
        fn tlv_until_end_of_stream() {
            let d = doc(
                r#"
meta: { id: tlv }
seq:
  - id: items
    type: item
    repeat: eos
types:
  item:
    seq:
      - id: tag
        type: u1
      - id: len
        type: u1
      - id: value
        size: len
"#,
                &[0x02, 0x03, 0xaa, 0xbb, 0xcc, 0x02, 0x02, 0xdd, 0xee],
            );
            assert_eq!(int_at(&d, "items[0].value[2]"), 0xcc);
            assert_eq!(int_at(&d, "items[1].value[0]"), 0xdd);
            assert_eq!(int_at(&d, "items[1].value[1]"), 0xee);
            match d.value_at("items").unwrap() {
                Value::Array(items) => assert_eq!(items.len(), 2),
                other => panic!("expected array, got {other:?}"),
            }
        }

        #[test]
        fn zlib_processed_string() {
            use flate2::write::ZlibEncoder;
            use flate2::Compression;
            use std::io::Write;

            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(b"Hello").unwrap();
            let packed = enc.finish().unwrap();

            let d = doc(
                r#"
meta: { id: packed, encoding: UTF-8 }
seq:
  - id: body
    type: str
    size-eos: true
    process: zlib
"#,
                &packed,
            );
            assert_eq!(str_at(&d, "body"), "Hello");
        }
    }

    mod bit_fields {
        use super::*;

        #[test]
        fn big_endian_bit_split() {
            let d = doc(
                r#"
meta: { id: bits }
seq:
  - id: high
    type: b3
  - id: low
    type: b5
"#,
                &[0b1011_0110],
            );
            assert_eq!(int_at(&d, "high"), 0b101);
            assert_eq!(int_at(&d, "low"), 0b10110);
        }

        #[test]
        fn little_endian_bit_order_from_meta() {
            let d = doc(
                r#"
meta:
  id: bits
  bit-endian: le
seq:
  - id: low
    type: b3
  - id: high
    type: b5
"#,
                &[0b1011_0110],
            );
            assert_eq!(int_at(&d, "low"), 0b110);
            assert_eq!(int_at(&d, "high"), 0b10110);
        }

        #[test]
        fn wide_bit_field_promotes_to_bigint() {
            let d = doc(
                r#"
meta: { id: bits }
seq:
  - id: wide
    type: b64
"#,
                &[0xff; 8],
            );
            let rendered = d.to_json();
            assert_eq!(rendered["wide"], json!("18446744073709551615"));
        }

        #[test]
        fn bits_then_aligned_byte() {
            let d = doc(
                r#"
meta: { id: bits }
seq:
  - id: flag
    type: b1
  - id: aligned
    type: u1
"#,
                &[0b1000_0000, 0x42],
            );
            assert_eq!(int_at(&d, "flag"), 1);
            assert_eq!(int_at(&d, "aligned"), 0x42);
        }
    }

    mod repetition {
        use super::*;

        #[test]
        fn until_includes_terminating_element() {
            let d = doc(
                r#"
meta: { id: rep }
seq:
  - id: nums
    type: u1
    repeat: until
    repeat-until: _ == 0
"#,
                &[5, 3, 0, 7],
            );
            match d.value_at("nums").unwrap() {
                Value::Array(items) => assert_eq!(items.len(), 3),
                other => panic!("expected array, got {other:?}"),
            }
            assert_eq!(int_at(&d, "nums[2]"), 0);
        }

        #[test]
        fn until_sees_repeat_index() {
            let d = doc(
                r#"
meta: { id: rep }
seq:
  - id: nums
    type: u1
    repeat: until
    repeat-until: _index == 2
"#,
                &[9, 9, 9, 9],
            );
            match d.value_at("nums").unwrap() {
                Value::Array(items) => assert_eq!(items.len(), 3),
                other => panic!("expected array, got {other:?}"),
            }
        }

        #[test]
        fn eos_on_empty_stream_yields_empty_array() {
            let d = doc(
                r#"
meta: { id: rep }
seq:
  - id: nums
    type: u1
    repeat: eos
"#,
                &[],
            );
            match d.value_at("nums").unwrap() {
                Value::Array(items) => assert!(items.is_empty()),
                other => panic!("expected array, got {other:?}"),
            }
        }
    }

    mod instances {
        use super::*;

        #[test]
        fn value_instances_memoize() {
            let d = doc(
                r#"
meta: { id: inst }
seq:
  - id: len
    type: u1
instances:
  doubled:
    value: len * 2
"#,
                &[0x15],
            );
            assert_eq!(int_at(&d, "doubled"), 0x2a);
            assert_eq!(int_at(&d, "doubled"), 0x2a);
        }

        #[test]
        fn positioned_instance_restores_stream() {
            let d = doc(
                r#"
meta: { id: inst }
seq:
  - id: len
    type: u1
  - id: rest
    size-eos: true
instances:
  at_offset:
    pos: len
    type: u1
"#,
                &[0x02, 0xaa, 0xbb],
            );
            assert_eq!(int_at(&d, "at_offset"), 0xbb);
            assert_eq!(int_at(&d, "rest[0]"), 0xaa);
        }

        #[test]
        fn cyclic_instances_are_detected() {
            let d = doc(
                r#"
meta: { id: inst }
seq:
  - id: x
    type: u1
instances:
  a:
    value: b + 1
  b:
    value: a + 1
"#,
                &[0],
            );
            let err = d.value_at("a").unwrap_err();
            assert!(err.to_string().contains("cyclic"), "{err}");
        }

        #[test]
        fn instance_reading_from_a_field_substream() {
            let d = doc(
                r#"
meta: { id: inst }
seq:
  - id: blk
    type: holder
    size: 4
types:
  holder:
    seq:
      - id: raw
        size-eos: true
instances:
  first_again:
    io: blk._io
    pos: 0
    type: u1
"#,
                &[0x0a, 0x0b, 0x0c, 0x0d, 0x0e],
            );
            assert_eq!(int_at(&d, "first_again"), 0x0a);
        }

        #[test]
        fn sizeof_is_frozen_after_seq() {
            let d = doc(
                r#"
meta: { id: inst, endian: le }
seq:
  - id: a
    type: u2
  - id: b
    size: 3
instances:
  total:
    value: _sizeof
"#,
                &[1, 0, 2, 3, 4],
            );
            assert_eq!(int_at(&d, "total"), 5);
        }
    }

    mod user_types {
        use super::*;

        #[test]
        fn parametric_type_binds_arguments() {
            let d = doc(
                r#"
meta: { id: par }
seq:
  - id: n
    type: u1
  - id: body
    type: block(n)
types:
  block:
    params:
      - id: count
    seq:
      - id: data
        size: count
"#,
                &[0x03, 0x01, 0x02, 0x03],
            );
            assert_eq!(int_at(&d, "body.count"), 3);
            assert_eq!(int_at(&d, "body.data[2]"), 3);
        }

        #[test]
        fn wrong_arity_is_rejected_at_call() {
            let err = fail(
                r#"
meta: { id: par }
seq:
  - id: body
    type: block(1, 2)
types:
  block:
    params:
      - id: count
    seq:
      - id: data
        size: count
"#,
                &[0x00],
            );
            assert!(err.to_string().contains("argument"), "{err}");
        }

        #[test]
        fn parent_and_root_references() {
            let d = doc(
                r#"
meta: { id: fam }
seq:
  - id: total
    type: u1
  - id: child
    type: kid
types:
  kid:
    seq:
      - id: data
        size: _parent.total - 1
      - id: same
        size: _root.total - 2
"#,
                &[0x03, 0xaa, 0xbb, 0xcc],
            );
            assert_eq!(int_at(&d, "child.data[1]"), 0xbb);
            assert_eq!(int_at(&d, "child.same[0]"), 0xcc);
        }

        #[test]
        fn sized_user_type_gets_a_substream() {
            let d = doc(
                r#"
meta: { id: sub }
seq:
  - id: blk
    type: holder
    size: 2
  - id: after
    type: u1
types:
  holder:
    seq:
      - id: everything
        size-eos: true
"#,
                &[0x01, 0x02, 0x03],
            );
            match d.value_at("blk.everything").unwrap() {
                Value::Bytes(b) => assert_eq!(&*b, &[0x01, 0x02]),
                other => panic!("expected bytes, got {other:?}"),
            }
            assert_eq!(int_at(&d, "after"), 0x03);
        }
    }

    mod switching {
        use super::*;

        const SCHEMA: &str = r#"
meta: { id: rec, endian: le }
seq:
  - id: kind
    type: u1
    enum: rec_kind
  - id: body
    type:
      switch-on: kind
      cases:
        'rec_kind::alpha': rec_a
        _: rec_b
types:
  rec_a:
    seq:
      - id: a
        type: u1
  rec_b:
    seq:
      - id: b
        type: u2
enums:
  rec_kind:
    1: alpha
    2: beta
"#;

        #[test]
        fn enum_case_key_selects_type() {
            let d = doc(SCHEMA, &[0x01, 0x07]);
            assert_eq!(int_at(&d, "body.a"), 0x07);
        }

        #[test]
        fn default_case_fallback() {
            let d = doc(SCHEMA, &[0x02, 0x07, 0x00]);
            assert_eq!(int_at(&d, "body.b"), 0x07);
        }

        #[test]
        fn enum_labels_serialize_symbolically() {
            let d = doc(SCHEMA, &[0x01, 0x07]);
            assert_eq!(d.to_json()["kind"], json!("alpha"));
        }
    }

    mod processing {
        use super::*;

        #[test]
        fn xor_with_single_byte_key() {
            let d = doc(
                r#"
meta: { id: x }
seq:
  - id: body
    size: 3
    process: xor(0x5f)
"#,
                &[0x5f ^ 0x01, 0x5f ^ 0x02, 0x5f ^ 0x03],
            );
            assert_eq!(int_at(&d, "body[0]"), 1);
            assert_eq!(int_at(&d, "body[2]"), 3);
        }

        #[test]
        fn processed_user_type_reads_its_own_region() {
            let d = doc(
                r#"
meta: { id: x }
seq:
  - id: blk
    type: inner
    size: 2
    process: xor(0xff)
types:
  inner:
    seq:
      - id: v
        type: u1
      - id: w
        type: u1
"#,
                &[!0x0au8, !0x0bu8],
            );
            assert_eq!(int_at(&d, "blk.v"), 0x0a);
            assert_eq!(int_at(&d, "blk.w"), 0x0b);
        }

        #[test]
        fn unknown_algorithm_is_not_implemented() {
            let err = fail(
                r#"
meta: { id: x }
seq:
  - id: body
    size: 2
    process: rot13
"#,
                &[0x00, 0x01],
            );
            assert_eq!(err.kind(), ErrorKind::NotImplemented);
        }
    }

    mod failures {
        use super::*;

        #[test]
        fn contents_mismatch_reports_offending_byte() {
            let err = fail(
                r#"
meta: { id: m }
seq:
  - id: magic
    contents: [0x4d, 0x5a]
"#,
                &[0x4d, 0x00, 0x01],
            );
            assert_eq!(err.kind(), ErrorKind::Validation);
            assert_eq!(err.pos(), Some(1));
        }

        #[test]
        fn short_read_propagates_position() {
            let err = fail(
                r#"
meta: { id: m, endian: le }
seq:
  - id: a
    type: u1
  - id: b
    type: u4
"#,
                &[0x01, 0x02],
            );
            assert_eq!(err.kind(), ErrorKind::EndOfStream);
            assert_eq!(err.pos(), Some(1));
        }

        #[test]
        fn valid_range_failure() {
            let err = fail(
                r#"
meta: { id: m }
seq:
  - id: version
    type: u1
    valid:
      min: 2
      max: 4
"#,
                &[0x09],
            );
            assert_eq!(err.kind(), ErrorKind::Validation);
        }

        #[test]
        fn endian_switch_over_unparsed_field_is_rejected() {
            let err = fail(
                r#"
meta:
  id: m
  endian:
    switch-on: later_field
    cases:
      0: le
seq:
  - id: value
    type: u4
  - id: later_field
    type: u1
"#,
                &[0, 0, 0, 0, 0],
            );
            assert_eq!(err.kind(), ErrorKind::Parse);
            assert!(err.to_string().contains("later_field"), "{err}");
        }
    }

    mod serialization {
        use super::*;

        #[test]
        fn bytes_render_as_integer_arrays() {
            let d = doc(
                r#"
meta: { id: s }
seq:
  - id: raw
    size: 3
"#,
                &[1, 2, 3],
            );
            assert_eq!(d.to_json()["raw"], json!([1, 2, 3]));
        }

        #[test]
        fn big_u8_renders_as_decimal_string() {
            let d = doc(
                r#"
meta: { id: s, endian: be }
seq:
  - id: huge
    type: u8
"#,
                &[0xff; 8],
            );
            assert_eq!(d.to_json()["huge"], json!("18446744073709551615"));
        }

        #[test]
        fn instance_errors_are_captured_per_field() {
            let d = doc(
                r#"
meta: { id: s }
seq:
  - id: a
    type: u1
instances:
  beyond:
    pos: 100
    type: u1
"#,
                &[0x01],
            );
            let rendered = d.to_json();
            assert_eq!(rendered["a"], json!(1));
            let beyond = rendered["beyond"].as_str().unwrap();
            assert!(beyond.starts_with("[Error:"), "{beyond}");
        }

        #[test]
        fn self_reference_breaks_as_circular() {
            let d = doc(
                r#"
meta: { id: s }
seq:
  - id: a
    type: u1
instances:
  myself:
    value: _root
"#,
                &[0x01],
            );
            assert_eq!(d.to_json()["myself"], json!("[Circular]"));
        }
    }

    mod api {
        use super::*;

        #[test]
        fn parse_equals_parse_with_schema() {
            let yaml = r#"
meta: { id: p, endian: le }
seq:
  - id: a
    type: u2
  - id: rest
    size-eos: true
"#;
            let data = [0x01, 0x00, 0xaa, 0xbb];
            let via_text = parse(yaml, &data, &CompileOptions::default()).unwrap();
            let compiled = Rc::new(compile_schema(yaml, &CompileOptions::default()).unwrap());
            let via_compiled = parse_with_schema(compiled, &data).unwrap();
            assert_eq!(via_text.to_json(), via_compiled.to_json());
        }

        #[test]
        fn compiled_schema_is_reusable() {
            let compiled = Rc::new(
                compile_schema(
                    "meta: { id: p }\nseq:\n  - id: a\n    type: u1\n",
                    &CompileOptions::default(),
                )
                .unwrap(),
            );
            let first = parse_with_schema(Rc::clone(&compiled), &[1]).unwrap();
            let second = parse_with_schema(Rc::clone(&compiled), &[2]).unwrap();
            assert_eq!(first.to_json()["a"], json!(1));
            assert_eq!(second.to_json()["a"], json!(2));
        }

        #[test]
        fn value_at_rejects_unknown_fields() {
            let d = doc("meta: { id: p }\nseq:\n  - id: a\n    type: u1\n", &[1]);
            assert!(d.value_at("missing").is_err());
            assert!(d.value_at("a[0]").is_err());
        }
    }
}
