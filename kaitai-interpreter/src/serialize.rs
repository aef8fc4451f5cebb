//! Rendering parsed trees for output.
//!
//! Byte sequences become integer arrays, big integers become decimal
//! strings, internal fields (`_io`, `_root`, `_parent`, `_start_pos`,
//! `_sizeof`) are omitted, reference cycles collapse to the literal
//! `"[Circular]"`, and a lazy instance whose evaluation fails renders as
//! `"[Error: <message>]"` instead of aborting the whole serialization.

use crate::errors::Error;
use crate::interpreter;
use crate::schema::CompiledSchema;
use crate::value::{NodeId, ObjectArena, Value};
use crate::ParsedDocument;
use serde_json::json;

pub(crate) fn document_to_json(doc: &ParsedDocument) -> serde_json::Value {
    let mut arena = doc.arena.borrow_mut();
    let mut visiting = Vec::new();
    node_to_json(&doc.schema, &mut arena, doc.root, &mut visiting)
}

fn node_to_json(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    id: NodeId,
    visiting: &mut Vec<NodeId>,
) -> serde_json::Value {
    if visiting.contains(&id) {
        return json!("[Circular]");
    }
    visiting.push(id);

    let fields: Vec<(String, Value)> = arena
        .get(id)
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let instance_names: Vec<String> = arena.get(id).instances.keys().cloned().collect();

    let mut obj = serde_json::Map::new();
    for (name, value) in fields {
        obj.insert(name, value_to_json(schema, arena, &value, visiting));
    }
    for name in instance_names {
        match interpreter::instance_enabled(schema, arena, id, &name) {
            Ok(false) => continue,
            Ok(true) => match interpreter::force_instance(schema, arena, id, &name) {
                Ok(value) => {
                    let rendered = value_to_json(schema, arena, &value, visiting);
                    obj.insert(name, rendered);
                }
                Err(e) => {
                    obj.insert(name, json!(format!("[Error: {}]", brief_error(&e))));
                }
            },
            Err(e) => {
                obj.insert(name, json!(format!("[Error: {}]", brief_error(&e))));
            }
        }
    }

    visiting.pop();
    serde_json::Value::Object(obj)
}

fn value_to_json(
    schema: &CompiledSchema,
    arena: &mut ObjectArena,
    value: &Value,
    visiting: &mut Vec<NodeId>,
) -> serde_json::Value {
    match value {
        Value::Int(i) => json!(i),
        Value::BigInt(b) => json!(b.to_string()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Bool(b) => json!(b),
        Value::Str(s) => json!(&**s),
        Value::Bytes(bytes) => {
            serde_json::Value::Array(bytes.iter().map(|b| json!(b)).collect())
        }
        Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|v| value_to_json(schema, arena, v, visiting))
                .collect(),
        ),
        Value::Object(id) => node_to_json(schema, arena, *id, visiting),
        Value::Enum(e) => match &e.label {
            Some(label) => json!(&**label),
            None => json!(e.value),
        },
        Value::Stream(_) => json!("[Stream]"),
    }
}

fn brief_error(e: &Error) -> String {
    let msg = e.message();
    let mut out = if msg.is_empty() {
        e.kind().as_str().to_string()
    } else {
        msg.to_string()
    };
    if let Some(pos) = e.pos() {
        out.push_str(&format!(" at byte {pos}"));
    }
    out
}
