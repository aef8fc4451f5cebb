//! Name-resolution frame for one expression evaluation.
//!
//! A [`Context`] bundles the current node, the active stream, and the
//! repeat-loop bindings, and resolves identifiers in the fixed order:
//! parameters of the current type instance, then fields already assigned
//! on the node (forcing lazy instances when one is named), then the
//! pseudo-identifiers `_root`, `_parent`, `_io`, `_`, `_index` and
//! `_sizeof`. Failure to resolve is a `ParseError`, never a silent nil.

use crate::errors::{Error, Result};
use crate::interpreter;
use crate::schema::CompiledSchema;
use crate::stream::SharedStream;
use crate::value::{NodeId, ObjectArena, Value};

pub struct Context<'a> {
    pub schema: &'a CompiledSchema,
    pub arena: &'a mut ObjectArena,
    pub node: NodeId,
    /// The active stream, bound to `_io`.
    pub io: SharedStream,
    /// Zero-based repeat index, bound to `_index` inside a repeat body.
    pub index: Option<i64>,
    /// Binding for `_` inside a `repeat-until` condition; everywhere else
    /// `_` is the current node.
    pub elem: Option<Value>,
}

impl<'a> Context<'a> {
    pub fn new(
        schema: &'a CompiledSchema,
        arena: &'a mut ObjectArena,
        node: NodeId,
        io: SharedStream,
    ) -> Context<'a> {
        Context {
            schema,
            arena,
            node,
            io,
            index: None,
            elem: None,
        }
    }

    pub fn lookup_ident(&mut self, name: &str) -> Result<Value> {
        match name {
            "_root" => Ok(Value::Object(self.arena.get(self.node).root)),
            "_parent" => self
                .arena
                .get(self.node)
                .parent
                .map(Value::Object)
                .ok_or_else(|| Error::parse("`_parent` is not available on the root object")),
            "_io" => Ok(Value::Stream(self.io.clone())),
            "_" => Ok(self
                .elem
                .clone()
                .unwrap_or(Value::Object(self.node))),
            "_index" => self
                .index
                .map(Value::Int)
                .ok_or_else(|| Error::parse("`_index` is only defined inside a repeat")),
            "_sizeof" => Ok(Value::Int(self.live_sizeof(self.node))),
            _ => {
                let node = self.arena.get(self.node);
                if let Some(v) = node.params.get(name) {
                    return Ok(v.clone());
                }
                if let Some(v) = node.fields.get(name) {
                    return Ok(v.clone());
                }
                if node.instances.contains_key(name) {
                    return interpreter::force_instance(self.schema, self.arena, self.node, name);
                }
                Err(Error::parse(format!("unresolved identifier `{name}`")))
            }
        }
    }

    /// Member access on a parsed object, including the pseudo-members.
    pub fn object_member(&mut self, id: NodeId, name: &str) -> Result<Value> {
        match name {
            "_root" => Ok(Value::Object(self.arena.get(id).root)),
            "_parent" => self
                .arena
                .get(id)
                .parent
                .map(Value::Object)
                .ok_or_else(|| Error::parse("`_parent` is not available on the root object")),
            "_io" => Ok(Value::Stream(self.arena.get(id).io.clone())),
            "_sizeof" => Ok(Value::Int(self.live_sizeof(id))),
            _ => {
                let node = self.arena.get(id);
                if let Some(v) = node.params.get(name) {
                    return Ok(v.clone());
                }
                if let Some(v) = node.fields.get(name) {
                    return Ok(v.clone());
                }
                if node.instances.contains_key(name) {
                    return interpreter::force_instance(self.schema, self.arena, id, name);
                }
                Err(Error::parse(format!("object has no field `{name}`")))
            }
        }
    }

    /// `enum_name::member` (optionally type-qualified) to its integer value.
    pub fn resolve_enum_ref(&mut self, path: &[String]) -> Result<Value> {
        let (member, enum_path) = path
            .split_last()
            .ok_or_else(|| Error::parse("empty enum reference"))?;
        let type_path = self.arena.get(self.node).type_path.clone();
        let (enum_name, def) = self
            .schema
            .resolve_enum(&type_path, enum_path)
            .ok_or_else(|| {
                Error::parse(format!("unresolved enum `{}`", enum_path.join("::")))
            })?;
        def.value_of(member).map(Value::Int).ok_or_else(|| {
            Error::parse(format!("unknown enum member `{enum_name}::{member}`"))
        })
    }

    /// Bytes consumed by a node so far; frozen once its seq completes.
    fn live_sizeof(&self, id: NodeId) -> i64 {
        let node = self.arena.get(id);
        if node.finalized {
            node.sizeof as i64
        } else {
            let pos = node.io.borrow().pos();
            pos.saturating_sub(node.start_pos) as i64
        }
    }
}
