//! Import merging.
//!
//! For every entry in `meta.imports` the resolver supplies schema text;
//! the imported schema is compiled, its own imports are merged first
//! (depth-first), and its top-level type plus its nested types and enums
//! land in the importing schema's root under a `ns::name` prefix, where
//! `ns` is the last `/`-separated segment of the import path. Existing
//! definitions are never overridden; the earliest wins.

use crate::schema::model::UserType;
use crate::schema::raw::RawSchema;
use crate::schema::validator::{compile_type, Ctx, ImportResolver};
use indexmap::IndexMap;
use std::collections::HashSet;

pub(crate) fn merge(
    root: &mut UserType,
    resolver: Option<&dyn ImportResolver>,
    path: &str,
    ctx: &mut Ctx,
) {
    let mut seen = HashSet::new();
    merge_into(root, resolver, path, ctx, &mut seen);
}

fn merge_into(
    target: &mut UserType,
    resolver: Option<&dyn ImportResolver>,
    path: &str,
    ctx: &mut Ctx,
    seen: &mut HashSet<String>,
) {
    for import in target.meta.imports.clone() {
        if !seen.insert(import.clone()) {
            continue;
        }
        let Some(resolver) = resolver else {
            ctx.error(path, format!("schema imports {import:?} but no import resolver was provided"));
            continue;
        };
        let Some(text) = resolver.resolve(&import) else {
            ctx.error(path, format!("cannot resolve import {import:?}"));
            continue;
        };
        let raw: RawSchema = match serde_yaml::from_str(&text) {
            Ok(raw) => raw,
            Err(e) => {
                ctx.error(path, format!("import {import:?} failed to parse: {e}"));
                continue;
            }
        };

        let ns = import.rsplit('/').next().unwrap_or(&import).to_string();
        let import_path = format!("imports/{ns}");
        let mut imported = compile_type(&raw, &import_path, ctx);
        merge_into(&mut imported, Some(resolver), &import_path, ctx, seen);

        for (name, ty) in std::mem::take(&mut imported.types) {
            insert_type(&mut target.types, format!("{ns}::{name}"), ty, &import_path, ctx);
        }
        for (name, def) in std::mem::take(&mut imported.enums) {
            let key = format!("{ns}::{name}");
            if target.enums.contains_key(&key) {
                ctx.warn(&import_path, format!("enum {key:?} already defined; keeping the earlier one"));
            } else {
                target.enums.insert(key, def);
            }
        }
        // The imported file's own top-level type, addressable by its id.
        let imported_id = imported.meta.id.clone().unwrap_or_else(|| ns.clone());
        insert_type(
            &mut target.types,
            format!("{ns}::{imported_id}"),
            imported,
            &import_path,
            ctx,
        );
    }
}

fn insert_type(
    types: &mut IndexMap<String, UserType>,
    key: String,
    ty: UserType,
    path: &str,
    ctx: &mut Ctx,
) {
    if types.contains_key(&key) {
        ctx.warn(path, format!("type {key:?} already defined; keeping the earlier one"));
    } else {
        types.insert(key, ty);
    }
}
