//! Schema handling: the raw serde model of `.ksy` text, the compiled
//! in-memory form the interpreter executes, the validator that maps one to
//! the other, and import merging.

pub mod imports;
pub mod model;
pub mod raw;
pub mod validator;

pub use model::{CompiledSchema, Diagnostic, Severity};
pub use validator::{compile, CompileOptions, ImportResolver};
