//! `pyrite` library crate: an embeddable interpreter for a dynamically
//! typed, Python-subset scripting language.
//!
//! High-level layout:
//! - frontend: `lexer` + `parser` produce the shared AST (`parser::ast`)
//! - `bytecode`: instruction set and AST -> bytecode compiler
//! - `vm`: stack-machine interpreter
//! - `runtime`: object model, attribute tables, context, and GC
//! - `builtins`: native classes/functions plus the in-Language prelude
//!
//! A host embeds the interpreter through [`Context`]: compile source text
//! into a callable function object, call it, and inspect results or the
//! current exception through `ObjId` handles.
pub(crate) mod builtins;
pub mod bytecode;
pub mod lexer;
pub mod parser;
pub mod runtime;
pub mod token;
pub(crate) mod vm;

pub use parser::ast;
pub use runtime::context::{Config, Context, ModuleLoader};
pub use runtime::exception::{Exec, ExceptionKind, Raised};
pub use runtime::object::ObjId;
