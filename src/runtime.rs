//! Runtime object model, context state, and garbage collection.
//!
//! Every Language value is an [`object::Obj`] living in a context-owned
//! arena and addressed by a copyable [`object::ObjId`] handle. The
//! [`context::Context`] owns the arena, module globals, the protection set,
//! and the interpreter frame stack, which together form the GC root set.
pub(crate) mod attributes;
pub mod context;
pub(crate) mod exception;
pub(crate) mod gc;
pub(crate) mod object;
