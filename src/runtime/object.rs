use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::FunctionCode;
use crate::runtime::attributes::AttributeTable;
use crate::runtime::context::Context;
use crate::runtime::exception::{Exec, ExceptionKind, Raised};

/// Handle to an object in a context arena. Only meaningful together with the
/// context that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjId(u32);

impl ObjId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Shared mutable variable slot. The defining frame and every closure that
/// captures the name hold the same cell, so writes on either side are seen
/// by both. Module globals use the same representation.
pub(crate) type CellRef = Rc<RefCell<Option<ObjId>>>;

pub(crate) fn new_cell() -> CellRef {
    Rc::new(RefCell::new(None))
}

pub(crate) type NativeFn = fn(&mut Context, &[ObjId]) -> Exec<ObjId>;

/// Built-in type tags; user class instances carry their class name instead.
pub(crate) mod type_tag {
    pub const NULL: &str = "__null";
    pub const BOOL: &str = "__bool";
    pub const INT: &str = "__int";
    pub const FLOAT: &str = "__float";
    pub const STR: &str = "__str";
    pub const TUPLE: &str = "__tuple";
    pub const LIST: &str = "__list";
    pub const MAP: &str = "__map";
    pub const SET: &str = "__set";
    pub const FUNC: &str = "__func";
    pub const CLASS: &str = "__class";
    pub const OBJECT: &str = "__obj";
}

/// Renders a type tag the way error messages and class names expect.
pub(crate) fn display_type_name(tag: &str) -> &str {
    match tag {
        type_tag::NULL => "NoneType",
        type_tag::BOOL => "bool",
        type_tag::INT => "int",
        type_tag::FLOAT => "float",
        type_tag::STR => "str",
        type_tag::TUPLE => "tuple",
        type_tag::LIST => "list",
        type_tag::MAP => "dict",
        type_tag::SET => "set",
        type_tag::FUNC => "function",
        type_tag::CLASS => "type",
        type_tag::OBJECT => "object",
        other => other,
    }
}

pub(crate) struct Obj {
    pub(crate) type_name: Rc<str>,
    pub(crate) payload: Payload,
    pub(crate) attributes: AttributeTable,
    /// Auxiliary owned references kept alive as long as this object is.
    pub(crate) references: Vec<ObjId>,
    pub(crate) finalizer: Option<Finalizer>,
    pub(crate) marked: bool,
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Obj({})", self.type_name)
    }
}

pub(crate) struct Finalizer(pub(crate) Box<dyn FnMut()>);

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Finalizer")
    }
}

#[derive(Debug)]
pub(crate) enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ObjId>),
    List(Vec<ObjId>),
    Dict(IndexMap<HashKey, (ObjId, ObjId)>),
    Set(IndexMap<HashKey, ObjId>),
    Func(FuncPayload),
    Class(ClassPayload),
    /// Plain attribute-bag instance of a user-defined class.
    Instance,
}

#[derive(Debug, Clone)]
pub(crate) struct FuncPayload {
    pub(crate) self_obj: Option<ObjId>,
    pub(crate) kind: FuncKind,
    pub(crate) is_method: bool,
    pub(crate) module: String,
    pub(crate) pretty_name: String,
    /// Captured cells resolved when the function object was materialized.
    pub(crate) captures: HashMap<String, CellRef>,
    /// Default argument values, evaluated at definition time, aligned with
    /// the tail of the parameter list.
    pub(crate) defaults: Vec<ObjId>,
    /// Extra object available to native functions through the context
    /// (classes pass themselves to their constructor this way).
    pub(crate) userdata: Option<ObjId>,
}

#[derive(Clone)]
pub(crate) enum FuncKind {
    Native(NativeFn),
    Script(Rc<FunctionCode>),
}

impl fmt::Debug for FuncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(_) => write!(f, "Native"),
            Self::Script(_) => write!(f, "Script"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ClassPayload {
    pub(crate) name: String,
    pub(crate) bases: Vec<ObjId>,
    /// Prototype attribute table for new instances; also searched when
    /// attributes are looked up on instances through the parent chain.
    pub(crate) instance_attributes: AttributeTable,
    pub(crate) ctor: NativeFn,
    pub(crate) userdata: Option<ObjId>,
    pub(crate) module: String,
}

/// Precomputed hash identity for dictionary keys and set elements. Only
/// immutable builtin values are hashable; `True` hashes like `1` and
/// integral floats hash like the matching int, mirroring Python equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum HashKey {
    None,
    Int(i64),
    FloatBits(u64),
    Str(String),
    Tuple(Vec<HashKey>),
}

impl Context {
    pub(crate) fn hash_key(&mut self, id: ObjId) -> Exec<HashKey> {
        let key = match &self.obj(id).payload {
            Payload::Null => HashKey::None,
            Payload::Bool(value) => HashKey::Int(i64::from(*value)),
            Payload::Int(value) => HashKey::Int(*value),
            Payload::Float(value) => {
                let value = *value;
                if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
                    HashKey::Int(value as i64)
                } else {
                    HashKey::FloatBits(value.to_bits())
                }
            }
            Payload::Str(value) => HashKey::Str(value.clone()),
            Payload::Tuple(items) => {
                let items = items.clone();
                let mut keys = Vec::with_capacity(items.len());
                for item in items {
                    keys.push(self.hash_key(item)?);
                }
                HashKey::Tuple(keys)
            }
            _ => {
                let type_name = display_type_name(&self.obj(id).type_name).to_string();
                self.raise_exception(
                    ExceptionKind::TypeError,
                    &format!("unhashable type: '{type_name}'"),
                );
                return Err(Raised);
            }
        };
        Ok(key)
    }
}
