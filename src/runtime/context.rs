use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode;
use crate::runtime::attributes::AttributeTable;
use crate::runtime::exception::{Exec, ExceptionKind, MODULE_FUNC_NAME, Raised, TraceFrame};
use crate::runtime::gc::Arena;
use crate::runtime::object::{
    CellRef, ClassPayload, FuncKind, FuncPayload, NativeFn, Obj, ObjId, Payload, display_type_name,
    new_cell, type_tag,
};
use crate::vm::{self, Frame};
use crate::{lexer, parser};

pub type ModuleLoader = fn(&mut Context) -> Exec<()>;
pub type PrintSink = Box<dyn FnMut(&str)>;

pub(crate) type ModuleGlobals = HashMap<String, CellRef>;

/// Host-tunable limits and hooks, mirroring the embedding configuration of
/// the original engine.
pub struct Config {
    /// Hard cap on live objects before allocation raises MemoryError.
    pub max_alloc: usize,
    /// Maximum interpreter frame depth before RecursionError.
    pub max_recursion: usize,
    /// Cap on container element counts.
    pub max_collection_size: usize,
    /// Arena growth factor before the next automatic collection (>= 1.0).
    pub gc_run_factor: f32,
    /// Output sink for the builtin `print`.
    pub print: PrintSink,
    /// Values surfaced as `sys.argv`.
    pub argv: Vec<String>,
    /// When false the `os` module is not registered.
    pub enable_os_access: bool,
    /// Surfaced on `sys.stdin.isatty()`.
    pub isatty: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_alloc: 100_000,
            max_recursion: 100,
            max_collection_size: 1_000_000_000,
            gc_run_factor: 2.0,
            print: Box::new(|text| {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }),
            argv: Vec::new(),
            enable_os_access: false,
            isatty: false,
        }
    }
}

/// Interned type-tag strings shared by every object of a builtin type.
#[derive(Debug, Clone)]
pub(crate) struct TypeTags {
    pub null: Rc<str>,
    pub bool_: Rc<str>,
    pub int: Rc<str>,
    pub float: Rc<str>,
    pub str_: Rc<str>,
    pub tuple: Rc<str>,
    pub list: Rc<str>,
    pub map: Rc<str>,
    pub set: Rc<str>,
    pub func: Rc<str>,
    pub class: Rc<str>,
    pub object: Rc<str>,
}

impl Default for TypeTags {
    fn default() -> Self {
        Self {
            null: Rc::from(type_tag::NULL),
            bool_: Rc::from(type_tag::BOOL),
            int: Rc::from(type_tag::INT),
            float: Rc::from(type_tag::FLOAT),
            str_: Rc::from(type_tag::STR),
            tuple: Rc::from(type_tag::TUPLE),
            list: Rc::from(type_tag::LIST),
            map: Rc::from(type_tag::MAP),
            set: Rc::from(type_tag::SET),
            func: Rc::from(type_tag::FUNC),
            class: Rc::from(type_tag::CLASS),
            object: Rc::from(type_tag::OBJECT),
        }
    }
}

/// Well-known objects registered at context creation. The zero id is a
/// placeholder until registration fills the real handles in.
#[derive(Debug, Default)]
pub(crate) struct Builtins {
    pub object_class: ObjId,
    pub none: ObjId,
    pub bool_true: ObjId,
    pub bool_false: ObjId,
    pub none_class: ObjId,
    pub bool_class: ObjId,
    pub int_class: ObjId,
    pub float_class: ObjId,
    pub str_class: ObjId,
    pub tuple_class: ObjId,
    pub list_class: ObjId,
    pub dict_class: ObjId,
    pub set_class: ObjId,
    pub func_class: ObjId,
    pub slice_class: ObjId,
    pub isinstance_fn: ObjId,
    pub exceptions: HashMap<ExceptionKind, ObjId>,
}

impl Builtins {
    pub(crate) fn exception_class(&self, kind: ExceptionKind) -> ObjId {
        *self
            .exceptions
            .get(&kind)
            .expect("exception classes are registered at context creation")
    }

    pub(crate) fn gather_roots(&self, pending: &mut Vec<ObjId>) {
        pending.extend([
            self.object_class,
            self.none,
            self.bool_true,
            self.bool_false,
            self.none_class,
            self.bool_class,
            self.int_class,
            self.float_class,
            self.str_class,
            self.tuple_class,
            self.list_class,
            self.dict_class,
            self.set_class,
            self.func_class,
            self.slice_class,
            self.isinstance_fn,
        ]);
        pending.extend(self.exceptions.values().copied());
    }
}

/// Per-interpreter state: the object arena, module globals, registered
/// loaders, the interpreter frame stack, and the current exception. A
/// context is a unit of isolation; separate contexts share nothing.
pub struct Context {
    pub(crate) config: Config,
    pub(crate) arena: Arena,
    pub(crate) protected: HashMap<ObjId, usize>,
    pub(crate) globals: HashMap<String, ModuleGlobals>,
    pub(crate) module_stack: Vec<String>,
    pub(crate) module_loaders: HashMap<String, ModuleLoader>,
    pub(crate) import_path: String,
    pub(crate) current_exception: Option<ObjId>,
    pub(crate) exception_trace: Vec<TraceFrame>,
    pub(crate) current_trace: Vec<TraceFrame>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) kwargs_stack: Vec<Option<ObjId>>,
    pub(crate) userdata_stack: Vec<Option<ObjId>>,
    pub(crate) builtins: Builtins,
    pub(crate) tags: TypeTags,
    pub(crate) argv_obj: Option<ObjId>,
    pub(crate) lock_gc: bool,
    pub(crate) alloc_cap_exempt: bool,
    pub(crate) last_count_after_gc: usize,
}

impl Context {
    pub fn new(config: Config) -> Self {
        let mut ctx = Self {
            config,
            arena: Arena::default(),
            protected: HashMap::new(),
            globals: HashMap::new(),
            module_stack: vec!["__main__".to_string()],
            module_loaders: HashMap::new(),
            import_path: String::new(),
            current_exception: None,
            exception_trace: Vec::new(),
            current_trace: Vec::new(),
            frames: Vec::new(),
            kwargs_stack: Vec::new(),
            userdata_stack: Vec::new(),
            builtins: Builtins::default(),
            tags: TypeTags::default(),
            argv_obj: None,
            lock_gc: false,
            alloc_cap_exempt: false,
            last_count_after_gc: 0,
        };
        ctx.globals.insert("__main__".to_string(), HashMap::new());

        ctx.register_module("__builtins__", crate::builtins::load_builtins_module);
        ctx.register_module("math", crate::builtins::modules::load_math_module);
        ctx.register_module("sys", crate::builtins::modules::load_sys_module);
        if ctx.config.enable_os_access {
            ctx.register_module("os", crate::builtins::modules::load_os_module);
        }

        crate::builtins::register(&mut ctx);

        if ctx.import_all_from_module("__builtins__").is_err() {
            // A failure this early leaves the exception set for the host to
            // inspect through error_message().
            return ctx;
        }

        let argv: Vec<String> = ctx.config.argv.clone();
        let mut argv_items = Vec::with_capacity(argv.len());
        for arg in &argv {
            let Ok(item) = ctx.new_string(arg) else {
                return ctx;
            };
            ctx.protect(item);
            argv_items.push(item);
        }
        if let Ok(argv_obj) = ctx.new_list(&argv_items) {
            ctx.argv_obj = Some(argv_obj);
        }
        for &item in &argv_items {
            ctx.unprotect(item);
        }

        ctx
    }

    // ----- arena access -----

    pub(crate) fn obj(&self, id: ObjId) -> &Obj {
        self.arena.get(id)
    }

    pub(crate) fn obj_mut(&mut self, id: ObjId) -> &mut Obj {
        self.arena.get_mut(id)
    }

    pub(crate) fn check_collection_size(&mut self, len: usize) -> Exec<()> {
        if len > self.config.max_collection_size {
            self.raise_exception(ExceptionKind::MemoryError, "Exceeded maximum collection size");
            return Err(Raised);
        }
        Ok(())
    }

    // ----- constructors -----

    pub fn new_none(&self) -> ObjId {
        self.builtins.none
    }

    pub fn new_bool(&self, value: bool) -> ObjId {
        if value {
            self.builtins.bool_true
        } else {
            self.builtins.bool_false
        }
    }

    fn new_payload_object(&mut self, tag: Rc<str>, class: ObjId, payload: Payload) -> Exec<ObjId> {
        let id = self.alloc(tag, payload)?;
        let parent = match &self.obj(class).payload {
            Payload::Class(class) => class.instance_attributes.clone(),
            _ => AttributeTable::new(),
        };
        self.obj_mut(id).attributes.add_parent(&parent);
        Ok(id)
    }

    pub fn new_int(&mut self, value: i64) -> Exec<ObjId> {
        let tag = self.tags.int.clone();
        let class = self.builtins.int_class;
        self.new_payload_object(tag, class, Payload::Int(value))
    }

    pub fn new_float(&mut self, value: f64) -> Exec<ObjId> {
        let tag = self.tags.float.clone();
        let class = self.builtins.float_class;
        self.new_payload_object(tag, class, Payload::Float(value))
    }

    pub fn new_string(&mut self, value: &str) -> Exec<ObjId> {
        let tag = self.tags.str_.clone();
        let class = self.builtins.str_class;
        self.new_payload_object(tag, class, Payload::Str(value.to_string()))
    }

    // The container constructors hold the collector off while the elements
    // sit only in host-side buffers; collection resumes on the next
    // allocation, when the elements are reachable through the container.

    pub fn new_tuple(&mut self, items: &[ObjId]) -> Exec<ObjId> {
        self.check_collection_size(items.len())?;
        let tag = self.tags.tuple.clone();
        let class = self.builtins.tuple_class;
        let was_locked = std::mem::replace(&mut self.lock_gc, true);
        let result = self.new_payload_object(tag, class, Payload::Tuple(items.to_vec()));
        self.lock_gc = was_locked;
        result
    }

    pub fn new_list(&mut self, items: &[ObjId]) -> Exec<ObjId> {
        self.check_collection_size(items.len())?;
        let tag = self.tags.list.clone();
        let class = self.builtins.list_class;
        let was_locked = std::mem::replace(&mut self.lock_gc, true);
        let result = self.new_payload_object(tag, class, Payload::List(items.to_vec()));
        self.lock_gc = was_locked;
        result
    }

    pub fn new_dict(&mut self, pairs: &[(ObjId, ObjId)]) -> Exec<ObjId> {
        self.check_collection_size(pairs.len())?;
        let tag = self.tags.map.clone();
        let class = self.builtins.dict_class;
        let was_locked = std::mem::replace(&mut self.lock_gc, true);
        let result = (|| -> Exec<ObjId> {
            let id = self.new_payload_object(tag, class, Payload::Dict(IndexMap::new()))?;
            for &(key, value) in pairs {
                self.dict_insert(id, key, value)?;
            }
            Ok(id)
        })();
        self.lock_gc = was_locked;
        result
    }

    pub fn new_set(&mut self, items: &[ObjId]) -> Exec<ObjId> {
        self.check_collection_size(items.len())?;
        let tag = self.tags.set.clone();
        let class = self.builtins.set_class;
        let was_locked = std::mem::replace(&mut self.lock_gc, true);
        let result = (|| -> Exec<ObjId> {
            let id = self.new_payload_object(tag, class, Payload::Set(IndexMap::new()))?;
            for &item in items {
                let key = self.hash_key(item)?;
                let Payload::Set(entries) = &mut self.obj_mut(id).payload else {
                    unreachable!("set payload");
                };
                entries.insert(key, item);
            }
            Ok(id)
        })();
        self.lock_gc = was_locked;
        result
    }

    pub(crate) fn dict_insert(&mut self, dict: ObjId, key: ObjId, value: ObjId) -> Exec<()> {
        let hash = self.hash_key(key)?;
        let Payload::Dict(entries) = &mut self.obj_mut(dict).payload else {
            unreachable!("dict payload");
        };
        entries.insert(hash, (key, value));
        Ok(())
    }

    /// Creates a native function object owned by the current module.
    pub fn new_function(&mut self, fptr: NativeFn, pretty_name: &str) -> Exec<ObjId> {
        let tag = self.tags.func.clone();
        let class = self.builtins.func_class;
        let module = self.current_module().to_string();
        self.new_payload_object(
            tag,
            class,
            Payload::Func(FuncPayload {
                self_obj: None,
                kind: FuncKind::Native(fptr),
                is_method: false,
                module,
                pretty_name: pretty_name.to_string(),
                captures: HashMap::new(),
                defaults: Vec::new(),
                userdata: None,
            }),
        )
    }

    /// Creates a class object with the given bases (`object` when empty).
    pub fn new_class(&mut self, name: &str, bases: &[ObjId]) -> Exec<ObjId> {
        // During bootstrap the object class itself does not exist yet.
        let object_class = self.builtins.object_class;
        let object_ready = self.arena.contains(object_class) && self.is_class(object_class);
        let actual_bases: Vec<ObjId> = if bases.is_empty() && object_ready {
            vec![object_class]
        } else {
            bases.to_vec()
        };

        let instance_attributes = AttributeTable::new();
        let tag = self.tags.class.clone();
        let id = self.alloc(
            tag,
            Payload::Class(ClassPayload {
                name: name.to_string(),
                bases: actual_bases.clone(),
                instance_attributes: instance_attributes.clone(),
                ctor: default_instance_ctor,
                userdata: None,
                module: self.module_stack.last().cloned().unwrap_or_default(),
            }),
        )?;
        self.protect(id);

        instance_attributes.set("__class__", id);
        for &base in &actual_bases {
            if let Payload::Class(base_class) = &self.obj(base).payload {
                instance_attributes.add_parent(&base_class.instance_attributes.clone());
            }
        }

        if let Payload::Class(class) = &mut self.obj_mut(id).payload {
            class.userdata = Some(id);
        }

        // The class object itself resolves attribute lookups through its
        // own prototype table, so `A.f` yields the unbound method and
        // inherited names arrive through the base chain.
        self.obj_mut(id).attributes.add_parent(&instance_attributes);
        let bases_tuple = self.new_tuple(&actual_bases);
        match bases_tuple {
            Ok(bases_tuple) => self.obj(id).attributes.set("__bases__", bases_tuple),
            Err(raised) => {
                self.unprotect(id);
                return Err(raised);
            }
        }

        self.unprotect(id);
        Ok(id)
    }

    /// Registers a native method on a class under `name`. Method
    /// registration happens while the builtin structure is built, where
    /// allocation cannot fail.
    pub fn bind_method(&mut self, class: ObjId, name: &str, fptr: NativeFn) -> ObjId {
        let func = self
            .new_function(fptr, name)
            .expect("method registration allocation");
        if let Payload::Func(payload) = &mut self.obj_mut(func).payload {
            payload.is_method = true;
            payload.userdata = Some(class);
        }
        if let Payload::Class(payload) = &self.obj(class).payload {
            payload.instance_attributes.set(name, func);
        }
        func
    }

    pub fn add_attribute_to_class(&mut self, class: ObjId, attribute: &str, value: ObjId) {
        if let Payload::Class(payload) = &self.obj(class).payload {
            payload.instance_attributes.set(attribute, value);
        }
    }

    /// Replaces a class's construction function (builtin classes build raw
    /// payload objects instead of attribute-bag instances).
    pub(crate) fn set_class_ctor(&mut self, class: ObjId, ctor: NativeFn) {
        if let Payload::Class(payload) = &mut self.obj_mut(class).payload {
            payload.ctor = ctor;
        }
    }

    /// Reads a name from the `__builtins__` module globals.
    pub(crate) fn builtin_global(&self, name: &str) -> Option<ObjId> {
        self.globals
            .get("__builtins__")
            .and_then(|globals| globals.get(name))
            .and_then(|cell| *cell.borrow())
    }

    // ----- simple introspection -----

    pub fn is_none(&self, id: ObjId) -> bool {
        id == self.builtins.none
    }

    pub fn is_bool(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::Bool(_))
    }

    pub fn is_int(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::Int(_))
    }

    pub fn is_int_or_float(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::Int(_) | Payload::Float(_))
    }

    pub fn is_string(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::Str(_))
    }

    pub fn is_tuple(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::Tuple(_))
    }

    pub fn is_list(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::List(_))
    }

    pub fn is_dictionary(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::Dict(_))
    }

    pub fn is_set(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::Set(_))
    }

    pub fn is_class(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::Class(_))
    }

    pub fn is_function(&self, id: ObjId) -> bool {
        matches!(self.obj(id).payload, Payload::Func(_))
    }

    pub fn get_bool(&self, id: ObjId) -> bool {
        match self.obj(id).payload {
            Payload::Bool(value) => value,
            _ => panic!("get_bool on a non-bool object"),
        }
    }

    pub fn get_int(&self, id: ObjId) -> i64 {
        match self.obj(id).payload {
            Payload::Int(value) => value,
            _ => panic!("get_int on a non-int object"),
        }
    }

    pub fn get_float(&self, id: ObjId) -> f64 {
        match self.obj(id).payload {
            Payload::Int(value) => value as f64,
            Payload::Float(value) => value,
            _ => panic!("get_float on a non-numeric object"),
        }
    }

    pub fn get_string(&self, id: ObjId) -> &str {
        match &self.obj(id).payload {
            Payload::Str(value) => value,
            _ => panic!("get_string on a non-str object"),
        }
    }

    // ----- attributes -----

    /// Looks an attribute up without raising; binds `self` on methods.
    pub fn has_attribute(&mut self, obj: ObjId, name: &str) -> Exec<Option<ObjId>> {
        match self.obj(obj).attributes.get(name) {
            Some(member) => Ok(Some(self.bind_if_method(obj, member)?)),
            None => Ok(None),
        }
    }

    pub fn get_attribute(&mut self, obj: ObjId, name: &str) -> Exec<ObjId> {
        match self.has_attribute(obj, name)? {
            Some(member) => Ok(member),
            None => {
                self.raise_attribute_error(obj, name);
                Err(Raised)
            }
        }
    }

    pub fn set_attribute(&mut self, obj: ObjId, name: &str, value: ObjId) {
        self.obj(obj).attributes.set(name, value);
    }

    /// Attribute lookup that skips the local table, or searches a specific
    /// base class's instance attributes.
    pub fn get_attribute_from_base(
        &mut self,
        obj: ObjId,
        name: &str,
        base_class: Option<ObjId>,
    ) -> Exec<Option<ObjId>> {
        let member = match base_class {
            None => self.obj(obj).attributes.get_from_base(name),
            Some(base) => match &self.obj(base).payload {
                Payload::Class(class) => class.instance_attributes.get(name),
                _ => None,
            },
        };
        match member {
            Some(member) => Ok(Some(self.bind_if_method(obj, member)?)),
            None => Ok(None),
        }
    }

    /// Methods yield a bound view: a copy of the function with `self` set to
    /// the receiver. Lookup through a class object yields the method unbound
    /// (`A.f(self)` passes the receiver explicitly).
    fn bind_if_method(&mut self, receiver: ObjId, member: ObjId) -> Exec<ObjId> {
        let needs_binding = matches!(
            &self.obj(member).payload,
            Payload::Func(func) if func.is_method
        ) && !self.is_class(receiver);
        if !needs_binding {
            return Ok(member);
        }
        let Payload::Func(func) = &self.obj(member).payload else {
            unreachable!("checked above");
        };
        let mut bound = func.clone();
        bound.self_obj = Some(receiver);
        let tag = self.tags.func.clone();
        let bound_id = self.alloc(tag, Payload::Func(bound))?;
        let parent = match &self.obj(self.builtins.func_class).payload {
            Payload::Class(class) => Some(class.instance_attributes.clone()),
            _ => None,
        };
        if let Some(parent) = parent {
            self.obj_mut(bound_id).attributes.add_parent(&parent);
        }
        Ok(bound_id)
    }

    /// Breadth-first walk of `instance.__class__` and its bases; returns the
    /// first matching class.
    pub fn is_instance(&self, instance: ObjId, classes: &[ObjId]) -> Option<ObjId> {
        let start = self.obj(instance).attributes.get("__class__")?;
        let mut queue = std::collections::VecDeque::from([start]);
        let mut visited = HashSet::new();
        while let Some(class) = queue.pop_front() {
            if !visited.insert(class) {
                continue;
            }
            if classes.contains(&class) {
                return Some(class);
            }
            if let Payload::Class(payload) = &self.obj(class).payload {
                queue.extend(payload.bases.iter().copied());
            }
        }
        None
    }

    // ----- calls -----

    pub fn call(&mut self, callable: ObjId, args: &[ObjId], kwargs: Option<ObjId>) -> Exec<ObjId> {
        vm::call_object(self, callable, args, kwargs)
    }

    pub fn call_method(&mut self, obj: ObjId, name: &str, args: &[ObjId]) -> Exec<ObjId> {
        let method = self.get_attribute(obj, name)?;
        self.protect(method);
        let result = self.call(method, args, None);
        self.unprotect(method);
        result
    }

    /// Keyword-argument dictionary of the innermost native call, created
    /// lazily.
    pub fn kwargs(&mut self) -> Exec<ObjId> {
        if let Some(Some(kwargs)) = self.kwargs_stack.last() {
            return Ok(*kwargs);
        }
        let dict = self.new_dict(&[])?;
        if let Some(slot) = self.kwargs_stack.last_mut() {
            *slot = Some(dict);
        }
        Ok(dict)
    }

    /// Userdata object of the innermost native call (classes pass themselves
    /// to their constructors this way).
    pub fn function_userdata(&self) -> Option<ObjId> {
        self.userdata_stack.last().copied().flatten()
    }

    /// Reads keyword arguments by name from a kwargs dictionary.
    pub fn parse_kwargs(&mut self, kwargs: ObjId, keys: &[&str]) -> Exec<Vec<Option<ObjId>>> {
        let mut out = Vec::with_capacity(keys.len());
        for &key in keys {
            let hash = crate::runtime::object::HashKey::Str(key.to_string());
            let Payload::Dict(entries) = &self.obj(kwargs).payload else {
                self.raise_exception(
                    ExceptionKind::TypeError,
                    "Keyword arguments must be a dictionary",
                );
                return Err(Raised);
            };
            out.push(entries.get(&hash).map(|(_, value)| *value));
        }
        Ok(out)
    }

    // ----- truthiness, iteration, rendering -----

    /// Truthifies a value. Builtin payloads take a fast path; user instances
    /// consult `__nonzero__`, which must return a bool.
    pub fn truthify(&mut self, id: ObjId) -> Exec<bool> {
        let quick = match &self.obj(id).payload {
            Payload::Null => Some(false),
            Payload::Bool(value) => Some(*value),
            Payload::Int(value) => Some(*value != 0),
            Payload::Float(value) => Some(*value != 0.0),
            Payload::Str(value) => Some(!value.is_empty()),
            Payload::Tuple(items) | Payload::List(items) => Some(!items.is_empty()),
            Payload::Dict(entries) => Some(!entries.is_empty()),
            Payload::Set(entries) => Some(!entries.is_empty()),
            Payload::Func(_) | Payload::Class(_) => Some(true),
            Payload::Instance => None,
        };
        if let Some(value) = quick {
            return Ok(value);
        }

        match self.has_attribute(id, "__nonzero__")? {
            Some(method) => {
                let result = self.call(method, &[], None)?;
                match self.obj(result).payload {
                    Payload::Bool(value) => Ok(value),
                    _ => {
                        self.raise_exception(
                            ExceptionKind::TypeError,
                            "__nonzero__() returned a non bool type",
                        );
                        Err(Raised)
                    }
                }
            }
            None => Ok(true),
        }
    }

    /// Drives `obj.__iter__()` / `__next__()` until StopIteration, invoking
    /// `callback` per element. The callback may return false to stop early.
    pub fn iterate(
        &mut self,
        obj: ObjId,
        callback: &mut dyn FnMut(&mut Context, ObjId) -> Exec<bool>,
    ) -> Exec<()> {
        let iter = self.call_method(obj, "__iter__", &[])?;
        self.protect(iter);

        let result = loop {
            match self.call_method(iter, "__next__", &[]) {
                Ok(value) => {
                    self.protect(value);
                    let keep_going = callback(self, value);
                    self.unprotect(value);
                    match keep_going {
                        Ok(true) => continue,
                        Ok(false) => break Ok(()),
                        Err(raised) => break Err(raised),
                    }
                }
                Err(raised) => {
                    let stop = self.builtins.exception_class(ExceptionKind::StopIteration);
                    let ended = self
                        .current_exception
                        .is_some_and(|exc| self.is_instance(exc, &[stop]).is_some());
                    if ended {
                        self.clear_current_exception();
                        break Ok(());
                    }
                    break Err(raised);
                }
            }
        };

        self.unprotect(iter);
        result
    }

    /// Collects every element an iterable yields. Elements are protected for
    /// the duration of the iteration.
    pub(crate) fn iterate_collect(&mut self, obj: ObjId) -> Exec<Vec<ObjId>> {
        // Builtin sequences iterate without going through the protocol.
        match &self.obj(obj).payload {
            Payload::Tuple(items) | Payload::List(items) => return Ok(items.clone()),
            _ => {}
        }

        let mut items: Vec<ObjId> = Vec::new();
        let outcome = self.iterate(obj, &mut |ctx, value| {
            ctx.protect(value);
            items.push(value);
            Ok(true)
        });
        let result = match outcome {
            Ok(()) => Ok(items.clone()),
            Err(raised) => Err(raised),
        };
        for item in items {
            self.unprotect(item);
        }
        result
    }

    /// Iterates `value` into exactly `count` values.
    pub fn unpack_n(&mut self, value: ObjId, count: usize) -> Exec<Vec<ObjId>> {
        let items = self.iterate_collect(value)?;
        if items.len() > count {
            self.raise_exception(ExceptionKind::ValueError, "Too many values to unpack");
            return Err(Raised);
        }
        if items.len() < count {
            self.raise_exception(ExceptionKind::ValueError, "Not enough values to unpack");
            return Err(Raised);
        }
        Ok(items)
    }

    pub fn str_of(&mut self, id: ObjId) -> Exec<String> {
        if let Payload::Str(value) = &self.obj(id).payload {
            return Ok(value.clone());
        }
        let mut seen = HashSet::new();
        self.render(id, &mut seen, false)
    }

    pub fn repr_of(&mut self, id: ObjId) -> Exec<String> {
        let mut seen = HashSet::new();
        self.render(id, &mut seen, true)
    }

    fn render(&mut self, id: ObjId, seen: &mut HashSet<ObjId>, repr: bool) -> Exec<String> {
        let rendered = match &self.obj(id).payload {
            Payload::Null => "None".to_string(),
            Payload::Bool(true) => "True".to_string(),
            Payload::Bool(false) => "False".to_string(),
            Payload::Int(value) => value.to_string(),
            Payload::Float(value) => format_float(*value),
            Payload::Str(value) => {
                if repr {
                    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
                } else {
                    value.clone()
                }
            }
            Payload::Tuple(items) => {
                let items = items.clone();
                if !seen.insert(id) {
                    return Ok("(...)".to_string());
                }
                let parts = self.render_all(&items, seen)?;
                seen.remove(&id);
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Payload::List(items) => {
                let items = items.clone();
                if !seen.insert(id) {
                    return Ok("[...]".to_string());
                }
                let parts = self.render_all(&items, seen)?;
                seen.remove(&id);
                format!("[{}]", parts.join(", "))
            }
            Payload::Dict(entries) => {
                let pairs: Vec<(ObjId, ObjId)> = entries.values().copied().collect();
                if !seen.insert(id) {
                    return Ok("{...}".to_string());
                }
                let mut parts = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = self.render(key, seen, true)?;
                    let value = self.render(value, seen, true)?;
                    parts.push(format!("{key}: {value}"));
                }
                seen.remove(&id);
                format!("{{{}}}", parts.join(", "))
            }
            Payload::Set(entries) => {
                let items: Vec<ObjId> = entries.values().copied().collect();
                if items.is_empty() {
                    return Ok("set()".to_string());
                }
                if !seen.insert(id) {
                    return Ok("{...}".to_string());
                }
                let parts = self.render_all(&items, seen)?;
                seen.remove(&id);
                format!("{{{}}}", parts.join(", "))
            }
            Payload::Func(func) => format!("<function {}>", func.pretty_name),
            Payload::Class(class) => format!("<class '{}'>", class.name),
            Payload::Instance => {
                let method = if repr { "__repr__" } else { "__str__" };
                return self.render_instance(id, method);
            }
        };
        Ok(rendered)
    }

    fn render_all(&mut self, items: &[ObjId], seen: &mut HashSet<ObjId>) -> Exec<Vec<String>> {
        let mut parts = Vec::with_capacity(items.len());
        for &item in items {
            parts.push(self.render(item, seen, true)?);
        }
        Ok(parts)
    }

    fn render_instance(&mut self, id: ObjId, method: &str) -> Exec<String> {
        let lookup = self.has_attribute(id, method)?;
        let fallback = self.has_attribute(id, "__str__")?;
        if let Some(method) = lookup.or(fallback) {
            let result = self.call(method, &[], None)?;
            if let Payload::Str(text) = &self.obj(result).payload {
                return Ok(text.clone());
            }
            self.raise_exception(
                ExceptionKind::TypeError,
                "__str__() returned a non str type",
            );
            return Err(Raised);
        }
        let type_name = display_type_name(&self.obj(id).type_name).to_string();
        Ok(format!("<{type_name} object>"))
    }

    pub(crate) fn print_out(&mut self, text: &str) {
        (self.config.print)(text);
    }

    // ----- operators (host API) -----

    pub fn get_index(&mut self, obj: ObjId, index: ObjId) -> Exec<ObjId> {
        self.call_method(obj, "__getitem__", &[index])
    }

    pub fn set_index(&mut self, obj: ObjId, index: ObjId, value: ObjId) -> Exec<ObjId> {
        self.call_method(obj, "__setitem__", &[index, value])
    }

    /// Dispatches a binary operator through the dunder table the compiler
    /// uses; `in` receives the container as receiver.
    pub fn binary_op(
        &mut self,
        op: crate::ast::BinaryOperator,
        lhs: ObjId,
        rhs: ObjId,
    ) -> Exec<ObjId> {
        let method = bytecode::binary_dunder(op);
        self.call_method(lhs, method, &[rhs])
    }

    pub fn unary_op(&mut self, op: crate::ast::UnaryOperator, value: ObjId) -> Exec<ObjId> {
        self.call_method(value, bytecode::unary_dunder(op), &[])
    }

    // ----- globals and modules -----

    pub(crate) fn current_module(&self) -> &str {
        self.module_stack
            .last()
            .map(String::as_str)
            .unwrap_or("__main__")
    }

    pub(crate) fn global_cell(&mut self, module: &str, name: &str) -> CellRef {
        let globals = self.globals.entry(module.to_string()).or_default();
        globals.entry(name.to_string()).or_insert_with(new_cell).clone()
    }

    pub fn get_global(&self, name: &str) -> Option<ObjId> {
        let module = self.current_module();
        let globals = self.globals.get(module)?;
        *globals.get(name)?.borrow()
    }

    pub fn set_global(&mut self, name: &str, value: ObjId) {
        let module = self.current_module().to_string();
        let cell = self.global_cell(&module, name);
        *cell.borrow_mut() = Some(value);
    }

    pub fn register_module(&mut self, name: &str, loader: ModuleLoader) {
        self.module_loaders.insert(name.to_string(), loader);
    }

    pub fn set_import_path(&mut self, path: &str) {
        self.import_path = path.to_string();
        if !self.import_path.ends_with('/') && !self.import_path.ends_with('\\') {
            self.import_path.push('/');
        }
    }

    fn load_module(&mut self, name: &str) -> Exec<()> {
        if self.globals.contains_key(name) {
            return Ok(());
        }

        self.globals.insert(name.to_string(), HashMap::new());
        self.module_stack.push(name.to_string());

        let result = (|| {
            if name != "__builtins__" {
                self.import_all_from_module("__builtins__")?;
            }
            match self.module_loaders.get(name) {
                Some(&loader) => loader(self),
                None => self.load_file_module(name),
            }
        })();

        self.module_stack.pop();
        if result.is_err() {
            self.globals.remove(name);
        }
        result
    }

    fn load_file_module(&mut self, name: &str) -> Exec<()> {
        let path = format!("{}{}.py", self.import_path, name);
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(_) => {
                let message = format!("No module named '{name}'");
                self.raise_exception(ExceptionKind::ImportError, &message);
                return Err(Raised);
            }
        };
        let function = self.compile_in_module(&source, name, name, false)?;
        self.protect(function);
        let result = self.call(function, &[], None);
        self.unprotect(function);
        result.map(|_| ())
    }

    /// Imports a module and binds a module object under `alias` in the
    /// current module's globals.
    pub fn import_module(&mut self, module: &str, alias: Option<&str>) -> Exec<ObjId> {
        self.load_module(module)?;

        let tag = self.tags.object.clone();
        let module_obj = self.alloc(Rc::clone(&tag), Payload::Instance)?;
        self.obj_mut(module_obj).type_name = Rc::from("module");
        let entries: Vec<(String, Option<ObjId>)> = self
            .globals
            .get(module)
            .map(|globals| {
                globals
                    .iter()
                    .map(|(name, cell)| (name.clone(), *cell.borrow()))
                    .collect()
            })
            .unwrap_or_default();
        for (name, value) in entries {
            if let Some(value) = value {
                self.obj(module_obj).attributes.set(&name, value);
            }
        }

        self.set_global(alias.unwrap_or(module), module_obj);
        Ok(module_obj)
    }

    pub fn import_from_module(
        &mut self,
        module: &str,
        name: &str,
        alias: Option<&str>,
    ) -> Exec<ObjId> {
        self.load_module(module)?;

        let value = self
            .globals
            .get(module)
            .and_then(|globals| globals.get(name))
            .and_then(|cell| *cell.borrow());
        let Some(value) = value else {
            let message = format!("Cannot import '{name}' from '{module}'");
            self.raise_exception(ExceptionKind::ImportError, &message);
            return Err(Raised);
        };

        self.set_global(alias.unwrap_or(name), value);
        Ok(value)
    }

    pub fn import_all_from_module(&mut self, module: &str) -> Exec<()> {
        self.load_module(module)?;

        let entries: Vec<(String, Option<ObjId>)> = self
            .globals
            .get(module)
            .map(|globals| {
                globals
                    .iter()
                    .map(|(name, cell)| (name.clone(), *cell.borrow()))
                    .collect()
            })
            .unwrap_or_default();
        for (name, value) in entries {
            if let Some(value) = value {
                self.set_global(&name, value);
            }
        }
        Ok(())
    }

    // ----- compilation entry points -----

    /// Compiles source text into a callable function object representing the
    /// top-level module body. Frontend failures raise SyntaxError.
    pub fn compile(&mut self, source: &str, pretty_name: &str) -> Exec<ObjId> {
        let module = self.current_module().to_string();
        self.compile_in_module(source, &module, pretty_name, false)
    }

    /// Compiles a single expression into a function returning its value.
    pub fn compile_expression(&mut self, source: &str, pretty_name: &str) -> Exec<ObjId> {
        let module = self.current_module().to_string();
        self.compile_in_module(source, &module, pretty_name, true)
    }

    pub fn execute(&mut self, source: &str, pretty_name: &str) -> Exec<ObjId> {
        let function = self.compile(source, pretty_name)?;
        self.protect(function);
        let result = self.call(function, &[], None);
        self.unprotect(function);
        result
    }

    pub fn execute_expression(&mut self, source: &str, pretty_name: &str) -> Exec<ObjId> {
        let function = self.compile_expression(source, pretty_name)?;
        self.protect(function);
        let result = self.call(function, &[], None);
        self.unprotect(function);
        result
    }

    pub(crate) fn compile_in_module(
        &mut self,
        source: &str,
        module: &str,
        pretty_name: &str,
        expression: bool,
    ) -> Exec<ObjId> {
        let code = (|| -> anyhow::Result<bytecode::FunctionCode> {
            let tokens = lexer::tokenize(source)?;
            if expression {
                let expr = parser::parse_expression_tokens(tokens)?;
                bytecode::compile_expression_program(&expr)
            } else {
                let program = parser::parse_tokens(tokens)?;
                bytecode::compile(&program)
            }
        })();
        let code = match code {
            Ok(code) => code,
            Err(error) => {
                self.raise_exception(ExceptionKind::SyntaxError, &error.to_string());
                return Err(Raised);
            }
        };

        let tag = self.tags.func.clone();
        let class = self.builtins.func_class;
        let pretty_name = if pretty_name.is_empty() {
            MODULE_FUNC_NAME.to_string()
        } else {
            pretty_name.to_string()
        };
        self.new_payload_object(
            tag,
            class,
            Payload::Func(FuncPayload {
                self_obj: None,
                kind: FuncKind::Script(Rc::new(code)),
                is_method: false,
                module: module.to_string(),
                pretty_name,
                captures: HashMap::new(),
                defaults: Vec::new(),
                userdata: None,
            }),
        )
    }

    // ----- protection and references -----

    /// Adds the object to the protection multiset; protected objects are GC
    /// roots until unprotected.
    pub fn protect(&mut self, id: ObjId) {
        *self.protected.entry(id).or_insert(0) += 1;
    }

    pub fn unprotect(&mut self, id: ObjId) {
        match self.protected.get_mut(&id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.protected.remove(&id);
            }
            None => {}
        }
    }

    /// Keeps `child` alive at least as long as `parent`.
    pub fn link_reference(&mut self, parent: ObjId, child: ObjId) {
        self.obj_mut(parent).references.push(child);
    }

    pub fn unlink_reference(&mut self, parent: ObjId, child: ObjId) {
        let references = &mut self.obj_mut(parent).references;
        if let Some(position) = references.iter().position(|&id| id == child) {
            references.remove(position);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy_all_objects();
    }
}

/// Default constructor for user-defined classes: allocate an instance whose
/// attribute table chains to the class prototype, then forward to
/// `__init__`.
pub(crate) fn default_instance_ctor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let class = ctx
        .function_userdata()
        .expect("class constructors receive their class as userdata");

    let (class_name, prototype) = match &ctx.obj(class).payload {
        Payload::Class(payload) => (
            payload.name.clone(),
            payload.instance_attributes.clone(),
        ),
        _ => unreachable!("constructor userdata is always a class"),
    };

    let instance = ctx.alloc(Rc::from(class_name.as_str()), Payload::Instance)?;
    ctx.protect(instance);
    ctx.obj_mut(instance).attributes.add_parent(&prototype);

    let result = (|| {
        if let Some(init) = ctx.has_attribute(instance, "__init__")? {
            if ctx.is_function(init) {
                let kwargs = ctx.kwargs()?;
                let returned = ctx.call(init, args, Some(kwargs))?;
                if !ctx.is_none(returned) {
                    ctx.raise_exception(
                        ExceptionKind::TypeError,
                        "__init__() returned a non NoneType type",
                    );
                    return Err(Raised);
                }
            }
        }
        Ok(instance)
    })();

    ctx.unprotect(instance);
    result
}

/// Renders a float the way the Language prints it: integral values keep one
/// decimal digit, specials use Python's spellings.
pub(crate) fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Context {
        Context::new(Config::default())
    }

    #[test]
    fn creates_and_reads_primitive_values() {
        let mut ctx = context();
        let n = ctx.new_int(42).expect("alloc");
        assert!(ctx.is_int(n));
        assert_eq!(ctx.get_int(n), 42);

        let s = ctx.new_string("hi").expect("alloc");
        assert_eq!(ctx.get_string(s), "hi");

        assert!(ctx.is_none(ctx.new_none()));
        assert!(ctx.get_bool(ctx.new_bool(true)));
    }

    #[test]
    fn protected_objects_survive_collection() {
        let mut ctx = context();
        let value = ctx.new_int(7).expect("alloc");
        ctx.protect(value);
        ctx.collect_garbage();
        assert_eq!(ctx.get_int(value), 7);
        ctx.unprotect(value);
    }

    #[test]
    fn unreachable_objects_are_finalized_and_freed() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut ctx = context();
        let finalized = Rc::new(Cell::new(false));
        let value = ctx.new_int(1).expect("alloc");
        let flag = finalized.clone();
        ctx.obj_mut(value).finalizer = Some(crate::runtime::object::Finalizer(Box::new(
            move || flag.set(true),
        )));

        let before = ctx.arena.live_count();
        ctx.collect_garbage();
        assert!(finalized.get());
        assert!(ctx.arena.live_count() < before);
    }

    #[test]
    fn linked_references_keep_children_alive() {
        let mut ctx = context();
        let parent = ctx.new_int(1).expect("alloc");
        let child = ctx.new_int(2).expect("alloc");
        ctx.protect(parent);
        ctx.link_reference(parent, child);
        ctx.collect_garbage();
        assert_eq!(ctx.get_int(child), 2);
        ctx.unprotect(parent);
    }

    #[test]
    fn globals_round_trip_through_cells() {
        let mut ctx = context();
        let value = ctx.new_int(9).expect("alloc");
        ctx.set_global("answer", value);
        assert_eq!(ctx.get_global("answer"), Some(value));
        assert_eq!(ctx.get_global("missing"), None);
    }

    #[test]
    fn formats_floats_like_the_language() {
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(f64::NAN), "nan");
    }
}
