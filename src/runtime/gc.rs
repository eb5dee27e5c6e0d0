//! Context-local mark-and-sweep collection.
//!
//! Objects live in a slotted arena with a free list. A collection marks
//! everything reachable from the context roots (globals, protection set,
//! interpreter frames, builtins, the current exception), runs finalizers of
//! the unreachable objects once, and releases their slots. Collection is
//! triggered from the allocation path when the arena has grown past
//! `gc_run_factor` times its size after the previous collection.

use crate::runtime::context::Context;
use crate::runtime::exception::{Exec, ExceptionKind, Raised};
use crate::runtime::object::{Obj, ObjId, Payload};

// Below this many live objects the growth trigger stays quiet.
const GC_MIN_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    pub(crate) fn get(&self, id: ObjId) -> &Obj {
        self.slots[id.index()]
            .as_ref()
            .expect("object id refers to a freed slot")
    }

    pub(crate) fn get_mut(&mut self, id: ObjId) -> &mut Obj {
        self.slots[id.index()]
            .as_mut()
            .expect("object id refers to a freed slot")
    }

    pub(crate) fn insert(&mut self, obj: Obj) -> ObjId {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(obj);
            ObjId::from_raw(slot)
        } else {
            let slot = u32::try_from(self.slots.len()).expect("arena slot count overflow");
            self.slots.push(Some(obj));
            ObjId::from_raw(slot)
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live
    }

    pub(crate) fn contains(&self, id: ObjId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(|slot| slot.is_some())
    }
}

impl Context {
    /// Allocates a zero-attribute object in the arena, collecting garbage
    /// first when the growth threshold or the hard cap is reached.
    pub(crate) fn alloc(&mut self, type_name: std::rc::Rc<str>, payload: Payload) -> Exec<ObjId> {
        if !self.lock_gc {
            let threshold = (self.last_count_after_gc.max(GC_MIN_THRESHOLD) as f32
                * self.config.gc_run_factor) as usize;
            if self.arena.live_count() >= threshold {
                self.collect_garbage();
            }
        }

        if self.arena.live_count() >= self.config.max_alloc && !self.alloc_cap_exempt {
            if !self.lock_gc {
                self.collect_garbage();
            }
            if self.arena.live_count() >= self.config.max_alloc {
                // Exempt the MemoryError instance itself from the cap so the
                // failure is reportable.
                self.alloc_cap_exempt = true;
                self.raise_exception(ExceptionKind::MemoryError, "Exceeded maximum allocations");
                self.alloc_cap_exempt = false;
                return Err(Raised);
            }
        }

        Ok(self.arena.insert(Obj {
            type_name,
            payload,
            attributes: crate::runtime::attributes::AttributeTable::new(),
            references: Vec::new(),
            finalizer: None,
            marked: false,
        }))
    }

    /// Mark-and-sweep over the arena. Not re-entrant; allocation-critical
    /// sections set `lock_gc`.
    pub fn collect_garbage(&mut self) {
        if self.lock_gc {
            return;
        }
        self.lock_gc = true;

        let mut pending: Vec<ObjId> = Vec::new();
        self.gather_roots(&mut pending);

        while let Some(id) = pending.pop() {
            if !self.arena.contains(id) || self.arena.get(id).marked {
                continue;
            }
            self.arena.get_mut(id).marked = true;
            push_children(self.arena.get(id), &mut pending);
        }

        // Finalizers run once, immediately before the slot is released.
        let mut finalizers = Vec::new();
        for slot in 0..self.arena.slots.len() {
            let Some(obj) = self.arena.slots[slot].as_mut() else {
                continue;
            };
            if obj.marked {
                obj.marked = false;
                continue;
            }
            if let Some(finalizer) = obj.finalizer.take() {
                finalizers.push(finalizer);
            }
            self.arena.slots[slot] = None;
            self.arena.free.push(slot as u32);
            self.arena.live -= 1;
        }
        for mut finalizer in finalizers {
            (finalizer.0)();
        }

        self.last_count_after_gc = self.arena.live_count();
        self.lock_gc = false;
    }

    fn gather_roots(&self, pending: &mut Vec<ObjId>) {
        if let Some(exception) = self.current_exception {
            pending.push(exception);
        }
        pending.extend(self.protected.keys().copied());
        for globals in self.globals.values() {
            for cell in globals.values() {
                if let Some(id) = *cell.borrow() {
                    pending.push(id);
                }
            }
        }
        for frame in &self.frames {
            frame.gather_roots(pending);
        }
        for entry in self.kwargs_stack.iter().chain(&self.userdata_stack) {
            if let Some(id) = entry {
                pending.push(*id);
            }
        }
        self.builtins.gather_roots(pending);
        if let Some(argv) = self.argv_obj {
            pending.push(argv);
        }
    }

    /// Runs every finalizer and drops the whole arena; used when the context
    /// is destroyed.
    pub(crate) fn destroy_all_objects(&mut self) {
        self.lock_gc = true;
        for slot in &mut self.arena.slots {
            if let Some(obj) = slot.as_mut() {
                if let Some(mut finalizer) = obj.finalizer.take() {
                    (finalizer.0)();
                }
            }
            *slot = None;
        }
        self.arena.free.clear();
        self.arena.live = 0;
        self.lock_gc = false;
    }
}

fn push_children(obj: &Obj, pending: &mut Vec<ObjId>) {
    match &obj.payload {
        Payload::Tuple(items) | Payload::List(items) => pending.extend(items.iter().copied()),
        Payload::Dict(entries) => {
            for (key, value) in entries.values() {
                pending.push(*key);
                pending.push(*value);
            }
        }
        Payload::Set(entries) => pending.extend(entries.values().copied()),
        Payload::Func(func) => {
            pending.extend(func.self_obj);
            pending.extend(func.userdata);
            pending.extend(func.defaults.iter().copied());
            for cell in func.captures.values() {
                if let Some(id) = *cell.borrow() {
                    pending.push(id);
                }
            }
        }
        Payload::Class(class) => {
            pending.extend(class.bases.iter().copied());
            pending.extend(class.userdata);
            class
                .instance_attributes
                .for_each_entry(&mut |id| pending.push(id));
        }
        Payload::Null
        | Payload::Bool(_)
        | Payload::Int(_)
        | Payload::Float(_)
        | Payload::Str(_)
        | Payload::Instance => {}
    }

    obj.attributes.for_each_entry(&mut |id| pending.push(id));
    pending.extend(obj.references.iter().copied());
}
