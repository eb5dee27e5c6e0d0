use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::runtime::object::ObjId;

/// Attribute table: a name -> object map with an ordered list of parent
/// tables searched transitively on `get` misses. Writes always land in the
/// local map. Class `instance_attributes` tables are shared as parents of
/// instance tables, which is how method inheritance works.
#[derive(Debug, Clone, Default)]
pub(crate) struct AttributeTable {
    storage: Rc<RefCell<TableStorage>>,
}

#[derive(Debug, Default)]
struct TableStorage {
    entries: HashMap<String, ObjId>,
    parents: Vec<AttributeTable>,
}

impl AttributeTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_parent(parent: &AttributeTable) -> Self {
        let table = Self::new();
        table.add_parent(parent);
        table
    }

    /// Depth-first lookup across the parent chain, first hit wins. The
    /// visited set guards against diamond-shaped parent graphs.
    pub(crate) fn get(&self, name: &str) -> Option<ObjId> {
        let mut visited = HashSet::new();
        self.get_inner(name, &mut visited)
    }

    fn get_inner(&self, name: &str, visited: &mut HashSet<*const ()>) -> Option<ObjId> {
        if !visited.insert(Rc::as_ptr(&self.storage).cast()) {
            return None;
        }
        let storage = self.storage.borrow();
        if let Some(&id) = storage.entries.get(name) {
            return Some(id);
        }
        for parent in &storage.parents {
            if let Some(id) = parent.get_inner(name, visited) {
                return Some(id);
            }
        }
        None
    }

    /// Lookup that skips local entries and consults only the parent chain.
    pub(crate) fn get_from_base(&self, name: &str) -> Option<ObjId> {
        let mut visited = HashSet::new();
        visited.insert(Rc::as_ptr(&self.storage).cast::<()>());
        let storage = self.storage.borrow();
        for parent in &storage.parents {
            if let Some(id) = parent.get_inner(name, &mut visited) {
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn set(&self, name: &str, value: ObjId) {
        self.storage
            .borrow_mut()
            .entries
            .insert(name.to_string(), value);
    }

    pub(crate) fn add_parent(&self, parent: &AttributeTable) {
        self.storage.borrow_mut().parents.push(parent.clone());
    }

    /// Snapshot of the local entries sharing the parent links; used to build
    /// instance tables from class tables.
    pub(crate) fn copy(&self) -> AttributeTable {
        let storage = self.storage.borrow();
        AttributeTable {
            storage: Rc::new(RefCell::new(TableStorage {
                entries: storage.entries.clone(),
                parents: storage.parents.clone(),
            })),
        }
    }

    /// Visits every entry reachable through this table and its parent chain.
    /// Used by the garbage collector.
    pub(crate) fn for_each_entry(&self, f: &mut dyn FnMut(ObjId)) {
        let mut visited = HashSet::new();
        self.for_each_inner(f, &mut visited);
    }

    fn for_each_inner(&self, f: &mut dyn FnMut(ObjId), visited: &mut HashSet<*const ()>) {
        if !visited.insert(Rc::as_ptr(&self.storage).cast()) {
            return;
        }
        let storage = self.storage.borrow();
        for &id in storage.entries.values() {
            f(id);
        }
        for parent in &storage.parents {
            parent.for_each_inner(f, visited);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> ObjId {
        ObjId::from_raw(raw)
    }

    #[test]
    fn set_writes_locally_and_get_reads_back() {
        let table = AttributeTable::new();
        table.set("x", id(1));
        assert_eq!(table.get("x"), Some(id(1)));
        assert_eq!(table.get("y"), None);
    }

    #[test]
    fn get_searches_parents_depth_first() {
        let grandparent = AttributeTable::new();
        grandparent.set("x", id(1));
        let parent = AttributeTable::with_parent(&grandparent);
        let child = AttributeTable::with_parent(&parent);
        assert_eq!(child.get("x"), Some(id(1)));
    }

    #[test]
    fn first_parent_wins_on_diamond() {
        let root = AttributeTable::new();
        root.set("x", id(1));
        let left = AttributeTable::with_parent(&root);
        left.set("x", id(2));
        let right = AttributeTable::with_parent(&root);
        right.set("x", id(3));
        let child = AttributeTable::new();
        child.add_parent(&left);
        child.add_parent(&right);
        assert_eq!(child.get("x"), Some(id(2)));
    }

    #[test]
    fn local_write_shadows_parent() {
        let parent = AttributeTable::new();
        parent.set("x", id(1));
        let child = AttributeTable::with_parent(&parent);
        child.set("x", id(2));
        assert_eq!(child.get("x"), Some(id(2)));
        assert_eq!(parent.get("x"), Some(id(1)));
    }

    #[test]
    fn get_from_base_skips_local_entries() {
        let parent = AttributeTable::new();
        parent.set("x", id(1));
        let child = AttributeTable::with_parent(&parent);
        child.set("x", id(2));
        assert_eq!(child.get_from_base("x"), Some(id(1)));
    }

    #[test]
    fn copy_snapshots_locals_and_shares_parents() {
        let parent = AttributeTable::new();
        parent.set("inherited", id(1));
        let original = AttributeTable::with_parent(&parent);
        original.set("local", id(2));

        let copied = original.copy();
        copied.set("local", id(3));
        assert_eq!(original.get("local"), Some(id(2)));
        assert_eq!(copied.get("local"), Some(id(3)));

        // Parent mutations remain visible through the copy.
        parent.set("inherited", id(4));
        assert_eq!(copied.get("inherited"), Some(id(4)));
    }

    #[test]
    fn cyclic_parent_links_terminate() {
        let a = AttributeTable::new();
        let b = AttributeTable::with_parent(&a);
        a.add_parent(&b);
        assert_eq!(a.get("missing"), None);
    }
}
