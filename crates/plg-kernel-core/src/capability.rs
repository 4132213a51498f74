//! Per-process handle tables
//!
//! A handle table maps process-local handle values to kernel objects. Each
//! entry owns one reference on its object; the table itself never touches
//! reference counts, `KernelState` does that when inserting or closing.
//!
//! # Properties
//!
//! 1. **No forged object**: only ids that were inserted are ever returned
//! 2. **Fail closed**: unknown or null handles resolve to nothing
//! 3. **No reuse of pseudo-handles**: allocation stays below `0xFFFF_8000`

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::types::{Handle, ObjectId};

/// Handle values at or above this are reserved for pseudo-handles.
pub const PSEUDO_HANDLE_BASE: u32 = 0xFFFF_8000;

/// First handle value given out
const FIRST_HANDLE: u32 = 0x0000_0100;

/// Per-process handle table
#[derive(Debug)]
pub struct HandleTable {
    slots: BTreeMap<Handle, ObjectId>,
    next: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            next: FIRST_HANDLE,
        }
    }

    /// Insert an object, returning its new handle. `None` when the value
    /// space is exhausted.
    pub fn insert(&mut self, object: ObjectId) -> Option<Handle> {
        if self.next >= PSEUDO_HANDLE_BASE {
            return None;
        }
        let handle = Handle(self.next);
        self.next += 1;
        self.slots.insert(handle, object);
        Some(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<ObjectId> {
        if handle.is_null() {
            return None;
        }
        self.slots.get(&handle).copied()
    }

    pub fn remove(&mut self, handle: Handle) -> Option<ObjectId> {
        self.slots.remove(&handle)
    }

    /// All live entries in handle order
    pub fn entries(&self) -> impl Iterator<Item = (Handle, ObjectId)> + '_ {
        self.slots.iter().map(|(&h, &o)| (h, o))
    }

    /// Count of handles that reference `object`
    pub fn references_to(&self, object: ObjectId) -> usize {
        self.slots.values().filter(|&&o| o == object).count()
    }

    pub fn drain(&mut self) -> Vec<ObjectId> {
        let objects = self.slots.values().copied().collect();
        self.slots.clear();
        objects
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle_fails_closed() {
        let mut t = HandleTable::new();
        t.insert(ObjectId(1));
        assert_eq!(t.get(Handle::NULL), None);
    }

    #[test]
    fn test_handles_are_unique_and_removable() {
        let mut t = HandleTable::new();
        let a = t.insert(ObjectId(1)).unwrap();
        let b = t.insert(ObjectId(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(t.references_to(ObjectId(1)), 2);
        assert_eq!(t.remove(a), Some(ObjectId(1)));
        assert_eq!(t.get(a), None);
        assert_eq!(t.get(b), Some(ObjectId(1)));
    }
}
