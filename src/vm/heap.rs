//! GC-value heap pool.
//!
//! A pool allocator parameterized on the GC-value shape: allocations are
//! recycled from a freelist instead of going back to the system allocator
//! on every free. Ownership is dual-refcounted: `heap_refcount` counts
//! other GC values referencing this one, and `external_refcount` counts
//! value-content slots (stack, globals, constants) referencing this one.
//! A value is only actually freed, and its own owned references released
//! in turn, once both counts reach zero.
//!
//! Cycle collection is out of scope (see DESIGN.md) -- a reference cycle
//! among container GC values will leak rather than collect, same
//! tradeoff a bare refcount scheme always has.

use std::collections::HashMap;

use crate::program::value::{GcHandle, ValueContent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcType {
    String,
    List,
    Set,
    Vector,
    Map,
    Object,
    Iterator,
    Function,
    ClassRef,
}

#[derive(Debug, Clone)]
pub enum IteratorState {
    /// Walks a snapshot index over a list/vector/set's current contents.
    Sequence { source: GcHandle, index: usize },
}

#[derive(Debug, Clone)]
pub enum GcPayload {
    Str(String),
    List(Vec<ValueContent>),
    /// Membership is by `ValueContent` structural equality; duplicates are
    /// rejected on insert.
    Set(Vec<ValueContent>),
    Vector(Vec<ValueContent>),
    Map(Vec<(ValueContent, ValueContent)>),
    Object { class_id: i64, vars: Vec<ValueContent> },
    Iterator(IteratorState),
    /// A function reference, as produced by `GETFUNC` or as the bound
    /// method closure `GETMEMBER` yields when the resolved member is a
    /// method rather than a variable.
    Function { func_id: i64, bound_self: Option<Box<ValueContent>> },
    /// A class reference, as produced by `GETCLASS` and consumed by
    /// `ADDCATCHTYPEBYREF`.
    ClassRef(i64),
}

#[derive(Debug, Clone)]
pub struct GcValueCell {
    pub gc_type: GcType,
    pub heap_refcount: u32,
    pub external_refcount: u32,
    pub payload: GcPayload,
}

impl GcValueCell {
    fn type_of(payload: &GcPayload) -> GcType {
        match payload {
            GcPayload::Str(_) => GcType::String,
            GcPayload::List(_) => GcType::List,
            GcPayload::Set(_) => GcType::Set,
            GcPayload::Vector(_) => GcType::Vector,
            GcPayload::Map(_) => GcType::Map,
            GcPayload::Object { .. } => GcType::Object,
            GcPayload::Iterator(_) => GcType::Iterator,
            GcPayload::Function { .. } => GcType::Function,
            GcPayload::ClassRef(_) => GcType::ClassRef,
        }
    }
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<GcValueCell>>,
    free_list: Vec<usize>,
}

impl Heap {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free_list: Vec::new() }
    }

    /// Allocate a fresh cell with `external_refcount = 1` (the caller
    /// holds the one reference it was created to satisfy) and
    /// `heap_refcount = 0`.
    pub fn alloc(&mut self, payload: GcPayload) -> GcHandle {
        let cell = GcValueCell { gc_type: GcValueCell::type_of(&payload), heap_refcount: 0, external_refcount: 1, payload };
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx] = Some(cell);
            GcHandle(idx)
        } else {
            self.slots.push(Some(cell));
            GcHandle(self.slots.len() - 1)
        }
    }

    pub fn alloc_string(&mut self, text: String) -> GcHandle {
        self.alloc(GcPayload::Str(text))
    }

    pub fn get(&self, handle: GcHandle) -> &GcValueCell {
        self.slots[handle.0].as_ref().expect("use of freed GC handle")
    }

    pub fn get_mut(&mut self, handle: GcHandle) -> &mut GcValueCell {
        self.slots[handle.0].as_mut().expect("use of freed GC handle")
    }

    pub fn retain_external(&mut self, handle: GcHandle) {
        self.get_mut(handle).external_refcount += 1;
    }

    /// Release one external reference. Drops to the pool's freelist, and
    /// recursively releases any GC values this one owned, once both
    /// refcounts reach zero.
    pub fn release_external(&mut self, handle: GcHandle) {
        let cell = self.get_mut(handle);
        debug_assert!(cell.external_refcount > 0);
        cell.external_refcount -= 1;
        self.maybe_free(handle);
    }

    pub fn retain_heap(&mut self, handle: GcHandle) {
        self.get_mut(handle).heap_refcount += 1;
    }

    pub fn release_heap(&mut self, handle: GcHandle) {
        let cell = self.get_mut(handle);
        debug_assert!(cell.heap_refcount > 0);
        cell.heap_refcount -= 1;
        self.maybe_free(handle);
    }

    fn maybe_free(&mut self, handle: GcHandle) {
        let cell = self.get(handle);
        if cell.external_refcount != 0 || cell.heap_refcount != 0 {
            return;
        }
        let cell = self.slots[handle.0].take().expect("use of freed GC handle");
        self.free_list.push(handle.0);
        self.release_owned_contents(cell.payload);
    }

    fn release_owned_contents(&mut self, payload: GcPayload) {
        let release_one = |heap: &mut Heap, v: ValueContent| {
            if let ValueContent::GcVal(h) = v {
                heap.release_heap(h);
            }
        };
        match payload {
            GcPayload::List(items) | GcPayload::Set(items) | GcPayload::Vector(items) => {
                for item in items {
                    release_one(self, item);
                }
            }
            GcPayload::Map(entries) => {
                for (k, v) in entries {
                    release_one(self, k);
                    release_one(self, v);
                }
            }
            GcPayload::Object { vars, .. } => {
                for item in vars {
                    release_one(self, item);
                }
            }
            GcPayload::Function { bound_self: Some(boxed), .. } => release_one(self, *boxed),
            GcPayload::Str(_) | GcPayload::Iterator(_) | GcPayload::Function { bound_self: None, .. } | GcPayload::ClassRef(_) => {}
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Read a string payload's code points, materialized fresh each call
    /// (used by builtins and `to_str`).
    pub fn string_text(&self, handle: GcHandle) -> &str {
        match &self.get(handle).payload {
            GcPayload::Str(s) => s,
            _ => panic!("not a string GC value"),
        }
    }

    pub fn equal(&self, a: &ValueContent, b: &ValueContent) -> bool {
        match (a, b) {
            (ValueContent::None, ValueContent::None) => true,
            (ValueContent::Bool(x), ValueContent::Bool(y)) => x == y,
            (ValueContent::Int64(x), ValueContent::Int64(y)) => x == y,
            (ValueContent::Float64(x), ValueContent::Float64(y)) => x == y,
            (ValueContent::GcVal(x), ValueContent::GcVal(y)) => {
                if x == y {
                    return true;
                }
                match (&self.get(*x).payload, &self.get(*y).payload) {
                    (GcPayload::Str(s1), GcPayload::Str(s2)) => s1 == s2,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

/// `PUTMAP` overwrites on a repeat key rather than rejecting it, matching
/// how ordinary assignment-style map literals read. On overwrite, the
/// replaced value's external reference is released (it is no longer
/// reachable from the map) and so is the caller's freshly retained `key`
/// (the existing key in the slot is kept; this one is never stored).
/// Returns whether an existing entry was overwritten.
pub fn map_put(entries: &mut Vec<(ValueContent, ValueContent)>, heap: &mut Heap, key: ValueContent, value: ValueContent) -> bool {
    if let Some(pos) = entries.iter().position(|(k, _)| heap.equal(k, &key)) {
        let old_value = std::mem::replace(&mut entries[pos].1, value);
        release_value(heap, old_value);
        release_value(heap, key);
        true
    } else {
        entries.push((key, value));
        false
    }
}

fn release_value(heap: &mut Heap, value: ValueContent) {
    if let ValueContent::GcVal(h) = value {
        heap.release_external(h);
    }
}

pub type MemberNameToVarId = HashMap<i64, usize>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuses_freed_slots() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("a".into());
        heap.release_external(a);
        let b = heap.alloc_string("b".into());
        assert_eq!(a, b);
    }

    #[test]
    fn map_put_overwrite_releases_old_value_and_unstored_key() {
        let mut heap = Heap::new();
        let old_key = heap.alloc_string("k".into());
        let old_value = heap.alloc_string("old".into());
        let mut entries = vec![(ValueContent::GcVal(old_key), ValueContent::GcVal(old_value))];

        // Simulate the caller's `retain_copy` on the fresh key/value it is
        // about to hand to `map_put` -- a brand-new allocation already
        // carries `external_refcount = 1`.
        let new_key = heap.alloc_string("k".into());
        let new_value = heap.alloc_string("new".into());
        assert_eq!(heap.live_count(), 4);

        let replaced = map_put(&mut entries, &mut heap, ValueContent::GcVal(new_key), ValueContent::GcVal(new_value));
        assert!(replaced);

        // The old value and the never-stored new key are both released;
        // the pre-existing key stays in the slot, and the new value is
        // what's now stored.
        assert_eq!(heap.live_count(), 2);
        assert_eq!(entries[0].0, ValueContent::GcVal(old_key));
        assert_eq!(entries[0].1, ValueContent::GcVal(new_value));
    }

    #[test]
    fn map_put_insert_keeps_both_new_entries_alive() {
        let mut heap = Heap::new();
        let mut entries: Vec<(ValueContent, ValueContent)> = Vec::new();
        let key = heap.alloc_string("k".into());
        let value = heap.alloc_string("v".into());

        let replaced = map_put(&mut entries, &mut heap, ValueContent::GcVal(key), ValueContent::GcVal(value));
        assert!(!replaced);
        assert_eq!(heap.live_count(), 2);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn freeing_a_list_releases_contained_gc_values() {
        let mut heap = Heap::new();
        let inner = heap.alloc_string("inner".into());
        heap.retain_heap(inner);
        heap.release_external(inner);
        assert_eq!(heap.get(inner).heap_refcount, 1);
        let list = heap.alloc(GcPayload::List(vec![ValueContent::GcVal(inner)]));
        heap.release_external(list);
        assert_eq!(heap.live_count(), 0);
    }
}
