//! CPython's generational gc list protocol on native memory.
//!
//! Every object that participates in cyclic gc carries a [`GcHead`] right in front of it. The
//! heads form intrusive, circular, doubly linked lists rooted at the generation sentinels inside a
//! [`GcState`] block. Native extensions manipulate these lists with their own inline macros, so
//! the encoding here must match CPython bit for bit:
//!
//! - `gc_next == 0` means untracked
//! - the low [`PREV_SHIFT`] bits of `gc_prev` are [`GcPrevFlags`], the rest is the previous head
//! - writing a previous pointer keeps the flags of the node written to
use log::trace;

use crate::{
    Address, BridgeError, BridgeResult, FieldAccess,
    layout::{GcGeneration, GcHead, GcPrevFlags, GcState, NUM_GENERATIONS, PREV_MASK_FLAGS},
};

#[inline]
pub const fn mask_flags(gc_prev: u64) -> u64 {
    gc_prev & !PREV_MASK_FLAGS
}

/// New `gc_prev` value pointing at `pointer` with the flags of `target_old`
#[inline]
pub const fn compose_with_preserved_flags(target_old: u64, pointer: u64) -> u64 {
    debug_assert!(pointer & PREV_MASK_FLAGS == 0);
    (target_old & PREV_MASK_FLAGS) | pointer
}

/// GC head of the object at `op`
#[inline]
pub const fn as_gc(op: Address) -> Address {
    assert!(!op.is_null(), "gc head of a null object");
    op.sub(GcHead::SIZE)
}

/// Object following the GC head at `gc`
#[inline]
pub const fn from_gc(gc: Address) -> Address {
    gc.add(GcHead::SIZE)
}

/// Thresholds CPython starts with
pub const DEFAULT_THRESHOLDS: [i32; NUM_GENERATIONS] = [700, 10, 10];

/// View of a [`GcState`] block through a field accessor
pub struct GcSupport<'m, M: FieldAccess + ?Sized> {
    mem: &'m mut M,
    state: Address,
}

impl<'m, M: FieldAccess + ?Sized> GcSupport<'m, M> {
    /// Allocate and initialize a fresh state block: collection enabled, every generation head
    /// linked to itself, `generation0` pointing at the first head.
    pub fn create_state(mem: &mut M, thresholds: [i32; NUM_GENERATIONS]) -> Address {
        let state = mem.allocate(GcState::LAYOUT);
        let mut gc = GcSupport { mem, state };
        gc.mem.write_i32(state, GcState::ENABLED, 1);
        gc.mem.write_i32(state, GcState::DEBUG, 0);
        gc.mem.write_i32(state, GcState::COLLECTING, 0);
        for index in 0..=NUM_GENERATIONS {
            let head = gc.generation_head(index);
            gc.list_init(head);
            let generation = state.add(GcState::generation(index));
            let threshold = thresholds.get(index).copied().unwrap_or(0);
            gc.mem.write_i32(generation, GcGeneration::THRESHOLD, threshold);
            gc.mem.write_i32(generation, GcGeneration::COUNT, 0);
        }
        let generation0 = gc.generation_head(0);
        gc.mem.write_ptr(state, GcState::GENERATION0, generation0);
        log::debug!("gc state initialized at {state:?}");
        state
    }

    pub fn destroy_state(mem: &mut M, state: Address) {
        mem.free(state);
        log::debug!("gc state at {state:?} released");
    }

    pub fn new(mem: &'m mut M, state: Address) -> Self {
        assert!(!state.is_null(), "gc state is not initialized");
        Self { mem, state }
    }

    pub fn state(&self) -> Address {
        self.state
    }

    /// Sentinel head of generation `index`, `NUM_GENERATIONS` is the permanent generation
    pub fn generation_head(&self, index: usize) -> Address {
        self.state
            .add(GcState::generation(index))
            .add(GcGeneration::HEAD)
    }

    pub fn generation0(&self) -> Address {
        self.mem.read_ptr(self.state, GcState::GENERATION0)
    }

    pub fn count(&self, index: usize) -> i32 {
        let generation = self.state.add(GcState::generation(index));
        self.mem.read_i32(generation, GcGeneration::COUNT)
    }

    pub fn threshold(&self, index: usize) -> i32 {
        let generation = self.state.add(GcState::generation(index));
        self.mem.read_i32(generation, GcGeneration::THRESHOLD)
    }

    pub fn set_threshold(&mut self, index: usize, threshold: i32) {
        let generation = self.state.add(GcState::generation(index));
        self.mem.write_i32(generation, GcGeneration::THRESHOLD, threshold);
    }

    pub fn is_enabled(&self) -> bool {
        self.mem.read_i32(self.state, GcState::ENABLED) != 0
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.mem.write_i32(self.state, GcState::ENABLED, enabled as i32);
    }

    pub fn increment_count(&mut self) {
        let generation = self.state.add(GcState::generation(0));
        let count = self.mem.read_i32(generation, GcGeneration::COUNT);
        self.mem.write_i32(generation, GcGeneration::COUNT, count + 1);
    }

    /// Never goes below zero
    pub fn decrement_count(&mut self) {
        let generation = self.state.add(GcState::generation(0));
        let count = self.mem.read_i32(generation, GcGeneration::COUNT);
        if count > 0 {
            self.mem.write_i32(generation, GcGeneration::COUNT, count - 1);
        }
    }

    /// A young collection would run now if one were implemented.
    pub fn collection_due(&self) -> bool {
        let threshold = self.threshold(0);
        self.is_enabled()
            && threshold != 0
            && self.count(0) > threshold
            && self.mem.read_i32(self.state, GcState::COLLECTING) == 0
    }

    #[inline]
    fn next(&self, gc: Address) -> Address {
        self.mem.read_ptr(gc, GcHead::NEXT)
    }

    #[inline]
    fn prev(&self, gc: Address) -> Address {
        Address::new(mask_flags(self.mem.read_ptr(gc, GcHead::PREV).raw()))
    }

    #[inline]
    fn prev_flags(&self, gc: Address) -> GcPrevFlags {
        GcPrevFlags::from_bits_truncate(self.mem.read_ptr(gc, GcHead::PREV).raw())
    }

    #[inline]
    fn set_next(&mut self, gc: Address, next: Address) {
        self.mem.write_ptr(gc, GcHead::NEXT, next);
    }

    #[inline]
    fn set_prev(&mut self, gc: Address, prev: Address) {
        let old = self.mem.read_ptr(gc, GcHead::PREV).raw();
        let value = compose_with_preserved_flags(old, prev.raw());
        self.mem.write_ptr(gc, GcHead::PREV, Address::new(value));
    }

    pub fn is_tracked(&self, op: Address) -> bool {
        !self.next(as_gc(op)).is_null()
    }

    pub fn is_finalized(&self, op: Address) -> bool {
        self.prev_flags(as_gc(op)).contains(GcPrevFlags::FINALIZED)
    }

    pub fn set_finalized(&mut self, op: Address) {
        let gc = as_gc(op);
        let old = self.mem.read_ptr(gc, GcHead::PREV).raw();
        let value = old | GcPrevFlags::FINALIZED.bits();
        self.mem.write_ptr(gc, GcHead::PREV, Address::new(value));
    }

    /// `_PyObject_GC_Link`: fresh object, zeroed head, counted in generation 0
    pub fn link(&mut self, op: Address) {
        let gc = as_gc(op);
        self.mem.write_ptr(gc, GcHead::NEXT, Address::NULL);
        self.mem.write_ptr(gc, GcHead::PREV, Address::NULL);
        self.increment_count();
        trace!("gc link {op:?}");
    }

    /// Append `op` to generation 0. No-op if it is already tracked.
    pub fn track(&mut self, op: Address) {
        assert!(
            !op.points_to_handle_space(),
            "track expects a native address, got handle space pointer {op:?}"
        );
        let gc = as_gc(op);
        if !self.next(gc).is_null() {
            return;
        }
        let generation0 = self.generation0();
        let last = self.prev(generation0);
        self.set_next(last, gc);
        self.set_prev(gc, last);
        self.set_next(gc, generation0);
        self.set_prev(generation0, gc);
        trace!("gc track {op:?} after {last:?}");
    }

    /// Unlink `op` from whatever list it is on and return its allocation base.
    /// `gc_prev` is left stale, `gc_next` becomes 0. No-op for untracked objects.
    pub fn untrack(&mut self, op: Address) -> Address {
        let gc = as_gc(op);
        if !self.next(gc).is_null() {
            self.list_remove(gc);
            trace!("gc untrack {op:?}");
        }
        gc
    }

    /// Like [`Self::untrack`], but also clears the previous pointer and the collecting flag.
    pub fn untrack_and_clear(&mut self, op: Address) -> Address {
        let gc = self.untrack(op);
        let old = self.mem.read_ptr(gc, GcHead::PREV).raw();
        let kept = old & GcPrevFlags::FINALIZED.bits();
        self.mem.write_ptr(gc, GcHead::PREV, Address::new(kept));
        gc
    }

    /// Untrack and free a dying object that native code only knows by its tagged pointer
    pub fn del(&mut self, tagged: Address) {
        assert!(
            tagged.points_to_handle_space(),
            "del expects a handle space pointer, got native address {tagged:?}"
        );
        let stub = tagged.to_stub();
        let base = self.untrack(stub);
        self.decrement_count();
        self.mem.free(base);
        trace!("gc del {tagged:?} freed {base:?}");
    }

    pub fn list_init(&mut self, head: Address) {
        self.mem.write_ptr(head, GcHead::PREV, head);
        self.mem.write_ptr(head, GcHead::NEXT, head);
    }

    pub fn list_is_empty(&self, head: Address) -> bool {
        self.next(head) == head
    }

    pub fn list_size(&self, head: Address) -> usize {
        let mut size = 0;
        let mut node = self.next(head);
        while node != head {
            size += 1;
            node = self.next(node);
        }
        size
    }

    /// Tail insert `node` into the list rooted at `list`
    pub fn list_append(&mut self, node: Address, list: Address) {
        let last = self.prev(list);
        self.set_prev(node, last);
        self.set_next(last, node);
        self.set_next(node, list);
        self.set_prev(list, node);
    }

    /// Unlink the head `node`; the node's own `gc_prev` is left as is
    pub fn list_remove(&mut self, node: Address) {
        let prev = self.prev(node);
        let next = self.next(node);
        self.set_next(prev, next);
        self.set_prev(next, prev);
        self.set_next(node, Address::NULL);
    }

    pub fn list_move(&mut self, node: Address, list: Address) {
        let prev = self.prev(node);
        let next = self.next(node);
        self.set_next(prev, next);
        self.set_prev(next, prev);
        self.list_append(node, list);
    }

    /// Splice every node of `from` onto the tail of `to`; `from` is empty afterwards
    pub fn list_merge(&mut self, from: Address, to: Address) {
        assert_ne!(from, to, "cannot merge a gc list into itself");
        if self.list_is_empty(from) {
            return;
        }
        let to_tail = self.prev(to);
        let from_head = self.next(from);
        let from_tail = self.prev(from);
        self.set_next(to_tail, from_head);
        self.set_prev(from_head, to_tail);
        self.set_next(from_tail, to);
        self.set_prev(to, from_tail);
        self.list_init(from);
    }

    /// Walk the list forward checking every back link. Returns the number of nodes.
    pub fn validate_list(&self, head: Address) -> BridgeResult<usize> {
        let mut size = 0;
        let mut prev = head;
        let mut node = self.next(head);
        while node != head {
            if node.is_null() {
                return Err(BridgeError::NullGcLink(prev));
            }
            if self.prev_flags(node).contains(GcPrevFlags::COLLECTING) {
                return Err(BridgeError::CollectingFlagSet(node));
            }
            let found_prev = self.prev(node);
            if found_prev != prev {
                return Err(BridgeError::CorruptGcList {
                    node,
                    expected_prev: prev,
                    found_prev,
                });
            }
            size += 1;
            prev = node;
            node = self.next(node);
        }
        let found_prev = self.prev(head);
        if found_prev != prev {
            return Err(BridgeError::CorruptGcList {
                node: head,
                expected_prev: prev,
                found_prev,
            });
        }
        Ok(size)
    }

    /// Visit every tracked object of every generation, including the permanent one, until
    /// `visit` returns false. Returns whether every object was visited.
    pub fn visit_objects(&self, mut visit: impl FnMut(Address) -> bool) -> bool {
        for index in 0..=NUM_GENERATIONS {
            let head = self.generation_head(index);
            let mut node = self.next(head);
            while node != head {
                let next = self.next(node);
                if !visit(from_gc(node)) {
                    return false;
                }
                node = next;
            }
        }
        true
    }
}
