//! Per runtime bridge state behind one interpreter lock.
use std::{
    collections::HashMap,
    ops::RangeInclusive,
    sync::Arc,
};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::{
    Address, BridgeError, BridgeResult, DirectMappedCache, FieldAccess, RawMemory, SlotId,
    StructLayout,
    gc::{DEFAULT_THRESHOLDS, GcSupport},
    layout::{GcHead, NUM_GENERATIONS, ObjectStub, SequenceStub, ThreadStateStub, TypeFlags},
    tables::{
        EscapeHeap, EscapedReference, HandleCache, NativeObjectReference, ReferenceCache,
        ReferenceStack, StubShape, escape_heap,
    },
    wrapper::{
        Delegate, IMMORTAL_REFCNT, Interned, MANAGED_REFCNT, NativeWrapper, ObjectWrapper,
        StructWrapper,
    },
};

/// Native memory as the context owns it
pub type Memory = dyn FieldAccess + Send;

/// Upper bound on the number of preallocated small ints
const MAX_SMALL_INTS: i64 = 1 << 20;

#[derive(Debug, Default, Clone)]
pub struct ContextCreateInfo {
    /// slots added per escape heap growth step
    pub escape_heap_chunk: Option<usize>,
    pub reference_stack_capacity: Option<usize>,
    pub handle_cache_capacity: Option<usize>,
    pub reference_cache_capacity: Option<usize>,
    pub small_ints: Option<RangeInclusive<i64>>,
    pub gc_thresholds: Option<[i32; NUM_GENERATIONS]>,
    /// hand out freed table ids again, off only for debugging
    pub reuse_handles: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub escape_heap_chunk: usize,
    pub reference_stack_capacity: usize,
    pub handle_cache_capacity: usize,
    pub reference_cache_capacity: usize,
    pub small_ints: RangeInclusive<i64>,
    pub gc_thresholds: [i32; NUM_GENERATIONS],
    pub reuse_handles: bool,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            escape_heap_chunk: 256,
            reference_stack_capacity: 16,
            handle_cache_capacity: 64,
            reference_cache_capacity: 64,
            small_ints: -5..=256,
            gc_thresholds: DEFAULT_THRESHOLDS,
            reuse_handles: true,
        }
    }
}

impl ContextSettings {
    pub fn resolve(info: ContextCreateInfo) -> BridgeResult<Self> {
        let mut settings = Self::default();
        info.escape_heap_chunk
            .inspect(|&val| settings.escape_heap_chunk = val);
        info.reference_stack_capacity
            .inspect(|&val| settings.reference_stack_capacity = val);
        info.handle_cache_capacity
            .inspect(|&val| settings.handle_cache_capacity = val);
        info.reference_cache_capacity
            .inspect(|&val| settings.reference_cache_capacity = val);
        info.gc_thresholds.inspect(|&val| settings.gc_thresholds = val);
        info.reuse_handles.inspect(|&val| settings.reuse_handles = val);
        if let Some(range) = info.small_ints {
            settings.small_ints = range;
        }
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> BridgeResult<()> {
        let invalid = |message: String| Err(BridgeError::InvalidConfig(message));
        if self.escape_heap_chunk == 0 {
            return invalid("escape heap chunk must not be zero".into());
        }
        if self.reference_stack_capacity == 0 {
            return invalid("reference stack capacity must not be zero".into());
        }
        for (name, capacity) in [
            ("handle cache", self.handle_cache_capacity),
            ("reference cache", self.reference_cache_capacity),
        ] {
            if capacity == 0 || !capacity.is_power_of_two() {
                return invalid(format!(
                    "{name} capacity must be a non-zero power of two, got {capacity}"
                ));
            }
        }
        if self.small_ints.is_empty()
            || !self.small_ints.contains(&0)
            || !self.small_ints.contains(&1)
        {
            return invalid(format!(
                "small int range {:?} must be non-empty and contain 0 and 1",
                self.small_ints
            ));
        }
        let span = self.small_ints.end().checked_sub(*self.small_ints.start());
        if !span.is_some_and(|span| span < MAX_SMALL_INTS) {
            return invalid(format!(
                "small int range {:?} holds more than {MAX_SMALL_INTS} values",
                self.small_ints
            ));
        }
        if let Some(threshold) = self.gc_thresholds.iter().find(|&&t| t < 0) {
            return invalid(format!("gc threshold {threshold} is negative"));
        }
        Ok(())
    }

    fn small_int_count(&self) -> usize {
        (self.small_ints.end() - self.small_ints.start() + 1) as usize
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationCounters {
    pub escaped: u64,
    pub deallocated: u64,
    pub native_references: u64,
    pub native_released: u64,
    pub structs: u64,
    pub closures: u64,
}

/// Result of resolving a pointer native code handed back
#[derive(Debug, Clone)]
pub enum Resolved {
    /// escaped managed object
    Wrapper(Arc<ObjectWrapper>),
    /// proxy of a natively allocated object
    Native(Delegate),
}

/// Native entry point backed by a managed callable
#[derive(Debug)]
pub struct Closure {
    pub code: Address,
    pub target: Delegate,
}

pub struct ContextState {
    settings: ContextSettings,
    mem: Box<Memory>,
    gc_state: Address,
    /// pointer array of the escaped small ints, `small_ints.start()` first
    small_ints: Address,
    interned: HashMap<Interned, Arc<ObjectWrapper>, ahash::RandomState>,
    /// keyed by delegate address, pruned once the delegate dies
    wrappers: HashMap<usize, Arc<ObjectWrapper>, ahash::RandomState>,
    escape_heap: EscapeHeap,
    /// stubs native code still holds after the managed side died
    orphans: HashMap<Address, StubShape, ahash::RandomState>,
    reference_stack: ReferenceStack,
    handle_cache: HandleCache,
    reference_cache: ReferenceCache,
    structs: HashMap<Address, Arc<StructWrapper>, ahash::RandomState>,
    closures: HashMap<Address, Closure, ahash::RandomState>,
    pending_deallocs: Vec<Address>,
    counters: AllocationCounters,
}

impl std::fmt::Debug for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextState")
            .field("settings", &self.settings)
            .field("gc_state", &self.gc_state)
            .field("escaped", &self.escape_heap.len())
            .field("native_references", &self.reference_stack.len())
            .field("counters", &self.counters)
            .finish()
    }
}

impl ContextState {
    fn new(settings: ContextSettings, mut mem: Box<Memory>) -> BridgeResult<Self> {
        let gc_state = GcSupport::create_state(&mut *mem, settings.gc_thresholds);
        let small_ints = mem.allocate(StructLayout::pointer_array(settings.small_int_count()));

        let mut escaped = escape_heap(settings.escape_heap_chunk);
        escaped.set_reuse(settings.reuse_handles);
        let mut reference_stack = ReferenceStack::new(settings.reference_stack_capacity);
        reference_stack.set_reuse(settings.reuse_handles);

        Ok(Self {
            handle_cache: DirectMappedCache::new(settings.handle_cache_capacity)?,
            reference_cache: DirectMappedCache::new(settings.reference_cache_capacity)?,
            settings,
            mem,
            gc_state,
            small_ints,
            interned: HashMap::default(),
            wrappers: HashMap::default(),
            escape_heap: escaped,
            orphans: HashMap::default(),
            reference_stack,
            structs: HashMap::default(),
            closures: HashMap::default(),
            pending_deallocs: Vec::new(),
            counters: AllocationCounters::default(),
        })
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    pub fn counters(&self) -> AllocationCounters {
        self.counters
    }

    pub fn memory(&mut self) -> &mut Memory {
        &mut *self.mem
    }

    pub fn gc(&mut self) -> GcSupport<'_, Memory> {
        GcSupport::new(&mut *self.mem, self.gc_state)
    }

    pub fn gc_state(&self) -> Address {
        self.gc_state
    }

    pub fn small_ints(&self) -> Address {
        self.small_ints
    }

    pub fn escaped_count(&self) -> usize {
        self.escape_heap.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn native_reference_count(&self) -> usize {
        self.reference_stack.len()
    }

    pub fn handle_cache(&self) -> &HandleCache {
        &self.handle_cache
    }

    pub fn reference_cache(&self) -> &ReferenceCache {
        &self.reference_cache
    }

    /// The one wrapper of `delegate`, kept for as long as the delegate lives. Interned values
    /// share a single immortal wrapper per value.
    pub fn wrap(&mut self, delegate: &Delegate) -> Arc<ObjectWrapper> {
        if let Some(interned) = delegate.interned() {
            let cacheable = match interned {
                Interned::SmallInt(value) => self.settings.small_ints.contains(&value),
                _ => true,
            };
            if cacheable {
                let wrapper = self
                    .interned
                    .entry(interned)
                    .or_insert_with(|| Arc::new(ObjectWrapper::immortal(delegate.clone())));
                return wrapper.clone();
            }
        }

        let key = Arc::as_ptr(delegate) as *const () as usize;
        if let Some(wrapper) = self.wrappers.get(&key).filter(|wrapper| wrapper.is_alive()) {
            return wrapper.clone();
        }
        let wrapper = Arc::new(ObjectWrapper::new(delegate));
        self.wrappers.insert(key, wrapper.clone());
        wrapper
    }

    /// Tagged pointer of `wrapper`, escaping it first if needed.
    ///
    /// The stub is allocated and registered before any referent escapes so reference cycles
    /// resolve to the pending pointer instead of recursing.
    pub fn to_native(&mut self, wrapper: &Arc<ObjectWrapper>) -> Address {
        assert!(
            !wrapper.is_freed(),
            "{:?} was freed by native code",
            wrapper.native_pointer()
        );
        if let Some(pointer) = wrapper.native_pointer() {
            return pointer;
        }
        if let Some(pending) = wrapper.pending_pointer() {
            return pending;
        }

        let Some(delegate) = wrapper.delegate() else {
            panic!("cannot escape an object the managed side already collected");
        };
        let referents = delegate.referents();
        let shape = StubShape {
            gc: delegate.type_flags().contains(TypeFlags::HAVE_GC),
            items: (!referents.is_empty()).then_some(referents.len()),
        };
        let body = match shape.items {
            Some(_) => SequenceStub::LAYOUT,
            None => ObjectStub::LAYOUT,
        };
        let (layout, offset) = match shape.gc {
            true => body.with_prefix(GcHead::LAYOUT),
            false => (body, 0),
        };
        let base = self.mem.allocate(layout);
        let stub = base.add(offset);
        let tagged = stub.to_handle();

        self.mem
            .write_i64(stub, ObjectStub::REFCNT, wrapper.managed_refcnt());
        self.mem
            .write_ptr(stub, ObjectStub::TYPE, delegate.type_pointer());
        let id = self
            .escape_heap
            .set(EscapedReference::new(wrapper, tagged, shape));
        self.mem
            .write_i32(stub, ObjectStub::HANDLE_TABLE_INDEX, id.raw() as i32);
        wrapper.begin_escape(tagged);

        if let Some(len) = shape.items {
            let items = self.mem.allocate(StructLayout::pointer_array(len));
            for (index, referent) in referents.iter().enumerate() {
                let child = self.wrap(referent);
                let child_pointer = self.to_native(&child);
                self.adjust_native_refcount(child_pointer, 1);
                self.mem.write_ptr_at(items, index, child_pointer);
            }
            self.mem.write_i64(stub, SequenceStub::SIZE, len as i64);
            self.mem.write_ptr(stub, SequenceStub::ITEMS, items);
        }

        if shape.gc {
            let mut gc = self.gc();
            gc.link(stub);
            gc.track(stub);
        }

        wrapper.finish_escape(tagged);
        let refcnt = self.mem.read_i64(stub, ObjectStub::REFCNT);
        if let Some(entry) = self.escape_heap.get_mut(id) {
            entry.set_strong(refcnt > MANAGED_REFCNT);
        }
        self.handle_cache.insert(tagged, Arc::downgrade(wrapper));

        if let Some(Interned::SmallInt(value)) = delegate.interned() {
            if self.settings.small_ints.contains(&value) {
                let index = (value - self.settings.small_ints.start()) as usize;
                self.mem.write_ptr_at(self.small_ints, index, tagged);
            }
        }

        self.counters.escaped += 1;
        debug!("escaped {delegate:?} to {tagged:?} as {id:?} ({shape:?})");
        tagged
    }

    /// Current refcount, native once escaped
    pub fn refcount(&self, wrapper: &ObjectWrapper) -> i64 {
        match wrapper.native_pointer().or(wrapper.pending_pointer()) {
            Some(tagged) => self.mem.read_i64(tagged.to_stub(), ObjectStub::REFCNT),
            None => wrapper.managed_refcnt(),
        }
    }

    pub fn inc_ref(&mut self, wrapper: &ObjectWrapper) -> i64 {
        self.adjust_refcount(wrapper, 1)
    }

    pub fn dec_ref(&mut self, wrapper: &ObjectWrapper) -> i64 {
        self.adjust_refcount(wrapper, -1)
    }

    pub fn set_refcount(&mut self, wrapper: &ObjectWrapper, value: i64) -> i64 {
        let delta = value - self.refcount(wrapper);
        self.adjust_refcount(wrapper, delta)
    }

    fn adjust_refcount(&mut self, wrapper: &ObjectWrapper, delta: i64) -> i64 {
        match wrapper.native_pointer().or(wrapper.pending_pointer()) {
            Some(tagged) => self.adjust_native_refcount(tagged, delta),
            None => wrapper.adjust_managed_refcnt(delta),
        }
    }

    /// Read-modify-write `ob_refcnt` of an escaped object and flip its escape heap entry between
    /// strong and weak. Orphaned stubs only count native references and are freed at zero.
    pub fn adjust_native_refcount(&mut self, tagged: Address, delta: i64) -> i64 {
        assert!(
            tagged.points_to_handle_space(),
            "refcount of {tagged:?} is not managed by the bridge"
        );
        let stub = tagged.to_stub();
        let current = self.mem.read_i64(stub, ObjectStub::REFCNT);
        if current == IMMORTAL_REFCNT {
            return current;
        }
        let new = current + delta;

        if let Some(&shape) = self.orphans.get(&tagged) {
            assert!(new >= 0, "refcount of orphaned {tagged:?} fell to {new}");
            self.mem.write_i64(stub, ObjectStub::REFCNT, new);
            trace!("refcount of orphaned {tagged:?}: {current} -> {new}");
            if new == 0 {
                self.orphans.remove(&tagged);
                self.deallocate_stub(tagged, shape);
            }
            return new;
        }

        assert!(
            new >= MANAGED_REFCNT - 1,
            "refcount of {tagged:?} fell to {new}, below the managed floor"
        );
        self.mem.write_i64(stub, ObjectStub::REFCNT, new);
        if let Some(entry) = self
            .bound_entry(tagged)
            .and_then(|id| self.escape_heap.get_mut(id))
        {
            entry.set_strong(new > MANAGED_REFCNT);
        }
        trace!("refcount of {tagged:?}: {current} -> {new}");
        new
    }

    /// Escape heap id the stub at `tagged` names, if that entry still belongs to it
    fn bound_entry(&self, tagged: Address) -> Option<SlotId> {
        let index = self
            .mem
            .read_i32(tagged.to_stub(), ObjectStub::HANDLE_TABLE_INDEX);
        let id = SlotId::new(u32::try_from(index).ok()?);
        self.escape_heap
            .get(id)
            .is_some_and(|entry| entry.pointer == tagged)
            .then_some(id)
    }

    /// Mirror a natively allocated object by `proxy`; the managed side now holds
    /// `MANAGED_REFCNT` references to it.
    pub fn register_native_object(&mut self, pointer: Address, proxy: &Delegate) -> SlotId {
        assert!(
            !pointer.is_null() && !pointer.points_to_handle_space(),
            "native object reference needs a real address, got {pointer:?}"
        );
        let refcnt = self.mem.read_i64(pointer, ObjectStub::REFCNT);
        self.mem
            .write_i64(pointer, ObjectStub::REFCNT, refcnt + MANAGED_REFCNT);
        let id = self
            .reference_stack
            .push(NativeObjectReference::new(pointer, proxy));
        self.reference_cache.insert(pointer, id);
        self.counters.native_references += 1;
        debug!("native object {pointer:?} mirrored as {id:?}");
        id
    }

    /// Stand-in for a native allocator: plain object with one native owner
    pub fn allocate_native_object(&mut self, type_pointer: Address) -> Address {
        let pointer = self.mem.allocate(ObjectStub::LAYOUT);
        self.mem.write_i64(pointer, ObjectStub::REFCNT, 1);
        self.mem.write_ptr(pointer, ObjectStub::TYPE, type_pointer);
        self.mem.write_i32(pointer, ObjectStub::HANDLE_TABLE_INDEX, -1);
        pointer
    }

    /// Native objects whose proxies died with nothing else holding them
    pub fn pending_deallocs(&self) -> &[Address] {
        &self.pending_deallocs
    }

    /// Free everything queued by [`Self::poll_reference_queue`]
    pub fn deallocate_pending(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_deallocs);
        for &pointer in &pending {
            self.mem.free(pointer);
        }
        if !pending.is_empty() {
            debug!("bulk deallocated {} native objects", pending.len());
        }
        pending.len()
    }

    /// Release table entries whose managed side died. Repeats until a pass releases nothing,
    /// since freeing a container can drop the last reference to its referents.
    pub fn poll_reference_queue(&mut self) -> usize {
        let mut released = 0;
        loop {
            let pass = self.release_escaped() + self.release_native_references();
            if pass == 0 {
                break;
            }
            released += pass;
        }
        self.wrappers.retain(|_, wrapper| wrapper.is_alive());
        released
    }

    fn release_escaped(&mut self) -> usize {
        let mut released = 0;
        for id in self.escape_heap.ids() {
            if !self.escape_heap.get(id).is_some_and(EscapedReference::is_collected) {
                continue;
            }
            let Some(entry) = self.escape_heap.remove(id) else {
                continue;
            };
            released += 1;
            self.handle_cache.invalidate(entry.pointer);

            let stub = entry.pointer.to_stub();
            let refcnt = self.mem.read_i64(stub, ObjectStub::REFCNT) - MANAGED_REFCNT;
            self.mem.write_i64(stub, ObjectStub::REFCNT, refcnt);
            if refcnt <= 0 {
                self.deallocate_stub(entry.pointer, entry.shape);
            } else {
                self.mem.write_i32(stub, ObjectStub::HANDLE_TABLE_INDEX, -1);
                self.orphans.insert(entry.pointer, entry.shape);
                debug!(
                    "{:?} collected on the managed side, native still holds {refcnt}",
                    entry.pointer
                );
            }
        }
        released
    }

    fn deallocate_stub(&mut self, tagged: Address, shape: StubShape) {
        let stub = tagged.to_stub();
        if let Some(len) = shape.items {
            let items = self.mem.read_ptr(stub, SequenceStub::ITEMS);
            for index in 0..len {
                let child = self.mem.read_ptr_at(items, index);
                self.adjust_native_refcount(child, -1);
            }
            self.mem.free(items);
        }
        if shape.gc {
            self.gc().del(tagged);
        } else {
            self.mem.free(stub);
        }
        self.counters.deallocated += 1;
        debug!("deallocated stub {tagged:?}");
    }

    fn release_native_references(&mut self) -> usize {
        let mut released = 0;
        for id in self.reference_stack.ids() {
            if !self
                .reference_stack
                .get(id)
                .is_some_and(NativeObjectReference::is_collected)
            {
                continue;
            }
            let Some(reference) = self.reference_stack.remove(id) else {
                continue;
            };
            released += 1;
            self.reference_cache.invalidate(reference.pointer);

            let pointer = reference.pointer;
            let refcnt = self.mem.read_i64(pointer, ObjectStub::REFCNT) - MANAGED_REFCNT;
            self.mem.write_i64(pointer, ObjectStub::REFCNT, refcnt);
            if refcnt == 0 {
                self.pending_deallocs.push(pointer);
            }
            self.counters.native_released += 1;
            trace!("proxy of {pointer:?} died, refcount now {refcnt}");
        }
        released
    }

    /// Managed side of a pointer native code handed back
    pub fn resolve(&mut self, pointer: Address) -> BridgeResult<Resolved> {
        if pointer.is_null() {
            return Err(BridgeError::NullPointer);
        }
        if pointer.points_to_handle_space() {
            if self.orphans.contains_key(&pointer) {
                return Err(BridgeError::Collected(pointer));
            }
            let wrapper = self.handle_cache.lookup_or_resolve(
                pointer,
                |cached| {
                    cached
                        .upgrade()
                        .is_some_and(|wrapper| wrapper.native_pointer() == Some(pointer))
                },
                || {
                    let stub = pointer.to_stub();
                    let index = self.mem.read_i32(stub, ObjectStub::HANDLE_TABLE_INDEX);
                    if index < 0 {
                        return Err(BridgeError::UnknownHandle(pointer));
                    }
                    match self.escape_heap.get(SlotId::new(index as u32)) {
                        Some(entry) if entry.pointer == pointer => {
                            Ok(Arc::downgrade(&entry.wrapper))
                        }
                        _ => Err(BridgeError::StaleHandle(pointer)),
                    }
                },
            )?;
            return wrapper
                .upgrade()
                .filter(|wrapper| wrapper.is_alive())
                .map(Resolved::Wrapper)
                .ok_or(BridgeError::Collected(pointer));
        }

        let id = self.reference_cache.lookup_or_resolve(
            pointer,
            |&id| self.reference_stack.binds(id, pointer),
            || {
                self.reference_stack
                    .lookup(pointer)
                    .ok_or(BridgeError::UnknownPointer(pointer))
            },
        )?;
        self.reference_stack
            .get(id)
            .and_then(|reference| reference.proxy.upgrade())
            .map(Resolved::Native)
            .ok_or(BridgeError::Collected(pointer))
    }

    /// Allocate a zeroed native struct replacing `delegate` and let `init` fill it in
    pub fn new_struct(
        &mut self,
        delegate: Delegate,
        layout: StructLayout,
        init: impl FnOnce(&mut Memory, Address),
    ) -> Arc<StructWrapper> {
        let wrapper = Arc::new(StructWrapper::new(delegate, layout));
        let pointer = self.mem.allocate(layout);
        init(&mut *self.mem, pointer);
        wrapper.base().set_native_pointer(pointer);
        self.structs.insert(pointer, wrapper.clone());
        self.counters.structs += 1;
        debug!("allocated struct {} at {pointer:?}", layout.name);
        wrapper
    }

    /// Thread state block wired to this context's gc state and small ints
    pub fn new_thread_state(&mut self, delegate: Delegate) -> Arc<StructWrapper> {
        let gc_state = self.gc_state;
        let small_ints = self.small_ints;
        self.new_struct(delegate, ThreadStateStub::LAYOUT, |mem, state| {
            mem.write_ptr(state, ThreadStateStub::GC, gc_state);
            mem.write_ptr(state, ThreadStateStub::SMALL_INTS, small_ints);
        })
    }

    pub fn free_struct(&mut self, wrapper: &StructWrapper) {
        let Some(pointer) = wrapper.native_pointer() else {
            panic!("struct wrapper was never allocated");
        };
        assert!(!wrapper.is_freed(), "struct at {pointer:?} freed twice");
        self.structs.remove(&pointer);
        self.mem.free(pointer);
        wrapper.mark_freed();
        debug!("freed struct {} at {pointer:?}", wrapper.layout().name);
    }

    /// Native entry point for `target`, alive until released
    pub fn register_closure(&mut self, target: Delegate) -> Address {
        let code = self.mem.allocate(StructLayout::pointer_array(1));
        self.mem.write_ptr_at(code, 0, target.type_pointer());
        self.closures.insert(code, Closure { code, target });
        self.counters.closures += 1;
        trace!("closure at {code:?}");
        code
    }

    pub fn closure(&self, code: Address) -> Option<&Closure> {
        self.closures.get(&code)
    }

    pub fn release_closure(&mut self, code: Address) -> bool {
        match self.closures.remove(&code) {
            Some(_) => {
                self.mem.free(code);
                true
            }
            None => false,
        }
    }

    /// Escape one interned small int per value of the configured range
    pub fn init_small_ints(&mut self, mut make: impl FnMut(i64) -> Delegate) {
        for value in self.settings.small_ints.clone() {
            let delegate = make(value);
            assert_eq!(
                delegate.interned(),
                Some(Interned::SmallInt(value)),
                "small int delegate does not report its value"
            );
            let wrapper = self.wrap(&delegate);
            self.to_native(&wrapper);
        }
        debug!("small ints {:?} escaped", self.settings.small_ints);
    }

    /// Escaped pointer of small int `value`, null if it is outside the range or not escaped
    pub fn small_int(&self, value: i64) -> Address {
        if !self.settings.small_ints.contains(&value) {
            return Address::NULL;
        }
        let index = (value - self.settings.small_ints.start()) as usize;
        self.mem.read_ptr_at(self.small_ints, index)
    }

    pub fn track(&mut self, op: Address) {
        self.gc().track(op);
    }

    pub fn untrack(&mut self, op: Address) -> Address {
        self.gc().untrack(op)
    }

    /// `PyObject_GC_Del` from a native deallocator. An escaped object loses its escape heap
    /// entry and its wrapper is marked freed before the stub goes away.
    pub fn del(&mut self, tagged: Address) {
        assert!(
            tagged.points_to_handle_space(),
            "del expects a handle space pointer, got native address {tagged:?}"
        );
        let shape = match self.orphans.remove(&tagged) {
            Some(shape) => Some(shape),
            None => self.unbind_escaped(tagged),
        };
        assert!(
            shape.is_none_or(|shape| shape.gc),
            "del of {tagged:?}, which has no gc head"
        );
        // referents were released by the native deallocator, the items block is ours
        if shape.is_some_and(|shape| shape.items.is_some()) {
            let items = self.mem.read_ptr(tagged.to_stub(), SequenceStub::ITEMS);
            self.mem.free(items);
        }
        self.gc().del(tagged);
        self.counters.deallocated += 1;
    }

    fn unbind_escaped(&mut self, tagged: Address) -> Option<StubShape> {
        let id = self.bound_entry(tagged)?;
        let entry = self.escape_heap.remove(id)?;
        self.mem
            .write_i32(tagged.to_stub(), ObjectStub::HANDLE_TABLE_INDEX, -1);
        self.handle_cache.invalidate(tagged);
        entry.wrapper.mark_freed();
        debug!("{tagged:?} deleted by native code while escaped as {id:?}");
        Some(entry.shape)
    }
}

impl Drop for ContextState {
    fn drop(&mut self) {
        let gc_state = self.gc_state;
        let mut tracked = 0usize;
        self.gc().visit_objects(|_| {
            tracked += 1;
            true
        });
        if tracked > 0 {
            warn!("context torn down with {tracked} objects still tracked");
        }
        if !self.escape_heap.is_empty() {
            warn!(
                "context torn down with {} escaped objects",
                self.escape_heap.len()
            );
        }
        if !self.orphans.is_empty() {
            warn!(
                "context torn down with {} stubs still held by native code",
                self.orphans.len()
            );
        }
        for code in self.closures.keys().copied().collect::<Vec<_>>() {
            self.release_closure(code);
        }
        GcSupport::destroy_state(&mut *self.mem, gc_state);
        self.mem.free(self.small_ints);
        info!(
            "native context torn down after {} escapes, {} deallocations",
            self.counters.escaped, self.counters.deallocated
        );
    }
}

/// The bridge of one runtime instance. Every entry point holds the lock for one operation;
/// [`NativeContext::with_gil`] runs several under one acquisition.
#[derive(Debug)]
pub struct NativeContext {
    state: Mutex<ContextState>,
}

impl NativeContext {
    pub fn new(info: ContextCreateInfo) -> BridgeResult<Self> {
        Self::with_memory(info, Box::new(RawMemory::new()))
    }

    pub fn with_memory(info: ContextCreateInfo, mem: Box<Memory>) -> BridgeResult<Self> {
        let settings = ContextSettings::resolve(info)?;
        info!("native context created with {settings:?}");
        Ok(Self {
            state: Mutex::new(ContextState::new(settings, mem)?),
        })
    }

    pub fn with_gil<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    pub fn wrap(&self, delegate: &Delegate) -> Arc<ObjectWrapper> {
        self.with_gil(|state| state.wrap(delegate))
    }

    pub fn to_native(&self, wrapper: &Arc<ObjectWrapper>) -> Address {
        self.with_gil(|state| state.to_native(wrapper))
    }

    pub fn inc_ref(&self, wrapper: &ObjectWrapper) -> i64 {
        self.with_gil(|state| state.inc_ref(wrapper))
    }

    pub fn dec_ref(&self, wrapper: &ObjectWrapper) -> i64 {
        self.with_gil(|state| state.dec_ref(wrapper))
    }

    pub fn resolve(&self, pointer: Address) -> BridgeResult<Resolved> {
        self.with_gil(|state| state.resolve(pointer))
    }

    pub fn poll_reference_queue(&self) -> usize {
        self.with_gil(|state| state.poll_reference_queue())
    }

    pub fn track(&self, op: Address) {
        self.with_gil(|state| state.track(op));
    }

    pub fn untrack(&self, op: Address) -> Address {
        self.with_gil(|state| state.untrack(op))
    }

    pub fn del(&self, tagged: Address) {
        self.with_gil(|state| state.del(tagged));
    }

    pub fn counters(&self) -> AllocationCounters {
        self.with_gil(|state| state.counters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::SparseMemory, wrapper::tests::Dummy};

    fn context() -> NativeContext {
        sparse_context(ContextCreateInfo::default())
    }

    fn sparse_context(info: ContextCreateInfo) -> NativeContext {
        NativeContext::with_memory(info, Box::new(SparseMemory::new())).unwrap()
    }

    #[test]
    fn rejects_invalid_configuration() {
        let bad = [
            ContextCreateInfo {
                handle_cache_capacity: Some(12),
                ..Default::default()
            },
            ContextCreateInfo {
                small_ints: Some(2..=10),
                ..Default::default()
            },
            ContextCreateInfo {
                gc_thresholds: Some([700, -1, 10]),
                ..Default::default()
            },
            ContextCreateInfo {
                escape_heap_chunk: Some(0),
                ..Default::default()
            },
            ContextCreateInfo {
                small_ints: Some(-1..=i64::MAX),
                ..Default::default()
            },
            ContextCreateInfo {
                small_ints: Some(-5..=MAX_SMALL_INTS),
                ..Default::default()
            },
        ];
        for info in bad {
            assert!(matches!(
                ContextSettings::resolve(info),
                Err(BridgeError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn create_info_overrides_defaults() {
        let settings = ContextSettings::resolve(ContextCreateInfo {
            escape_heap_chunk: Some(8),
            small_ints: Some(-1..=1),
            reuse_handles: Some(false),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(settings.escape_heap_chunk, 8);
        assert_eq!(settings.small_ints, -1..=1);
        assert!(!settings.reuse_handles);
        assert_eq!(settings.reference_stack_capacity, 16);
        assert_eq!(settings.gc_thresholds, [700, 10, 10]);
    }

    #[test]
    fn one_wrapper_per_object() {
        let ctx = context();
        let delegate = Dummy::plain();
        let a = ctx.wrap(&delegate);
        let b = ctx.wrap(&delegate);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &ctx.wrap(&Dummy::plain())));
    }

    #[test]
    fn to_native_is_idempotent_and_resolvable() {
        let ctx = context();
        let delegate = Dummy::plain();
        let wrapper = ctx.wrap(&delegate);
        let pointer = ctx.to_native(&wrapper);
        assert!(pointer.points_to_handle_space());
        assert_eq!(ctx.to_native(&wrapper), pointer);
        assert_eq!(ctx.counters().escaped, 1);

        ctx.with_gil(|state| {
            let stub = pointer.to_stub();
            assert_eq!(state.memory().read_i64(stub, ObjectStub::REFCNT), MANAGED_REFCNT);
            assert_eq!(
                state.memory().read_ptr(stub, ObjectStub::TYPE),
                Address::new(0x7_0000)
            );
            assert_eq!(state.escaped_count(), 1);
        });

        let Ok(Resolved::Wrapper(resolved)) = ctx.resolve(pointer) else {
            panic!("escaped object must resolve");
        };
        assert!(Arc::ptr_eq(&resolved, &wrapper));
        assert!(ctx.resolve(pointer).is_ok());
        ctx.with_gil(|state| assert_eq!(state.handle_cache().stats().hits, 2));
    }

    #[test]
    fn gc_objects_are_tracked_in_generation0() {
        let ctx = context();
        let delegate = Dummy::gc();
        let wrapper = ctx.wrap(&delegate);
        let pointer = ctx.to_native(&wrapper);
        ctx.with_gil(|state| {
            let gc = state.gc();
            assert!(gc.is_tracked(pointer.to_stub()));
            assert_eq!(gc.count(0), 1);
            assert_eq!(gc.validate_list(gc.generation0()), Ok(1));
        });
    }

    #[test]
    fn small_ints_share_one_native_address() {
        let ctx = context();
        ctx.with_gil(|state| state.init_small_ints(Dummy::small_int));

        let five = ctx.wrap(&Dummy::small_int(5));
        let again = ctx.wrap(&Dummy::small_int(5));
        assert!(Arc::ptr_eq(&five, &again));
        let pointer = ctx.to_native(&again);
        assert_eq!(ctx.with_gil(|state| state.small_int(5)), pointer);
        assert!(five.is_immortal());
        assert_eq!(ctx.inc_ref(&five), IMMORTAL_REFCNT);

        let Ok(Resolved::Wrapper(resolved)) = ctx.resolve(pointer) else {
            panic!("small int must resolve");
        };
        assert_eq!(
            resolved.delegate().and_then(|delegate| delegate.interned()),
            Some(Interned::SmallInt(5))
        );

        let big = ctx.wrap(&Dummy::small_int(1000));
        assert!(!big.is_immortal());
        assert_eq!(ctx.with_gil(|state| state.small_int(1000)), Address::NULL);
    }

    #[test]
    fn refcount_moves_from_managed_to_native() {
        let ctx = context();
        let delegate = Dummy::plain();
        let wrapper = ctx.wrap(&delegate);
        assert_eq!(ctx.inc_ref(&wrapper), MANAGED_REFCNT + 1);
        let pointer = ctx.to_native(&wrapper);
        ctx.with_gil(|state| {
            assert_eq!(state.refcount(&wrapper), MANAGED_REFCNT + 1);
            assert_eq!(state.inc_ref(&wrapper), MANAGED_REFCNT + 2);
            assert_eq!(state.set_refcount(&wrapper, MANAGED_REFCNT), MANAGED_REFCNT);
            let stub = pointer.to_stub();
            assert_eq!(state.memory().read_i64(stub, ObjectStub::REFCNT), MANAGED_REFCNT);
        });
    }

    #[test]
    fn weak_entry_lets_the_object_die() {
        let ctx = context();
        let delegate = Dummy::gc();
        let wrapper = ctx.wrap(&delegate);
        let pointer = ctx.to_native(&wrapper);
        drop(wrapper);
        assert_eq!(ctx.poll_reference_queue(), 0);
        drop(delegate);

        assert_eq!(ctx.poll_reference_queue(), 1);
        assert_eq!(ctx.counters().deallocated, 1);
        ctx.with_gil(|state| {
            assert_eq!(state.escaped_count(), 0);
            let gc = state.gc();
            assert_eq!(gc.count(0), 0);
            assert!(gc.list_is_empty(gc.generation0()));
        });
        assert!(ctx.resolve(pointer).is_err());
    }

    #[test]
    fn strong_entry_keeps_native_owned_objects_alive() {
        let ctx = context();
        let delegate = Dummy::plain();
        let wrapper = ctx.wrap(&delegate);
        let pointer = ctx.to_native(&wrapper);
        ctx.inc_ref(&wrapper);
        let weak = Arc::downgrade(&delegate);
        drop(wrapper);
        drop(delegate);

        assert_eq!(ctx.poll_reference_queue(), 0);
        let Ok(Resolved::Wrapper(wrapper)) = ctx.resolve(pointer) else {
            panic!("strongly held object must resolve");
        };
        ctx.dec_ref(&wrapper);
        drop(wrapper);
        assert!(weak.upgrade().is_none());
        assert_eq!(ctx.poll_reference_queue(), 1);
    }

    #[test]
    fn container_escapes_and_releases_referents() {
        let ctx = context();
        let children = vec![Dummy::plain(), Dummy::gc()];
        let delegate = Dummy::container(children.clone());
        let container = ctx.wrap(&delegate);
        let pointer = ctx.to_native(&container);

        let child_pointers: Vec<Address> = ctx.with_gil(|state| {
            let stub = pointer.to_stub();
            let items = state.memory().read_ptr(stub, SequenceStub::ITEMS);
            assert_eq!(state.memory().read_i64(stub, SequenceStub::SIZE), 2);
            (0..2).map(|i| state.memory().read_ptr_at(items, i)).collect()
        });
        for (child, &child_pointer) in children.iter().zip(&child_pointers) {
            let wrapper = ctx.wrap(child);
            assert_eq!(wrapper.native_pointer(), Some(child_pointer));
            assert_eq!(
                ctx.with_gil(|state| state.refcount(&wrapper)),
                MANAGED_REFCNT + 1
            );
        }
        assert_eq!(ctx.with_gil(|state| state.gc().count(0)), 2);

        drop(container);
        drop(delegate);
        // the container is gone, its referents are still held here
        assert_eq!(ctx.poll_reference_queue(), 1);
        ctx.with_gil(|state| {
            assert_eq!(state.escaped_count(), 2);
            assert_eq!(state.gc().count(0), 1);
        });

        drop(children);
        assert_eq!(ctx.poll_reference_queue(), 2);
        ctx.with_gil(|state| {
            assert_eq!(state.escaped_count(), 0);
            assert_eq!(state.gc().count(0), 0);
        });
    }

    #[test]
    fn rewrapping_keeps_native_identity() {
        let ctx = context();
        let delegate = Dummy::gc();
        let first = ctx.wrap(&delegate);
        let pointer = ctx.to_native(&first);
        drop(first);
        assert_eq!(ctx.poll_reference_queue(), 0);

        let again = ctx.wrap(&delegate);
        assert_eq!(ctx.to_native(&again), pointer);
        assert_eq!(ctx.counters().escaped, 1);
        ctx.with_gil(|state| {
            assert_eq!(state.escaped_count(), 1);
            assert_eq!(state.gc().count(0), 1);
        });

        drop(again);
        drop(delegate);
        assert_eq!(ctx.poll_reference_queue(), 1);
        assert_eq!(ctx.with_gil(|state| state.escaped_count()), 0);
    }

    #[test]
    fn del_unbinds_escaped_objects() {
        let ctx = context();
        let delegates = [Dummy::gc(), Dummy::gc(), Dummy::gc()];
        let wrappers: Vec<_> = delegates.iter().map(|d| ctx.wrap(d)).collect();
        let pointers: Vec<_> = wrappers.iter().map(|w| ctx.to_native(w)).collect();
        assert_eq!(ctx.with_gil(|state| state.gc().count(0)), 3);

        ctx.del(pointers[0]);
        ctx.del(pointers[2]);
        assert!(wrappers[0].is_freed());
        assert!(!wrappers[1].is_freed());
        ctx.with_gil(|state| {
            assert_eq!(state.escaped_count(), 1);
            assert_eq!(state.counters().deallocated, 2);
            let gc = state.gc();
            assert_eq!(gc.count(0), 1);
            assert_eq!(gc.validate_list(gc.generation0()), Ok(1));
        });

        drop(wrappers);
        drop(delegates);
        assert_eq!(ctx.poll_reference_queue(), 1);
        ctx.with_gil(|state| {
            assert_eq!(state.counters().deallocated, 3);
            assert_eq!(state.gc().count(0), 0);
        });
    }

    #[test]
    #[should_panic(expected = "freed by native code")]
    fn freed_objects_do_not_escape_again() {
        let ctx = context();
        let delegate = Dummy::gc();
        let wrapper = ctx.wrap(&delegate);
        let pointer = ctx.to_native(&wrapper);
        ctx.del(pointer);
        ctx.to_native(&ctx.wrap(&delegate));
    }

    #[test]
    fn reference_cycles_escape_once() {
        #[derive(Debug)]
        struct Node {
            next: parking_lot::Mutex<Option<Delegate>>,
        }
        impl crate::HostObject for Node {
            fn type_pointer(&self) -> Address {
                Address::new(0x8_0000)
            }
            fn type_flags(&self) -> TypeFlags {
                TypeFlags::HAVE_GC
            }
            fn referents(&self) -> Vec<Delegate> {
                self.next.lock().iter().cloned().collect()
            }
        }

        let a = Arc::new(Node {
            next: parking_lot::Mutex::new(None),
        });
        let b = Arc::new(Node {
            next: parking_lot::Mutex::new(Some(a.clone() as Delegate)),
        });
        *a.next.lock() = Some(b.clone() as Delegate);
        let (a_delegate, b_delegate): (Delegate, Delegate) = (a.clone(), b.clone());

        let ctx = context();
        let wrapper_a = ctx.wrap(&a_delegate);
        let pointer_a = ctx.to_native(&wrapper_a);
        let wrapper_b = ctx.wrap(&b_delegate);
        let pointer_b = wrapper_b.native_pointer().unwrap();
        assert_ne!(pointer_a, pointer_b);
        assert_eq!(ctx.to_native(&wrapper_b), pointer_b);
        ctx.with_gil(|state| {
            assert_eq!(state.escaped_count(), 2);
            assert_eq!(state.refcount(&wrapper_a), MANAGED_REFCNT + 1);
            assert_eq!(state.refcount(&wrapper_b), MANAGED_REFCNT + 1);
            let items = state
                .memory()
                .read_ptr(pointer_b.to_stub(), SequenceStub::ITEMS);
            assert_eq!(state.memory().read_ptr_at(items, 0), pointer_a);
            let gc = state.gc();
            assert_eq!(gc.validate_list(gc.generation0()), Ok(2));
        });
        a.next.lock().take();
    }

    #[test]
    fn native_objects_resolve_to_their_proxy() {
        let ctx = context();
        let proxy = Dummy::plain();
        let pointer = ctx.with_gil(|state| {
            let pointer = state.allocate_native_object(Address::new(0x9_0000));
            state.register_native_object(pointer, &proxy);
            assert_eq!(
                state.memory().read_i64(pointer, ObjectStub::REFCNT),
                1 + MANAGED_REFCNT
            );
            pointer
        });

        let Ok(Resolved::Native(resolved)) = ctx.resolve(pointer) else {
            panic!("registered native object must resolve");
        };
        assert!(Arc::ptr_eq(&resolved, &proxy));
        assert_eq!(
            ctx.resolve(Address::new(0x1234_5670)).unwrap_err(),
            BridgeError::UnknownPointer(Address::new(0x1234_5670))
        );
        assert_eq!(ctx.resolve(Address::NULL).unwrap_err(), BridgeError::NullPointer);

        drop(resolved);
        drop(proxy);
        ctx.with_gil(|state| {
            // native code still holds its own reference
            assert_eq!(state.poll_reference_queue(), 1);
            assert!(state.pending_deallocs().is_empty());
            assert_eq!(state.memory().read_i64(pointer, ObjectStub::REFCNT), 1);
            assert_eq!(state.native_reference_count(), 0);
        });
    }

    #[test]
    fn dead_native_objects_are_queued_for_bulk_deallocation() {
        let ctx = context();
        ctx.with_gil(|state| {
            let proxy = Dummy::plain();
            let pointer = state.allocate_native_object(Address::new(0x9_0000));
            state.register_native_object(pointer, &proxy);
            state.memory().write_i64(pointer, ObjectStub::REFCNT, MANAGED_REFCNT);
            drop(proxy);
            assert_eq!(state.poll_reference_queue(), 1);
            assert_eq!(state.pending_deallocs(), &[pointer]);
            assert_eq!(state.deallocate_pending(), 1);
            assert!(state.pending_deallocs().is_empty());
            assert_eq!(state.counters().native_released, 1);
        });
    }

    #[test]
    fn native_references_outlive_the_managed_object() {
        let ctx = context();
        let first = Dummy::gc();
        let first_wrapper = ctx.wrap(&first);
        let first_pointer = ctx.to_native(&first_wrapper);
        let stub = first_pointer.to_stub();
        // inline Py_INCREF in an extension, invisible to the bridge
        ctx.with_gil(|state| {
            state
                .memory()
                .write_i64(stub, ObjectStub::REFCNT, MANAGED_REFCNT + 1)
        });
        drop(first_wrapper);
        drop(first);

        assert_eq!(ctx.poll_reference_queue(), 1);
        ctx.with_gil(|state| {
            assert_eq!(state.escaped_count(), 0);
            assert_eq!(state.orphan_count(), 1);
            assert_eq!(state.memory().read_i32(stub, ObjectStub::HANDLE_TABLE_INDEX), -1);
            assert_eq!(state.memory().read_i64(stub, ObjectStub::REFCNT), 1);
        });
        assert_eq!(
            ctx.resolve(first_pointer).unwrap_err(),
            BridgeError::Collected(first_pointer)
        );

        let second = Dummy::plain();
        let second_wrapper = ctx.wrap(&second);
        let second_pointer = ctx.to_native(&second_wrapper);
        assert_ne!(first_pointer, second_pointer);
        ctx.with_gil(|state| {
            assert_eq!(state.adjust_native_refcount(first_pointer, 1), 2);
            assert_eq!(state.adjust_native_refcount(first_pointer, -1), 1);
            assert_eq!(state.refcount(&second_wrapper), MANAGED_REFCNT);
            assert_eq!(state.adjust_native_refcount(first_pointer, -1), 0);
            assert_eq!(state.orphan_count(), 0);
            assert_eq!(state.counters().deallocated, 1);
            assert_eq!(state.gc().count(0), 0);
        });
        assert!(matches!(ctx.resolve(second_pointer), Ok(Resolved::Wrapper(_))));
    }

    #[test]
    fn stale_handle_after_slot_reuse() {
        let ctx = context();
        let first = Dummy::plain();
        let first_wrapper = ctx.wrap(&first);
        let first_pointer = ctx.to_native(&first_wrapper);
        let index = ctx.with_gil(|state| {
            state
                .memory()
                .read_i32(first_pointer.to_stub(), ObjectStub::HANDLE_TABLE_INDEX)
        });

        let second = Dummy::plain();
        let second_wrapper = ctx.wrap(&second);
        let second_pointer = ctx.to_native(&second_wrapper);
        drop(first_wrapper);
        drop(first);
        assert_eq!(ctx.poll_reference_queue(), 1);

        let third = Dummy::plain();
        let third_wrapper = ctx.wrap(&third);
        let third_pointer = ctx.to_native(&third_wrapper);
        ctx.with_gil(|state| {
            let reused = state
                .memory()
                .read_i32(third_pointer.to_stub(), ObjectStub::HANDLE_TABLE_INDEX);
            assert_eq!(reused, index);
        });
        // a forged handle naming the reused slot does not reach the new object
        let forged = ctx.with_gil(|state| {
            let stub = state.memory().allocate(ObjectStub::LAYOUT);
            state.memory().write_i32(stub, ObjectStub::HANDLE_TABLE_INDEX, index);
            stub.to_handle()
        });
        assert_eq!(
            ctx.resolve(forged).unwrap_err(),
            BridgeError::StaleHandle(forged)
        );
        assert!(matches!(ctx.resolve(second_pointer), Ok(Resolved::Wrapper(_))));
    }

    #[test]
    fn disabled_reuse_keeps_ids_unique() {
        let ctx = sparse_context(ContextCreateInfo {
            reuse_handles: Some(false),
            escape_heap_chunk: Some(2),
            ..Default::default()
        });
        let mut seen = Vec::new();
        for _ in 0..5 {
            let delegate = Dummy::plain();
            let wrapper = ctx.wrap(&delegate);
            let pointer = ctx.to_native(&wrapper);
            let id = ctx.with_gil(|state| {
                state
                    .memory()
                    .read_i32(pointer.to_stub(), ObjectStub::HANDLE_TABLE_INDEX)
            });
            assert!(!seen.contains(&id));
            seen.push(id);
            drop(wrapper);
            drop(delegate);
            ctx.poll_reference_queue();
        }
    }

    #[test]
    fn thread_state_points_at_context_blocks() {
        let ctx = context();
        let thread = ctx.with_gil(|state| state.new_thread_state(Dummy::plain()));
        let pointer = thread.native_pointer().unwrap();
        assert!(!pointer.points_to_handle_space());
        assert!(thread.is_alive());
        assert_eq!(thread.owner().type_pointer(), Address::new(0x7_0000));
        ctx.with_gil(|state| {
            let gc_state = state.gc_state();
            let small_ints = state.small_ints();
            let mem = state.memory();
            assert_eq!(mem.read_ptr(pointer, ThreadStateStub::GC), gc_state);
            assert_eq!(mem.read_ptr(pointer, ThreadStateStub::SMALL_INTS), small_ints);
            assert_eq!(mem.read_ptr(pointer, ThreadStateStub::CUREXC_TYPE), Address::NULL);
            state.free_struct(&thread);
        });
        assert!(thread.is_freed());
        assert_eq!(ctx.counters().structs, 1);
    }

    #[test]
    fn closures_keep_their_target() {
        let ctx = context();
        let target = Dummy::plain();
        ctx.with_gil(|state| {
            let code = state.register_closure(target.clone());
            assert!(Arc::ptr_eq(&state.closure(code).unwrap().target, &target));
            assert!(state.release_closure(code));
            assert!(!state.release_closure(code));
            assert!(state.closure(code).is_none());
        });
    }

    #[test]
    fn works_on_process_memory() {
        let ctx = NativeContext::new(ContextCreateInfo::default()).unwrap();
        let delegate = Dummy::container(vec![Dummy::gc()]);
        let wrapper = ctx.wrap(&delegate);
        let pointer = ctx.to_native(&wrapper);
        assert!(matches!(ctx.resolve(pointer), Ok(Resolved::Wrapper(_))));
        drop(wrapper);
        drop(delegate);
        assert_eq!(ctx.poll_reference_queue(), 2);
        assert_eq!(ctx.counters().deallocated, 2);
    }
}
