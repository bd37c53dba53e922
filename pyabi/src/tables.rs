//! Reverse lookup from native pointers to the managed side.
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use log::trace;

use crate::{
    Address, DirectMappedCache, SlotId,
    slots::{Chunked, Doubling, SlotTable},
    wrapper::{Delegate, HostObject, NativeWrapper, ObjectWrapper},
};

/// What the stub of an escaped object looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubShape {
    /// allocated behind a gc head
    pub gc: bool,
    /// number of native visible referents, `None` for plain objects
    pub items: Option<usize>,
}

/// Escape heap entry: an object wrapper whose stub native code may hold.
///
/// Strong while native code owns references beyond the managed floor, weak otherwise. A strong
/// entry keeps the managed object alive, a weak one only watches it.
#[derive(Debug)]
pub struct EscapedReference {
    pub wrapper: Arc<ObjectWrapper>,
    pub strong: Option<Delegate>,
    /// tagged pointer native code sees
    pub pointer: Address,
    pub shape: StubShape,
}

impl EscapedReference {
    pub fn new(wrapper: &Arc<ObjectWrapper>, pointer: Address, shape: StubShape) -> Self {
        Self {
            wrapper: wrapper.clone(),
            strong: None,
            pointer,
            shape,
        }
    }

    pub fn is_strong(&self) -> bool {
        self.strong.is_some()
    }

    /// The wrapper, `None` once the managed object died
    pub fn upgrade(&self) -> Option<Arc<ObjectWrapper>> {
        self.wrapper.is_alive().then(|| self.wrapper.clone())
    }

    /// Switch between keeping the managed object alive and only observing it.
    /// Returns false if the object is already gone.
    pub fn set_strong(&mut self, strong: bool) -> bool {
        match (strong, self.strong.is_some()) {
            (true, false) => match self.wrapper.delegate() {
                Some(delegate) => {
                    self.strong = Some(delegate);
                    trace!("escape entry {:?} is strong", self.pointer);
                }
                None => return false,
            },
            (false, true) => {
                self.strong = None;
                trace!("escape entry {:?} is weak", self.pointer);
            }
            _ => {}
        }
        true
    }

    pub fn is_collected(&self) -> bool {
        self.strong.is_none() && !self.wrapper.is_alive()
    }
}

pub type EscapeHeap = SlotTable<EscapedReference, Chunked>;

pub fn escape_heap(chunk: usize) -> EscapeHeap {
    SlotTable::new("escape heap", Chunked { chunk })
}

/// An object allocated by native code, mirrored by a managed proxy
#[derive(Debug)]
pub struct NativeObjectReference {
    /// real native address
    pub pointer: Address,
    pub proxy: Weak<dyn HostObject>,
}

impl NativeObjectReference {
    pub fn new(pointer: Address, proxy: &Arc<dyn HostObject>) -> Self {
        Self {
            pointer,
            proxy: Arc::downgrade(proxy),
        }
    }

    pub fn is_collected(&self) -> bool {
        self.proxy.strong_count() == 0
    }
}

/// Native object references by id, plus the address index native pointers are resolved with
#[derive(Debug)]
pub struct ReferenceStack {
    table: SlotTable<NativeObjectReference, Doubling>,
    by_address: HashMap<Address, SlotId, ahash::RandomState>,
}

impl ReferenceStack {
    pub fn new(initial: usize) -> Self {
        Self {
            table: SlotTable::new("reference stack", Doubling { initial }),
            by_address: HashMap::default(),
        }
    }

    pub fn set_reuse(&mut self, reuse: bool) {
        self.table.set_reuse(reuse);
    }

    pub fn push(&mut self, reference: NativeObjectReference) -> SlotId {
        let pointer = reference.pointer;
        assert!(
            !self.by_address.contains_key(&pointer),
            "native object {pointer:?} is already referenced"
        );
        let id = self.table.set(reference);
        self.by_address.insert(pointer, id);
        id
    }

    pub fn get(&self, id: SlotId) -> Option<&NativeObjectReference> {
        self.table.get(id)
    }

    pub fn lookup(&self, pointer: Address) -> Option<SlotId> {
        self.by_address.get(&pointer).copied()
    }

    /// `id` is still bound to `pointer`
    pub fn binds(&self, id: SlotId, pointer: Address) -> bool {
        self.get(id).is_some_and(|reference| reference.pointer == pointer)
    }

    pub fn remove(&mut self, id: SlotId) -> Option<NativeObjectReference> {
        let reference = self.table.remove(id)?;
        self.by_address.remove(&reference.pointer);
        Some(reference)
    }

    pub fn ids(&self) -> Vec<SlotId> {
        self.table.ids()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }
}

/// Handle space pointer to the wrapper that escaped with it
pub type HandleCache = DirectMappedCache<Weak<ObjectWrapper>>;
/// Real native address to its reference stack id
pub type ReferenceCache = DirectMappedCache<SlotId>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::tests::Dummy;

    #[test]
    fn escape_entry_switches_strength() {
        let delegate = Dummy::plain();
        let wrapper = Arc::new(ObjectWrapper::new(&delegate));
        let pointer = Address::new(0x1000).to_handle();
        let shape = StubShape {
            gc: false,
            items: None,
        };
        let mut heap = escape_heap(4);
        let id = heap.set(EscapedReference::new(&wrapper, pointer, shape));

        let entry = heap.get_mut(id).unwrap();
        assert!(!entry.is_strong());
        assert!(entry.set_strong(true));
        assert!(entry.is_strong());

        drop(delegate);
        let entry = heap.get_mut(id).unwrap();
        assert!(!entry.is_collected());
        assert!(Arc::ptr_eq(&entry.upgrade().unwrap(), &wrapper));

        assert!(entry.set_strong(false));
        assert!(entry.is_collected());
        assert!(entry.upgrade().is_none());
        assert!(!entry.set_strong(true));
    }

    #[test]
    fn reference_stack_indexes_by_address() {
        let proxy = Dummy::plain();
        let mut stack = ReferenceStack::new(2);
        let a = stack.push(NativeObjectReference::new(Address::new(0x5000), &proxy));
        let b = stack.push(NativeObjectReference::new(Address::new(0x6000), &proxy));
        let c = stack.push(NativeObjectReference::new(Address::new(0x7000), &proxy));
        assert_eq!(stack.capacity(), 4);
        assert_eq!(stack.lookup(Address::new(0x6000)), Some(b));
        assert!(stack.binds(c, Address::new(0x7000)));
        assert!(!stack.binds(c, Address::new(0x5000)));

        let removed = stack.remove(a).unwrap();
        assert_eq!(removed.pointer, Address::new(0x5000));
        assert_eq!(stack.lookup(Address::new(0x5000)), None);
        assert_eq!(stack.len(), 2);

        drop(proxy);
        assert!(stack.get(b).unwrap().is_collected());
    }

    #[test]
    #[should_panic(expected = "already referenced")]
    fn reference_stack_rejects_duplicates() {
        let proxy = Dummy::plain();
        let mut stack = ReferenceStack::new(2);
        stack.push(NativeObjectReference::new(Address::new(0x5000), &proxy));
        stack.push(NativeObjectReference::new(Address::new(0x5000), &proxy));
    }
}
