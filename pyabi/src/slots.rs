//! Free-list backed tables handing out small integer ids.
//!
//! An id is the index of its slot and stays valid until it is removed, growth never moves ids.
//! Free ids are kept on a LIFO list; a growth step pushes the new range in reverse so the lowest
//! new id is handed out first.
use std::fmt;

use log::trace;

#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    /// Largest id, ids must fit the `i32` `handle_table_index` field of a stub
    pub const MAX: u32 = i32::MAX as u32;

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub trait GrowthPolicy: fmt::Debug {
    /// Capacity after one growth step, must be larger than `capacity`
    fn grow(&self, capacity: usize) -> usize;
}

/// Grows by a fixed number of slots
#[derive(Debug, Clone, Copy)]
pub struct Chunked {
    pub chunk: usize,
}

impl GrowthPolicy for Chunked {
    fn grow(&self, capacity: usize) -> usize {
        capacity + self.chunk
    }
}

/// Starts at `initial` and doubles
#[derive(Debug, Clone, Copy)]
pub struct Doubling {
    pub initial: usize,
}

impl GrowthPolicy for Doubling {
    fn grow(&self, capacity: usize) -> usize {
        self.initial.max(capacity * 2)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Free,
    Reserved,
    Occupied(T),
}

#[derive(Debug)]
pub struct SlotTable<T, G: GrowthPolicy> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    policy: G,
    len: usize,
    reuse: bool,
}

impl<T, G: GrowthPolicy> SlotTable<T, G> {
    pub fn new(name: &'static str, policy: G) -> Self {
        Self {
            name,
            slots: Vec::new(),
            free: Vec::new(),
            policy,
            len: 0,
            reuse: true,
        }
    }

    /// With reuse disabled a removed id is never handed out again.
    pub fn set_reuse(&mut self, reuse: bool) {
        self.reuse = reuse;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn grow(&mut self) {
        let old = self.slots.len();
        let new = self.policy.grow(old);
        assert!(new > old, "{} growth policy did not grow", self.name);
        assert!(
            new - 1 <= SlotId::MAX as usize,
            "{} exhausted its id space",
            self.name
        );
        self.slots.resize_with(new, || Slot::Free);
        self.free.extend((old as u32..new as u32).rev());
        trace!("{} grew from {old} to {new} slots", self.name);
    }

    /// Take a free id without binding a record yet
    pub fn reserve(&mut self) -> SlotId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.grow();
                match self.free.pop() {
                    Some(index) => index,
                    None => unreachable!("growth always frees at least one slot"),
                }
            }
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(matches!(slot, Slot::Free));
        *slot = Slot::Reserved;
        SlotId(index)
    }

    /// Bind `value` to an id obtained from [`Self::reserve`]
    pub fn commit(&mut self, id: SlotId, value: T) {
        let slot = &mut self.slots[id.index()];
        assert!(
            matches!(slot, Slot::Reserved),
            "{} slot {id:?} was not reserved",
            self.name
        );
        *slot = Slot::Occupied(value);
        self.len += 1;
        trace!("{} commit {id:?}", self.name);
    }

    pub fn set(&mut self, value: T) -> SlotId {
        let id = self.reserve();
        self.commit(id, value);
        id
    }

    /// Free `id`. Returns the bound record, `None` for a reservation or an already free slot.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        let taken = match std::mem::replace(slot, Slot::Free) {
            Slot::Free => return None,
            Slot::Reserved => None,
            Slot::Occupied(value) => {
                self.len -= 1;
                Some(value)
            }
        };
        if self.reuse {
            self.free.push(id.0);
        }
        trace!("{} remove {id:?}", self.name);
        taken
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        match self.slots.get(id.index()) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied(value) => Some((SlotId(index as u32), value)),
                _ => None,
            })
    }

    /// Ids of live records, for callers that need to mutate while walking
    pub fn ids(&self) -> Vec<SlotId> {
        self.iter().map(|(id, _)| id).collect()
    }
}
