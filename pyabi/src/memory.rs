use std::{
    alloc::{self, Layout},
    collections::HashMap,
    fmt,
};

use crate::Address;

/// Width of a native field in bytes
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Width {
    I8 = 1,
    I16 = 2,
    I32 = 4,
    I64 = 8,
}

impl Width {
    pub const POINTER: Width = Width::I64;

    #[inline]
    pub const fn bytes(self) -> usize {
        self as usize
    }
}

/// Offset + width of one field inside a native struct
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub width: Width,
}

impl Field {
    pub const fn new(offset: usize, width: Width) -> Self {
        Self { offset, width }
    }

    pub const fn pointer(offset: usize) -> Self {
        Self::new(offset, Width::POINTER)
    }
}

/// Size and alignment of a native struct
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: &'static str,
    pub size: usize,
    pub align: usize,
}

impl StructLayout {
    pub const fn of<T>(name: &'static str) -> Self {
        Self {
            name,
            size: size_of::<T>(),
            align: align_of::<T>(),
        }
    }

    /// Array of `len` pointer sized slots
    pub const fn pointer_array(len: usize) -> Self {
        Self {
            name: "pointer[]",
            size: len * Width::POINTER.bytes(),
            align: align_of::<u64>(),
        }
    }

    /// `prefix` placed directly in front of `self` in one allocation.
    /// Returns the combined layout and the offset of `self` within it.
    pub const fn with_prefix(self, prefix: StructLayout) -> (Self, usize) {
        let align = if prefix.align > self.align {
            prefix.align
        } else {
            self.align
        };
        let offset = prefix.size.next_multiple_of(self.align);
        let layout = Self {
            name: self.name,
            size: offset + self.size,
            align,
        };
        (layout, offset)
    }

    fn std_layout(self) -> Layout {
        // zero sized allocations would hand out dangling addresses
        let size = self.size.max(1);
        match Layout::from_size_align(size, self.align) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid native layout for {}", self.name),
        }
    }
}

/// Offset based access to native structs.
///
/// Every component reads and writes native memory exclusively through this trait; nothing computes
/// offsets on its own. Implementors only provide the raw primitives.
pub trait FieldAccess {
    fn read_raw(&self, address: Address, width: Width) -> u64;

    fn write_raw(&mut self, address: Address, width: Width, value: u64);

    /// Allocate a zeroed block. Allocation failure is fatal.
    fn allocate(&mut self, layout: StructLayout) -> Address;

    fn free(&mut self, address: Address);

    #[inline]
    fn element_ptr(&self, base: Address, field: Field) -> Address {
        base.add(field.offset)
    }

    #[inline]
    fn read_i8(&self, base: Address, field: Field) -> i8 {
        debug_assert_eq!(field.width, Width::I8);
        self.read_raw(base.add(field.offset), Width::I8) as u8 as i8
    }

    #[inline]
    fn read_i16(&self, base: Address, field: Field) -> i16 {
        debug_assert_eq!(field.width, Width::I16);
        self.read_raw(base.add(field.offset), Width::I16) as u16 as i16
    }

    #[inline]
    fn read_i32(&self, base: Address, field: Field) -> i32 {
        debug_assert_eq!(field.width, Width::I32);
        self.read_raw(base.add(field.offset), Width::I32) as u32 as i32
    }

    #[inline]
    fn read_i64(&self, base: Address, field: Field) -> i64 {
        debug_assert_eq!(field.width, Width::I64);
        self.read_raw(base.add(field.offset), Width::I64).cast_signed()
    }

    #[inline]
    fn read_ptr(&self, base: Address, field: Field) -> Address {
        debug_assert_eq!(field.width, Width::POINTER);
        Address::new(self.read_raw(base.add(field.offset), Width::POINTER))
    }

    #[inline]
    fn write_i8(&mut self, base: Address, field: Field, value: i8) {
        debug_assert_eq!(field.width, Width::I8);
        self.write_raw(base.add(field.offset), Width::I8, value as u8 as u64);
    }

    #[inline]
    fn write_i16(&mut self, base: Address, field: Field, value: i16) {
        debug_assert_eq!(field.width, Width::I16);
        self.write_raw(base.add(field.offset), Width::I16, value as u16 as u64);
    }

    #[inline]
    fn write_i32(&mut self, base: Address, field: Field, value: i32) {
        debug_assert_eq!(field.width, Width::I32);
        self.write_raw(base.add(field.offset), Width::I32, value as u32 as u64);
    }

    #[inline]
    fn write_i64(&mut self, base: Address, field: Field, value: i64) {
        debug_assert_eq!(field.width, Width::I64);
        self.write_raw(base.add(field.offset), Width::I64, value.cast_unsigned());
    }

    #[inline]
    fn write_ptr(&mut self, base: Address, field: Field, value: Address) {
        debug_assert_eq!(field.width, Width::POINTER);
        self.write_raw(base.add(field.offset), Width::POINTER, value.raw());
    }

    /// Read slot `index` of a pointer array
    #[inline]
    fn read_ptr_at(&self, array: Address, index: usize) -> Address {
        self.read_ptr(array, Field::pointer(index * Width::POINTER.bytes()))
    }

    #[inline]
    fn write_ptr_at(&mut self, array: Address, index: usize, value: Address) {
        self.write_ptr(array, Field::pointer(index * Width::POINTER.bytes()), value);
    }
}

/// Process memory through the global allocator.
///
/// Keeps the layout of every live block so `free` only needs the address, which is all native
/// code ever hands back.
pub struct RawMemory {
    live: HashMap<u64, Layout, ahash::RandomState>,
    bytes_in_use: usize,
}

impl RawMemory {
    pub fn new() -> Self {
        Self {
            live: HashMap::default(),
            bytes_in_use: 0,
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    pub fn owns(&self, address: Address) -> bool {
        self.live.contains_key(&address.raw())
    }
}

impl Default for RawMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMemory")
            .field("live_blocks", &self.live.len())
            .field("bytes_in_use", &self.bytes_in_use)
            .finish()
    }
}

impl FieldAccess for RawMemory {
    fn read_raw(&self, address: Address, width: Width) -> u64 {
        assert!(!address.is_null(), "read through null pointer");
        assert!(
            !address.points_to_handle_space(),
            "read through handle space pointer {address:?}"
        );
        let ptr = address.as_mut_ptr::<u8>();
        // SAFETY: callers only pass addresses inside blocks handed out by this allocator or by
        // native code that owns them
        unsafe {
            match width {
                Width::I8 => ptr.read() as u64,
                Width::I16 => ptr.cast::<u16>().read_unaligned() as u64,
                Width::I32 => ptr.cast::<u32>().read_unaligned() as u64,
                Width::I64 => ptr.cast::<u64>().read_unaligned(),
            }
        }
    }

    fn write_raw(&mut self, address: Address, width: Width, value: u64) {
        assert!(!address.is_null(), "write through null pointer");
        assert!(
            !address.points_to_handle_space(),
            "write through handle space pointer {address:?}"
        );
        let ptr = address.as_mut_ptr::<u8>();
        // SAFETY: see read_raw
        unsafe {
            match width {
                Width::I8 => ptr.write(value as u8),
                Width::I16 => ptr.cast::<u16>().write_unaligned(value as u16),
                Width::I32 => ptr.cast::<u32>().write_unaligned(value as u32),
                Width::I64 => ptr.cast::<u64>().write_unaligned(value),
            }
        }
    }

    fn allocate(&mut self, layout: StructLayout) -> Address {
        let std_layout = layout.std_layout();
        // SAFETY: layout has a non zero size
        let ptr = unsafe { alloc::alloc_zeroed(std_layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(std_layout);
        }
        let address = Address::from_ptr(ptr);
        self.live.insert(address.raw(), std_layout);
        self.bytes_in_use += std_layout.size();
        log::trace!("allocate {} ({} bytes) at {address:?}", layout.name, layout.size);
        address
    }

    fn free(&mut self, address: Address) {
        let Some(layout) = self.live.remove(&address.raw()) else {
            panic!("free of unknown or already freed block {address:?}");
        };
        self.bytes_in_use -= layout.size();
        log::trace!("free {address:?} ({} bytes)", layout.size());
        // SAFETY: allocated by us with exactly this layout
        unsafe { alloc::dealloc(address.as_mut_ptr(), layout) };
    }
}

impl Drop for RawMemory {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            log::debug!(
                "releasing {} native blocks ({} bytes) at teardown",
                self.live.len(),
                self.bytes_in_use
            );
        }
        for (address, layout) in self.live.drain() {
            // SAFETY: allocated by us with exactly this layout
            unsafe { alloc::dealloc(address as usize as *mut u8, layout) };
        }
    }
}

/// Sparse byte addressed memory with fixed, made up addresses.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct SparseMemory {
    bytes: HashMap<u64, u8>,
    live: HashMap<u64, usize>,
    pub freed: Vec<Address>,
    bump: u64,
}

#[cfg(test)]
impl SparseMemory {
    const HEAP_START: u64 = 0x10_0000;

    pub fn new() -> Self {
        Self {
            bump: Self::HEAP_START,
            ..Default::default()
        }
    }

    /// Declare `[address, address + size)` as a live block
    pub fn map(&mut self, address: Address, size: usize) {
        self.live.insert(address.raw(), size);
    }

    pub fn is_live(&self, address: Address) -> bool {
        self.live.contains_key(&address.raw())
    }
}

#[cfg(test)]
impl FieldAccess for SparseMemory {
    fn read_raw(&self, address: Address, width: Width) -> u64 {
        assert!(!address.points_to_handle_space(), "read through {address:?}");
        (0..width.bytes()).fold(0u64, |acc, i| {
            let byte = self.bytes.get(&(address.raw() + i as u64)).copied().unwrap_or(0);
            acc | (byte as u64) << (8 * i)
        })
    }

    fn write_raw(&mut self, address: Address, width: Width, value: u64) {
        assert!(!address.points_to_handle_space(), "write through {address:?}");
        for i in 0..width.bytes() {
            self.bytes.insert(address.raw() + i as u64, (value >> (8 * i)) as u8);
        }
    }

    fn allocate(&mut self, layout: StructLayout) -> Address {
        let start = self.bump.next_multiple_of(layout.align.max(16) as u64);
        self.bump = start + layout.size.max(1) as u64;
        self.map(Address::new(start), layout.size);
        Address::new(start)
    }

    fn free(&mut self, address: Address) {
        let Some(size) = self.live.remove(&address.raw()) else {
            panic!("free of unknown or already freed block {address:?}");
        };
        for i in 0..size as u64 {
            self.bytes.remove(&(address.raw() + i));
        }
        self.freed.push(address);
    }
}
