//! Address: any raw 64 bit value native code may hold as a `PyObject *`
//!
//! Handle space: every value with the top bit set. A managed object that escaped to native gets a
//! real stub block; native code only ever sees the stub address with the top bit set, so the
//! runtime can tell "this is one of ours" from a single bit test.
//!
//! Handle table indices use the same top bit but are shifted left by [`HANDLE_SHIFT`], because some
//! libraries (notably cffi) tag the low bits of the pointers they are handed.
use std::fmt;

pub const HANDLE_BASE: u64 = 0x8000_0000_0000_0000;
pub const HANDLE_SHIFT: u32 = 3;

/// A native address or a handle-space pointer
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(u64);

impl Address {
    pub const NULL: Address = Address(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_i64(self) -> i64 {
        self.0.cast_signed()
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    #[inline]
    pub const fn sub(self, bytes: usize) -> Self {
        Self(self.0 - bytes as u64)
    }

    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    pub const fn points_to_handle_space(self) -> bool {
        points_to_handle_space(self)
    }

    #[inline]
    pub const fn to_stub(self) -> Address {
        pointer_to_stub(self)
    }

    #[inline]
    pub const fn to_handle(self) -> Address {
        stub_to_pointer(self)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Address> for u64 {
    fn from(value: Address) -> Self {
        value.0
    }
}

#[inline]
pub const fn points_to_handle_space(pointer: Address) -> bool {
    pointer.0 & HANDLE_BASE != 0
}

/// Address of the native block backing `pointer`.
/// Identity for real addresses.
#[inline]
pub const fn pointer_to_stub(pointer: Address) -> Address {
    Address(pointer.0 & !HANDLE_BASE)
}

/// Tag a stub address so native code hands it back as a handle-space pointer
#[inline]
pub const fn stub_to_pointer(stub: Address) -> Address {
    assert!(
        stub.0 & HANDLE_BASE == 0,
        "stub address already points to handle space"
    );
    Address(stub.0 | HANDLE_BASE)
}

#[inline]
pub const fn handle_index_to_pointer(index: u32) -> Address {
    Address(((index as u64) << HANDLE_SHIFT) | HANDLE_BASE)
}

#[inline]
pub const fn pointer_to_handle_index(pointer: Address) -> u32 {
    ((pointer.0 & !HANDLE_BASE) >> HANDLE_SHIFT) as u32
}
