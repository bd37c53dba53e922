//! Native identity of managed objects.
//!
//! A wrapper starts managed-only, gets a native pointer the first time native code needs to see
//! the object and ends up freed once both sides let go:
//!
//! ```text
//! Managed ──to_native──► Native ──release/free──► Freed
//! ```
//!
//! Wrappers only observe their managed object. The context keeps each wrapper alive for as long
//! as its object lives, and a strong escape heap entry keeps the object itself alive.
use std::{
    fmt,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicI64, AtomicU8, Ordering},
    },
};

use bitflags::bitflags;

use crate::{Address, StructLayout, layout::TypeFlags};

/// Floor of the refcount while the managed side holds an object
pub const MANAGED_REFCNT: i64 = 10;
/// Refcount of objects that are never collected
pub const IMMORTAL_REFCNT: i64 = 0xFFFF_FFFF;
/// Native pointer of a wrapper that has not escaped yet
pub const UNINITIALIZED: i64 = -1;

/// Values that share one native address per value
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Interned {
    None,
    False,
    True,
    SmallInt(i64),
}

/// What the bridge needs to know about a managed object
pub trait HostObject: fmt::Debug + Send + Sync {
    /// Address of the native type object
    fn type_pointer(&self) -> Address;

    fn type_flags(&self) -> TypeFlags;

    /// Objects native code can reach through this one, escaped along with it
    fn referents(&self) -> Vec<Delegate> {
        Vec::new()
    }

    fn interned(&self) -> Option<Interned> {
        None
    }
}

pub type Delegate = Arc<dyn HostObject>;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct WrapperFlags: u8 {
        const ESCAPING = 1 << 0;
        const ESCAPED = 1 << 1;
        const FREED = 1 << 2;
    }
}

#[derive(Debug)]
pub struct WrapperBase {
    delegate: OnceLock<Weak<dyn HostObject>>,
    native_pointer: AtomicI64,
    flags: AtomicU8,
}

impl Default for WrapperBase {
    fn default() -> Self {
        Self::new()
    }
}

impl WrapperBase {
    pub fn new() -> Self {
        Self {
            delegate: OnceLock::new(),
            native_pointer: AtomicI64::new(UNINITIALIZED),
            flags: AtomicU8::new(0),
        }
    }

    pub fn with_delegate(delegate: &Delegate) -> Self {
        let base = Self::new();
        base.set_delegate(delegate);
        base
    }

    /// The managed object, `None` once it died
    pub fn delegate(&self) -> Option<Delegate> {
        self.delegate.get().and_then(Weak::upgrade)
    }

    pub fn is_alive(&self) -> bool {
        self.delegate
            .get()
            .is_some_and(|delegate| delegate.strong_count() > 0)
    }

    /// Set once; setting again must pass the same object.
    pub fn set_delegate(&self, delegate: &Delegate) {
        if self.delegate.set(Arc::downgrade(delegate)).is_err() {
            let current = self.delegate.get();
            assert!(
                current.is_some_and(|current| {
                    std::ptr::addr_eq(current.as_ptr(), Arc::as_ptr(delegate))
                }),
                "wrapper delegate cannot be replaced"
            );
        }
    }

    pub fn native_pointer(&self) -> Option<Address> {
        match self.native_pointer.load(Ordering::Acquire) {
            UNINITIALIZED => None,
            raw => Some(Address::new(raw.cast_unsigned())),
        }
    }

    pub fn is_native(&self) -> bool {
        self.native_pointer().is_some()
    }

    /// Assign the native pointer. Re-assigning the same value is a no-op.
    pub fn set_native_pointer(&self, pointer: Address) {
        let raw = pointer.as_i64();
        assert_ne!(raw, UNINITIALIZED, "cannot assign the uninitialized sentinel");
        if let Err(current) = self.native_pointer.compare_exchange(
            UNINITIALIZED,
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            assert_eq!(
                current, raw,
                "native pointer already set to {current:#x}, refusing {raw:#x}"
            );
        }
    }

    pub fn flags(&self) -> WrapperFlags {
        WrapperFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn add_flags(&self, flags: WrapperFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove_flags(&self, flags: WrapperFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

pub trait NativeWrapper {
    fn base(&self) -> &WrapperBase;

    fn native_pointer(&self) -> Option<Address> {
        self.base().native_pointer()
    }

    fn is_native(&self) -> bool {
        self.base().is_native()
    }

    fn is_freed(&self) -> bool {
        self.base().flags().contains(WrapperFlags::FREED)
    }

    fn is_alive(&self) -> bool {
        self.base().is_alive()
    }
}

/// Reference counted wrapper of a managed object
#[derive(Debug)]
pub struct ObjectWrapper {
    base: WrapperBase,
    /// Refcount while the object has no stub
    managed_refcnt: AtomicI64,
    /// Tagged pointer handed out while referents are still escaping
    pending: AtomicI64,
    /// immortals keep their object for the lifetime of the context
    pinned: Option<Delegate>,
}

impl ObjectWrapper {
    pub fn new(delegate: &Delegate) -> Self {
        Self {
            base: WrapperBase::with_delegate(delegate),
            managed_refcnt: AtomicI64::new(MANAGED_REFCNT),
            pending: AtomicI64::new(UNINITIALIZED),
            pinned: None,
        }
    }

    pub fn immortal(delegate: Delegate) -> Self {
        let mut wrapper = Self::new(&delegate);
        wrapper.managed_refcnt = AtomicI64::new(IMMORTAL_REFCNT);
        wrapper.pinned = Some(delegate);
        wrapper
    }

    /// The managed object, `None` once it died
    pub fn delegate(&self) -> Option<Delegate> {
        self.base.delegate()
    }

    pub fn managed_refcnt(&self) -> i64 {
        self.managed_refcnt.load(Ordering::Acquire)
    }

    pub fn is_immortal(&self) -> bool {
        self.managed_refcnt() == IMMORTAL_REFCNT
    }

    /// Adjust the refcount kept before escaping. Immortal counts never move.
    pub fn adjust_managed_refcnt(&self, delta: i64) -> i64 {
        if self.is_immortal() {
            return IMMORTAL_REFCNT;
        }
        let new = self.managed_refcnt.fetch_add(delta, Ordering::AcqRel) + delta;
        assert!(
            new >= MANAGED_REFCNT,
            "managed refcount dropped below the managed floor: {new}"
        );
        new
    }

    pub fn is_escaping(&self) -> bool {
        self.base.flags().contains(WrapperFlags::ESCAPING)
    }

    pub fn pending_pointer(&self) -> Option<Address> {
        match self.pending.load(Ordering::Acquire) {
            UNINITIALIZED => None,
            raw => Some(Address::new(raw.cast_unsigned())),
        }
    }

    pub fn begin_escape(&self, tagged: Address) {
        assert!(!self.is_native(), "object already escaped");
        self.pending.store(tagged.as_i64(), Ordering::Release);
        self.base.add_flags(WrapperFlags::ESCAPING);
    }

    pub fn finish_escape(&self, tagged: Address) {
        self.base.set_native_pointer(tagged);
        self.base.remove_flags(WrapperFlags::ESCAPING);
        self.base.add_flags(WrapperFlags::ESCAPED);
        self.pending.store(UNINITIALIZED, Ordering::Release);
    }

    pub fn mark_freed(&self) {
        self.base.add_flags(WrapperFlags::FREED);
    }
}

impl NativeWrapper for ObjectWrapper {
    fn base(&self) -> &WrapperBase {
        &self.base
    }
}

/// Wrapper replacing a managed object by a raw native struct, no refcounting.
/// Owns its object until the struct is freed.
#[derive(Debug)]
pub struct StructWrapper {
    base: WrapperBase,
    owner: Delegate,
    layout: StructLayout,
}

impl StructWrapper {
    pub fn new(delegate: Delegate, layout: StructLayout) -> Self {
        Self {
            base: WrapperBase::with_delegate(&delegate),
            owner: delegate,
            layout,
        }
    }

    pub fn owner(&self) -> &Delegate {
        &self.owner
    }

    pub fn layout(&self) -> StructLayout {
        self.layout
    }

    pub fn mark_freed(&self) {
        self.base.add_flags(WrapperFlags::FREED);
    }
}

impl NativeWrapper for StructWrapper {
    fn base(&self) -> &WrapperBase {
        &self.base
    }
}
