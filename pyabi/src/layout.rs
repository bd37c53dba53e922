//! Native struct layouts shared with extension code.
//!
//! Everything here is `#[repr(C)]` and must stay binary compatible with the CPython headers
//! extensions are compiled against. The structs are never instantiated on the Rust side; they only
//! provide sizes and offsets for the [`Field`] descriptors that [`FieldAccess`] consumes.
//!
//! [`FieldAccess`]: crate::FieldAccess
use std::mem::offset_of;

use bitflags::bitflags;

use crate::{Field, StructLayout, Width};

/// `PyGC_Head`
///
/// ```text
/// word 0: gc_next  (0 = untracked)
/// word 1: gc_prev  [prev pointer:62][collecting:1][finalized:1]
/// ```
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GcHead {
    pub gc_next: u64,
    pub gc_prev: u64,
}

const _: () = assert!(size_of::<GcHead>() == 16);

impl GcHead {
    pub const NEXT: Field = Field::pointer(offset_of!(GcHead, gc_next));
    pub const PREV: Field = Field::pointer(offset_of!(GcHead, gc_prev));
    pub const SIZE: usize = size_of::<GcHead>();
    pub const LAYOUT: StructLayout = StructLayout::of::<GcHead>("PyGC_Head");
}

bitflags! {
    /// Low bits of `gc_prev`
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct GcPrevFlags: u64 {
        const FINALIZED = 1 << 0;
        const COLLECTING = 1 << 1;
    }
}

/// Bits of `gc_prev` that carry the previous pointer start here
pub const PREV_SHIFT: u32 = 2;
pub const PREV_MASK_FLAGS: u64 = (1 << PREV_SHIFT) - 1;

const _: () = assert!(GcPrevFlags::all().bits() == PREV_MASK_FLAGS);

/// `struct gc_generation`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GcGeneration {
    pub head: GcHead,
    pub threshold: i32,
    pub count: i32,
}

const _: () = assert!(size_of::<GcGeneration>() == 24);

impl GcGeneration {
    pub const HEAD: usize = offset_of!(GcGeneration, head);
    pub const THRESHOLD: Field = Field::new(offset_of!(GcGeneration, threshold), Width::I32);
    pub const COUNT: Field = Field::new(offset_of!(GcGeneration, count), Width::I32);
}

pub const NUM_GENERATIONS: usize = 3;

/// `struct _gc_runtime_state`, reduced to the parts extensions and the list protocol touch
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GcState {
    pub enabled: i32,
    pub debug: i32,
    pub generations: [GcGeneration; NUM_GENERATIONS],
    pub permanent_generation: GcGeneration,
    pub generation0: u64,
    pub collecting: i32,
}

impl GcState {
    pub const ENABLED: Field = Field::new(offset_of!(GcState, enabled), Width::I32);
    pub const DEBUG: Field = Field::new(offset_of!(GcState, debug), Width::I32);
    pub const GENERATION0: Field = Field::pointer(offset_of!(GcState, generation0));
    pub const COLLECTING: Field = Field::new(offset_of!(GcState, collecting), Width::I32);
    pub const LAYOUT: StructLayout = StructLayout::of::<GcState>("GCState");

    /// Offset of generation `index`; `NUM_GENERATIONS` addresses the permanent generation
    pub const fn generation(index: usize) -> usize {
        assert!(index <= NUM_GENERATIONS, "generation index out of range");
        if index == NUM_GENERATIONS {
            offset_of!(GcState, permanent_generation)
        } else {
            offset_of!(GcState, generations) + index * size_of::<GcGeneration>()
        }
    }
}

const _: () = assert!(GcState::generation(NUM_GENERATIONS) == offset_of!(GcState, permanent_generation));

/// Stub backing an escaped managed object
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjectStub {
    pub ob_refcnt: i64,
    pub ob_type: u64,
    pub handle_table_index: i32,
}

impl ObjectStub {
    pub const REFCNT: Field = Field::new(offset_of!(ObjectStub, ob_refcnt), Width::I64);
    pub const TYPE: Field = Field::pointer(offset_of!(ObjectStub, ob_type));
    pub const HANDLE_TABLE_INDEX: Field =
        Field::new(offset_of!(ObjectStub, handle_table_index), Width::I32);
    pub const LAYOUT: StructLayout = StructLayout::of::<ObjectStub>("GraalPyObject");
}

/// Stub for objects with referents visible to native code (`PyTupleObject`-like)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceStub {
    pub object: ObjectStub,
    pub ob_size: i64,
    pub ob_item: u64,
}

impl SequenceStub {
    pub const SIZE: Field = Field::new(offset_of!(SequenceStub, ob_size), Width::I64);
    pub const ITEMS: Field = Field::pointer(offset_of!(SequenceStub, ob_item));
    pub const LAYOUT: StructLayout = StructLayout::of::<SequenceStub>("GraalPyVarObject");
}

/// Reduced `PyThreadState`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadStateStub {
    pub curexc_type: u64,
    pub curexc_value: u64,
    pub curexc_traceback: u64,
    pub dict: u64,
    pub small_ints: u64,
    pub gc: u64,
}

impl ThreadStateStub {
    pub const CUREXC_TYPE: Field = Field::pointer(offset_of!(ThreadStateStub, curexc_type));
    pub const CUREXC_VALUE: Field = Field::pointer(offset_of!(ThreadStateStub, curexc_value));
    pub const CUREXC_TRACEBACK: Field =
        Field::pointer(offset_of!(ThreadStateStub, curexc_traceback));
    pub const DICT: Field = Field::pointer(offset_of!(ThreadStateStub, dict));
    pub const SMALL_INTS: Field = Field::pointer(offset_of!(ThreadStateStub, small_ints));
    pub const GC: Field = Field::pointer(offset_of!(ThreadStateStub, gc));
    pub const LAYOUT: StructLayout = StructLayout::of::<ThreadStateStub>("PyThreadState");
}

bitflags! {
    /// Subset of `tp_flags`
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TypeFlags: u64 {
        const HEAPTYPE = 1 << 9;
        const READY = 1 << 12;
        const HAVE_GC = 1 << 14;
    }
}
