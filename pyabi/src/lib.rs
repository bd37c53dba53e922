mod cache;
mod context;
mod error;
mod gc;
mod layout;
mod memory;
mod slots;
mod tables;
mod tagged;
mod wrapper;

pub use cache::{CacheStats, DirectMappedCache};
pub use context::{
    AllocationCounters, Closure, ContextCreateInfo, ContextSettings, ContextState, Memory,
    NativeContext, Resolved,
};
pub use error::{BridgeError, BridgeResult};
pub use gc::{DEFAULT_THRESHOLDS, GcSupport, as_gc, compose_with_preserved_flags, from_gc, mask_flags};
pub use layout::{
    GcGeneration, GcHead, GcPrevFlags, GcState, NUM_GENERATIONS, ObjectStub, PREV_SHIFT,
    SequenceStub, ThreadStateStub, TypeFlags,
};
pub use memory::{FieldAccess, Field, RawMemory, StructLayout, Width};
pub use slots::{Chunked, Doubling, GrowthPolicy, SlotId, SlotTable};
pub use tables::{
    EscapeHeap, EscapedReference, HandleCache, NativeObjectReference, ReferenceCache,
    ReferenceStack, StubShape,
};
pub use tagged::*;
pub use wrapper::{
    Delegate, HostObject, IMMORTAL_REFCNT, Interned, MANAGED_REFCNT, NativeWrapper,
    ObjectWrapper, StructWrapper, UNINITIALIZED, WrapperBase, WrapperFlags,
};
