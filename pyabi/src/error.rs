use thiserror::Error;

use crate::Address;

/// Recoverable failures at the native boundary.
///
/// Broken invariants are not represented here; those panic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("invalid context configuration: {0}")]
    InvalidConfig(String),
    #[error("null pointer passed where an object was expected")]
    NullPointer,
    #[error("handle {0:?} does not belong to any escaped object")]
    UnknownHandle(Address),
    #[error("handle {0:?} refers to a freed escape heap slot")]
    StaleHandle(Address),
    #[error("managed object behind {0:?} was already collected")]
    Collected(Address),
    #[error("native address {0:?} is not known to any reference table")]
    UnknownPointer(Address),
    #[error(
        "corrupt gc list at {node:?}: gc_prev is {found_prev:?}, expected {expected_prev:?}"
    )]
    CorruptGcList {
        node: Address,
        expected_prev: Address,
        found_prev: Address,
    },
    #[error("gc list node {0:?} has the collecting flag set")]
    CollectingFlagSet(Address),
    #[error("gc list node {0:?} is linked but has a null gc_next")]
    NullGcLink(Address),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
