//! HaloSieveError: unified error type for halo-sieve public APIs.
//!
//! Every fallible operation in the library reports through this enum so
//! callers can match on one type. Collective operations that can fail
//! partially (decomposition, ghost creation) agree on the outcome across
//! ranks before returning, so an `Err` on one rank implies the same `Err`
//! on every rank.

use crate::data::column::AttributeSet;
use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for halo-sieve operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HaloSieveError {
    /// Arena or scratch allocation failed. A partially allocated store is
    /// unsafe to use, so nothing is kept on this path.
    #[error("allocation of {bytes} bytes for `{name}` failed")]
    Allocation { name: String, bytes: usize },

    /// An append or decomposition target would exceed the store's fixed
    /// capacity. Never silently truncated; the caller must pre-size with
    /// sufficient margin.
    #[error("store `{name}` capacity exceeded: need {needed} rows, np_upper = {np_upper}")]
    CapacityExceeded {
        name: String,
        needed: usize,
        np_upper: usize,
    },

    /// An operation requested attributes the store does not carry.
    /// Programmer error; reported immediately, never retried.
    #[error("attribute mismatch: requested {requested:?} but store carries {present:?}")]
    AttributeMismatch {
        requested: AttributeSet,
        present: AttributeSet,
    },

    /// The compiled column registry disagrees with the fixed external
    /// enumeration. Fatal at startup, before any particle data is touched.
    #[error("column registry ordering mismatch at slot {slot}: `{name}` carries bit {bit}")]
    OrderingMismatch {
        slot: usize,
        name: &'static str,
        bit: u32,
    },

    /// A single-attribute lookup did not find the column in the store.
    #[error("column {0:?} not found in store")]
    ColumnNotFound(AttributeSet),

    /// Cross-store operation between stores with incompatible shapes.
    #[error("store mismatch: {0}")]
    StoreMismatch(&'static str),

    /// An index array passed to `permute` was not a permutation of `0..np`.
    #[error("index array is not a permutation of 0..{np}")]
    InvalidPermutation { np: usize },

    /// A ghost zone was used after the store it was built against changed.
    #[error("ghost zone is stale: store generation {store}, zone generation {zone}")]
    GhostStale { store: u64, zone: u64 },
}
