#![cfg_attr(docsrs, feature(doc_cfg))]
//! # halo-sieve
//!
//! halo-sieve is a Rust library for particle data management and
//! friends-of-friends (FOF) halo identification in distributed N-body
//! simulations. It provides a columnar particle store with a fixed
//! attribute registry, wire packing for rank-to-rank exchange, spatial
//! domain decomposition with ghost zones, and a distributed FOF pipeline
//! that produces halo catalogs without ever gathering particles onto one
//! rank.
//!
//! ## Features
//! - Bit-tagged columnar [`ParticleStore`](data::store::ParticleStore)
//!   with typed accessors and registry-ordered wire packing
//! - Pluggable communication backends (serial, in-process multi-rank,
//!   MPI) behind one [`Communicator`](algs::communicator::Communicator)
//!   trait
//! - Periodic slab decomposition, particle exchange and ghost zones with
//!   restrict/fuse reductions back to owner ranks
//! - A periodic kd-tree pair finder and an iterative cross-rank group
//!   merge that converges on global halo membership
//!
//! ## Determinism
//!
//! Halo membership derives from the smallest member particle id through
//! representative selection, so which particles form which halo does not
//! depend on rank count or traversal order; each rank's catalog slice is
//! deterministically ordered. Randomized tests fix `SmallRng` seeds.
//!
//! ## Usage
//! Add `halo-sieve` as a dependency in your `Cargo.toml` and enable
//! features as needed:
//!
//! ```toml
//! [dependencies]
//! halo-sieve = "0.3.0"
//! # Optional features:
//! # features = ["mpi-support","rayon"]
//! ```

pub mod algs;
pub mod data;
pub mod domain;
pub mod halo_error;

pub use halo_error::HaloSieveError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::Communicator;
    pub use crate::algs::communicator::{LocalComm, NoComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::decompose::decompose;
    pub use crate::algs::fof::{FofConfig, FofFinder, FofScratch, LinkingLength};
    pub use crate::algs::ghosts::GhostZone;
    pub use crate::algs::kdtree::KdTree;
    pub use crate::algs::union_find::UnionFind;
    pub use crate::data::column::{AttributeSet, ElementKind, REGISTRY};
    pub use crate::data::packing::PackingPlan;
    pub use crate::data::store::{MemoryLocation, ParticleStore, Species, StoreMeta};
    pub use crate::domain::SpatialDomain;
    pub use crate::halo_error::HaloSieveError;
}
