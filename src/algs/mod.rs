//! Re-export public algorithms.

pub mod communicator;
pub mod decompose;
pub mod fof;
pub mod ghosts;
pub mod kdtree;
pub mod union_find;

pub use decompose::decompose;
pub use fof::{FofConfig, FofFinder, LinkingLength};
pub use ghosts::GhostZone;
pub use kdtree::KdTree;
pub use union_find::UnionFind;
