//! Data module: column registry, particle store and wire packing.

pub mod column;
pub mod packing;
pub mod store;

pub use column::{AttributeSet, ColumnInfo, ElementKind, IntType, RealType, NCOLUMNS, REGISTRY};
pub use packing::PackingPlan;
pub use store::{MemoryLocation, ParticleStore, Species, StoreMeta};
