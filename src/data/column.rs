//! Attribute registry: the fixed set of per-particle columns.
//!
//! Every column a [`ParticleStore`](crate::data::store::ParticleStore) can
//! carry is described here by a static [`ColumnInfo`]: a name, a single bit
//! in an [`AttributeSet`] bitmask, and an [`ElementKind`] giving the element
//! layout and its pack/unpack strategy.
//!
//! The bit-position enumeration is externally fixed (snapshot collaborators
//! and wire peers rely on it). Slot `i` of [`REGISTRY`] must carry tag bit
//! `1 << i`; [`verify_registry`] checks this once at startup and the library
//! refuses to construct any store if the compiled ordering disagrees.

use crate::halo_error::HaloSieveError;
use num_traits::ToPrimitive;
use once_cell::sync::Lazy;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub};

/// Bitmask of enabled attributes; one bit per registry slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct AttributeSet(pub u64);

impl AttributeSet {
    pub const EMPTY: AttributeSet = AttributeSet(0);

    pub const MASK: AttributeSet = AttributeSet(1 << 0);
    pub const POS: AttributeSet = AttributeSet(1 << 1);
    pub const Q: AttributeSet = AttributeSet(1 << 2);
    pub const VEL: AttributeSet = AttributeSet(1 << 3);
    pub const DX1: AttributeSet = AttributeSet(1 << 4);
    pub const DX2: AttributeSet = AttributeSet(1 << 5);
    pub const ACC: AttributeSet = AttributeSet(1 << 6);
    pub const ID: AttributeSet = AttributeSet(1 << 7);
    pub const AEMIT: AttributeSet = AttributeSet(1 << 8);
    pub const DENSITY: AttributeSet = AttributeSet(1 << 9);
    pub const POTENTIAL: AttributeSet = AttributeSet(1 << 10);
    pub const TIDAL: AttributeSet = AttributeSet(1 << 11);
    pub const MINID: AttributeSet = AttributeSet(1 << 12);
    pub const TASK: AttributeSet = AttributeSet(1 << 13);
    pub const LENGTH: AttributeSet = AttributeSet(1 << 14);
    pub const RDISP: AttributeSet = AttributeSet(1 << 15);
    pub const VDISP: AttributeSet = AttributeSet(1 << 16);
    pub const RVDISP: AttributeSet = AttributeSet(1 << 17);
    pub const MASS: AttributeSet = AttributeSet(1 << 18);

    /// True iff every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: AttributeSet) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: AttributeSet) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Registry slots whose bits are set, in registry (ascending-bit) order.
    pub fn slots(self) -> impl Iterator<Item = usize> {
        (0..NCOLUMNS).filter(move |&i| self.0 & (1u64 << i) != 0)
    }

    /// Slot index for a single-bit set, if it is one.
    #[inline]
    pub fn slot(self) -> Option<usize> {
        if self.0.count_ones() == 1 {
            Some(self.0.trailing_zeros() as usize)
        } else {
            None
        }
    }
}

impl BitOr for AttributeSet {
    type Output = AttributeSet;
    #[inline]
    fn bitor(self, rhs: AttributeSet) -> AttributeSet {
        AttributeSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for AttributeSet {
    #[inline]
    fn bitor_assign(&mut self, rhs: AttributeSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AttributeSet {
    type Output = AttributeSet;
    #[inline]
    fn bitand(self, rhs: AttributeSet) -> AttributeSet {
        AttributeSet(self.0 & rhs.0)
    }
}

impl Sub for AttributeSet {
    type Output = AttributeSet;
    /// Set difference: bits of `self` not in `rhs`.
    #[inline]
    fn sub(self, rhs: AttributeSet) -> AttributeSet {
        AttributeSet(self.0 & !rhs.0)
    }
}

impl std::fmt::Debug for AttributeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.slots().map(|i| REGISTRY[i].name).collect();
        write!(f, "AttributeSet[{}]", names.join("|"))
    }
}

/// Real element widths supported by the registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RealType {
    F32,
    F64,
}

impl RealType {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            RealType::F32 => 4,
            RealType::F64 => 8,
        }
    }
}

/// Integer element widths supported by the registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntType {
    U8,
    I32,
    U64,
}

impl IntType {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            IntType::U8 => 1,
            IntType::I32 => 4,
            IntType::U64 => 8,
        }
    }
}

/// Element layout and serialization strategy of one column.
///
/// A small closed set of per-kind strategies selected by attribute metadata:
/// scalar-real, vector-real, scalar-integer, vector-integer. Pack/unpack is
/// a raw element copy; [`read_f64`](Self::read_f64) /
/// [`write_f64`](Self::write_f64) convert individual members for reductions
/// such as the halo aggregator's running-sum mean.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElementKind {
    RealScalar(RealType),
    RealVector(RealType, usize),
    IntScalar(IntType),
    IntVector(IntType, usize),
}

impl ElementKind {
    /// Number of members in one element (1 for scalars).
    #[inline]
    pub const fn member_count(self) -> usize {
        match self {
            ElementKind::RealScalar(_) | ElementKind::IntScalar(_) => 1,
            ElementKind::RealVector(_, n) | ElementKind::IntVector(_, n) => n,
        }
    }

    /// Byte size of a single member.
    #[inline]
    pub const fn member_size(self) -> usize {
        match self {
            ElementKind::RealScalar(t) | ElementKind::RealVector(t, _) => t.size(),
            ElementKind::IntScalar(t) | ElementKind::IntVector(t, _) => t.size(),
        }
    }

    /// Byte size of one whole element (one row of the column).
    #[inline]
    pub const fn elem_size(self) -> usize {
        self.member_size() * self.member_count()
    }

    #[inline]
    pub const fn is_integer(self) -> bool {
        matches!(self, ElementKind::IntScalar(_) | ElementKind::IntVector(_, _))
    }

    /// Read member `memb` of the element stored in `elem` as an `f64`.
    ///
    /// `elem` must be exactly [`elem_size`](Self::elem_size) bytes.
    pub fn read_f64(self, elem: &[u8], memb: usize) -> f64 {
        debug_assert!(memb < self.member_count());
        let w = self.member_size();
        let b = &elem[memb * w..(memb + 1) * w];
        match self {
            ElementKind::RealScalar(RealType::F32) | ElementKind::RealVector(RealType::F32, _) => {
                bytemuck::pod_read_unaligned::<f32>(b) as f64
            }
            ElementKind::RealScalar(RealType::F64) | ElementKind::RealVector(RealType::F64, _) => {
                bytemuck::pod_read_unaligned::<f64>(b)
            }
            ElementKind::IntScalar(IntType::U8) | ElementKind::IntVector(IntType::U8, _) => {
                b[0].to_f64().unwrap_or(0.0)
            }
            ElementKind::IntScalar(IntType::I32) | ElementKind::IntVector(IntType::I32, _) => {
                bytemuck::pod_read_unaligned::<i32>(b).to_f64().unwrap_or(0.0)
            }
            ElementKind::IntScalar(IntType::U64) | ElementKind::IntVector(IntType::U64, _) => {
                bytemuck::pod_read_unaligned::<u64>(b).to_f64().unwrap_or(0.0)
            }
        }
    }

    /// Write `value` into member `memb` of the element stored in `elem`.
    ///
    /// Integer kinds round to nearest; reals narrow to the column width.
    pub fn write_f64(self, elem: &mut [u8], memb: usize, value: f64) {
        debug_assert!(memb < self.member_count());
        let w = self.member_size();
        let b = &mut elem[memb * w..(memb + 1) * w];
        match self {
            ElementKind::RealScalar(RealType::F32) | ElementKind::RealVector(RealType::F32, _) => {
                b.copy_from_slice(bytemuck::bytes_of(&(value as f32)));
            }
            ElementKind::RealScalar(RealType::F64) | ElementKind::RealVector(RealType::F64, _) => {
                b.copy_from_slice(bytemuck::bytes_of(&value));
            }
            ElementKind::IntScalar(IntType::U8) | ElementKind::IntVector(IntType::U8, _) => {
                b[0] = value.round() as u8;
            }
            ElementKind::IntScalar(IntType::I32) | ElementKind::IntVector(IntType::I32, _) => {
                b.copy_from_slice(bytemuck::bytes_of(&(value.round() as i32)));
            }
            ElementKind::IntScalar(IntType::U64) | ElementKind::IntVector(IntType::U64, _) => {
                b.copy_from_slice(bytemuck::bytes_of(&(value.round() as u64)));
            }
        }
    }
}

/// Static descriptor of one registry column.
#[derive(Copy, Clone, Debug)]
pub struct ColumnInfo {
    pub name: &'static str,
    pub tag: AttributeSet,
    pub kind: ElementKind,
}

impl ColumnInfo {
    #[inline]
    pub const fn elem_size(&self) -> usize {
        self.kind.elem_size()
    }
}

/// Number of registry slots.
pub const NCOLUMNS: usize = 19;

use ElementKind::{IntScalar, RealScalar, RealVector};
use IntType::{I32, U8, U64};
use RealType::{F32, F64};

/// The fixed column registry. Slot `i` carries tag bit `1 << i`.
pub const REGISTRY: [ColumnInfo; NCOLUMNS] = [
    ColumnInfo { name: "mask", tag: AttributeSet::MASK, kind: IntScalar(U8) },
    ColumnInfo { name: "x", tag: AttributeSet::POS, kind: RealVector(F64, 3) },
    ColumnInfo { name: "q", tag: AttributeSet::Q, kind: RealVector(F32, 3) },
    ColumnInfo { name: "v", tag: AttributeSet::VEL, kind: RealVector(F32, 3) },
    ColumnInfo { name: "dx1", tag: AttributeSet::DX1, kind: RealVector(F32, 3) },
    ColumnInfo { name: "dx2", tag: AttributeSet::DX2, kind: RealVector(F32, 3) },
    ColumnInfo { name: "acc", tag: AttributeSet::ACC, kind: RealVector(F32, 3) },
    ColumnInfo { name: "id", tag: AttributeSet::ID, kind: IntScalar(U64) },
    ColumnInfo { name: "aemit", tag: AttributeSet::AEMIT, kind: RealScalar(F32) },
    ColumnInfo { name: "rho", tag: AttributeSet::DENSITY, kind: RealScalar(F32) },
    ColumnInfo { name: "potential", tag: AttributeSet::POTENTIAL, kind: RealScalar(F32) },
    ColumnInfo { name: "tidal", tag: AttributeSet::TIDAL, kind: RealVector(F32, 6) },
    ColumnInfo { name: "minid", tag: AttributeSet::MINID, kind: IntScalar(U64) },
    ColumnInfo { name: "task", tag: AttributeSet::TASK, kind: IntScalar(I32) },
    ColumnInfo { name: "length", tag: AttributeSet::LENGTH, kind: IntScalar(I32) },
    ColumnInfo { name: "rdisp", tag: AttributeSet::RDISP, kind: RealVector(F32, 6) },
    ColumnInfo { name: "vdisp", tag: AttributeSet::VDISP, kind: RealVector(F32, 6) },
    ColumnInfo { name: "rvdisp", tag: AttributeSet::RVDISP, kind: RealVector(F32, 9) },
    ColumnInfo { name: "mass", tag: AttributeSet::MASS, kind: RealScalar(F32) },
];

static REGISTRY_CHECK: Lazy<Result<(), HaloSieveError>> = Lazy::new(|| {
    for (slot, info) in REGISTRY.iter().enumerate() {
        if info.tag.0 != 1u64 << slot {
            return Err(HaloSieveError::OrderingMismatch {
                slot,
                name: info.name,
                bit: info.tag.0.trailing_zeros(),
            });
        }
        if info.kind.member_count() == 0 {
            return Err(HaloSieveError::OrderingMismatch {
                slot,
                name: info.name,
                bit: slot as u32,
            });
        }
    }
    Ok(())
});

/// Check the compiled registry against the fixed external enumeration.
///
/// Runs once; called by every store constructor so a mismatched build fails
/// before any particle data is touched.
pub fn verify_registry() -> Result<(), HaloSieveError> {
    REGISTRY_CHECK.clone()
}
