//! ParticleStore: structure-of-arrays storage for particle attributes.
//!
//! A store holds `np` dense rows (`np <= np_upper`, fixed at creation) for
//! the attributes named in its [`AttributeSet`]. Each enabled column owns one
//! 8-byte-aligned, type-erased buffer; typed views are obtained through a
//! `bytemuck`-backed accessor layer, so only the attributes a stage actually
//! needs are ever allocated.
//!
//! # Invariants
//! - A column buffer is present iff its attribute bit is set.
//! - `np <= np_upper` always; growth beyond capacity is an error, never a
//!   silent reallocation.
//! - All enabled columns are row-aligned: row `i` of every column refers to
//!   the same particle. Reordering operations ([`sort_by`](ParticleStore::sort_by),
//!   [`permute`](ParticleStore::permute)) apply one logical permutation to
//!   all columns; a partially reordered store is never observable.

use crate::data::column::{self, AttributeSet, ColumnInfo, NCOLUMNS, REGISTRY};
use crate::data::packing::PackingPlan;
use crate::halo_error::HaloSieveError;
use bytemuck::Pod;
use log::debug;

/// Allocation pool hint. `Scratch` marks short-lived stores (halo catalogs,
/// exchange staging); both pools currently draw from the process heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemoryLocation {
    Heap,
    Scratch,
}

/// Particle species a store may carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Species {
    Baryon,
    Cdm,
    Ncdm,
}

impl Species {
    pub const fn name(self) -> &'static str {
        match self {
            Species::Baryon => "baryon",
            Species::Cdm => "cdm",
            Species::Ncdm => "ncdm",
        }
    }
}

/// Store-level metadata carried alongside the columns.
///
/// `a_x` / `a_v` are the scale factors of the position and velocity epochs;
/// `m0` is the base particle mass. The `q_*` lattice fields recover the
/// initial grid coordinate of a particle from its id:
/// `q[d] = (id / q_strides[d] % ...) * q_scale[d] + q_shift[d]` with strides
/// in row-major descending order.
#[derive(Copy, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StoreMeta {
    pub a_x: f64,
    pub a_v: f64,
    /// Base mass in 1e10 M_sun / h.
    pub m0: f64,
    pub q_shift: [f64; 3],
    pub q_scale: [f64; 3],
    pub q_strides: [i64; 3],
    pub q_size: i64,
}

impl Default for StoreMeta {
    fn default() -> Self {
        StoreMeta {
            a_x: 1.0,
            a_v: 1.0,
            m0: 0.0,
            q_shift: [0.0; 3],
            q_scale: [1.0; 3],
            q_strides: [1, 1, 1],
            q_size: 0,
        }
    }
}

/// One column's backing buffer: 8-byte aligned so every registry element
/// type can be viewed in place.
#[derive(Clone, Debug)]
struct ColumnBuf {
    words: Vec<u64>,
    bytes: usize,
}

impl ColumnBuf {
    fn alloc(owner: &str, bytes: usize) -> Result<ColumnBuf, HaloSieveError> {
        let words = bytes.div_ceil(8);
        let mut v: Vec<u64> = Vec::new();
        v.try_reserve_exact(words)
            .map_err(|_| HaloSieveError::Allocation {
                name: owner.to_string(),
                bytes,
            })?;
        v.resize(words, 0);
        Ok(ColumnBuf { words: v, bytes })
    }

    #[inline]
    fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.bytes]
    }

    #[inline]
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.bytes]
    }
}

/// Columnar particle container. See the module docs for invariants.
#[derive(Clone, Debug)]
pub struct ParticleStore {
    name: String,
    attrs: AttributeSet,
    columns: Vec<Option<ColumnBuf>>,
    np: usize,
    np_upper: usize,
    location: MemoryLocation,
    /// Bumped whenever row count or row order changes; ghost zones use it
    /// to detect staleness.
    generation: u64,
    pub species: Species,
    pub meta: StoreMeta,
}

impl ParticleStore {
    /// Allocate a store for up to `np_upper` rows of the given attributes.
    ///
    /// Verifies the column registry first; a build whose compiled ordering
    /// disagrees with the fixed enumeration refuses to construct any store.
    /// Fails with [`HaloSieveError::Allocation`] if any column buffer cannot
    /// be obtained; nothing is retained on that path.
    pub fn new(
        name: &str,
        np_upper: usize,
        attrs: AttributeSet,
        location: MemoryLocation,
    ) -> Result<Self, HaloSieveError> {
        column::verify_registry()?;
        let mut columns: Vec<Option<ColumnBuf>> = (0..NCOLUMNS).map(|_| None).collect();
        let mut total = 0usize;
        for ci in attrs.slots() {
            let bytes = REGISTRY[ci].elem_size() * np_upper;
            columns[ci] = Some(ColumnBuf::alloc(name, bytes)?);
            total += bytes;
        }
        debug!(
            "store `{}`: allocated {} bytes for {} columns, np_upper = {}",
            name,
            total,
            attrs.slots().count(),
            np_upper
        );
        Ok(ParticleStore {
            name: name.to_string(),
            attrs,
            columns,
            np: 0,
            np_upper,
            location,
            generation: 0,
            species: Species::Cdm,
            meta: StoreMeta::default(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn attributes(&self) -> AttributeSet {
        self.attrs
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.np
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.np == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.np_upper
    }

    #[inline]
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Set the logical row count. New rows expose whatever bytes the buffers
    /// hold (zero right after construction).
    pub fn set_len(&mut self, np: usize) -> Result<(), HaloSieveError> {
        if np > self.np_upper {
            return Err(HaloSieveError::CapacityExceeded {
                name: self.name.clone(),
                needed: np,
                np_upper: self.np_upper,
            });
        }
        self.np = np;
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    /// Drop all rows; capacity and column buffers are retained.
    pub fn clear(&mut self) {
        self.np = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Registry slot of a single-bit attribute, or `ColumnNotFound`.
    pub fn find_column(&self, tag: AttributeSet) -> Result<usize, HaloSieveError> {
        match tag.slot() {
            Some(ci) if self.attrs.contains(tag) => Ok(ci),
            _ => Err(HaloSieveError::ColumnNotFound(tag)),
        }
    }

    /// Descriptors of the enabled columns, in registry order.
    pub fn enabled_columns(&self) -> impl Iterator<Item = (usize, &'static ColumnInfo)> + '_ {
        self.attrs.slots().map(|ci| (ci, &REGISTRY[ci]))
    }

    fn buf(&self, ci: usize) -> Result<&ColumnBuf, HaloSieveError> {
        self.columns[ci]
            .as_ref()
            .ok_or(HaloSieveError::ColumnNotFound(AttributeSet(1 << ci)))
    }

    fn buf_mut(&mut self, ci: usize) -> Result<&mut ColumnBuf, HaloSieveError> {
        self.columns[ci]
            .as_mut()
            .ok_or(HaloSieveError::ColumnNotFound(AttributeSet(1 << ci)))
    }

    /// Bytes of column `ci` covering the live rows.
    pub fn col_bytes(&self, ci: usize) -> Result<&[u8], HaloSieveError> {
        let n = REGISTRY[ci].elem_size() * self.np;
        Ok(&self.buf(ci)?.as_bytes()[..n])
    }

    /// Bytes of one row's element in column `ci`.
    #[inline]
    pub fn row_bytes(&self, ci: usize, i: usize) -> Result<&[u8], HaloSieveError> {
        let w = REGISTRY[ci].elem_size();
        Ok(&self.buf(ci)?.as_bytes()[i * w..(i + 1) * w])
    }

    #[inline]
    pub fn row_bytes_mut(&mut self, ci: usize, i: usize) -> Result<&mut [u8], HaloSieveError> {
        let w = REGISTRY[ci].elem_size();
        Ok(&mut self.buf_mut(ci)?.as_bytes_mut()[i * w..(i + 1) * w])
    }

    /// Typed view of an enabled column, one `T` per live row.
    ///
    /// `T` must tile the column element exactly (e.g. `[f64; 3]` for
    /// positions, `u64` for ids); this is checked in debug builds.
    pub fn column<T: Pod>(&self, tag: AttributeSet) -> Result<&[T], HaloSieveError> {
        let ci = self.find_column(tag)?;
        debug_assert_eq!(std::mem::size_of::<T>(), REGISTRY[ci].elem_size());
        Ok(bytemuck::cast_slice(self.col_bytes(ci)?))
    }

    /// Mutable typed view of an enabled column.
    pub fn column_mut<T: Pod>(&mut self, tag: AttributeSet) -> Result<&mut [T], HaloSieveError> {
        let ci = self.find_column(tag)?;
        debug_assert_eq!(std::mem::size_of::<T>(), REGISTRY[ci].elem_size());
        let n = REGISTRY[ci].elem_size() * self.np;
        Ok(bytemuck::cast_slice_mut(
            &mut self.buf_mut(ci)?.as_bytes_mut()[..n],
        ))
    }

    // Typed helpers for the columns the core pipeline touches.

    pub fn position(&self) -> Result<&[[f64; 3]], HaloSieveError> {
        self.column(AttributeSet::POS)
    }

    pub fn position_mut(&mut self) -> Result<&mut [[f64; 3]], HaloSieveError> {
        self.column_mut(AttributeSet::POS)
    }

    pub fn velocity(&self) -> Result<&[[f32; 3]], HaloSieveError> {
        self.column(AttributeSet::VEL)
    }

    pub fn velocity_mut(&mut self) -> Result<&mut [[f32; 3]], HaloSieveError> {
        self.column_mut(AttributeSet::VEL)
    }

    pub fn id(&self) -> Result<&[u64], HaloSieveError> {
        self.column(AttributeSet::ID)
    }

    pub fn id_mut(&mut self) -> Result<&mut [u64], HaloSieveError> {
        self.column_mut(AttributeSet::ID)
    }

    pub fn aemit(&self) -> Result<&[f32], HaloSieveError> {
        self.column(AttributeSet::AEMIT)
    }

    pub fn aemit_mut(&mut self) -> Result<&mut [f32], HaloSieveError> {
        self.column_mut(AttributeSet::AEMIT)
    }

    pub fn halo_length(&self) -> Result<&[i32], HaloSieveError> {
        self.column(AttributeSet::LENGTH)
    }

    pub fn halo_length_mut(&mut self) -> Result<&mut [i32], HaloSieveError> {
        self.column_mut(AttributeSet::LENGTH)
    }

    /// Per-row mass: the `mass` column if present, else the base mass `m0`.
    pub fn mass_of(&self, i: usize) -> f64 {
        match self.column::<f32>(AttributeSet::MASS) {
            Ok(m) => m[i] as f64,
            Err(_) => self.meta.m0,
        }
    }

    /// Serialize exactly `subset` of row `i` into a fresh record.
    pub fn pack(&self, i: usize, subset: AttributeSet) -> Result<Vec<u8>, HaloSieveError> {
        let plan = PackingPlan::new(self, subset)?;
        let mut out = vec![0u8; plan.record_size()];
        plan.pack(self, i, &mut out)?;
        Ok(out)
    }

    /// Deserialize exactly `subset` of row `i` from `record`.
    pub fn unpack(
        &mut self,
        i: usize,
        record: &[u8],
        subset: AttributeSet,
    ) -> Result<(), HaloSieveError> {
        let plan = PackingPlan::new(self, subset)?;
        plan.unpack(self, i, record)
    }

    /// Reorder all enabled columns by one logical permutation: after the
    /// call, row `i` holds what row `ind[i]` held before.
    ///
    /// The permutation is validated up front and each column is gathered
    /// out-of-place, so a partially reordered store is never observable.
    pub fn permute(&mut self, ind: &[u32]) -> Result<(), HaloSieveError> {
        if ind.len() != self.np {
            return Err(HaloSieveError::InvalidPermutation { np: self.np });
        }
        let mut seen = vec![false; self.np];
        for &k in ind {
            let k = k as usize;
            if k >= self.np || seen[k] {
                return Err(HaloSieveError::InvalidPermutation { np: self.np });
            }
            seen[k] = true;
        }
        for ci in self.attrs.slots().collect::<Vec<_>>() {
            let w = REGISTRY[ci].elem_size();
            let mut gathered = ColumnBuf::alloc(&self.name, w * self.np_upper)?;
            {
                let src = self.buf(ci)?.as_bytes();
                let dst = gathered.as_bytes_mut();
                gather_rows(src, dst, ind, w);
                // rows beyond np keep their (unobservable) old bytes zeroed
            }
            self.columns[ci] = Some(gathered);
        }
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    /// Sort rows by a caller-supplied comparator over row indices.
    pub fn sort_by<F>(&mut self, mut cmp: F) -> Result<(), HaloSieveError>
    where
        F: FnMut(usize, usize, &ParticleStore) -> std::cmp::Ordering,
    {
        debug_assert!(self.np <= u32::MAX as usize);
        let mut idx: Vec<u32> = (0..self.np as u32).collect();
        idx.sort_by(|&a, &b| cmp(a as usize, b as usize, self));
        self.permute(&idx)
    }

    /// Sort rows ascending by particle id.
    pub fn sort_by_id(&mut self) -> Result<(), HaloSieveError> {
        self.find_column(AttributeSet::ID)?;
        let ids = self.id()?.to_vec();
        self.sort_by(|a, b, _| ids[a].cmp(&ids[b]))
    }

    /// Wrap positions into `[0, box_size)` per dimension.
    pub fn wrap_periodic(&mut self, box_size: [f64; 3]) -> Result<(), HaloSieveError> {
        for x in self.position_mut()? {
            for d in 0..3 {
                x[d] = x[d].rem_euclid(box_size[d]);
            }
        }
        Ok(())
    }

    /// Copy the rows and metadata into `out` (attributes both stores carry).
    pub fn copy_into(&self, out: &mut ParticleStore) -> Result<(), HaloSieveError> {
        if out.np_upper < self.np {
            return Err(HaloSieveError::CapacityExceeded {
                name: out.name.clone(),
                needed: self.np,
                np_upper: out.np_upper,
            });
        }
        out.set_len(self.np)?;
        out.meta = self.meta;
        out.species = self.species;
        let shared = self.attrs & out.attrs;
        for ci in shared.slots() {
            let n = REGISTRY[ci].elem_size() * self.np;
            out.buf_mut(ci)?.as_bytes_mut()[..n].copy_from_slice(&self.buf(ci)?.as_bytes()[..n]);
        }
        Ok(())
    }

    /// Transfer ownership of the `attrs` column buffers to `out`, clearing
    /// them here. The transfer is atomic with nulling the source columns,
    /// so no aliasing window exists.
    pub fn steal(
        &mut self,
        out: &mut ParticleStore,
        attrs: AttributeSet,
    ) -> Result<(), HaloSieveError> {
        if !self.attrs.contains(attrs) {
            return Err(HaloSieveError::AttributeMismatch {
                requested: attrs,
                present: self.attrs,
            });
        }
        if out.np_upper != self.np_upper {
            return Err(HaloSieveError::StoreMismatch(
                "steal requires equal capacities",
            ));
        }
        for ci in attrs.slots() {
            out.columns[ci] = self.columns[ci].take();
            out.attrs |= AttributeSet(1 << ci);
            self.attrs = self.attrs - AttributeSet(1 << ci);
        }
        Ok(())
    }

    /// Copy a single row `i` into row `j` of `out`, for every attribute
    /// `out` carries (all of which must be present here).
    pub fn take_row(
        &self,
        i: usize,
        out: &mut ParticleStore,
        j: usize,
    ) -> Result<(), HaloSieveError> {
        if !self.attrs.contains(out.attrs) {
            return Err(HaloSieveError::AttributeMismatch {
                requested: out.attrs,
                present: self.attrs,
            });
        }
        for ci in out.attrs.slots() {
            let w = REGISTRY[ci].elem_size();
            out.buf_mut(ci)?.as_bytes_mut()[j * w..(j + 1) * w]
                .copy_from_slice(&self.buf(ci)?.as_bytes()[i * w..(i + 1) * w]);
        }
        Ok(())
    }

    /// Append all rows of `self` to `out`. Fails with `CapacityExceeded`
    /// before any row is copied if `out` cannot hold the concatenation.
    pub fn append_to(&self, out: &mut ParticleStore) -> Result<(), HaloSieveError> {
        if !self.attrs.contains(out.attrs) {
            return Err(HaloSieveError::AttributeMismatch {
                requested: out.attrs,
                present: self.attrs,
            });
        }
        let needed = out.np + self.np;
        if needed > out.np_upper {
            return Err(HaloSieveError::CapacityExceeded {
                name: out.name.clone(),
                needed,
                np_upper: out.np_upper,
            });
        }
        let base = out.np;
        for ci in out.attrs.slots() {
            let w = REGISTRY[ci].elem_size();
            out.buf_mut(ci)?.as_bytes_mut()[base * w..(base + self.np) * w]
                .copy_from_slice(&self.buf(ci)?.as_bytes()[..self.np * w]);
        }
        out.set_len(needed)
    }

    /// Copy row `src` over row `dst` within this store, all enabled columns.
    pub(crate) fn copy_row_within(&mut self, src: usize, dst: usize) -> Result<(), HaloSieveError> {
        if src == dst {
            return Ok(());
        }
        for ci in self.attrs.slots().collect::<Vec<_>>() {
            let w = REGISTRY[ci].elem_size();
            let bytes = self.buf_mut(ci)?.as_bytes_mut();
            bytes.copy_within(src * w..(src + 1) * w, dst * w);
        }
        Ok(())
    }

    /// Initial lattice index of the particle with this id.
    pub fn iq_from_id(&self, id: u64) -> [i64; 3] {
        let mut rem = id as i64;
        let mut iq = [0i64; 3];
        for d in 0..3 {
            let s = self.meta.q_strides[d].max(1);
            iq[d] = rem / s;
            rem %= s;
        }
        iq
    }

    /// Initial lattice (Lagrangian) coordinate of the particle with this id.
    pub fn q_from_id(&self, id: u64) -> [f64; 3] {
        let iq = self.iq_from_id(id);
        let mut q = [0.0f64; 3];
        for d in 0..3 {
            q[d] = iq[d] as f64 * self.meta.q_scale[d] + self.meta.q_shift[d];
        }
        q
    }

    /// Global row count across all ranks (blocking all-reduce).
    pub fn total_len<C: crate::algs::communicator::Communicator>(&self, comm: &C) -> u64 {
        comm.all_reduce_sum_u64(self.np as u64)
    }
}

/// `dst` row `i` gets `src` row `ind[i]`, rows being `w` bytes wide.
#[cfg(feature = "rayon")]
fn gather_rows(src: &[u8], dst: &mut [u8], ind: &[u32], w: usize) {
    use rayon::prelude::*;
    dst[..ind.len() * w]
        .par_chunks_exact_mut(w)
        .enumerate()
        .for_each(|(i, row)| {
            let k = ind[i] as usize;
            row.copy_from_slice(&src[k * w..(k + 1) * w]);
        });
}

/// `dst` row `i` gets `src` row `ind[i]`, rows being `w` bytes wide.
#[cfg(not(feature = "rayon"))]
fn gather_rows(src: &[u8], dst: &mut [u8], ind: &[u32], w: usize) {
    for (i, &k) in ind.iter().enumerate() {
        let k = k as usize;
        dst[i * w..(i + 1) * w].copy_from_slice(&src[k * w..(k + 1) * w]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store() -> ParticleStore {
        let attrs = AttributeSet::POS | AttributeSet::VEL | AttributeSet::ID;
        let mut s = ParticleStore::new("test", 16, attrs, MemoryLocation::Heap).unwrap();
        s.set_len(4).unwrap();
        for i in 0..4 {
            s.position_mut().unwrap()[i] = [i as f64, 2.0 * i as f64, 0.5];
            s.velocity_mut().unwrap()[i] = [0.0, 1.0, i as f32];
            s.id_mut().unwrap()[i] = 100 - i as u64;
        }
        s
    }

    #[test]
    fn columns_present_iff_enabled() {
        let s = small_store();
        assert!(s.position().is_ok());
        assert!(matches!(
            s.aemit().unwrap_err(),
            HaloSieveError::ColumnNotFound(_)
        ));
        assert_eq!(s.find_column(AttributeSet::ID).unwrap(), 7);
    }

    #[test]
    fn set_len_respects_capacity() {
        let mut s = small_store();
        assert!(s.set_len(16).is_ok());
        assert!(matches!(
            s.set_len(17).unwrap_err(),
            HaloSieveError::CapacityExceeded { .. }
        ));
    }

    #[test]
    fn pack_unpack_roundtrip_subset() {
        let mut s = small_store();
        let subset = AttributeSet::POS | AttributeSet::ID;
        let rec = s.pack(2, subset).unwrap();
        // clobber row 2, then restore from the record
        s.position_mut().unwrap()[2] = [9.0; 3];
        s.id_mut().unwrap()[2] = 0;
        s.unpack(2, &rec, subset).unwrap();
        assert_eq!(s.position().unwrap()[2], [2.0, 4.0, 0.5]);
        assert_eq!(s.id().unwrap()[2], 98);
        // velocity was not part of the subset and is untouched
        assert_eq!(s.velocity().unwrap()[2], [0.0, 1.0, 2.0]);
    }

    #[test]
    fn pack_missing_attribute_is_error() {
        let s = small_store();
        assert!(matches!(
            s.pack(0, AttributeSet::AEMIT).unwrap_err(),
            HaloSieveError::AttributeMismatch { .. }
        ));
    }

    #[test]
    fn permute_then_inverse_restores() {
        let mut s = small_store();
        let orig_x = s.position().unwrap().to_vec();
        let orig_id = s.id().unwrap().to_vec();
        let perm = [2u32, 0, 3, 1];
        // inverse[perm[i]] = i
        let mut inv = [0u32; 4];
        for (i, &k) in perm.iter().enumerate() {
            inv[k as usize] = i as u32;
        }
        s.permute(&perm).unwrap();
        assert_eq!(s.id().unwrap(), &[98, 100, 97, 99]);
        s.permute(&inv).unwrap();
        assert_eq!(s.position().unwrap(), &orig_x[..]);
        assert_eq!(s.id().unwrap(), &orig_id[..]);
    }

    #[test]
    fn permute_rejects_non_permutation() {
        let mut s = small_store();
        assert!(matches!(
            s.permute(&[0, 0, 1, 2]).unwrap_err(),
            HaloSieveError::InvalidPermutation { .. }
        ));
        assert!(matches!(
            s.permute(&[0, 1, 2]).unwrap_err(),
            HaloSieveError::InvalidPermutation { .. }
        ));
    }

    #[test]
    fn sort_by_id_orders_all_columns_together() {
        let mut s = small_store();
        s.sort_by_id().unwrap();
        assert_eq!(s.id().unwrap(), &[97, 98, 99, 100]);
        // row that had id 97 carried position [3, 6, 0.5]
        assert_eq!(s.position().unwrap()[0], [3.0, 6.0, 0.5]);
        assert_eq!(s.velocity().unwrap()[0], [0.0, 1.0, 3.0]);
    }

    #[test]
    fn append_overflow_is_error() {
        let s = small_store();
        let mut out = ParticleStore::new("out", 6, s.attributes(), MemoryLocation::Heap).unwrap();
        s.append_to(&mut out).unwrap();
        assert_eq!(out.len(), 4);
        let err = s.append_to(&mut out).unwrap_err();
        assert!(matches!(err, HaloSieveError::CapacityExceeded { needed: 8, .. }));
        // failed append changed nothing
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn steal_nulls_source_columns() {
        let mut s = small_store();
        let mut out =
            ParticleStore::new("out", 16, AttributeSet::EMPTY, MemoryLocation::Scratch).unwrap();
        out.set_len(4).unwrap();
        s.steal(&mut out, AttributeSet::VEL).unwrap();
        assert!(s.velocity().is_err());
        assert!(!s.attributes().contains(AttributeSet::VEL));
        assert_eq!(out.velocity().unwrap()[3], [0.0, 1.0, 3.0]);
        assert!(s.position().is_ok());
    }

    #[test]
    fn take_row_copies_out_attrs() {
        let s = small_store();
        let mut out = ParticleStore::new(
            "row",
            2,
            AttributeSet::POS | AttributeSet::ID,
            MemoryLocation::Scratch,
        )
        .unwrap();
        out.set_len(1).unwrap();
        s.take_row(3, &mut out, 0).unwrap();
        assert_eq!(out.position().unwrap()[0], [3.0, 6.0, 0.5]);
        assert_eq!(out.id().unwrap()[0], 97);
    }

    #[test]
    fn wrap_periodic_wraps_into_box() {
        let mut s = small_store();
        s.position_mut().unwrap()[0] = [-0.25, 2.5, 1.0];
        s.wrap_periodic([2.0, 2.0, 2.0]).unwrap();
        let x = s.position().unwrap()[0];
        assert!((x[0] - 1.75).abs() < 1e-12);
        assert!((x[1] - 0.5).abs() < 1e-12);
        assert!(x[2] < 2.0 && x[2] >= 0.0);
    }

    #[test]
    fn q_from_id_recovers_lattice_site() {
        let mut s = small_store();
        s.meta.q_strides = [16, 4, 1];
        s.meta.q_scale = [0.25; 3];
        s.meta.q_shift = [0.125; 3];
        s.meta.q_size = 64;
        let id = (2 * 16 + 3 * 4 + 1) as u64;
        assert_eq!(s.iq_from_id(id), [2, 3, 1]);
        let q = s.q_from_id(id);
        assert_eq!(q, [2.0 * 0.25 + 0.125, 3.0 * 0.25 + 0.125, 0.25 + 0.125]);
    }
}
