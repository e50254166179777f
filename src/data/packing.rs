//! PackingPlan: reusable record layout for a chosen attribute subset.
//!
//! A plan is a read-only view over a [`ParticleStore`]: per-attribute byte
//! offsets laid out in registry order plus the total record size. Plans back
//! both ghost wire records and halo/snapshot export; offsets are stable for
//! the plan's lifetime, so one plan serializes any number of rows.

use crate::data::column::{AttributeSet, REGISTRY};
use crate::data::store::ParticleStore;
use crate::halo_error::HaloSieveError;
use static_assertions::const_assert_eq;

// The registry element layouts the wire relies on.
const_assert_eq!(std::mem::size_of::<[f64; 3]>(), 24);
const_assert_eq!(std::mem::size_of::<[f32; 3]>(), 12);
const_assert_eq!(std::mem::size_of::<u64>(), 8);
const_assert_eq!(std::mem::size_of::<i32>(), 4);

#[derive(Copy, Clone, Debug)]
struct PlanEntry {
    ci: usize,
    offset: usize,
    elem_size: usize,
}

/// Precomputed layout for serializing an attribute subset of a store.
#[derive(Clone, Debug)]
pub struct PackingPlan {
    attrs: AttributeSet,
    entries: Vec<PlanEntry>,
    record_size: usize,
}

impl PackingPlan {
    /// Lay out `subset` against `store`, in registry order.
    ///
    /// Requesting an attribute the store does not carry is a programmer
    /// error and fails with [`HaloSieveError::AttributeMismatch`].
    pub fn new(store: &ParticleStore, subset: AttributeSet) -> Result<Self, HaloSieveError> {
        if !store.attributes().contains(subset) {
            return Err(HaloSieveError::AttributeMismatch {
                requested: subset,
                present: store.attributes(),
            });
        }
        let mut entries = Vec::with_capacity(subset.slots().count());
        let mut offset = 0usize;
        for ci in subset.slots() {
            let elem_size = REGISTRY[ci].elem_size();
            entries.push(PlanEntry {
                ci,
                offset,
                elem_size,
            });
            offset += elem_size;
        }
        Ok(PackingPlan {
            attrs: subset,
            entries,
            record_size: offset,
        })
    }

    #[inline]
    pub fn attributes(&self) -> AttributeSet {
        self.attrs
    }

    /// Total bytes of one packed record.
    #[inline]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Byte offset of a single attribute within the record.
    pub fn offset_of(&self, tag: AttributeSet) -> Result<usize, HaloSieveError> {
        let ci = tag.slot().ok_or(HaloSieveError::ColumnNotFound(tag))?;
        self.entries
            .iter()
            .find(|e| e.ci == ci)
            .map(|e| e.offset)
            .ok_or(HaloSieveError::ColumnNotFound(tag))
    }

    /// Serialize row `i` into `record` (exactly `record_size` bytes).
    pub fn pack(
        &self,
        store: &ParticleStore,
        i: usize,
        record: &mut [u8],
    ) -> Result<(), HaloSieveError> {
        debug_assert_eq!(record.len(), self.record_size);
        for e in &self.entries {
            record[e.offset..e.offset + e.elem_size].copy_from_slice(store.row_bytes(e.ci, i)?);
        }
        Ok(())
    }

    /// Deserialize every planned attribute of row `i` from `record`.
    pub fn unpack(
        &self,
        store: &mut ParticleStore,
        i: usize,
        record: &[u8],
    ) -> Result<(), HaloSieveError> {
        debug_assert_eq!(record.len(), self.record_size);
        for e in &self.entries {
            store
                .row_bytes_mut(e.ci, i)?
                .copy_from_slice(&record[e.offset..e.offset + e.elem_size]);
        }
        Ok(())
    }

    /// Refresh a single named attribute of row `i` from `record`, leaving
    /// the rest of the row untouched.
    pub fn unpack_column(
        &self,
        tag: AttributeSet,
        store: &mut ParticleStore,
        i: usize,
        record: &[u8],
    ) -> Result<(), HaloSieveError> {
        let ci = tag.slot().ok_or(HaloSieveError::ColumnNotFound(tag))?;
        let e = self
            .entries
            .iter()
            .find(|e| e.ci == ci)
            .ok_or(HaloSieveError::ColumnNotFound(tag))?;
        store
            .row_bytes_mut(ci, i)?
            .copy_from_slice(&record[e.offset..e.offset + e.elem_size]);
        Ok(())
    }
}
