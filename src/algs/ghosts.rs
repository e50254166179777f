//! Ghost exchange: read-mostly shadow copies of remote particles.
//!
//! A [`GhostZone`] materializes, for every rank, copies of the remote
//! particles that lie within a margin of its sub-box. Ghost rows are
//! appended to the local store after the `np_local` owned rows (so a
//! spatial index can span both ranges), grouped by source rank. Only the
//! requested attribute subset is filled in on ghost rows.
//!
//! The zone also provides the reduction primitive the distributed merge is
//! built on: [`reduce_with`](GhostZone::reduce_with) routes one record per
//! ghost back to the rank that owns the original particle and folds it in
//! there — the restrict/fuse split keeps the wire format decoupled from
//! what the caller accumulates.

use crate::algs::communicator::Communicator;
use crate::data::column::AttributeSet;
use crate::data::packing::PackingPlan;
use crate::data::store::ParticleStore;
use crate::domain::SpatialDomain;
use crate::halo_error::HaloSieveError;
use bytemuck::Pod;
use log::debug;

/// Bookkeeping for one set of materialized ghosts.
///
/// Tied to the store state it was built against via a generation tag; any
/// length or order change invalidates the zone ([`HaloSieveError::GhostStale`]).
#[derive(Debug)]
pub struct GhostZone {
    np_local: usize,
    n_ghosts: usize,
    subset: AttributeSet,
    /// Per peer rank: local rows we sent as ghosts, in send order.
    send_origins: Vec<Vec<u32>>,
    /// Ghost rows received per source rank; appended in rank order.
    recv_counts: Vec<usize>,
    generation: u64,
}

impl GhostZone {
    /// Materialize ghosts for every remote rank whose margin-expanded
    /// sub-box contains one of our particles, carrying `subset`.
    ///
    /// Appends `n_ghosts` rows to `store`; capacity is agreed on across all
    /// ranks before any row is appended, so overflow fails uniformly.
    pub fn create<C: Communicator>(
        store: &mut ParticleStore,
        domain: &SpatialDomain,
        margin: f64,
        subset: AttributeSet,
        comm: &C,
    ) -> Result<GhostZone, HaloSieveError> {
        let n_ranks = comm.size();
        let np_local = store.len();
        debug_assert!(np_local <= u32::MAX as usize);
        let plan = PackingPlan::new(store, subset)?;

        let mut send_origins: Vec<Vec<u32>> = vec![Vec::new(); n_ranks];
        {
            let pos = store.position()?;
            let mut targets = Vec::new();
            for (i, &x) in pos.iter().enumerate().take(np_local) {
                domain.ranks_within_margin(x, margin, &mut targets);
                for &r in &targets {
                    send_origins[r].push(i as u32);
                }
            }
        }

        let count_sends: Vec<Vec<u8>> = send_origins
            .iter()
            .map(|rows| (rows.len() as u64).to_le_bytes().to_vec())
            .collect();
        let recv_counts: Vec<usize> = comm
            .all_to_allv(&count_sends)
            .iter()
            .map(|b| bytemuck::pod_read_unaligned::<u64>(&b[..8]) as usize)
            .collect();
        let n_ghosts: usize = recv_counts.iter().sum();

        let overflow = (np_local + n_ghosts > store.capacity()) as u64;
        if comm.all_reduce_max_u64(overflow) != 0 {
            return Err(HaloSieveError::CapacityExceeded {
                name: store.name().to_string(),
                needed: np_local + n_ghosts,
                np_upper: store.capacity(),
            });
        }

        let rec = plan.record_size();
        let mut sends: Vec<Vec<u8>> = vec![Vec::new(); n_ranks];
        for (r, rows) in send_origins.iter().enumerate() {
            let buf = &mut sends[r];
            buf.resize(rows.len() * rec, 0);
            for (k, &i) in rows.iter().enumerate() {
                plan.pack(store, i as usize, &mut buf[k * rec..(k + 1) * rec])?;
            }
        }
        let received = comm.all_to_allv(&sends);

        store.set_len(np_local + n_ghosts)?;
        let mut row = np_local;
        for buf in &received {
            for chunk in buf.chunks_exact(rec) {
                plan.unpack(store, row, chunk)?;
                row += 1;
            }
        }
        debug_assert_eq!(row, np_local + n_ghosts);
        debug!(
            "ghosts `{}`: rank {} holds {} locals + {} ghosts (margin {margin})",
            store.name(),
            comm.rank(),
            np_local,
            n_ghosts
        );

        Ok(GhostZone {
            np_local,
            n_ghosts,
            subset,
            send_origins,
            recv_counts,
            generation: store.generation(),
        })
    }

    #[inline]
    pub fn n_ghosts(&self) -> usize {
        self.n_ghosts
    }

    /// Number of owned rows; ghost rows are `local_len()..local_len() + n_ghosts()`.
    #[inline]
    pub fn local_len(&self) -> usize {
        self.np_local
    }

    #[inline]
    pub fn subset(&self) -> AttributeSet {
        self.subset
    }

    /// Owning rank of each ghost row, in row order
    /// `local_len()..local_len() + n_ghosts()`. Ghosts arrive grouped by
    /// source rank, so this expands the per-peer receive counts.
    pub fn ghost_sources(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.n_ghosts);
        for (r, &count) in self.recv_counts.iter().enumerate() {
            out.extend(std::iter::repeat(r).take(count));
        }
        out
    }

    fn check_fresh(&self, store: &ParticleStore) -> Result<(), HaloSieveError> {
        if store.generation() != self.generation {
            return Err(HaloSieveError::GhostStale {
                store: store.generation(),
                zone: self.generation,
            });
        }
        Ok(())
    }

    /// Fold ghost state back into the owning ranks.
    ///
    /// `restrict(ghost_row)` extracts a wire record from each local ghost
    /// row; the record travels to the rank that owns the original particle,
    /// where `fuse(origin_row, record)` merges it. Both sides run exactly
    /// once per ghost. Blocking collective; every rank must call it.
    pub fn reduce_with<T, C, R, F>(
        &self,
        store: &ParticleStore,
        comm: &C,
        mut restrict: R,
        mut fuse: F,
    ) -> Result<(), HaloSieveError>
    where
        T: Pod,
        C: Communicator,
        R: FnMut(usize) -> T,
        F: FnMut(usize, T),
    {
        self.check_fresh(store)?;
        let n_ranks = comm.size();
        let mut sends: Vec<Vec<u8>> = vec![Vec::new(); n_ranks];
        let mut row = self.np_local;
        for (r, &count) in self.recv_counts.iter().enumerate() {
            let mut records: Vec<T> = Vec::with_capacity(count);
            for _ in 0..count {
                records.push(restrict(row));
                row += 1;
            }
            sends[r] = bytemuck::cast_slice(&records).to_vec();
        }
        let received = comm.all_to_allv(&sends);
        let rec = std::mem::size_of::<T>();
        for (r, buf) in received.iter().enumerate() {
            debug_assert_eq!(buf.len(), self.send_origins[r].len() * rec);
            // receive buffers carry no alignment guarantee
            for (&origin, chunk) in self.send_origins[r].iter().zip(buf.chunks_exact(rec)) {
                fuse(origin as usize, bytemuck::pod_read_unaligned::<T>(chunk));
            }
        }
        Ok(())
    }

    /// Drop all ghost rows, restoring the store to its owned rows only.
    /// Consumes the zone; any further use is impossible by construction.
    pub fn release(self, store: &mut ParticleStore) -> Result<(), HaloSieveError> {
        self.check_fresh(store)?;
        store.set_len(self.np_local)
    }
}
