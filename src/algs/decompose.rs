//! Domain decomposition: redistribute store rows across ranks.
//!
//! The destination of each row comes from a caller-supplied target
//! function, so the same exchange serves both the initial spatial
//! decomposition (target = owning sub-box) and the later halo-ownership
//! decomposition (target = rank holding the group minimum). Whole rows
//! travel packed with all enabled attributes; per-row column alignment is
//! preserved on both sides.

use crate::algs::communicator::Communicator;
use crate::data::packing::PackingPlan;
use crate::data::store::ParticleStore;
use crate::halo_error::HaloSieveError;
use log::debug;

/// Move every row to the rank chosen by `target(store, row)`; replaces the
/// local contents and returns the number of rows that left this rank.
///
/// Capacity is checked *before* any row moves: each rank learns its
/// incoming total from a count exchange, and an overflow (or an
/// out-of-range target) anywhere fails the collective uniformly with
/// [`HaloSieveError::CapacityExceeded`] on every rank.
pub fn decompose<C, F>(
    store: &mut ParticleStore,
    mut target: F,
    comm: &C,
) -> Result<usize, HaloSieveError>
where
    C: Communicator,
    F: FnMut(&ParticleStore, usize) -> usize,
{
    let n_ranks = comm.size();
    let my_rank = comm.rank();
    let np = store.len();
    debug_assert!(np <= u32::MAX as usize);

    let targets: Vec<usize> = (0..np).map(|i| target(store, i)).collect();
    let bad_target = targets.iter().any(|&t| t >= n_ranks);

    let mut rows_by_rank: Vec<Vec<u32>> = vec![Vec::new(); n_ranks];
    for (i, &t) in targets.iter().enumerate() {
        if !bad_target && t != my_rank {
            rows_by_rank[t].push(i as u32);
        }
    }
    let kept = np - rows_by_rank.iter().map(Vec::len).sum::<usize>();

    // Count exchange first so every rank can agree on capacity before any
    // row data moves.
    let count_sends: Vec<Vec<u8>> = rows_by_rank
        .iter()
        .map(|rows| (rows.len() as u64).to_le_bytes().to_vec())
        .collect();
    let incoming: Vec<usize> = comm
        .all_to_allv(&count_sends)
        .iter()
        .map(|b| bytemuck::pod_read_unaligned::<u64>(&b[..8]) as usize)
        .collect();
    let incoming_total: usize = incoming.iter().sum();
    let new_np = kept + incoming_total;

    let local_fault = (bad_target || new_np > store.capacity()) as u64;
    if comm.all_reduce_max_u64(local_fault) != 0 {
        return Err(HaloSieveError::CapacityExceeded {
            name: store.name().to_string(),
            needed: new_np,
            np_upper: store.capacity(),
        });
    }

    let plan = PackingPlan::new(store, store.attributes())?;
    let rec = plan.record_size();
    let mut sends: Vec<Vec<u8>> = vec![Vec::new(); n_ranks];
    for (r, rows) in rows_by_rank.iter().enumerate() {
        let buf = &mut sends[r];
        buf.resize(rows.len() * rec, 0);
        for (k, &i) in rows.iter().enumerate() {
            plan.pack(store, i as usize, &mut buf[k * rec..(k + 1) * rec])?;
        }
    }
    let received = comm.all_to_allv(&sends);

    // Compact the kept rows in place, then append the received ones.
    let mut write = 0usize;
    for (i, &t) in targets.iter().enumerate() {
        if t == my_rank {
            store.copy_row_within(i, write)?;
            write += 1;
        }
    }
    debug_assert_eq!(write, kept);
    store.set_len(new_np)?;
    let mut row = kept;
    for buf in &received {
        for chunk in buf.chunks_exact(rec) {
            plan.unpack(store, row, chunk)?;
            row += 1;
        }
    }
    debug_assert_eq!(row, new_np);

    let moved = np - kept;
    debug!(
        "decompose `{}`: rank {my_rank} kept {kept}, sent {moved}, received {incoming_total}",
        store.name()
    );
    Ok(moved)
}
