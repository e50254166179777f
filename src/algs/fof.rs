//! Friends-of-friends halo finding: local grouping, iterative distributed
//! group merge, halo-ownership decomposition and catalog aggregation.
//!
//! The distributed phase never materializes the cross-rank similarity
//! graph. Each row carries `(minid, task)` — the smallest particle id seen
//! in its component so far and the rank believed to own that minimum —
//! and rounds of ghost reduction propagate the pair until a global
//! fixpoint: representative `minid`s are monotone non-increasing and
//! bounded below by the true component minimum, so termination is
//! guaranteed, typically in far fewer rounds than the component diameter
//! because the ghost margin resolves most cross-rank links in round one.

use crate::algs::communicator::Communicator;
use crate::algs::decompose::decompose;
use crate::algs::ghosts::GhostZone;
use crate::algs::kdtree::KdTree;
use crate::algs::union_find::UnionFind;
use crate::data::column::{AttributeSet, REGISTRY};
use crate::data::store::{MemoryLocation, ParticleStore};
use crate::domain::SpatialDomain;
use crate::halo_error::HaloSieveError;
use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use itertools::izip;
use log::info;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// FOF linking length: the maximum periodic separation of a direct link.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub enum LinkingLength {
    /// Absolute distance in box units.
    Absolute(f64),
    /// Multiple of the domain's mean grid spacing (the conventional `b`).
    RelativeToSpacing(f64),
}

impl LinkingLength {
    pub fn resolve(self, domain: &SpatialDomain) -> f64 {
        match self {
            LinkingLength::Absolute(l) => l,
            LinkingLength::RelativeToSpacing(b) => b * domain.mean_spacing(),
        }
    }
}

/// Tunables of one FOF pass.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct FofConfig {
    pub linking_length: LinkingLength,
    /// Groups below this member count are left out of the catalog.
    pub min_group_size: usize,
}

impl Default for FofConfig {
    fn default() -> Self {
        FofConfig {
            linking_length: LinkingLength::RelativeToSpacing(0.2),
            min_group_size: 20,
        }
    }
}

/// Wire record of the merge loop: one per ghost per round.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct FofWire {
    pub minid: u64,
    pub task: i32,
    _pad: i32,
}

const_assert_eq!(std::mem::size_of::<FofWire>(), 16);

impl FofWire {
    pub fn new(minid: u64, task: i32) -> Self {
        FofWire {
            minid,
            task,
            _pad: 0,
        }
    }
}

/// Per-row merge state, spanning owned rows plus the current ghosts.
///
/// Lives for one FOF pass only; reallocated rather than reused, so a pass
/// can never observe another pass's state.
#[derive(Clone, Debug)]
pub struct FofScratch {
    pub minid: Vec<u64>,
    pub task: Vec<i32>,
}

impl FofScratch {
    /// Seed every row with its own id and its owning rank: the local rank
    /// for owned rows, the source rank for ghost rows. Folding then keeps
    /// `(minid, task)` a consistent pair, so every rank of a shared group
    /// names the same owner for the same minimum.
    pub fn seed(ids: &[u64], owners: &[i32]) -> FofScratch {
        debug_assert_eq!(ids.len(), owners.len());
        FofScratch {
            minid: ids.to_vec(),
            task: owners.to_vec(),
        }
    }

    /// Fold each row's `(id, owner)` into its component representative.
    pub fn fold_heads(&mut self, ids: &[u64], owners: &[i32], heads: &[u32]) {
        for (&id, &owner, &h) in izip!(ids, owners, heads) {
            let h = h as usize;
            if id < self.minid[h] {
                self.minid[h] = id;
                self.task[h] = owner;
            }
        }
    }

    /// Broadcast each representative's `(minid, task)` to its members.
    pub fn sync(&mut self, heads: &[u32]) {
        for i in 0..heads.len() {
            let h = heads[i] as usize;
            self.minid[i] = self.minid[h];
            self.task[i] = self.task[h];
        }
    }
}

/// Run merge rounds until the global fixpoint; returns the round count.
///
/// Each round: ghost reduction adopting the smaller `(minid, task)` into
/// the local representative, a blocking global sum of the merge counter,
/// and a representative-to-member re-sync. Terminates when no rank merged
/// anything. Running on an already-converged state performs zero merges
/// and returns after a single round.
pub fn merge_group_ids<C: Communicator>(
    zone: &GhostZone,
    store: &ParticleStore,
    scratch: &mut FofScratch,
    heads: &[u32],
    comm: &C,
) -> Result<usize, HaloSieveError> {
    let np_local = zone.local_len();
    let mut rounds = 0usize;
    loop {
        // snapshot the ghost records first; the fuse side mutates scratch
        let wire: Vec<FofWire> = (np_local..np_local + zone.n_ghosts())
            .map(|g| FofWire::new(scratch.minid[g], scratch.task[g]))
            .collect();
        let mut merged = 0u64;
        zone.reduce_with::<FofWire, _, _, _>(
            store,
            comm,
            |g| wire[g - np_local],
            |origin, rec| {
                let h = heads[origin] as usize;
                let smaller = rec.minid < scratch.minid[h]
                    || (rec.minid == scratch.minid[h] && rec.task < scratch.task[h]);
                if smaller {
                    scratch.minid[h] = rec.minid;
                    scratch.task[h] = rec.task;
                    merged += 1;
                }
            },
        )?;
        let total = comm.all_reduce_sum_u64(merged);
        scratch.sync(heads);
        rounds += 1;
        info!("fof reduction iteration {rounds}: merged {total} crosslinks");
        if total == 0 {
            return Ok(rounds);
        }
    }
}

/// Count members per representative and hand out dense halo indices to
/// the groups with at least `min_group_size` members.
pub fn assign_halo_index(
    heads: &[u32],
    min_group_size: usize,
) -> (HashMap<u32, u32>, usize) {
    let mut counts: HashMap<u32, u32> = HashMap::new();
    for &h in heads {
        *counts.entry(h).or_insert(0) += 1;
    }
    let mut reps: Vec<u32> = counts
        .iter()
        .filter(|&(_, &c)| c as usize >= min_group_size)
        .map(|(&h, _)| h)
        .collect();
    // deterministic catalog order: by representative row
    reps.sort_unstable();
    let index: HashMap<u32, u32> = reps
        .iter()
        .enumerate()
        .map(|(i, &h)| (h, i as u32))
        .collect();
    let nhalos = reps.len();
    (index, nhalos)
}

/// Reduce every member's attributes into its halo row: running-sum mean
/// per component (uncompensated), plus the member count in `length`.
///
/// The catalog carries `(input attributes | LENGTH) - ID`.
pub fn aggregate_halos(
    store: &ParticleStore,
    heads: &[u32],
    index: &HashMap<u32, u32>,
    nhalos: usize,
) -> Result<ParticleStore, HaloSieveError> {
    let halo_attrs = (store.attributes() | AttributeSet::LENGTH) - AttributeSet::ID;
    let mut halos = ParticleStore::new("halos", nhalos, halo_attrs, MemoryLocation::Scratch)?;
    halos.set_len(nhalos)?;
    halos.meta = store.meta;
    halos.species = store.species;

    // columns averaged across members: everything shared with the input
    let mean_attrs = store.attributes() & (halo_attrs - AttributeSet::LENGTH);

    for (i, &h) in heads.iter().enumerate() {
        let Some(&hid) = index.get(&h) else { continue };
        let hid = hid as usize;
        halos.halo_length_mut()?[hid] += 1;
        for ci in mean_attrs.slots() {
            let kind = REGISTRY[ci].kind;
            let src = store.row_bytes(ci, i)?.to_vec();
            let dst = halos.row_bytes_mut(ci, hid)?;
            for m in 0..kind.member_count() {
                let acc = kind.read_f64(dst, m) + kind.read_f64(&src, m);
                kind.write_f64(dst, m, acc);
            }
        }
    }

    for hid in 0..nhalos {
        let n = halos.halo_length()?[hid] as f64;
        for ci in mean_attrs.slots() {
            let kind = REGISTRY[ci].kind;
            let dst = halos.row_bytes_mut(ci, hid)?;
            for m in 0..kind.member_count() {
                let mean = kind.read_f64(dst, m) / n;
                kind.write_f64(dst, m, mean);
            }
        }
    }
    Ok(halos)
}

/// Driver for one FOF pass over a particle store.
///
/// Holds the store mutably for the duration of the pass; on return the
/// store contents have been redistributed so that every halo is wholly
/// owned by one rank (uncataloged particles stay in the store).
pub struct FofFinder<'a, C: Communicator> {
    store: &'a mut ParticleStore,
    domain: SpatialDomain,
    config: FofConfig,
    comm: &'a C,
}

impl<'a, C: Communicator> FofFinder<'a, C> {
    /// The store must carry positions and ids.
    pub fn new(
        store: &'a mut ParticleStore,
        domain: SpatialDomain,
        config: FofConfig,
        comm: &'a C,
    ) -> Result<Self, HaloSieveError> {
        let required = AttributeSet::POS | AttributeSet::ID;
        if !store.attributes().contains(required) {
            return Err(HaloSieveError::AttributeMismatch {
                requested: required,
                present: store.attributes(),
            });
        }
        Ok(FofFinder {
            store,
            domain,
            config,
            comm,
        })
    }

    /// Identify halos and return the catalog store.
    pub fn execute(&mut self) -> Result<ParticleStore, HaloSieveError> {
        let ll = self.config.linking_length.resolve(&self.domain);
        let box_size = self.domain.box_size;

        // move rows onto their spatial owners so ghost zones stay thin
        let targets: Vec<usize> = self
            .store
            .position()?
            .iter()
            .map(|&x| self.domain.rank_of(x))
            .collect();
        decompose(self.store, |_, i| targets[i], self.comm)?;

        // ghosts within one linking length of the sub-box
        let subset = AttributeSet::POS | AttributeSet::ID;
        let zone = GhostZone::create(self.store, &self.domain, ll, subset, self.comm)?;
        let np_local = zone.local_len();
        let np_total = np_local + zone.n_ghosts();

        // local grouping over owned rows plus ghosts
        let heads = {
            let pos = self.store.position()?;
            let tree = KdTree::build(pos, 0..np_total, box_size);
            let mut uf = UnionFind::new(np_total);
            tree.fof_links(ll, &mut uf);
            uf.heads()
        };

        let ids = self.store.id()?.to_vec();
        let mut owners = vec![self.comm.rank() as i32; np_local];
        owners.extend(zone.ghost_sources().into_iter().map(|r| r as i32));
        let mut scratch = FofScratch::seed(&ids, &owners);
        scratch.fold_heads(&ids, &owners, &heads);
        scratch.sync(&heads);

        merge_group_ids(&zone, self.store, &mut scratch, &heads, self.comm)?;
        zone.release(self.store)?;

        // every row moves to the rank owning its group minimum
        let owner: Vec<usize> = scratch.task[..np_local]
            .iter()
            .map(|&t| t as usize)
            .collect();
        let remote = owner
            .iter()
            .filter(|&&t| t != self.comm.rank())
            .count();
        info!("{remote} particles are linked to a remote group");
        decompose(self.store, |_, i| owner[i], self.comm)?;

        // groups are now rank-local; regroup without ghosts
        let np = self.store.len();
        let heads = {
            let pos = self.store.position()?;
            let tree = KdTree::build(pos, 0..np, box_size);
            let mut uf = UnionFind::new(np);
            tree.fof_links(ll, &mut uf);
            uf.heads()
        };

        let (index, nhalos) = assign_halo_index(&heads, self.config.min_group_size);
        let halos = aggregate_halos(self.store, &heads, &index, nhalos)?;
        let total = self.comm.all_reduce_sum_u64(nhalos as u64);
        info!(
            "found {total} halos >= {} particles",
            self.config.min_group_size
        );
        Ok(halos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn cluster_store(centers: &[[f64; 3]], eps: f64) -> ParticleStore {
        // a tight pair of particles at each centre
        let attrs = AttributeSet::POS | AttributeSet::ID | AttributeSet::VEL;
        let mut s =
            ParticleStore::new("p", 4 * centers.len(), attrs, MemoryLocation::Heap).unwrap();
        s.set_len(2 * centers.len()).unwrap();
        for (k, c) in centers.iter().enumerate() {
            for (j, sign) in [-1.0f64, 1.0].iter().enumerate() {
                let i = 2 * k + j;
                s.position_mut().unwrap()[i] = [c[0] + sign * eps, c[1], c[2]];
                s.id_mut().unwrap()[i] = i as u64;
                s.velocity_mut().unwrap()[i] = [k as f32, 0.0, 0.0];
            }
        }
        s
    }

    #[test]
    fn serial_pairs_become_halos() {
        let mut s = cluster_store(&[[0.25, 0.5, 0.5], [0.75, 0.5, 0.5]], 0.005);
        let domain = SpatialDomain::slab([1.0; 3], [0.05; 3], 0, 1);
        let config = FofConfig {
            linking_length: LinkingLength::Absolute(0.02),
            min_group_size: 2,
        };
        let halos = FofFinder::new(&mut s, domain, config, &NoComm)
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(halos.len(), 2);
        assert_eq!(halos.halo_length().unwrap(), &[2, 2]);
        // catalog drops id, gains length
        assert!(halos.id().is_err());
        // per-halo mean position is the cluster centre
        let x = halos.position().unwrap();
        assert!((x[0][0] - 0.25).abs() < 1e-12);
        assert!((x[1][0] - 0.75).abs() < 1e-12);
        // velocity mean survives in f32
        let v = halos.velocity().unwrap();
        assert_eq!(v[0], [0.0, 0.0, 0.0]);
        assert_eq!(v[1], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn min_group_size_excludes_small_groups() {
        let mut s = cluster_store(&[[0.25, 0.5, 0.5], [0.75, 0.5, 0.5]], 0.005);
        // detach one particle of the second pair
        s.position_mut().unwrap()[3] = [0.9, 0.1, 0.1];
        let domain = SpatialDomain::slab([1.0; 3], [0.05; 3], 0, 1);
        let config = FofConfig {
            linking_length: LinkingLength::Absolute(0.02),
            min_group_size: 2,
        };
        let halos = FofFinder::new(&mut s, domain, config, &NoComm)
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(halos.len(), 1);
        assert_eq!(halos.halo_length().unwrap(), &[2]);
        // uncataloged particles remain in the particle store
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn merge_on_converged_state_is_one_round() {
        let mut s = cluster_store(&[[0.5, 0.5, 0.5]], 0.005);
        let domain = SpatialDomain::slab([1.0; 3], [0.05; 3], 0, 1);
        let zone = GhostZone::create(
            &mut s,
            &domain,
            0.02,
            AttributeSet::POS | AttributeSet::ID,
            &NoComm,
        )
        .unwrap();
        let heads = vec![0u32, 0];
        let ids = s.id().unwrap().to_vec();
        let owners = vec![0i32; ids.len()];
        let mut scratch = FofScratch::seed(&ids, &owners);
        scratch.fold_heads(&ids, &owners, &heads);
        scratch.sync(&heads);
        let rounds = merge_group_ids(&zone, &s, &mut scratch, &heads, &NoComm).unwrap();
        assert_eq!(rounds, 1);
        // and it stays converged
        let rounds = merge_group_ids(&zone, &s, &mut scratch, &heads, &NoComm).unwrap();
        assert_eq!(rounds, 1);
    }

    #[test]
    fn finder_requires_positions_and_ids() {
        let mut s = ParticleStore::new("p", 4, AttributeSet::POS, MemoryLocation::Heap).unwrap();
        let domain = SpatialDomain::slab([1.0; 3], [0.05; 3], 0, 1);
        let err = FofFinder::new(&mut s, domain, FofConfig::default(), &NoComm).err();
        assert!(matches!(err, Some(HaloSieveError::AttributeMismatch { .. })));
    }

    #[test]
    fn fold_adopts_owner_of_smallest_id() {
        // two owned rows on rank 1 plus one ghost from rank 0 carrying the
        // group minimum; the representative must name rank 0 as owner
        let ids = vec![5u64, 7, 2];
        let owners = vec![1i32, 1, 0];
        let heads = vec![0u32, 0, 0];
        let mut scratch = FofScratch::seed(&ids, &owners);
        scratch.fold_heads(&ids, &owners, &heads);
        scratch.sync(&heads);
        assert_eq!(scratch.minid, vec![2, 2, 2]);
        assert_eq!(scratch.task, vec![0, 0, 0]);
    }

    #[test]
    fn straddling_pair_converges_to_one_owner() {
        use crate::algs::communicator::LocalComm;
        use std::thread;

        // one particle per rank, linked across the slab boundary at x = 0.5
        let world = LocalComm::world(2);
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let attrs = AttributeSet::POS | AttributeSet::ID;
                    let mut s =
                        ParticleStore::new("p", 8, attrs, MemoryLocation::Heap).unwrap();
                    s.set_len(1).unwrap();
                    if comm.rank() == 0 {
                        s.position_mut().unwrap()[0] = [0.49, 0.5, 0.5];
                        s.id_mut().unwrap()[0] = 3;
                    } else {
                        s.position_mut().unwrap()[0] = [0.51, 0.5, 0.5];
                        s.id_mut().unwrap()[0] = 9;
                    }
                    let domain = SpatialDomain::slab([1.0; 3], [0.05; 3], comm.rank(), 2);
                    let config = FofConfig {
                        linking_length: LinkingLength::Absolute(0.05),
                        min_group_size: 2,
                    };
                    let halos = FofFinder::new(&mut s, domain, config, &comm)
                        .unwrap()
                        .execute()
                        .unwrap();
                    (comm.rank(), s.len(), halos.len())
                })
            })
            .collect();

        for h in handles {
            let (rank, np, nhalos) = h.join().unwrap();
            // the pair ends up whole on the rank owning id 3
            if rank == 0 {
                assert_eq!(np, 2);
                assert_eq!(nhalos, 1);
            } else {
                assert_eq!(np, 0);
                assert_eq!(nhalos, 0);
            }
        }
    }

    #[test]
    fn halo_index_assignment_is_dense_and_filtered() {
        let heads = vec![0, 0, 0, 3, 3, 5];
        let (index, nhalos) = assign_halo_index(&heads, 2);
        assert_eq!(nhalos, 2);
        assert_eq!(index.get(&0), Some(&0));
        assert_eq!(index.get(&3), Some(&1));
        assert_eq!(index.get(&5), None);
    }

    #[test]
    fn aggregated_mean_is_exact_for_known_values() {
        let attrs = AttributeSet::POS | AttributeSet::ID | AttributeSet::AEMIT;
        let mut s = ParticleStore::new("p", 8, attrs, MemoryLocation::Heap).unwrap();
        s.set_len(4).unwrap();
        for i in 0..4 {
            s.position_mut().unwrap()[i] = [i as f64, 0.0, 1.0];
            s.id_mut().unwrap()[i] = i as u64;
            s.aemit_mut().unwrap()[i] = 0.25 * (i as f32 + 1.0);
        }
        let heads = vec![0u32; 4];
        let (index, nhalos) = assign_halo_index(&heads, 1);
        let halos = aggregate_halos(&s, &heads, &index, nhalos).unwrap();
        assert_eq!(halos.len(), 1);
        assert_eq!(halos.halo_length().unwrap()[0], 4);
        assert_eq!(halos.position().unwrap()[0], [1.5, 0.0, 1.0]);
        assert_eq!(halos.aemit().unwrap()[0], 0.625);
    }
}
