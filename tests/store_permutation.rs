//! Row-reordering properties of the particle store: permutations are
//! invertible, sorting keeps columns aligned, and packed records carry a
//! row across stores intact.

use halo_sieve::prelude::*;
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::{rngs::SmallRng, SeedableRng};

fn filled_store(ids: &[u64]) -> ParticleStore {
    let attrs = AttributeSet::POS | AttributeSet::ID | AttributeSet::AEMIT;
    let mut s = ParticleStore::new("p", ids.len(), attrs, MemoryLocation::Heap).unwrap();
    s.set_len(ids.len()).unwrap();
    for (i, &id) in ids.iter().enumerate() {
        s.id_mut().unwrap()[i] = id;
        s.position_mut().unwrap()[i] = [id as f64, 0.5, -1.0];
        s.aemit_mut().unwrap()[i] = id as f32 * 0.25;
    }
    s
}

proptest! {
    #[test]
    fn permute_then_inverse_is_identity(ids in prop::collection::vec(any::<u64>(), 1..64), seed in any::<u64>()) {
        let n = ids.len();
        let mut perm: Vec<u32> = (0..n as u32).collect();
        perm.shuffle(&mut SmallRng::seed_from_u64(seed));
        let mut inv = vec![0u32; n];
        for (i, &p) in perm.iter().enumerate() {
            inv[p as usize] = i as u32;
        }

        let mut s = filled_store(&ids);
        s.permute(&perm).unwrap();
        s.permute(&inv).unwrap();
        prop_assert_eq!(s.id().unwrap(), &ids[..]);
        for (i, &id) in ids.iter().enumerate() {
            prop_assert_eq!(s.position().unwrap()[i], [id as f64, 0.5, -1.0]);
        }
    }

    #[test]
    fn sort_by_id_keeps_rows_coherent(ids in prop::collection::vec(any::<u64>(), 1..64)) {
        let mut s = filled_store(&ids);
        s.sort_by_id().unwrap();
        let sorted = s.id().unwrap();
        prop_assert!(sorted.windows(2).all(|w| w[0] <= w[1]));
        // every row still carries the values derived from its own id
        for i in 0..ids.len() {
            let id = sorted[i];
            prop_assert_eq!(s.position().unwrap()[i][0], id as f64);
            prop_assert_eq!(s.aemit().unwrap()[i], id as f32 * 0.25);
        }
    }

    #[test]
    fn packed_row_lands_intact_in_another_store(ids in prop::collection::vec(any::<u64>(), 1..16), row in any::<prop::sample::Index>()) {
        let s = filled_store(&ids);
        let i = row.index(ids.len());

        let subset = AttributeSet::POS | AttributeSet::ID;
        let plan = PackingPlan::new(&s, subset).unwrap();
        let rec = s.pack(i, subset).unwrap();
        prop_assert_eq!(rec.len(), plan.record_size());

        let mut out = ParticleStore::new("q", 4, subset, MemoryLocation::Scratch).unwrap();
        out.set_len(1).unwrap();
        out.unpack(0, &rec, subset).unwrap();
        prop_assert_eq!(out.id().unwrap()[0], ids[i]);
        prop_assert_eq!(out.position().unwrap()[0], s.position().unwrap()[i]);
    }
}
