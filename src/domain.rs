//! SpatialDomain: the periodic box and this rank's slab of it.
//!
//! The gravity solver owns the real spatial/FFT grid; the halo finder only
//! consumes its geometry: box size, the local sub-box bounds, and a cell
//! size. The default decomposition is a slab split along the first axis,
//! which is all the FOF pipeline needs to route rows and to find the ranks
//! whose ghost margins a particle falls into.

use serde::{Deserialize, Serialize};

/// Geometry of the periodic simulation box as seen from one rank.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpatialDomain {
    pub box_size: [f64; 3],
    /// Inclusive lower corner of this rank's sub-box.
    pub lower: [f64; 3],
    /// Exclusive upper corner of this rank's sub-box.
    pub upper: [f64; 3],
    /// Grid cell size of the underlying mesh (sets the mean spacing).
    pub cell_size: [f64; 3],
    pub rank: usize,
    pub n_ranks: usize,
}

impl SpatialDomain {
    /// Slab decomposition along the first axis: rank `r` of `n` owns
    /// `x0 in [r*L/n, (r+1)*L/n)`.
    pub fn slab(box_size: [f64; 3], cell_size: [f64; 3], rank: usize, n_ranks: usize) -> Self {
        let w = box_size[0] / n_ranks as f64;
        SpatialDomain {
            box_size,
            lower: [rank as f64 * w, 0.0, 0.0],
            upper: [(rank + 1) as f64 * w, box_size[1], box_size[2]],
            cell_size,
            rank,
            n_ranks,
        }
    }

    /// Wrap a coordinate into `[0, box)` per dimension.
    #[inline]
    pub fn wrap(&self, pos: [f64; 3]) -> [f64; 3] {
        let mut out = pos;
        for d in 0..3 {
            out[d] = out[d].rem_euclid(self.box_size[d]);
        }
        out
    }

    /// Minimum-image separation along dimension `d`.
    #[inline]
    pub fn min_image(&self, dx: f64, d: usize) -> f64 {
        let l = self.box_size[d];
        let mut x = dx % l;
        if x > 0.5 * l {
            x -= l;
        } else if x < -0.5 * l {
            x += l;
        }
        x
    }

    /// Periodic Euclidean separation of two positions.
    pub fn distance(&self, a: [f64; 3], b: [f64; 3]) -> f64 {
        let mut s = 0.0;
        for d in 0..3 {
            let dx = self.min_image(a[d] - b[d], d);
            s += dx * dx;
        }
        s.sqrt()
    }

    /// Does this rank's sub-box contain the (wrapped) position?
    pub fn contains(&self, pos: [f64; 3]) -> bool {
        let p = self.wrap(pos);
        (0..3).all(|d| p[d] >= self.lower[d] && p[d] < self.upper[d])
    }

    /// Owning rank of a position under the slab decomposition.
    pub fn rank_of(&self, pos: [f64; 3]) -> usize {
        let x = pos[0].rem_euclid(self.box_size[0]);
        let w = self.box_size[0] / self.n_ranks as f64;
        ((x / w) as usize).min(self.n_ranks - 1)
    }

    /// Ranks other than the owner whose margin-expanded sub-box contains
    /// `pos` (periodic). These are the ranks that need a ghost copy.
    pub fn ranks_within_margin(&self, pos: [f64; 3], margin: f64, out: &mut Vec<usize>) {
        out.clear();
        if self.n_ranks == 1 {
            return;
        }
        let owner = self.rank_of(pos);
        let x = pos[0].rem_euclid(self.box_size[0]);
        let w = self.box_size[0] / self.n_ranks as f64;
        for r in 0..self.n_ranks {
            if r == owner {
                continue;
            }
            let lo = r as f64 * w;
            let hi = lo + w;
            if self.interval_distance(x, lo, hi) <= margin {
                out.push(r);
            }
        }
    }

    /// Periodic distance from `x` to the interval `[lo, hi)` on axis 0.
    fn interval_distance(&self, x: f64, lo: f64, hi: f64) -> f64 {
        if x >= lo && x < hi {
            return 0.0;
        }
        let d_lo = self.min_image(x - lo, 0).abs();
        let d_hi = self.min_image(x - hi, 0).abs();
        d_lo.min(d_hi)
    }

    /// Mean inter-cell spacing, the reference scale for relative linking
    /// lengths.
    pub fn mean_spacing(&self) -> f64 {
        (self.cell_size[0] * self.cell_size[1] * self.cell_size[2]).cbrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_rank_domain(rank: usize) -> SpatialDomain {
        SpatialDomain::slab([1.0, 1.0, 1.0], [0.05; 3], rank, 2)
    }

    #[test]
    fn slab_bounds_and_ownership() {
        let d0 = two_rank_domain(0);
        assert!(d0.contains([0.25, 0.5, 0.5]));
        assert!(!d0.contains([0.75, 0.5, 0.5]));
        assert_eq!(d0.rank_of([0.75, 0.5, 0.5]), 1);
        assert_eq!(d0.rank_of([0.49, 0.5, 0.5]), 0);
        // positions outside the box wrap before routing
        assert_eq!(d0.rank_of([1.25, 0.5, 0.5]), 0);
    }

    #[test]
    fn min_image_wraps_half_box() {
        let d = two_rank_domain(0);
        assert!((d.min_image(0.9, 0) - -0.1).abs() < 1e-12);
        assert!((d.distance([0.05, 0.0, 0.0], [0.95, 0.0, 0.0]) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn margin_ranks_across_periodic_seam() {
        let d = two_rank_domain(0);
        let mut out = Vec::new();
        // deep inside rank 0: no ghosts
        d.ranks_within_margin([0.25, 0.5, 0.5], 0.06, &mut out);
        assert!(out.is_empty());
        // near the 0.5 boundary: ghost to rank 1
        d.ranks_within_margin([0.47, 0.5, 0.5], 0.06, &mut out);
        assert_eq!(out, vec![1]);
        // near x = 0: rank 1 is also a periodic neighbour
        d.ranks_within_margin([0.01, 0.5, 0.5], 0.06, &mut out);
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn mean_spacing_is_cell_scale() {
        let d = two_rank_domain(1);
        assert!((d.mean_spacing() - 0.05).abs() < 1e-12);
    }
}
