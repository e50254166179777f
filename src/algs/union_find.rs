//! Union-find over a row range, the backbone of local FOF grouping.

/// Disjoint-set forest with path halving. Roots are canonicalized to the
/// smallest row index in the set, so the flattened head array is
/// deterministic regardless of link order.
#[derive(Clone, Debug)]
pub struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n as u32).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Representative of `i`'s set.
    pub fn find(&mut self, mut i: u32) -> u32 {
        while self.parent[i as usize] != i {
            let gp = self.parent[self.parent[i as usize] as usize];
            self.parent[i as usize] = gp;
            i = gp;
        }
        i
    }

    /// Merge the sets of `a` and `b`; the smaller root index wins.
    pub fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[hi as usize] = lo;
    }

    /// Fully flattened parent array: `head[i]` is the representative of
    /// `i`'s component, and `head[head[i]] == head[i]`.
    pub fn heads(&mut self) -> Vec<u32> {
        (0..self.parent.len() as u32).map(|i| self.find(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_collapses_to_smallest_root() {
        let mut uf = UnionFind::new(5);
        uf.union(3, 4);
        uf.union(2, 3);
        uf.union(0, 1);
        assert_eq!(uf.find(4), 2);
        assert_eq!(uf.find(1), 0);
        uf.union(1, 4);
        let heads = uf.heads();
        assert_eq!(heads, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn singletons_are_their_own_heads() {
        let mut uf = UnionFind::new(3);
        assert_eq!(uf.heads(), vec![0, 1, 2]);
    }
}
