//! KD-tree spatial index over particle positions, with the periodic
//! friends-of-friends linking pass built on top.
//!
//! The tree is built per rank over a contiguous row range (owned rows
//! followed by the current ghosts), splitting at the median of the widest
//! extent down to a fixed leaf threshold of 8. All distances are periodic:
//! separations use the minimum image in each dimension, so a single-rank
//! run needs no wrap-around ghosts.

use crate::algs::union_find::UnionFind;

/// Leaf size below which a node stops splitting.
pub const LEAF_THRESH: usize = 8;

#[derive(Clone, Debug)]
struct Node {
    start: u32,
    end: u32,
    min: [f64; 3],
    max: [f64; 3],
    /// Child node ids, or -1 for a leaf.
    left: i32,
    right: i32,
}

/// Spatial index over `positions[range]` in a periodic box.
pub struct KdTree<'a> {
    positions: &'a [[f64; 3]],
    box_size: [f64; 3],
    /// Row indices, permuted during the build so each node owns a
    /// contiguous span.
    ind: Vec<u32>,
    nodes: Vec<Node>,
    root: i32,
}

impl<'a> KdTree<'a> {
    /// Build over rows `range` of `positions` (O(N log N)).
    pub fn build(
        positions: &'a [[f64; 3]],
        range: std::ops::Range<usize>,
        box_size: [f64; 3],
    ) -> Self {
        let mut ind: Vec<u32> = (range.start as u32..range.end as u32).collect();
        let mut nodes = Vec::new();
        let n = ind.len();
        let root = if n == 0 {
            -1
        } else {
            Self::build_node(positions, &mut ind, &mut nodes, 0, n)
        };
        log::debug!("kdtree: {} nodes for {} particles", nodes.len(), n);
        KdTree {
            positions,
            box_size,
            ind,
            nodes,
            root,
        }
    }

    fn bbox(positions: &[[f64; 3]], ind: &[u32]) -> ([f64; 3], [f64; 3]) {
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        for &i in ind {
            let x = positions[i as usize];
            for d in 0..3 {
                min[d] = min[d].min(x[d]);
                max[d] = max[d].max(x[d]);
            }
        }
        (min, max)
    }

    fn build_node(
        positions: &[[f64; 3]],
        ind: &mut [u32],
        nodes: &mut Vec<Node>,
        start: usize,
        end: usize,
    ) -> i32 {
        let (min, max) = Self::bbox(positions, &ind[start..end]);
        let id = nodes.len() as i32;
        nodes.push(Node {
            start: start as u32,
            end: end as u32,
            min,
            max,
            left: -1,
            right: -1,
        });
        let n = end - start;
        if n <= LEAF_THRESH {
            return id;
        }
        let dim = (0..3)
            .max_by(|&a, &b| {
                (max[a] - min[a])
                    .partial_cmp(&(max[b] - min[b]))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(0);
        let mid = start + n / 2;
        ind[start..end].select_nth_unstable_by(n / 2, |&a, &b| {
            positions[a as usize][dim]
                .partial_cmp(&positions[b as usize][dim])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let left = Self::build_node(positions, ind, nodes, start, mid);
        let right = Self::build_node(positions, ind, nodes, mid, end);
        nodes[id as usize].left = left;
        nodes[id as usize].right = right;
        id
    }

    #[inline]
    fn min_image(&self, dx: f64, d: usize) -> f64 {
        let l = self.box_size[d];
        let mut x = dx % l;
        if x > 0.5 * l {
            x -= l;
        } else if x < -0.5 * l {
            x += l;
        }
        x
    }

    /// Squared periodic separation of two rows.
    #[inline]
    fn dist2(&self, a: usize, b: usize) -> f64 {
        let (xa, xb) = (self.positions[a], self.positions[b]);
        let mut s = 0.0;
        for d in 0..3 {
            let dx = self.min_image(xa[d] - xb[d], d);
            s += dx * dx;
        }
        s
    }

    /// Squared periodic distance from a point to a node's bounding box.
    fn box_dist2(&self, x: [f64; 3], node: &Node) -> f64 {
        let mut s = 0.0;
        for d in 0..3 {
            let l = self.box_size[d];
            let mut best = f64::INFINITY;
            for image in [-l, 0.0, l] {
                let xx = x[d] + image;
                let dd = if xx < node.min[d] {
                    node.min[d] - xx
                } else if xx > node.max[d] {
                    xx - node.max[d]
                } else {
                    0.0
                };
                best = best.min(dd);
            }
            s += best * best;
        }
        s
    }

    /// Number of rows the tree spans.
    pub fn len(&self) -> usize {
        self.ind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ind.is_empty()
    }

    /// Visit every row within `radius` of `x` (periodic).
    pub fn query<F: FnMut(usize)>(&self, x: [f64; 3], radius: f64, visit: &mut F) {
        if self.root < 0 {
            return;
        }
        let r2 = radius * radius;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id as usize];
            if self.box_dist2(x, node) > r2 {
                continue;
            }
            if node.left < 0 {
                for &j in &self.ind[node.start as usize..node.end as usize] {
                    let j = j as usize;
                    let mut s = 0.0;
                    for d in 0..3 {
                        let dx = self.min_image(x[d] - self.positions[j][d], d);
                        s += dx * dx;
                    }
                    if s <= r2 {
                        visit(j);
                    }
                }
            } else {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
    }

    /// Friends-of-friends linking: union every pair of spanned rows whose
    /// periodic separation is at most `ll`. Output-sensitive traversal; the
    /// union-find must index the same rows as the tree.
    pub fn fof_links(&self, ll: f64, uf: &mut UnionFind) {
        let r2 = ll * ll;
        let mut stack = Vec::new();
        for &i in &self.ind {
            let i = i as usize;
            let x = self.positions[i];
            stack.clear();
            if self.root >= 0 {
                stack.push(self.root);
            }
            while let Some(id) = stack.pop() {
                let node = &self.nodes[id as usize];
                if self.box_dist2(x, node) > r2 {
                    continue;
                }
                if node.left < 0 {
                    for &j in &self.ind[node.start as usize..node.end as usize] {
                        let j = j as usize;
                        // each unordered pair is handled once
                        if j >= i {
                            continue;
                        }
                        if self.dist2(i, j) <= r2 {
                            uf.union(i as u32, j as u32);
                        }
                    }
                } else {
                    stack.push(node.left);
                    stack.push(node.right);
                }
            }
        }
    }
}
