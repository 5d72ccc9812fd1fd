//! Static lookup tree over the target end sectors
//!
//! All keys are known before the tree is built, so the tree is laid out
//! implicitly: each level is one contiguous array of nodes, every node holds
//! `K` keys (one cache line at the default fan-out) and `K + 1` children,
//! and child positions are computed rather than stored.
//!
//! ```text
//! level 0 (root)     [k0 k1 .. k7]
//!                     /  |      \  \
//! level 1          node0 node1 .. node8      child(n, i) = n * (K + 1) + i
//!                     ...
//! leaf level      [h0 h1 .. h7][h8 .. h15] ..    the table's highs array
//! ```
//!
//! Key `i` of an internal node is the largest sector reachable through child
//! `i`. A lookup scans each node for the first key `>= sector` and descends;
//! at the leaf level the scan position is the target index.

use devmapper_common::Sector;

/// Key value for slots past the last real target
pub const SENTINEL: Sector = Sector::MAX;

/// ceil(n / size)
const fn div_up(n: usize, size: usize) -> usize {
    n.div_ceil(size)
}

/// ceil(log_base(n)) for n >= 1
fn int_log(mut n: usize, base: usize) -> usize {
    let mut result = 0;
    while n > 1 {
        n = div_up(n, base);
        result += 1;
    }
    result
}

/// Internal levels of the lookup tree
///
/// The leaf level is not owned here: it is the table's `highs` array,
/// padded in place to whole nodes by `build`.
#[derive(Debug, Clone)]
pub struct Index {
    fanout: usize,
    depth: usize,
    /// Nodes per level, root first; the last entry is the leaf level
    counts: Vec<usize>,
    /// Keys of levels `0..depth - 1`
    internal: Vec<Vec<Sector>>,
}

impl Index {
    /// Build the internal levels above `leaf`.
    ///
    /// `leaf` must be non-empty and strictly increasing; it is padded with
    /// `SENTINEL` to a multiple of `fanout`.
    pub fn build(leaf: &mut Vec<Sector>, fanout: usize) -> Self {
        assert!(fanout >= 2, "index fan-out must be at least 2");
        assert!(!leaf.is_empty(), "cannot index an empty table");

        let leaf_nodes = div_up(leaf.len(), fanout);
        let depth = 1 + int_log(leaf_nodes, fanout + 1);

        let mut counts = vec![0; depth];
        counts[depth - 1] = leaf_nodes;
        for level in (0..depth - 1).rev() {
            counts[level] = div_up(counts[level + 1], fanout + 1);
        }

        leaf.resize(leaf_nodes * fanout, SENTINEL);

        let mut index = Self {
            fanout,
            depth,
            counts,
            internal: Vec::with_capacity(depth - 1),
        };

        for level in 0..depth - 1 {
            let keys = (0..index.counts[level])
                .flat_map(|node| (0..fanout).map(move |key| (node, key)))
                .map(|(node, key)| index.high(leaf, level + 1, node * (fanout + 1) + key))
                .collect();
            index.internal.push(keys);
        }

        index
    }

    /// Largest key reachable from node `node` of level `level`
    fn high(&self, leaf: &[Sector], mut level: usize, mut node: usize) -> Sector {
        loop {
            if node >= self.counts[level] {
                return SENTINEL;
            }
            if level == self.depth - 1 {
                return leaf[(node + 1) * self.fanout - 1];
            }
            // rightmost child
            level += 1;
            node = (node + 1) * (self.fanout + 1) - 1;
        }
    }

    fn level<'a>(&'a self, leaf: &'a [Sector], level: usize) -> &'a [Sector] {
        if level == self.depth - 1 {
            leaf
        } else {
            &self.internal[level]
        }
    }

    /// Index of the leaf key covering `sector`.
    ///
    /// `sector` must not exceed the largest real key in `leaf`.
    pub fn lookup(&self, leaf: &[Sector], sector: Sector) -> usize {
        let k = self.fanout;
        let mut node = 0;
        let mut level = 0;

        loop {
            let keys = &self.level(leaf, level)[node * k..(node + 1) * k];
            let slot = keys.iter().position(|&key| key >= sector).unwrap_or(k);

            if level == self.depth - 1 {
                return node * k + slot;
            }

            node = node * (k + 1) + slot;
            level += 1;
        }
    }

    /// Number of levels including the leaf level
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Keys per node
    pub fn fanout(&self) -> usize {
        self.fanout
    }

    /// Nodes per level, root first
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Bytes held by the internal levels
    pub fn memory_bytes(&self) -> usize {
        self.internal
            .iter()
            .map(|level| level.len() * std::mem::size_of::<Sector>())
            .sum()
    }
}
