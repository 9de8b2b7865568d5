// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The set-like façade: queries, nearest neighbor, membership.

use alloc::vec::Vec;
use kurbo::{Point, Rect};
use smallvec::SmallVec;
use thicket_tree::{
    EntityFlags, EntityKey, Error, FlushReport, ListenerKey, NodeId, PartitionPolicy,
    PartitionScheme, Tree,
};

use crate::query::Query;
use crate::util::min_dist_sq;

/// Slack applied to squared distances when comparing nearest-neighbor
/// candidates. Candidates within this band of the best tie, and the tie goes
/// to the earliest-inserted entity.
pub const DISTANCE_EPSILON: f64 = 1e-9;

/// A set of 2D entities indexed by bounding box.
///
/// Wraps a [`Tree`] with the query surface: lazy range iteration
/// ([`SpatialSet::query`]), nearest-neighbor search ([`SpatialSet::nearest`]),
/// and membership checks. Mutation and bound-refresh semantics are the
/// tree's; [`SpatialSet::tree`] exposes the wrapped tree for structural
/// inspection.
///
/// ## Example
///
/// ```rust
/// use kurbo::{Point, Rect};
/// use thicket_set::{EntityFlags, PartitionScheme, SpatialSet};
///
/// let mut set = SpatialSet::new(PartitionScheme::IcosepQuad, 4);
/// let a = set.insert("a", Rect::new(0.0, 0.0, 1.0, 1.0), EntityFlags::empty())?;
/// set.insert("b", Rect::new(5.0, 5.0, 6.0, 6.0), EntityFlags::empty())?;
/// let hits: Vec<_> = set.query(Rect::new(0.0, 0.0, 2.0, 2.0)).collect();
/// assert_eq!(hits, [(a, &"a")]);
/// assert_eq!(set.nearest(Point::new(0.5, 0.5)), Some((a, &"a")));
/// # Ok::<(), thicket_set::Error>(())
/// ```
pub struct SpatialSet<P> {
    tree: Tree<P>,
}

impl<P> core::fmt::Debug for SpatialSet<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpatialSet").field("tree", &self.tree).finish()
    }
}

impl<P> From<Tree<P>> for SpatialSet<P> {
    fn from(tree: Tree<P>) -> Self {
        Self { tree }
    }
}

impl<P> SpatialSet<P> {
    /// Create an empty set over a tree with the default cut policy.
    pub fn new(scheme: PartitionScheme, split_count: usize) -> Self {
        Tree::new(scheme, split_count).into()
    }

    /// Create an empty set with an explicit cut policy.
    pub fn with_policy(scheme: PartitionScheme, policy: PartitionPolicy, split_count: usize) -> Self {
        Tree::with_policy(scheme, policy, split_count).into()
    }

    /// Create an empty set whose root region is anchored to world bounds.
    pub fn with_world(
        scheme: PartitionScheme,
        policy: PartitionPolicy,
        split_count: usize,
        world: Rect,
    ) -> Self {
        Tree::with_world(scheme, policy, split_count, world).into()
    }

    /// The wrapped tree.
    pub fn tree(&self) -> &Tree<P> {
        &self.tree
    }

    /// Consume the set, returning the wrapped tree.
    pub fn into_tree(self) -> Tree<P> {
        self.tree
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Insert an entity. See [`Tree::insert`].
    ///
    /// # Errors
    ///
    /// Propagates [`Tree::insert`] errors.
    pub fn insert(&mut self, payload: P, bounds: Rect, flags: EntityFlags) -> Result<EntityKey, Error> {
        self.tree.insert(payload, bounds, flags)
    }

    /// Remove an entity, returning its payload. See [`Tree::remove`].
    ///
    /// # Errors
    ///
    /// Propagates [`Tree::remove`] errors.
    pub fn remove(&mut self, key: EntityKey) -> Result<P, Error> {
        self.tree.remove(key)
    }

    /// Move a mobile entity. See [`Tree::relocate`].
    ///
    /// # Errors
    ///
    /// Propagates [`Tree::relocate`] errors.
    pub fn relocate(&mut self, key: EntityKey, new_bounds: Rect) -> Result<(), Error> {
        self.tree.relocate(key, new_bounds)
    }

    /// Remove every entity.
    pub fn clear(&mut self) {
        self.tree.clear();
    }

    /// Recompute pending cached bounds. See [`Tree::flush`].
    ///
    /// # Errors
    ///
    /// Propagates [`Tree::flush`] errors.
    pub fn flush(&mut self) -> Result<FlushReport, Error> {
        self.tree.flush()
    }

    /// Payload of a live entity.
    pub fn get(&self, key: EntityKey) -> Option<&P> {
        self.tree.get(key)
    }

    /// Mutable payload of a live entity.
    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut P> {
        self.tree.get_mut(key)
    }

    /// Bounds of a live entity.
    pub fn bounds_of(&self, key: EntityKey) -> Option<Rect> {
        self.tree.bounds_of(key)
    }

    /// Union of every entity bound, or `None` for an empty set.
    pub fn bounds(&self) -> Option<Rect> {
        self.tree.root().and_then(|r| self.tree.bounds(r))
    }

    /// Iterate all entities as `(key, payload)` in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityKey, &P)> + '_ {
        self.tree.iter()
    }

    /// Collect every entity key.
    pub fn to_vec(&self) -> Vec<EntityKey> {
        self.tree.keys().collect()
    }

    /// Register a bound-change listener. See [`Tree::on_bounds_updated`].
    pub fn on_bounds_updated(
        &mut self,
        listener: impl FnMut(NodeId, Option<Rect>) + 'static,
    ) -> ListenerKey {
        self.tree.on_bounds_updated(listener)
    }

    /// Deregister a listener. See [`Tree::remove_listener`].
    pub fn remove_listener(&mut self, key: ListenerKey) -> bool {
        self.tree.remove_listener(key)
    }

    /// Iterate entities whose bounds intersect `rect` (edge-inclusive).
    ///
    /// The iterator is lazy and finite; create a new one to restart. Subtrees
    /// whose bounds miss the rect are skipped without descending.
    pub fn query(&self, rect: Rect) -> Query<'_, P> {
        Query::new(&self.tree, rect)
    }

    /// Tree-guided membership check: descends by classification from the
    /// root. Equivalent to [`SpatialSet::slow_contains`] as long as owner
    /// back-references and placement agree; the slow variant is the ground
    /// truth when debugging that agreement.
    pub fn contains(&self, key: EntityKey) -> bool {
        let Some(b) = self.tree.bounds_of(key) else {
            return false;
        };
        let Some(mut id) = self.tree.root() else {
            return false;
        };
        loop {
            if self.tree.node_entities(id).contains(&key) {
                return true;
            }
            match self.tree.classify_child(id, b) {
                Some(c) => id = c,
                None => return false,
            }
        }
    }

    /// Exhaustive membership check: scans every node's entity list.
    pub fn slow_contains(&self, key: EntityKey) -> bool {
        let Some(root) = self.tree.root() else {
            return false;
        };
        let mut stack: Vec<NodeId> = Vec::new();
        stack.push(root);
        while let Some(id) = stack.pop() {
            if self.tree.node_entities(id).contains(&key) {
                return true;
            }
            stack.extend(self.tree.children_of(id));
        }
        false
    }

    /// The entity nearest to `target` by axis-aligned box distance (zero for
    /// boxes containing the point).
    ///
    /// Branch-and-bound over the node bounds, visiting the closest child
    /// first and skipping subtrees that cannot beat the current best.
    /// Candidates whose squared distance is within [`DISTANCE_EPSILON`] of
    /// the best tie, and the earliest-inserted entity wins, so the result is
    /// deterministic under floating-point noise.
    pub fn nearest(&self, target: Point) -> Option<(EntityKey, &P)> {
        let root = self.tree.root()?;
        let mut best: Option<Best> = None;
        self.nearest_in(root, target, &mut best);
        let key = best?.key;
        Some((key, self.tree.get(key).expect("best key is live")))
    }

    fn nearest_in(&self, id: NodeId, target: Point, best: &mut Option<Best>) {
        for &k in self.tree.node_entities(id) {
            let b = self.tree.bounds_of(k).expect("owned key is live");
            let dist = min_dist_sq(target, b);
            let rank = self.tree.order_of(k).expect("owned key is live");
            let improved = match *best {
                None => true,
                Some(cur) => {
                    dist + DISTANCE_EPSILON < cur.dist
                        || (dist <= cur.dist + DISTANCE_EPSILON && rank < cur.rank)
                }
            };
            if improved {
                *best = Some(Best { dist, rank, key: k });
            }
        }
        let mut kids: SmallVec<[(f64, NodeId); 5]> = SmallVec::new();
        for c in self.tree.children_of(id) {
            if let Some(cb) = self.tree.bounds(c) {
                kids.push((min_dist_sq(target, cb), c));
            }
        }
        kids.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(core::cmp::Ordering::Equal));
        for (dist, c) in kids {
            if let Some(cur) = *best
                && dist > cur.dist + DISTANCE_EPSILON
            {
                break;
            }
            self.nearest_in(c, target, best);
        }
    }
}

#[derive(Copy, Clone)]
struct Best {
    dist: f64,
    rank: u64,
    key: EntityKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use thicket_tree::TreeBuilder;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Rect {
        Rect::new(x0, y0, x1, y1)
    }

    /// Splitmix-style deterministic generator, good enough for scattering
    /// boxes without pulling in a random-number dependency.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0
        }

        /// Uniform in `[0, 1)`.
        #[allow(clippy::cast_precision_loss, reason = "53 bits fit f64 exactly")]
        fn unit(&mut self) -> f64 {
            (self.next() >> 11) as f64 / (1_u64 << 53) as f64
        }
    }

    const ALL_SCHEMES: [PartitionScheme; 4] = [
        PartitionScheme::Bsp,
        PartitionScheme::IcosepBsp,
        PartitionScheme::Quad,
        PartitionScheme::IcosepQuad,
    ];

    fn scattered(scheme: PartitionScheme, n: i32, seed: u64) -> (SpatialSet<i32>, Vec<(EntityKey, Rect)>) {
        let mut set = SpatialSet::new(scheme, 3);
        let mut rng = Rng(seed);
        let mut placed = vec![];
        for i in 0..n {
            let x = rng.unit() * 100.0;
            let y = rng.unit() * 100.0;
            let b = rect(x, y, x + rng.unit() * 8.0, y + rng.unit() * 8.0);
            let k = set.insert(i, b, EntityFlags::empty()).unwrap();
            placed.push((k, b));
        }
        (set, placed)
    }

    #[test]
    fn three_box_scenario() {
        for scheme in ALL_SCHEMES {
            let mut set = SpatialSet::new(scheme, 1);
            let a = set.insert("a", rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
            let b = set.insert("b", rect(5.0, 5.0, 6.0, 6.0), EntityFlags::empty()).unwrap();
            let c = set.insert("c", rect(2.0, 2.0, 3.0, 3.0), EntityFlags::empty()).unwrap();
            assert_eq!(set.len(), 3, "{scheme:?}");
            let mut hits: Vec<EntityKey> =
                set.query(rect(0.0, 0.0, 4.0, 4.0)).map(|(k, _)| k).collect();
            hits.sort_unstable_by_key(|&k| set.tree().order_of(k));
            assert_eq!(hits, [a, c], "{scheme:?}");
            assert_eq!(set.nearest(Point::new(2.5, 2.5)), Some((c, &"c")), "{scheme:?}");
            assert!(set.contains(b));
        }
    }

    #[test]
    fn query_matches_brute_force() {
        for scheme in ALL_SCHEMES {
            let (set, placed) = scattered(scheme, 60, 0x5eed);
            let mut rng = Rng(0xfeed);
            for _ in 0..25 {
                let x = rng.unit() * 110.0 - 5.0;
                let y = rng.unit() * 110.0 - 5.0;
                let q = rect(x, y, x + rng.unit() * 40.0, y + rng.unit() * 40.0);
                let mut expected: Vec<i32> = placed
                    .iter()
                    .filter(|(_, b)| crate::util::overlaps(*b, q))
                    .map(|(k, _)| *set.get(*k).unwrap())
                    .collect();
                let mut got: Vec<i32> = set.query(q).map(|(_, p)| *p).collect();
                expected.sort_unstable();
                got.sort_unstable();
                assert_eq!(got, expected, "{scheme:?} query {q:?}");
            }
        }
    }

    #[test]
    fn query_is_sound_before_flush() {
        // No flush anywhere: pruning must not trust stale caches.
        let (mut set, placed) = scattered(PartitionScheme::IcosepQuad, 30, 0xabc);
        let (k0, _) = placed[0];
        set.relocate(k0, rect(200.0, 200.0, 201.0, 201.0)).unwrap_err();
        // Static entities refuse relocation; remove and reinsert instead.
        set.remove(k0).unwrap();
        let far = set.insert(999, rect(200.0, 200.0, 201.0, 201.0), EntityFlags::empty()).unwrap();
        let hits: Vec<EntityKey> =
            set.query(rect(199.0, 199.0, 202.0, 202.0)).map(|(k, _)| k).collect();
        assert_eq!(hits, [far]);
    }

    #[test]
    fn nearest_matches_brute_force() {
        for scheme in ALL_SCHEMES {
            let (set, placed) = scattered(scheme, 50, 0xdead);
            let mut rng = Rng(0xbeef);
            for _ in 0..25 {
                let target = Point::new(rng.unit() * 120.0 - 10.0, rng.unit() * 120.0 - 10.0);
                let best_dist = placed
                    .iter()
                    .map(|&(_, b)| min_dist_sq(target, b))
                    .fold(f64::INFINITY, f64::min);
                let (key, _) = set.nearest(target).unwrap();
                let got_dist = min_dist_sq(target, set.bounds_of(key).unwrap());
                assert!(
                    got_dist <= best_dist + DISTANCE_EPSILON,
                    "{scheme:?} target {target:?}: {got_dist} vs {best_dist}"
                );
            }
        }
    }

    #[test]
    fn nearest_tie_goes_to_earliest_insert() {
        let mut set = SpatialSet::new(PartitionScheme::Bsp, 1);
        // Equidistant from the target, inserted in this order.
        let first = set.insert("first", rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        set.insert("second", rect(3.0, 0.0, 4.0, 1.0), EntityFlags::empty()).unwrap();
        let target = Point::new(2.0, 0.5);
        assert_eq!(set.nearest(target), Some((first, &"first")));
    }

    #[test]
    fn nearest_on_empty_set() {
        let set: SpatialSet<i32> = SpatialSet::new(PartitionScheme::Quad, 4);
        assert_eq!(set.nearest(Point::new(0.0, 0.0)), None);
        assert_eq!(set.query(rect(0.0, 0.0, 10.0, 10.0)).count(), 0);
        assert_eq!(set.bounds(), None);
    }

    #[test]
    fn contains_agrees_with_slow_contains() {
        for scheme in ALL_SCHEMES {
            let (mut set, placed) = scattered(scheme, 40, 0x777);
            // Remove a third to create stale keys and pruned branches.
            let mut removed = vec![];
            for (i, &(k, _)) in placed.iter().enumerate() {
                if i % 3 == 0 {
                    set.remove(k).unwrap();
                    removed.push(k);
                }
            }
            for &(k, _) in &placed {
                assert_eq!(set.contains(k), set.slow_contains(k), "{scheme:?}");
            }
            for &k in &removed {
                assert!(!set.contains(k), "{scheme:?}");
            }
            for k in set.to_vec() {
                assert!(set.contains(k), "{scheme:?}");
            }
        }
    }

    #[test]
    fn built_tree_queries_through_the_set() {
        let mut builder = TreeBuilder::new(PartitionScheme::IcosepQuad).with_split_count(2);
        for i in 0..12_i32 {
            let x = f64::from(i % 4) * 10.0;
            let y = f64::from(i / 4) * 10.0;
            builder.insert(i, rect(x, y, x + 2.0, y + 2.0), EntityFlags::empty()).unwrap();
        }
        let (tree, keys) = builder.build();
        let set: SpatialSet<i32> = tree.into();
        assert_eq!(set.len(), 12);
        let hits: Vec<i32> = set.query(rect(0.0, 0.0, 5.0, 5.0)).map(|(_, p)| *p).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], 0);
        assert!(keys.iter().all(|&k| set.contains(k)));
    }

    #[test]
    fn aggregates_and_clear() {
        let mut set = SpatialSet::new(PartitionScheme::Quad, 2);
        set.insert(1, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        set.insert(2, rect(4.0, 4.0, 5.0, 5.0), EntityFlags::empty()).unwrap();
        assert_eq!(set.bounds(), Some(rect(0.0, 0.0, 5.0, 5.0)));
        assert_eq!(set.to_vec().len(), 2);
        assert_eq!(set.iter().count(), 2);
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.bounds(), None);
    }

    #[test]
    fn listener_passthrough() {
        use alloc::rc::Rc;
        use core::cell::Cell;
        let mut set = SpatialSet::new(PartitionScheme::Bsp, 2);
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let lk = set.on_bounds_updated(move |_, _| flag.set(true));
        set.insert(1, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        set.flush().unwrap();
        assert!(fired.get());
        assert!(set.remove_listener(lk));
    }
}
