// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core tree implementation: arena storage, placement, deferred bound refresh.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;

use hashbrown::HashSet;
use kurbo::{Point, Rect};
use smallvec::{SmallVec, smallvec};

use crate::error::Error;
use crate::partition::{PartitionField, PartitionPolicy, PartitionScheme};
use crate::refresh::FlushReport;
use crate::types::{EntityFlags, EntityKey, NodeId};
use crate::util::{is_valid_bounds, union_opt};

/// A bound-change listener. Invoked from [`Tree::flush`] with the node whose
/// cached bound changed and its new value (`None` for an emptied subtree).
pub type BoundsListener = Box<dyn FnMut(NodeId, Option<Rect>)>;

/// Key returned by [`Tree::on_bounds_updated`], used to deregister the
/// listener via [`Tree::remove_listener`]. Each key deregisters at most one
/// listener; a key is spent once removed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ListenerKey(usize);

#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) generation: u32,
    pub(crate) parent: Option<NodeId>,
    /// Fixed-arity child slots, indexed by classification slot. Absent
    /// children are created lazily on first placement.
    pub(crate) children: SmallVec<[Option<NodeId>; 5]>,
    /// Entities owned by this node, in insertion order. Non-empty only on
    /// unsplit nodes and icosep buckets.
    pub(crate) entities: Vec<EntityKey>,
    /// Coverage region anchoring cut geometry. Entity bounds may exceed it.
    pub(crate) region: Rect,
    /// Cut geometry, present once the node has subdivided.
    pub(crate) field: Option<PartitionField>,
    /// Cached union of the subtree's entity bounds; `None` means empty.
    /// Only trustworthy while `dirty` is false.
    pub(crate) cached: Option<Rect>,
    pub(crate) dirty: bool,
    /// True for straddler buckets: they hold unbounded entity lists and
    /// never subdivide.
    pub(crate) icosep: bool,
}

impl Node {
    fn new(generation: u32, region: Rect, icosep: bool, parent: Option<NodeId>, arity: usize) -> Self {
        Self {
            generation,
            parent,
            children: smallvec![None; arity],
            entities: Vec::new(),
            region,
            field: None,
            cached: None,
            dirty: false,
            icosep,
        }
    }
}

#[derive(Clone, Debug)]
struct Entry<P> {
    generation: u32,
    bounds: Rect,
    flags: EntityFlags,
    /// The node whose entity list holds this entry. Kept in lockstep with
    /// placement so removal and relocation are O(1) lookups.
    owner: NodeId,
    /// Monotonic insertion rank; survives relocation.
    seq: u64,
    payload: P,
}

/// A 2D spatial-partition tree indexing entities by axis-aligned bounding box.
///
/// The branching shape is fixed at construction via [`PartitionScheme`]; cut
/// placement follows a [`PartitionPolicy`]. Entities are opaque payloads plus
/// a caller-supplied [`Rect`]; the tree never inspects payloads.
///
/// Structural mutation is immediate, but cached per-node bounds are refreshed
/// lazily: mutations record the affected path in a pending set and
/// [`Tree::flush`] recomputes the dirty nodes bottom-up in one pass,
/// reporting a [`FlushReport`] and notifying registered listeners. Reads via
/// [`Tree::bounds`] are sound at any time; a dirty node is recomputed
/// transiently instead of served from its cache.
///
/// ## Example
///
/// ```rust
/// use kurbo::Rect;
/// use thicket_tree::{EntityFlags, PartitionScheme, Tree};
///
/// let mut tree = Tree::new(PartitionScheme::Quad, 4);
/// let key = tree.insert("a", Rect::new(0.0, 0.0, 1.0, 1.0), EntityFlags::empty())?;
/// tree.flush()?;
/// assert_eq!(tree.bounds_of(key), Some(Rect::new(0.0, 0.0, 1.0, 1.0)));
/// # Ok::<(), thicket_tree::Error>(())
/// ```
pub struct Tree<P> {
    /// slots
    nodes: Vec<Option<Node>>,
    /// last generation per node slot (persists across frees)
    node_generations: Vec<u32>,
    node_free: Vec<usize>,
    entries: Vec<Option<Entry<P>>>,
    entry_generations: Vec<u32>,
    entry_free: Vec<usize>,
    root: Option<NodeId>,
    scheme: PartitionScheme,
    policy: PartitionPolicy,
    split_count: usize,
    world: Option<Rect>,
    /// Nodes whose cached bound needs recomputation on the next flush.
    pending: HashSet<NodeId>,
    /// Set during flush and bulk build; mutations fail fast while it holds.
    refreshing: bool,
    listeners: Vec<Option<BoundsListener>>,
    len: usize,
    next_seq: u64,
}

impl<P> core::fmt::Debug for Tree<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let nodes_alive = self.nodes.iter().filter(|n| n.is_some()).count();
        f.debug_struct("Tree")
            .field("scheme", &self.scheme)
            .field("policy", &self.policy)
            .field("split_count", &self.split_count)
            .field("len", &self.len)
            .field("nodes_alive", &nodes_alive)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<P> Tree<P> {
    /// Create an empty tree with the default cut policy
    /// ([`PartitionPolicy::LongestAxis`]) and no world bounds.
    ///
    /// `split_count` is the number of entities an unsplit node holds before
    /// it subdivides; it is clamped to at least 1.
    pub fn new(scheme: PartitionScheme, split_count: usize) -> Self {
        Self::configured(scheme, PartitionPolicy::default(), split_count, None)
    }

    /// Create an empty tree with an explicit cut policy.
    pub fn with_policy(scheme: PartitionScheme, policy: PartitionPolicy, split_count: usize) -> Self {
        Self::configured(scheme, policy, split_count, None)
    }

    /// Create an empty tree whose root region is anchored to known world
    /// bounds instead of the first inserted entity.
    ///
    /// Entities outside the world bounds are still indexed correctly
    /// (classification is total); only cut placement quality degrades.
    pub fn with_world(
        scheme: PartitionScheme,
        policy: PartitionPolicy,
        split_count: usize,
        world: Rect,
    ) -> Self {
        Self::configured(scheme, policy, split_count, Some(world))
    }

    pub(crate) fn configured(
        scheme: PartitionScheme,
        policy: PartitionPolicy,
        split_count: usize,
        world: Option<Rect>,
    ) -> Self {
        Self {
            nodes: Vec::new(),
            node_generations: Vec::new(),
            node_free: Vec::new(),
            entries: Vec::new(),
            entry_generations: Vec::new(),
            entry_free: Vec::new(),
            root: None,
            scheme,
            policy,
            split_count: split_count.max(1),
            world,
            pending: HashSet::new(),
            refreshing: false,
            listeners: Vec::new(),
            len: 0,
            next_seq: 0,
        }
    }

    /// The branching shape fixed at construction.
    pub fn scheme(&self) -> PartitionScheme {
        self.scheme
    }

    /// The cut-placement policy fixed at construction.
    pub fn policy(&self) -> PartitionPolicy {
        self.policy
    }

    /// Entities an unsplit node holds before subdividing.
    pub fn split_count(&self) -> usize {
        self.split_count
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the tree holds no entities.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The root node, or `None` for an empty tree.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    // --- entity operations ---

    /// Insert an entity, returning its key.
    ///
    /// Descends by classification, creating children lazily. A full unsplit
    /// node subdivides and redistributes its entities; if no cut separates
    /// them (for example identical boxes) the node keeps appending instead.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBounds`] for non-finite or inverted bounds,
    /// [`Error::Reentrant`] during a flush or bulk build.
    pub fn insert(&mut self, payload: P, bounds: Rect, flags: EntityFlags) -> Result<EntityKey, Error> {
        if self.refreshing {
            return Err(Error::Reentrant);
        }
        if !is_valid_bounds(bounds) {
            return Err(Error::InvalidBounds);
        }
        let root = self.ensure_root(bounds);
        let target = self.place(root, bounds);
        let key = self.alloc_entry(payload, bounds, flags, target);
        self.node_mut(target).entities.push(key);
        self.len += 1;
        self.mark_dirty(target);
        Ok(key)
    }

    /// Remove an entity, returning its payload.
    ///
    /// The key becomes stale immediately. Emptied childless nodes are pruned
    /// up the parent chain; removing the last entity frees the root.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for stale keys, [`Error::Reentrant`] during a
    /// flush or bulk build.
    pub fn remove(&mut self, key: EntityKey) -> Result<P, Error> {
        if self.refreshing {
            return Err(Error::Reentrant);
        }
        if self.entry(key).is_none() {
            return Err(Error::NotFound);
        }
        let entry = self.entries[key.idx()].take().expect("dangling EntityKey");
        self.entry_free.push(key.idx());
        let owner = entry.owner;
        self.node_mut(owner).entities.retain(|&k| k != key);
        self.len -= 1;
        self.mark_dirty(owner);
        self.prune(owner);
        Ok(entry.payload)
    }

    /// Move a mobile entity to new bounds.
    ///
    /// Detaches from the owning node, re-descends from the root, and marks
    /// both the old and the new path dirty. The key stays valid.
    ///
    /// # Errors
    ///
    /// [`Error::NotMobile`] for entities inserted without
    /// [`EntityFlags::MOBILE`], [`Error::InvalidBounds`],
    /// [`Error::NotFound`], and [`Error::Reentrant`] as for the other
    /// operations.
    pub fn relocate(&mut self, key: EntityKey, new_bounds: Rect) -> Result<(), Error> {
        if self.refreshing {
            return Err(Error::Reentrant);
        }
        if !is_valid_bounds(new_bounds) {
            return Err(Error::InvalidBounds);
        }
        let Some(e) = self.entry(key) else {
            return Err(Error::NotFound);
        };
        if !e.flags.contains(EntityFlags::MOBILE) {
            return Err(Error::NotMobile);
        }
        let old_owner = e.owner;
        self.entries[key.idx()]
            .as_mut()
            .expect("dangling EntityKey")
            .bounds = new_bounds;
        self.node_mut(old_owner).entities.retain(|&k| k != key);
        self.mark_dirty(old_owner);
        let root = self.root.expect("live entity implies a root");
        let target = self.place(root, new_bounds);
        self.node_mut(target).entities.push(key);
        self.entries[key.idx()]
            .as_mut()
            .expect("dangling EntityKey")
            .owner = target;
        self.mark_dirty(target);
        if target != old_owner {
            self.prune(old_owner);
        }
        Ok(())
    }

    /// Remove every entity and node. Keys and node identifiers issued before
    /// the call become stale; listeners stay registered.
    pub fn clear(&mut self) {
        for (i, slot) in self.nodes.iter_mut().enumerate() {
            if slot.take().is_some() {
                self.node_free.push(i);
            }
        }
        for (i, slot) in self.entries.iter_mut().enumerate() {
            if slot.take().is_some() {
                self.entry_free.push(i);
            }
        }
        self.root = None;
        self.pending.clear();
        self.len = 0;
    }

    // --- entity accessors ---

    /// True if `key` names a live entity.
    pub fn contains_key(&self, key: EntityKey) -> bool {
        self.entry(key).is_some()
    }

    /// Payload of a live entity, or `None` for stale keys.
    pub fn get(&self, key: EntityKey) -> Option<&P> {
        self.entry(key).map(|e| &e.payload)
    }

    /// Mutable payload of a live entity, or `None` for stale keys.
    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut P> {
        self.entry_mut(key).map(|e| &mut e.payload)
    }

    /// Bounds of a live entity, or `None` for stale keys.
    pub fn bounds_of(&self, key: EntityKey) -> Option<Rect> {
        self.entry(key).map(|e| e.bounds)
    }

    /// Flags of a live entity, or `None` for stale keys.
    pub fn flags_of(&self, key: EntityKey) -> Option<EntityFlags> {
        self.entry(key).map(|e| e.flags)
    }

    /// The node whose entity list holds a live entity.
    pub fn owner_of(&self, key: EntityKey) -> Option<NodeId> {
        self.entry(key).map(|e| e.owner)
    }

    /// Monotonic insertion rank of a live entity: later inserts have larger
    /// ranks, and relocation preserves the rank. Used by query layers as a
    /// deterministic tie-break.
    pub fn order_of(&self, key: EntityKey) -> Option<u64> {
        self.entry(key).map(|e| e.seq)
    }

    /// Iterate live entities as `(key, payload)` in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityKey, &P)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref().map(|e| {
                #[allow(
                    clippy::cast_possible_truncation,
                    reason = "EntityKey uses 32-bit indices by design."
                )]
                let key = EntityKey::new(i as u32, e.generation);
                (key, &e.payload)
            })
        })
    }

    /// Iterate live entity keys in arena order.
    pub fn keys(&self) -> impl Iterator<Item = EntityKey> + '_ {
        self.iter().map(|(k, _)| k)
    }

    // --- node accessors ---

    /// True if `id` refers to a live node.
    ///
    /// A `NodeId` is live if its slot is occupied and the generation matches.
    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.idx())
            .and_then(|n| n.as_ref())
            .map(|n| n.generation == id.1)
            .unwrap_or(false)
    }

    /// Entities owned by a live node, in insertion order. Empty for stale
    /// identifiers and for subdivided nodes.
    pub fn node_entities(&self, id: NodeId) -> &[EntityKey] {
        if !self.is_alive(id) {
            return &[];
        }
        &self.node(id).entities
    }

    /// Iterate the present children of a live node in slot order.
    pub fn children_of(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let slots: &[Option<NodeId>] = if self.is_alive(id) {
            &self.node(id).children
        } else {
            &[]
        };
        slots.iter().filter_map(|c| *c)
    }

    /// Child of a live node at a classification slot, if present.
    pub fn child_at(&self, id: NodeId, slot: usize) -> Option<NodeId> {
        if !self.is_alive(id) {
            return None;
        }
        self.node(id).children.get(slot).copied().flatten()
    }

    /// The child a box would descend into from a subdivided node, if that
    /// child exists. `None` for leaves, absent children, and stale ids.
    pub fn classify_child(&self, id: NodeId, rect: Rect) -> Option<NodeId> {
        if !self.is_alive(id) {
            return None;
        }
        let n = self.node(id);
        let field = n.field?;
        let slot = field.classify(self.scheme, rect);
        n.children.get(slot).copied().flatten()
    }

    // --- bound maintenance ---

    /// Bounds of a node's subtree: the union of every entity bound below it,
    /// or `None` for an empty subtree (and for stale identifiers).
    ///
    /// Clean nodes are served from the cache; dirty nodes are recomputed on
    /// the fly without mutation, so the result is always fully computed,
    /// never a partially-updated cache. Call [`Tree::flush`] to make the
    /// cached fast path available again after mutations.
    pub fn bounds(&self, id: NodeId) -> Option<Rect> {
        if !self.is_alive(id) {
            return None;
        }
        self.compute_bounds(id)
    }

    /// Recompute the cached bounds of every pending node, deepest first, and
    /// notify listeners of each change.
    ///
    /// Change detection is exact equality on the cached value; listeners run
    /// only after every cache is committed, so a panicking listener cannot
    /// leave a half-updated tree.
    ///
    /// # Errors
    ///
    /// [`Error::Reentrant`] if a flush or bulk build is already in progress.
    pub fn flush(&mut self) -> Result<FlushReport, Error> {
        if self.refreshing {
            return Err(Error::Reentrant);
        }
        Ok(self.flush_inner())
    }

    pub(crate) fn flush_inner(&mut self) -> FlushReport {
        self.refreshing = true;
        let mut ids: Vec<NodeId> = self.pending.drain().collect();
        // Children before parents, so each recompute reads clean child caches.
        ids.sort_by_key(|&id| core::cmp::Reverse(self.depth(id)));
        let mut report = FlushReport::default();
        let mut notifications: Vec<(NodeId, Option<Rect>)> = Vec::new();
        for id in ids {
            let new = self.local_union(id);
            report.visited += 1;
            let n = self.node_mut(id);
            n.dirty = false;
            if n.cached != new {
                n.cached = new;
                report.changed += 1;
                notifications.push((id, new));
            }
        }
        self.refreshing = false;
        for (id, b) in notifications {
            for l in self.listeners.iter_mut().flatten() {
                l(id, b);
            }
        }
        report
    }

    /// Dirty every node, forcing full recomputation on the next flush or
    /// bounds read. The recovery path after external geometry changes, for
    /// example after deserializing entity data.
    pub fn invalidate_bounds(&mut self) {
        for (i, slot) in self.nodes.iter_mut().enumerate() {
            if let Some(n) = slot {
                n.dirty = true;
                #[allow(
                    clippy::cast_possible_truncation,
                    reason = "NodeId uses 32-bit indices by design."
                )]
                self.pending.insert(NodeId::new(i as u32, n.generation));
            }
        }
    }

    /// Register a bound-change listener, invoked from [`Tree::flush`] for
    /// each node whose cached bound changed. Returns a key for
    /// [`Tree::remove_listener`].
    ///
    /// Listeners run only after every cached bound is committed, so a
    /// panicking listener leaves the tree consistent and usable; the panic
    /// unwinds out of `flush`, and any notifications after the panicking one
    /// are skipped for that flush.
    pub fn on_bounds_updated(
        &mut self,
        listener: impl FnMut(NodeId, Option<Rect>) + 'static,
    ) -> ListenerKey {
        self.listeners.push(Some(Box::new(listener)));
        ListenerKey(self.listeners.len() - 1)
    }

    /// Deregister a listener. Returns false if the key was already spent.
    pub fn remove_listener(&mut self, key: ListenerKey) -> bool {
        self.listeners
            .get_mut(key.0)
            .and_then(|slot| slot.take())
            .is_some()
    }

    // --- internals ---

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.idx()].as_ref().expect("dangling NodeId")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.idx()].as_mut().expect("dangling NodeId")
    }

    fn entry(&self, key: EntityKey) -> Option<&Entry<P>> {
        self.entries
            .get(key.idx())
            .and_then(|e| e.as_ref())
            .filter(|e| e.generation == key.1)
    }

    fn entry_mut(&mut self, key: EntityKey) -> Option<&mut Entry<P>> {
        self.entries
            .get_mut(key.idx())
            .and_then(|e| e.as_mut())
            .filter(|e| e.generation == key.1)
    }

    pub(crate) fn alloc_node(
        &mut self,
        region: Rect,
        icosep: bool,
        parent: Option<NodeId>,
    ) -> NodeId {
        let arity = self.scheme.arity();
        let (idx, generation) = if let Some(idx) = self.node_free.pop() {
            let generation = self.node_generations[idx].saturating_add(1);
            self.node_generations[idx] = generation;
            self.nodes[idx] = Some(Node::new(generation, region, icosep, parent, arity));
            #[allow(
                clippy::cast_possible_truncation,
                reason = "NodeId uses 32-bit indices by design."
            )]
            (idx as u32, generation)
        } else {
            let generation = 1_u32;
            self.nodes.push(Some(Node::new(generation, region, icosep, parent, arity)));
            self.node_generations.push(generation);
            #[allow(
                clippy::cast_possible_truncation,
                reason = "NodeId uses 32-bit indices by design."
            )]
            ((self.nodes.len() - 1) as u32, generation)
        };
        NodeId::new(idx, generation)
    }

    fn free_node(&mut self, id: NodeId) {
        self.nodes[id.idx()] = None;
        self.node_free.push(id.idx());
        self.pending.remove(&id);
    }

    pub(crate) fn alloc_entry(
        &mut self,
        payload: P,
        bounds: Rect,
        flags: EntityFlags,
        owner: NodeId,
    ) -> EntityKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (idx, generation) = if let Some(idx) = self.entry_free.pop() {
            let generation = self.entry_generations[idx].saturating_add(1);
            self.entry_generations[idx] = generation;
            self.entries[idx] = Some(Entry {
                generation,
                bounds,
                flags,
                owner,
                seq,
                payload,
            });
            #[allow(
                clippy::cast_possible_truncation,
                reason = "EntityKey uses 32-bit indices by design."
            )]
            (idx as u32, generation)
        } else {
            let generation = 1_u32;
            self.entries.push(Some(Entry {
                generation,
                bounds,
                flags,
                owner,
                seq,
                payload,
            }));
            self.entry_generations.push(generation);
            #[allow(
                clippy::cast_possible_truncation,
                reason = "EntityKey uses 32-bit indices by design."
            )]
            ((self.entries.len() - 1) as u32, generation)
        };
        EntityKey::new(idx, generation)
    }

    pub(crate) fn set_root(&mut self, id: NodeId) {
        self.root = Some(id);
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len;
    }

    pub(crate) fn set_refreshing(&mut self, refreshing: bool) {
        self.refreshing = refreshing;
    }

    pub(crate) fn world(&self) -> Option<Rect> {
        self.world
    }

    pub(crate) fn set_field(&mut self, id: NodeId, field: PartitionField) {
        self.node_mut(id).field = Some(field);
    }

    pub(crate) fn set_entities(&mut self, id: NodeId, keys: Vec<EntityKey>) {
        for &k in &keys {
            self.entries[k.idx()].as_mut().expect("dangling EntityKey").owner = id;
        }
        self.node_mut(id).entities = keys;
    }

    pub(crate) fn node_region(&self, id: NodeId) -> Rect {
        self.node(id).region
    }

    pub(crate) fn node_is_icosep(&self, id: NodeId) -> bool {
        self.node(id).icosep
    }

    fn ensure_root(&mut self, bounds: Rect) -> NodeId {
        if let Some(r) = self.root {
            return r;
        }
        let region = self.world.unwrap_or(bounds);
        let root = self.alloc_node(region, false, None);
        self.root = Some(root);
        root
    }

    /// Descend from `from` to the node that should hold `bounds`, subdividing
    /// full nodes along the way.
    fn place(&mut self, from: NodeId, bounds: Rect) -> NodeId {
        let mut id = from;
        loop {
            if let Some(field) = self.node(id).field {
                let slot = field.classify(self.scheme, bounds);
                id = self.ensure_child(id, slot);
                continue;
            }
            let n = self.node(id);
            if n.icosep || n.entities.len() < self.split_count {
                return id;
            }
            if !self.subdivide(id, bounds) {
                // No cut separates the entities; keep appending.
                return id;
            }
        }
    }

    pub(crate) fn ensure_child(&mut self, parent: NodeId, slot: usize) -> NodeId {
        if let Some(c) = self.node(parent).children[slot] {
            return c;
        }
        let field = self.node(parent).field.expect("child slot on an unsplit node");
        let region = field.child_region(self.scheme, self.node(parent).region, slot);
        let icosep = self.scheme.icosep_slot() == Some(slot);
        let child = self.alloc_node(region, icosep, Some(parent));
        self.node_mut(parent).children[slot] = Some(child);
        child
    }

    /// Split a full node and redistribute its entities (plus the incoming
    /// box, which the caller re-classifies afterwards). Returns false if
    /// every candidate cut puts all boxes in a single slot.
    fn subdivide(&mut self, id: NodeId, incoming: Rect) -> bool {
        let region = self.node(id).region;
        let keys = self.node(id).entities.clone();
        let mut boxes: Vec<Rect> = Vec::with_capacity(keys.len() + 1);
        for &k in &keys {
            boxes.push(self.entries[k.idx()].as_ref().expect("dangling EntityKey").bounds);
        }
        boxes.push(incoming);
        let mut union = boxes[0];
        for &b in &boxes[1..] {
            union = union.union(b);
        }
        let Some(field) = self.select_split_field(region, union.center(), &boxes) else {
            return false;
        };
        self.node_mut(id).field = Some(field);
        let moved = mem::take(&mut self.node_mut(id).entities);
        for k in moved {
            let b = self.entries[k.idx()].as_ref().expect("dangling EntityKey").bounds;
            let slot = field.classify(self.scheme, b);
            let child = self.ensure_child(id, slot);
            self.node_mut(child).entities.push(k);
            self.entries[k.idx()].as_mut().expect("dangling EntityKey").owner = child;
            self.mark_dirty(child);
        }
        true
    }

    /// First candidate cut that spreads the boxes over more than one slot.
    pub(crate) fn select_split_field(
        &self,
        region: Rect,
        reference: Point,
        boxes: &[Rect],
    ) -> Option<PartitionField> {
        for field in PartitionField::candidates(self.scheme, self.policy, region, reference) {
            let mut slots = boxes.iter().map(|&b| field.classify(self.scheme, b));
            if let Some(first) = slots.next()
                && slots.any(|s| s != first)
            {
                return Some(field);
            }
        }
        None
    }

    /// Dirty `id` and each ancestor not already dirty, queueing them for the
    /// next flush. A dirty node implies dirty ancestors, so the walk stops at
    /// the first node already marked.
    pub(crate) fn mark_dirty(&mut self, id: NodeId) {
        if self.refreshing {
            return;
        }
        let mut cur = Some(id);
        while let Some(c) = cur {
            let n = self.node_mut(c);
            if n.dirty {
                break;
            }
            n.dirty = true;
            let parent = n.parent;
            self.pending.insert(c);
            cur = parent;
        }
    }

    /// Free emptied childless nodes up the parent chain.
    fn prune(&mut self, start: NodeId) {
        let mut id = start;
        loop {
            let n = self.node(id);
            if !n.entities.is_empty() || n.children.iter().any(|c| c.is_some()) {
                return;
            }
            let parent = n.parent;
            self.free_node(id);
            match parent {
                Some(p) => {
                    for slot in &mut self.node_mut(p).children {
                        if *slot == Some(id) {
                            *slot = None;
                        }
                    }
                    id = p;
                }
                None => {
                    self.root = None;
                    return;
                }
            }
        }
    }

    fn depth(&self, id: NodeId) -> usize {
        let mut d = 0;
        let mut cur = self.node(id).parent;
        while let Some(p) = cur {
            d += 1;
            cur = self.node(p).parent;
        }
        d
    }

    /// Union of a node's own entity bounds and its children's cached bounds.
    /// Valid during flush because children are processed first.
    fn local_union(&self, id: NodeId) -> Option<Rect> {
        let n = self.node(id);
        let mut acc = None;
        for &k in &n.entities {
            acc = union_opt(
                acc,
                self.entries[k.idx()].as_ref().expect("dangling EntityKey").bounds,
            );
        }
        for &c in n.children.iter().flatten() {
            if let Some(b) = self.node(c).cached {
                acc = union_opt(acc, b);
            }
        }
        acc
    }

    /// Cache-or-recompute: clean nodes read the cache, dirty nodes recurse.
    fn compute_bounds(&self, id: NodeId) -> Option<Rect> {
        let n = self.node(id);
        if !n.dirty {
            return n.cached;
        }
        let mut acc = None;
        for &k in &n.entities {
            acc = union_opt(
                acc,
                self.entries[k.idx()].as_ref().expect("dangling EntityKey").bounds,
            );
        }
        for &c in n.children.iter().flatten() {
            if let Some(b) = self.compute_bounds(c) {
                acc = union_opt(acc, b);
            }
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::RefCell;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Rect {
        Rect::new(x0, y0, x1, y1)
    }

    /// Union of all live entity bounds, computed without the tree structure.
    fn brute_union(tree: &Tree<i32>) -> Option<Rect> {
        let mut acc = None;
        for k in tree.keys() {
            acc = union_opt(acc, tree.bounds_of(k).unwrap());
        }
        acc
    }

    fn check_owner_invariant(tree: &Tree<i32>) {
        for k in tree.keys() {
            let owner = tree.owner_of(k).unwrap();
            assert!(
                tree.node_entities(owner).contains(&k),
                "owner list must contain the key"
            );
        }
    }

    #[test]
    fn insert_rejects_invalid_bounds() {
        let mut tree: Tree<i32> = Tree::new(PartitionScheme::Quad, 4);
        assert_eq!(
            tree.insert(0, rect(f64::NAN, 0.0, 1.0, 1.0), EntityFlags::empty()),
            Err(Error::InvalidBounds)
        );
        assert_eq!(
            tree.insert(0, rect(1.0, 0.0, 0.0, 1.0), EntityFlags::empty()),
            Err(Error::InvalidBounds)
        );
        assert!(tree.is_empty());
        assert_eq!(tree.root(), None);
    }

    #[test]
    fn insert_splits_and_keeps_owner_invariant() {
        let mut tree = Tree::new(PartitionScheme::Bsp, 1);
        let a = tree.insert(1, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        let b = tree.insert(2, rect(5.0, 5.0, 6.0, 6.0), EntityFlags::empty()).unwrap();
        let c = tree.insert(3, rect(2.0, 2.0, 3.0, 3.0), EntityFlags::empty()).unwrap();
        assert_eq!(tree.len(), 3);
        // Splitting moved entities off the root.
        let root = tree.root().unwrap();
        assert!(tree.node_entities(root).is_empty());
        assert!(tree.children_of(root).count() >= 2);
        check_owner_invariant(&tree);
        assert_eq!(tree.get(a), Some(&1));
        assert_eq!(tree.get(b), Some(&2));
        assert_eq!(tree.get(c), Some(&3));
    }

    #[test]
    fn identical_boxes_never_split() {
        let mut tree = Tree::new(PartitionScheme::Quad, 1);
        for i in 0..10 {
            tree.insert(i, rect(2.0, 2.0, 3.0, 3.0), EntityFlags::empty()).unwrap();
        }
        assert_eq!(tree.len(), 10);
        // No cut separates identical boxes, so the root keeps them all.
        let root = tree.root().unwrap();
        assert_eq!(tree.node_entities(root).len(), 10);
        assert_eq!(tree.children_of(root).count(), 0);
    }

    #[test]
    fn straddlers_land_in_the_icosep_bucket() {
        let mut tree = Tree::with_world(
            PartitionScheme::IcosepQuad,
            PartitionPolicy::Center,
            1,
            rect(0.0, 0.0, 10.0, 10.0),
        );
        tree.insert(1, rect(1.0, 1.0, 2.0, 2.0), EntityFlags::empty()).unwrap();
        tree.insert(2, rect(8.0, 8.0, 9.0, 9.0), EntityFlags::empty()).unwrap();
        // Straddles the center cut on both axes.
        let s = tree.insert(3, rect(4.0, 4.0, 6.0, 6.0), EntityFlags::empty()).unwrap();
        let root = tree.root().unwrap();
        let bucket_slot = PartitionScheme::IcosepQuad.icosep_slot().unwrap();
        let bucket = tree.child_at(root, bucket_slot).unwrap();
        assert!(tree.node_entities(bucket).contains(&s));
        check_owner_invariant(&tree);
    }

    #[test]
    fn remove_round_trips_to_empty() {
        let mut tree = Tree::new(PartitionScheme::IcosepBsp, 2);
        let mut keys = vec![];
        for i in 0..8 {
            let x = f64::from(i) * 3.0;
            keys.push(
                tree.insert(i, rect(x, 0.0, x + 1.0, 1.0), EntityFlags::empty()).unwrap(),
            );
        }
        for k in keys {
            let _ = tree.remove(k).unwrap();
        }
        assert!(tree.is_empty());
        assert_eq!(tree.root(), None);
        let report = tree.flush().unwrap();
        assert_eq!(report.changed, 0, "freed nodes must not report changes");
    }

    #[test]
    fn stale_keys_are_not_found() {
        let mut tree = Tree::new(PartitionScheme::Quad, 4);
        let k = tree.insert(7, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        assert_eq!(tree.remove(k), Ok(7));
        assert_eq!(tree.remove(k), Err(Error::NotFound));
        assert_eq!(tree.get(k), None);
        assert_eq!(tree.bounds_of(k), None);
        // Slot reuse must not resurrect the stale key.
        let k2 = tree.insert(8, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        assert_ne!(k, k2);
        assert_eq!(tree.get(k), None);
    }

    #[test]
    fn relocate_requires_mobility() {
        let mut tree = Tree::new(PartitionScheme::Quad, 4);
        let fixed = tree.insert(1, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        assert_eq!(
            tree.relocate(fixed, rect(5.0, 5.0, 6.0, 6.0)),
            Err(Error::NotMobile)
        );
        assert_eq!(tree.bounds_of(fixed), Some(rect(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn relocate_moves_and_preserves_key() {
        let mut tree = Tree::new(PartitionScheme::Bsp, 1);
        let m = tree.insert(1, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::MOBILE).unwrap();
        for i in 0..4 {
            let x = f64::from(i) * 4.0 + 8.0;
            tree.insert(10 + i, rect(x, 0.0, x + 1.0, 1.0), EntityFlags::empty()).unwrap();
        }
        tree.relocate(m, rect(20.0, 20.0, 21.0, 21.0)).unwrap();
        assert_eq!(tree.bounds_of(m), Some(rect(20.0, 20.0, 21.0, 21.0)));
        assert_eq!(tree.get(m), Some(&1));
        check_owner_invariant(&tree);
        // Order rank survives the move.
        assert_eq!(tree.order_of(m), Some(0));
    }

    #[test]
    fn bounds_are_sound_before_flush() {
        let mut tree = Tree::new(PartitionScheme::IcosepQuad, 2);
        for i in 0..12 {
            let x = f64::from(i % 4) * 5.0;
            let y = f64::from(i / 4) * 5.0;
            tree.insert(i, rect(x, y, x + 2.0, y + 2.0), EntityFlags::empty()).unwrap();
        }
        // No flush yet: dirty nodes recompute transiently.
        let root = tree.root().unwrap();
        assert_eq!(tree.bounds(root), brute_union(&tree));
        tree.flush().unwrap();
        assert_eq!(tree.bounds(root), brute_union(&tree));
    }

    #[test]
    fn flush_batches_shared_ancestors() {
        let mut tree = Tree::with_world(
            PartitionScheme::Quad,
            PartitionPolicy::Center,
            1,
            rect(0.0, 0.0, 100.0, 100.0),
        );
        for i in 0..8 {
            let x = f64::from(i) * 12.0;
            tree.insert(i, rect(x, x, x + 1.0, x + 1.0), EntityFlags::empty()).unwrap();
        }
        let first = tree.flush().unwrap();
        assert!(first.visited > 0);
        assert!(first.changed > 0);
        // Everything clean: a second flush visits nothing.
        let second = tree.flush().unwrap();
        assert_eq!(second, FlushReport::default());
        assert!(second.is_clean());
    }

    #[test]
    fn flush_is_reentrancy_guarded() {
        let mut tree: Tree<i32> = Tree::new(PartitionScheme::Quad, 4);
        tree.refreshing = true;
        assert_eq!(
            tree.insert(0, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()),
            Err(Error::Reentrant)
        );
        assert_eq!(tree.flush(), Err(Error::Reentrant));
        tree.refreshing = false;
        assert!(tree.insert(0, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).is_ok());
    }

    #[test]
    fn listeners_observe_committed_values() {
        let mut tree = Tree::new(PartitionScheme::Bsp, 1);
        let seen: Rc<RefCell<Vec<(NodeId, Option<Rect>)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let lk = tree.on_bounds_updated(move |id, b| sink.borrow_mut().push((id, b)));
        let root_bounds = rect(0.0, 0.0, 1.0, 1.0);
        tree.insert(1, root_bounds, EntityFlags::empty()).unwrap();
        tree.flush().unwrap();
        let root = tree.root().unwrap();
        assert_eq!(seen.borrow().as_slice(), &[(root, Some(root_bounds))]);
        // The notified value matches the committed cache.
        assert_eq!(tree.bounds(root), Some(root_bounds));
        seen.borrow_mut().clear();
        assert!(tree.remove_listener(lk));
        assert!(!tree.remove_listener(lk), "a listener key is spent on removal");
        tree.insert(2, rect(9.0, 9.0, 10.0, 10.0), EntityFlags::empty()).unwrap();
        tree.flush().unwrap();
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn panicking_listener_cannot_corrupt_the_tree() {
        extern crate std;
        use std::panic::{AssertUnwindSafe, catch_unwind};

        let mut tree = Tree::new(PartitionScheme::Bsp, 2);
        let bad = tree.on_bounds_updated(|_, _| panic!("listener failure"));
        let fired = Rc::new(RefCell::new(false));
        let sink = fired.clone();
        tree.on_bounds_updated(move |_, _| *sink.borrow_mut() = true);
        tree.insert(1, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        let unwound = catch_unwind(AssertUnwindSafe(|| {
            let _ = tree.flush();
        }));
        assert!(unwound.is_err(), "the listener panic propagates out of flush");
        // Caches were committed before any listener ran.
        let root = tree.root().unwrap();
        assert_eq!(tree.bounds(root), Some(rect(0.0, 0.0, 1.0, 1.0)));
        // Listeners registered after the panicking one were skipped.
        assert!(!*fired.borrow());
        // The tree stays fully usable; the refresh guard was not left set.
        assert!(tree.remove_listener(bad));
        tree.insert(2, rect(5.0, 5.0, 6.0, 6.0), EntityFlags::empty()).unwrap();
        tree.flush().unwrap();
        assert!(*fired.borrow());
    }

    #[test]
    fn unchanged_bounds_do_not_notify() {
        let mut tree = Tree::new(PartitionScheme::Quad, 4);
        let count = Rc::new(RefCell::new(0_usize));
        let sink = count.clone();
        tree.on_bounds_updated(move |_, _| *sink.borrow_mut() += 1);
        let a = tree.insert(1, rect(0.0, 0.0, 5.0, 5.0), EntityFlags::MOBILE).unwrap();
        tree.insert(2, rect(1.0, 1.0, 2.0, 2.0), EntityFlags::empty()).unwrap();
        tree.flush().unwrap();
        let after_insert = *count.borrow();
        assert!(after_insert > 0);
        // Moving the inner entity inside the outer one leaves the union as-is.
        tree.relocate(a, rect(0.0, 0.0, 5.0, 5.0)).unwrap();
        tree.flush().unwrap();
        assert_eq!(*count.borrow(), after_insert);
    }

    #[test]
    fn invalidate_bounds_forces_recomputation() {
        let mut tree = Tree::new(PartitionScheme::Quad, 2);
        for i in 0..6 {
            let x = f64::from(i) * 4.0;
            tree.insert(i, rect(x, 0.0, x + 1.0, 1.0), EntityFlags::empty()).unwrap();
        }
        tree.flush().unwrap();
        tree.invalidate_bounds();
        let report = tree.flush().unwrap();
        let alive = tree.nodes.iter().filter(|n| n.is_some()).count();
        assert_eq!(report.visited, alive);
        assert_eq!(report.changed, 0, "recomputation from unchanged data");
    }

    #[test]
    fn clear_stales_all_handles() {
        let mut tree = Tree::new(PartitionScheme::IcosepQuad, 2);
        let k = tree.insert(1, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        let root = tree.root().unwrap();
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.root(), None);
        assert_eq!(tree.get(k), None);
        assert!(!tree.is_alive(root));
        // Reuse after clear issues fresh generations.
        let k2 = tree.insert(2, rect(0.0, 0.0, 1.0, 1.0), EntityFlags::empty()).unwrap();
        assert_ne!(k, k2);
    }

    #[test]
    fn deep_split_keeps_membership() {
        // Each box lands one level deeper along the north-east branch.
        let mut tree = Tree::with_world(
            PartitionScheme::Quad,
            PartitionPolicy::Center,
            1,
            rect(0.0, 0.0, 64.0, 64.0),
        );
        let boxes = [
            rect(1.0, 1.0, 2.0, 2.0),
            rect(62.0, 62.0, 63.0, 63.0),
            rect(33.0, 33.0, 34.0, 34.0),
            rect(47.0, 47.0, 48.0, 48.0),
        ];
        let mut keys = vec![];
        for (i, b) in (0_i32..).zip(boxes) {
            keys.push(tree.insert(i, b, EntityFlags::empty()).unwrap());
        }
        assert_eq!(tree.len(), 4);
        check_owner_invariant(&tree);
        let root = tree.root().unwrap();
        // The north-east quadrant subdivided again.
        let ne = tree.child_at(root, 3).unwrap();
        assert!(tree.children_of(ne).count() >= 2);
        assert_eq!(tree.bounds(root), brute_union(&tree));
        for k in keys {
            tree.remove(k).unwrap();
        }
        assert_eq!(tree.root(), None);
    }
}
