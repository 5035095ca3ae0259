//! Address-set database: the allocator behind both server pools and the
//! client's local holdings.
//!
//! The database partitions one address pool into contiguous entries kept in
//! a 2-3 tree ordered by start address. Every pool address belongs to
//! exactly one entry at all times; allocating carves an entry out of a free
//! one and releasing merges it back, so the tree never has gaps or
//! overlaps. Free entries are additionally linked into a circular list used
//! for best-fit searches.
//!
//! Nodes and entries live in index-addressed arenas. Structural tree
//! operations hand the (possibly new) root back to the caller instead of
//! patching it through parent pointers.
//!
//! Allocated entries carry a caller-supplied tag and expire through an
//! embedded [`TimerQueue`]; [`SetDatabase::poll`] frees whatever is due and
//! coalesces it with free neighbors.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::addrset::{AddrInterval, IntervalForm};
use crate::timer::TimerQueue;

/// Handle to one database entry. Stable for the entry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeId(usize);

/// Where an entry currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// Member of the circular free list.
    Free { prev: EntryId, next: EntryId },
    /// Held (reserved, assigned, or excluded) with a pending expiry timer.
    Allocated,
    /// In neither place; transient during restructuring.
    Detached,
}

struct Entry {
    span: AddrInterval,
    tag: u64,
    reserved: bool,
    location: Location,
}

struct Node {
    parent: Option<NodeId>,
    /// A node with one entry uses slots 0 and 2; the middle slot is only
    /// occupied alongside a second entry.
    children: [Option<NodeId>; 3],
    first: EntryId,
    second: Option<EntryId>,
}

/// Lease state of a queried span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    Free,
    Reserved,
    Assigned,
    /// The span does not lie within a single entry.
    Invalid,
}

/// Result of [`SetDatabase::status`].
#[derive(Debug, Clone, Copy)]
pub struct SpanStatus {
    pub state: SpanState,
    pub tag: u64,
    /// Remaining seconds; for assigned entries one less than the timer, so
    /// the holder's own renewal always wins the race against expiry.
    pub lifetime: u16,
    /// Whether the queried span coincides exactly with the entry.
    pub identical: bool,
    pub entry: Option<EntryId>,
}

pub struct SetDatabase {
    pool: AddrInterval,
    nodes: Vec<Node>,
    node_slots: Vec<usize>,
    entries: Vec<Entry>,
    entry_slots: Vec<usize>,
    root: NodeId,
    free_head: Option<EntryId>,
    timers: TimerQueue<EntryId>,
    rng: StdRng,
}

impl SetDatabase {
    /// Creates a database covering `pool` with everything free.
    pub fn new(pool: AddrInterval) -> Self {
        let mut db = Self {
            pool,
            nodes: Vec::new(),
            node_slots: Vec::new(),
            entries: Vec::new(),
            entry_slots: Vec::new(),
            root: NodeId(0),
            free_head: None,
            timers: TimerQueue::new(),
            rng: StdRng::from_entropy(),
        };
        let whole = AddrInterval::from_count_with(pool.first_addr(), pool.size(), pool.width);
        let entry = db.alloc_entry(whole);
        db.entries[entry.0].location = Location::Free {
            prev: entry,
            next: entry,
        };
        db.free_head = Some(entry);
        db.root = db.alloc_node(entry);
        db
    }

    pub fn pool(&self) -> AddrInterval {
        self.pool
    }

    pub fn entry_span(&self, id: EntryId) -> AddrInterval {
        self.entries[id.0].span
    }

    // ---- arena plumbing ----

    fn alloc_entry(&mut self, span: AddrInterval) -> EntryId {
        let entry = Entry {
            span,
            tag: 0,
            reserved: false,
            location: Location::Detached,
        };
        if let Some(slot) = self.entry_slots.pop() {
            self.entries[slot] = entry;
            EntryId(slot)
        } else {
            self.entries.push(entry);
            EntryId(self.entries.len() - 1)
        }
    }

    fn free_entry(&mut self, id: EntryId) {
        self.entries[id.0].location = Location::Detached;
        self.entry_slots.push(id.0);
    }

    fn alloc_node(&mut self, first: EntryId) -> NodeId {
        let node = Node {
            parent: None,
            children: [None; 3],
            first,
            second: None,
        };
        if let Some(slot) = self.node_slots.pop() {
            self.nodes[slot] = node;
            NodeId(slot)
        } else {
            self.nodes.push(node);
            NodeId(self.nodes.len() - 1)
        }
    }

    fn free_node(&mut self, id: NodeId) {
        self.node_slots.push(id.0);
    }

    fn set_child(&mut self, node: NodeId, index: usize, child: Option<NodeId>) {
        self.nodes[node.0].children[index] = child;
        if let Some(c) = child {
            self.nodes[c.0].parent = Some(node);
        }
    }

    fn entry_at(&self, node: NodeId, index: usize) -> EntryId {
        if index == 0 {
            self.nodes[node.0].first
        } else {
            self.nodes[node.0].second.unwrap_or(self.nodes[node.0].first)
        }
    }

    fn set_entry_at(&mut self, node: NodeId, index: usize, entry: EntryId) {
        if index == 0 {
            self.nodes[node.0].first = entry;
        } else {
            self.nodes[node.0].second = Some(entry);
        }
    }

    // ---- free list ----

    fn is_free(&self, id: EntryId) -> bool {
        matches!(self.entries[id.0].location, Location::Free { .. })
    }

    fn is_allocated(&self, id: EntryId) -> bool {
        self.entries[id.0].location == Location::Allocated
    }

    fn free_next(&self, id: EntryId) -> EntryId {
        match self.entries[id.0].location {
            Location::Free { next, .. } => next,
            _ => id,
        }
    }

    fn set_free_prev(&mut self, id: EntryId, prev: EntryId) {
        if let Location::Free { next, .. } = self.entries[id.0].location {
            self.entries[id.0].location = Location::Free { prev, next };
        }
    }

    fn set_free_next(&mut self, id: EntryId, next: EntryId) {
        if let Location::Free { prev, .. } = self.entries[id.0].location {
            self.entries[id.0].location = Location::Free { prev, next };
        }
    }

    /// Links `id` into the circular free list.
    fn join_free_list(&mut self, id: EntryId) {
        match self.free_head {
            None => {
                self.entries[id.0].location = Location::Free {
                    prev: id,
                    next: id,
                };
                self.free_head = Some(id);
            }
            Some(head) => {
                let prev = match self.entries[head.0].location {
                    Location::Free { prev, .. } => prev,
                    _ => head,
                };
                self.entries[id.0].location = Location::Free { prev, next: head };
                self.set_free_next(prev, id);
                self.set_free_prev(head, id);
            }
        }
    }

    /// Links `id` into the list right before `anchor` (which must be free).
    fn chain_before(&mut self, id: EntryId, anchor: EntryId) {
        let prev = match self.entries[anchor.0].location {
            Location::Free { prev, .. } => prev,
            _ => {
                self.join_free_list(id);
                return;
            }
        };
        self.entries[id.0].location = Location::Free {
            prev,
            next: anchor,
        };
        self.set_free_next(prev, id);
        self.set_free_prev(anchor, id);
    }

    /// Unlinks `id` from the free list. Returns true when it was the last
    /// free entry.
    fn leave_free_list(&mut self, id: EntryId) -> bool {
        let (prev, next) = match self.entries[id.0].location {
            Location::Free { prev, next } => (prev, next),
            _ => return false,
        };
        self.entries[id.0].location = Location::Detached;
        if next == id {
            return true;
        }
        self.set_free_next(prev, next);
        self.set_free_prev(next, prev);
        false
    }

    // ---- 2-3 tree ----

    /// Descends from `start` to the node whose entry contains `addr`, or
    /// to the leaf where it would live.
    fn locate_from(&self, start: NodeId, addr: u64) -> (NodeId, Option<usize>) {
        let mut id = start;
        loop {
            let node = &self.nodes[id.0];
            let first = &self.entries[node.first.0].span;
            if addr >= first.first_addr() && addr <= first.last_addr() {
                return (id, Some(0));
            }
            if let Some(second) = node.second {
                let span = &self.entries[second.0].span;
                if addr >= span.first_addr() && addr <= span.last_addr() {
                    return (id, Some(1));
                }
            }
            if node.children[0].is_none() {
                return (id, None);
            }
            let next = if addr < first.first_addr() {
                node.children[0]
            } else if node
                .second
                .map_or(true, |s| addr > self.entries[s.0].span.last_addr())
            {
                node.children[2]
            } else {
                node.children[1]
            };
            match next {
                Some(n) => id = n,
                None => return (id, None),
            }
        }
    }

    fn locate(&self, addr: u64) -> (NodeId, Option<usize>) {
        self.locate_from(self.root, addr)
    }

    /// The entry containing `addr`, if any.
    pub fn search(&self, addr: u64) -> Option<EntryId> {
        let (node, index) = self.locate(addr);
        index.map(|i| self.entry_at(node, i))
    }

    /// Inserts `entry` (with `carry` as the subtree to its right) into
    /// `node_id`, splitting upward as needed. Returns a new root when the
    /// split propagates past the old one.
    fn insert_into(
        &mut self,
        node_id: NodeId,
        entry: EntryId,
        carry: Option<NodeId>,
    ) -> Option<NodeId> {
        let new_first = self.entries[entry.0].span.first_addr();
        let node_first = self.entries[self.nodes[node_id.0].first.0].span.first_addr();

        let second_id = match self.nodes[node_id.0].second {
            None => {
                if new_first < node_first {
                    let old_first = self.nodes[node_id.0].first;
                    self.nodes[node_id.0].first = entry;
                    self.nodes[node_id.0].second = Some(old_first);
                    self.set_child(node_id, 1, carry);
                } else {
                    let c2 = self.nodes[node_id.0].children[2];
                    self.nodes[node_id.0].children[1] = c2;
                    self.set_child(node_id, 2, carry);
                    self.nodes[node_id.0].second = Some(entry);
                }
                return None;
            }
            Some(id) => id,
        };

        // Full node: split into two 1-entry nodes around a median pushed
        // into the parent.
        let second_first = self.entries[second_id.0].span.first_addr();
        let median;
        let sibling;
        if new_first < node_first {
            median = self.nodes[node_id.0].first;
            self.nodes[node_id.0].first = entry;
            sibling = self.alloc_node(second_id);
            let c1 = self.nodes[node_id.0].children[1];
            let c2 = self.nodes[node_id.0].children[2];
            self.set_child(sibling, 0, c1);
            self.set_child(sibling, 2, c2);
            self.set_child(node_id, 2, carry);
        } else if new_first > second_first {
            median = second_id;
            sibling = self.alloc_node(entry);
            let c2 = self.nodes[node_id.0].children[2];
            self.set_child(sibling, 0, c2);
            self.set_child(sibling, 2, carry);
            let c1 = self.nodes[node_id.0].children[1];
            self.nodes[node_id.0].children[2] = c1;
        } else {
            median = entry;
            sibling = self.alloc_node(second_id);
            self.set_child(sibling, 0, carry);
            let c2 = self.nodes[node_id.0].children[2];
            self.set_child(sibling, 2, c2);
            let c1 = self.nodes[node_id.0].children[1];
            self.nodes[node_id.0].children[2] = c1;
        }
        self.nodes[node_id.0].children[1] = None;
        self.nodes[node_id.0].second = None;

        match self.nodes[node_id.0].parent {
            Some(parent) => self.insert_into(parent, median, Some(sibling)),
            None => {
                let root = self.alloc_node(median);
                self.set_child(root, 0, Some(node_id));
                self.set_child(root, 2, Some(sibling));
                Some(root)
            }
        }
    }

    fn child_index(&self, node_id: NodeId) -> Option<usize> {
        let parent = self.nodes[node_id.0].parent?;
        (0..3).find(|&i| self.nodes[parent.0].children[i] == Some(node_id))
    }

    /// Borrows an entry from the left sibling through the parent.
    fn redistribute_left(&mut self, node_id: NodeId, index: usize) -> bool {
        if index == 0 {
            return false;
        }
        let Some(parent) = self.nodes[node_id.0].parent else {
            return false;
        };
        let has_middle = self.nodes[parent.0].children[1].is_some();
        let sib_idx = if has_middle { index - 1 } else { index - 2 };
        let Some(sibling) = self.nodes[parent.0].children[sib_idx] else {
            return false;
        };
        let Some(sib_second) = self.nodes[sibling.0].second.take() else {
            return false;
        };
        let parent_ridx = if has_middle { index - 1 } else { 0 };
        let down = self.entry_at(parent, parent_ridx);
        self.set_entry_at(parent, parent_ridx, sib_second);
        self.nodes[node_id.0].first = down;
        let own = self.nodes[node_id.0].children[0];
        self.nodes[node_id.0].children[2] = own;
        let sc2 = self.nodes[sibling.0].children[2];
        self.set_child(node_id, 0, sc2);
        let sc1 = self.nodes[sibling.0].children[1].take();
        self.set_child(sibling, 2, sc1);
        true
    }

    /// Borrows an entry from the right sibling through the parent.
    fn redistribute_right(&mut self, node_id: NodeId, index: usize) -> bool {
        if index >= 2 {
            return false;
        }
        let Some(parent) = self.nodes[node_id.0].parent else {
            return false;
        };
        let has_middle = self.nodes[parent.0].children[1].is_some();
        let sib_idx = if has_middle { index + 1 } else { index + 2 };
        let Some(sibling) = self.nodes[parent.0].children[sib_idx] else {
            return false;
        };
        let Some(sib_second) = self.nodes[sibling.0].second.take() else {
            return false;
        };
        let parent_ridx = if has_middle { index } else { 0 };
        let down = self.entry_at(parent, parent_ridx);
        let sib_first = self.nodes[sibling.0].first;
        self.set_entry_at(parent, parent_ridx, sib_first);
        self.nodes[sibling.0].first = sib_second;
        self.nodes[node_id.0].first = down;
        let sc0 = self.nodes[sibling.0].children[0];
        self.set_child(node_id, 2, sc0);
        let sc1 = self.nodes[sibling.0].children[1].take();
        self.set_child(sibling, 0, sc1);
        true
    }

    /// Collapses a 3-node parent by absorbing its middle child.
    fn redistribute_up(&mut self, node_id: NodeId, index: usize) -> bool {
        let Some(parent) = self.nodes[node_id.0].parent else {
            return false;
        };
        let Some(parent_second) = self.nodes[parent.0].second else {
            return false;
        };
        let Some(middle) = self.nodes[parent.0].children[1] else {
            return false;
        };
        match index {
            0 => {
                let down = self.nodes[parent.0].first;
                let mid_first = self.nodes[middle.0].first;
                self.nodes[node_id.0].first = down;
                self.nodes[node_id.0].second = Some(mid_first);
                self.nodes[parent.0].first = parent_second;
                let mc0 = self.nodes[middle.0].children[0];
                self.set_child(node_id, 1, mc0);
                let mc2 = self.nodes[middle.0].children[2];
                self.set_child(node_id, 2, mc2);
            }
            1 => {
                let Some(left) = self.nodes[parent.0].children[0] else {
                    return false;
                };
                let down = self.nodes[parent.0].first;
                self.nodes[left.0].second = Some(down);
                self.nodes[parent.0].first = parent_second;
                let lc2 = self.nodes[left.0].children[2];
                self.set_child(left, 1, lc2);
                let own = self.nodes[node_id.0].children[0];
                self.set_child(left, 2, own);
            }
            _ => {
                let mid_first = self.nodes[middle.0].first;
                self.nodes[node_id.0].first = mid_first;
                self.nodes[node_id.0].second = Some(parent_second);
                let own = self.nodes[node_id.0].children[0];
                self.nodes[node_id.0].children[2] = own;
                let mc2 = self.nodes[middle.0].children[2];
                self.set_child(node_id, 1, mc2);
                let mc0 = self.nodes[middle.0].children[0];
                self.set_child(node_id, 0, mc0);
            }
        }
        self.nodes[parent.0].second = None;
        self.nodes[parent.0].children[1] = None;
        self.free_node(middle);
        true
    }

    /// Merges an underfull node with its sibling, pulling the parent's
    /// entry down. May propagate upward and replace the root.
    fn merge(&mut self, node_id: NodeId, index: usize) -> Option<NodeId> {
        let parent = self.nodes[node_id.0].parent?;
        if index == 0 {
            let right = self.nodes[parent.0].children[2]?;
            let down = self.nodes[parent.0].first;
            let right_first = self.nodes[right.0].first;
            self.nodes[node_id.0].first = down;
            self.nodes[node_id.0].second = Some(right_first);
            let rc0 = self.nodes[right.0].children[0];
            self.set_child(node_id, 1, rc0);
            let rc2 = self.nodes[right.0].children[2];
            self.set_child(node_id, 2, rc2);
            self.free_node(right);
        } else {
            let left = self.nodes[parent.0].children[0]?;
            let down = self.nodes[parent.0].first;
            self.nodes[left.0].second = Some(down);
            let lc2 = self.nodes[left.0].children[2];
            self.set_child(left, 1, lc2);
            let own = self.nodes[node_id.0].children[0];
            self.set_child(left, 2, own);
            self.free_node(node_id);
        }
        self.nodes[parent.0].children[2] = None;
        if self.nodes[parent.0].parent.is_some() {
            return self.redistribute(parent);
        }
        let new_root = self.nodes[parent.0].children[0]?;
        self.nodes[new_root.0].parent = None;
        self.free_node(parent);
        Some(new_root)
    }

    fn redistribute(&mut self, node_id: NodeId) -> Option<NodeId> {
        let index = self.child_index(node_id)?;
        if self.redistribute_left(node_id, index)
            || self.redistribute_right(node_id, index)
            || self.redistribute_up(node_id, index)
        {
            return None;
        }
        self.merge(node_id, index)
    }

    /// Removes the entry at `index` of `node_id` from the tree and frees
    /// its slot. Returns a new root when the tree shrinks.
    fn delete_entry(&mut self, node_id: NodeId, index: usize) -> Option<NodeId> {
        let doomed = self.entry_at(node_id, index);
        if self.nodes[node_id.0].children[0].is_some() {
            // Swap with the in-order successor and delete at the leaf.
            let succ_addr = self.entries[doomed.0].span.last_addr().wrapping_add(1);
            let (succ, _) = self.locate_from(node_id, succ_addr);
            let succ_entry = self.nodes[succ.0].first;
            self.set_entry_at(node_id, index, succ_entry);
            self.nodes[succ.0].first = doomed;
            return self.delete_entry(succ, 0);
        }
        if let Some(second) = self.nodes[node_id.0].second.take() {
            if index == 0 {
                self.nodes[node_id.0].first = second;
            }
            self.free_entry(doomed);
            return None;
        }
        let result = self.redistribute(node_id);
        self.free_entry(doomed);
        result
    }

    // ---- splitting and merging entries ----

    /// Carves `size` addresses off the tail of `id` into a new free entry
    /// and inserts it into the tree and the free list.
    fn split_and_insert(&mut self, id: EntryId, size: u64) -> Option<EntryId> {
        let span = self.entries[id.0].span;
        if span.size() <= size {
            return None;
        }
        let tail = AddrInterval::from_count_with(
            span.first_addr() + span.size() - size,
            size,
            span.width,
        );
        self.entries[id.0].span.set_size(span.size() - size);
        let new_id = self.alloc_entry(tail);
        self.chain_before(new_id, id);
        let (leaf, _) = self.locate(tail.first_addr());
        if let Some(new_root) = self.insert_into(leaf, new_id, None) {
            self.root = new_root;
        }
        Some(new_id)
    }

    /// Merges the entry starting right after `id` into `id` and deletes it
    /// from the tree.
    fn join_and_delete(&mut self, id: EntryId) {
        let last = self.entries[id.0].span.last_addr();
        let (node, index) = self.locate(last.wrapping_add(1));
        let Some(index) = index else { return };
        let next_id = self.entry_at(node, index);
        match self.entries[next_id.0].location {
            Location::Allocated => {
                self.timers.cancel(next_id);
            }
            Location::Free { .. } => {
                let was_head = self.free_head == Some(next_id);
                self.leave_free_list(next_id);
                if was_head {
                    self.free_head = Some(id);
                }
            }
            Location::Detached => {}
        }
        let grown = self.entries[id.0].span.size() + self.entries[next_id.0].span.size();
        self.entries[id.0].span.set_size(grown);
        if let Some(new_root) = self.delete_entry(node, index) {
            self.root = new_root;
        }
    }

    /// Shrinks the free entry `container` to exactly `span`, splitting off
    /// leading and trailing remainders as free entries, and removes the
    /// result from the free list. Returns the entry covering `span`.
    fn extract(&mut self, container: EntryId, span: &AddrInterval) -> EntryId {
        let mut container = container;
        let mut size =
            self.entries[container.0].span.last_addr() - span.first_addr() + 1;
        if span.first_addr() > self.entries[container.0].span.first_addr() {
            container = self.split_and_insert(container, size).unwrap_or(container);
        }
        size -= span.size();
        if size > 0 {
            self.split_and_insert(container, size);
        }
        if self.free_head == Some(container) {
            self.free_head = Some(self.free_next(container));
        }
        if self.leave_free_list(container) {
            self.free_head = None;
        }
        container
    }

    /// Best-fit search over one full cycle of the free list. An entry's
    /// usable size is its exact size when at most 65535, otherwise its
    /// mask-aligned size (clamped up to 65535, since anything larger can
    /// at least ship a maximal count-form block). With `random`, equal
    /// candidates are tie-broken by coin flip.
    fn find_free(&mut self, min: u64, max: u64, random: bool) -> Option<EntryId> {
        let head = self.free_head?;
        let mut p = head;
        let mut best = None;
        let mut best_size = 0u64;
        loop {
            let span = self.entries[p.0].span;
            let mut size = if span.size() > 0xffff {
                span.aligned_size().max(0xffff)
            } else {
                span.size()
            };
            size = size.min(max);
            if best_size < size
                || (random && best_size == size && self.rng.gen_bool(0.5))
            {
                best = Some(p);
                best_size = size;
            }
            p = self.free_next(p);
            if p == head {
                break;
            }
            if best_size >= max && !random {
                break;
            }
        }
        if best_size >= min {
            best
        } else {
            None
        }
    }

    /// Span of the best free entry between `min` and `max` usable
    /// addresses, without allocating it.
    pub fn best_free(&mut self, min: u64, max: u64, random: bool) -> Option<AddrInterval> {
        self.find_free(min, max, random).map(|id| self.entry_span(id))
    }

    /// Carves a block of up to `count` addresses out of the best free
    /// entry. The result is allocated to nothing yet (no tag, no timer).
    fn take(&mut self, count: u64) -> Option<EntryId> {
        let free = self.find_free(1, count, false)?;
        let mut span = self.entries[free.0].span;
        if span.size().min(count) > 0xffff {
            span.align_to_mask(IntervalForm::Count);
        }
        if span.size() > count {
            span.set_size(count);
        }
        Some(self.extract(free, &span))
    }

    fn arm(&mut self, id: EntryId, secs: f64) {
        self.entries[id.0].location = Location::Allocated;
        self.timers.schedule(id, secs);
    }

    // ---- public allocation API ----

    /// Marks `set` (clipped to the pool) as unavailable for `lifetime`
    /// seconds, splitting or merging entries as needed. An exact re-exclusion
    /// just refreshes the timer. Returns false when the set lies outside
    /// the pool.
    pub fn exclude(&mut self, set: &AddrInterval, lifetime: u16) -> bool {
        let Some(span) = AddrInterval::intersection(&self.pool, set) else {
            return false;
        };
        let Some(mut id) = self.search(span.first_addr()) else {
            return false;
        };
        if self.is_allocated(id) {
            let held = self.entries[id.0].span;
            if held.first_addr() == span.first_addr() && held.size() == span.size() {
                let left = self.timers.remaining(id).unwrap_or(0.0);
                if (left - f64::from(lifetime)).abs() > 1.0 {
                    self.timers.schedule(id, f64::from(lifetime));
                }
                return true;
            }
            self.timers.cancel(id);
            self.join_free_list(id);
        }
        while self.entries[id.0].span.last_addr() < span.last_addr() {
            self.join_and_delete(id);
        }
        id = self.extract(id, &span);
        self.entries[id.0].tag = 0;
        self.entries[id.0].reserved = false;
        self.arm(id, f64::from(lifetime));
        debug!(span = %span, lifetime, "excluded span");
        true
    }

    /// Reserves a best-fit block of up to `count` addresses for `lifetime`
    /// seconds under `tag`.
    pub fn reserve(&mut self, count: u64, tag: u64, lifetime: u16) -> Option<EntryId> {
        let id = self.take(count)?;
        self.entries[id.0].tag = tag;
        self.entries[id.0].reserved = true;
        self.arm(id, f64::from(lifetime));
        Some(id)
    }

    /// Assigns `span` out of the entry `container` (free or reserved).
    /// The timer runs one second past the advertised lifetime.
    pub fn commit_at(
        &mut self,
        container: EntryId,
        span: &AddrInterval,
        tag: u64,
        lifetime: u16,
    ) -> EntryId {
        if self.is_allocated(container) {
            self.timers.cancel(container);
            self.join_free_list(container);
        }
        let id = self.extract(container, span);
        self.entries[id.0].tag = tag;
        self.entries[id.0].reserved = false;
        self.arm(id, f64::from(lifetime) + 1.0);
        id
    }

    /// Assigns a best-fit block of up to `count` addresses.
    pub fn commit(&mut self, count: u64, tag: u64, lifetime: u16) -> Option<EntryId> {
        let id = self.take(count)?;
        self.entries[id.0].tag = tag;
        self.entries[id.0].reserved = false;
        self.arm(id, f64::from(lifetime) + 1.0);
        Some(id)
    }

    /// Returns an allocated entry to the free space immediately.
    pub fn release(&mut self, id: EntryId) {
        self.timers.cancel(id);
        self.expire(id);
    }

    /// Reports the lease state of `span`. Valid only when the span lies
    /// entirely within one entry.
    pub fn status(&mut self, span: &AddrInterval) -> SpanStatus {
        let invalid = SpanStatus {
            state: SpanState::Invalid,
            tag: 0,
            lifetime: 0,
            identical: false,
            entry: None,
        };
        let Some(id) = self.search(span.first_addr()) else {
            return invalid;
        };
        let held = self.entries[id.0].span;
        if held.last_addr() < span.last_addr() {
            return invalid;
        }
        let identical = held.size() == span.size();
        if self.is_free(id) {
            return SpanStatus {
                state: SpanState::Free,
                tag: 0,
                lifetime: 0,
                identical,
                entry: Some(id),
            };
        }
        let tag = self.entries[id.0].tag;
        let mut lifetime = self.timers.remaining(id).unwrap_or(0.0) as u16;
        if self.entries[id.0].reserved {
            return SpanStatus {
                state: SpanState::Reserved,
                tag,
                lifetime,
                identical,
                entry: Some(id),
            };
        }
        if lifetime > 0 {
            lifetime -= 1;
        }
        SpanStatus {
            state: SpanState::Assigned,
            tag,
            lifetime,
            identical,
            entry: Some(id),
        }
    }

    // ---- expiry ----

    fn expire(&mut self, id: EntryId) {
        let span = self.entries[id.0].span;
        let prev = self.search(span.first_addr().wrapping_sub(1));
        let next = self.search(span.last_addr().wrapping_add(1));
        self.join_free_list(id);
        debug!(span = %span, "entry freed");
        if let Some(next) = next {
            if self.is_free(next) {
                self.join_and_delete(id);
            }
        }
        if let Some(prev) = prev {
            if self.is_free(prev) {
                self.join_and_delete(prev);
            }
        }
    }

    /// Frees every entry whose lifetime has run out, coalescing with free
    /// neighbors. Returns how many entries expired.
    pub fn poll(&mut self) -> usize {
        let due = self.timers.pop_expired();
        let count = due.len();
        for id in due {
            self.expire(id);
        }
        count
    }

    /// Seconds until the next expiry, if any entry is allocated.
    pub fn next_deadline(&mut self) -> Option<f64> {
        self.timers.next_deadline()
    }

    /// Pretends `secs` seconds have passed.
    pub fn advance(&mut self, secs: f64) {
        self.timers.advance(secs);
    }

    /// All entry spans in address order, each with its free flag.
    pub fn spans(&self) -> Vec<(AddrInterval, bool)> {
        let mut out = Vec::new();
        self.collect_spans(self.root, &mut out);
        out
    }

    fn collect_spans(&self, node_id: NodeId, out: &mut Vec<(AddrInterval, bool)>) {
        let node = &self.nodes[node_id.0];
        let (first, second) = (node.first, node.second);
        let children = node.children;
        if let Some(c) = children[0] {
            self.collect_spans(c, out);
        }
        out.push((self.entries[first.0].span, self.is_free(first)));
        if let Some(second) = second {
            if let Some(c) = children[1] {
                self.collect_spans(c, out);
            }
            out.push((self.entries[second.0].span, self.is_free(second)));
        }
        if let Some(c) = children[2] {
            self.collect_spans(c, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrset::AddrInterval;

    const POOL_BASE: u64 = 0x0a00_0000_0000;

    fn pool(count: u64) -> AddrInterval {
        AddrInterval::from_count(POOL_BASE, count)
    }

    /// Every address of the pool belongs to exactly one entry, in order.
    fn assert_coverage(db: &SetDatabase) {
        let spans = db.spans();
        assert!(!spans.is_empty());
        let mut expect = db.pool().first_addr();
        for (span, _) in &spans {
            assert_eq!(span.first_addr(), expect, "gap or overlap at {span}");
            expect = span.last_addr() + 1;
        }
        assert_eq!(expect, db.pool().last_addr() + 1, "pool tail uncovered");
    }

    #[test]
    fn test_new_database_is_one_free_span() {
        let db = SetDatabase::new(pool(4096));
        let spans = db.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].1);
        assert_eq!(spans[0].0.size(), 4096);
        assert_coverage(&db);
    }

    #[test]
    fn test_commit_splits_and_release_coalesces() {
        let mut db = SetDatabase::new(pool(4096));
        let id = db.commit(64, 7, 60).expect("assign");
        let span = db.entry_span(id);
        assert_eq!(span.size(), 64);
        assert_coverage(&db);

        let report = db.status(&span);
        assert_eq!(report.state, SpanState::Assigned);
        assert_eq!(report.tag, 7);
        assert!(report.identical);

        db.release(id);
        assert_coverage(&db);
        assert_eq!(db.spans().len(), 1);
        assert!(db.spans()[0].1);
    }

    #[test]
    fn test_release_then_find_round_trip() {
        let mut db = SetDatabase::new(pool(128));
        let a = db.commit(128, 1, 60).expect("first grant");
        assert_eq!(db.entry_span(a).size(), 128);
        assert!(db.commit(1, 2, 60).is_none(), "pool exhausted");
        db.release(a);
        let b = db.commit(128, 3, 60).expect("re-grant after release");
        assert_eq!(db.entry_span(b).size(), 128);
    }

    #[test]
    fn test_sixteen_address_pool_cycle() {
        let mut db = SetDatabase::new(AddrInterval::from_count(0x0a00_0000_0001, 16));
        let id = db.commit(16, 42, 30).expect("grant whole pool");
        assert_eq!(db.entry_span(id).first_addr(), 0x0a00_0000_0001);
        assert_eq!(db.entry_span(id).size(), 16);
        assert!(db.commit(1, 43, 30).is_none());
        db.release(id);
        assert_coverage(&db);
        let again = db.commit(16, 44, 30).expect("grant again");
        assert_eq!(db.entry_span(again).size(), 16);
    }

    #[test]
    fn test_assigned_lifetime_reads_back_minus_one() {
        let mut db = SetDatabase::new(pool(256));
        let id = db.commit(16, 9, 600).expect("assign");
        let span = db.entry_span(id);
        let report = db.status(&span);
        assert_eq!(report.state, SpanState::Assigned);
        assert_eq!(report.lifetime, 600);
    }

    #[test]
    fn test_reserve_reports_reserved() {
        let mut db = SetDatabase::new(pool(256));
        let id = db.reserve(32, 5, 8).expect("reserve");
        let span = db.entry_span(id);
        let report = db.status(&span);
        assert_eq!(report.state, SpanState::Reserved);
        assert_eq!(report.tag, 5);
    }

    #[test]
    fn test_expiry_frees_and_coalesces() {
        let mut db = SetDatabase::new(pool(1024));
        let a = db.commit(16, 1, 5).expect("a");
        let b = db.commit(16, 2, 5).expect("b");
        assert_ne!(db.entry_span(a).first_addr(), db.entry_span(b).first_addr());
        db.advance(10.0);
        assert_eq!(db.poll(), 2);
        assert_coverage(&db);
        assert_eq!(db.spans().len(), 1);
        assert!(db.spans()[0].1);
    }

    #[test]
    fn test_reservation_expires_before_assignment() {
        let mut db = SetDatabase::new(pool(64));
        let r = db.reserve(16, 1, 4).expect("reserve");
        let span = db.entry_span(r);
        db.advance(5.0);
        db.poll();
        let report = db.status(&span);
        assert_eq!(report.state, SpanState::Free);
    }

    #[test]
    fn test_exclude_mid_pool() {
        let mut db = SetDatabase::new(pool(1024));
        let foreign = AddrInterval::from_count(POOL_BASE + 100, 50);
        assert!(db.exclude(&foreign, 120));
        assert_coverage(&db);
        let report = db.status(&foreign);
        assert_eq!(report.state, SpanState::Assigned);
        assert_eq!(report.tag, 0);
        assert!(report.identical);
        // The exclusion eventually times out and the pool heals.
        db.advance(200.0);
        db.poll();
        assert_eq!(db.spans().len(), 1);
        assert!(db.spans()[0].1);
    }

    #[test]
    fn test_exclude_refreshes_exact_match() {
        let mut db = SetDatabase::new(pool(1024));
        let span = AddrInterval::from_count(POOL_BASE + 16, 16);
        assert!(db.exclude(&span, 10));
        assert!(db.exclude(&span, 120));
        let report = db.status(&span);
        assert!(report.lifetime > 60, "timer refreshed, got {}", report.lifetime);
    }

    #[test]
    fn test_exclude_overlapping_allocation() {
        let mut db = SetDatabase::new(pool(1024));
        let first = AddrInterval::from_count(POOL_BASE + 32, 32);
        assert!(db.exclude(&first, 60));
        // A wider span swallows the old exclusion and its neighbors.
        let wider = AddrInterval::from_count(POOL_BASE, 128);
        assert!(db.exclude(&wider, 60));
        assert_coverage(&db);
        let report = db.status(&wider);
        assert_eq!(report.state, SpanState::Assigned);
        assert!(report.identical);
    }

    #[test]
    fn test_exclude_outside_pool_rejected() {
        let mut db = SetDatabase::new(pool(1024));
        let outside = AddrInterval::from_count(POOL_BASE + 1_000_000, 16);
        assert!(!db.exclude(&outside, 60));
    }

    #[test]
    fn test_exclude_clips_to_pool() {
        let mut db = SetDatabase::new(pool(64));
        let straddling = AddrInterval::from_count(POOL_BASE.wrapping_sub(16), 48);
        assert!(db.exclude(&straddling, 60));
        assert_coverage(&db);
        let clipped = AddrInterval::from_count(POOL_BASE, 32);
        let report = db.status(&clipped);
        assert_eq!(report.state, SpanState::Assigned);
        assert!(report.identical);
    }

    #[test]
    fn test_commit_at_reserved_entry() {
        let mut db = SetDatabase::new(pool(256));
        let r = db.reserve(64, 11, 8).expect("reserve");
        let span = db.entry_span(r);
        let a = db.commit_at(r, &span, 11, 300);
        let report = db.status(&span);
        assert_eq!(report.state, SpanState::Assigned);
        assert_eq!(report.tag, 11);
        assert_eq!(db.entry_span(a), span);
        assert_coverage(&db);
    }

    #[test]
    fn test_commit_at_partial_reservation() {
        let mut db = SetDatabase::new(pool(256));
        let r = db.reserve(64, 11, 8).expect("reserve");
        let whole = db.entry_span(r);
        let part = AddrInterval::from_count(whole.first_addr() + 16, 16);
        db.commit_at(r, &part, 11, 300);
        assert_coverage(&db);
        let report = db.status(&part);
        assert_eq!(report.state, SpanState::Assigned);
        assert!(report.identical);
        // The rest of the old reservation is free again.
        let head = AddrInterval::from_count(whole.first_addr(), 16);
        assert_eq!(db.status(&head).state, SpanState::Free);
    }

    #[test]
    fn test_status_straddling_entries_invalid() {
        let mut db = SetDatabase::new(pool(256));
        let id = db.commit(32, 1, 60).expect("assign");
        let span = db.entry_span(id);
        let straddle = AddrInterval::from_count(span.first_addr() + 16, 32);
        assert_eq!(db.status(&straddle).state, SpanState::Invalid);
    }

    #[test]
    fn test_large_free_entry_usable_size_is_aligned() {
        // A free entry bigger than 65535 must hand out mask-aligned blocks.
        let mut db = SetDatabase::new(pool(1 << 20));
        let id = db.commit(1 << 17, 1, 60).expect("large assign");
        let span = db.entry_span(id);
        assert_eq!(span.size(), 1 << 17);
        assert_eq!(span.first_addr() % (1 << 17), 0);
        assert_coverage(&db);
    }

    #[test]
    fn test_tree_stress_many_entries() {
        let mut db = SetDatabase::new(pool(4096));
        let mut ids = Vec::new();
        for i in 0..64 {
            let id = db.commit(1, i, 600).expect("single address");
            ids.push(id);
            assert_coverage(&db);
        }
        assert_eq!(db.spans().len(), 65);
        // Release odds first, then evens, exercising both merge directions.
        for (i, &id) in ids.iter().enumerate() {
            if i % 2 == 1 {
                db.release(id);
                assert_coverage(&db);
            }
        }
        for (i, &id) in ids.iter().enumerate() {
            if i % 2 == 0 {
                db.release(id);
                assert_coverage(&db);
            }
        }
        assert_eq!(db.spans().len(), 1);
        assert!(db.spans()[0].1);
        assert_eq!(db.spans()[0].0.size(), 4096);
    }

    #[test]
    fn test_tree_stress_interleaved_exclusions() {
        let mut db = SetDatabase::new(pool(8192));
        for i in 0..32 {
            let span = AddrInterval::from_count(POOL_BASE + i * 256, 100);
            assert!(db.exclude(&span, 30 + i as u16));
            assert_coverage(&db);
        }
        db.advance(100.0);
        db.poll();
        assert_coverage(&db);
        assert_eq!(db.spans().len(), 1);
    }
}
