//! # Free-Extent Index
//!
//! Bookkeeping for the free page runs of the page-range allocator. Each
//! [`Extent`] lives in one arena record that is simultaneously
//!
//! - a node of the **size tree** (ordered by page count, duplicates go right),
//! - a node of the **address tree** (ordered by start address, unique keys),
//! - an entry of the **shadow list** (insertion order, for linear scans).
//!
//! ```text
//!            arena record #h
//!   ┌──────────────────────────────┐
//!   │ extent: start, pages         │
//!   │ by_size: parent/left/right ──┼──► size tree
//!   │ by_addr: parent/left/right ──┼──► address tree
//!   │ prev/next ───────────────────┼──► shadow list
//!   └──────────────────────────────┘
//! ```
//!
//! Links are arena handles rather than pointers, so the two link sets of a
//! record never alias. [`ExtentIndex::insert`] and [`ExtentIndex::remove`]
//! always touch both trees and the list together; a record is in all three
//! or in none.
//!
//! ## Complexity
//!
//! Neither tree rebalances. Every operation is `O(h)` in the current tree
//! height, which degrades to `O(n)` when extents are inserted in sorted order.

use crate::addresses::VirtualAddress;
use core::fmt;
use core::marker::PhantomData;

const NIL: u32 = u32::MAX;

/// A run of free, contiguous pages.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Extent {
    pub start: VirtualAddress,
    pub pages: u64,
}

impl Extent {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, pages: u64) -> Self {
        Self { start, pages }
    }

    /// First address past the extent.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.start.add_pages(self.pages)
    }

    /// `true` if `next` starts exactly where `self` ends.
    #[inline]
    #[must_use]
    pub fn precedes(&self, next: &Self) -> bool {
        self.end() == next.start
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extent({} +{}p)", self.start, self.pages)
    }
}

/// Stable identifier of an extent record in the index arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ExtentHandle(u32);

impl ExtentHandle {
    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    const fn from_raw(raw: u32) -> Option<Self> {
        if raw == NIL { None } else { Some(Self(raw)) }
    }
}

#[derive(Copy, Clone)]
struct Links {
    parent: u32,
    left: u32,
    right: u32,
}

impl Links {
    const DETACHED: Self = Self {
        parent: NIL,
        left: NIL,
        right: NIL,
    };
}

#[derive(Copy, Clone)]
struct ExtentNode {
    extent: Extent,
    by_size: Links,
    by_addr: Links,
    /// Shadow list predecessor.
    prev: u32,
    /// Shadow list successor, or the next vacant record while unused.
    next: u32,
    in_use: bool,
}

impl ExtentNode {
    const VACANT: Self = Self {
        extent: Extent::new(VirtualAddress::null(), 0),
        by_size: Links::DETACHED,
        by_addr: Links::DETACHED,
        prev: NIL,
        next: NIL,
        in_use: false,
    };
}

/// Selects which link set and which key a [`Tree`] uses.
trait TreeOrder {
    fn links(node: &ExtentNode) -> &Links;
    fn links_mut(node: &mut ExtentNode) -> &mut Links;
    /// Whether `new` descends into the right subtree of `current`.
    fn goes_right(new: &Extent, current: &Extent) -> bool;
    /// Whether in-order neighbours `a` then `b` are correctly ordered.
    fn in_order(a: &Extent, b: &Extent) -> bool;
}

struct BySize;
struct ByAddress;

impl TreeOrder for BySize {
    fn links(node: &ExtentNode) -> &Links {
        &node.by_size
    }

    fn links_mut(node: &mut ExtentNode) -> &mut Links {
        &mut node.by_size
    }

    fn goes_right(new: &Extent, current: &Extent) -> bool {
        new.pages >= current.pages
    }

    fn in_order(a: &Extent, b: &Extent) -> bool {
        a.pages <= b.pages
    }
}

impl TreeOrder for ByAddress {
    fn links(node: &ExtentNode) -> &Links {
        &node.by_addr
    }

    fn links_mut(node: &mut ExtentNode) -> &mut Links {
        &mut node.by_addr
    }

    fn goes_right(new: &Extent, current: &Extent) -> bool {
        new.start > current.start
    }

    fn in_order(a: &Extent, b: &Extent) -> bool {
        a.start < b.start
    }
}

/// Plain (unbalanced) binary search tree threaded through the arena.
struct Tree<O> {
    root: u32,
    _order: PhantomData<O>,
}

impl<O: TreeOrder> Tree<O> {
    const fn new() -> Self {
        Self {
            root: NIL,
            _order: PhantomData,
        }
    }

    fn insert(&mut self, nodes: &mut [ExtentNode], h: u32) {
        *O::links_mut(&mut nodes[h as usize]) = Links::DETACHED;
        if self.root == NIL {
            self.root = h;
            return;
        }

        let key = nodes[h as usize].extent;
        let mut current = self.root;
        loop {
            let right = O::goes_right(&key, &nodes[current as usize].extent);
            let links = O::links_mut(&mut nodes[current as usize]);
            let slot = if right { &mut links.right } else { &mut links.left };
            if *slot == NIL {
                *slot = h;
                O::links_mut(&mut nodes[h as usize]).parent = current;
                return;
            }
            current = *slot;
        }
    }

    /// Put `new` where `node` hangs off its parent (or at the root).
    fn replace_in_parent(&mut self, nodes: &mut [ExtentNode], node: u32, new: u32) {
        let parent = O::links(&nodes[node as usize]).parent;
        if parent == NIL {
            self.root = new;
        } else {
            let links = O::links_mut(&mut nodes[parent as usize]);
            if links.left == node {
                links.left = new;
            } else {
                links.right = new;
            }
        }
        if new != NIL {
            O::links_mut(&mut nodes[new as usize]).parent = parent;
        }
    }

    fn remove(&mut self, nodes: &mut [ExtentNode], h: u32) {
        let Links { left, right, .. } = *O::links(&nodes[h as usize]);
        if left == NIL {
            self.replace_in_parent(nodes, h, right);
        } else if right == NIL {
            self.replace_in_parent(nodes, h, left);
        } else {
            // Splice the in-order successor into h's position.
            let successor = Self::leftmost(nodes, right);
            if O::links(&nodes[successor as usize]).parent != h {
                let successor_right = O::links(&nodes[successor as usize]).right;
                self.replace_in_parent(nodes, successor, successor_right);
                O::links_mut(&mut nodes[successor as usize]).right = right;
                O::links_mut(&mut nodes[right as usize]).parent = successor;
            }
            self.replace_in_parent(nodes, h, successor);
            O::links_mut(&mut nodes[successor as usize]).left = left;
            O::links_mut(&mut nodes[left as usize]).parent = successor;
        }
        *O::links_mut(&mut nodes[h as usize]) = Links::DETACHED;
    }

    fn leftmost(nodes: &[ExtentNode], mut h: u32) -> u32 {
        while O::links(&nodes[h as usize]).left != NIL {
            h = O::links(&nodes[h as usize]).left;
        }
        h
    }

    fn first(&self, nodes: &[ExtentNode]) -> u32 {
        if self.root == NIL {
            NIL
        } else {
            Self::leftmost(nodes, self.root)
        }
    }

    /// In-order successor of `h`, or `NIL`.
    fn next_in_order(nodes: &[ExtentNode], h: u32) -> u32 {
        let right = O::links(&nodes[h as usize]).right;
        if right != NIL {
            return Self::leftmost(nodes, right);
        }
        let mut child = h;
        let mut parent = O::links(&nodes[h as usize]).parent;
        while parent != NIL && O::links(&nodes[parent as usize]).right == child {
            child = parent;
            parent = O::links(&nodes[parent as usize]).parent;
        }
        parent
    }

    /// Walk the tree in order, checking key order and parent links.
    fn verify(&self, nodes: &[ExtentNode]) -> Result<usize, &'static str> {
        if self.root != NIL && O::links(&nodes[self.root as usize]).parent != NIL {
            return Err("tree root has a parent");
        }
        let mut count = 0;
        let mut previous = NIL;
        let mut current = self.first(nodes);
        while current != NIL {
            let node = &nodes[current as usize];
            if !node.in_use {
                return Err("tree links a vacant record");
            }
            let links = O::links(node);
            for child in [links.left, links.right] {
                if child != NIL && O::links(&nodes[child as usize]).parent != current {
                    return Err("child does not point back to its parent");
                }
            }
            if previous != NIL && !O::in_order(&nodes[previous as usize].extent, &node.extent) {
                return Err("tree keys out of order");
            }
            count += 1;
            if count > nodes.len() {
                return Err("tree contains a cycle");
            }
            previous = current;
            current = Self::next_in_order(nodes, current);
        }
        Ok(count)
    }
}

/// The dual-indexed set of free extents.
///
/// `N` is the number of arena records and therefore the maximum number of
/// simultaneously tracked extents.
pub struct ExtentIndex<const N: usize> {
    nodes: [ExtentNode; N],
    /// Records below this index have been handed out at least once.
    high_water: u32,
    /// Chain of released records (through `next`).
    vacant: u32,
    len: usize,
    by_size: Tree<BySize>,
    by_addr: Tree<ByAddress>,
    list_head: u32,
    list_tail: u32,
}

impl<const N: usize> Default for ExtentIndex<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ExtentIndex<N> {
    const CAPACITY_FITS: () = assert!(N < NIL as usize, "extent capacity exceeds handle range");

    #[must_use]
    pub const fn new() -> Self {
        let () = Self::CAPACITY_FITS;
        Self {
            nodes: [ExtentNode::VACANT; N],
            high_water: 0,
            vacant: NIL,
            len: 0,
            by_size: Tree::new(),
            by_addr: Tree::new(),
            list_head: NIL,
            list_tail: NIL,
        }
    }

    /// Forget every extent.
    ///
    /// Only the roots and counters are reset; records at or above the high
    /// water mark are overwritten before they are read again.
    pub const fn clear(&mut self) {
        self.high_water = 0;
        self.vacant = NIL;
        self.len = 0;
        self.by_size = Tree::new();
        self.by_addr = Tree::new();
        self.list_head = NIL;
        self.list_tail = NIL;
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// The extent stored under `h`.
    ///
    /// # Panics
    /// If `h` does not name a live record.
    #[must_use]
    pub fn get(&self, h: ExtentHandle) -> Extent {
        let node = &self.nodes[h.index()];
        assert!(node.in_use, "stale extent handle {h:?}");
        node.extent
    }

    /// Add `extent` to both trees and the shadow list.
    ///
    /// # Panics
    /// If all `N` records are in use.
    pub fn insert(&mut self, extent: Extent) -> ExtentHandle {
        let h = self.allocate_record();
        self.nodes[h as usize].extent = extent;
        self.attach(h);
        ExtentHandle(h)
    }

    /// Detach the extent from both trees and the shadow list and release its record.
    ///
    /// # Panics
    /// If `h` does not name a live record.
    pub fn remove(&mut self, h: ExtentHandle) -> Extent {
        let extent = self.get(h);
        self.detach(h.0);
        self.release_record(h.0);
        extent
    }

    /// Replace the extent stored under `h`, re-keying it in both trees.
    ///
    /// # Panics
    /// If `h` does not name a live record.
    pub fn update(&mut self, h: ExtentHandle, extent: Extent) {
        let _ = self.get(h);
        self.detach(h.0);
        self.nodes[h.index()].extent = extent;
        self.attach(h.0);
    }

    /// An extent of exactly `pages` pages, if any.
    #[must_use]
    pub fn find_exact(&self, pages: u64) -> Option<ExtentHandle> {
        let mut current = self.by_size.root;
        while current != NIL {
            let node = &self.nodes[current as usize];
            match pages.cmp(&node.extent.pages) {
                core::cmp::Ordering::Equal => return Some(ExtentHandle(current)),
                core::cmp::Ordering::Less => current = node.by_size.left,
                core::cmp::Ordering::Greater => current = node.by_size.right,
            }
        }
        None
    }

    /// The largest extent, provided it holds at least `pages` pages.
    #[must_use]
    pub fn find_worst(&self, pages: u64) -> Option<ExtentHandle> {
        let mut current = self.by_size.root;
        let mut worst = NIL;
        while current != NIL {
            let node = &self.nodes[current as usize];
            if node.extent.pages >= pages {
                worst = current;
            }
            current = node.by_size.right;
        }
        ExtentHandle::from_raw(worst)
    }

    /// The extent with the greatest start address strictly below `addr`.
    #[must_use]
    pub fn find_predecessor(&self, addr: VirtualAddress) -> Option<ExtentHandle> {
        let mut current = self.by_addr.root;
        let mut neighbor = NIL;
        while current != NIL {
            let node = &self.nodes[current as usize];
            if node.extent.start < addr {
                neighbor = current;
                current = node.by_addr.right;
            } else {
                current = node.by_addr.left;
            }
        }
        ExtentHandle::from_raw(neighbor)
    }

    /// The extent with the smallest start address strictly above `addr`.
    #[must_use]
    pub fn find_successor(&self, addr: VirtualAddress) -> Option<ExtentHandle> {
        let mut current = self.by_addr.root;
        let mut neighbor = NIL;
        while current != NIL {
            let node = &self.nodes[current as usize];
            if node.extent.start > addr {
                neighbor = current;
                current = node.by_addr.left;
            } else {
                current = node.by_addr.right;
            }
        }
        ExtentHandle::from_raw(neighbor)
    }

    /// Linear exact-fit scan of the shadow list (first match in list order).
    #[must_use]
    pub fn scan_exact(&self, pages: u64) -> Option<ExtentHandle> {
        self.list_handles()
            .find(|&h| self.nodes[h as usize].extent.pages == pages)
            .map(ExtentHandle)
    }

    /// Linear worst-fit scan of the shadow list (first of the largest).
    #[must_use]
    pub fn scan_worst(&self, pages: u64) -> Option<ExtentHandle> {
        let mut worst: Option<u32> = None;
        for h in self.list_handles() {
            let candidate = self.nodes[h as usize].extent.pages;
            if candidate >= pages
                && worst.is_none_or(|w| candidate > self.nodes[w as usize].extent.pages)
            {
                worst = Some(h);
            }
        }
        worst.map(ExtentHandle)
    }

    /// Extents in ascending address order.
    pub fn iter_by_address(&self) -> impl Iterator<Item = Extent> + '_ {
        InOrder {
            nodes: &self.nodes,
            next: self.by_addr.first(&self.nodes),
            step: Tree::<ByAddress>::next_in_order,
        }
    }

    /// Extents in ascending page-count order.
    pub fn iter_by_size(&self) -> impl Iterator<Item = Extent> + '_ {
        InOrder {
            nodes: &self.nodes,
            next: self.by_size.first(&self.nodes),
            step: Tree::<BySize>::next_in_order,
        }
    }

    /// Shadow-list entries in list order.
    pub fn iter_shadow(&self) -> impl Iterator<Item = Extent> + '_ {
        self.list_handles().map(|h| self.nodes[h as usize].extent)
    }

    /// Pages held by all tracked extents.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.iter_shadow().map(|e| e.pages).sum()
    }

    /// Verify tree ordering, list/tree agreement and non-overlap.
    ///
    /// # Errors
    /// A static description of the first violated invariant.
    pub fn verify(&self) -> Result<(), &'static str> {
        let in_size = self.by_size.verify(&self.nodes)?;
        let in_addr = self.by_addr.verify(&self.nodes)?;
        let mut in_list = 0;
        let mut previous = NIL;
        for h in self.list_handles() {
            let node = &self.nodes[h as usize];
            if !node.in_use {
                return Err("shadow list links a vacant record");
            }
            if node.prev != previous {
                return Err("shadow list back link broken");
            }
            previous = h;
            in_list += 1;
            if in_list > N {
                return Err("shadow list contains a cycle");
            }
        }
        if in_size != self.len || in_addr != self.len || in_list != self.len {
            return Err("size tree, address tree and shadow list disagree");
        }
        let mut last: Option<Extent> = None;
        for extent in self.iter_by_address() {
            if extent.pages == 0 {
                return Err("empty extent");
            }
            if last.is_some_and(|l| l.overlaps(&extent) || l.end() > extent.start) {
                return Err("free extents overlap");
            }
            last = Some(extent);
        }
        Ok(())
    }

    fn list_handles(&self) -> impl Iterator<Item = u32> + '_ {
        let mut current = self.list_head;
        core::iter::from_fn(move || {
            if current == NIL {
                return None;
            }
            let h = current;
            current = self.nodes[h as usize].next;
            Some(h)
        })
    }

    fn attach(&mut self, h: u32) {
        self.by_size.insert(&mut self.nodes, h);
        self.by_addr.insert(&mut self.nodes, h);

        let node = &mut self.nodes[h as usize];
        node.prev = self.list_tail;
        node.next = NIL;
        if self.list_tail == NIL {
            self.list_head = h;
        } else {
            self.nodes[self.list_tail as usize].next = h;
        }
        self.list_tail = h;
    }

    fn detach(&mut self, h: u32) {
        self.by_size.remove(&mut self.nodes, h);
        self.by_addr.remove(&mut self.nodes, h);

        let ExtentNode { prev, next, .. } = self.nodes[h as usize];
        if prev == NIL {
            self.list_head = next;
        } else {
            self.nodes[prev as usize].next = next;
        }
        if next == NIL {
            self.list_tail = prev;
        } else {
            self.nodes[next as usize].prev = prev;
        }
        self.nodes[h as usize].prev = NIL;
        self.nodes[h as usize].next = NIL;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn allocate_record(&mut self) -> u32 {
        let h = if self.vacant != NIL {
            let h = self.vacant;
            self.vacant = self.nodes[h as usize].next;
            h
        } else {
            assert!(
                (self.high_water as usize) < N,
                "extent index full ({N} records)"
            );
            let h = self.high_water;
            self.high_water += 1;
            h
        };
        self.nodes[h as usize] = ExtentNode {
            in_use: true,
            ..ExtentNode::VACANT
        };
        self.len += 1;
        h
    }

    fn release_record(&mut self, h: u32) {
        self.nodes[h as usize] = ExtentNode {
            next: self.vacant,
            ..ExtentNode::VACANT
        };
        self.vacant = h;
        self.len -= 1;
    }
}

/// In-order traversal of one of the trees.
struct InOrder<'a> {
    nodes: &'a [ExtentNode],
    next: u32,
    step: fn(&[ExtentNode], u32) -> u32,
}

impl Iterator for InOrder<'_> {
    type Item = Extent;

    fn next(&mut self) -> Option<Extent> {
        if self.next == NIL {
            return None;
        }
        let h = self.next;
        self.next = (self.step)(self.nodes, h);
        Some(self.nodes[h as usize].extent)
    }
}
