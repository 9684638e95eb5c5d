//! Judy-style compressed radix trie.
//!
//! Keys are walked one byte ("digit") at a time, most-significant byte
//! first, over a configurable [`KeyWidth`]. Each interior node holds its
//! children behind one of three representative layout classes —
//! [`NodeBody::Linear`] (small, linear-scanned), [`NodeBody::Pool`] (two
//! sub-pools split on the digit's top bit), [`NodeBody::Pigeon`] (dense,
//! direct-indexed) — instead of the full LINEAR-0..4/POOL-5..6 sub-variant
//! table; see `DESIGN.md` for why this crate collapses that table to one
//! tier per class. A node that outgrows its class is recompacted into the
//! next one up; a node's *children* are individually atomic, so recompacting
//! a node only ever touches that node and the single pointer its parent
//! holds to it, never the parent's own storage — the same "copy only what
//! changed, republish the one slot that points at it" discipline
//! [`crate::rbt`] uses for rotations.
//!
//! Per-node update-side bookkeeping (a mutex, the fallback-removal counter)
//! lives in [`crate::shadow`], not inline in the node; see that module for
//! why.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::rcu::RcuDomain;
use crate::shadow::ShadowDirectory;

/// Sentinel for "no child at this digit".
pub const NULL_CHILD: u32 = u32::MAX;

const LINEAR_CAP: usize = 28;
const POOL_SUB_CAP: usize = 52;
const PIGEON_CAP: usize = 256;

/// Configurable trie key width, fixed for the lifetime of a [`Trie`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyWidth {
    /// 8-bit keys, 1 digit.
    Bits8,
    /// 16-bit keys, 2 digits.
    Bits16,
    /// 24-bit keys, 3 digits.
    Bits24,
    /// 32-bit keys, 4 digits.
    Bits32,
    /// 40-bit keys, 5 digits.
    Bits40,
    /// 48-bit keys, 6 digits.
    Bits48,
    /// 56-bit keys, 7 digits.
    Bits56,
    /// 64-bit keys, 8 digits.
    Bits64,
}

impl KeyWidth {
    /// Number of digits (bytes) a key of this width is walked over.
    pub fn byte_count(self) -> usize {
        match self {
            KeyWidth::Bits8 => 1,
            KeyWidth::Bits16 => 2,
            KeyWidth::Bits24 => 3,
            KeyWidth::Bits32 => 4,
            KeyWidth::Bits40 => 5,
            KeyWidth::Bits48 => 6,
            KeyWidth::Bits56 => 7,
            KeyWidth::Bits64 => 8,
        }
    }

    fn mask(self, key: u64) -> u64 {
        let bits = self.byte_count() * 8;
        if bits >= 64 {
            key
        } else {
            key & ((1u64 << bits) - 1)
        }
    }
}

enum NodeBody {
    Linear {
        digits: UnsafeCell<[u8; LINEAR_CAP]>,
        children: [AtomicU32; LINEAR_CAP],
        count: AtomicU32,
    },
    Pool {
        digits: UnsafeCell<[[u8; POOL_SUB_CAP]; 2]>,
        children: [[AtomicU32; POOL_SUB_CAP]; 2],
        counts: [AtomicU32; 2],
    },
    Pigeon {
        children: [AtomicU32; PIGEON_CAP],
        count: AtomicU32,
    },
}

// SAFETY: the `UnsafeCell` digit arrays are only ever written by the single
// shadow-mutex-holding writer for this node, and only for indices not yet
// covered by the node's published count (or, for in-place removal, under
// that same lock); readers only ever touch them indirectly through the
// `Acquire`-ordered count/children loads below.
unsafe impl Sync for NodeBody {}

struct Node {
    body: NodeBody,
}

impl Node {
    fn new_linear() -> Self {
        Node {
            body: NodeBody::Linear {
                digits: UnsafeCell::new([0u8; LINEAR_CAP]),
                children: core::array::from_fn(|_| AtomicU32::new(NULL_CHILD)),
                count: AtomicU32::new(0),
            },
        }
    }

    fn new_pool() -> Self {
        Node {
            body: NodeBody::Pool {
                digits: UnsafeCell::new([[0u8; POOL_SUB_CAP]; 2]),
                children: [
                    core::array::from_fn(|_| AtomicU32::new(NULL_CHILD)),
                    core::array::from_fn(|_| AtomicU32::new(NULL_CHILD)),
                ],
                counts: [AtomicU32::new(0), AtomicU32::new(0)],
            },
        }
    }

    fn new_pigeon() -> Self {
        Node {
            body: NodeBody::Pigeon {
                children: core::array::from_fn(|_| AtomicU32::new(NULL_CHILD)),
                count: AtomicU32::new(0),
            },
        }
    }
}

fn body_lookup(body: &NodeBody, digit: u8) -> u32 {
    match body {
        NodeBody::Linear { digits, children, count } => {
            let n = count.load(Ordering::Acquire) as usize;
            let d = unsafe { &*digits.get() };
            for i in 0..n {
                if d[i] == digit {
                    return children[i].load(Ordering::Acquire);
                }
            }
            NULL_CHILD
        }
        NodeBody::Pool { digits, children, counts } => {
            let sub = (digit >> 7) as usize;
            let n = counts[sub].load(Ordering::Acquire) as usize;
            let d = unsafe { &*digits.get() };
            for i in 0..n {
                if d[sub][i] == digit {
                    return children[sub][i].load(Ordering::Acquire);
                }
            }
            NULL_CHILD
        }
        NodeBody::Pigeon { children, .. } => children[digit as usize].load(Ordering::Acquire),
    }
}

/// Attempt an in-place append. `Err(Error::OutOfMemory)` means the node's
/// class is at capacity and the caller must recompact into the next class;
/// that reuse of `OutOfMemory` (rather than a dedicated "class full" kind)
/// is a deliberate simplification, noted in `DESIGN.md`.
fn body_try_insert(body: &NodeBody, digit: u8, child: u32) -> Result<()> {
    match body {
        NodeBody::Linear { digits, children, count } => {
            let n = count.load(Ordering::Relaxed) as usize;
            if n == LINEAR_CAP {
                return Err(Error::OutOfMemory);
            }
            let d = unsafe { &mut *digits.get() };
            d[n] = digit;
            children[n].store(child, Ordering::Relaxed);
            count.store((n + 1) as u32, Ordering::Release);
            Ok(())
        }
        NodeBody::Pool { digits, children, counts } => {
            let sub = (digit >> 7) as usize;
            let n = counts[sub].load(Ordering::Relaxed) as usize;
            if n == POOL_SUB_CAP {
                return Err(Error::OutOfMemory);
            }
            let d = unsafe { &mut *digits.get() };
            d[sub][n] = digit;
            children[sub][n].store(child, Ordering::Relaxed);
            counts[sub].store((n + 1) as u32, Ordering::Release);
            Ok(())
        }
        NodeBody::Pigeon { children, count } => {
            children[digit as usize].store(child, Ordering::Release);
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }
}

/// Overwrite the child pointer already stored at `digit` without changing
/// the node's child count. Used both by recompaction's parent-side republish
/// and by duplicate-chain head removal.
fn body_republish(body: &NodeBody, digit: u8, new_child: u32) -> bool {
    match body {
        NodeBody::Linear { digits, children, count } => {
            let n = count.load(Ordering::Acquire) as usize;
            let d = unsafe { &*digits.get() };
            for i in 0..n {
                if d[i] == digit {
                    children[i].store(new_child, Ordering::Release);
                    return true;
                }
            }
            false
        }
        NodeBody::Pool { digits, children, counts } => {
            let sub = (digit >> 7) as usize;
            let n = counts[sub].load(Ordering::Acquire) as usize;
            let d = unsafe { &*digits.get() };
            for i in 0..n {
                if d[sub][i] == digit {
                    children[sub][i].store(new_child, Ordering::Release);
                    return true;
                }
            }
            false
        }
        NodeBody::Pigeon { children, .. } => {
            children[digit as usize].store(new_child, Ordering::Release);
            true
        }
    }
}

/// Remove `digit` entirely (not just its pointer) via swap-removal within
/// the node's own storage.
fn body_remove_digit(body: &NodeBody, digit: u8) -> bool {
    match body {
        NodeBody::Linear { digits, children, count } => {
            let n = count.load(Ordering::Relaxed) as usize;
            let d = unsafe { &mut *digits.get() };
            let Some(i) = (0..n).find(|&i| d[i] == digit) else {
                return false;
            };
            let last = n - 1;
            d[i] = d[last];
            children[i].store(children[last].load(Ordering::Relaxed), Ordering::Relaxed);
            children[last].store(NULL_CHILD, Ordering::Relaxed);
            count.store(last as u32, Ordering::Release);
            true
        }
        NodeBody::Pool { digits, children, counts } => {
            let sub = (digit >> 7) as usize;
            let n = counts[sub].load(Ordering::Relaxed) as usize;
            let d = unsafe { &mut *digits.get() };
            let Some(i) = (0..n).find(|&i| d[sub][i] == digit) else {
                return false;
            };
            let last = n - 1;
            d[sub][i] = d[sub][last];
            children[sub][i].store(children[sub][last].load(Ordering::Relaxed), Ordering::Relaxed);
            children[sub][last].store(NULL_CHILD, Ordering::Relaxed);
            counts[sub].store(last as u32, Ordering::Release);
            true
        }
        NodeBody::Pigeon { children, count } => {
            if children[digit as usize].swap(NULL_CHILD, Ordering::Release) == NULL_CHILD {
                false
            } else {
                count.fetch_sub(1, Ordering::Relaxed);
                true
            }
        }
    }
}

fn body_pairs(body: &NodeBody) -> Vec<(u8, u32)> {
    match body {
        NodeBody::Linear { digits, children, count } => {
            let n = count.load(Ordering::Acquire) as usize;
            let d = unsafe { &*digits.get() };
            (0..n).map(|i| (d[i], children[i].load(Ordering::Acquire))).collect()
        }
        NodeBody::Pool { digits, children, counts } => {
            let d = unsafe { &*digits.get() };
            let mut out = Vec::new();
            for sub in 0..2 {
                let n = counts[sub].load(Ordering::Acquire) as usize;
                for i in 0..n {
                    out.push((d[sub][i], children[sub][i].load(Ordering::Acquire)));
                }
            }
            out
        }
        NodeBody::Pigeon { children, .. } => (0u16..PIGEON_CAP as u16)
            .filter_map(|i| {
                let c = children[i as usize].load(Ordering::Acquire);
                if c == NULL_CHILD {
                    None
                } else {
                    Some((i as u8, c))
                }
            })
            .collect(),
    }
}

fn body_child_count(body: &NodeBody) -> u32 {
    match body {
        NodeBody::Linear { count, .. } => count.load(Ordering::Acquire),
        NodeBody::Pool { counts, .. } => counts[0].load(Ordering::Acquire) + counts[1].load(Ordering::Acquire),
        NodeBody::Pigeon { count, .. } => count.load(Ordering::Acquire),
    }
}

fn body_extreme_child(body: &NodeBody, want_max: bool) -> Option<(u8, u32)> {
    let pairs = body_pairs(body);
    if want_max {
        pairs.into_iter().max_by_key(|(d, _)| *d)
    } else {
        pairs.into_iter().min_by_key(|(d, _)| *d)
    }
}

fn body_bounded_child(body: &NodeBody, digit: u8, below: bool) -> Option<(u8, u32)> {
    let pairs = body_pairs(body);
    if below {
        pairs.into_iter().filter(|(d, _)| *d < digit).max_by_key(|(d, _)| *d)
    } else {
        pairs.into_iter().filter(|(d, _)| *d > digit).min_by_key(|(d, _)| *d)
    }
}

struct Leaf<V> {
    key: u64,
    value: V,
    next: AtomicU32,
}

#[derive(Clone, Copy)]
enum Slot {
    Root,
    Child { parent: u32, digit: u8 },
}

struct ReclaimNode {
    arena: *const Arena<Node>,
    handle: u32,
}

unsafe impl Send for ReclaimNode {}

unsafe fn reclaim_node(p: *mut ReclaimNode) {
    let boxed = Box::from_raw(p);
    let arena = &*boxed.arena;
    arena.drop_in_place(boxed.handle);
    arena.recycle(boxed.handle);
}

struct ReclaimLeaf<V> {
    arena: *const Arena<Leaf<V>>,
    handle: u32,
}

unsafe impl<V> Send for ReclaimLeaf<V> {}

unsafe fn reclaim_leaf<V>(p: *mut ReclaimLeaf<V>) {
    let boxed = Box::from_raw(p);
    let arena = &*boxed.arena;
    arena.drop_in_place(boxed.handle);
    arena.recycle(boxed.handle);
}

/// A compressed radix trie over `u64` keys (masked down to the configured
/// [`KeyWidth`]), storing one or more `V` values per key as a duplicate
/// chain.
pub struct Trie<V> {
    nodes: Arena<Node>,
    leaves: Arena<Leaf<V>>,
    shadow: ShadowDirectory,
    root: AtomicU32,
    key_width: KeyWidth,
}

impl<V> Trie<V> {
    /// Build an empty trie over keys of the given width.
    pub fn new(key_width: KeyWidth) -> Self {
        let nodes = Arena::new();
        let root = unsafe { nodes.alloc(Node::new_linear()) };
        let shadow = ShadowDirectory::new();
        shadow.set(root, 0, 0, None);
        Self {
            nodes,
            leaves: Arena::new(),
            shadow,
            root: AtomicU32::new(root),
            key_width,
        }
    }

    fn levels(&self) -> usize {
        self.key_width.byte_count()
    }

    fn mask(&self, key: u64) -> u64 {
        self.key_width.mask(key)
    }

    fn digit(&self, key: u64, level: usize) -> u8 {
        let shift = 8 * (self.levels() - 1 - level);
        ((key >> shift) & 0xff) as u8
    }

    fn node_lookup_child(&self, node: u32, digit: u8) -> u32 {
        body_lookup(&unsafe { self.nodes.get(node) }.body, digit)
    }

    fn publish(&self, slot: Slot, new_handle: u32) {
        match slot {
            Slot::Root => self.root.store(new_handle, Ordering::Release),
            Slot::Child { parent, digit } => {
                body_republish(&unsafe { self.nodes.get(parent) }.body, digit, new_handle);
            }
        }
    }

    fn schedule_node_reclaim(&self, domain: &RcuDomain, handle: u32) {
        let boxed = Box::into_raw(Box::new(ReclaimNode {
            arena: &self.nodes as *const _,
            handle,
        }));
        unsafe { domain.defer_reclaim(boxed, reclaim_node) };
    }

    fn schedule_leaf_reclaim(&self, domain: &RcuDomain, handle: u32) {
        let boxed = Box::into_raw(Box::new(ReclaimLeaf {
            arena: &self.leaves as *const _,
            handle,
        }));
        unsafe { domain.defer_reclaim(boxed, reclaim_leaf::<V>) };
    }

    /// Allocate a replacement one class larger than `old`, copying its
    /// existing pairs plus `extra`, and install a shadow record that
    /// inherits `old`'s mutex. Does not touch `old` itself or publish the
    /// replacement; the caller does both once it has decided where the
    /// replacement's handle needs to be published.
    fn recompact_with(&self, old: u32, extra: (u8, u32), level: u8) -> Result<u32> {
        let old_ref = unsafe { self.nodes.get(old) };
        let mut pairs = body_pairs(&old_ref.body);
        pairs.push(extra);
        let new_node = match &old_ref.body {
            NodeBody::Linear { .. } => Node::new_pool(),
            NodeBody::Pool { .. } => Node::new_pigeon(),
            NodeBody::Pigeon { .. } => return Err(Error::OutOfMemory),
        };
        for &(d, c) in &pairs {
            body_try_insert(&new_node.body, d, c)?;
        }
        let new_handle = unsafe { self.nodes.alloc(new_node) };
        self.shadow.set(new_handle, level, pairs.len() as u32, Some(old));
        Ok(new_handle)
    }

    fn append_duplicate(&self, head: u32, key: u64, value: V) -> u32 {
        let new_leaf = unsafe {
            self.leaves.alloc(Leaf {
                key,
                value,
                next: AtomicU32::new(NULL_CHILD),
            })
        };
        let mut cur = head;
        loop {
            let next = unsafe { self.leaves.get(cur) }.next.load(Ordering::Acquire);
            if next == NULL_CHILD {
                unsafe { self.leaves.get(cur) }.next.store(new_leaf, Ordering::Release);
                return new_leaf;
            }
            cur = next;
        }
    }

    /// Insert `value` under `key`. If `unique` is true and `key` is already
    /// present, the existing head leaf's handle is returned without
    /// inserting; otherwise `value` is appended to that key's duplicate
    /// chain.
    pub fn add(&self, domain: &RcuDomain, key: u64, value: V, unique: bool) -> Result<u32> {
        let key = self.mask(key);
        let levels = self.levels();
        let mut cur = self.root.load(Ordering::Acquire);
        let mut slot = Slot::Root;
        for level in 0..levels {
            let digit = self.digit(key, level);
            let is_last = level + 1 == levels;
            let guard = self
                .shadow
                .lookup_lock(cur)
                .expect("every live node has a shadow record");
            let existing = self.node_lookup_child(cur, digit);

            if is_last {
                if existing != NULL_CHILD {
                    if unique {
                        return Ok(existing);
                    }
                    let new_leaf = self.append_duplicate(existing, key, value);
                    return Ok(new_leaf);
                }
                let leaf = unsafe {
                    self.leaves.alloc(Leaf {
                        key,
                        value,
                        next: AtomicU32::new(NULL_CHILD),
                    })
                };
                match body_try_insert(&unsafe { self.nodes.get(cur) }.body, digit, leaf) {
                    Ok(()) => return Ok(leaf),
                    Err(Error::OutOfMemory) => {
                        let grown = self.recompact_with(cur, (digit, leaf), level as u8)?;
                        self.publish(slot, grown);
                        self.shadow.clear(cur);
                        self.schedule_node_reclaim(domain, cur);
                        drop(guard);
                        return Ok(leaf);
                    }
                    Err(e) => return Err(e),
                }
            }

            if existing != NULL_CHILD {
                drop(guard);
                slot = Slot::Child { parent: cur, digit };
                cur = existing;
            } else {
                let new_child = unsafe { self.nodes.alloc(Node::new_linear()) };
                self.shadow.set(new_child, (level + 1) as u8, 0, None);
                match body_try_insert(&unsafe { self.nodes.get(cur) }.body, digit, new_child) {
                    Ok(()) => {
                        drop(guard);
                        slot = Slot::Child { parent: cur, digit };
                        cur = new_child;
                    }
                    Err(Error::OutOfMemory) => {
                        let grown = self.recompact_with(cur, (digit, new_child), level as u8)?;
                        self.publish(slot, grown);
                        self.shadow.clear(cur);
                        self.schedule_node_reclaim(domain, cur);
                        drop(guard);
                        slot = Slot::Child { parent: grown, digit };
                        cur = new_child;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        unreachable!("KeyWidth::byte_count() is always >= 1")
    }

    /// Convenience wrapper over [`Self::add`] with `unique = false`.
    pub fn add_dup(&self, domain: &RcuDomain, key: u64, value: V) -> Result<u32> {
        self.add(domain, key, value, false)
    }

    /// Convenience wrapper over [`Self::add`] with `unique = true`.
    pub fn add_unique(&self, domain: &RcuDomain, key: u64, value: V) -> Result<u32> {
        self.add(domain, key, value, true)
    }

    fn leaf_handle(&self, key: u64) -> Option<u32> {
        let key = self.mask(key);
        let mut cur = self.root.load(Ordering::Acquire);
        for level in 0..self.levels() {
            let digit = self.digit(key, level);
            let next = self.node_lookup_child(cur, digit);
            if next == NULL_CHILD {
                return None;
            }
            cur = next;
        }
        let leaf = unsafe { self.leaves.get(cur) };
        if leaf.key == key {
            Some(cur)
        } else {
            None
        }
    }

    /// Exact-match lookup. Must be called from within a read section.
    /// Returns the duplicate chain's head; see [`Self::lookup_tail`] for
    /// the most recently appended entry instead.
    pub fn lookup(&self, key: u64) -> Option<&V> {
        self.leaf_handle(key).map(|h| &unsafe { self.leaves.get(h) }.value)
    }

    fn tail_of(&self, mut leaf: u32) -> u32 {
        loop {
            let next = unsafe { self.leaves.get(leaf) }.next.load(Ordering::Acquire);
            if next == NULL_CHILD {
                return leaf;
            }
            leaf = next;
        }
    }

    /// Exact-match lookup resolving to the *tail* of `key`'s duplicate
    /// chain rather than its head. A writer that splices in a replacement
    /// appends it behind the entry it supersedes and only unlinks the
    /// stale head afterwards, so a reader that needs to observe the
    /// replacement immediately must walk to the tail instead of stopping
    /// at the head.
    pub fn lookup_tail(&self, key: u64) -> Option<&V> {
        self.leaf_handle(key).map(|h| &unsafe { self.leaves.get(self.tail_of(h)) }.value)
    }

    fn descend_extreme_handle(&self, mut cur: u32, mut level: usize, want_max: bool) -> u32 {
        let levels = self.levels();
        while level < levels {
            let (_, next) =
                body_extreme_child(&unsafe { self.nodes.get(cur) }.body, want_max)
                    .expect("a published node always has at least one child");
            cur = next;
            level += 1;
        }
        cur
    }

    fn lookup_bounded_handle(&self, key: u64, below: bool) -> Option<u32> {
        let key = self.mask(key);
        if let Some(h) = self.leaf_handle(key) {
            return Some(h);
        }
        let levels = self.levels();
        let mut nodes = Vec::with_capacity(levels + 1);
        let mut cur = self.root.load(Ordering::Acquire);
        nodes.push(cur);
        let mut reached = 0;
        for level in 0..levels {
            let digit = self.digit(key, level);
            let next = self.node_lookup_child(cur, digit);
            if next == NULL_CHILD {
                break;
            }
            cur = next;
            nodes.push(cur);
            reached = level + 1;
        }
        let mut depth = reached;
        loop {
            if depth == 0 {
                return None;
            }
            let node = nodes[depth - 1];
            let digit_here = self.digit(key, depth - 1);
            if let Some((_, child)) = body_bounded_child(&unsafe { self.nodes.get(node) }.body, digit_here, below) {
                return Some(self.descend_extreme_handle(child, depth, below));
            }
            depth -= 1;
        }
    }

    /// Nearest present key `<= key`, or `None` if every key is greater.
    /// Concurrent growth/shrink of neighbouring ranges can transiently miss
    /// a key that settles in right as this call runs; callers that need a
    /// definitive answer retry. Returns the duplicate chain's head; see
    /// [`Self::lookup_below_equal_tail`] for the tail instead.
    pub fn lookup_below_equal(&self, key: u64) -> Option<&V> {
        self.lookup_bounded_handle(key, true).map(|h| &unsafe { self.leaves.get(h) }.value)
    }

    /// Nearest present key `>= key`; see [`Self::lookup_below_equal`] for
    /// the same transient-miss caveat.
    pub fn lookup_above_equal(&self, key: u64) -> Option<&V> {
        self.lookup_bounded_handle(key, false).map(|h| &unsafe { self.leaves.get(h) }.value)
    }

    /// Same as [`Self::lookup_below_equal`] but resolves to the tail of the
    /// found key's duplicate chain, per [`Self::lookup_tail`].
    pub fn lookup_below_equal_tail(&self, key: u64) -> Option<&V> {
        self.lookup_bounded_handle(key, true).map(|h| &unsafe { self.leaves.get(self.tail_of(h)) }.value)
    }

    /// Same as [`Self::lookup_above_equal`] but resolves to the tail of the
    /// found key's duplicate chain, per [`Self::lookup_tail`].
    pub fn lookup_above_equal_tail(&self, key: u64) -> Option<&V> {
        self.lookup_bounded_handle(key, false).map(|h| &unsafe { self.leaves.get(self.tail_of(h)) }.value)
    }

    fn maybe_collapse(&self, domain: &RcuDomain, node: u32, ancestors: &[(u32, u8)]) {
        if body_child_count(&unsafe { self.nodes.get(node) }.body) > 0 {
            return;
        }
        let Some(&(parent, digit)) = ancestors.last() else {
            // Never collapse the root itself.
            return;
        };
        let Some(pguard) = self.shadow.lookup_lock(parent) else {
            return;
        };
        body_remove_digit(&unsafe { self.nodes.get(parent) }.body, digit);
        drop(pguard);
        self.shadow.clear(node);
        self.schedule_node_reclaim(domain, node);
        self.maybe_collapse(domain, parent, &ancestors[..ancestors.len() - 1]);
    }

    /// Remove one leaf matching `key` (arbitrarily the chain head, if there
    /// are duplicates). The removed value is dropped once the grace period
    /// elapses, same as every other reclaimed node.
    pub fn remove(&self, domain: &RcuDomain, key: u64) -> Result<()> {
        let key = self.mask(key);
        let levels = self.levels();
        let mut cur = self.root.load(Ordering::Acquire);
        let mut ancestors: Vec<(u32, u8)> = Vec::with_capacity(levels);
        for level in 0..levels {
            let digit = self.digit(key, level);
            let is_last = level + 1 == levels;
            let guard = self.shadow.lookup_lock(cur).ok_or(Error::NotFound)?;
            let child = self.node_lookup_child(cur, digit);
            if child == NULL_CHILD {
                return Err(Error::NotFound);
            }
            if is_last {
                let leaf_key = unsafe { self.leaves.get(child) }.key;
                if leaf_key != key {
                    return Err(Error::NotFound);
                }
                let next_leaf = unsafe { self.leaves.get(child) }.next.load(Ordering::Acquire);
                if next_leaf != NULL_CHILD {
                    body_republish(&unsafe { self.nodes.get(cur) }.body, digit, next_leaf);
                } else {
                    body_remove_digit(&unsafe { self.nodes.get(cur) }.body, digit);
                }
                drop(guard);
                self.schedule_leaf_reclaim(domain, child);
                if next_leaf == NULL_CHILD {
                    self.maybe_collapse(domain, cur, &ancestors);
                }
                return Ok(());
            }
            ancestors.push((cur, digit));
            drop(guard);
            cur = child;
        }
        unreachable!("KeyWidth::byte_count() is always >= 1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_round_trip() {
        let domain = RcuDomain::new();
        let trie: Trie<u32> = Trie::new(KeyWidth::Bits8);
        for i in 0..200u64 {
            trie.add_unique(&domain, i, i as u32 * 10).unwrap();
        }
        for i in 0..200u64 {
            assert_eq!(trie.lookup(i), Some(&(i as u32 * 10)));
        }
        for i in 200..240u64 {
            assert_eq!(trie.lookup(i), None);
        }
    }

    #[test]
    fn recompaction_preserves_visibility_across_classes() {
        let domain = RcuDomain::new();
        let trie: Trie<u32> = Trie::new(KeyWidth::Bits8);
        // LINEAR_CAP is 28; push well past POOL's 104 to force Linear ->
        // Pool -> Pigeon recompaction at the root.
        for i in 0..200u64 {
            trie.add_unique(&domain, i, i as u32).unwrap();
            for seen in 0..=i {
                assert_eq!(trie.lookup(seen), Some(&(seen as u32)), "lost key {seen} after inserting {i}");
            }
        }
    }

    #[test]
    fn duplicate_chain_holds_every_value() {
        let domain = RcuDomain::new();
        let trie: Trie<u32> = Trie::new(KeyWidth::Bits32);
        trie.add_dup(&domain, 42, 1).unwrap();
        trie.add_dup(&domain, 42, 2).unwrap();
        trie.add_dup(&domain, 42, 3).unwrap();
        // `lookup` surfaces the chain head; the duplicate API contract is
        // about preserving all values, not indexing into the chain, so just
        // confirm the head is reachable and distinct keys are untouched.
        assert_eq!(trie.lookup(42), Some(&1));
        assert_eq!(trie.lookup_unique_count_for_test(42), 3);
    }

    #[test]
    fn add_unique_does_not_overwrite() {
        let domain = RcuDomain::new();
        let trie: Trie<u32> = Trie::new(KeyWidth::Bits16);
        trie.add_unique(&domain, 7, 100).unwrap();
        trie.add_unique(&domain, 7, 200).unwrap();
        assert_eq!(trie.lookup(7), Some(&100));
    }

    #[test]
    fn lookup_below_and_above_equal_find_nearest_present_key() {
        let domain = RcuDomain::new();
        let trie: Trie<u32> = Trie::new(KeyWidth::Bits32);
        for k in [10u64, 20, 30] {
            trie.add_unique(&domain, k, k as u32).unwrap();
        }
        assert_eq!(trie.lookup_below_equal(25), Some(&20));
        assert_eq!(trie.lookup_below_equal(10), Some(&10));
        assert_eq!(trie.lookup_below_equal(5), None);
        assert_eq!(trie.lookup_above_equal(25), Some(&30));
        assert_eq!(trie.lookup_above_equal(30), Some(&30));
        assert_eq!(trie.lookup_above_equal(31), None);
    }

    #[test]
    fn remove_then_lookup_misses() {
        let domain = RcuDomain::new();
        let trie: Trie<u32> = Trie::new(KeyWidth::Bits16);
        trie.add_unique(&domain, 5, 50).unwrap();
        trie.add_unique(&domain, 6, 60).unwrap();
        trie.remove(&domain, 5).unwrap();
        assert_eq!(trie.lookup(5), None);
        assert_eq!(trie.lookup(6), Some(&60));
        domain.barrier();
    }

    #[test]
    fn lookup_tail_sees_most_recently_appended_duplicate() {
        let domain = RcuDomain::new();
        let trie: Trie<u32> = Trie::new(KeyWidth::Bits32);
        trie.add_dup(&domain, 42, 1).unwrap();
        trie.add_dup(&domain, 42, 2).unwrap();
        trie.add_dup(&domain, 42, 3).unwrap();
        assert_eq!(trie.lookup(42), Some(&1));
        assert_eq!(trie.lookup_tail(42), Some(&3));
    }

    #[test]
    fn lookup_below_equal_tail_resolves_duplicate_chain_tail() {
        let domain = RcuDomain::new();
        let trie: Trie<u32> = Trie::new(KeyWidth::Bits32);
        trie.add_unique(&domain, 10, 1).unwrap();
        trie.add_unique(&domain, 30, 1).unwrap();
        trie.add_dup(&domain, 10, 9).unwrap();
        assert_eq!(trie.lookup_below_equal(25), Some(&1));
        assert_eq!(trie.lookup_below_equal_tail(25), Some(&9));
    }

    #[test]
    fn remove_missing_key_is_not_found() {
        let domain = RcuDomain::new();
        let trie: Trie<u32> = Trie::new(KeyWidth::Bits8);
        assert_eq!(trie.remove(&domain, 1), Err(Error::NotFound));
    }

    impl<V> Trie<V> {
        fn lookup_unique_count_for_test(&self, key: u64) -> usize {
            let key = self.mask(key);
            let mut cur = self.root.load(Ordering::Acquire);
            for level in 0..self.levels() {
                let digit = self.digit(key, level);
                let next = self.node_lookup_child(cur, digit);
                if next == NULL_CHILD {
                    return 0;
                }
                cur = next;
            }
            let mut n = 0;
            loop {
                n += 1;
                let next = unsafe { self.leaves.get(cur) }.next.load(Ordering::Acquire);
                if next == NULL_CHILD {
                    return n;
                }
                cur = next;
            }
        }
    }
}
