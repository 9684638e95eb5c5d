//! Interval-augmented, copy-on-update red-black tree.
//!
//! Nodes live in a per-tree [`Arena`] and are referred to by `u32` handle
//! rather than by pointer (see [`crate::arena`]). The tree is never mutated
//! in place: every node whose content changes is copied, the copy is
//! published with a single release-ordered store into its parent's child
//! slot (or the root slot), and the old node is chained into a decay list
//! and handed to the grace-period facade. Readers only ever dereference
//! handles reachable from the root through already-published stores, so a
//! concurrent reader never observes a half-built cluster.
//!
//! The rotation and fix-up algorithms below are the standard CLRS
//! red-black insert/delete procedures, generalized so that every node whose
//! color or child set changes is replaced by a fresh arena slot instead of
//! mutated in place; only child-pointer *fields* of otherwise-unchanged
//! ancestors are ever touched after publication.

use alloc::boxed::Box;
use core::cmp::Ordering as KeyOrdering;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::rcu::RcuDomain;

/// Sentinel handle meaning "no node" (empty child, empty tree).
pub const NIL: u32 = u32::MAX;

/// Total order over endpoints, injected at tree construction.
pub trait Comparator<K> {
    fn compare(&self, a: &K, b: &K) -> KeyOrdering;
}

impl<K, F> Comparator<K> for F
where
    F: Fn(&K, &K) -> KeyOrdering,
{
    fn compare(&self, a: &K, b: &K) -> KeyOrdering {
        self(a, b)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    Red,
    Black,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn from_bit(b: u8) -> Self {
        if b == 0 {
            Side::Left
        } else {
            Side::Right
        }
    }

    fn as_bit(self) -> u8 {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

struct Node<K, V> {
    begin: K,
    end: K,
    max_end: K,
    color: Color,
    parent: AtomicU32,
    side: AtomicU8,
    left: AtomicU32,
    right: AtomicU32,
    /// Forwarding pointer to this node's replacement copy; `NIL` in steady
    /// state. Lets a writer holding a stale local handle find the live node.
    decay_next: AtomicU32,
    payload: V,
}

/// An RCU-safe interval tree: `begin`/`end` form a half-open range
/// `[begin, end)`, and `max_end` is maintained as the maximum `end` over a
/// node's whole subtree so [`RbTree::search`] can prune with a single
/// comparison per level.
pub struct RbTree<K, V, C> {
    root: AtomicU32,
    arena: Arena<Node<K, V>>,
    cmp: C,
}

struct Reclaim<K, V> {
    arena: *const Arena<Node<K, V>>,
    handle: u32,
}

unsafe impl<K, V> Send for Reclaim<K, V> {}

unsafe fn reclaim_node<K, V>(p: *mut Reclaim<K, V>) {
    let boxed = Box::from_raw(p);
    let arena = &*boxed.arena;
    arena.drop_in_place(boxed.handle);
    arena.recycle(boxed.handle);
}

impl<K, V, C> RbTree<K, V, C>
where
    K: Copy,
    V: Clone,
    C: Comparator<K>,
{
    pub fn new(cmp: C) -> Self {
        Self {
            root: AtomicU32::new(NIL),
            arena: Arena::new(),
            cmp,
        }
    }

    /// Handle of the root node, or [`NIL`] if the tree is empty.
    #[inline]
    pub fn root(&self) -> u32 {
        self.root.load(Ordering::Acquire)
    }

    #[inline]
    pub fn begin(&self, h: u32) -> K {
        unsafe { self.arena.get(h) }.begin
    }

    #[inline]
    pub fn end(&self, h: u32) -> K {
        unsafe { self.arena.get(h) }.end
    }

    #[inline]
    pub fn max_end(&self, h: u32) -> K {
        unsafe { self.arena.get(h) }.max_end
    }

    #[inline]
    pub fn payload(&self, h: u32) -> &V {
        &unsafe { &*(self.arena.get(h) as *const Node<K, V>) }.payload
    }

    #[inline]
    fn left_of(&self, h: u32) -> u32 {
        if h == NIL {
            NIL
        } else {
            unsafe { self.arena.get(h) }.left.load(Ordering::Acquire)
        }
    }

    #[inline]
    fn right_of(&self, h: u32) -> u32 {
        if h == NIL {
            NIL
        } else {
            unsafe { self.arena.get(h) }.right.load(Ordering::Acquire)
        }
    }

    #[inline]
    fn parent_of(&self, h: u32) -> u32 {
        unsafe { self.arena.get(h) }.parent.load(Ordering::Acquire)
    }

    #[inline]
    fn side_of(&self, h: u32) -> Side {
        Side::from_bit(unsafe { self.arena.get(h) }.side.load(Ordering::Acquire))
    }

    #[inline]
    fn color_of(&self, h: u32) -> Color {
        if h == NIL {
            Color::Black
        } else {
            unsafe { self.arena.get(h) }.color
        }
    }

    fn child_max_end(&self, h: u32) -> Option<K> {
        if h == NIL {
            None
        } else {
            Some(unsafe { self.arena.get(h) }.max_end)
        }
    }

    fn compute_max_end(&self, own_end: K, left: u32, right: u32) -> K {
        let mut m = own_end;
        if let Some(l) = self.child_max_end(left) {
            if self.cmp.compare(&l, &m) == KeyOrdering::Greater {
                m = l;
            }
        }
        if let Some(r) = self.child_max_end(right) {
            if self.cmp.compare(&r, &m) == KeyOrdering::Greater {
                m = r;
            }
        }
        m
    }

    fn set_parent(&self, child: u32, parent: u32, side: Side) {
        if child == NIL {
            return;
        }
        let node = unsafe { self.arena.get(child) };
        node.parent.store(parent, Ordering::Release);
        node.side.store(side.as_bit(), Ordering::Release);
    }

    /// Allocate a fresh node with explicit content, wiring up the children's
    /// parent pointers to point back at it. Does not publish it anywhere.
    unsafe fn alloc_node(&self, begin: K, end: K, color: Color, left: u32, right: u32, payload: V) -> u32 {
        let max_end = self.compute_max_end(end, left, right);
        let node = Node {
            begin,
            end,
            max_end,
            color,
            parent: AtomicU32::new(NIL),
            side: AtomicU8::new(0),
            left: AtomicU32::new(left),
            right: AtomicU32::new(right),
            decay_next: AtomicU32::new(NIL),
            payload,
        };
        let handle = self.arena.alloc(node);
        self.set_parent(left, handle, Side::Left);
        self.set_parent(right, handle, Side::Right);
        handle
    }

    /// Publish `new_handle` into `parent`'s `side` child slot (or the root
    /// slot when `parent == NIL`), and reparent `new_handle` to match. This
    /// is the single release-ordered store that makes a cluster reachable.
    fn publish(&self, parent: u32, side: Side, new_handle: u32) {
        if parent == NIL {
            self.root.store(new_handle, Ordering::Release);
        } else {
            let p = unsafe { self.arena.get(parent) };
            match side {
                Side::Left => p.left.store(new_handle, Ordering::Release),
                Side::Right => p.right.store(new_handle, Ordering::Release),
            }
        }
        self.set_parent(new_handle, parent, side);
    }

    fn supersede(&self, old: u32, new_handle: u32) {
        unsafe { self.arena.get(old) }
            .decay_next
            .store(new_handle, Ordering::Release);
    }

    fn schedule_reclaim(&self, domain: &RcuDomain, handle: u32) {
        let obj = Box::into_raw(Box::new(Reclaim {
            arena: &self.arena as *const _,
            handle,
        }));
        unsafe { domain.defer_reclaim(obj, reclaim_node::<K, V>) };
    }

    fn supersede_and_reclaim(&self, domain: &RcuDomain, old: u32, new_handle: u32) {
        self.supersede(old, new_handle);
        self.schedule_reclaim(domain, old);
    }

    /// Follow `decay_next` forwarding pointers to the newest copy of a node
    /// a writer's local variable may be stale for.
    pub fn decay(&self, mut h: u32) -> u32 {
        loop {
            let next = unsafe { self.arena.get(h) }.decay_next.load(Ordering::Acquire);
            if next == NIL {
                return h;
            }
            h = next;
        }
    }

    fn recolor(&self, domain: &RcuDomain, old: u32, new_color: Color) -> u32 {
        let node = unsafe { self.arena.get(old) };
        let left = node.left.load(Ordering::Acquire);
        let right = node.right.load(Ordering::Acquire);
        let parent = node.parent.load(Ordering::Acquire);
        let side = self.side_of(old);
        let begin = node.begin;
        let end = node.end;
        let payload = node.payload.clone();
        let new_handle = unsafe { self.alloc_node(begin, end, new_color, left, right, payload) };
        self.publish(parent, side, new_handle);
        self.supersede_and_reclaim(domain, old, new_handle);
        new_handle
    }

    /// Walk up from `h`, copying ancestors whose `max_end` needs to grow,
    /// stopping at the first ancestor whose recomputed value matches its
    /// stored one (or at the root).
    fn propagate_max_end(&self, domain: &RcuDomain, mut h: u32) {
        while h != NIL {
            let node = unsafe { self.arena.get(h) };
            let left = node.left.load(Ordering::Acquire);
            let right = node.right.load(Ordering::Acquire);
            let new_max = self.compute_max_end(node.end, left, right);
            if self.cmp.compare(&new_max, &node.max_end) == KeyOrdering::Equal {
                return;
            }
            let parent = node.parent.load(Ordering::Acquire);
            let side = self.side_of(h);
            let color = node.color;
            let begin = node.begin;
            let end = node.end;
            let payload = node.payload.clone();
            let new_h = unsafe { self.alloc_node(begin, end, color, left, right, payload) };
            self.publish(parent, side, new_h);
            self.supersede_and_reclaim(domain, h, new_h);
            h = parent;
        }
    }

    /// Like [`Self::propagate_max_end`], but stops at `ceiling` (copying it
    /// if needed) and returns its current handle instead of publishing it
    /// into its parent's slot — used when the caller is about to replace
    /// `ceiling`'s parent wholesale and will wire the returned handle in
    /// directly.
    fn propagate_max_end_bounded(&self, domain: &RcuDomain, mut h: u32, ceiling: u32) -> u32 {
        loop {
            let node = unsafe { self.arena.get(h) };
            let left = node.left.load(Ordering::Acquire);
            let right = node.right.load(Ordering::Acquire);
            let new_max = self.compute_max_end(node.end, left, right);
            if self.cmp.compare(&new_max, &node.max_end) == KeyOrdering::Equal {
                return ceiling;
            }
            let color = node.color;
            let begin = node.begin;
            let end = node.end;
            let payload = node.payload.clone();
            let new_h = unsafe { self.alloc_node(begin, end, color, left, right, payload) };
            if h == ceiling {
                self.supersede(h, new_h);
                self.schedule_reclaim(domain, h);
                return new_h;
            }
            let parent = node.parent.load(Ordering::Acquire);
            let side = self.side_of(h);
            self.publish(parent, side, new_h);
            self.supersede_and_reclaim(domain, h, new_h);
            h = parent;
        }
    }

    /// Rotate left around `x`, allocating fresh copies of `x` and its right
    /// child `y` and publishing `y`'s copy into `x`'s old slot. Returns the
    /// new subtree root (the copy of `y`); `x`'s decay chain also leads
    /// there via the copy of `x`.
    fn rotate_left(&self, domain: &RcuDomain, x: u32) -> u32 {
        let xn = unsafe { self.arena.get(x) };
        let y = xn.right.load(Ordering::Acquire);
        let x_left = xn.left.load(Ordering::Acquire);
        let x_color = xn.color;
        let x_begin = xn.begin;
        let x_end = xn.end;
        let x_payload = xn.payload.clone();
        let parent = xn.parent.load(Ordering::Acquire);
        let side = self.side_of(x);

        let yn = unsafe { self.arena.get(y) };
        let y_left = yn.left.load(Ordering::Acquire);
        let y_right = yn.right.load(Ordering::Acquire);
        let y_color = yn.color;
        let y_begin = yn.begin;
        let y_end = yn.end;
        let y_payload = yn.payload.clone();

        let new_x = unsafe { self.alloc_node(x_begin, x_end, x_color, x_left, y_left, x_payload) };
        let new_y = unsafe { self.alloc_node(y_begin, y_end, y_color, new_x, y_right, y_payload) };

        self.publish(parent, side, new_y);
        self.supersede_and_reclaim(domain, x, new_x);
        self.supersede_and_reclaim(domain, y, new_y);
        new_y
    }

    fn rotate_right(&self, domain: &RcuDomain, x: u32) -> u32 {
        let xn = unsafe { self.arena.get(x) };
        let y = xn.left.load(Ordering::Acquire);
        let x_right = xn.right.load(Ordering::Acquire);
        let x_color = xn.color;
        let x_begin = xn.begin;
        let x_end = xn.end;
        let x_payload = xn.payload.clone();
        let parent = xn.parent.load(Ordering::Acquire);
        let side = self.side_of(x);

        let yn = unsafe { self.arena.get(y) };
        let y_left = yn.left.load(Ordering::Acquire);
        let y_right = yn.right.load(Ordering::Acquire);
        let y_color = yn.color;
        let y_begin = yn.begin;
        let y_end = yn.end;
        let y_payload = yn.payload.clone();

        let new_x = unsafe { self.alloc_node(x_begin, x_end, x_color, y_right, x_right, x_payload) };
        let new_y = unsafe { self.alloc_node(y_begin, y_end, y_color, y_left, new_x, y_payload) };

        self.publish(parent, side, new_y);
        self.supersede_and_reclaim(domain, x, new_x);
        self.supersede_and_reclaim(domain, y, new_y);
        new_y
    }

    // ------------------------------------------------------------------
    // Read-side operations. Caller must already be inside a read section.
    // ------------------------------------------------------------------

    /// Descend using `max_end` pruning to find a node whose `[begin, end)`
    /// contains `point`.
    pub fn search(&self, point: K) -> Option<u32> {
        let mut cur = self.root();
        while cur != NIL {
            let node = unsafe { self.arena.get(cur) };
            let left = node.left.load(Ordering::Acquire);
            let go_left = if let Some(l_max) = self.child_max_end(left) {
                self.cmp.compare(&l_max, &point) == KeyOrdering::Greater
            } else {
                false
            };
            if go_left {
                cur = left;
                continue;
            }
            let in_range = self.cmp.compare(&node.begin, &point) != KeyOrdering::Greater
                && self.cmp.compare(&point, &node.end) == KeyOrdering::Less;
            if in_range {
                return Some(cur);
            }
            if self.cmp.compare(&point, &node.begin) == KeyOrdering::Greater {
                cur = node.right.load(Ordering::Acquire);
            } else {
                return None;
            }
        }
        None
    }

    /// As [`Self::search`], restricted to nodes whose `end` is not less
    /// than `end`. Assumes the tree holds no partially overlapping ranges.
    pub fn search_range(&self, begin: K, end: K) -> Option<u32> {
        let hit = self.search(begin)?;
        let node_end = self.end(hit);
        if self.cmp.compare(&node_end, &end) == KeyOrdering::Less {
            None
        } else {
            Some(hit)
        }
    }

    /// Classical BST descent keyed on `begin` alone.
    pub fn search_begin_key(&self, k: K) -> Option<u32> {
        let mut cur = self.root();
        while cur != NIL {
            let node = unsafe { self.arena.get(cur) };
            match self.cmp.compare(&k, &node.begin) {
                KeyOrdering::Equal => return Some(cur),
                KeyOrdering::Less => cur = node.left.load(Ordering::Acquire),
                KeyOrdering::Greater => cur = node.right.load(Ordering::Acquire),
            }
        }
        None
    }

    fn tree_min(&self, mut h: u32) -> u32 {
        loop {
            let l = self.left_of(h);
            if l == NIL {
                return h;
            }
            h = l;
        }
    }

    fn tree_max(&self, mut h: u32) -> u32 {
        loop {
            let r = self.right_of(h);
            if r == NIL {
                return h;
            }
            h = r;
        }
    }

    pub fn min(&self) -> Option<u32> {
        let root = self.root();
        if root == NIL {
            None
        } else {
            Some(self.tree_min(root))
        }
    }

    pub fn max(&self) -> Option<u32> {
        let root = self.root();
        if root == NIL {
            None
        } else {
            Some(self.tree_max(root))
        }
    }

    /// In-order successor. Safe to call from within a read section even
    /// while a writer concurrently rotates elsewhere in the tree: the
    /// upward walk only relies on each node's own `side`/`parent` fields,
    /// which are only ever consulted by this walk and the update side.
    pub fn next(&self, x: u32) -> Option<u32> {
        let right = self.right_of(x);
        if right != NIL {
            return Some(self.tree_min(right));
        }
        let mut y = x;
        loop {
            let parent = self.parent_of(y);
            if parent == NIL {
                return None;
            }
            if self.side_of(y) == Side::Left {
                return Some(parent);
            }
            y = parent;
        }
    }

    pub fn prev(&self, x: u32) -> Option<u32> {
        let left = self.left_of(x);
        if left != NIL {
            return Some(self.tree_max(left));
        }
        let mut y = x;
        loop {
            let parent = self.parent_of(y);
            if parent == NIL {
                return None;
            }
            if self.side_of(y) == Side::Right {
                return Some(parent);
            }
            y = parent;
        }
    }

    // ------------------------------------------------------------------
    // Update side.
    // ------------------------------------------------------------------

    pub fn insert(&self, domain: &RcuDomain, begin: K, end: K, payload: V) -> Result<u32> {
        let mut parent = NIL;
        let mut side = Side::Left;
        let mut cur = self.root();
        while cur != NIL {
            let node = unsafe { self.arena.get(cur) };
            match self.cmp.compare(&begin, &node.begin) {
                KeyOrdering::Equal => return Err(Error::AlreadyExists),
                KeyOrdering::Less => {
                    parent = cur;
                    side = Side::Left;
                    cur = node.left.load(Ordering::Acquire);
                }
                KeyOrdering::Greater => {
                    parent = cur;
                    side = Side::Right;
                    cur = node.right.load(Ordering::Acquire);
                }
            }
        }

        let new_handle = unsafe { self.alloc_node(begin, end, Color::Red, NIL, NIL, payload) };
        self.publish(parent, side, new_handle);
        self.propagate_max_end(domain, parent);
        self.insert_fixup(domain, new_handle);
        Ok(new_handle)
    }

    fn insert_fixup(&self, domain: &RcuDomain, mut z: u32) {
        loop {
            let zp = self.parent_of(z);
            if zp == NIL || self.color_of(zp) == Color::Black {
                break;
            }
            let zpp = self.parent_of(zp);
            if zp == self.left_of(zpp) {
                let uncle = self.right_of(zpp);
                if self.color_of(uncle) == Color::Red {
                    let _ = self.recolor(domain, zp, Color::Black);
                    let _ = self.recolor(domain, uncle, Color::Black);
                    z = self.recolor(domain, zpp, Color::Red);
                    continue;
                }
                if z == self.right_of(zp) {
                    z = zp;
                    self.rotate_left(domain, z);
                    z = self.decay(z);
                }
                let zp2 = self.parent_of(z);
                let zp3 = self.recolor(domain, zp2, Color::Black);
                let zpp2 = self.parent_of(zp3);
                let zpp3 = self.recolor(domain, zpp2, Color::Red);
                self.rotate_right(domain, zpp3);
                break;
            } else {
                let uncle = self.left_of(zpp);
                if self.color_of(uncle) == Color::Red {
                    let _ = self.recolor(domain, zp, Color::Black);
                    let _ = self.recolor(domain, uncle, Color::Black);
                    z = self.recolor(domain, zpp, Color::Red);
                    continue;
                }
                if z == self.left_of(zp) {
                    z = zp;
                    self.rotate_right(domain, z);
                    z = self.decay(z);
                }
                let zp2 = self.parent_of(z);
                let zp3 = self.recolor(domain, zp2, Color::Black);
                let zpp2 = self.parent_of(zp3);
                let zpp3 = self.recolor(domain, zpp2, Color::Red);
                self.rotate_left(domain, zpp3);
                break;
            }
        }
        let root = self.root();
        if self.color_of(root) == Color::Red {
            self.recolor(domain, root, Color::Black);
        }
    }

    /// Remove the node at `z`. `z` must be a handle previously returned by
    /// [`Self::insert`] or a read-side lookup performed after that insert;
    /// it must not have been passed to `remove` before.
    pub fn remove(&self, domain: &RcuDomain, z: u32) -> Result<()> {
        let zn = unsafe { self.arena.get(z) };
        let z_left = zn.left.load(Ordering::Acquire);
        let z_right = zn.right.load(Ordering::Acquire);

        let removed_color;
        let x;
        let x_parent;
        let x_side;

        if z_left == NIL {
            let parent = self.parent_of(z);
            let side = self.side_of(z);
            removed_color = self.color_of(z);
            self.publish(parent, side, z_right);
            self.schedule_reclaim(domain, z);
            self.propagate_max_end(domain, parent);
            x = z_right;
            x_parent = parent;
            x_side = side;
        } else if z_right == NIL {
            let parent = self.parent_of(z);
            let side = self.side_of(z);
            removed_color = self.color_of(z);
            self.publish(parent, side, z_left);
            self.schedule_reclaim(domain, z);
            self.propagate_max_end(domain, parent);
            x = z_left;
            x_parent = parent;
            x_side = side;
        } else {
            let y = self.tree_min(z_right);
            removed_color = self.color_of(y);
            let y_right = self.right_of(y);
            let zn2 = unsafe { self.arena.get(z) };
            let z_color = zn2.color;
            let parent = self.parent_of(z);
            let side = self.side_of(z);

            if self.parent_of(y) == z {
                let y_node = unsafe { self.arena.get(y) };
                let y_begin = y_node.begin;
                let y_end = y_node.end;
                let y_payload = y_node.payload.clone();
                let new_y = unsafe { self.alloc_node(y_begin, y_end, z_color, z_left, y_right, y_payload) };
                self.publish(parent, side, new_y);
                self.supersede_and_reclaim(domain, y, new_y);
                self.schedule_reclaim(domain, z);
                x = y_right;
                x_parent = new_y;
                x_side = Side::Right;
                self.propagate_max_end(domain, new_y);
            } else {
                let y_parent = self.parent_of(y);
                self.publish(y_parent, Side::Left, y_right);
                let z_right_updated = self.propagate_max_end_bounded(domain, y_parent, z_right);
                let y_node = unsafe { self.arena.get(y) };
                let y_begin = y_node.begin;
                let y_end = y_node.end;
                let y_payload = y_node.payload.clone();
                let new_y = unsafe { self.alloc_node(y_begin, y_end, z_color, z_left, z_right_updated, y_payload) };
                self.publish(parent, side, new_y);
                self.supersede_and_reclaim(domain, y, new_y);
                self.schedule_reclaim(domain, z);
                x = y_right;
                x_parent = y_parent;
                x_side = Side::Left;
                self.propagate_max_end(domain, new_y);
            }
        }

        if removed_color == Color::Black {
            self.remove_fixup(domain, x, x_parent, x_side);
        }
        Ok(())
    }

    fn remove_fixup(&self, domain: &RcuDomain, mut x: u32, mut x_parent: u32, mut x_side: Side) {
        while x_parent != NIL && self.color_of(x) == Color::Black {
            if x_side == Side::Left {
                let mut w = self.right_of(x_parent);
                if self.color_of(w) == Color::Red {
                    let _ = self.recolor(domain, w, Color::Black);
                    let xp2 = self.recolor(domain, x_parent, Color::Red);
                    self.rotate_left(domain, xp2);
                    x_parent = self.decay(xp2);
                    w = self.right_of(x_parent);
                }
                let wl = self.left_of(w);
                let wr = self.right_of(w);
                if self.color_of(wl) == Color::Black && self.color_of(wr) == Color::Black {
                    let _ = self.recolor(domain, w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent_of(x);
                    if x_parent != NIL {
                        x_side = self.side_of(x);
                    }
                    continue;
                }
                let mut w = w;
                if self.color_of(self.right_of(w)) == Color::Black {
                    let wl2 = self.left_of(w);
                    let _ = self.recolor(domain, wl2, Color::Black);
                    let w2 = self.recolor(domain, w, Color::Red);
                    self.rotate_right(domain, w2);
                    w = self.right_of(x_parent);
                }
                let xp_color = self.color_of(x_parent);
                let _ = self.recolor(domain, w, xp_color);
                let xp2 = self.recolor(domain, x_parent, Color::Black);
                let new_w = self.right_of(xp2);
                let new_w_right = self.right_of(new_w);
                let _ = self.recolor(domain, new_w_right, Color::Black);
                self.rotate_left(domain, xp2);
                x = self.root();
                x_parent = NIL;
                break;
            } else {
                let mut w = self.left_of(x_parent);
                if self.color_of(w) == Color::Red {
                    let _ = self.recolor(domain, w, Color::Black);
                    let xp2 = self.recolor(domain, x_parent, Color::Red);
                    self.rotate_right(domain, xp2);
                    x_parent = self.decay(xp2);
                    w = self.left_of(x_parent);
                }
                let wl = self.left_of(w);
                let wr = self.right_of(w);
                if self.color_of(wl) == Color::Black && self.color_of(wr) == Color::Black {
                    let _ = self.recolor(domain, w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent_of(x);
                    if x_parent != NIL {
                        x_side = self.side_of(x);
                    }
                    continue;
                }
                let mut w = w;
                if self.color_of(self.left_of(w)) == Color::Black {
                    let wr2 = self.right_of(w);
                    let _ = self.recolor(domain, wr2, Color::Black);
                    let w2 = self.recolor(domain, w, Color::Red);
                    self.rotate_left(domain, w2);
                    w = self.left_of(x_parent);
                }
                let xp_color = self.color_of(x_parent);
                let _ = self.recolor(domain, w, xp_color);
                let xp2 = self.recolor(domain, x_parent, Color::Black);
                let new_w = self.left_of(xp2);
                let new_w_left = self.left_of(new_w);
                let _ = self.recolor(domain, new_w_left, Color::Black);
                self.rotate_right(domain, xp2);
                x = self.root();
                x_parent = NIL;
                break;
            }
        }
        if x != NIL {
            self.recolor(domain, x, Color::Black);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp_u32(a: &u32, b: &u32) -> KeyOrdering {
        a.cmp(b)
    }

    #[test]
    fn insert_then_search_begin_key() {
        let domain = RcuDomain::new();
        let tree: RbTree<u32, (), _> = RbTree::new(cmp_u32);
        for &b in &[50u32, 20, 80, 10, 30, 70, 90] {
            tree.insert(&domain, b, b + 5, ()).unwrap();
        }
        for &b in &[50u32, 20, 80, 10, 30, 70, 90] {
            let h = tree.search_begin_key(b).expect("inserted key must be found");
            assert_eq!(tree.begin(h), b);
        }
        assert!(tree.search_begin_key(999).is_none());
    }

    #[test]
    fn duplicate_begin_is_rejected() {
        let domain = RcuDomain::new();
        let tree: RbTree<u32, (), _> = RbTree::new(cmp_u32);
        tree.insert(&domain, 10, 20, ()).unwrap();
        assert_eq!(tree.insert(&domain, 10, 99, ()), Err(Error::AlreadyExists));
    }

    #[test]
    fn search_finds_containing_interval() {
        let domain = RcuDomain::new();
        let tree: RbTree<u32, &'static str, _> = RbTree::new(cmp_u32);
        tree.insert(&domain, 0, 10, "a").unwrap();
        tree.insert(&domain, 20, 25, "b").unwrap();
        tree.insert(&domain, 30, 100, "c").unwrap();

        let hit = tree.search(22).expect("22 is inside [20,25)");
        assert_eq!(*tree.payload(hit), "b");
        let hit = tree.search(50).expect("50 is inside [30,100)");
        assert_eq!(*tree.payload(hit), "c");
        assert!(tree.search(15).is_none());
    }

    #[test]
    fn next_prev_walk_in_sorted_order() {
        let domain = RcuDomain::new();
        let tree: RbTree<u32, (), _> = RbTree::new(cmp_u32);
        let values = [5u32, 3, 8, 1, 4, 7, 9, 2, 6];
        for &v in &values {
            tree.insert(&domain, v, v + 1, ()).unwrap();
        }
        let mut sorted = values.to_vec();
        sorted.sort_unstable();

        let mut observed = alloc::vec::Vec::new();
        let mut cur = tree.min();
        while let Some(h) = cur {
            observed.push(tree.begin(h));
            cur = tree.next(h);
        }
        assert_eq!(observed, sorted);

        let mut observed_rev = alloc::vec::Vec::new();
        let mut cur = tree.max();
        while let Some(h) = cur {
            observed_rev.push(tree.begin(h));
            cur = tree.prev(h);
        }
        sorted.reverse();
        assert_eq!(observed_rev, sorted);
    }

    #[test]
    fn remove_leaf_and_internal_nodes() {
        let domain = RcuDomain::new();
        let tree: RbTree<u32, (), _> = RbTree::new(cmp_u32);
        let values = [50u32, 20, 80, 10, 30, 70, 90, 5, 15];
        for &v in &values {
            tree.insert(&domain, v, v + 1, ()).unwrap();
        }

        let h20 = tree.search_begin_key(20).unwrap();
        tree.remove(&domain, h20).unwrap();
        assert!(tree.search_begin_key(20).is_none());

        let remaining: alloc::vec::Vec<u32> = {
            let mut v = alloc::vec::Vec::new();
            let mut cur = tree.min();
            while let Some(h) = cur {
                v.push(tree.begin(h));
                cur = tree.next(h);
            }
            v
        };
        let mut expected: alloc::vec::Vec<u32> =
            values.iter().copied().filter(|&v| v != 20).collect();
        expected.sort_unstable();
        assert_eq!(remaining, expected);

        let h50 = tree.search_begin_key(50).unwrap();
        tree.remove(&domain, h50).unwrap();
        assert!(tree.search_begin_key(50).is_none());
        domain.barrier();
    }

    #[test]
    fn remove_all_nodes_one_by_one_preserves_order() {
        let domain = RcuDomain::new();
        let tree: RbTree<u32, (), _> = RbTree::new(cmp_u32);
        let values: alloc::vec::Vec<u32> = (0..64).collect();
        for &v in &values {
            tree.insert(&domain, v, v + 1, ()).unwrap();
        }
        for &v in &values {
            let h = tree.search_begin_key(v).expect("present before removal");
            tree.remove(&domain, h).unwrap();
            let mut remaining = alloc::vec::Vec::new();
            let mut cur = tree.min();
            while let Some(h) = cur {
                remaining.push(tree.begin(h));
                cur = tree.next(h);
            }
            let mut sorted = remaining.clone();
            sorted.sort_unstable();
            assert_eq!(remaining, sorted, "in-order walk must stay sorted after removing {v}");
        }
        assert!(tree.min().is_none());
        domain.barrier();
    }
}
