//! Range-interval partition layer.
//!
//! Partitions `[0, u64::MAX - 1]` into disjoint, contiguous segments, each
//! either `free`, `allocated`, or (transiently, while a concurrent split or
//! merge is in flight) `removed`. Segments are stored as trie leaves keyed
//! by their own `start`, reusing [`crate::trie::Trie`]'s
//! `lookup_tail`/`lookup_below_equal_tail` for neighbour lookups instead of
//! a bespoke search. Unlike [`crate::rbt`], segments are never copy-on-write
//! updated in place: `range_add`/`range_del` always build brand-new
//! replacement segments and splice them in via `add_dup` before removing
//! the old segment, matching §4.4's "insert replacements before removing
//! the old segment" ordering — the *tail* lookups are what let a
//! concurrent reader observe the freshly appended replacement rather than
//! the stale segment still sitting at the chain head.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::rcu::RcuDomain;
use crate::spinlock::{FasLock, FasLockGuard};
use crate::trie::{KeyWidth, Trie};

const REMOVED_RETRY_BUDGET: usize = 64;

/// A segment's place in the one-way `free|allocated -> removed` state
/// machine (§4.5). `Removed` is transient: it marks a segment mid-replacement
/// so a concurrent reader or racing updater can tell to retry rather than
/// trust its `start`/`end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Available for a future `range_add`.
    Free,
    /// Owned by some caller-assigned `Priv`.
    Allocated,
    /// Superseded; awaiting reclamation.
    Removed,
}

impl SegmentKind {
    fn to_tag(self) -> u8 {
        match self {
            SegmentKind::Free => 0,
            SegmentKind::Allocated => 1,
            SegmentKind::Removed => 2,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => SegmentKind::Free,
            1 => SegmentKind::Allocated,
            _ => SegmentKind::Removed,
        }
    }
}

/// One contiguous, inclusive-ended span of the partitioned address space.
pub struct Segment<P> {
    start: u64,
    end: u64,
    kind: AtomicU8,
    /// Caller-owned payload, e.g. the allocation's owner or backing object.
    pub priv_data: P,
    mutex: FasLock<()>,
}

impl<P> Segment<P> {
    fn new(start: u64, end: u64, kind: SegmentKind, priv_data: P) -> Self {
        Self {
            start,
            end,
            kind: AtomicU8::new(kind.to_tag()),
            priv_data,
            mutex: FasLock::new(()),
        }
    }

    /// Inclusive start of this segment.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive end of this segment.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Current state-machine position.
    pub fn kind(&self) -> SegmentKind {
        SegmentKind::from_tag(self.kind.load(Ordering::Acquire))
    }

    fn mark_removed(&self) {
        self.kind.store(SegmentKind::Removed.to_tag(), Ordering::Release);
    }

    /// Take this segment's private lock, for caller bookkeeping that needs
    /// to be serialized against concurrent `range_del` of the same segment.
    pub fn lock(&self) -> FasLockGuard<'_, ()> {
        self.mutex.lock()
    }
}

/// A range-interval partition over `[0, u64::MAX - 1]`, with one initial
/// all-covering free segment.
pub struct RangeLayer<P> {
    trie: Trie<Segment<P>>,
}

impl<P> RangeLayer<P> {
    /// Build a fresh partition: a single free segment covering the whole
    /// address space.
    pub fn new(domain: &RcuDomain, whole_space_priv_for_free: P) -> Self {
        let trie = Trie::new(KeyWidth::Bits64);
        trie.add_unique(domain, 0, Segment::new(0, u64::MAX - 1, SegmentKind::Free, whole_space_priv_for_free))
            .expect("fresh trie always accepts the first insert");
        Self { trie }
    }

    fn segment_covering(&self, point: u64) -> Option<&Segment<P>> {
        self.trie.lookup_below_equal_tail(point).filter(|s| s.end >= point)
    }

    /// Find the allocated segment covering `point`, if any. Must be called
    /// from within a read section. A transiently `Removed` segment (mid
    /// split/merge) is reported as absent, per §4.6.
    pub fn range_lookup(&self, point: u64) -> Option<&Segment<P>> {
        self.segment_covering(point).filter(|s| s.kind() == SegmentKind::Allocated)
    }

    /// Mark `[start, end]` as allocated, carving it out of the free segment
    /// that currently covers it.
    ///
    /// Fails with [`Error::Invalid`] if `start > end` or `end == u64::MAX`,
    /// and with [`Error::AlreadyExists`] if the target span is not entirely
    /// free.
    pub fn range_add(&self, domain: &RcuDomain, start: u64, end: u64, priv_data: P) -> Result<()>
    where
        P: Clone,
    {
        if start > end || end == u64::MAX {
            return Err(Error::Invalid);
        }
        for _ in 0..REMOVED_RETRY_BUDGET {
            let Some(old) = self.segment_covering(start) else {
                return Err(Error::AlreadyExists);
            };
            if old.kind() != SegmentKind::Free || old.start > start || old.end < end {
                return Err(Error::AlreadyExists);
            }
            let old_start = old.start;
            let old_end = old.end;
            let guard = old.lock();
            if old.kind() != SegmentKind::Free {
                drop(guard);
                continue; // lost a race with a concurrent range_add/range_del; retry
            }

            // These inserts land before `old` is removed below, so any of
            // them may briefly share a trie key with `old` itself (e.g.
            // the left piece at `old_start` when `start == old_start`).
            // `add_dup` appends behind the still-present `old` rather than
            // silently dropping the new segment the way `add_unique` would.
            if old_start < start {
                self.trie
                    .add_dup(domain, old_start, Segment::new(old_start, start - 1, SegmentKind::Free, priv_data.clone()))
                    .map_err(|_| Error::OutOfMemory)?;
            }
            if end < old_end {
                self.trie
                    .add_dup(domain, end + 1, Segment::new(end + 1, old_end, SegmentKind::Free, priv_data.clone()))
                    .map_err(|_| Error::OutOfMemory)?;
            }
            self.trie
                .add_dup(domain, start, Segment::new(start, end, SegmentKind::Allocated, priv_data))
                .map_err(|_| Error::OutOfMemory)?;

            old.mark_removed();
            drop(guard);
            self.trie.remove(domain, old_start).ok();
            return Ok(());
        }
        Err(Error::AlreadyExists)
    }

    /// Release `[start, end]`, merging with an adjacent free neighbour on
    /// either side if one exists, so no two free segments ever end up
    /// adjacent once quiesced.
    pub fn range_del(&self, domain: &RcuDomain, start: u64, end: u64, free_priv: P) -> Result<()>
    where
        P: Clone,
    {
        if start > end {
            return Err(Error::Invalid);
        }
        for _ in 0..REMOVED_RETRY_BUDGET {
            let Some(target) = self.trie.lookup_tail(start) else {
                return Err(Error::NotFound);
            };
            if target.start != start || target.end != end || target.kind() != SegmentKind::Allocated {
                return Err(Error::NotFound);
            }

            let left = if start > 0 {
                self.segment_covering(start - 1).filter(|s| s.kind() == SegmentKind::Free)
            } else {
                None
            };
            let right = if end < u64::MAX - 1 {
                self.trie.lookup_tail(end + 1).filter(|s| s.kind() == SegmentKind::Free)
            } else {
                None
            };

            // Lock in increasing-key order to avoid deadlocking against a
            // concurrent range_del locking the same pair of neighbours.
            let left_guard = left.map(|s| s.lock());
            let target_guard = target.lock();
            let right_guard = right.map(|s| s.lock());

            if target.kind() != SegmentKind::Allocated
                || left.is_some_and(|s| s.kind() != SegmentKind::Free)
                || right.is_some_and(|s| s.kind() != SegmentKind::Free)
            {
                drop(left_guard);
                drop(target_guard);
                drop(right_guard);
                continue; // a neighbour changed underneath us; retry
            }

            let new_start = left.map_or(start, |s| s.start);
            let new_end = right.map_or(end, |s| s.end);

            self.trie
                .add_dup(domain, new_start, Segment::new(new_start, new_end, SegmentKind::Free, free_priv))
                .map_err(|_| Error::OutOfMemory)?;

            target.mark_removed();
            if let Some(s) = left {
                s.mark_removed();
            }
            if let Some(s) = right {
                s.mark_removed();
            }
            drop(left_guard);
            drop(target_guard);
            drop(right_guard);

            if let Some(s) = left {
                self.trie.remove(domain, s.start).ok();
            }
            self.trie.remove(domain, start).ok();
            if let Some(s) = right {
                self.trie.remove(domain, s.start).ok();
            }
            return Ok(());
        }
        Err(Error::NotFound)
    }
}
