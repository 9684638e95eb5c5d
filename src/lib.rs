//! # rcu-index
//!
//! RCU-safe concurrent ordered-map building blocks: an interval-augmented
//! red-black tree ([`rbt`]), a Judy-style compressed radix trie ([`trie`]),
//! and a range-interval partition layer built on top of the trie
//! ([`range`]). All three share one grace-period reclaimer ([`rcu`]) and a
//! stable-handle arena ([`arena`]) instead of raw owning pointers.
//!
//! Read-side operations on all three structures are safe to call
//! concurrently with any number of other readers and exactly the writer(s)
//! each structure's own discipline allows (externally-mutex-serialized for
//! the tree, internally shadow-mutex-serialized per node for the trie). See
//! each module's docs for its specific contract.
//!
//! This crate also carries the foundational concurrency primitives the
//! ordered-map layer is built from, in the spirit of the toolkit it started
//! as a port of.
//!
//! ## Module Organization
//!
//! ### Ordered-map layer
//! - [`error`] - Update-side error kinds
//! - [`rcu`] - Grace-period reclamation facade
//! - [`arena`] - Stable-handle slot arena
//! - [`rbt`] - Interval-augmented copy-on-write red-black tree
//! - [`shadow`] - Trie node update-side side table
//! - [`trie`] - Judy-style compressed radix trie
//! - [`range`] - Range-interval partition layer
//!
//! ### Foundation
//! - [`cc`] - Compiler compatibility utilities (bit operations, branch hints)
//! - [`malloc`] - Memory allocator abstraction
//! - [`pr`] - Atomic primitives and memory barriers
//! - [`mod@backoff`] - Exponential backoff for contention management
//! - [`spinlock`] - Fetch-and-store spinlock

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

extern crate alloc;

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

/// Compiler compatibility utilities.
///
/// Provides bit manipulation operations (ffs, ctz, popcount) and branch prediction hints.
pub mod cc;

/// Memory allocator abstraction.
///
/// Defines the [`Allocator`](malloc::Allocator) trait for custom memory allocation.
pub mod malloc;

// =============================================================================
// Tier 1: Core Primitives (Depends on Tier 0)
// =============================================================================

/// Atomic primitives and memory barriers.
///
/// Provides atomic operations with various memory orderings.
pub mod pr;

// =============================================================================
// Tier 2: Basic Building Blocks (Depends on Tiers 0-1)
// =============================================================================

/// Exponential backoff for contention management.
pub mod backoff;

// =============================================================================
// Tier 3: Composite Locks (Depends on Tiers 0-2)
// =============================================================================

/// Fetch-and-store spinlock.
pub mod spinlock;

// =============================================================================
// Tier 4: Ordered-map layer (Depends on Tiers 0-3)
// =============================================================================

/// Update-side error kinds.
pub mod error;

/// Grace-period reclamation facade.
pub mod rcu;

/// Stable-handle slot arena.
pub mod arena;

/// Interval-augmented copy-on-write red-black tree.
pub mod rbt;

/// Trie node update-side side table.
pub mod shadow;

/// Judy-style compressed radix trie.
pub mod trie;

/// Range-interval partition layer.
pub mod range;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use cc::{ctz, ffs, ffsl, ffsll, popcount};
pub use error::{Error, Result};
pub use malloc::Allocator;
pub use range::RangeLayer;
pub use rbt::RbTree;
pub use rcu::RcuDomain;
pub use trie::{KeyWidth, Trie};
