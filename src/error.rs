//! Error kinds surfaced by the update side of the index structures.
//!
//! Read-side operations never return this type: a missed lookup is a normal
//! outcome (`None`/nil), not a failure. Only the mutating operations in
//! [`crate::rbt`], [`crate::trie`], and [`crate::range`] return [`Result`].

use core::fmt;

/// Failure modes for update-side operations.
///
/// Races against a concurrently `removed` segment or a decayed node are
/// *not* represented here: the writer loops and retries from the current
/// state internally, and no error crosses the public API for that case.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The injected allocator returned null during insert or recompaction.
    /// The structure is left unchanged.
    OutOfMemory,
    /// A unique insert collided with an existing key, or `range_add`'s
    /// target intersected an allocated or partially-free span.
    /// The structure is left unchanged.
    AlreadyExists,
    /// `range_del`'s target was concurrently deleted, or was never present.
    NotFound,
    /// A precondition was violated (e.g. `range_add` with `start > end` or
    /// `end == MAX`).
    Invalid,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::OutOfMemory => "allocator returned null",
            Error::AlreadyExists => "key or range already present",
            Error::NotFound => "target not present",
            Error::Invalid => "precondition violated",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for Error {}

/// Convenience alias used throughout the update-side API.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn display_text_is_distinct_per_kind() {
        let kinds = [
            Error::OutOfMemory,
            Error::AlreadyExists,
            Error::NotFound,
            Error::Invalid,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for (j, b) in kinds.iter().enumerate() {
                if i != j {
                    assert_ne!(a.to_string(), b.to_string());
                }
            }
        }
    }

    #[test]
    fn errors_are_copy_and_eq() {
        let e = Error::NotFound;
        let e2 = e;
        assert_eq!(e, e2);
    }
}
