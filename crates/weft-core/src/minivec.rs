//! Amortized-growth ordered sequence for per-transaction bookkeeping.
//!
//! Lock lists, read sets and callback lists all share the same access
//! pattern: append during the transaction, iterate (sometimes in reverse) at
//! commit or rollback, then clear while keeping the backing storage so the
//! next transaction on the same thread allocates nothing. [`MiniVec`] wraps a
//! `SmallVec` so short transactions stay entirely on the stack.

use smallvec::SmallVec;

/// Inline capacity before a list spills to the heap.
///
/// Sized for the common case of transactions touching a handful of buckets.
const INLINE: usize = 16;

/// An ordered, append-only sequence with O(1) logical clear.
#[derive(Debug)]
pub struct MiniVec<T> {
    items: SmallVec<[T; INLINE]>,
}

impl<T> MiniVec<T> {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: SmallVec::new(),
        }
    }

    /// Append an element, growing the backing storage geometrically when
    /// full.
    #[inline]
    pub fn insert(&mut self, item: T) {
        self.items.push(item);
    }

    /// Drop all elements but keep the backing storage for reuse.
    #[inline]
    pub fn reset(&mut self) {
        self.items.clear();
    }

    /// Number of elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate in insertion order.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Iterate mutably in insertion order.
    #[inline]
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    /// Iterate from newest to oldest (the rollback direction).
    #[inline]
    pub fn iter_rev(&self) -> std::iter::Rev<std::slice::Iter<'_, T>> {
        self.items.iter().rev()
    }

    /// Remove and return all elements in insertion order.
    #[inline]
    pub fn drain(&mut self) -> smallvec::Drain<'_, [T; INLINE]> {
        self.items.drain(..)
    }

    /// Move all elements of `other` onto the end of `self`, leaving `other`
    /// empty (storage retained).
    pub fn append(&mut self, other: &mut Self) {
        self.items.extend(other.items.drain(..));
    }
}

impl<T> Default for MiniVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_iterate() {
        let mut v = MiniVec::new();
        for i in 0..5 {
            v.insert(i);
        }
        assert_eq!(v.len(), 5);
        let fwd: Vec<i32> = v.iter().copied().collect();
        assert_eq!(fwd, [0, 1, 2, 3, 4]);
        let rev: Vec<i32> = v.iter_rev().copied().collect();
        assert_eq!(rev, [4, 3, 2, 1, 0]);
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut v = MiniVec::new();
        for i in 0..100 {
            v.insert(i);
        }
        let cap = v.items.capacity();
        v.reset();
        assert!(v.is_empty());
        assert_eq!(v.items.capacity(), cap);
    }

    #[test]
    fn spills_past_inline_capacity() {
        let mut v = MiniVec::new();
        for i in 0..(INLINE * 4) {
            v.insert(i);
        }
        assert_eq!(v.len(), INLINE * 4);
        assert_eq!(v.iter().last(), Some(&(INLINE * 4 - 1)));
    }

    #[test]
    fn append_moves_elements() {
        let mut a = MiniVec::new();
        let mut b = MiniVec::new();
        a.insert(1);
        b.insert(2);
        b.insert(3);
        a.append(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.iter().copied().collect::<Vec<_>>(), [1, 2, 3]);
    }
}
