//! Core types shared across the weft STM runtime.
//!
//! Transactional barriers operate at word granularity: every read and write
//! names an aligned machine word plus a *byte-lane mask* describing which
//! bytes of that word the access actually touches. A lane is `0xFF` when the
//! corresponding byte participates and `0x00` when it does not, so sub-word
//! accesses compose with plain bitwise arithmetic.

use std::fmt;
use std::num::NonZeroU32;

// ---------------------------------------------------------------------------
// Words and byte-lane masks
// ---------------------------------------------------------------------------

/// A machine word as moved by the transactional barriers.
pub type Word = usize;

/// Size of a [`Word`] in bytes.
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// Mask covering every byte lane of a word.
pub const FULL_MASK: Word = !0;

/// Build a mask covering `len` byte lanes starting at byte `offset` within a
/// word. Words are little-endian, so lane 0 is the least significant byte.
///
/// # Panics
///
/// Panics if `offset + len` exceeds [`WORD_BYTES`].
#[inline]
#[must_use]
pub fn lane_mask(offset: usize, len: usize) -> Word {
    assert!(
        offset + len <= WORD_BYTES,
        "lane range {offset}+{len} exceeds word size {WORD_BYTES}"
    );
    if len == 0 {
        return 0;
    }
    if len == WORD_BYTES {
        return FULL_MASK;
    }
    let lanes: Word = (1 << (len * 8)) - 1;
    lanes << (offset * 8)
}

/// Mask for a single byte lane.
#[inline]
#[must_use]
pub const fn byte_lane(index: usize) -> Word {
    let lane: Word = 0xFF;
    lane << (index * 8)
}

/// Merge `new` into `old` under a byte-lane mask: lanes set in `mask` come
/// from `new`, the rest from `old`.
#[inline]
#[must_use]
pub const fn merge_masked(old: Word, new: Word, mask: Word) -> Word {
    (old & !mask) | (new & mask)
}

/// Whether `mask` covers every lane that `want` covers.
#[inline]
#[must_use]
pub const fn mask_covers(mask: Word, want: Word) -> bool {
    want & !mask == 0
}

// ---------------------------------------------------------------------------
// Protected ranges
// ---------------------------------------------------------------------------

/// A byte range `[addr, addr + len)` that must survive transaction rollback.
///
/// Registered by cancel-and-throw so the object being propagated out of an
/// aborting transaction keeps the values the transaction wrote into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThrownRange {
    addr: usize,
    len: usize,
}

impl ThrownRange {
    /// Create a range. A zero-length range protects nothing but is legal.
    #[inline]
    #[must_use]
    pub const fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }

    /// First protected byte address.
    #[inline]
    #[must_use]
    pub const fn start(self) -> usize {
        self.addr
    }

    /// One past the last protected byte address.
    #[inline]
    #[must_use]
    pub const fn end(self) -> usize {
        self.addr + self.len
    }

    /// Length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.len
    }

    /// Whether the range protects no bytes.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Whether the byte at `addr` is protected.
    #[inline]
    #[must_use]
    pub const fn contains(self, addr: usize) -> bool {
        addr >= self.addr && addr < self.addr + self.len
    }

    /// Whether `[addr, addr + len)` overlaps this range.
    #[inline]
    #[must_use]
    pub const fn overlaps(self, addr: usize, len: usize) -> bool {
        !self.is_empty() && len != 0 && addr < self.end() && addr + len > self.start()
    }

    /// Whether `[addr, addr + len)` lies entirely inside this range.
    #[inline]
    #[must_use]
    pub const fn covers(self, addr: usize, len: usize) -> bool {
        len != 0 && addr >= self.start() && addr + len <= self.end()
    }
}

// ---------------------------------------------------------------------------
// Thread slots
// ---------------------------------------------------------------------------

/// Upper bound on concurrently registered transactional threads.
///
/// Bytelocks carry one reader byte and one reader-version slot per thread,
/// so this constant fixes the metadata row width for the whole process.
pub const MAX_THREADS: usize = 32;

/// A registered thread's slot id, in `1..=MAX_THREADS`.
///
/// Slot 0 is the "no owner" sentinel in lock words, which is why the id is
/// non-zero; [`ThreadSlot::index`] gives the 0-based row into per-thread
/// metadata arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[repr(transparent)]
pub struct ThreadSlot(NonZeroU32);

impl ThreadSlot {
    /// Create a slot id from a raw value.
    ///
    /// Returns `None` if `n` is 0 or greater than [`MAX_THREADS`].
    #[inline]
    #[must_use]
    pub fn new(n: u32) -> Option<Self> {
        if n as usize > MAX_THREADS {
            return None;
        }
        NonZeroU32::new(n).map(Self)
    }

    /// The raw 1-based id.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// 0-based index into per-thread metadata arrays.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

impl fmt::Display for ThreadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Scope ids
// ---------------------------------------------------------------------------

/// Opaque, process-wide monotone id assigned to a scope when it is entered.
///
/// A scope that rolls back and re-enters keeps its id; a freshly pushed scope
/// gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[repr(transparent)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Construct from a raw counter value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw counter value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Scope flags
// ---------------------------------------------------------------------------

/// Property bits supplied when a scope is entered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(transparent)]
pub struct ScopeFlags(u32);

impl ScopeFlags {
    /// No hints.
    pub const NONE: Self = Self(0);
    /// The body promises not to write; the runtime may stay on read-only
    /// barriers for the whole transaction.
    pub const READ_ONLY: Self = Self(1);
    /// The body may cancel-and-throw, so rollback must honor a registered
    /// thrown-object range.
    pub const EXCEPTION_AWARE: Self = Self(1 << 1);

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for ScopeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
