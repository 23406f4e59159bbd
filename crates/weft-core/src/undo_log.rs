//! Ordered undo log for in-place-update rollback.
//!
//! Every in-place transactional write first appends `(addr, prior value,
//! byte mask)` here. Rollback replays the log newest-first, which restores
//! memory byte-for-byte to its pre-transaction state — except for bytes
//! inside a registered thrown-object range, which must keep the values the
//! transaction wrote so the object can propagate out of the abort.

use weft_types::{byte_lane, ThrownRange, Word, WORD_BYTES};

use crate::mem;
use crate::minivec::MiniVec;

/// One logged word: the prior value of the lanes named by `mask`.
#[derive(Debug, Clone, Copy)]
pub struct UndoEntry {
    pub addr: *mut Word,
    pub prior: Word,
    pub mask: Word,
}

impl UndoEntry {
    /// The entry's mask with every lane inside `range` cleared.
    ///
    /// The common cases (no intersection, whole word protected) are decided
    /// from the word's address range; anything else walks the bytes. This is
    /// an abort path, so the walk is not worth optimizing.
    fn mask_outside(&self, range: ThrownRange) -> Word {
        let base = self.addr as usize;
        if !range.overlaps(base, WORD_BYTES) {
            return self.mask;
        }
        if range.covers(base, WORD_BYTES) {
            return 0;
        }
        let mut mask = self.mask;
        for i in 0..WORD_BYTES {
            if range.contains(base + i) {
                mask &= !byte_lane(i);
            }
        }
        mask
    }
}

/// The per-thread undo log.
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: MiniVec<UndoEntry>,
}

impl UndoLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: MiniVec::new(),
        }
    }

    /// Append a prior value. Lanes outside `mask` are ignored on replay.
    #[inline]
    pub fn insert(&mut self, addr: *mut Word, prior: Word, mask: Word) {
        self.entries.insert(UndoEntry { addr, prior, mask });
    }

    /// Number of logged words.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear the log, keeping storage for the next transaction.
    #[inline]
    pub fn reset(&mut self) {
        self.entries.reset();
    }

    /// Replay the log newest-first, restoring every logged lane.
    ///
    /// # Safety
    ///
    /// Every logged address must still be valid for writes; the caller holds
    /// whatever exclusivity the active protocol requires.
    pub unsafe fn undo(&self) {
        for e in self.entries.iter_rev() {
            unsafe { mem::write_word_masked(e.addr, e.prior, e.mask) };
        }
    }

    /// Replay the log newest-first, skipping lanes inside `protect`.
    ///
    /// An entry whose mask empties after filtering is discarded outright.
    ///
    /// # Safety
    ///
    /// As for [`UndoLog::undo`].
    pub unsafe fn undo_protecting(&self, protect: Option<ThrownRange>) {
        let Some(range) = protect.filter(|r| !r.is_empty()) else {
            unsafe { self.undo() };
            return;
        };
        for e in self.entries.iter_rev() {
            let mask = e.mask_outside(range);
            if mask == 0 {
                continue;
            }
            unsafe { mem::write_word_masked(e.addr, e.prior, mask) };
        }
    }
}
