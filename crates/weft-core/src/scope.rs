//! One nested transaction activation.
//!
//! A scope owns everything with scope lifetime: the user-registered
//! compensation logs (`undo_on_rollback` logged words), the commit and
//! rollback callback lists, the optional thrown-object range, and the
//! aborted flag. The scope does *not* own the algorithm-level logs — those
//! live on the thread descriptor and are shared across the flat nest.
//!
//! ## Rollback order
//!
//! 1. Replay `undo_on_rollback` newest-first, clipping each logged word
//!    against the thrown-object range so protected bytes are not overwritten.
//! 2. Run `do_on_rollback` callbacks in registration order.
//! 3. Clear `do_on_commit`.
//! 4. Mark the scope aborted; it must be re-entered before reuse.

use weft_types::{ScopeFlags, ScopeId, ThrownRange, Word, WORD_BYTES};

use crate::minivec::MiniVec;

/// A user callback registered on a scope. Callbacks run on the owning
/// thread, so captures need not be `Send`.
pub type ScopeCallback = Box<dyn FnOnce()>;

// ---------------------------------------------------------------------------
// LoggedWord
// ---------------------------------------------------------------------------

/// A word (or unaligned byte run shorter than a word) logged for
/// scope-level undo.
///
/// `bytes` counts from the low end of `value`: undo copies the first
/// `bytes` little-endian bytes of `value` to `addr`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoggedWord {
    addr: *mut u8,
    value: Word,
    bytes: usize,
}

impl LoggedWord {
    pub(crate) fn new(addr: *mut u8, value: Word, bytes: usize) -> Self {
        debug_assert!(bytes <= WORD_BYTES);
        Self { addr, value, bytes }
    }

    #[inline]
    fn begin(&self) -> usize {
        self.addr as usize
    }

    #[inline]
    fn end(&self) -> usize {
        self.addr as usize + self.bytes
    }

    /// Clip this logged word against a protected byte range.
    ///
    /// - no intersection: unchanged;
    /// - fully inside the range: emptied (nothing to undo);
    /// - tail overlaps the range: keep the unprotected prefix;
    /// - head overlaps the range: shift the value past the protected prefix
    ///   (writes are little-endian), advance the address, keep the suffix.
    ///
    /// A range that starts before this word and ends after it cannot be
    /// expressed by trimming one end and is a caller error.
    fn clip(&mut self, lower: usize, upper: usize) {
        if self.end() <= lower || self.begin() >= upper {
            return;
        }
        if self.begin() >= lower && self.end() <= upper {
            self.bytes = 0;
            return;
        }
        if self.begin() < lower && self.end() <= upper {
            self.bytes = lower - self.begin();
            return;
        }
        if self.begin() >= lower && self.end() > upper {
            let prefix = upper - self.begin();
            self.value >>= prefix * 8;
            self.addr = upper as *mut u8;
            self.bytes -= prefix;
            return;
        }
        panic!(
            "logged word [{:#x}, {:#x}) extends past both ends of protected range [{lower:#x}, {upper:#x})",
            self.begin(),
            self.end(),
        );
    }

    /// Undo this logged word, honoring the thrown-object range.
    ///
    /// # Safety
    ///
    /// The logged address must still be valid for writes.
    unsafe fn undo(mut self, thrown: Option<ThrownRange>) {
        if let Some(t) = thrown.filter(|t| !t.is_empty()) {
            self.clip(t.start(), t.end());
        }
        if self.bytes == 0 {
            return;
        }
        // Byte copy rather than a word store: clipping can leave the
        // destination unaligned, and this path only runs on rollback.
        unsafe {
            std::ptr::copy_nonoverlapping(
                std::ptr::addr_of!(self.value).cast::<u8>(),
                self.addr,
                self.bytes,
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// One nested transaction activation owned by a thread's scope stack.
pub struct Scope {
    id: ScopeId,
    flags: ScopeFlags,
    aborted: bool,
    thrown: Option<ThrownRange>,
    do_on_commit: MiniVec<ScopeCallback>,
    do_on_rollback: MiniVec<ScopeCallback>,
    undo_on_rollback: MiniVec<LoggedWord>,
}

impl Scope {
    /// Create a scope in the aborted (not-yet-entered) state.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            id: ScopeId::from_raw(0),
            flags: ScopeFlags::NONE,
            aborted: true,
            thrown: None,
            do_on_commit: MiniVec::new(),
            do_on_rollback: MiniVec::new(),
            undo_on_rollback: MiniVec::new(),
        }
    }

    /// Enter (or re-enter) the scope: clear lists and the thrown range,
    /// clear the aborted flag, take the id.
    pub(crate) fn enter(&mut self, id: ScopeId, flags: ScopeFlags) {
        self.do_on_commit.reset();
        self.do_on_rollback.reset();
        self.undo_on_rollback.reset();
        self.thrown = None;
        self.aborted = false;
        self.id = id;
        self.flags = flags;
    }

    /// The id assigned at enter.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// The flags supplied at enter.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> ScopeFlags {
        self.flags
    }

    /// Whether the scope has rolled back and not been re-entered.
    #[inline]
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// The registered thrown-object range, if any.
    #[inline]
    #[must_use]
    pub fn thrown(&self) -> Option<ThrownRange> {
        self.thrown
    }

    /// Register the thrown-object range for cancel-and-throw.
    ///
    /// # Panics
    ///
    /// At most one thrown object per scope; setting a second is a
    /// precondition violation.
    pub fn set_thrown_object(&mut self, addr: usize, len: usize) {
        assert!(
            self.thrown.is_none(),
            "only one thrown object expected per scope"
        );
        self.thrown = Some(ThrownRange::new(addr, len));
    }

    /// Drop the registered thrown-object range.
    pub fn clear_thrown_object(&mut self) {
        self.thrown = None;
    }

    /// Register a callback to run if this scope commits.
    pub fn on_commit(&mut self, f: ScopeCallback) {
        self.do_on_commit.insert(f);
    }

    /// Register a callback to run if this scope rolls back.
    pub fn on_rollback(&mut self, f: ScopeCallback) {
        self.do_on_rollback.insert(f);
    }

    /// Log a word-or-smaller byte run for scope-level undo.
    pub(crate) fn log_word(&mut self, word: LoggedWord) {
        self.undo_on_rollback.insert(word);
    }

    /// Log an arbitrary byte range for scope-level undo: whole words first,
    /// then a masked tail.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must be valid for reads now and for writes at
    /// rollback time.
    pub unsafe fn log_bytes(&mut self, addr: *mut u8, len: usize) {
        let words = len / WORD_BYTES;
        for i in 0..words {
            let p = unsafe { addr.add(i * WORD_BYTES) };
            let mut value: Word = 0;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    p.cast_const(),
                    std::ptr::addr_of_mut!(value).cast::<u8>(),
                    WORD_BYTES,
                );
            }
            self.log_word(LoggedWord::new(p, value, WORD_BYTES));
        }
        let tail = len % WORD_BYTES;
        if tail != 0 {
            let p = unsafe { addr.add(words * WORD_BYTES) };
            let mut value: Word = 0;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    p.cast_const(),
                    std::ptr::addr_of_mut!(value).cast::<u8>(),
                    tail,
                );
            }
            self.log_word(LoggedWord::new(p, value, tail));
        }
    }

    /// Run commit callbacks in registration order.
    ///
    /// Commit callbacks never abort; a panic from one is fatal to the
    /// process, as the transaction has already published.
    pub(crate) fn run_commit_callbacks(&mut self) {
        for cb in self.do_on_commit.drain() {
            cb();
        }
    }

    /// Roll the scope back. `protect` is the effective thrown range for this
    /// unwind (the innermost scope's when nests unwind together).
    ///
    /// Returns the thrown range so the driver can re-raise it.
    ///
    /// # Safety
    ///
    /// Every logged undo address must still be valid for writes.
    pub(crate) unsafe fn rollback(&mut self, protect: Option<ThrownRange>) -> Option<ThrownRange> {
        for w in self.undo_on_rollback.iter_rev() {
            unsafe { w.undo(protect) };
        }
        self.undo_on_rollback.reset();
        for cb in self.do_on_rollback.drain() {
            cb();
        }
        self.do_on_commit.reset();
        self.aborted = true;
        self.thrown
    }

    /// Flat-nesting merge: move this scope's callbacks and undo words onto
    /// the parent, so they fire when the parent commits or rolls back.
    pub(crate) fn merge_into(&mut self, parent: &mut Scope) {
        parent.do_on_commit.append(&mut self.do_on_commit);
        parent.do_on_rollback.append(&mut self.do_on_rollback);
        parent.undo_on_rollback.append(&mut self.undo_on_rollback);
        if parent.thrown.is_none() {
            parent.thrown = self.thrown.take();
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("aborted", &self.aborted)
            .field("thrown", &self.thrown)
            .field("commit_callbacks", &self.do_on_commit.len())
            .field("rollback_callbacks", &self.do_on_rollback.len())
            .field("undo_words", &self.undo_on_rollback.len())
            .finish()
    }
}
