//! Per-thread transaction descriptor and thread registration.
//!
//! Each OS thread that executes transactions owns one [`TxThread`], reachable
//! from barrier code through a thread-local slot initialized lazily on first
//! transactional call. Only the owning thread ever touches its descriptor;
//! all cross-thread traffic goes through the metadata tables.
//!
//! Thread slots come from a bounded free list: the bytelock reader rows are
//! `MAX_THREADS` wide, so at most that many threads may be registered at
//! once. A slot returns to the free list when the thread finalizes (or
//! exits), making it safe for short-lived threads to come and go.

use std::cell::RefCell;
use std::sync::OnceLock;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use weft_error::WeftError;
use weft_types::{ThreadSlot, Word, MAX_THREADS};

use crate::algs::{self, Algorithm, BarrierSet};
use crate::metadata::{orec_lock_word, ByteLock, Orec, OrecSnapshot};
use crate::minivec::MiniVec;
use crate::txn::Transaction;
use crate::undo_log::UndoLog;
use crate::write_set::WriteSet;

/// Initial write-set capacity for a fresh thread.
const INITIAL_WRITE_SET_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Allocator hooks
// ---------------------------------------------------------------------------

/// Notification sink for transactional allocation bookkeeping.
///
/// The runtime only signals transaction boundaries; what an allocator does
/// with them lives outside this crate.
#[derive(Debug, Default)]
pub struct TxAllocator {
    begins: u64,
    commits: u64,
    aborts: u64,
}

impl TxAllocator {
    /// A transaction attempt is starting on this thread.
    #[inline]
    pub fn on_tx_begin(&mut self) {
        self.begins += 1;
    }

    /// The outermost scope committed.
    #[inline]
    pub fn on_tx_commit(&mut self) {
        self.commits += 1;
    }

    /// The transaction rolled back.
    #[inline]
    pub fn on_tx_abort(&mut self) {
        self.aborts += 1;
    }

    /// Attempts signalled so far (begin count).
    #[must_use]
    pub fn begins(&self) -> u64 {
        self.begins
    }
}

// ---------------------------------------------------------------------------
// TxThread
// ---------------------------------------------------------------------------

/// Per-thread runtime state: logs, lock lists, dispatch pointers.
pub struct TxThread {
    slot: ThreadSlot,
    /// Precomputed orec word meaning "locked by this thread".
    pub(crate) my_lock: Word,
    /// Bytelocks this thread holds (or held) as a reader.
    pub(crate) r_bytelocks: MiniVec<&'static ByteLock>,
    /// Bytelocks this thread owns as the writer.
    pub(crate) w_bytelocks: MiniVec<&'static ByteLock>,
    /// Prior values for in-place updates.
    pub(crate) undo_log: UndoLog,
    /// Pending redo-log writes.
    pub(crate) writes: WriteSet,
    /// Value-validation read set of orec samples.
    pub(crate) nanorecs: MiniVec<OrecSnapshot>,
    /// Orecs locked during a redo-log commit.
    pub(crate) locks: MiniVec<&'static Orec>,
    /// The active algorithm's full capability table.
    pub(crate) alg: &'static Algorithm,
    /// Hot-path barrier pointers for the current mode (read-only until the
    /// first write, read-write after).
    pub(crate) dispatch: BarrierSet,
    /// Whether the read-only → read-write transition has happened.
    pub(crate) first_write_done: bool,
    /// Consecutive conflict aborts, drives exponential backoff.
    pub(crate) consec_aborts: u32,
    /// RNG for randomized backoff; the only allocation-adjacent state the
    /// rollback path touches.
    pub(crate) backoff_rng: SmallRng,
    /// Allocation bookkeeping notifications.
    pub(crate) allocator: TxAllocator,
    /// The scope stack.
    pub(crate) txn: Transaction,
}

impl TxThread {
    fn new(slot: ThreadSlot) -> Self {
        let alg = algs::default_algorithm();
        debug!(slot = %slot, algorithm = alg.name, "transactional thread registered");
        Self {
            slot,
            my_lock: orec_lock_word(slot.get()),
            r_bytelocks: MiniVec::new(),
            w_bytelocks: MiniVec::new(),
            undo_log: UndoLog::new(),
            writes: WriteSet::new(INITIAL_WRITE_SET_CAPACITY),
            nanorecs: MiniVec::new(),
            locks: MiniVec::new(),
            alg,
            dispatch: alg.ro,
            first_write_done: false,
            consec_aborts: 0,
            backoff_rng: SmallRng::seed_from_u64(u64::from(slot.get())),
            allocator: TxAllocator::default(),
            txn: Transaction::new(),
        }
    }

    /// This thread's slot id.
    #[inline]
    #[must_use]
    pub fn slot(&self) -> ThreadSlot {
        self.slot
    }
}

impl Drop for TxThread {
    fn drop(&mut self) {
        if self.txn.depth() != 0 {
            warn!(
                slot = %self.slot,
                depth = self.txn.depth(),
                "thread finalized with a transaction still open"
            );
        }
        release_slot(self.slot);
    }
}

// ---------------------------------------------------------------------------
// Slot allocation
// ---------------------------------------------------------------------------

static FREE_SLOTS: OnceLock<Mutex<Vec<u32>>> = OnceLock::new();

fn free_slots() -> &'static Mutex<Vec<u32>> {
    // Reverse order so the first registration gets slot 1.
    FREE_SLOTS.get_or_init(|| Mutex::new((1..=MAX_THREADS as u32).rev().collect()))
}

fn acquire_slot() -> Result<ThreadSlot, WeftError> {
    let id = free_slots()
        .lock()
        .pop()
        .ok_or(WeftError::ThreadLimitExceeded { max: MAX_THREADS })?;
    Ok(ThreadSlot::new(id).expect("free list only holds valid slot ids"))
}

fn release_slot(slot: ThreadSlot) {
    free_slots().lock().push(slot.get());
}

// ---------------------------------------------------------------------------
// Thread-local descriptor
// ---------------------------------------------------------------------------

thread_local! {
    static TX_THREAD: RefCell<Option<Box<TxThread>>> = const { RefCell::new(None) };
}

/// Run `f` against this thread's descriptor, registering the thread first if
/// needed.
pub(crate) fn with_thread<R>(f: impl FnOnce(&mut TxThread) -> R) -> Result<R, WeftError> {
    TX_THREAD.with(|cell| {
        let mut guard = cell.borrow_mut();
        if guard.is_none() {
            *guard = Some(Box::new(TxThread::new(acquire_slot()?)));
        }
        Ok(f(guard.as_mut().expect("descriptor just initialized")))
    })
}

/// Register this thread eagerly. Idempotent.
pub(crate) fn init_current_thread() -> Result<(), WeftError> {
    with_thread(|_| ())
}

/// Tear down this thread's descriptor and return its slot to the free list.
///
/// A later transactional call re-registers (possibly under a different
/// slot id).
pub(crate) fn fini_current_thread() {
    TX_THREAD.with(|cell| {
        cell.borrow_mut().take();
    });
}
