//! Algorithm capability tables, registry, and dispatch-mode transitions.
//!
//! Each concurrency-control algorithm is a set of plain function pointers —
//! begin, barriers, commit, rollback — registered in a process-wide table and
//! selected by short name. The thread descriptor holds the active table by
//! reference plus a by-value [`BarrierSet`] of the hot-path pointers for the
//! current mode; the read-only → read-write transition just overwrites that
//! set, keeping barrier dispatch at a single indirect call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use tracing::{info, warn};

use weft_error::WeftError;
use weft_types::{ThrownRange, Word};

use crate::thread::TxThread;

pub mod byteeager;
pub mod nano;

// ---------------------------------------------------------------------------
// Conflict token
// ---------------------------------------------------------------------------

/// Marker for a conflict abort detected inside an algorithm.
///
/// Carried through barrier `Result`s to the retry driver, which rolls the
/// transaction back and re-runs it. Never visible to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict;

// ---------------------------------------------------------------------------
// Barrier signatures
// ---------------------------------------------------------------------------

/// Transactional load: returns the word at `addr` under the given byte-lane
/// mask.
pub type ReadBarrier = unsafe fn(&mut TxThread, *mut Word, Word) -> Result<Word, Conflict>;

/// Transactional store of the masked lanes of a word.
pub type WriteBarrier = unsafe fn(&mut TxThread, *mut Word, Word, Word) -> Result<(), Conflict>;

/// Advisory early-acquire barrier: lock without touching memory.
pub type ReserveBarrier = unsafe fn(&mut TxThread, *mut Word, Word) -> Result<(), Conflict>;

/// Advisory early-release hint. Never aborts.
pub type ReleaseBarrier = fn(&mut TxThread, *mut Word, Word);

/// Commit the innermost (outermost-reached) transaction.
pub type CommitFn = unsafe fn(&mut TxThread) -> Result<(), Conflict>;

/// Roll the thread's transaction back, honoring a thrown-object range.
pub type RollbackFn = unsafe fn(&mut TxThread, Option<ThrownRange>);

/// The hot-path pointers for one dispatch mode.
#[derive(Clone, Copy, Debug)]
pub struct BarrierSet {
    pub read: ReadBarrier,
    pub write: WriteBarrier,
    pub commit: CommitFn,
}

/// One registered algorithm: its name, capability pointers, and properties.
#[derive(Debug)]
pub struct Algorithm {
    /// Short selection name, e.g. `"ByteEager"`.
    pub name: &'static str,
    /// Per-attempt begin hook.
    pub begin: fn(&mut TxThread),
    /// Barriers installed while the transaction has not written.
    pub ro: BarrierSet,
    /// Barriers installed from the first write onward.
    pub rw: BarrierSet,
    pub read_reserve: ReserveBarrier,
    pub write_reserve: ReserveBarrier,
    pub release: ReleaseBarrier,
    pub rollback: RollbackFn,
    /// Attempt to make the running transaction irrevocable; `false` means
    /// the algorithm cannot.
    pub irrevoc: fn(&mut TxThread) -> bool,
    /// Hook run when this algorithm becomes the process default.
    pub on_switch: fn(),
    /// Whether privatization is safe under this algorithm.
    pub privatization_safe: bool,
}

// ---------------------------------------------------------------------------
// Mode transitions
// ---------------------------------------------------------------------------

/// Switch a transaction to read-write dispatch on its first write.
///
/// Keyed off a per-thread flag rather than lock-list length, so reserve-only
/// prefixes (several `write_reserve` calls before any real write) still
/// transition exactly once.
#[inline]
pub(crate) fn on_first_write(tx: &mut TxThread) {
    if !tx.first_write_done {
        tx.first_write_done = true;
        tx.dispatch = tx.alg.rw;
    }
}

/// Common post-commit bookkeeping: back to read-only dispatch, clear the
/// backoff streak, notify the allocator.
pub(crate) fn after_commit(tx: &mut TxThread) {
    tx.dispatch = tx.alg.ro;
    tx.first_write_done = false;
    tx.consec_aborts = 0;
    tx.allocator.on_tx_commit();
}

/// Common post-rollback bookkeeping: back to read-only dispatch, notify the
/// allocator. The consecutive-abort streak is left for the backoff logic.
pub(crate) fn after_rollback(tx: &mut TxThread) {
    tx.dispatch = tx.alg.ro;
    tx.first_write_done = false;
    tx.allocator.on_tx_abort();
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All registered algorithms, selectable by [`Algorithm::name`].
pub static ALGORITHMS: &[&Algorithm] = &[&byteeager::ALGORITHM, &nano::ALGORITHM];

/// Environment variable naming the default algorithm.
pub const ALGORITHM_ENV: &str = "WEFT_ALGORITHM";

static DEFAULT_INDEX: AtomicUsize = AtomicUsize::new(0);
static DEFAULT_INIT: Once = Once::new();

fn lookup(name: &str) -> Option<usize> {
    ALGORITHMS.iter().position(|a| a.name == name)
}

/// Find a registered algorithm by short name.
#[must_use]
pub fn by_name(name: &str) -> Option<&'static Algorithm> {
    lookup(name).map(|i| ALGORITHMS[i])
}

/// The process-default algorithm. Consults [`ALGORITHM_ENV`] once; later
/// changes go through [`select_by_name`]. Threads pick the default up at
/// their next outermost transaction.
#[must_use]
pub fn default_algorithm() -> &'static Algorithm {
    DEFAULT_INIT.call_once(|| {
        if let Ok(name) = std::env::var(ALGORITHM_ENV) {
            match lookup(&name) {
                Some(i) => {
                    DEFAULT_INDEX.store(i, Ordering::Relaxed);
                    info!(algorithm = %name, "default algorithm from {ALGORITHM_ENV}");
                }
                None => {
                    warn!(
                        algorithm = %name,
                        fallback = ALGORITHMS[0].name,
                        "{ALGORITHM_ENV} names no registered algorithm"
                    );
                }
            }
        }
    });
    ALGORITHMS[DEFAULT_INDEX.load(Ordering::Relaxed)]
}

/// Make the named algorithm the process default and run its switch hook.
pub fn select_by_name(name: &str) -> Result<&'static Algorithm, WeftError> {
    let index = lookup(name).ok_or_else(|| WeftError::UnknownAlgorithm {
        name: name.to_owned(),
    })?;
    // Force env resolution first so a racing first transaction cannot
    // overwrite this selection.
    let _ = default_algorithm();
    DEFAULT_INDEX.store(index, Ordering::Relaxed);
    let alg = ALGORITHMS[index];
    (alg.on_switch)();
    info!(algorithm = alg.name, "algorithm selected");
    Ok(alg)
}
