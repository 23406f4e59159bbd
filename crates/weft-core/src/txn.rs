//! Transaction driver: the scope stack and the retry loop.
//!
//! The original formulation of this machinery is a register checkpoint plus
//! a long-jump restart. Rendered in Rust, the checkpoint is the body closure
//! itself: conflicts surface as an opaque [`Abort`] token that the body
//! propagates with `?`, and the driver rolls the transaction back and runs
//! the closure again. The body must therefore be restart-idempotent aside
//! from its transactional memory effects — the same contract the long-jump
//! version imposes, without skipping destructors to get it.
//!
//! Nesting is flat: nested scopes share the thread's logs, a nested commit
//! merges scope-level state into its parent and releases nothing, and a
//! conflict anywhere restarts the outermost scope.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use weft_error::WeftError;
use weft_types::{ScopeFlags, ScopeId, ThrownRange};

use crate::algs::{self, Algorithm, Conflict};
use crate::scope::Scope;
use crate::stats;
use crate::thread::{with_thread, TxThread};

/// Result type for transaction bodies.
pub type TxResult<T> = Result<T, Abort>;

// ---------------------------------------------------------------------------
// Abort token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbortKind {
    Conflict,
    Cancel,
}

/// Opaque unwind token for a transaction body.
///
/// Produced by the barriers on conflict and by the cancellation entry
/// points; consumed by the retry driver. Must be propagated outward — a body
/// that swallows one continues executing on rolled-back state.
#[must_use = "propagate the abort to the transaction driver with `?`"]
#[derive(Debug)]
pub struct Abort {
    kind: AbortKind,
}

impl Abort {
    #[inline]
    pub(crate) fn conflict() -> Self {
        Self {
            kind: AbortKind::Conflict,
        }
    }

    #[inline]
    pub(crate) fn cancel() -> Self {
        Self {
            kind: AbortKind::Cancel,
        }
    }

    #[inline]
    pub(crate) fn kind(&self) -> AbortKind {
        self.kind
    }
}

impl From<Conflict> for Abort {
    #[inline]
    fn from(_: Conflict) -> Self {
        Self::conflict()
    }
}

// ---------------------------------------------------------------------------
// Transaction: the scope stack
// ---------------------------------------------------------------------------

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

fn next_scope_id() -> ScopeId {
    ScopeId::from_raw(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
}

/// One thread's stack of scopes. Depth equals runtime nesting depth; only
/// the outermost commit touches the algorithm.
#[derive(Debug, Default)]
pub struct Transaction {
    scopes: Vec<Scope>,
}

impl Transaction {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self { scopes: Vec::new() }
    }

    /// Current nesting depth.
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// The innermost scope, if a transaction is active.
    #[inline]
    pub(crate) fn innermost(&self) -> Option<&Scope> {
        self.scopes.last()
    }

    /// The innermost scope, mutably.
    #[inline]
    pub(crate) fn innermost_mut(&mut self) -> Option<&mut Scope> {
        self.scopes.last_mut()
    }
}

// ---------------------------------------------------------------------------
// Scope-stack operations on the thread descriptor
// ---------------------------------------------------------------------------

impl TxThread {
    /// Push and enter a new scope. At the outermost level this also binds
    /// the transaction to an algorithm and runs its begin hook.
    pub(crate) fn txn_begin(&mut self, pin: Option<&'static Algorithm>, flags: ScopeFlags) -> ScopeId {
        if self.txn.depth() == 0 {
            let alg = pin.unwrap_or_else(algs::default_algorithm);
            self.alg = alg;
            self.dispatch = alg.ro;
            self.first_write_done = false;
        }
        let id = next_scope_id();
        let mut scope = Scope::new();
        scope.enter(id, flags);
        self.txn.scopes.push(scope);
        if self.txn.depth() == 1 {
            trace!(target: "weft.txn", slot = %self.slot(), id = %id, algorithm = self.alg.name, "transaction begin");
            (self.alg.begin)(self);
        }
        id
    }

    /// Commit the innermost scope.
    ///
    /// Outermost: run the algorithm commit (a conflict leaves the scope
    /// stack intact for restart) and hand the popped scope back so the
    /// caller can fire its commit callbacks once the thread descriptor is no
    /// longer borrowed — commit actions are allowed to start new
    /// transactions. Nested: merge scope state into the parent; no locks are
    /// released.
    pub(crate) fn txn_commit(&mut self) -> Result<Option<Scope>, Conflict> {
        assert!(self.txn.depth() > 0, "commit without an active transaction");
        if self.txn.depth() > 1 {
            let mut child = self.txn.scopes.pop().expect("depth checked");
            let parent = self
                .txn
                .innermost_mut()
                .expect("nested scope has a parent");
            child.merge_into(parent);
            return Ok(None);
        }
        let commit = self.dispatch.commit;
        unsafe { commit(self) }?;
        let scope = self.txn.scopes.pop().expect("depth checked");
        stats::note_commit();
        trace!(target: "weft.txn", slot = %self.slot(), "transaction committed");
        Ok(Some(scope))
    }

    /// Conflict restart: unwind every scope (thrown objects do not apply to
    /// conflicts), then re-enter the outermost scope under its original id
    /// for the next attempt.
    pub(crate) fn restart_outermost(&mut self) {
        assert!(self.txn.depth() > 0, "restart without an active transaction");
        for scope in self.txn.scopes.iter_mut() {
            scope.clear_thrown_object();
        }
        let rollback = self.alg.rollback;
        unsafe { rollback(self, None) };
        for scope in self.txn.scopes.iter_mut().rev() {
            let _ = unsafe { scope.rollback(None) };
        }
        self.txn.scopes.truncate(1);
        let scope = &mut self.txn.scopes[0];
        let (id, flags) = (scope.id(), scope.flags());
        scope.enter(id, flags);
        stats::note_abort();
        (self.alg.begin)(self);
    }

    /// Cancel-and-throw unwind: roll everything back honoring the innermost
    /// registered thrown range, and dissolve the transaction. Returns the
    /// range for the driver to re-raise.
    pub(crate) fn cancel_unwind(&mut self) -> Option<ThrownRange> {
        let thrown = self.txn.scopes.iter().rev().find_map(Scope::thrown);
        let rollback = self.alg.rollback;
        unsafe { rollback(self, thrown) };
        for scope in self.txn.scopes.iter_mut().rev() {
            let _ = unsafe { scope.rollback(thrown) };
        }
        self.txn.scopes.clear();
        stats::note_cancel();
        thrown
    }
}

// ---------------------------------------------------------------------------
// Retry driver
// ---------------------------------------------------------------------------

/// Run `body` as a transaction under the process-default algorithm,
/// retrying on conflict until it commits.
///
/// Cancellation (see [`crate::dispatch::cancel_and_throw`]) surfaces as
/// `Err(WeftError::Cancelled { .. })`; conflicts never escape.
pub fn atomically<T>(body: impl FnMut() -> TxResult<T>) -> Result<T, WeftError> {
    run_transaction(None, ScopeFlags::NONE, body)
}

/// [`atomically`] with explicit scope flags.
pub fn atomically_with<T>(
    flags: ScopeFlags,
    body: impl FnMut() -> TxResult<T>,
) -> Result<T, WeftError> {
    run_transaction(None, flags, body)
}

/// Run `body` under a named algorithm, without changing the process default.
pub fn atomically_using<T>(
    algorithm: &str,
    flags: ScopeFlags,
    body: impl FnMut() -> TxResult<T>,
) -> Result<T, WeftError> {
    let alg = algs::by_name(algorithm).ok_or_else(|| WeftError::UnknownAlgorithm {
        name: algorithm.to_owned(),
    })?;
    run_transaction(Some(alg), flags, body)
}

fn run_transaction<T>(
    pin: Option<&'static Algorithm>,
    flags: ScopeFlags,
    mut body: impl FnMut() -> TxResult<T>,
) -> Result<T, WeftError> {
    with_thread(|tx| {
        assert!(
            tx.txn.depth() == 0,
            "the retry driver owns the outermost scope; use nested scopes inside the body"
        );
        tx.txn_begin(pin, flags);
    })?;

    loop {
        match body() {
            Ok(value) => {
                let committed = with_thread(|tx| {
                    // Close nested scopes the body left open, then attempt
                    // the real commit.
                    while tx.txn.depth() > 1 {
                        let _ = tx.txn_commit();
                    }
                    tx.txn_commit()
                })
                .expect("thread registered at transaction begin");
                match committed {
                    Ok(scope) => {
                        // Callbacks run with the descriptor released; they
                        // may begin new transactions.
                        if let Some(mut scope) = scope {
                            scope.run_commit_callbacks();
                        }
                        return Ok(value);
                    }
                    Err(Conflict) => restart(),
                }
            }
            Err(abort) => match abort.kind() {
                AbortKind::Conflict => restart(),
                AbortKind::Cancel => {
                    let thrown = with_thread(TxThread::cancel_unwind)
                        .expect("thread registered at transaction begin");
                    return Err(match thrown {
                        Some(t) => WeftError::Cancelled {
                            addr: t.start(),
                            len: t.len(),
                        },
                        None => WeftError::CancelledNoObject,
                    });
                }
            },
        }
    }
}

fn restart() {
    with_thread(TxThread::restart_outermost).expect("thread registered at transaction begin");
}
