//! weft-core: a software transactional memory runtime.
//!
//! Threads execute critical sections speculatively against shared memory;
//! the runtime detects conflicts and either commits the section atomically
//! or rolls it back and retries. Two concurrency-control algorithms are
//! registered:
//!
//! - **ByteEager** — pessimistic reader-writer bytelocks, eager acquire,
//!   in-place update with an undo log, bounded-spin deadlock avoidance.
//!   Privatization safe.
//! - **Nano** — optimistic ownership records with value-based validation and
//!   a redo log applied at commit. No global clock; not privatization safe.
//!
//! The usual entry point is [`atomically`]:
//!
//! ```
//! use weft_core::{atomically, dispatch};
//!
//! let mut counter: usize = 0;
//! let addr = std::ptr::addr_of_mut!(counter);
//! atomically(|| {
//!     let v = unsafe { dispatch::tx_read(addr, !0) }?;
//!     unsafe { dispatch::tx_write(addr, v + 1, !0) }?;
//!     Ok(())
//! })
//! .unwrap();
//! assert_eq!(counter, 1);
//! ```
//!
//! The [`dispatch`] module is the adapter-facing surface: thread lifecycle,
//! scope control, raw word barriers and typed sub-word helpers. The default
//! algorithm comes from the `WEFT_ALGORITHM` environment variable and can be
//! changed with [`dispatch::algorithm_select`].

pub mod algs;
pub mod dispatch;
pub mod mem;
pub mod metadata;
pub mod minivec;
pub mod scope;
pub mod stats;
pub mod thread;
pub mod txn;
pub mod undo_log;
pub mod write_set;

pub use algs::{Algorithm, BarrierSet, Conflict, ALGORITHMS, ALGORITHM_ENV};
pub use minivec::MiniVec;
pub use scope::Scope;
pub use stats::{reset_runtime_stats, runtime_stats, RuntimeStats};
pub use thread::{TxAllocator, TxThread};
pub use txn::{atomically, atomically_using, atomically_with, Abort, Transaction, TxResult};
pub use undo_log::{UndoEntry, UndoLog};
pub use write_set::{WriteSet, WriteSetEntry};

pub use weft_error::WeftError;
pub use weft_types::{
    lane_mask, merge_masked, ScopeFlags, ScopeId, ThreadSlot, ThrownRange, Word, FULL_MASK,
    MAX_THREADS, WORD_BYTES,
};
