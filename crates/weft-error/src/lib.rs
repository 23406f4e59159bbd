use thiserror::Error;

/// Primary error type for weft runtime operations.
///
/// Conflict aborts never appear here: a conflicting transaction is rolled
/// back and retried inside the runtime, invisibly to the application. What
/// does surface is cancellation (the one application-visible unwind path),
/// configuration mistakes, and capacity limits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// The transaction was cancelled via cancel-and-throw. The protected
    /// range `[addr, addr + len)` survived rollback and is now owned by the
    /// caller.
    #[error("transaction cancelled; thrown object at {addr:#x}+{len}")]
    Cancelled { addr: usize, len: usize },

    /// Cancellation without a registered thrown object.
    #[error("transaction cancelled")]
    CancelledNoObject,

    /// No algorithm with the given short name is registered.
    #[error("unknown algorithm: '{name}'")]
    UnknownAlgorithm { name: String },

    /// All thread slots are taken; the metadata tables bound the number of
    /// concurrently registered threads.
    #[error("thread limit exceeded: at most {max} threads may register")]
    ThreadLimitExceeded { max: usize },

    /// A transactional operation was issued outside any transaction.
    #[error("no transaction is active on this thread")]
    NotInTransaction,

    /// The active algorithm cannot switch this transaction to irrevocable
    /// (commit-inevitable) mode in flight.
    #[error("algorithm '{algorithm}' does not support in-flight irrevocability")]
    IrrevocabilityUnsupported { algorithm: &'static str },
}
