//! The runtime's external interface: thread lifecycle, scope control, and
//! the word barriers, as consumed by a transactional-memory ABI adapter.
//!
//! Everything here operates on the calling thread's descriptor. Barriers
//! dispatch through the function pointers the active algorithm installed, so
//! a call costs one indirect call past the thread-local lookup.
//!
//! The word barriers take raw addresses and byte-lane masks; the typed
//! helpers at the bottom map sub-word accesses onto enclosing words the same
//! way a compiler adapter would. As with any word-granularity runtime,
//! mixing transactional and non-transactional accesses to *adjacent* bytes
//! of one word is a granularity hazard the caller must avoid.

use weft_error::WeftError;
use weft_types::{lane_mask, ScopeFlags, ScopeId, Word, WORD_BYTES};

use crate::algs;
use crate::scope::{LoggedWord, Scope};
use crate::thread::{self, TxThread};
use crate::txn::{Abort, TxResult};

// ---------------------------------------------------------------------------
// Thread lifecycle
// ---------------------------------------------------------------------------

/// Register the calling thread with the runtime. Idempotent; barriers and
/// `tx_begin` self-register, so calling this eagerly is optional.
pub fn thread_init() -> Result<(), WeftError> {
    thread::init_current_thread()
}

/// Tear down the calling thread's descriptor, returning its slot for reuse.
pub fn thread_fini() {
    thread::fini_current_thread();
}

// ---------------------------------------------------------------------------
// Scope control
// ---------------------------------------------------------------------------

fn with_active_scope<R>(f: impl FnOnce(&mut Scope) -> R) -> Result<R, WeftError> {
    thread::with_thread(|tx| tx.txn.innermost_mut().map(f).ok_or(WeftError::NotInTransaction))?
}

/// Establish a new scope: the outermost one for this thread, or a nested
/// one inside the running transaction. Returns the scope's id.
///
/// The returned id plays the role of a restart token: after a conflict the
/// retry driver re-enters the same scope under the same id.
pub fn tx_begin(flags: ScopeFlags) -> Result<ScopeId, WeftError> {
    thread::with_thread(|tx| tx.txn_begin(None, flags))
}

/// Attempt to commit the innermost scope. A nested commit merges into the
/// parent and cannot fail; the outermost commit runs the algorithm's commit
/// path and reports a conflict for the driver to retry. Commit callbacks of
/// the outermost scope fire here, after the commit has published.
///
/// # Panics
///
/// Panics if no transaction is active (precondition violation).
pub fn tx_commit() -> TxResult<()> {
    let outcome = thread::with_thread(|tx| tx.txn_commit())
        .expect("commit on an unregistered thread")
        .map_err(Abort::from)?;
    if let Some(mut scope) = outcome {
        scope.run_commit_callbacks();
    }
    Ok(())
}

/// Request a transaction restart.
///
/// In this runtime the non-local exit is the returned token: hand it back
/// through `?` and the retry driver rolls the transaction back to the
/// outermost scope's re-entry point. It must not be discarded.
pub fn tx_abort() -> Abort {
    Abort::conflict()
}

/// Cancel the transaction and deliver `[addr, addr + len)` to the caller.
///
/// Records the thrown object on the innermost scope, then unwinds like an
/// abort — except the protected range survives rollback and the driver
/// re-raises instead of retrying.
pub fn cancel_and_throw(addr: usize, len: usize) -> Abort {
    let _ = with_active_scope(|scope| scope.set_thrown_object(addr, len));
    Abort::cancel()
}

/// Cancel the transaction without a thrown object.
pub fn tx_cancel() -> Abort {
    Abort::cancel()
}

/// Register a protected range that must survive rollback.
pub fn tx_set_thrown(addr: usize, len: usize) -> Result<(), WeftError> {
    with_active_scope(|scope| scope.set_thrown_object(addr, len))
}

/// Drop the innermost scope's protected range.
pub fn tx_clear_thrown() -> Result<(), WeftError> {
    with_active_scope(Scope::clear_thrown_object)
}

/// The id of the innermost active scope.
pub fn current_scope_id() -> Result<ScopeId, WeftError> {
    thread::with_thread(|tx| tx.txn.innermost().map(Scope::id).ok_or(WeftError::NotInTransaction))?
}

/// Register `f` to run if the innermost scope commits.
pub fn scope_register_on_commit(f: impl FnOnce() + 'static) -> Result<(), WeftError> {
    with_active_scope(|scope| scope.on_commit(Box::new(f)))
}

/// Register `f` to run if the innermost scope rolls back.
pub fn scope_register_on_rollback(f: impl FnOnce() + 'static) -> Result<(), WeftError> {
    with_active_scope(|scope| scope.on_rollback(Box::new(f)))
}

/// Number of bytes in a contiguous low-lane prefix mask.
///
/// # Panics
///
/// Scope undo entries write a value's low bytes to an address, so the mask
/// must be a prefix like `0xFFFF`; anything else is a precondition
/// violation.
fn prefix_bytes(mask: Word) -> usize {
    let mut rest = mask;
    let mut bytes = 0;
    while bytes < WORD_BYTES && rest & 0xFF == 0xFF {
        bytes += 1;
        rest >>= 8;
    }
    assert!(
        rest == 0 && bytes > 0,
        "scope undo mask {mask:#x} is not a contiguous low-lane prefix"
    );
    bytes
}

/// Log `prior` as the innermost scope's undo value for `addr`.
///
/// The masked low lanes of `prior` are written back to `addr` if the scope
/// rolls back, clipped against any thrown-object range.
///
/// # Safety
///
/// `addr` must remain valid for writes until the outermost scope resolves.
pub unsafe fn scope_register_undo(
    addr: *mut u8,
    prior: Word,
    mask: Word,
) -> Result<(), WeftError> {
    let bytes = prefix_bytes(mask);
    with_active_scope(|scope| scope.log_word(LoggedWord::new(addr, prior, bytes)))
}

/// Log the current contents of `[addr, addr + len)` for scope-level undo,
/// chunked into words plus a masked tail.
///
/// # Safety
///
/// The range must be valid for reads now and writes until the outermost
/// scope resolves.
pub unsafe fn scope_log_bytes(addr: *mut u8, len: usize) -> Result<(), WeftError> {
    with_active_scope(|scope| unsafe { scope.log_bytes(addr, len) })
}

/// Ask the active algorithm to make the running transaction irrevocable.
pub fn become_irrevocable() -> Result<(), WeftError> {
    thread::with_thread(|tx| {
        if tx.txn.depth() == 0 {
            return Err(WeftError::NotInTransaction);
        }
        let irrevoc = tx.alg.irrevoc;
        if irrevoc(tx) {
            Ok(())
        } else {
            Err(WeftError::IrrevocabilityUnsupported {
                algorithm: tx.alg.name,
            })
        }
    })?
}

/// Make the named algorithm the process default for subsequent outermost
/// transactions.
pub fn algorithm_select(name: &str) -> Result<(), WeftError> {
    algs::select_by_name(name).map(|_| ())
}

// ---------------------------------------------------------------------------
// Word barriers
// ---------------------------------------------------------------------------

fn with_tx_in_txn<R>(f: impl FnOnce(&mut TxThread) -> R) -> R {
    thread::with_thread(|tx| {
        debug_assert!(tx.txn.depth() > 0, "barrier outside a transaction");
        f(tx)
    })
    .expect("barrier on an unregistered thread")
}

/// Transactional load of the word at `addr` under a byte-lane mask.
///
/// # Safety
///
/// `addr` must be valid for reads, word-aligned, and transactionally shared
/// (no concurrent non-transactional writers).
pub unsafe fn tx_read(addr: *mut Word, mask: Word) -> TxResult<Word> {
    with_tx_in_txn(|tx| {
        let read = tx.dispatch.read;
        unsafe { read(tx, addr, mask) }.map_err(Abort::from)
    })
}

/// Transactional store of the masked lanes of `val` to `addr`.
///
/// # Safety
///
/// As for [`tx_read`], plus validity for writes.
pub unsafe fn tx_write(addr: *mut Word, val: Word, mask: Word) -> TxResult<()> {
    with_tx_in_txn(|tx| {
        let write = tx.dispatch.write;
        unsafe { write(tx, addr, val, mask) }.map_err(Abort::from)
    })
}

/// Advisory early read-lock of the bucket guarding `addr`, without reading.
///
/// # Safety
///
/// As for [`tx_read`].
pub unsafe fn tx_read_reserve(addr: *mut Word, mask: Word) -> TxResult<()> {
    with_tx_in_txn(|tx| {
        let reserve = tx.alg.read_reserve;
        unsafe { reserve(tx, addr, mask) }.map_err(Abort::from)
    })
}

/// Advisory early write-lock of the bucket guarding `addr`, without writing.
///
/// # Safety
///
/// As for [`tx_write`].
pub unsafe fn tx_write_reserve(addr: *mut Word, mask: Word) -> TxResult<()> {
    with_tx_in_txn(|tx| {
        let reserve = tx.alg.write_reserve;
        unsafe { reserve(tx, addr, mask) }.map_err(Abort::from)
    })
}

/// Advisory early release of the bucket guarding `addr`. Never aborts.
///
/// # Safety
///
/// As for [`tx_read`].
pub unsafe fn tx_release(addr: *mut Word, mask: Word) {
    with_tx_in_txn(|tx| {
        let release = tx.alg.release;
        release(tx, addr, mask);
    });
}

// ---------------------------------------------------------------------------
// Typed sub-word access
// ---------------------------------------------------------------------------

macro_rules! typed_int_barriers {
    ($read_fn:ident, $write_fn:ident, $ty:ty) => {
        /// Typed transactional load, mapped onto the enclosing word barrier
        /// with a shifted lane mask.
        ///
        /// # Safety
        ///
        /// `addr` must be valid, naturally aligned, and must not straddle a
        /// word boundary. See [`tx_read`].
        pub unsafe fn $read_fn(addr: *const $ty) -> TxResult<$ty> {
            const SIZE: usize = std::mem::size_of::<$ty>();
            let base = (addr as usize) & !(WORD_BYTES - 1);
            let offset = addr as usize - base;
            debug_assert!(offset + SIZE <= WORD_BYTES);
            let word = unsafe { tx_read(base as *mut Word, lane_mask(offset, SIZE)) }?;
            Ok((word >> (offset * 8)) as $ty)
        }

        /// Typed transactional store, mapped onto the enclosing word barrier
        /// with a shifted lane mask.
        ///
        /// # Safety
        ///
        /// As for the typed load, plus validity for writes. See
        /// [`tx_write`].
        pub unsafe fn $write_fn(addr: *mut $ty, val: $ty) -> TxResult<()> {
            const SIZE: usize = std::mem::size_of::<$ty>();
            let base = (addr as usize) & !(WORD_BYTES - 1);
            let offset = addr as usize - base;
            debug_assert!(offset + SIZE <= WORD_BYTES);
            unsafe {
                tx_write(
                    base as *mut Word,
                    (val as Word) << (offset * 8),
                    lane_mask(offset, SIZE),
                )
            }
        }
    };
}

typed_int_barriers!(read_u8, write_u8, u8);
typed_int_barriers!(read_u16, write_u16, u16);
typed_int_barriers!(read_u32, write_u32, u32);
typed_int_barriers!(read_u64, write_u64, u64);
typed_int_barriers!(read_usize, write_usize, usize);

/// Typed transactional load of an `f32` via its bit pattern.
///
/// # Safety
///
/// As for [`read_u32`].
pub unsafe fn read_f32(addr: *const f32) -> TxResult<f32> {
    Ok(f32::from_bits(unsafe { read_u32(addr.cast()) }?))
}

/// Typed transactional store of an `f32` via its bit pattern.
///
/// # Safety
///
/// As for [`write_u32`].
pub unsafe fn write_f32(addr: *mut f32, val: f32) -> TxResult<()> {
    unsafe { write_u32(addr.cast(), val.to_bits()) }
}

/// Typed transactional load of an `f64` via its bit pattern.
///
/// # Safety
///
/// As for [`read_u64`].
pub unsafe fn read_f64(addr: *const f64) -> TxResult<f64> {
    Ok(f64::from_bits(unsafe { read_u64(addr.cast()) }?))
}

/// Typed transactional store of an `f64` via its bit pattern.
///
/// # Safety
///
/// As for [`write_u64`].
pub unsafe fn write_f64(addr: *mut f64, val: f64) -> TxResult<()> {
    unsafe { write_u64(addr.cast(), val.to_bits()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::atomically;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread as os_thread;

    fn on_fresh_thread<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
        os_thread::spawn(f).join().unwrap()
    }

    #[test]
    fn scope_operations_require_a_transaction() {
        on_fresh_thread(|| {
            assert_eq!(tx_set_thrown(0x100, 4), Err(WeftError::NotInTransaction));
            assert_eq!(tx_clear_thrown(), Err(WeftError::NotInTransaction));
            assert_eq!(current_scope_id().unwrap_err(), WeftError::NotInTransaction);
            assert_eq!(become_irrevocable(), Err(WeftError::NotInTransaction));
        });
    }

    #[test]
    fn typed_roundtrip_inside_transaction() {
        on_fresh_thread(|| {
            // One aligned word holding four u16 fields.
            let mut packed: u64 = 0;
            let base = std::ptr::addr_of_mut!(packed).cast::<u16>();
            atomically(|| {
                unsafe {
                    write_u16(base, 0x1111)?;
                    write_u16(base.add(3), 0x4444)?;
                    assert_eq!(read_u16(base)?, 0x1111);
                    assert_eq!(read_u16(base.add(3))?, 0x4444);
                }
                Ok(())
            })
            .unwrap();
            assert_eq!(packed, 0x4444_0000_0000_1111);
        });
    }

    #[test]
    fn f64_roundtrip() {
        on_fresh_thread(|| {
            let mut value: f64 = 0.0;
            let p = std::ptr::addr_of_mut!(value);
            atomically(|| {
                unsafe {
                    write_f64(p, 2.5)?;
                    assert_eq!(read_f64(p)?, 2.5);
                }
                Ok(())
            })
            .unwrap();
            assert_eq!(value, 2.5);
        });
    }

    #[test]
    fn commit_and_rollback_callbacks_fire_appropriately() {
        on_fresh_thread(|| {
            let commits = Rc::new(Cell::new(0));
            let rollbacks = Rc::new(Cell::new(0));
            let attempts = Rc::new(Cell::new(0));
            let (c, r, a) = (
                Rc::clone(&commits),
                Rc::clone(&rollbacks),
                Rc::clone(&attempts),
            );
            atomically(move || {
                a.set(a.get() + 1);
                let c2 = Rc::clone(&c);
                scope_register_on_commit(move || c2.set(c2.get() + 1)).unwrap();
                let r2 = Rc::clone(&r);
                scope_register_on_rollback(move || r2.set(r2.get() + 1)).unwrap();
                if a.get() == 1 {
                    return Err(tx_abort());
                }
                Ok(())
            })
            .unwrap();
            assert_eq!(attempts.get(), 2);
            assert_eq!(rollbacks.get(), 1, "first attempt rolled back");
            assert_eq!(commits.get(), 1, "second attempt committed");
        });
    }

    #[test]
    fn scope_register_undo_restores_on_rollback_only() {
        on_fresh_thread(|| {
            let mut value: u64 = 7;
            let p = std::ptr::addr_of_mut!(value).cast::<u8>();
            let attempts = Rc::new(Cell::new(0));
            let a = Rc::clone(&attempts);
            atomically(move || {
                a.set(a.get() + 1);
                unsafe {
                    scope_register_undo(p, 7, !0).unwrap();
                    // Mutate outside the barriers; scope undo compensates.
                    p.cast::<u64>().write(99);
                }
                if a.get() == 1 {
                    return Err(tx_abort());
                }
                Ok(())
            })
            .unwrap();
            // Second attempt also wrote 99, and the commit kept it.
            assert_eq!(value, 99);
        });
    }

    #[test]
    fn prefix_mask_validation() {
        assert_eq!(prefix_bytes(0xFF), 1);
        assert_eq!(prefix_bytes(0xFFFF), 2);
        assert_eq!(prefix_bytes(!0), WORD_BYTES);
    }

    #[test]
    #[should_panic(expected = "not a contiguous low-lane prefix")]
    fn non_prefix_mask_is_rejected() {
        let _ = prefix_bytes(0xFF00);
    }

    #[test]
    fn irrevocability_is_declined_by_both_algorithms() {
        on_fresh_thread(|| {
            atomically(|| {
                match become_irrevocable() {
                    Err(WeftError::IrrevocabilityUnsupported { .. }) => Ok(()),
                    other => panic!("unexpected: {other:?}"),
                }
            })
            .unwrap();
        });
    }

    #[test]
    fn explicit_thread_lifecycle() {
        on_fresh_thread(|| {
            thread_init().unwrap();
            thread_fini();
            // Re-init after fini works.
            thread_init().unwrap();
            thread_fini();
        });
    }
}
