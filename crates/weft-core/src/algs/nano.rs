//! Nano: optimistic ownership records with value-based validation.
//!
//! A deliberate step away from timestamp-ordered designs: no global clock,
//! a small orec table, and quadratic read-set revalidation. Every validated
//! read re-checks the entire read set, which is acceptable for the small
//! transactions this protocol targets and removes every process-wide
//! bottleneck.
//!
//! Writes buffer in the redo log and publish at commit under per-orec locks;
//! rollback is therefore cheap (restore orec words, drop the log). The
//! protocol is *not* privatization safe — nothing serializes a committed
//! writer's post-commit accesses against a still-running reader.

use std::hint::spin_loop;
use std::sync::atomic::{fence, Ordering};

use tracing::debug;

use weft_types::{mask_covers, merge_masked, ThrownRange, Word};

use crate::algs::{self, Algorithm, BarrierSet, Conflict};
use crate::mem;
use crate::metadata::{orec_for, orec_locked, OrecSnapshot};
use crate::thread::TxThread;

/// Bounded pause while an orec is locked, before re-sampling.
const LOCKED_PAUSE_SPINS: u32 = 64;

pub static ALGORITHM: Algorithm = Algorithm {
    name: "Nano",
    begin,
    ro: BarrierSet {
        read: read_ro,
        write: write_ro,
        commit: commit_ro,
    },
    rw: BarrierSet {
        read: read_rw,
        write: write_rw,
        commit: commit_rw,
    },
    read_reserve,
    write_reserve,
    release,
    rollback,
    irrevoc,
    on_switch,
    privatization_safe: false,
};

fn begin(tx: &mut TxThread) {
    tx.allocator.on_tx_begin();
}

#[cold]
fn validation_failed(tx: &TxThread, at: &'static str) -> Conflict {
    debug!(slot = %tx.slot(), at, "read-set validation failed, self-aborting");
    Conflict
}

unsafe fn read_ro(tx: &mut TxThread, addr: *mut Word, _mask: Word) -> Result<Word, Conflict> {
    let orec = orec_for(addr);

    loop {
        // Sample the orec, read the word, sample again. The fences keep the
        // data read strictly between the two samples.
        let before = orec.v(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let value = unsafe { mem::read_word(addr) };
        fence(Ordering::SeqCst);
        let after = orec.v(Ordering::Acquire);

        if before == after && !orec_locked(before) {
            tx.nanorecs.insert(OrecSnapshot { orec, v: after });
            // Revalidate everything we have read so far; the whole read set
            // must still be mutually consistent for this value to be safe
            // to return.
            for rec in tx.nanorecs.iter() {
                if rec.orec.v(Ordering::Acquire) != rec.v {
                    return Err(validation_failed(tx, "read"));
                }
            }
            return Ok(value);
        }

        if orec_locked(orec.v(Ordering::Relaxed)) {
            for _ in 0..LOCKED_PAUSE_SPINS {
                spin_loop();
            }
        }
    }
}

unsafe fn read_rw(tx: &mut TxThread, addr: *mut Word, mask: Word) -> Result<Word, Conflict> {
    // Check the redo log for a read-after-write hazard first.
    if let Some(entry) = tx.writes.find(addr) {
        let (logged_val, logged_mask) = (entry.val, entry.mask);
        if mask_covers(logged_mask, mask) {
            return Ok(logged_val);
        }
        // Partial hit: take the memory view, then lay our pending lanes
        // over it.
        let from_memory = unsafe { read_ro(tx, addr, mask) }?;
        return Ok(merge_masked(from_memory, logged_val, logged_mask));
    }
    unsafe { read_ro(tx, addr, mask) }
}

unsafe fn write_ro(tx: &mut TxThread, addr: *mut Word, val: Word, mask: Word) -> Result<(), Conflict> {
    tx.writes.insert(addr, val, mask);
    algs::on_first_write(tx);
    Ok(())
}

unsafe fn write_rw(tx: &mut TxThread, addr: *mut Word, val: Word, mask: Word) -> Result<(), Conflict> {
    tx.writes.insert(addr, val, mask);
    Ok(())
}

// Buffered writes have no lock to take early and nothing to release early;
// the reserve hints reduce to reads and no-ops.
unsafe fn read_reserve(tx: &mut TxThread, addr: *mut Word, mask: Word) -> Result<(), Conflict> {
    unsafe { read_ro(tx, addr, mask).map(|_| ()) }
}

unsafe fn write_reserve(tx: &mut TxThread, _addr: *mut Word, _mask: Word) -> Result<(), Conflict> {
    algs::on_first_write(tx);
    Ok(())
}

fn release(_tx: &mut TxThread, _addr: *mut Word, _mask: Word) {}

unsafe fn commit_ro(tx: &mut TxThread) -> Result<(), Conflict> {
    tx.nanorecs.reset();
    algs::after_commit(tx);
    Ok(())
}

unsafe fn commit_rw(tx: &mut TxThread) -> Result<(), Conflict> {
    let my_lock = tx.my_lock;

    // Acquire an orec for every pending write. No ordering discipline: a
    // failed CAS or a foreign lock is an immediate abort, and rollback
    // restores whatever we did manage to lock.
    {
        let writes = &tx.writes;
        let locks = &mut tx.locks;
        for entry in writes.iter() {
            let orec = orec_for(entry.addr);
            let observed = orec.v(Ordering::Acquire);
            if observed == my_lock {
                continue;
            }
            if orec_locked(observed) || !orec.try_lock(observed, my_lock) {
                return Err(Conflict);
            }
            orec.set_p(observed);
            locks.insert(orec);
        }
    }

    // Validate the read set now that locks are held: each sampled orec must
    // be unchanged, or held by us with its saved pre-lock version matching.
    for rec in tx.nanorecs.iter() {
        let current = rec.orec.v(Ordering::Acquire);
        if current != rec.v && (current != my_lock || rec.v != rec.orec.p()) {
            return Err(validation_failed(tx, "commit"));
        }
    }

    // Publish the redo log, then release each orec at its bumped version.
    unsafe { tx.writes.writeback() };
    for orec in tx.locks.iter() {
        orec.set_v(orec.p() + 1);
    }

    tx.nanorecs.reset();
    tx.writes.reset();
    tx.locks.reset();
    algs::after_commit(tx);
    Ok(())
}

unsafe fn rollback(tx: &mut TxThread, thrown: Option<ThrownRange>) {
    // A thrown object lives in buffered writes that are about to be
    // dropped; publish just its protected lanes so it survives the abort.
    if let Some(range) = thrown {
        unsafe { tx.writes.rollback_protecting(range) };
    }

    // Restore the pre-lock version on anything we locked during a failed
    // commit.
    for orec in tx.locks.iter() {
        orec.set_v(orec.p());
    }

    tx.nanorecs.reset();
    tx.writes.reset();
    tx.locks.reset();
    algs::after_rollback(tx);
}

fn irrevoc(_tx: &mut TxThread) -> bool {
    false
}

// No timestamps to reconcile, so switching to Nano needs no preparation.
fn on_switch() {}
