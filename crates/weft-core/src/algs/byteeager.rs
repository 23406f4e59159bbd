//! ByteEager: pessimistic reader-writer bytelocks with versioning.
//!
//! Eager acquire, in-place update, undo-log rollback. Readers announce
//! themselves in a per-thread byte of the bucket's reader array; a writer
//! CASes the owner word, then drains every reader byte before touching
//! memory. There is no lock ordering — deadlock avoidance is bounded spin
//! plus self-abort, with randomized exponential backoff between attempts.
//!
//! The version counter on each bucket lets a reader detect that a writer
//! came and went between two of its reads: the first validated read records
//! the bucket version, and any later read (or write acquisition) of the same
//! bucket aborts if the version moved.
//!
//! Privatization is safe here: writers drain readers before updating in
//! place, and readers re-verify `owner == 0` after publishing their byte, so
//! no reader can observe a half-applied update.

use std::hint::spin_loop;

use rand::Rng;
use tracing::debug;

use weft_types::{ThrownRange, Word, MAX_THREADS};

use crate::algs::{self, Algorithm, BarrierSet, Conflict};
use crate::mem;
use crate::metadata::{bytelock_for, ByteLock};
use crate::stats;
use crate::thread::TxThread;

// Spin bounds, tuned for x86-class machines; exceeding one converts the wait
// into a self-abort.
const READ_TIMEOUT: u32 = 32;
const ACQUIRE_TIMEOUT: u32 = 128;
const DRAIN_TIMEOUT: u32 = 256;

// Randomized exponential backoff between attempts.
const BACKOFF_MIN_EXP: u32 = 4;
const BACKOFF_MAX_EXP: u32 = 16;

pub static ALGORITHM: Algorithm = Algorithm {
    name: "ByteEager",
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
    privatization_safe: true,
};

fn begin(tx: &mut TxThread) {
    tx.allocator.on_tx_begin();
}

#[cold]
fn spin_expired(tx: &TxThread, what: &'static str) -> Conflict {
    stats::note_timeout_abort();
    debug!(slot = %tx.slot(), what, "bytelock spin expired, self-aborting");
    Conflict
}

#[cold]
fn version_changed(tx: &TxThread) -> Conflict {
    debug!(slot = %tx.slot(), "bytelock version moved under a reader, self-aborting");
    Conflict
}

/// Take (or confirm) a read lock on `lock`, spinning out any writer.
fn acquire_for_read(tx: &mut TxThread, lock: &'static ByteLock) -> Result<(), Conflict> {
    let me = tx.slot();
    let mut tries = 0_u32;

    // Log this bucket on first contact; a recorded reader version means it
    // is already on the list even if the reader byte was released early.
    if lock.reader_version(me) == 0 {
        tx.r_bytelocks.insert(lock);
    }

    loop {
        // Publish the reader byte, then check for a writer. The store-load
        // fence inside set_reader keeps these from swapping.
        lock.set_reader(me);
        if lock.owner() == 0 {
            let recorded = lock.reader_version(me);
            if recorded == 0 {
                lock.set_reader_version(me, lock.version());
            } else if recorded != lock.version() {
                // A writer committed this bucket since our first read.
                return Err(version_changed(tx));
            }
            return Ok(());
        }

        // Writer present: retract the byte and wait for the owner to leave.
        lock.clear_reader(me);
        while lock.owner() != 0 {
            tries += 1;
            if tries > READ_TIMEOUT {
                return Err(spin_expired(tx, "read"));
            }
            spin_loop();
        }
    }
}

/// Take the writer slot on `lock`: CAS the owner, shed our reader byte,
/// check the recorded reader version, drain all other readers, then bump the
/// bucket version.
fn acquire_for_write(tx: &mut TxThread, lock: &'static ByteLock) -> Result<(), Conflict> {
    let me = tx.slot();
    let mut tries = 0_u32;

    while !lock.try_acquire_writer(me) {
        tries += 1;
        if tries > ACQUIRE_TIMEOUT {
            return Err(spin_expired(tx, "acquire"));
        }
        spin_loop();
    }

    // Ownership is ours; on any abort from here the rollback path releases
    // it via the write-lock list.
    tx.w_bytelocks.insert(lock);
    lock.clear_reader(me);

    // If we read this bucket earlier, a writer that slipped in between
    // invalidates us even though we now hold the lock ourselves.
    let recorded = lock.reader_version(me);
    if recorded != 0 && recorded != lock.version() {
        return Err(version_changed(tx));
    }

    // Wait for every other reader to drain out.
    for i in 0..MAX_THREADS {
        tries = 0;
        while lock.reader_at(i) != 0 {
            tries += 1;
            if tries > DRAIN_TIMEOUT {
                return Err(spin_expired(tx, "drain"));
            }
            spin_loop();
        }
    }

    lock.bump_version();
    Ok(())
}

unsafe fn read_ro(tx: &mut TxThread, addr: *mut Word, _mask: Word) -> Result<Word, Conflict> {
    let lock = bytelock_for(addr);
    if lock.reader_at(tx.slot().index()) == 1 {
        return Ok(unsafe { mem::read_word(addr) });
    }
    acquire_for_read(tx, lock)?;
    Ok(unsafe { mem::read_word(addr) })
}

unsafe fn read_rw(tx: &mut TxThread, addr: *mut Word, _mask: Word) -> Result<Word, Conflict> {
    let lock = bytelock_for(addr);
    // In-place update: memory already holds our writes, so owning the bucket
    // (or holding a read byte) means the plain load is the right answer.
    if lock.owner() == tx.slot().get() || lock.reader_at(tx.slot().index()) == 1 {
        return Ok(unsafe { mem::read_word(addr) });
    }
    acquire_for_read(tx, lock)?;
    Ok(unsafe { mem::read_word(addr) })
}

unsafe fn write_ro(tx: &mut TxThread, addr: *mut Word, val: Word, mask: Word) -> Result<(), Conflict> {
    let lock = bytelock_for(addr);
    acquire_for_write(tx, lock)?;
    unsafe {
        tx.undo_log.insert(addr, mem::read_word(addr), mask);
        mem::write_word_masked(addr, val, mask);
    }
    algs::on_first_write(tx);
    Ok(())
}

unsafe fn write_rw(tx: &mut TxThread, addr: *mut Word, val: Word, mask: Word) -> Result<(), Conflict> {
    let lock = bytelock_for(addr);
    if lock.owner() == tx.slot().get() {
        unsafe {
            tx.undo_log.insert(addr, mem::read_word(addr), mask);
            mem::write_word_masked(addr, val, mask);
        }
        return Ok(());
    }
    acquire_for_write(tx, lock)?;
    unsafe {
        tx.undo_log.insert(addr, mem::read_word(addr), mask);
        mem::write_word_masked(addr, val, mask);
    }
    Ok(())
}

unsafe fn read_reserve(tx: &mut TxThread, addr: *mut Word, _mask: Word) -> Result<(), Conflict> {
    let lock = bytelock_for(addr);
    if lock.owner() == tx.slot().get() || lock.reader_at(tx.slot().index()) == 1 {
        return Ok(());
    }
    acquire_for_read(tx, lock)
}

unsafe fn write_reserve(tx: &mut TxThread, addr: *mut Word, mask: Word) -> Result<(), Conflict> {
    let lock = bytelock_for(addr);
    if lock.owner() == tx.slot().get() {
        unsafe { tx.undo_log.insert(addr, mem::read_word(addr), mask) };
        return Ok(());
    }
    acquire_for_write(tx, lock)?;
    // Log the pre-reservation value so direct stores under the reservation
    // can be undone.
    unsafe { tx.undo_log.insert(addr, mem::read_word(addr), mask) };
    algs::on_first_write(tx);
    Ok(())
}

fn release(tx: &mut TxThread, addr: *mut Word, _mask: Word) {
    let lock = bytelock_for(addr);
    // Early release of a read lock; the recorded version stays so a later
    // re-read of this bucket still validates against it.
    if lock.owner() != tx.slot().get() {
        lock.clear_reader(tx.slot());
    }
}

unsafe fn commit_ro(tx: &mut TxThread) -> Result<(), Conflict> {
    let me = tx.slot();
    for lock in tx.r_bytelocks.iter() {
        lock.clear_reader(me);
        lock.clear_reader_version(me);
    }
    tx.r_bytelocks.reset();
    algs::after_commit(tx);
    Ok(())
}

unsafe fn commit_rw(tx: &mut TxThread) -> Result<(), Conflict> {
    let me = tx.slot();
    for lock in tx.w_bytelocks.iter() {
        lock.release_writer();
    }
    for lock in tx.r_bytelocks.iter() {
        lock.clear_reader(me);
        lock.clear_reader_version(me);
    }
    tx.r_bytelocks.reset();
    tx.w_bytelocks.reset();
    tx.undo_log.reset();
    algs::after_commit(tx);
    Ok(())
}

unsafe fn rollback(tx: &mut TxThread, thrown: Option<ThrownRange>) {
    // Undo while the write locks are still held, watching for the thrown
    // object.
    unsafe { tx.undo_log.undo_protecting(thrown) };

    let me = tx.slot();
    for lock in tx.w_bytelocks.iter() {
        lock.release_writer();
    }
    for lock in tx.r_bytelocks.iter() {
        lock.clear_reader(me);
        lock.clear_reader_version(me);
    }
    tx.r_bytelocks.reset();
    tx.w_bytelocks.reset();
    tx.undo_log.reset();

    tx.consec_aborts = tx.consec_aborts.saturating_add(1);
    backoff(tx);
    algs::after_rollback(tx);
}

fn irrevoc(_tx: &mut TxThread) -> bool {
    false
}

fn on_switch() {}

/// Randomized exponential backoff keyed on the consecutive-abort streak.
fn backoff(tx: &mut TxThread) {
    let exp = (tx.consec_aborts + BACKOFF_MIN_EXP).min(BACKOFF_MAX_EXP);
    let spins = tx.backoff_rng.gen_range(0..(1_u64 << exp));
    for _ in 0..spins {
        spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::with_thread;
    use std::thread;
    use weft_types::{ThreadSlot, FULL_MASK};

    /// Run `f` on a fresh OS thread with a fresh descriptor, so tests do not
    /// share per-thread STM state.
    fn on_fresh_thread<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
        thread::spawn(f).join().unwrap()
    }

    #[test]
    fn read_records_bucket_and_version() {
        on_fresh_thread(|| {
            let mut word: Word = 5;
            let p = std::ptr::addr_of_mut!(word);
            with_thread(|tx| unsafe {
                let v = read_ro(tx, p, FULL_MASK).unwrap();
                assert_eq!(v, 5);
                assert_eq!(tx.r_bytelocks.len(), 1);
                let lock = bytelock_for(p);
                assert_eq!(lock.reader_version(tx.slot()), lock.version());
                commit_ro(tx).unwrap();
                assert_eq!(lock.reader_at(tx.slot().index()), 0);
                assert_eq!(lock.reader_version(tx.slot()), 0);
            })
            .unwrap();
        });
    }

    #[test]
    fn write_acquires_owner_and_rollback_restores() {
        on_fresh_thread(|| {
            let mut word: Word = 10;
            let p = std::ptr::addr_of_mut!(word);
            with_thread(|tx| unsafe {
                write_ro(tx, p, 99, FULL_MASK).unwrap();
                assert_eq!(mem::read_word(p), 99);
                assert_eq!(bytelock_for(p).owner(), tx.slot().get());
                assert!(tx.first_write_done);
                rollback(tx, None);
                assert_eq!(bytelock_for(p).owner(), 0);
                assert!(!tx.first_write_done);
            })
            .unwrap();
            assert_eq!(word, 10);
        });
    }

    #[test]
    fn commit_rw_releases_locks_and_keeps_writes() {
        on_fresh_thread(|| {
            let mut word: Word = 1;
            let p = std::ptr::addr_of_mut!(word);
            with_thread(|tx| unsafe {
                write_ro(tx, p, 2, FULL_MASK).unwrap();
                commit_rw(tx).unwrap();
                assert_eq!(bytelock_for(p).owner(), 0);
                assert!(tx.undo_log.is_empty());
            })
            .unwrap();
            assert_eq!(word, 2);
        });
    }

    #[test]
    fn write_times_out_against_foreign_owner() {
        on_fresh_thread(|| {
            let mut word: Word = 0;
            let p = std::ptr::addr_of_mut!(word);
            // Park a writer id on the bucket that no live thread owns.
            let lock = bytelock_for(p);
            assert!(lock.try_acquire_writer(ThreadSlot::new(MAX_THREADS as u32).unwrap()));
            with_thread(|tx| unsafe {
                assert_eq!(write_ro(tx, p, 1, FULL_MASK), Err(Conflict));
                rollback(tx, None);
            })
            .unwrap();
            lock.release_writer();
            assert_eq!(word, 0);
        });
    }

    #[test]
    fn read_times_out_against_foreign_owner() {
        on_fresh_thread(|| {
            let mut word: Word = 0;
            let p = std::ptr::addr_of_mut!(word);
            let lock = bytelock_for(p);
            assert!(lock.try_acquire_writer(ThreadSlot::new(MAX_THREADS as u32).unwrap()));
            with_thread(|tx| unsafe {
                assert_eq!(read_ro(tx, p, FULL_MASK), Err(Conflict));
                rollback(tx, None);
                assert_eq!(lock.reader_at(tx.slot().index()), 0);
            })
            .unwrap();
            lock.release_writer();
        });
    }

    #[test]
    fn version_mismatch_aborts_second_read() {
        on_fresh_thread(|| {
            let mut word: Word = 0;
            let p = std::ptr::addr_of_mut!(word);
            with_thread(|tx| unsafe {
                read_ro(tx, p, FULL_MASK).unwrap();
                let lock = bytelock_for(p);
                // Simulate a writer that acquired and committed this bucket:
                // drop our reader byte, bump the version.
                lock.clear_reader(tx.slot());
                lock.bump_version();
                assert_eq!(read_ro(tx, p, FULL_MASK), Err(Conflict));
                rollback(tx, None);
            })
            .unwrap();
        });
    }

    #[test]
    fn write_reserve_takes_lock_without_memory_write() {
        on_fresh_thread(|| {
            let mut word: Word = 42;
            let p = std::ptr::addr_of_mut!(word);
            with_thread(|tx| unsafe {
                write_reserve(tx, p, FULL_MASK).unwrap();
                assert_eq!(mem::read_word(p), 42, "reserve must not write");
                assert_eq!(bytelock_for(p).owner(), tx.slot().get());
                assert!(tx.first_write_done, "reserve switches dispatch mode");
                assert_eq!(tx.undo_log.len(), 1);
                commit_rw(tx).unwrap();
            })
            .unwrap();
        });
    }

    #[test]
    fn early_release_clears_reader_byte() {
        on_fresh_thread(|| {
            let mut word: Word = 0;
            let p = std::ptr::addr_of_mut!(word);
            with_thread(|tx| unsafe {
                read_ro(tx, p, FULL_MASK).unwrap();
                let lock = bytelock_for(p);
                assert_eq!(lock.reader_at(tx.slot().index()), 1);
                release(tx, p, FULL_MASK);
                assert_eq!(lock.reader_at(tx.slot().index()), 0);
                // Version record survives for later revalidation.
                assert_ne!(lock.reader_version(tx.slot()), 0);
                commit_ro(tx).unwrap();
            })
            .unwrap();
        });
    }
}
