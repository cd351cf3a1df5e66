// SPDX-License-Identifier: Apache-2.0

//! The versioned lock: a single machine word per cell, packing a lock bit
//! into the most significant bit and a version into the rest.
//!
//! This is the TL2 "vLock". Acquiring it is a bounded CAS loop with no
//! backoff beyond a CPU spin hint; releasing it both clears the lock bit and
//! stamps a new version in one atomic store.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Bit position of the lock flag: the most significant bit of the word.
const LOCK_BIT: usize = 1 << (usize::BITS - 1);

const fn is_locked_word(word: usize) -> bool {
    word & LOCK_BIT != 0
}

const fn version_of_word(word: usize) -> usize {
    word & !LOCK_BIT
}

const fn locked_word(word: usize) -> usize {
    word | LOCK_BIT
}

/// A word-sized spin-lock with an embedded version counter.
///
/// Every read goes through [`VersionedLock::snapshot`], which never blocks.
/// Every write goes through [`VersionedLock::try_lock`] / [`VersionedLock::unlock_with`],
/// which spin until the lock bit is clear.
#[derive(Debug, Default)]
pub struct VersionedLock {
    word: AtomicUsize,
}

impl VersionedLock {
    /// Creates an unlocked lock at the given initial version.
    pub const fn new(version: usize) -> Self {
        Self {
            word: AtomicUsize::new(version),
        }
    }

    /// Atomically reads the current `{lock, version}` word.
    ///
    /// Acquire ordering: nothing that dereferences the guarded value may be
    /// reordered before this load.
    #[inline]
    pub fn snapshot(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }

    #[inline]
    pub const fn is_locked(word: usize) -> bool {
        is_locked_word(word)
    }

    #[inline]
    pub const fn version_of(word: usize) -> usize {
        version_of_word(word)
    }

    /// Attempts a single CAS from `expected` (unlocked) to the locked form of
    /// `expected`. Returns `true` on success.
    #[inline]
    fn try_cas_lock(&self, expected: usize) -> bool {
        self.word
            .compare_exchange(
                expected,
                locked_word(expected),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Spins until the lock is acquired. There is no timeout: the caller is
    /// responsible for acquiring locks in a deadlock-free order.
    ///
    /// Returns the version the lock carried at the instant it was acquired,
    /// so the caller can restore that exact version on abort. Sampling the
    /// version in an earlier, separate pass would race: another committer
    /// could lock, publish a newer version, and unlock in between, and
    /// restoring the stale sample would move the version backwards.
    pub fn lock(&self) -> usize {
        loop {
            let word = self.word.load(Ordering::Relaxed);
            if !is_locked_word(word) && self.try_cas_lock(word) {
                return word;
            }
            std::hint::spin_loop();
        }
    }

    /// Releases the lock, stamping `version` and clearing the lock bit in a
    /// single atomic store.
    ///
    /// Release ordering: every write to the guarded value must be visible to
    /// any thread that subsequently observes this store.
    #[inline]
    pub fn unlock_with(&self, version: usize) {
        debug_assert!(version_of_word(version) == version, "version overflowed into the lock bit");
        self.word.store(version, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_unlocked_at_version_zero() {
        let lock = VersionedLock::new(0);
        let w = lock.snapshot();
        assert!(!VersionedLock::is_locked(w));
        assert_eq!(VersionedLock::version_of(w), 0);
    }

    #[test]
    fn lock_sets_bit_unlock_stamps_version() {
        let lock = VersionedLock::new(5);
        lock.lock();
        assert!(VersionedLock::is_locked(lock.snapshot()));
        lock.unlock_with(6);
        let w = lock.snapshot();
        assert!(!VersionedLock::is_locked(w));
        assert_eq!(VersionedLock::version_of(w), 6);
    }

    #[test]
    fn concurrent_lockers_serialize() {
        let lock = Arc::new(VersionedLock::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    lock.lock();
                    let v = VersionedLock::version_of(lock.snapshot());
                    lock.unlock_with(v + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(VersionedLock::version_of(lock.snapshot()), 1600);
    }
}
