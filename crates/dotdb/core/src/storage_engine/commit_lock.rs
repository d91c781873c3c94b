// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Database-wide commit lock.
//!
//! Shared acquires are wait-free in the common case (an atomic increment on
//! a per-shard counter); they only block when an exclusive request is
//! pending and the calling thread holds no shared depth of its own already.
//! Exclusive is reserved for checkpoint metadata flips, compaction-end, and
//! close, and is biased to eventually win via unbounded exponential backoff
//! rather than a fair queue, so it never competes for priority against
//! ordinary shared traffic.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::storage_engine::lib::{StorageError, StorageResult};

const DEFAULT_SHARD_COUNT: usize = 16;
const INITIAL_BACKOFF: Duration = Duration::from_micros(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Assigned once per thread on first touch; spreads shared traffic across
    // shards without needing to hash the platform thread id.
    static SHARD_INDEX: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
    static SHARED_DEPTH: std::cell::Cell<u32> = std::cell::Cell::new(0);
}

#[derive(Default)]
struct Shard {
    acquire: AtomicI64,
    release: AtomicI64,
}

/// Reader-preferring database-wide latch.
///
/// Invariants: concurrent shared acquires scale linearly; at most one
/// exclusive holder exists at a time; a thread already holding shared may
/// re-enter shared, or acquire exclusive, without self-deadlock.
pub struct CommitLock {
    shards: Vec<Shard>,
    exclusive_pending: AtomicBool,
    exclusive_held: AtomicBool,
    full_latch: Mutex<()>,
    full_latch_cv: Condvar,
}

impl CommitLock {
    pub fn new() -> Self {
        Self::with_shard_count(DEFAULT_SHARD_COUNT)
    }

    pub fn with_shard_count(count: usize) -> Self {
        let count = count.max(1);
        Self {
            shards: (0..count).map(|_| Shard::default()).collect(),
            exclusive_pending: AtomicBool::new(false),
            exclusive_held: AtomicBool::new(false),
            full_latch: Mutex::new(()),
            full_latch_cv: Condvar::new(),
        }
    }

    fn shard(&self) -> &Shard {
        let idx = SHARD_INDEX.with(|i| *i);
        &self.shards[idx % self.shards.len()]
    }

    fn depth(&self) -> u32 {
        SHARED_DEPTH.with(|d| d.get())
    }

    fn bump_acquire(&self) {
        self.shard().acquire.fetch_add(1, Ordering::AcqRel);
        SHARED_DEPTH.with(|d| d.set(d.get() + 1));
    }

    /// Lock-free fast path: publish our acquire first, then verify no
    /// exclusive request raced in underneath us. Bumping before checking
    /// (rather than the reverse) matters: if we checked first and an
    /// `exclusive_acquire` slipped its pending flag and drain-sum snapshot
    /// in between the check and the bump, it could declare itself the sole
    /// holder while we go on believing we hold shared too. Bumping first
    /// means any exclusive acquirer's sum comparison either sees our
    /// increment (and keeps waiting) or hasn't set `exclusive_pending` yet
    /// (and we return normally). Returns `false` with the bump already
    /// undone if we lost the race, so the caller must fall back to the
    /// blocking path.
    fn try_fast_shared_acquire(&self) -> bool {
        if self.depth() > 0 {
            self.bump_acquire();
            return true;
        }
        self.bump_acquire();
        if !self.exclusive_pending.load(Ordering::Acquire) {
            return true;
        }
        self.shard().release.fetch_add(1, Ordering::AcqRel);
        SHARED_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        self.full_latch_cv.notify_all();
        false
    }

    /// Blocking shared acquire. Reentrant: nested calls on the same thread
    /// never wait on the full latch.
    pub fn shared_acquire(&self) {
        loop {
            if self.try_fast_shared_acquire() {
                return;
            }
            let mut guard = self.full_latch.lock();
            while self.exclusive_pending.load(Ordering::Acquire) {
                self.full_latch_cv.wait(&mut guard);
            }
            drop(guard);
        }
    }

    /// Shared acquire that observes cooperative interruption while waiting.
    pub fn shared_acquire_interruptible(&self, interrupted: &AtomicBool) -> StorageResult<()> {
        loop {
            if self.try_fast_shared_acquire() {
                return Ok(());
            }
            let mut guard = self.full_latch.lock();
            loop {
                if interrupted.swap(false, Ordering::AcqRel) {
                    return Err(StorageError::Interrupted);
                }
                if !self.exclusive_pending.load(Ordering::Acquire) {
                    break;
                }
                self.full_latch_cv.wait_for(&mut guard, Duration::from_millis(5));
            }
            drop(guard);
        }
    }

    /// Shared acquire bounded by `timeout`. Returns `Ok(false)` rather than
    /// an error on expiry, matching a lock-timeout result rather than a hard
    /// failure.
    pub fn shared_try_acquire(&self, timeout: Duration) -> StorageResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_fast_shared_acquire() {
                return Ok(true);
            }
            let mut guard = self.full_latch.lock();
            loop {
                if !self.exclusive_pending.load(Ordering::Acquire) {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                self.full_latch_cv.wait_for(&mut guard, deadline - now);
            }
            drop(guard);
        }
    }

    /// Shared acquire that ignores a pending exclusive request entirely.
    /// Used by paths (e.g. the exclusive acquirer's own nested shared work)
    /// that must never be blocked behind a checkpoint flip they themselves
    /// triggered.
    pub fn shared_acquire_unchecked(&self) {
        self.bump_acquire();
    }

    pub fn shared_release(&self) {
        self.shard().release.fetch_add(1, Ordering::AcqRel);
        SHARED_DEPTH.with(|d| {
            let depth = d.get();
            debug_assert!(depth > 0, "shared_release without a matching acquire");
            d.set(depth.saturating_sub(1));
        });
        self.full_latch_cv.notify_all();
    }

    fn acquire_sum(&self) -> i64 {
        self.shards.iter().map(|s| s.acquire.load(Ordering::Acquire)).sum()
    }

    fn release_sum(&self) -> i64 {
        self.shards.iter().map(|s| s.release.load(Ordering::Acquire)).sum()
    }

    /// Acquire exclusive. Publishes the exclusive-pending flag first (so
    /// fresh shared acquirers queue behind the full latch), transfers this
    /// thread's own reentrant shared depth into the release sum (so a
    /// thread that already holds shared can still acquire exclusive without
    /// waiting on itself), then drains outstanding shared holders with
    /// unbounded exponential backoff.
    pub fn exclusive_acquire(&self) {
        let guard = self.full_latch.lock();
        self.exclusive_pending.store(true, Ordering::Release);
        let self_depth = self.depth() as i64;
        if self_depth > 0 {
            self.shard().release.fetch_add(self_depth, Ordering::AcqRel);
        }
        drop(guard);

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.acquire_sum() == self.release_sum() {
                break;
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        self.exclusive_held.store(true, Ordering::Release);
    }

    pub fn exclusive_release(&self) {
        self.exclusive_held.store(false, Ordering::Release);
        let self_depth = self.depth() as i64;
        if self_depth > 0 {
            self.shard().release.fetch_sub(self_depth, Ordering::AcqRel);
        }
        let guard = self.full_latch.lock();
        self.exclusive_pending.store(false, Ordering::Release);
        drop(guard);
        self.full_latch_cv.notify_all();
    }

    pub fn is_exclusive_held(&self) -> bool {
        self.exclusive_held.load(Ordering::Acquire)
    }

    pub fn is_exclusive_pending(&self) -> bool {
        self.exclusive_pending.load(Ordering::Acquire)
    }
}

impl Default for CommitLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII shared hold. Released on drop regardless of unwind path.
pub struct SharedGuard<'a> {
    lock: &'a CommitLock,
}

impl<'a> SharedGuard<'a> {
    pub fn acquire(lock: &'a CommitLock) -> Self {
        lock.shared_acquire();
        Self { lock }
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.shared_release();
    }
}

/// RAII exclusive hold. Released on drop regardless of unwind path.
pub struct ExclusiveGuard<'a> {
    lock: &'a CommitLock,
}

impl<'a> ExclusiveGuard<'a> {
    pub fn acquire(lock: &'a CommitLock) -> Self {
        lock.exclusive_acquire();
        Self { lock }
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.exclusive_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_reentry_does_not_block() {
        let lock = CommitLock::new();
        lock.shared_acquire();
        lock.shared_acquire();
        lock.shared_release();
        lock.shared_release();
    }

    #[test]
    fn exclusive_excludes_shared_and_vice_versa() {
        let lock = Arc::new(CommitLock::new());
        lock.shared_acquire();
        lock.shared_release();

        let lock2 = lock.clone();
        let guard = thread::spawn(move || {
            lock2.exclusive_acquire();
            lock2.exclusive_release();
        });
        guard.join().unwrap();
        assert!(!lock.is_exclusive_held());
    }

    #[test]
    fn reentrant_holder_can_take_exclusive_without_deadlock() {
        let lock = CommitLock::new();
        lock.shared_acquire();
        lock.exclusive_acquire();
        assert!(lock.is_exclusive_held());
        lock.exclusive_release();
        lock.shared_release();
    }

    #[test]
    fn exclusive_eventually_succeeds_under_shared_churn() {
        let lock = Arc::new(CommitLock::new());
        let stop = Arc::new(AtomicBool::new(false));
        let successes = Arc::new(AtomicU32::new(0));

        let mut workers = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let stop = stop.clone();
            workers.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    lock.shared_acquire();
                    lock.shared_release();
                }
            }));
        }

        let exclusive_lock = lock.clone();
        let exclusive_successes = successes.clone();
        let exclusive = thread::spawn(move || {
            exclusive_lock.exclusive_acquire();
            exclusive_successes.fetch_add(1, Ordering::Relaxed);
            exclusive_lock.exclusive_release();
        });

        exclusive.join().unwrap();
        stop.store(true, Ordering::Relaxed);
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(successes.load(Ordering::Relaxed), 1);
    }
}
