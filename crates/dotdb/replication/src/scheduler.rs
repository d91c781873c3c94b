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

//! Delayed-task scheduler backing election timeouts, missing-data repair,
//! and leadership-affirmation broadcasts. A small fixed worker pool pulls
//! from a min-heap ordered by fire time; cancellation is cooperative via an
//! `AtomicBool` flag checked by the task itself, matching spec.md §5's "a
//! shutting-down scheduler rejects new tasks; in-flight tasks observe
//! shutdown and exit."

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

struct ScheduledTask {
    fire_at: Instant,
    sequence: u64,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.sequence == other.sequence
    }
}
impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest fire time sorts
        // highest (i.e. pops first).
        other.fire_at.cmp(&self.fire_at).then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Inner {
    heap: Mutex<BinaryHeap<ScheduledTask>>,
    condvar: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
}

/// A handle that cancels a scheduled task if it hasn't fired yet. Dropping
/// it without calling [`Self::cancel`] leaves the task scheduled.
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn cancel(&self) {
        self.flag.store(true, AtomicOrdering::Release);
    }
}

/// Fixed-size worker pool driving a delayed-task priority queue.
pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(worker_count: usize) -> Arc<Self> {
        let inner = Arc::new(Inner {
            heap: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        });
        let mut workers = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let inner = inner.clone();
            workers.push(thread::spawn(move || Self::worker_loop(inner)));
        }
        Arc::new(Self { inner, workers: Mutex::new(workers) })
    }

    fn worker_loop(inner: Arc<Inner>) {
        loop {
            let mut guard = inner.heap.lock().unwrap();
            loop {
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                match guard.peek() {
                    None => {
                        guard = inner.condvar.wait(guard).unwrap();
                    }
                    Some(top) => {
                        let now = Instant::now();
                        if top.fire_at <= now {
                            break;
                        }
                        let (g, _) = inner.condvar.wait_timeout(guard, top.fire_at - now).unwrap();
                        guard = g;
                    }
                }
            }
            if inner.shutdown.load(AtomicOrdering::Acquire) {
                return;
            }
            let scheduled = guard.pop();
            drop(guard);
            if let Some(scheduled) = scheduled {
                (scheduled.task)();
            }
        }
    }

    /// Run `task` once after `delay`, unless the scheduler shuts down first
    /// or it's cancelled in the meantime.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return;
        }
        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let scheduled = ScheduledTask {
            fire_at: Instant::now() + delay,
            sequence,
            task: Box::new(task),
        };
        self.inner.heap.lock().unwrap().push(scheduled);
        self.inner.condvar.notify_all();
    }

    /// Run `task` once after `delay` unless cancelled first. The task
    /// itself is responsible for checking the returned flag if it wants to
    /// no-op cooperatively rather than simply not firing.
    pub fn schedule_cancellable(self: &Arc<Self>, delay: Duration, task: impl FnOnce() + Send + 'static) -> Cancellation {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_for_task = flag.clone();
        self.schedule(delay, move || {
            if !flag_for_task.load(AtomicOrdering::Acquire) {
                task();
            }
        });
        Cancellation { flag }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        self.inner.condvar.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn runs_task_after_delay() {
        let scheduler = Scheduler::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        scheduler.schedule(Duration::from_millis(10), move || {
            counter2.fetch_add(1, AtomicOrdering::Relaxed);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1);
        scheduler.shutdown();
    }

    #[test]
    fn cancellation_prevents_task() {
        let scheduler = Scheduler::new(1);
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        let cancellation = scheduler.schedule_cancellable(Duration::from_millis(30), move || {
            counter2.fetch_add(1, AtomicOrdering::Relaxed);
        });
        cancellation.cancel();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 0);
        scheduler.shutdown();
    }
}
