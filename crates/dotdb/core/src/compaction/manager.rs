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

//! Background scheduling around [`PageManager`]'s compaction lifecycle.
//!
//! The worker pool and scheduler thread shapes are the same ones any
//! background maintenance subsystem here would use; the only thing that
//! changed is what a task *is*. A task used to be "merge these input files";
//! now it's "shrink the backing array down to this many pages", driven
//! entirely through [`PageManager::compaction_start`]/`compaction_scan_free_list`/
//! `compaction_verify`/`compaction_end`/`compaction_reclaim`.

use super::strategy::{CompactionConfig, CompactionStrategy, CompactionTask, PageManagerStats, PageRelocationStrategy};
use crate::storage_engine::PageManager;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Compaction manager configuration.
#[derive(Debug, Clone)]
pub struct CompactionManagerConfig {
    /// How often the scheduler thread re-evaluates free-space stats.
    pub check_interval: Duration,
    /// Minimum time between two compaction passes, regardless of stats.
    pub min_compaction_interval: Duration,
    /// Maximum time a single pass is allowed to run before being logged as
    /// over budget (the thread itself is never killed mid-pass).
    pub max_compaction_duration: Duration,
    /// Whether the scheduler thread runs at all.
    pub enable_background_compaction: bool,
    pub strategy: CompactionConfig,
}

impl Default for CompactionManagerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            min_compaction_interval: Duration::from_secs(300),
            max_compaction_duration: Duration::from_secs(3600),
            enable_background_compaction: true,
            strategy: CompactionConfig::default(),
        }
    }
}

/// Running compaction statistics.
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    pub total_compactions: u64,
    pub successful_compactions: u64,
    pub failed_compactions: u64,
    pub pages_reclaimed: u64,
    pub total_compaction_time: Duration,
    pub last_compaction_time: Option<SystemTime>,
}

/// Outcome of a single compaction pass.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub task_id: u64,
    pub success: bool,
    pub pages_reclaimed: u64,
    pub duration: Duration,
    pub error_message: Option<String>,
}

struct Shared {
    config: CompactionManagerConfig,
    page_manager: Arc<Mutex<PageManager>>,
    stats: RwLock<CompactionStats>,
    completed: Mutex<VecDeque<CompactionResult>>,
    last_compaction: Mutex<Option<Instant>>,
    next_task_id: AtomicU64,
}

impl Shared {
    fn current_page_stats(&self) -> Result<PageManagerStats, Box<dyn std::error::Error + Send + Sync>> {
        let pm = self.page_manager.lock().map_err(|_| "page manager lock poisoned")?;
        Ok(PageManagerStats {
            total_pages: pm.total_pages()?,
            free_pages: pm.free_pages_count(),
            reserve_pages: pm.reserve_count(),
        })
    }

    fn interval_elapsed(&self) -> bool {
        match *self.last_compaction.lock().unwrap() {
            Some(t) => t.elapsed() >= self.config.min_compaction_interval,
            None => true,
        }
    }

    fn check_and_run(&self) -> Result<Option<CompactionResult>, Box<dyn std::error::Error + Send + Sync>> {
        if !self.interval_elapsed() {
            return Ok(None);
        }
        let stats = self.current_page_stats()?;
        let strategy = PageRelocationStrategy::new(self.config.strategy);
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let Some(task) = strategy.plan(&stats, task_id) else {
            return Ok(None);
        };
        Ok(Some(self.execute(task)))
    }

    fn execute(&self, task: CompactionTask) -> CompactionResult {
        let start = Instant::now();
        info!(task_id = task.id, target_pages = task.target_page_count, "starting compaction pass");

        self.stats.write().unwrap().total_compactions += 1;

        let outcome = self.run_pass(&task);
        let duration = start.elapsed();
        *self.last_compaction.lock().unwrap() = Some(Instant::now());

        let result = match outcome {
            Ok(reclaimed) => {
                if duration > self.config.max_compaction_duration {
                    warn!(task_id = task.id, ?duration, "compaction pass exceeded its time budget");
                }
                debug!(task_id = task.id, reclaimed, "compaction pass reclaimed pages");
                CompactionResult {
                    task_id: task.id,
                    success: true,
                    pages_reclaimed: reclaimed,
                    duration,
                    error_message: None,
                }
            }
            Err(err) => {
                error!(task_id = task.id, %err, "compaction pass failed");
                CompactionResult {
                    task_id: task.id,
                    success: false,
                    pages_reclaimed: 0,
                    duration,
                    error_message: Some(err.to_string()),
                }
            }
        };

        {
            let mut stats = self.stats.write().unwrap();
            if result.success {
                stats.successful_compactions += 1;
                stats.pages_reclaimed += result.pages_reclaimed;
            } else {
                stats.failed_compactions += 1;
            }
            stats.total_compaction_time += duration;
            stats.last_compaction_time = Some(SystemTime::now());
        }

        let mut completed = self.completed.lock().unwrap();
        completed.push_back(result.clone());
        if completed.len() > 1000 {
            completed.pop_front();
        }

        result
    }

    /// Runs the start/scan/verify/end/reclaim sequence against the page
    /// manager. Returns the number of pages the backing array shrank by.
    fn run_pass(&self, task: &CompactionTask) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let mut pm = self.page_manager.lock().map_err(|_| "page manager lock poisoned")?;
        let total_before = pm.total_pages()?;

        pm.compaction_start(task.target_page_count)?;
        pm.compaction_scan_free_list()?;

        if !pm.compaction_verify()? {
            // Live pages still occupy the truncation zone; whoever owns
            // them relocates them out-of-band and a later pass retries.
            pm.compaction_end().ok();
            return Ok(0);
        }

        pm.compaction_end()?;
        pm.compaction_reclaim()?;
        let total_after = pm.total_pages()?;
        Ok(total_before.saturating_sub(total_after))
    }
}

/// Background compaction manager: periodically asks the strategy whether a
/// pass is warranted and, if so, drives it against the page manager.
pub struct CompactionManager {
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    scheduler_handle: Option<JoinHandle<()>>,
}

impl CompactionManager {
    pub fn new(config: CompactionManagerConfig, page_manager: Arc<Mutex<PageManager>>) -> Self {
        let shared = Arc::new(Shared {
            config,
            page_manager,
            stats: RwLock::new(CompactionStats::default()),
            completed: Mutex::new(VecDeque::new()),
            last_compaction: Mutex::new(None),
            next_task_id: AtomicU64::new(1),
        });
        Self {
            shared,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new((Mutex::new(false), Condvar::new())),
            scheduler_handle: None,
        }
    }

    /// Starts the background scheduler thread. A no-op if background
    /// compaction is disabled in the config.
    pub fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !self.shared.config.enable_background_compaction {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let check_interval = self.shared.config.check_interval;

        let handle = thread::Builder::new().name("compaction-scheduler".to_string()).spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match shared.check_and_run() {
                    Ok(Some(result)) if !result.success => {
                        warn!(task_id = result.task_id, error = ?result.error_message, "scheduled compaction pass failed");
                    }
                    Err(err) => error!(%err, "compaction scheduler tick failed"),
                    _ => {}
                }

                let (lock, cvar) = &*wake;
                let guard = lock.lock().unwrap();
                let (mut guard, _) = cvar.wait_timeout(guard, check_interval).unwrap();
                *guard = false;
            }
        })?;

        self.scheduler_handle = Some(handle);
        Ok(())
    }

    /// Signals the scheduler thread to stop and waits for it to exit.
    pub fn stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.shutdown.store(true, Ordering::Relaxed);
        {
            let (lock, cvar) = &*self.wake;
            let mut woken = lock.lock().unwrap();
            *woken = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.scheduler_handle.take() {
            handle.join().map_err(|_| "failed to join compaction scheduler thread")?;
        }
        Ok(())
    }

    /// Wakes the scheduler thread immediately instead of waiting for the
    /// next `check_interval` tick.
    pub fn trigger_check(&self) {
        let (lock, cvar) = &*self.wake;
        let mut woken = lock.lock().unwrap();
        *woken = true;
        cvar.notify_all();
    }

    /// Checks current free-space stats and, if the strategy judges it
    /// worthwhile and the minimum interval has elapsed, runs one compaction
    /// pass synchronously. Returns the result if a pass ran.
    pub fn check_and_run(&self) -> Result<Option<CompactionResult>, Box<dyn std::error::Error + Send + Sync>> {
        self.shared.check_and_run()
    }

    /// Drives one full compaction pass for `task` and updates statistics.
    pub fn execute(&self, task: CompactionTask) -> CompactionResult {
        self.shared.execute(task)
    }

    pub fn stats(&self) -> CompactionStats {
        self.shared.stats.read().unwrap().clone()
    }

    pub fn recent_results(&self, limit: usize) -> Vec<CompactionResult> {
        self.shared.completed.lock().unwrap().iter().rev().take(limit).cloned().collect()
    }
}

impl Drop for CompactionManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::commit_lock::CommitLock;
    use crate::storage_engine::file_format::{FileFormat, PageType};
    use crate::storage_engine::lib::{Initializable, StorageConfig};
    use tempfile::tempdir;

    fn test_page_manager() -> Arc<Mutex<PageManager>> {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().join("pages.db"),
            page_size: 1024,
            ..StorageConfig::default()
        };
        let mut file_format = FileFormat::new(config);
        file_format.init().unwrap();
        std::mem::forget(dir);
        let mut pm = PageManager::new(Arc::new(Mutex::new(file_format)), Arc::new(CommitLock::new()), 1024, None);
        pm.init().unwrap();
        Arc::new(Mutex::new(pm))
    }

    fn small_config() -> CompactionManagerConfig {
        CompactionManagerConfig {
            check_interval: Duration::from_secs(3600),
            min_compaction_interval: Duration::from_millis(0),
            max_compaction_duration: Duration::from_secs(3600),
            enable_background_compaction: false,
            strategy: CompactionConfig {
                min_free_ratio: 0.1,
                min_reclaimable_pages: 1,
                min_retained_pages: 4,
            },
        }
    }

    #[test]
    fn check_and_run_is_noop_when_nothing_is_free() {
        let pm = test_page_manager();
        {
            let mut guard = pm.lock().unwrap();
            guard.allocate(PageType::Data, false).unwrap();
        }
        let manager = CompactionManager::new(small_config(), pm);
        let result = manager.check_and_run().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn check_and_run_reclaims_trailing_free_pages() {
        let pm = test_page_manager();
        {
            let mut guard = pm.lock().unwrap();
            for _ in 0..20 {
                let a = guard.allocate(PageType::Data, false).unwrap();
                guard.free(a.page_id, false, false, false).unwrap();
                guard.allocate(PageType::Data, false).unwrap();
            }
        }
        let manager = CompactionManager::new(small_config(), pm);
        let result = manager.check_and_run().unwrap();
        assert!(result.is_some());
        let result = result.unwrap();
        assert!(result.success);

        let stats = manager.stats();
        assert_eq!(stats.total_compactions, 1);
        assert_eq!(stats.successful_compactions, 1);
    }

    #[test]
    fn min_compaction_interval_is_respected() {
        let pm = test_page_manager();
        let mut config = small_config();
        config.min_compaction_interval = Duration::from_secs(3600);
        let manager = CompactionManager::new(config, pm);
        *manager.shared.last_compaction.lock().unwrap() = Some(Instant::now());
        let result = manager.check_and_run().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn recent_results_are_kept_most_recent_first() {
        let pm = test_page_manager();
        let manager = CompactionManager::new(small_config(), pm);
        for i in 1..=3u64 {
            let task = CompactionTask {
                id: i,
                target_page_count: 4,
                estimated_reclaimed_pages: 0,
                priority: 0,
                created_at: SystemTime::now(),
            };
            manager.execute(task);
        }
        let recent = manager.recent_results(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].task_id, 3);
        assert_eq!(recent[1].task_id, 2);
    }
}
