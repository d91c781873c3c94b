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

//! The page-relocation compaction strategy.
//!
//! Unlike a log-structured store, the backing array has exactly one shape
//! of waste: free pages stranded past the live high-water mark, padding the
//! file out with holes that will never be reused unless something physically
//! moves the live pages below them down and truncates the tail. There's one
//! strategy, not a family of them, so this module keeps the trigger/plan
//! split the wider compaction subsystem expects without pretending there's a
//! choice of algorithm to make.

use std::time::SystemTime;

/// A snapshot of free-space bookkeeping cheap enough to take on every
/// scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageManagerStats {
    pub total_pages: u64,
    /// Pages sitting in the regular/recycle free queues.
    pub free_pages: u64,
    /// Pages already staged in the reserve queue by a prior (possibly
    /// interrupted) compaction pass.
    pub reserve_pages: u64,
}

impl PageManagerStats {
    pub fn live_pages(&self) -> u64 {
        self.total_pages.saturating_sub(self.free_pages + self.reserve_pages)
    }

    /// Fraction of the backing array that is free, in \[0.0, 1.0\].
    pub fn free_ratio(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }
        (self.free_pages + self.reserve_pages) as f64 / self.total_pages as f64
    }
}

/// A planned compaction pass: relocate everything live above
/// `target_page_count` down below it, then truncate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTask {
    pub id: u64,
    pub target_page_count: u64,
    pub estimated_reclaimed_pages: u64,
    pub priority: u8,
    pub created_at: SystemTime,
}

/// Trigger thresholds for the relocation strategy.
#[derive(Debug, Clone, Copy)]
pub struct CompactionConfig {
    /// Minimum free-page ratio before compaction is worth running at all.
    pub min_free_ratio: f64,
    /// Minimum number of pages a pass must be able to reclaim to be worth
    /// the relocation I/O.
    pub min_reclaimable_pages: u64,
    /// Never shrink the backing array below this many pages.
    pub min_retained_pages: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_free_ratio: 0.25,
            min_reclaimable_pages: 64,
            min_retained_pages: 4,
        }
    }
}

/// Decides whether, and how, to run a compaction pass. Kept as a trait
/// (with a single implementation) so the manager's scheduling loop doesn't
/// need to know the difference between "no strategy fit" and "this is the
/// only strategy there is".
pub trait CompactionStrategy {
    fn should_compact(&self, stats: &PageManagerStats) -> bool;
    fn plan(&self, stats: &PageManagerStats, task_id: u64) -> Option<CompactionTask>;
}

/// The sole compaction strategy: shrink the backing array down to its live
/// high-water mark once enough of the tail is free to make it worthwhile.
pub struct PageRelocationStrategy {
    config: CompactionConfig,
}

impl PageRelocationStrategy {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    fn target_page_count(&self, stats: &PageManagerStats) -> u64 {
        stats.live_pages().max(self.config.min_retained_pages)
    }
}

impl CompactionStrategy for PageRelocationStrategy {
    fn should_compact(&self, stats: &PageManagerStats) -> bool {
        if stats.total_pages <= self.config.min_retained_pages {
            return false;
        }
        let reclaimable = stats.total_pages.saturating_sub(self.target_page_count(stats));
        stats.free_ratio() >= self.config.min_free_ratio && reclaimable >= self.config.min_reclaimable_pages
    }

    fn plan(&self, stats: &PageManagerStats, task_id: u64) -> Option<CompactionTask> {
        if !self.should_compact(stats) {
            return None;
        }
        let target = self.target_page_count(stats);
        Some(CompactionTask {
            id: task_id,
            target_page_count: target,
            estimated_reclaimed_pages: stats.total_pages.saturating_sub(target),
            priority: Self::priority_for(stats),
            created_at: SystemTime::now(),
        })
    }
}

impl PageRelocationStrategy {
    /// Higher free ratio means a more valuable pass; scaled onto a u8 so it
    /// slots into the same priority-ordered task queue the background
    /// worker pool already uses.
    fn priority_for(stats: &PageManagerStats) -> u8 {
        (stats.free_ratio() * 255.0).clamp(0.0, 255.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: u64, free: u64, reserve: u64) -> PageManagerStats {
        PageManagerStats {
            total_pages: total,
            free_pages: free,
            reserve_pages: reserve,
        }
    }

    #[test]
    fn does_not_trigger_below_free_ratio_threshold() {
        let strategy = PageRelocationStrategy::new(CompactionConfig::default());
        let s = stats(1000, 50, 0); // 5% free
        assert!(!strategy.should_compact(&s));
        assert!(strategy.plan(&s, 1).is_none());
    }

    #[test]
    fn triggers_once_tail_is_mostly_free() {
        let strategy = PageRelocationStrategy::new(CompactionConfig::default());
        let s = stats(1000, 400, 0); // 40% free, well above the 64-page minimum
        assert!(strategy.should_compact(&s));
        let task = strategy.plan(&s, 7).unwrap();
        assert_eq!(task.id, 7);
        assert_eq!(task.target_page_count, 600);
        assert_eq!(task.estimated_reclaimed_pages, 400);
    }

    #[test]
    fn never_targets_below_min_retained_pages() {
        let config = CompactionConfig {
            min_retained_pages: 10,
            min_free_ratio: 0.0,
            min_reclaimable_pages: 1,
        };
        let strategy = PageRelocationStrategy::new(config);
        let s = stats(20, 18, 0); // only 2 live pages
        let task = strategy.plan(&s, 1).unwrap();
        assert_eq!(task.target_page_count, 10);
    }

    #[test]
    fn reserve_pages_count_toward_free_ratio() {
        let strategy = PageRelocationStrategy::new(CompactionConfig::default());
        let s = stats(1000, 100, 300); // 40% free once reserve is counted
        assert!(strategy.should_compact(&s));
    }

    #[test]
    fn tiny_databases_never_compact() {
        let strategy = PageRelocationStrategy::new(CompactionConfig::default());
        let s = stats(3, 2, 0);
        assert!(!strategy.should_compact(&s));
    }
}
