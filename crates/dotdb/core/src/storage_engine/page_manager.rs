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

//! Compaction-aware page allocator.
//!
//! Free pages live in three queues instead of one:
//!
//! - `regular` — ordinary freed pages, reused in no particular order.
//! - `recycle` — pages freed by the hottest paths (row delete/update undo),
//!   kept separate so their hot in-memory buffer absorbs the bulk of
//!   allocate/free traffic without touching disk.
//! - `reserve` — pages relocated out of the truncation zone during
//!   compaction. Never handed out by ordinary allocation; only stolen when
//!   compaction is active and the caller opts in, so compaction can't be
//!   starved by unrelated allocators refilling the zone it's trying to
//!   empty.
//!
//! When all three queues are empty (or, for `reserve`, off limits) the
//! backing array grows via [`FileFormat::extend`], subject to
//! [`StorageConfig::page_limit`].

use std::sync::{Arc, Mutex};

use crate::storage_engine::commit_lock::CommitLock;
use crate::storage_engine::file_format::{FileFormat, Page, PageId, PageType};
use crate::storage_engine::lib::{Initializable, StorageError, StorageResult, VersionId};
use crate::storage_engine::page_queue::{PageQueue, PageQueueHeader};

/// Fixed page ids holding each queue's 44-byte header. Pages 0 is the
/// `FileFormat` file header; these three immediately follow it and always
/// exist once a database has been initialized.
const REGULAR_HEADER_PAGE: PageId = PageId(1);
const RECYCLE_HEADER_PAGE: PageId = PageId(2);
const RESERVE_HEADER_PAGE: PageId = PageId(3);
const FIRST_DATA_PAGE: u64 = 4;

const HOT_BUFFER_CAPACITY: usize = 64;

thread_local! {
    /// Per-thread override of `page_limit`. Installed around a commit's own
    /// bookkeeping allocations so they are never throttled by the same cap
    /// that bounds ordinary user allocations.
    static PAGE_LIMIT_OVERRIDE: std::cell::Cell<Option<Option<u64>>> = std::cell::Cell::new(None);
}

/// RAII guard installing a per-thread [`StorageConfig::page_limit`] override
/// for the current thread, restoring the previous override on drop.
pub struct PageLimitOverride {
    previous: Option<Option<u64>>,
}

impl PageLimitOverride {
    /// While held, `PageManager::allocate` on this thread sees `limit`
    /// instead of the manager's configured limit.
    pub fn install(limit: Option<u64>) -> Self {
        let previous = PAGE_LIMIT_OVERRIDE.with(|c| c.replace(Some(limit)));
        Self { previous }
    }
}

impl Drop for PageLimitOverride {
    fn drop(&mut self) {
        PAGE_LIMIT_OVERRIDE.with(|c| c.set(self.previous));
    }
}

/// Result of a page allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAllocation {
    pub page_id: PageId,
    pub page_type: PageType,
    /// `true` if this page came from growing the backing array rather than
    /// being reused from a free queue.
    pub is_new: bool,
    pub version: VersionId,
}

/// Which free queue a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Regular,
    Recycle,
    Reserve,
}

struct CompactionState {
    target_page_count: u64,
}

pub struct PageManager {
    file_format: Arc<Mutex<FileFormat>>,
    commit_lock: Arc<CommitLock>,
    page_size: usize,
    page_limit: Option<u64>,
    regular: PageQueue,
    recycle: PageQueue,
    reserve: PageQueue,
    current_version: VersionId,
    compaction: Option<CompactionState>,
    initialized: bool,
}

impl PageManager {
    pub fn new(file_format: Arc<Mutex<FileFormat>>, commit_lock: Arc<CommitLock>, page_size: usize, page_limit: Option<u64>) -> Self {
        Self {
            file_format,
            commit_lock,
            page_size,
            page_limit,
            regular: PageQueue::new(HOT_BUFFER_CAPACITY),
            recycle: PageQueue::new(HOT_BUFFER_CAPACITY),
            reserve: PageQueue::new(HOT_BUFFER_CAPACITY),
            current_version: VersionId(1),
            compaction: None,
            initialized: false,
        }
    }

    pub fn current_version(&self) -> VersionId {
        self.current_version
    }

    pub fn set_version(&mut self, version: VersionId) {
        self.current_version = version;
    }

    fn with_file_format<T>(&self, f: impl FnOnce(&mut FileFormat) -> StorageResult<T>) -> StorageResult<T> {
        let mut guard = self.file_format.lock().map_err(|_| StorageError::Corruption("file format lock poisoned".to_string()))?;
        f(&mut guard)
    }

    /// Ensures the three queue-header pages exist, then loads their
    /// persisted state. Called once at startup.
    fn load_headers(&mut self) -> StorageResult<()> {
        let was_new = self.with_file_format(|ff| {
            let was_new = ff.total_pages() < FIRST_DATA_PAGE;
            if was_new {
                let needed = FIRST_DATA_PAGE - ff.total_pages();
                ff.extend(needed)?;
            }
            Ok(was_new)
        })?;

        if was_new {
            self.write_header(REGULAR_HEADER_PAGE, PageQueueHeader::default())?;
            self.write_header(RECYCLE_HEADER_PAGE, PageQueueHeader::default())?;
            self.write_header(RESERVE_HEADER_PAGE, PageQueueHeader::default())?;
        }

        let regular_header = self.read_header(REGULAR_HEADER_PAGE)?;
        let recycle_header = self.read_header(RECYCLE_HEADER_PAGE)?;
        let reserve_header = self.read_header(RESERVE_HEADER_PAGE)?;
        self.regular = PageQueue::from_header(regular_header, HOT_BUFFER_CAPACITY);
        self.recycle = PageQueue::from_header(recycle_header, HOT_BUFFER_CAPACITY);
        self.reserve = PageQueue::from_header(reserve_header, HOT_BUFFER_CAPACITY);
        Ok(())
    }

    fn read_header(&self, page_id: PageId) -> StorageResult<PageQueueHeader> {
        self.with_file_format(|ff| {
            let page = ff.read_page(page_id)?;
            PageQueueHeader::deserialize(&page.data[..PageQueueHeader::SIZE])
        })
    }

    /// Persists all three queue headers. Cheap (three small page writes);
    /// callers flush after any operation that changes queue shape.
    pub fn flush_headers(&mut self) -> StorageResult<()> {
        self.write_header(REGULAR_HEADER_PAGE, self.regular.header())?;
        self.write_header(RECYCLE_HEADER_PAGE, self.recycle.header())?;
        self.write_header(RESERVE_HEADER_PAGE, self.reserve.header())?;
        Ok(())
    }

    fn write_header(&self, page_id: PageId, header: PageQueueHeader) -> StorageResult<()> {
        self.with_file_format(|ff| {
            let mut page = Page::new(page_id, PageType::Meta, VersionId(0), self.page_size);
            header.serialize(&mut page.data[..PageQueueHeader::SIZE])?;
            page.update_checksum();
            ff.write_page(&mut page)
        })
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut PageQueue {
        match kind {
            QueueKind::Regular => &mut self.regular,
            QueueKind::Recycle => &mut self.recycle,
            QueueKind::Reserve => &mut self.reserve,
        }
    }

    /// Tops up a queue's spare node from a page it doesn't otherwise need,
    /// so its next append never has to allocate mid-delete.
    fn ensure_spare(&mut self, kind: QueueKind) -> StorageResult<()> {
        if !self.queue_mut(kind).needs_spare_node() {
            return Ok(());
        }
        let spare = self.with_file_format(|ff| ff.extend(1))?;
        self.queue_mut(kind).provide_spare_node(spare);
        Ok(())
    }

    /// Allocate a page. Order: recycle queue, regular queue, then (only if
    /// compaction is active and `steal_reserve` is set) the reserve queue,
    /// then grow the backing array.
    pub fn allocate(&mut self, page_type: PageType, steal_reserve: bool) -> StorageResult<PageAllocation> {
        if let Some(id) = self.pop(QueueKind::Recycle)? {
            return Ok(PageAllocation { page_id: id, page_type, is_new: false, version: self.current_version });
        }
        if let Some(id) = self.pop(QueueKind::Regular)? {
            return Ok(PageAllocation { page_id: id, page_type, is_new: false, version: self.current_version });
        }
        if steal_reserve && self.compaction.is_some() {
            if let Some(id) = self.pop(QueueKind::Reserve)? {
                return Ok(PageAllocation { page_id: id, page_type, is_new: false, version: self.current_version });
            }
        }

        let effective_limit = PAGE_LIMIT_OVERRIDE.with(|c| c.get()).unwrap_or(self.page_limit);
        if let Some(limit) = effective_limit {
            let total = self.with_file_format(|ff| Ok(ff.total_pages()))?;
            if total >= limit {
                return Err(StorageError::CacheExhausted);
            }
        }
        let page_id = self.with_file_format(|ff| ff.extend(1))?;
        Ok(PageAllocation { page_id, page_type, is_new: true, version: self.current_version })
    }

    /// Free a page, routing it to the right queue. `in_truncation_zone`
    /// marks pages a pending compaction is trying to vacate: they go
    /// straight to `reserve` instead of being recycled for ordinary use.
    ///
    /// `allocation_free`, if set, forbids this call from growing the backing
    /// array to top up a queue's spare node: used when the caller holds
    /// locks that forbid reentrant I/O mid-delete. In that case a queue with
    /// no buffered spare node fails with [`StorageError::AllocationRequired`]
    /// instead of allocating one; the caller should pre-top-up the queue via
    /// [`PageManager::ensure_spare_node`] before entering the allocation-free
    /// section, then retry.
    pub fn free(&mut self, page_id: PageId, recycle: bool, in_truncation_zone: bool, allocation_free: bool) -> StorageResult<()> {
        let kind = if in_truncation_zone {
            QueueKind::Reserve
        } else if recycle {
            QueueKind::Recycle
        } else {
            QueueKind::Regular
        };
        self.push_with_retry(kind, page_id, allocation_free)
    }

    /// Tops up `kind`'s spare node outside of an allocation-free delete.
    /// Callers about to perform a batch of allocation-free frees should call
    /// this first so the retry path never needs to hit
    /// [`StorageError::AllocationRequired`].
    pub fn ensure_spare_node(&mut self, recycle: bool, in_truncation_zone: bool) -> StorageResult<()> {
        let kind = if in_truncation_zone {
            QueueKind::Reserve
        } else if recycle {
            QueueKind::Recycle
        } else {
            QueueKind::Regular
        };
        self.ensure_spare(kind)
    }

    fn push_with_retry(&mut self, kind: QueueKind, page_id: PageId, allocation_free: bool) -> StorageResult<()> {
        let page_size = self.page_size;
        let rejected = {
            let file_format = self.file_format.clone();
            let mut guard = file_format.lock().map_err(|_| StorageError::Corruption("file format lock poisoned".to_string()))?;
            self.queue_mut(kind).append(&mut guard, page_id, page_size)?
        };
        if let Some(id) = rejected {
            if allocation_free {
                return Err(StorageError::AllocationRequired);
            }
            self.ensure_spare(kind)?;
            let file_format = self.file_format.clone();
            let mut guard = file_format.lock().map_err(|_| StorageError::Corruption("file format lock poisoned".to_string()))?;
            let still_rejected = self.queue_mut(kind).append(&mut guard, id, page_size)?;
            if still_rejected.is_some() {
                return Err(StorageError::InvalidOperation("page queue append failed even after spare node replenishment".to_string()));
            }
        }
        Ok(())
    }

    fn pop(&mut self, kind: QueueKind) -> StorageResult<Option<PageId>> {
        let page_size = self.page_size;
        let file_format = self.file_format.clone();
        let mut guard = file_format.lock().map_err(|_| StorageError::Corruption("file format lock poisoned".to_string()))?;
        self.queue_mut(kind).remove(&mut guard, page_size)
    }

    pub fn free_pages_count(&self) -> u64 {
        self.regular.len() + self.recycle.len()
    }

    pub fn reserve_count(&self) -> u64 {
        self.reserve.len()
    }

    pub fn total_pages(&self) -> StorageResult<u64> {
        self.with_file_format(|ff| Ok(ff.total_pages()))
    }

    // --- compaction lifecycle -------------------------------------------------

    /// Begin a compaction targeting a final page count. Pages at or past
    /// `target_page_count` form the truncation zone.
    pub fn compaction_start(&mut self, target_page_count: u64) -> StorageResult<()> {
        if self.compaction.is_some() {
            return Err(StorageError::InvalidOperation("compaction already in progress".to_string()));
        }
        self.commit_lock.exclusive_acquire();
        self.compaction = Some(CompactionState { target_page_count });
        self.commit_lock.exclusive_release();
        Ok(())
    }

    /// Pull any already-free pages that fall inside the truncation zone out
    /// of `regular`/`recycle` and into `reserve`, so relocation only has to
    /// deal with pages that are still live.
    pub fn compaction_scan_free_list(&mut self) -> StorageResult<u64> {
        let target = self.compaction_target()?;
        let mut moved = 0u64;
        for kind in [QueueKind::Regular, QueueKind::Recycle] {
            let mut survivors = Vec::new();
            loop {
                match self.pop(kind)? {
                    Some(id) if id.0 >= target => {
                        self.push_with_retry(QueueKind::Reserve, id, false)?;
                        moved += 1;
                    }
                    Some(id) => survivors.push(id),
                    None => break,
                }
            }
            for id in survivors {
                self.push_with_retry(kind, id, false)?;
            }
        }
        self.flush_headers()?;
        Ok(moved)
    }

    /// Verifies nothing live remains at or past the target page count. The
    /// caller (the compaction manager) is responsible for having relocated
    /// every live page below the target before calling this.
    pub fn compaction_verify(&mut self) -> StorageResult<bool> {
        let target = self.compaction_target()?;
        let total = self.with_file_format(|ff| Ok(ff.total_pages()))?;
        if total <= target {
            return Ok(true);
        }
        Ok(self.reserve.len() >= total - target)
    }

    /// Truncates the backing array down to the compaction target. Requires
    /// [`compaction_verify`] to have returned `true`.
    pub fn compaction_end(&mut self) -> StorageResult<()> {
        let target = self.compaction_target()?;
        self.commit_lock.exclusive_acquire();
        let result = self.with_file_format(|ff| ff.truncate_to(target));
        self.commit_lock.exclusive_release();
        result?;
        self.compaction = None;
        Ok(())
    }

    /// Moves any reserve pages that ended up below the (now final) target
    /// back into ordinary circulation. Returns the count reclaimed.
    pub fn compaction_reclaim(&mut self) -> StorageResult<u64> {
        let mut reclaimed = 0u64;
        let mut leftover = Vec::new();
        loop {
            match self.pop(QueueKind::Reserve)? {
                Some(id) => leftover.push(id),
                None => break,
            }
        }
        for id in leftover {
            self.push_with_retry(QueueKind::Regular, id, false)?;
            reclaimed += 1;
        }
        self.flush_headers()?;
        Ok(reclaimed)
    }

    /// Convenience wrapper driving scan/verify/end in one call. Returns
    /// whether the truncation actually happened.
    pub fn truncate_pages(&mut self, target_page_count: u64) -> StorageResult<bool> {
        self.compaction_start(target_page_count)?;
        self.compaction_scan_free_list()?;
        if !self.compaction_verify()? {
            self.compaction = None;
            return Ok(false);
        }
        self.compaction_end()?;
        self.compaction_reclaim()?;
        Ok(true)
    }

    fn compaction_target(&self) -> StorageResult<u64> {
        self.compaction.as_ref().map(|c| c.target_page_count).ok_or_else(|| StorageError::InvalidOperation("no compaction in progress".to_string()))
    }
}

impl Initializable for PageManager {
    fn init(&mut self) -> StorageResult<()> {
        self.load_headers()?;
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::lib::StorageConfig;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn manager() -> PageManager {
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
        pm
    }

    #[test]
    fn allocate_grows_when_queues_empty() {
        let mut pm = manager();
        let a = pm.allocate(PageType::Data, false).unwrap();
        assert!(a.is_new);
        let b = pm.allocate(PageType::Data, false).unwrap();
        assert!(b.is_new);
        assert_ne!(a.page_id, b.page_id);
    }

    #[test]
    fn freed_page_is_reused_before_growing() {
        let mut pm = manager();
        let a = pm.allocate(PageType::Data, false).unwrap();
        pm.free(a.page_id, false, false, false).unwrap();
        let b = pm.allocate(PageType::Data, false).unwrap();
        assert!(!b.is_new);
        assert_eq!(a.page_id, b.page_id);
    }

    #[test]
    fn recycle_and_regular_queues_are_independent() {
        let mut pm = manager();
        let a = pm.allocate(PageType::Data, false).unwrap();
        let b = pm.allocate(PageType::Data, false).unwrap();
        pm.free(a.page_id, true, false, false).unwrap();
        pm.free(b.page_id, false, false, false).unwrap();
        assert_eq!(pm.free_pages_count(), 2);
    }

    #[test]
    fn reserve_pages_are_not_handed_out_without_compaction() {
        let mut pm = manager();
        let a = pm.allocate(PageType::Data, false).unwrap();
        pm.free(a.page_id, false, true, false).unwrap();
        assert_eq!(pm.reserve_count(), 1);
        let b = pm.allocate(PageType::Data, true).unwrap();
        // No compaction active, so reserve must not be touched.
        assert!(b.is_new);
        assert_eq!(pm.reserve_count(), 1);
    }

    #[test]
    fn truncate_pages_shrinks_when_zone_is_clear() {
        let mut pm = manager();
        let total_before = pm.with_file_format(|ff| Ok(ff.total_pages())).unwrap();
        let shrank = pm.truncate_pages(total_before).unwrap();
        assert!(shrank);
    }

    #[test]
    fn allocation_free_delete_fails_without_a_pretopped_spare_node() {
        let mut pm = manager();
        let a = pm.allocate(PageType::Data, false).unwrap();
        // A brand new queue starts with no spare node buffered, so the very
        // first allocation-free append must surface the retry-needed error
        // rather than silently growing the backing array.
        let result = pm.free(a.page_id, false, false, true);
        assert!(matches!(result, Err(StorageError::AllocationRequired)));
    }

    #[test]
    fn allocation_free_delete_succeeds_once_spare_node_is_preloaded() {
        let mut pm = manager();
        let a = pm.allocate(PageType::Data, false).unwrap();
        pm.ensure_spare_node(false, false).unwrap();
        pm.free(a.page_id, false, false, true).unwrap();
        assert_eq!(pm.free_pages_count(), 1);
    }

    #[test]
    fn page_limit_override_lifts_the_global_cap_for_this_thread() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().join("pages.db"),
            page_size: 1024,
            ..StorageConfig::default()
        };
        let mut file_format = FileFormat::new(config);
        file_format.init().unwrap();
        std::mem::forget(dir);
        let total = file_format.total_pages();
        let mut pm = PageManager::new(Arc::new(Mutex::new(file_format)), Arc::new(CommitLock::new()), 1024, Some(total));
        pm.init().unwrap();

        // Global limit is already at capacity; ordinary allocation fails.
        assert!(matches!(pm.allocate(PageType::Data, false), Err(StorageError::CacheExhausted)));

        // Bookkeeping allocations on this thread run under an override.
        let _override = PageLimitOverride::install(None);
        let allocation = pm.allocate(PageType::Data, false).unwrap();
        assert!(allocation.is_new);
    }
}
