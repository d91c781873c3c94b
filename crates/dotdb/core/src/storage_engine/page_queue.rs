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

//! Intrusive linked list of free page ids.
//!
//! A `PageQueue` tracks free pages across two tiers: a small in-memory LIFO
//! "hot" buffer (the spill cache) that lets the common allocate/free path
//! avoid touching disk at all, and an on-disk singly-linked chain of queue
//! node pages that holds everything the hot buffer has overflowed. Node
//! pages are themselves pulled from (and returned to) the same queue they
//! belong to, so steady-state operation is self-sustaining once primed with
//! a single spare node.

use std::collections::VecDeque;

use crate::storage_engine::file_format::{FileFormat, Page, PageId, PageType};
use crate::storage_engine::lib::{StorageError, StorageResult, VersionId};

/// On-disk persisted form of a queue's head/tail bookkeeping. 44 bytes,
/// matching the page-manager header layout in spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQueueHeader {
    pub head_node: Option<PageId>,
    pub head_offset: u32,
    pub tail_node: Option<PageId>,
    pub tail_count: u32,
    pub total_count: u64,
}

impl PageQueueHeader {
    pub const SIZE: usize = 44;

    fn encode_id(id: Option<PageId>) -> u64 {
        // 0 is never a valid queue-node id (page 0 is a reserved header
        // slot), so it doubles as the "none" sentinel.
        id.map(|p| p.0).unwrap_or(0)
    }

    fn decode_id(raw: u64) -> Option<PageId> {
        if raw == 0 { None } else { Some(PageId(raw)) }
    }

    pub fn serialize(&self, buf: &mut [u8]) -> StorageResult<()> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::InvalidOperation("buffer too small for PageQueueHeader".to_string()));
        }
        buf[0..8].copy_from_slice(&Self::encode_id(self.head_node).to_le_bytes());
        buf[8..12].copy_from_slice(&self.head_offset.to_le_bytes());
        buf[12..20].copy_from_slice(&Self::encode_id(self.tail_node).to_le_bytes());
        buf[20..24].copy_from_slice(&self.tail_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.total_count.to_le_bytes());
        buf[32..44].fill(0);
        Ok(())
    }

    pub fn deserialize(buf: &[u8]) -> StorageResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::InvalidOperation("buffer too small for PageQueueHeader".to_string()));
        }
        let head_raw = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let head_offset = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let tail_raw = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let tail_count = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let total_count = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        Ok(Self {
            head_node: Self::decode_id(head_raw),
            head_offset,
            tail_node: Self::decode_id(tail_raw),
            tail_count,
            total_count,
        })
    }
}

impl Default for PageQueueHeader {
    fn default() -> Self {
        Self {
            head_node: None,
            head_offset: 0,
            tail_node: None,
            tail_count: 0,
            total_count: 0,
        }
    }
}

/// Header stored at the front of every queue node page: `{next-lower node
/// id}` followed by a packed array of `PageId` entries.
struct NodeLayout {
    next: PageId,
}

const NODE_HEADER_LEN: usize = 8;
const NO_NEXT: u64 = 0;

impl NodeLayout {
    fn read(page: &Page) -> (Self, Vec<PageId>, usize) {
        let next = PageId(u64::from_le_bytes(page.data[0..8].try_into().unwrap_or([0; 8])));
        let used = (page.header.data_size as usize).saturating_sub(NODE_HEADER_LEN) / 8;
        let mut entries = Vec::with_capacity(used);
        for i in 0..used {
            let off = NODE_HEADER_LEN + i * 8;
            entries.push(PageId(u64::from_le_bytes(page.data[off..off + 8].try_into().unwrap())));
        }
        (Self { next }, entries, used)
    }

    fn write(page: &mut Page, next: PageId, entries: &[PageId]) {
        page.data[0..8].copy_from_slice(&next.0.to_le_bytes());
        for (i, id) in entries.iter().enumerate() {
            let off = NODE_HEADER_LEN + i * 8;
            page.data[off..off + 8].copy_from_slice(&id.0.to_le_bytes());
        }
        page.header.data_size = (NODE_HEADER_LEN + entries.len() * 8) as u16;
    }
}

/// A free-page queue: hot in-memory buffer over an on-disk node chain.
pub struct PageQueue {
    hot: VecDeque<PageId>,
    hot_capacity: usize,
    spare_node: Option<PageId>,
    header: PageQueueHeader,
}

impl PageQueue {
    pub fn new(hot_capacity: usize) -> Self {
        Self {
            hot: VecDeque::new(),
            hot_capacity: hot_capacity.max(1),
            spare_node: None,
            header: PageQueueHeader::default(),
        }
    }

    pub fn from_header(header: PageQueueHeader, hot_capacity: usize) -> Self {
        Self {
            hot: VecDeque::new(),
            hot_capacity: hot_capacity.max(1),
            spare_node: None,
            header,
        }
    }

    pub fn header(&self) -> PageQueueHeader {
        self.header
    }

    pub fn len(&self) -> u64 {
        self.header.total_count + self.hot.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand the queue a page it may use as its next on-disk node instead of
    /// requesting one from the allocator mid-delete. Mirrors spec.md's
    /// "spill page" held in reserve.
    pub fn provide_spare_node(&mut self, page_id: PageId) {
        self.spare_node = Some(page_id);
    }

    pub fn take_spare_node(&mut self) -> Option<PageId> {
        self.spare_node.take()
    }

    pub fn needs_spare_node(&self) -> bool {
        self.spare_node.is_none()
    }

    /// Append a freed page. Never allocates: if the hot buffer overflows and
    /// no spare node is available, the overflowed id is returned to the
    /// caller so it can be retried once a spare has been supplied (this is
    /// the "allocation-free" delete path).
    pub fn append(&mut self, file_format: &mut FileFormat, page_id: PageId, page_size: usize) -> StorageResult<Option<PageId>> {
        self.hot.push_back(page_id);
        self.header.total_count += 1;
        if self.hot.len() <= self.hot_capacity {
            return Ok(None);
        }
        // Overflow: move the oldest hot entries onto the on-disk chain.
        let overflow = self.hot.pop_front().expect("just checked len > capacity");
        match self.spill_one(file_format, overflow, page_size) {
            Ok(()) => Ok(None),
            Err(StorageError::CacheExhausted) => {
                // No spare node; put it back and surface the page so the
                // caller can retry after replenishing the spare.
                self.hot.push_front(overflow);
                Ok(Some(overflow))
            }
            Err(e) => Err(e),
        }
    }

    fn spill_one(&mut self, file_format: &mut FileFormat, page_id: PageId, page_size: usize) -> StorageResult<()> {
        let capacity = (page_size - NODE_HEADER_LEN) / 8;
        let need_new_node = match self.header.tail_node {
            None => true,
            Some(_) => self.header.tail_count as usize >= capacity,
        };

        if need_new_node {
            let new_tail = self.spare_node.take().ok_or(StorageError::CacheExhausted)?;
            // The new node is the newest and has nothing after it yet.
            let mut page = Page::new(new_tail, PageType::Meta, VersionId(0), page_size);
            NodeLayout::write(&mut page, PageId(NO_NEXT), &[page_id]);
            page.update_checksum();
            file_format.write_page(&mut page)?;

            // Link the previous tail forward to this node so a head-to-tail
            // walk during removal can still reach it.
            if let Some(prev_tail) = self.header.tail_node {
                let mut prev_page = file_format.read_page(prev_tail)?;
                let (layout, entries, _) = NodeLayout::read(&prev_page);
                debug_assert_eq!(layout.next.0, NO_NEXT, "tail node must not already have a successor");
                NodeLayout::write(&mut prev_page, new_tail, &entries);
                prev_page.update_checksum();
                file_format.write_page(&mut prev_page)?;
            } else {
                self.header.head_node = Some(new_tail);
                self.header.head_offset = 0;
            }

            self.header.tail_node = Some(new_tail);
            self.header.tail_count = 1;
            return Ok(());
        }

        let tail_id = self.header.tail_node.unwrap();
        let mut page = file_format.read_page(tail_id)?;
        let (layout, mut entries, _) = NodeLayout::read(&page);
        entries.push(page_id);
        NodeLayout::write(&mut page, layout.next, &entries);
        page.update_checksum();
        file_format.write_page(&mut page)?;
        self.header.tail_count += 1;
        Ok(())
    }

    /// Pop the next free page, preferring the hot buffer (no I/O) before
    /// falling back to the on-disk chain. A node page that is fully drained
    /// is itself returned as the freed page (it becomes the next spare).
    pub fn remove(&mut self, file_format: &mut FileFormat, page_size: usize) -> StorageResult<Option<PageId>> {
        if let Some(id) = self.hot.pop_back() {
            self.header.total_count = self.header.total_count.saturating_sub(1);
            return Ok(Some(id));
        }
        let head_id = match self.header.head_node {
            Some(id) => id,
            None => return Ok(None),
        };
        let mut page = file_format.read_page(head_id)?;
        let (layout, entries, _) = NodeLayout::read(&page);
        let offset = self.header.head_offset as usize;
        if offset >= entries.len() {
            // Node exhausted: advance to the next node and recycle this one.
            self.header.head_node = if layout.next.0 == NO_NEXT { None } else { Some(layout.next) };
            self.header.head_offset = 0;
            if self.header.head_node.is_none() {
                self.header.tail_node = None;
                self.header.tail_count = 0;
            }
            if self.spare_node.is_none() {
                self.spare_node = Some(head_id);
                return self.remove(file_format, page_size);
            }
            return Ok(Some(head_id));
        }
        let id = entries[offset];
        self.header.head_offset += 1;
        self.header.total_count = self.header.total_count.saturating_sub(1);
        let _ = page; // header already captured above
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::lib::{Initializable, StorageConfig};
    use tempfile::tempdir;

    fn file_format(page_size: usize) -> FileFormat {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().join("queue.db"),
            page_size,
            ..StorageConfig::default()
        };
        let mut ff = FileFormat::new(config);
        ff.init().unwrap();
        std::mem::forget(dir); // keep temp dir alive for the test's duration
        ff
    }

    #[test]
    fn hot_buffer_round_trips_without_disk() {
        let mut ff = file_format(512);
        let mut q = PageQueue::new(8);
        q.append(&mut ff, PageId(10), 512).unwrap();
        q.append(&mut ff, PageId(11), 512).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.remove(&mut ff, 512).unwrap(), Some(PageId(11)));
        assert_eq!(q.remove(&mut ff, 512).unwrap(), Some(PageId(10)));
        assert_eq!(q.remove(&mut ff, 512).unwrap(), None);
    }

    #[test]
    fn overflow_without_spare_is_rejected_not_lost() {
        let mut ff = file_format(512);
        let mut q = PageQueue::new(1);
        q.append(&mut ff, PageId(1), 512).unwrap();
        let rejected = q.append(&mut ff, PageId(2), 512).unwrap();
        assert!(rejected.is_some());
        // The queue still reports both pages as tracked (one pending retry).
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn overflow_spills_to_disk_once_spare_provided() {
        let mut ff = file_format(512);
        let node = ff.extend(1).unwrap();
        let mut q = PageQueue::new(1);
        q.provide_spare_node(node);
        q.append(&mut ff, PageId(1), 512).unwrap();
        let rejected = q.append(&mut ff, PageId(2), 512).unwrap();
        assert!(rejected.is_none());
        assert_eq!(q.len(), 2);
    }
}
