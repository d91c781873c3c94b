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

//! Per-transaction undo log: a stack of compensating actions recorded as a
//! transaction modifies pages, consumed in reverse on rollback and
//! translated to a no-op on commit.
//!
//! Small transactions never touch disk: entries accumulate in an inline
//! `Vec<u8>` buffer. Once that buffer grows past `undo_page_threshold` the
//! log is promoted to a page-backed singly-linked chain, the same way
//! `page_queue` spills its hot buffer. Every live log is registered with
//! the process-wide master undo log so a checkpoint can enumerate open
//! transactions without walking the buffer pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::storage_engine::commit_lock::CommitLock;
use crate::storage_engine::file_format::{FileFormat, Page, PageId, PageType};
use crate::storage_engine::lib::{StorageError, StorageResult, VersionId};
use dotdb_common::TransactionId;

/// Tags identifying the compensating action an undo entry records. Values
/// 1-12 are the rollback actions; 13-14 are the commit-time translations
/// applied to copy/reference entries so a recovered log can tell a
/// committed transaction's leftovers from an aborted one's; 15-16 are
/// cursor-context markers that carry no rollback action of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UndoOpcode {
    /// Undo a row insert: delete the row.
    Uninsert = 1,
    /// Undo a row update: restore the previous image.
    Unupdate = 2,
    /// Undo a row delete: restore the row.
    Undelete = 3,
    /// Undo a delete of a row that had been fragmented across pages.
    UndeleteFragmented = 4,
    /// Undo creation of a page or index.
    Uncreate = 5,
    /// Undo a backing-array extension: truncate it back off.
    Unextend = 6,
    /// Undo a raw page allocation: return it to its free queue.
    Unalloc = 7,
    /// Undo an in-place page write: restore the prior bytes.
    Unwrite = 8,
    /// Caller-supplied compensating action, dispatched by an integer key
    /// the caller registered ahead of time.
    Custom = 9,
    /// Marks that the transaction has entered its prepare phase.
    Prepare = 10,
    /// Re-acquire an exclusive row lock held at the time of a crash.
    LockExclusive = 11,
    /// Re-acquire an upgradable row lock held at the time of a crash.
    LockUpgradable = 12,
    /// Commit-time translation of a raw copy entry: safe to discard.
    LogCopyCommitted = 13,
    /// Commit-time translation of a raw reference entry: safe to discard.
    LogRefCommitted = 14,
    /// Marks that subsequent entries apply to a different index than the
    /// one the previous push targeted. Payload is the new index-id.
    IndexSwitch = 15,
    /// Marks that subsequent value-accessor entries (`Uncreate`, `Unextend`,
    /// `Unalloc`, `Unwrite`) apply to a different key than the previous
    /// push. Payload is the key in its fully-expanded ("LK") form.
    ActiveKey = 16,
}

impl UndoOpcode {
    fn from_u8(v: u8) -> StorageResult<Self> {
        use UndoOpcode::*;
        Ok(match v {
            1 => Uninsert,
            2 => Unupdate,
            3 => Undelete,
            4 => UndeleteFragmented,
            5 => Uncreate,
            6 => Unextend,
            7 => Unalloc,
            8 => Unwrite,
            9 => Custom,
            10 => Prepare,
            11 => LockExclusive,
            12 => LockUpgradable,
            13 => LogCopyCommitted,
            14 => LogRefCommitted,
            15 => IndexSwitch,
            16 => ActiveKey,
            other => return Err(StorageError::Corruption(format!("unknown undo opcode {other}"))),
        })
    }

    /// The entry this opcode becomes once its transaction commits. Copy and
    /// reference entries carry no useful rollback information after commit
    /// and are rewritten in place so a crash between commit and checkpoint
    /// doesn't replay them.
    fn commit_translation(self) -> Option<UndoOpcode> {
        match self {
            UndoOpcode::Uninsert | UndoOpcode::Unupdate | UndoOpcode::Undelete | UndoOpcode::UndeleteFragmented => Some(UndoOpcode::LogCopyCommitted),
            UndoOpcode::Unalloc | UndoOpcode::Unextend => Some(UndoOpcode::LogRefCommitted),
            _ => None,
        }
    }
}

/// A single decoded entry: opcode plus its payload bytes.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub opcode: UndoOpcode,
    pub payload: Vec<u8>,
}

fn encode_entry(opcode: UndoOpcode, payload: &[u8], out: &mut Vec<u8>) {
    out.push(opcode as u8);
    dotdb_common::write_varint_u64(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

/// High bit on a key's first byte marks it as fragmented: the database
/// layer that assigns fragment ids is outside this crate, so expansion here
/// is a stand-in that just clears the marker bit rather than resolving a
/// real fragment table.
const FRAGMENT_MARKER: u8 = 0x80;

fn is_fragmented_key(key: &[u8]) -> bool {
    key.first().is_some_and(|b| b & FRAGMENT_MARKER != 0)
}

fn expand_fragmented_key(key: &[u8]) -> Vec<u8> {
    let mut expanded = key.to_vec();
    if let Some(first) = expanded.first_mut() {
        *first &= !FRAGMENT_MARKER;
    }
    expanded
}

fn is_value_accessor_opcode(opcode: UndoOpcode) -> bool {
    matches!(opcode, UndoOpcode::Uncreate | UndoOpcode::Unextend | UndoOpcode::Unalloc | UndoOpcode::Unwrite)
}

fn decode_entry(buf: &[u8]) -> StorageResult<(UndoEntry, usize)> {
    if buf.is_empty() {
        return Err(StorageError::Corruption("undo log entry truncated".to_string()));
    }
    let opcode = UndoOpcode::from_u8(buf[0])?;
    let (len, len_size) = dotdb_common::read_varint_u64(&buf[1..]).ok_or_else(|| StorageError::Corruption("undo log entry length truncated".to_string()))?;
    let start = 1 + len_size;
    let end = start + len as usize;
    if buf.len() < end {
        return Err(StorageError::Corruption("undo log entry payload truncated".to_string()));
    }
    Ok((UndoEntry { opcode, payload: buf[start..end].to_vec() }, end))
}

/// Position within an undo log at the moment a nested scope was entered,
/// used to roll back or commit exactly the entries recorded since.
#[derive(Debug, Clone)]
struct ScopeMark {
    inline_len: usize,
    chain_tail: Option<PageId>,
    chain_tail_len: usize,
    chain_entry_count: u64,
    active_index: Option<dotdb_common::IndexId>,
    active_key: Option<Vec<u8>>,
}

const CHAIN_NODE_HEADER: usize = 1 + 1 + 2 + 8; // type, reserved, count(unused), next-page-id

/// State once the inline buffer has overflowed onto a page chain. Pages are
/// appended to the tail; the head is the oldest (bottom of the stack).
struct ChainState {
    head: PageId,
    tail: PageId,
    tail_buf: Vec<u8>,
    entry_count: u64,
}

/// Per-transaction undo log.
pub struct UndoLog {
    transaction: TransactionId,
    threshold: usize,
    inline: Vec<u8>,
    chain: Option<ChainState>,
    scopes: Vec<ScopeMark>,
    has_trash: bool,
    has_prepare: bool,
    /// Index-id the most recent `push_with_context` call targeted; an
    /// `IndexSwitch` marker is pushed ahead of the next push that targets a
    /// different one.
    active_index: Option<dotdb_common::IndexId>,
    /// Key (in expanded "LK" form) the most recent value-accessor push
    /// targeted; an `ActiveKey` marker is pushed ahead of the next one that
    /// differs.
    active_key: Option<Vec<u8>>,
}

impl UndoLog {
    pub fn new(transaction: TransactionId, undo_page_threshold: usize) -> Self {
        Self {
            transaction,
            threshold: undo_page_threshold,
            inline: Vec::new(),
            chain: None,
            scopes: Vec::new(),
            has_trash: false,
            has_prepare: false,
            active_index: None,
            active_key: None,
        }
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn has_trash(&self) -> bool {
        self.has_trash
    }

    pub fn has_prepare(&self) -> bool {
        self.has_prepare
    }

    pub fn entry_count(&self) -> u64 {
        self.chain.as_ref().map(|c| c.entry_count).unwrap_or(0) + self.inline_entry_count()
    }

    /// The head page of the on-disk spill chain, if this log has been
    /// promoted past its inline buffer. A checkpoint descriptor records
    /// this so recovery knows where to start walking the chain.
    pub fn chain_head(&self) -> Option<PageId> {
        self.chain.as_ref().map(|c| c.head)
    }

    /// Raw inline bytes, for a checkpoint descriptor that hasn't promoted
    /// to a page chain (LOG_COPY). Empty once promoted.
    pub fn inline_bytes(&self) -> &[u8] {
        &self.inline
    }

    /// Read every entry of an on-disk spill chain from `head` to its tail,
    /// oldest page first, for a recovered log that was checkpointed as a
    /// LOG_REF descriptor.
    pub fn read_chain(file_format: &mut FileFormat, head: PageId) -> StorageResult<Vec<UndoEntry>> {
        let mut out = Vec::new();
        let mut current = head;
        loop {
            let page = file_format.read_page(current)?;
            let (next, body, _len) = Self::read_node(&page);
            out.extend(Self::decode_all(&body)?);
            if next.0 == 0 {
                break;
            }
            current = next;
        }
        Ok(out)
    }

    /// Decode a raw inline buffer (a LOG_COPY descriptor's payload) into
    /// its entries.
    pub fn decode_inline(buf: &[u8]) -> StorageResult<Vec<UndoEntry>> {
        Self::decode_all(buf)
    }

    fn inline_entry_count(&self) -> u64 {
        // Only meaningful as "some entries present"; exact inline count is
        // not tracked separately since rollback walks bytes, not a counter.
        if self.inline.is_empty() { 0 } else { 1 }
    }

    /// Record a compensating action. May promote the log from inline to
    /// page-backed storage if this push crosses `undo_page_threshold`.
    pub fn push(&mut self, file_format: &mut FileFormat, page_size: usize, opcode: UndoOpcode, payload: &[u8]) -> StorageResult<()> {
        if matches!(opcode, UndoOpcode::Uninsert | UndoOpcode::Unupdate | UndoOpcode::Undelete | UndoOpcode::UndeleteFragmented) {
            self.has_trash = true;
        }
        if matches!(opcode, UndoOpcode::Prepare) {
            self.has_prepare = true;
        }

        if let Some(chain) = &mut self.chain {
            encode_entry(opcode, payload, &mut chain.tail_buf);
            chain.entry_count += 1;
            Self::flush_chain_tail(file_format, page_size, chain)?;
            return Ok(());
        }

        encode_entry(opcode, payload, &mut self.inline);
        if self.inline.len() > self.threshold {
            self.promote(file_format, page_size)?;
        }
        Ok(())
    }

    /// Record a compensating action for a cursor positioned at
    /// `(index_id, key)`. Pushes an `IndexSwitch` marker ahead of it if
    /// `index_id` differs from the log's active index, and (for the
    /// value-accessor opcodes `Uncreate`/`Unextend`/`Unalloc`/`Unwrite`) an
    /// `ActiveKey` marker if `key` differs from the active key. A fragmented
    /// key (high bit set on its first byte) is expanded to full form before
    /// it is recorded, so recovery never has to resolve a fragment.
    pub fn push_with_context(&mut self, file_format: &mut FileFormat, page_size: usize, index_id: dotdb_common::IndexId, key: &[u8], opcode: UndoOpcode, payload: &[u8]) -> StorageResult<()> {
        if self.active_index != Some(index_id) {
            self.push(file_format, page_size, UndoOpcode::IndexSwitch, &index_id.0.to_le_bytes())?;
            self.active_index = Some(index_id);
        }

        if is_value_accessor_opcode(opcode) {
            let expanded_key = if is_fragmented_key(key) { expand_fragmented_key(key) } else { key.to_vec() };
            if self.active_key.as_deref() != Some(expanded_key.as_slice()) {
                self.push(file_format, page_size, UndoOpcode::ActiveKey, &expanded_key)?;
                self.active_key = Some(expanded_key);
            }
        }

        self.push(file_format, page_size, opcode, payload)
    }

    fn promote(&mut self, file_format: &mut FileFormat, page_size: usize) -> StorageResult<()> {
        let page_id = file_format.extend(1)?;
        let mut chain = ChainState {
            head: page_id,
            tail: page_id,
            tail_buf: std::mem::take(&mut self.inline),
            entry_count: 1,
        };
        Self::flush_chain_tail(file_format, page_size, &mut chain)?;
        self.chain = Some(chain);
        Ok(())
    }

    fn flush_chain_tail(file_format: &mut FileFormat, page_size: usize, chain: &mut ChainState) -> StorageResult<()> {
        let capacity = page_size - CHAIN_NODE_HEADER;
        if chain.tail_buf.len() <= capacity {
            let mut page = Page::new(chain.tail, PageType::Meta, VersionId(0), page_size);
            Self::write_node(&mut page, PageId(0), &chain.tail_buf);
            page.update_checksum();
            file_format.write_page(&mut page)?;
            return Ok(());
        }
        // Tail page is full; split the overflow into a fresh page and link
        // the old tail forward to it before writing either one down.
        let overflow: Vec<u8> = chain.tail_buf.split_off(capacity);
        let new_tail = file_format.extend(1)?;

        let mut old_tail = Page::new(chain.tail, PageType::Meta, VersionId(0), page_size);
        Self::write_node(&mut old_tail, new_tail, &chain.tail_buf);
        old_tail.update_checksum();
        file_format.write_page(&mut old_tail)?;

        chain.tail = new_tail;
        chain.tail_buf = overflow;
        let mut page = Page::new(chain.tail, PageType::Meta, VersionId(0), page_size);
        Self::write_node(&mut page, PageId(0), &chain.tail_buf);
        page.update_checksum();
        file_format.write_page(&mut page)?;
        Ok(())
    }

    fn write_node(page: &mut Page, next: PageId, body: &[u8]) {
        page.data[0] = PageType::Meta as u8;
        page.data[1] = 0;
        page.data[2..4].copy_from_slice(&0u16.to_le_bytes());
        page.data[4..12].copy_from_slice(&next.0.to_le_bytes());
        page.data[CHAIN_NODE_HEADER..CHAIN_NODE_HEADER + body.len()].copy_from_slice(body);
        page.header.data_size = (CHAIN_NODE_HEADER + body.len()) as u16;
    }

    /// Enter a new nested scope (savepoint). Returns a mark to later commit
    /// or roll back to.
    pub fn scope_enter(&mut self) -> usize {
        let mark = ScopeMark {
            inline_len: self.inline.len(),
            chain_tail: self.chain.as_ref().map(|c| c.tail),
            chain_tail_len: self.chain.as_ref().map(|c| c.tail_buf.len()).unwrap_or(0),
            chain_entry_count: self.chain.as_ref().map(|c| c.entry_count).unwrap_or(0),
            active_index: self.active_index,
            active_key: self.active_key.clone(),
        };
        self.scopes.push(mark);
        self.scopes.len() - 1
    }

    /// Commit a scope: entries recorded since it was entered are folded
    /// into the parent scope instead of being discarded.
    pub fn scope_commit(&mut self, mark: UndoScope) -> StorageResult<()> {
        if mark.0 >= self.scopes.len() {
            return Err(StorageError::InvalidOperation("unknown undo scope".to_string()));
        }
        self.scopes.truncate(mark.0);
        Ok(())
    }

    /// Roll back to a scope: every entry recorded since it was entered is
    /// replayed in reverse order through `dispatch`, then discarded.
    pub fn scope_rollback(&mut self, mark: UndoScope, file_format: &mut FileFormat, page_size: usize, dispatch: &UndoDispatchTable) -> StorageResult<()> {
        if mark.0 >= self.scopes.len() {
            return Err(StorageError::InvalidOperation("unknown undo scope".to_string()));
        }
        let since = self.scopes[mark.0].clone();

        // Replay and drop chain entries recorded after the mark, newest
        // page first.
        while let Some(chain) = &self.chain {
            if Some(chain.tail) == since.chain_tail {
                break;
            }
            let entries = Self::decode_all(&self.chain.as_ref().unwrap().tail_buf)?;
            for entry in entries.into_iter().rev() {
                dispatch.invoke(&entry)?;
            }
            let prev_head = self.chain.as_ref().unwrap().head;
            if prev_head == self.chain.as_ref().unwrap().tail {
                self.chain = None;
                break;
            }
            // Walk to the previous node by re-reading from head is O(n);
            // acceptable since rollbacks are not the hot path.
            let prev = Self::find_predecessor(file_format, prev_head, self.chain.as_ref().unwrap().tail)?;
            let prev_page = file_format.read_page(prev)?;
            let (_, body, _) = Self::read_node(&prev_page);
            self.chain = Some(ChainState {
                head: prev_head,
                tail: prev,
                tail_buf: body,
                entry_count: self.chain.as_ref().unwrap().entry_count,
            });
        }

        if let Some(chain) = &mut self.chain {
            if Some(chain.tail) == since.chain_tail && chain.tail_buf.len() > since.chain_tail_len {
                let tail_rollback = chain.tail_buf.split_off(since.chain_tail_len);
                for entry in Self::decode_all(&tail_rollback)?.into_iter().rev() {
                    dispatch.invoke(&entry)?;
                }
                chain.entry_count = since.chain_entry_count;
            }
        }

        if self.chain.is_none() && self.inline.len() > since.inline_len {
            let rollback_bytes = self.inline.split_off(since.inline_len);
            for entry in Self::decode_all(&rollback_bytes)?.into_iter().rev() {
                dispatch.invoke(&entry)?;
            }
        }

        self.active_index = since.active_index;
        self.active_key = since.active_key;
        self.scopes.truncate(mark.0);
        Ok(())
    }

    fn find_predecessor(file_format: &mut FileFormat, from: PageId, target: PageId) -> StorageResult<PageId> {
        let mut current = from;
        loop {
            let page = file_format.read_page(current)?;
            let (next, _, _) = Self::read_node(&page);
            if next == target {
                return Ok(current);
            }
            if next.0 == 0 {
                return Err(StorageError::Corruption("undo log chain broken during rollback".to_string()));
            }
            current = next;
        }
    }

    fn read_node(page: &Page) -> (PageId, Vec<u8>, usize) {
        let next = PageId(u64::from_le_bytes(page.data[4..12].try_into().unwrap()));
        let len = (page.header.data_size as usize).saturating_sub(CHAIN_NODE_HEADER);
        let body = page.data[CHAIN_NODE_HEADER..CHAIN_NODE_HEADER + len].to_vec();
        (next, body, len)
    }

    fn decode_all(buf: &[u8]) -> StorageResult<Vec<UndoEntry>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            let (entry, consumed) = decode_entry(&buf[pos..])?;
            pos += consumed;
            out.push(entry);
        }
        Ok(out)
    }

    /// Called on commit: copy/reference entries have their opcode rewritten
    /// in place so a crash before the next checkpoint doesn't replay them.
    pub fn translate_for_commit(&mut self, file_format: &mut FileFormat) -> StorageResult<()> {
        if let Some(chain) = &self.chain {
            let mut current = chain.head;
            loop {
                let mut page = file_format.read_page(current)?;
                let (next, body, _len) = Self::read_node(&page);
                let translated = Self::translate_bytes(&body)?;
                Self::write_node(&mut page, next, &translated);
                page.update_checksum();
                file_format.write_page(&mut page)?;
                if current == chain.tail {
                    break;
                }
                current = next;
            }
        }
        let translated = Self::translate_bytes(&self.inline)?;
        self.inline = translated;
        self.has_trash = false;
        Ok(())
    }

    fn translate_bytes(buf: &[u8]) -> StorageResult<Vec<u8>> {
        let mut out = Vec::with_capacity(buf.len());
        let mut pos = 0;
        while pos < buf.len() {
            let (entry, consumed) = decode_entry(&buf[pos..])?;
            pos += consumed;
            let opcode = entry.opcode.commit_translation().unwrap_or(entry.opcode);
            encode_entry(opcode, &entry.payload, &mut out);
        }
        Ok(out)
    }
}

/// Payload codec for [`UndoOpcode::LockExclusive`] / [`UndoOpcode::LockUpgradable`]:
/// identifies the row lock a recovered transaction held at crash time.
pub fn encode_lock_payload(index_id: dotdb_common::IndexId, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.len());
    out.extend_from_slice(&index_id.0.to_le_bytes());
    out.extend_from_slice(key);
    out
}

pub fn decode_lock_payload(payload: &[u8]) -> StorageResult<(dotdb_common::IndexId, &[u8])> {
    if payload.len() < 8 {
        return Err(StorageError::Corruption("lock undo payload truncated".to_string()));
    }
    let index_id = dotdb_common::IndexId(u64::from_le_bytes(payload[0..8].try_into().unwrap()));
    Ok((index_id, &payload[8..]))
}

/// Payload codec for the four delete-class opcodes (`Uninsert`, `Unupdate`,
/// `Undelete`, `UndeleteFragmented`): carries the `(index-id, page-position)`
/// pair a committed transaction's `LogCopyCommitted` translation still needs
/// so recovery-cleanup can physically remove the ghost row.
pub fn encode_ghost_payload(index_id: dotdb_common::IndexId, page_position: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + key.len());
    out.extend_from_slice(&index_id.0.to_le_bytes());
    out.extend_from_slice(&page_position.to_le_bytes());
    out.extend_from_slice(key);
    out
}

pub fn decode_ghost_payload(payload: &[u8]) -> StorageResult<(dotdb_common::IndexId, u64, &[u8])> {
    if payload.len() < 16 {
        return Err(StorageError::Corruption("ghost undo payload truncated".to_string()));
    }
    let index_id = dotdb_common::IndexId(u64::from_le_bytes(payload[0..8].try_into().unwrap()));
    let page_position = u64::from_le_bytes(payload[8..16].try_into().unwrap());
    Ok((index_id, page_position, &payload[16..]))
}

/// A handle identifying a previously entered scope, returned by
/// [`UndoLog::scope_enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoScope(pub usize);

impl From<usize> for UndoScope {
    fn from(v: usize) -> Self {
        UndoScope(v)
    }
}

/// Looks up the compensating action for an opcode during rollback. Custom
/// entries are dispatched by the first payload byte, which callers use as
/// their own action key.
#[derive(Default)]
pub struct UndoDispatchTable {
    actions: std::collections::HashMap<u8, Box<dyn Fn(&[u8]) -> StorageResult<()> + Send + Sync>>,
    custom: std::collections::HashMap<u8, Box<dyn Fn(&[u8]) -> StorageResult<()> + Send + Sync>>,
}

impl UndoDispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, opcode: UndoOpcode, action: impl Fn(&[u8]) -> StorageResult<()> + Send + Sync + 'static) {
        self.actions.insert(opcode as u8, Box::new(action));
    }

    pub fn register_custom(&mut self, key: u8, action: impl Fn(&[u8]) -> StorageResult<()> + Send + Sync + 'static) {
        self.custom.insert(key, Box::new(action));
    }

    /// Run the compensating action registered for `entry`'s opcode, if any.
    /// Exposed beyond rollback so recovery can replay entries pulled
    /// straight off a checkpointed chain without going through a live
    /// [`UndoLog`].
    pub fn invoke(&self, entry: &UndoEntry) -> StorageResult<()> {
        if entry.opcode == UndoOpcode::Custom {
            let key = *entry.payload.first().ok_or_else(|| StorageError::Corruption("custom undo entry missing key byte".to_string()))?;
            if let Some(action) = self.custom.get(&key) {
                return action(&entry.payload[1..]);
            }
            return Err(StorageError::InvalidOperation(format!("no custom undo action registered for key {key}")));
        }
        match self.actions.get(&(entry.opcode as u8)) {
            Some(action) => action(&entry.payload),
            // Commit-translated entries and Prepare markers carry no
            // rollback behavior by design.
            None => Ok(()),
        }
    }
}

/// Process-wide registry of live undo logs, guarded by the commit lock so a
/// checkpoint can snapshot a consistent view of open transactions.
pub struct MasterUndoLog {
    lock: CommitLock,
    active: Mutex<Vec<Arc<Mutex<UndoLog>>>>,
    next_sequence: AtomicU64,
}

static MASTER: OnceLock<MasterUndoLog> = OnceLock::new();

impl MasterUndoLog {
    pub fn global() -> &'static MasterUndoLog {
        MASTER.get_or_init(|| MasterUndoLog {
            lock: CommitLock::new(),
            active: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
        })
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, log: Arc<Mutex<UndoLog>>) {
        self.lock.shared_acquire_unchecked();
        self.active.lock().push(log);
        self.lock.shared_release();
    }

    pub fn unregister(&self, transaction: TransactionId) {
        self.lock.shared_acquire_unchecked();
        self.active.lock().retain(|l| l.lock().transaction() != transaction);
        self.lock.shared_release();
    }

    /// Snapshot every log still open, for the checkpoint writer. Takes the
    /// lock's exclusive mode so the set of open transactions can't change
    /// mid-snapshot.
    pub fn snapshot(&self) -> Vec<Arc<Mutex<UndoLog>>> {
        self.lock.exclusive_acquire();
        let snapshot = self.active.lock().clone();
        self.lock.exclusive_release();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::lib::{Initializable, StorageConfig};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::tempdir;

    fn file_format(page_size: usize) -> FileFormat {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().join("undo.db"),
            page_size,
            ..StorageConfig::default()
        };
        let mut ff = FileFormat::new(config);
        ff.init().unwrap();
        std::mem::forget(dir);
        ff
    }

    #[test]
    fn inline_entries_roll_back_in_reverse_order() {
        let mut ff = file_format(4096);
        let mut log = UndoLog::new(TransactionId(1), 2048);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatch = UndoDispatchTable::new();
        let order_clone = order.clone();
        dispatch.register(UndoOpcode::Uninsert, move |payload| {
            order_clone.lock().push(payload[0]);
            Ok(())
        });

        let mark = log.scope_enter();
        log.push(&mut ff, 4096, UndoOpcode::Uninsert, &[1]).unwrap();
        log.push(&mut ff, 4096, UndoOpcode::Uninsert, &[2]).unwrap();
        log.push(&mut ff, 4096, UndoOpcode::Uninsert, &[3]).unwrap();
        log.scope_rollback(UndoScope(mark), &mut ff, 4096, &dispatch).unwrap();

        assert_eq!(*order.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn promotes_to_page_chain_past_threshold() {
        let mut ff = file_format(256);
        let mut log = UndoLog::new(TransactionId(2), 64);
        for i in 0..20u8 {
            log.push(&mut ff, 256, UndoOpcode::Unwrite, &[i; 8]).unwrap();
        }
        assert!(log.chain.is_some());
    }

    #[test]
    fn commit_translation_clears_trash_flag() {
        let mut ff = file_format(4096);
        let mut log = UndoLog::new(TransactionId(3), 2048);
        log.push(&mut ff, 4096, UndoOpcode::Uninsert, &[7]).unwrap();
        assert!(log.has_trash());
        log.translate_for_commit(&mut ff).unwrap();
        assert!(!log.has_trash());
    }

    #[test]
    fn master_log_tracks_registration() {
        let master = MasterUndoLog::global();
        let before = master.snapshot().len();
        let log = Arc::new(Mutex::new(UndoLog::new(TransactionId(1000 + before as u64), 2048)));
        master.register(log.clone());
        assert_eq!(master.snapshot().len(), before + 1);
        master.unregister(log.lock().transaction());
        assert_eq!(master.snapshot().len(), before);
    }

    #[test]
    fn push_with_context_emits_index_switch_marker_on_change() {
        let mut ff = file_format(4096);
        let mut log = UndoLog::new(TransactionId(5), 2048);
        log.push_with_context(&mut ff, 4096, dotdb_common::IndexId(1), b"k1", UndoOpcode::Unwrite, &[1]).unwrap();
        log.push_with_context(&mut ff, 4096, dotdb_common::IndexId(1), b"k1", UndoOpcode::Unwrite, &[2]).unwrap();
        log.push_with_context(&mut ff, 4096, dotdb_common::IndexId(2), b"k1", UndoOpcode::Unwrite, &[3]).unwrap();

        let entries = UndoLog::decode_inline(log.inline_bytes()).unwrap();
        let opcodes: Vec<UndoOpcode> = entries.iter().map(|e| e.opcode).collect();
        // index 1 + key k1 marker pair, then the first Unwrite, then the
        // second Unwrite with no new markers, then an IndexSwitch ahead of
        // the third (no ActiveKey marker since the key didn't change).
        assert_eq!(
            opcodes,
            vec![
                UndoOpcode::IndexSwitch,
                UndoOpcode::ActiveKey,
                UndoOpcode::Unwrite,
                UndoOpcode::Unwrite,
                UndoOpcode::IndexSwitch,
                UndoOpcode::Unwrite,
            ]
        );
    }

    #[test]
    fn push_with_context_emits_active_key_marker_only_for_value_accessor_ops() {
        let mut ff = file_format(4096);
        let mut log = UndoLog::new(TransactionId(6), 2048);
        log.push_with_context(&mut ff, 4096, dotdb_common::IndexId(1), b"a", UndoOpcode::Uninsert, &encode_ghost_payload(dotdb_common::IndexId(1), 0, b"a")).unwrap();
        log.push_with_context(&mut ff, 4096, dotdb_common::IndexId(1), b"b", UndoOpcode::Uninsert, &encode_ghost_payload(dotdb_common::IndexId(1), 0, b"b")).unwrap();

        let entries = UndoLog::decode_inline(log.inline_bytes()).unwrap();
        let opcodes: Vec<UndoOpcode> = entries.iter().map(|e| e.opcode).collect();
        // Uninsert isn't a value-accessor op, so no ActiveKey markers even
        // though the key changed between pushes.
        assert_eq!(opcodes, vec![UndoOpcode::IndexSwitch, UndoOpcode::Uninsert, UndoOpcode::Uninsert]);
    }

    #[test]
    fn push_with_context_expands_fragmented_keys_before_recording() {
        let mut ff = file_format(4096);
        let mut log = UndoLog::new(TransactionId(7), 2048);
        let fragmented = [0x80, b'k'];
        log.push_with_context(&mut ff, 4096, dotdb_common::IndexId(1), &fragmented, UndoOpcode::Unwrite, &[9]).unwrap();

        let entries = UndoLog::decode_inline(log.inline_bytes()).unwrap();
        let active_key_entry = entries.iter().find(|e| e.opcode == UndoOpcode::ActiveKey).unwrap();
        assert_eq!(active_key_entry.payload, vec![0x00, b'k']);
    }

    #[test]
    fn custom_action_dispatches_by_key_byte() {
        let mut ff = file_format(4096);
        let mut log = UndoLog::new(TransactionId(4), 2048);
        let mut dispatch = UndoDispatchTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        dispatch.register_custom(42, move |_payload| {
            hits_clone.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(())
        });
        let mut payload = vec![42u8];
        payload.extend_from_slice(b"hello");
        let mark = log.scope_enter();
        log.push(&mut ff, 4096, UndoOpcode::Custom, &payload).unwrap();
        log.scope_rollback(UndoScope(mark), &mut ff, 4096, &dispatch).unwrap();
        assert_eq!(hits.load(AtomicOrdering::Relaxed), 1);
    }
}
