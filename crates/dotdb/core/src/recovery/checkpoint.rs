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

//! Checkpoint and recovery.
//!
//! A checkpoint is not a copy of the database's data files: it is a
//! snapshot of every still-open transaction's undo log, each written as one
//! descriptor to a singleton master log (spec.md §4.4). A transaction whose
//! log still fits inline gets a `LogCopy` descriptor carrying the bytes
//! directly; one that's spilled to a page chain gets a `LogRef` descriptor
//! pointing at the chain's head. Recovery walks that master log, rebuilds
//! each transaction's undo log, and either rolls it back (if it never
//! committed) or deletes its ghost rows (if it did, but didn't reach the
//! next checkpoint before a crash).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use dotdb_common::TransactionId;
use serde::{Deserialize, Serialize};

use crate::fs::{FileSystemLayout, FileType};
use crate::storage_engine::file_format::{FileFormat, PageId};
use crate::storage_engine::lib::{StorageError, StorageResult};
use crate::storage_engine::lock::{GhostRef, LockManager};
use crate::storage_engine::undo_log::{self, MasterUndoLog, UndoDispatchTable, UndoEntry, UndoOpcode};

/// Metadata describing a checkpoint: a header plus the count of descriptors
/// in the body that follows it on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: u64,
    pub timestamp: u64,
    pub version: u32,
    pub descriptor_count: u64,
    pub log_sequence_number: u64,
    pub size: u64,
    pub checksum: u64,
}

/// Configuration for checkpointing, including retention and verification options.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub max_checkpoints: usize,
    pub auto_checkpoint_interval: std::time::Duration,
    pub compression_enabled: bool,
    pub verification_enabled: bool,
}

impl Default for CheckpointConfig {
    /// Returns a default configuration for checkpointing.
    fn default() -> Self {
        Self {
            max_checkpoints: 10,
            auto_checkpoint_interval: std::time::Duration::from_secs(300), // 5 minutes
            compression_enabled: false,
            verification_enabled: true,
        }
    }
}

/// One live undo log's position at checkpoint time.
#[derive(Debug, Clone)]
pub enum UndoLogDescriptor {
    /// The log never promoted past its inline buffer; the bytes are
    /// carried directly in the master log.
    LogCopy { transaction: TransactionId, entries: Vec<u8> },
    /// The log spilled to a page chain; the master log records only where
    /// that chain begins.
    LogRef { transaction: TransactionId, chain_head: PageId },
}

impl UndoLogDescriptor {
    fn transaction(&self) -> TransactionId {
        match self {
            UndoLogDescriptor::LogCopy { transaction, .. } => *transaction,
            UndoLogDescriptor::LogRef { transaction, .. } => *transaction,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            UndoLogDescriptor::LogCopy { transaction, entries } => {
                out.push(0);
                out.extend_from_slice(&transaction.0.to_le_bytes());
                dotdb_common::write_varint_u64(entries.len() as u64, out);
                out.extend_from_slice(entries);
            }
            UndoLogDescriptor::LogRef { transaction, chain_head } => {
                out.push(1);
                out.extend_from_slice(&transaction.0.to_le_bytes());
                out.extend_from_slice(&chain_head.0.to_le_bytes());
            }
        }
    }

    fn decode(buf: &[u8]) -> StorageResult<(Self, usize)> {
        if buf.is_empty() {
            return Err(StorageError::Corruption("master log descriptor truncated".to_string()));
        }
        let kind = buf[0];
        if buf.len() < 9 {
            return Err(StorageError::Corruption("master log descriptor missing transaction id".to_string()));
        }
        let transaction = TransactionId(u64::from_le_bytes(buf[1..9].try_into().unwrap()));
        match kind {
            0 => {
                let (len, len_size) = dotdb_common::read_varint_u64(&buf[9..]).ok_or_else(|| StorageError::Corruption("master log LOG_COPY length truncated".to_string()))?;
                let start = 9 + len_size;
                let end = start + len as usize;
                if buf.len() < end {
                    return Err(StorageError::Corruption("master log LOG_COPY body truncated".to_string()));
                }
                Ok((UndoLogDescriptor::LogCopy { transaction, entries: buf[start..end].to_vec() }, end))
            }
            1 => {
                if buf.len() < 17 {
                    return Err(StorageError::Corruption("master log LOG_REF truncated".to_string()));
                }
                let chain_head = PageId(u64::from_le_bytes(buf[9..17].try_into().unwrap()));
                Ok((UndoLogDescriptor::LogRef { transaction, chain_head }, 17))
            }
            other => Err(StorageError::Corruption(format!("unknown master log descriptor kind {other}"))),
        }
    }
}

/// A transaction reconstructed by [`CheckpointManager::recover`], with
/// enough information for the caller to finish bringing it back to life.
pub struct RecoveredTransaction {
    pub transaction: TransactionId,
    /// The transaction had logged at least one row-level change.
    pub has_trash: bool,
    /// The transaction had entered its prepare phase before the crash.
    pub has_prepare: bool,
    /// `true` if this log's entries had already been commit-translated
    /// (`LogCopyCommitted` / `LogRefCommitted`): the transaction committed,
    /// and recovery only needs to delete its ghost rows, not roll it back.
    pub committed: bool,
    /// Locks to re-acquire before the transaction is handed back to its
    /// owner, oldest first.
    pub locks: Vec<LockRecoveryEntry>,
}

pub struct LockRecoveryEntry {
    pub index_id: dotdb_common::IndexId,
    pub key: Vec<u8>,
    pub exclusive: bool,
}

/// Manages the creation, restoration, and retention of database checkpoints.
pub struct CheckpointManager {
    layout: FileSystemLayout,
    config: CheckpointConfig,
    current_lsn: u64,
    last_checkpoint_time: SystemTime,
}

impl CheckpointManager {
    /// Creates a new CheckpointManager with the given layout and configuration.
    pub fn new(layout: FileSystemLayout, config: CheckpointConfig) -> Self {
        Self {
            layout,
            config,
            current_lsn: 0,
            last_checkpoint_time: SystemTime::now(),
        }
    }

    /// Snapshots every still-open undo log and writes one descriptor per
    /// log to a fresh master log file, then prunes old checkpoints.
    pub fn create_checkpoint(&mut self) -> StorageResult<CheckpointMetadata> {
        let checkpoint_id = self.layout.next_file_id(FileType::Checkpoint)?;
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();

        let descriptors = self.collect_descriptors();

        let mut metadata = CheckpointMetadata {
            id: checkpoint_id,
            timestamp,
            version: 1,
            descriptor_count: descriptors.len() as u64,
            log_sequence_number: self.current_lsn,
            size: 0,
            checksum: 0,
        };

        // Atomic publish: write the full file under a `.new` name, then
        // rename over any previous version so a crash mid-write never
        // leaves a half-written checkpoint visible to recovery.
        let checkpoint_path = self.layout.generate_file_path(FileType::Checkpoint, checkpoint_id, metadata.version);
        let tmp_path = checkpoint_path.with_extension("ckpt.new");
        self.write_checkpoint(&tmp_path, &descriptors, &mut metadata)?;
        std::fs::rename(&tmp_path, &checkpoint_path)?;

        self.last_checkpoint_time = SystemTime::now();
        self.cleanup_old_checkpoints()?;

        Ok(metadata)
    }

    fn collect_descriptors(&self) -> Vec<UndoLogDescriptor> {
        MasterUndoLog::global()
            .snapshot()
            .into_iter()
            .map(|log| {
                let log = log.lock();
                match log.chain_head() {
                    Some(chain_head) => UndoLogDescriptor::LogRef { transaction: log.transaction(), chain_head },
                    None => UndoLogDescriptor::LogCopy {
                        transaction: log.transaction(),
                        entries: log.inline_bytes().to_vec(),
                    },
                }
            })
            .collect()
    }

    /// Writes the descriptor body, then rewrites the header once `size` and
    /// `checksum` are known (same two-pass shape as the original file so a
    /// partial write is caught by a length mismatch, not garbage metadata).
    fn write_checkpoint(&self, checkpoint_path: &Path, descriptors: &[UndoLogDescriptor], metadata: &mut CheckpointMetadata) -> StorageResult<()> {
        let mut body = Vec::new();
        for descriptor in descriptors {
            descriptor.encode(&mut body);
        }
        metadata.size = body.len() as u64;
        metadata.checksum = crc32fast::hash(&body) as u64;

        let file = File::create(checkpoint_path)?;
        let mut writer = BufWriter::new(file);
        let metadata_json = serde_json::to_string(metadata).map_err(|e| StorageError::Corruption(e.to_string()))?;
        writer.write_all(&(metadata_json.len() as u32).to_le_bytes())?;
        writer.write_all(metadata_json.as_bytes())?;
        writer.write_all(&body)?;
        writer.flush()?;
        Ok(())
    }

    /// Walks the most recent valid checkpoint's master log, reconstructing
    /// one [`RecoveredTransaction`] per descriptor. `file_format` is the
    /// already-open data file the descriptors' page chains live in.
    pub fn recover(&self, file_format: &mut FileFormat, dispatch: &UndoDispatchTable) -> StorageResult<Vec<RecoveredTransaction>> {
        let checkpoint = match self.get_latest_checkpoint()? {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let checkpoint_path = self.layout.generate_file_path(FileType::Checkpoint, checkpoint.id, checkpoint.version);
        let descriptors = self.read_descriptors(&checkpoint_path, &checkpoint)?;

        let mut out = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let transaction = descriptor.transaction();
            let entries = match &descriptor {
                UndoLogDescriptor::LogCopy { entries, .. } => undo_log::UndoLog::decode_inline(entries)?,
                UndoLogDescriptor::LogRef { chain_head, .. } => undo_log::UndoLog::read_chain(file_format, *chain_head)?,
            };
            out.push(Self::recover_one(transaction, entries, dispatch)?);
        }
        Ok(out)
    }

    fn recover_one(transaction: TransactionId, entries: Vec<UndoEntry>, dispatch: &UndoDispatchTable) -> StorageResult<RecoveredTransaction> {
        let committed = entries.iter().any(|e| matches!(e.opcode, UndoOpcode::LogCopyCommitted | UndoOpcode::LogRefCommitted));
        let has_prepare = entries.iter().any(|e| e.opcode == UndoOpcode::Prepare);
        let has_trash = entries
            .iter()
            .any(|e| matches!(e.opcode, UndoOpcode::Uninsert | UndoOpcode::Unupdate | UndoOpcode::Undelete | UndoOpcode::UndeleteFragmented | UndoOpcode::LogCopyCommitted | UndoOpcode::LogRefCommitted));

        let mut locks = Vec::new();
        for entry in &entries {
            match entry.opcode {
                UndoOpcode::LockExclusive => {
                    let (index_id, key) = undo_log::decode_lock_payload(&entry.payload)?;
                    locks.push(LockRecoveryEntry { index_id, key: key.to_vec(), exclusive: true });
                }
                UndoOpcode::LockUpgradable => {
                    let (index_id, key) = undo_log::decode_lock_payload(&entry.payload)?;
                    locks.push(LockRecoveryEntry { index_id, key: key.to_vec(), exclusive: false });
                }
                _ => {}
            }
        }

        if committed {
            // recovery-cleanup: the transaction reached commit, so its
            // leftover entries are ghost rows to delete, not actions to
            // undo. Locks are still re-acquired below before the caller
            // deletes anything, matching the "locks only after the log is
            // fully consumed" ordering.
        } else {
            // Never committed: replay every entry in reverse, exactly as a
            // live rollback would, only after the whole log has been read.
            for entry in entries.iter().rev() {
                dispatch.invoke(entry)?;
            }
        }

        Ok(RecoveredTransaction { transaction, has_trash, has_prepare, committed, locks })
    }

    /// Ghost rows a committed, recovered transaction's cleanup pass should
    /// delete: `(index-id, page-position)` pairs pulled from its
    /// `LogCopyCommitted` entries.
    pub fn ghosts_to_delete(entries: &[UndoEntry]) -> StorageResult<Vec<GhostRef>> {
        let mut out = Vec::new();
        for entry in entries {
            if entry.opcode == UndoOpcode::LogCopyCommitted {
                let (index_id, page_position, _key) = undo_log::decode_ghost_payload(&entry.payload)?;
                out.push(GhostRef { index_id, page_position });
            }
        }
        Ok(out)
    }

    /// Re-acquires every lock a recovered transaction held, marking ghost
    /// rows along the way if `committed` entries identify one at the same
    /// key. Locks are only taken once the caller has fully consumed the
    /// recovered log, so lock ordering during recovery mirrors the
    /// transaction's own acquisition order, reversed per the stack recovery
    /// rebuilds scopes into.
    pub fn reacquire_locks(lock_manager: &LockManager, recovered: &RecoveredTransaction) {
        for entry in &recovered.locks {
            lock_manager.recover_lock(recovered.transaction, entry.index_id, &entry.key, entry.exclusive, None);
        }
    }

    fn read_descriptors(&self, checkpoint_path: &Path, metadata: &CheckpointMetadata) -> StorageResult<Vec<UndoLogDescriptor>> {
        let file = File::open(checkpoint_path)?;
        let mut reader = BufReader::new(file);

        let mut size_bytes = [0u8; 4];
        reader.read_exact(&mut size_bytes)?;
        let header_size = u32::from_le_bytes(size_bytes) as usize;
        let mut header_buf = vec![0u8; header_size];
        reader.read_exact(&mut header_buf)?;

        let mut body = Vec::with_capacity(metadata.size as usize);
        reader.read_to_end(&mut body)?;

        if self.config.verification_enabled && crc32fast::hash(&body) as u64 != metadata.checksum {
            return Err(StorageError::Corruption("checkpoint checksum verification failed".to_string()));
        }

        let mut out = Vec::with_capacity(metadata.descriptor_count as usize);
        let mut pos = 0;
        while pos < body.len() {
            let (descriptor, consumed) = UndoLogDescriptor::decode(&body[pos..])?;
            pos += consumed;
            out.push(descriptor);
        }
        Ok(out)
    }

    /// Loads checkpoint metadata for a specific checkpoint ID.
    pub fn load_checkpoint_metadata(&self, checkpoint_id: u64) -> StorageResult<CheckpointMetadata> {
        let checkpoints = self.list_checkpoints()?;
        checkpoints
            .into_iter()
            .find(|c| c.id == checkpoint_id)
            .ok_or_else(|| StorageError::NotFound(format!("checkpoint {checkpoint_id}")))
    }

    /// Lists all available checkpoints, sorted by timestamp (newest first).
    pub fn list_checkpoints(&self) -> StorageResult<Vec<CheckpointMetadata>> {
        let checkpoint_files = self.layout.list_files(FileType::Checkpoint)?;
        let mut checkpoints = Vec::new();
        for file_metadata in checkpoint_files {
            if let Ok(metadata) = self.read_checkpoint_header(&file_metadata.path) {
                checkpoints.push(metadata);
            }
        }
        checkpoints.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(checkpoints)
    }

    fn read_checkpoint_header(&self, path: &Path) -> StorageResult<CheckpointMetadata> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut size_bytes = [0u8; 4];
        reader.read_exact(&mut size_bytes)?;
        let header_size = u32::from_le_bytes(size_bytes) as usize;
        let mut header_buf = vec![0u8; header_size];
        reader.read_exact(&mut header_buf)?;
        let header = String::from_utf8(header_buf).map_err(|e| StorageError::Corruption(e.to_string()))?;
        serde_json::from_str(&header).map_err(|e| StorageError::Corruption(e.to_string()))
    }

    /// Removes old checkpoints based on the retention policy.
    fn cleanup_old_checkpoints(&self) -> StorageResult<()> {
        self.layout.cleanup_old_files(FileType::Checkpoint, self.config.max_checkpoints)?;
        Ok(())
    }

    /// Returns true if enough time has passed to trigger an automatic checkpoint.
    pub fn should_create_checkpoint(&self) -> bool {
        self.last_checkpoint_time.elapsed().unwrap_or_default() >= self.config.auto_checkpoint_interval
    }

    /// Updates the current log sequence number (LSN).
    pub fn update_lsn(&mut self, lsn: u64) {
        self.current_lsn = lsn;
    }

    /// Returns the current log sequence number (LSN).
    pub fn current_lsn(&self) -> u64 {
        self.current_lsn
    }

    /// Returns the most recent checkpoint, if any.
    pub fn get_latest_checkpoint(&self) -> StorageResult<Option<CheckpointMetadata>> {
        let checkpoints = self.list_checkpoints()?;
        Ok(checkpoints.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LayoutConfig;
    use crate::storage_engine::file_format::FileFormat;
    use crate::storage_engine::lib::{Initializable, StorageConfig};
    use crate::storage_engine::undo_log::{encode_ghost_payload, MasterUndoLog, UndoLog};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_checkpoint_manager() -> (CheckpointManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let layout_config = LayoutConfig {
            base_path: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let layout = FileSystemLayout::new(layout_config).unwrap();
        let config = CheckpointConfig::default();
        let manager = CheckpointManager::new(layout, config);
        (manager, temp_dir)
    }

    fn file_format(dir: &Path, page_size: usize) -> FileFormat {
        let config = StorageConfig {
            path: dir.join("undo.db"),
            page_size,
            ..StorageConfig::default()
        };
        let mut ff = FileFormat::new(config);
        ff.init().unwrap();
        ff
    }

    #[test]
    fn test_checkpoint_config_default() {
        let config = CheckpointConfig::default();
        assert_eq!(config.max_checkpoints, 10);
        assert_eq!(config.auto_checkpoint_interval, std::time::Duration::from_secs(300));
        assert!(!config.compression_enabled);
        assert!(config.verification_enabled);
    }

    #[test]
    fn checkpoint_captures_inline_and_chained_logs() {
        let (mut manager, dir) = create_test_checkpoint_manager();
        let mut ff = file_format(dir.path(), 4096);

        let inline_log = Arc::new(Mutex::new(UndoLog::new(TransactionId(1), 2048)));
        inline_log.lock().push(&mut ff, 4096, UndoOpcode::Uninsert, &encode_ghost_payload(dotdb_common::IndexId(7), 99, b"k1")).unwrap();

        let mut chained = UndoLog::new(TransactionId(2), 32);
        for i in 0..20u8 {
            chained.push(&mut ff, 4096, UndoOpcode::Unwrite, &[i; 8]).unwrap();
        }
        let chained = Arc::new(Mutex::new(chained));

        MasterUndoLog::global().register(inline_log.clone());
        MasterUndoLog::global().register(chained.clone());

        let metadata = manager.create_checkpoint().unwrap();
        assert!(metadata.descriptor_count >= 2);

        let dispatch = UndoDispatchTable::new();
        let recovered = manager.recover(&mut ff, &dispatch).unwrap();
        let txn1 = recovered.iter().find(|r| r.transaction == TransactionId(1)).unwrap();
        assert!(txn1.has_trash);
        assert!(!txn1.committed);
        let txn2 = recovered.iter().find(|r| r.transaction == TransactionId(2)).unwrap();
        assert!(!txn2.committed);

        MasterUndoLog::global().unregister(TransactionId(1));
        MasterUndoLog::global().unregister(TransactionId(2));
    }

    #[test]
    fn recovered_committed_log_yields_ghosts_not_rollback() {
        let (mut manager, dir) = create_test_checkpoint_manager();
        let mut ff = file_format(dir.path(), 4096);

        let mut log = UndoLog::new(TransactionId(3), 2048);
        log.push(&mut ff, 4096, UndoOpcode::Uninsert, &encode_ghost_payload(dotdb_common::IndexId(1), 42, b"key")).unwrap();
        log.translate_for_commit(&mut ff).unwrap();
        let log = Arc::new(Mutex::new(log));
        MasterUndoLog::global().register(log.clone());

        manager.create_checkpoint().unwrap();
        let dispatch = UndoDispatchTable::new();
        let recovered = manager.recover(&mut ff, &dispatch).unwrap();
        let txn3 = recovered.iter().find(|r| r.transaction == TransactionId(3)).unwrap();
        assert!(txn3.committed);

        MasterUndoLog::global().unregister(TransactionId(3));
    }

    #[test]
    fn test_should_create_checkpoint() {
        let (manager, _temp_dir) = create_test_checkpoint_manager();
        assert!(!manager.should_create_checkpoint());
    }

    #[test]
    fn test_lsn_operations() {
        let (mut manager, _temp_dir) = create_test_checkpoint_manager();
        assert_eq!(manager.current_lsn(), 0);
        manager.update_lsn(100);
        assert_eq!(manager.current_lsn(), 100);
    }

    #[test]
    fn test_list_checkpoints_sorted_newest_first() {
        let (mut manager, _dir) = create_test_checkpoint_manager();
        let first = manager.create_checkpoint().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = manager.create_checkpoint().unwrap();

        let checkpoints = manager.list_checkpoints().unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].id, second.id);
        assert_eq!(checkpoints[1].id, first.id);
    }

    #[test]
    fn test_get_latest_checkpoint() {
        let (mut manager, _dir) = create_test_checkpoint_manager();
        assert!(manager.get_latest_checkpoint().unwrap().is_none());
        let checkpoint = manager.create_checkpoint().unwrap();
        let latest = manager.get_latest_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.id, latest.id);
    }
}
