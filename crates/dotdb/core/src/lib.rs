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

//! Embedded transactional storage engine: page-structured files, a
//! row-lock-protected undo log, and background compaction and
//! checkpointing, all coordinated under a single reader-preferring commit
//! lock.

pub mod compaction;
pub mod fs;
pub mod recovery;
pub mod storage_engine;

pub use storage_engine::{
    decode_ghost_payload, decode_lock_payload, encode_ghost_payload, encode_lock_payload, AcquireResult, CommitLock, ExclusiveGuard, FileFormat, GhostRef, Initializable, LockFailure, LockManager,
    LockMode, LockStatistics, MasterUndoLog, Page, PageAllocation, PageId, PageManager, PageQueue, PageQueueHeader, PageType, SharedGuard, StorageConfig, StorageError, StorageResult,
    UndoDispatchTable, UndoEntry, UndoLog, UndoOpcode, UndoScope, UpgradeRule, VersionId, calculate_checksum, generate_timestamp,
};
