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

// Storage Engine Module
// Provides a persistent storage system with ACID guarantees

pub mod commit_lock;
pub mod file_format;
pub mod lib;
pub mod lock;
pub mod page_manager;
pub mod page_queue;
pub mod undo_log;

// Public exports
pub use commit_lock::{CommitLock, ExclusiveGuard, SharedGuard};
pub use file_format::{FileFormat, Page, PageId, PageType};
pub use lib::{Initializable, StorageConfig, StorageError, StorageResult, VersionId, calculate_checksum, generate_timestamp};
pub use lock::{AcquireResult, GhostRef, LockFailure, LockManager, LockMode, LockStatistics, UpgradeRule};
pub use page_manager::{PageAllocation, PageManager};
pub use page_queue::{PageQueue, PageQueueHeader};
pub use undo_log::{
    decode_ghost_payload, decode_lock_payload, encode_ghost_payload, encode_lock_payload, MasterUndoLog, UndoDispatchTable, UndoEntry, UndoLog, UndoOpcode, UndoScope,
};
