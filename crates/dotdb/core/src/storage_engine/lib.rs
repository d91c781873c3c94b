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

// Common types and utilities for the storage engine

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Represents a unique identifier for a database version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId(pub u64);

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the storage files
    pub path: PathBuf,
    /// Size of each page in bytes
    pub page_size: usize,
    /// Number of stripes in the row lock manager's hashtable, before rounding
    /// up to a power of two. Defaults to `16 * cpu-count`.
    pub lock_stripe_count: usize,
    /// Inline-buffer-to-page-chain promotion threshold for undo logs, as a
    /// fraction of `page_size` (spec: half the page size).
    pub undo_page_threshold: usize,
    /// Optional hard cap on the number of pages the backing array may grow
    /// to. `None` means unbounded (subject to available disk).
    pub page_limit: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let page_size = 4096;
        Self {
            path: PathBuf::from("./data"),
            page_size,
            lock_stripe_count: 16 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            undo_page_threshold: page_size / 2,
            page_limit: None,
        }
    }
}

/// Error types specific to the storage engine
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Page {0} not found")]
    PageNotFound(u64),

    #[error("Corrupted storage: {0}")]
    Corruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Acquire deadline elapsed before a lock was granted. Returned to the
    /// caller as a failure; lock state is left untouched.
    #[error("lock acquire timed out")]
    LockTimeout,

    /// A wait-for cycle was detected while blocked on a lock. The caller
    /// usually aborts the transaction holding this result.
    #[error("deadlock suspected")]
    DeadlockSuspected,

    /// A term-define or log write target fell below the commit position.
    /// Non-fatal: the caller resynchronizes or steps down.
    #[error("commit conflict: {0}")]
    CommitConflict(String),

    /// Cooperative cancellation observed during a lock or sync wait.
    #[error("operation interrupted")]
    Interrupted,

    /// No evictable page was available to satisfy an allocation. Transient;
    /// the caller may retry after freeing buffer space.
    #[error("cache exhausted: no evictable page available")]
    CacheExhausted,

    /// An allocation-free delete needed a new queue node but the target
    /// queue had no spare one buffered. The caller must top up the queue's
    /// spare node outside the delete (where reentrant I/O is allowed) and
    /// retry.
    #[error("page queue has no spare node and allocation is not permitted mid-delete")]
    AllocationRequired,

    /// A peer sent an opcode this build does not recognize. The frame is
    /// dropped rather than surfaced as a hard error.
    #[error("unknown control message opcode: {0}")]
    UnknownControlMessage(u8),
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Generate a unique timestamp for versioning
pub fn generate_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("Time went backwards").as_nanos() as u64
}

/// Calculate CRC32 checksum for data integrity
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Trait for storage components that need initialization
pub trait Initializable {
    /// Initialize the component
    fn init(&mut self) -> StorageResult<()>;

    /// Check if the component is initialized
    fn is_initialized(&self) -> bool;
}
