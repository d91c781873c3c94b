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

use std::io;

use dotdb_common::Term;

/// Error taxonomy for the replication log and consensus layer, mirroring
/// `dotdb_core::StorageError`'s split between transient/retryable kinds and
/// the small set that actually abort the process.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("commit conflict: {0}")]
    CommitConflict(String),

    #[error("term {requested} is below the current term {current}")]
    StaleTerm { requested: Term, current: Term },

    #[error("term {0} is unknown to this log")]
    UnknownTerm(Term),

    #[error("corrupt replication state: {0}")]
    Corruption(String),

    #[error("group version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("member {0} is unknown to this group")]
    UnknownMember(u64),

    #[error("the local member cannot be removed from its own group")]
    CannotRemoveSelf,

    #[error("not the leader")]
    NotLeader,

    #[error("no leader is currently known")]
    NoLeader,

    #[error("no consensus: fewer than a majority of peers are reachable")]
    NoConsensus,

    #[error("operation timed out")]
    Timeout,

    #[error("operation interrupted")]
    Interrupted,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unknown wire opcode: {0}")]
    UnknownOperation(u8),

    #[error("channel closed")]
    ChannelClosed,
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

/// Wire-level error codes carried in `OP_ERROR` join replies (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JoinErrorCode {
    UnknownOperation = 0,
    InvalidAddress = 1,
    NoLeader = 2,
    NoAcceptor = 3,
    VersionMismatch = 4,
    UnknownMember = 5,
    NotLeader = 6,
    NoConsensus = 7,
    Success = 8,
}

impl JoinErrorCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::UnknownOperation,
            1 => Self::InvalidAddress,
            2 => Self::NoLeader,
            3 => Self::NoAcceptor,
            4 => Self::VersionMismatch,
            5 => Self::UnknownMember,
            6 => Self::NotLeader,
            7 => Self::NoConsensus,
            8 => Self::Success,
            _ => return None,
        })
    }
}

impl From<&ReplicationError> for JoinErrorCode {
    fn from(err: &ReplicationError) -> Self {
        match err {
            ReplicationError::InvalidAddress(_) => JoinErrorCode::InvalidAddress,
            ReplicationError::NoLeader => JoinErrorCode::NoLeader,
            ReplicationError::VersionMismatch { .. } => JoinErrorCode::VersionMismatch,
            ReplicationError::UnknownMember(_) => JoinErrorCode::UnknownMember,
            ReplicationError::NotLeader => JoinErrorCode::NotLeader,
            ReplicationError::NoConsensus => JoinErrorCode::NoConsensus,
            _ => JoinErrorCode::UnknownOperation,
        }
    }
}
