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

//! Snapshot transfer: the requester polls every peer's
//! [`crate::channel::SnapshotScore`], picks the best (random tie-break),
//! and opens a direct socket to stream the snapshot. The receiver truncates
//! its log to the snapshot's `(prev_term, term, position)` before starting
//! (spec.md §4.7). The sender is owned by the task that invokes the
//! acceptor and torn down when the socket closes (spec.md §9 — the
//! lifecycle is deliberately this simple per the open FIXME noted there).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dotdb_common::Term;
use rand::seq::SliceRandom;

use crate::channel::{Channel, SnapshotScore};
use crate::error::{ReplicationError, ReplicationResult};

#[derive(Debug, Clone, Copy)]
pub struct SnapshotOptions {
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotPosition {
    pub prev_term: Term,
    pub term: Term,
    pub position: u64,
}

/// Rank candidate peers by `(active_sessions, weight)` — fewer active
/// sessions and higher weight wins — breaking ties randomly, and return
/// the winning index.
pub fn pick_best_peer(scores: &[(u64, SnapshotScore)]) -> Option<u64> {
    if scores.is_empty() {
        return None;
    }
    let best_key = scores.iter().map(|(_, s)| (s.active_sessions, std::cmp::Reverse(s.weight))).min()?;
    let mut candidates: Vec<u64> = scores.iter().filter(|(_, s)| (s.active_sessions, std::cmp::Reverse(s.weight)) == best_key).map(|(id, _)| *id).collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.into_iter().next()
}

/// Poll every peer for its snapshot score and pick the best one.
pub fn request_snapshot(peers: &[(u64, std::sync::Arc<dyn Channel>)], _options: SnapshotOptions) -> ReplicationResult<u64> {
    let mut scores = Vec::new();
    for (member_id, channel) in peers {
        if let Ok(score) = channel.snapshot_score() {
            scores.push((*member_id, score));
        }
    }
    pick_best_peer(&scores).ok_or(ReplicationError::NoConsensus)
}

/// Stream the local state as a snapshot to `stream`: a header
/// `(prev_term, term, position, length)` followed by `length` bytes.
pub fn send_snapshot(mut stream: TcpStream, position: SnapshotPosition, data: &[u8]) -> ReplicationResult<()> {
    stream.write_u64::<LittleEndian>(position.prev_term.0)?;
    stream.write_u64::<LittleEndian>(position.term.0)?;
    stream.write_u64::<LittleEndian>(position.position)?;
    stream.write_u64::<LittleEndian>(data.len() as u64)?;
    stream.write_all(data)?;
    stream.flush()?;
    Ok(())
}

/// Receive a snapshot from `stream`. The caller is responsible for
/// truncating its own log to the returned position before treating `data`
/// as authoritative.
pub fn receive_snapshot(mut stream: TcpStream) -> ReplicationResult<(SnapshotPosition, Vec<u8>)> {
    let prev_term = Term(stream.read_u64::<LittleEndian>()?);
    let term = Term(stream.read_u64::<LittleEndian>()?);
    let position = stream.read_u64::<LittleEndian>()?;
    let len = stream.read_u64::<LittleEndian>()? as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data)?;
    Ok((SnapshotPosition { prev_term, term, position }, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SnapshotScore;

    #[test]
    fn picks_fewest_sessions_then_highest_weight() {
        let scores = vec![
            (1, SnapshotScore { active_sessions: 3, weight: 100 }),
            (2, SnapshotScore { active_sessions: 1, weight: 10 }),
            (3, SnapshotScore { active_sessions: 1, weight: 50 }),
        ];
        assert_eq!(pick_best_peer(&scores), Some(3));
    }

    #[test]
    fn empty_scores_yield_none() {
        assert_eq!(pick_best_peer(&[]), None);
    }
}
