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

//! `GroupJoiner`: contacts a set of seed addresses on behalf of a node
//! wanting to join a replication group. Seeds forward to the current
//! leader; the leader proposes a join control message and streams the
//! group file back once it commits (spec.md §4.7).

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use dotdb_common::Term;
use tracing::{info, warn};

use crate::channel::{decode_join_reply, encode_join_request, read_frame, write_frame, JoinReply};
use crate::error::{JoinErrorCode, ReplicationError, ReplicationResult};
use crate::group_file::GroupFileContents;

pub struct JoinOutcome {
    pub prev_term: Term,
    pub term: Term,
    pub index: u64,
    pub group_file: GroupFileContents,
}

pub struct GroupJoiner {
    pub connect_timeout: Duration,
    pub join_timeout: Duration,
}

impl GroupJoiner {
    pub fn new(connect_timeout: Duration, join_timeout: Duration) -> Self {
        Self { connect_timeout, join_timeout }
    }

    /// Try each seed in turn; an `OP_ADDRESS` reply redirects to the
    /// leader and is followed once before giving up.
    pub fn join(&self, seeds: &[String], local_address: &str) -> ReplicationResult<JoinOutcome> {
        let deadline = Instant::now() + self.join_timeout;
        let mut to_try: Vec<String> = seeds.to_vec();
        let mut redirected_once = false;

        while let Some(addr) = to_try.pop() {
            if Instant::now() > deadline {
                return Err(ReplicationError::Timeout);
            }
            match self.try_one(&addr, local_address) {
                Ok(outcome) => return Ok(outcome),
                Err(JoinAttempt::Redirect(leader_addr)) if !redirected_once => {
                    redirected_once = true;
                    to_try = vec![leader_addr];
                }
                Err(JoinAttempt::Redirect(_)) => {
                    return Err(ReplicationError::NoLeader);
                }
                Err(JoinAttempt::Error(e)) => {
                    warn!(seed = %addr, error = ?e, "join attempt failed, trying next seed");
                }
            }
        }
        Err(ReplicationError::NoLeader)
    }

    fn try_one(&self, addr: &str, local_address: &str) -> Result<JoinOutcome, JoinAttempt> {
        let stream = TcpStream::connect(addr).map_err(|e| JoinAttempt::Error(e.into()))?;
        stream.set_read_timeout(Some(self.join_timeout)).ok();
        stream.set_write_timeout(Some(self.connect_timeout)).ok();
        let mut stream = stream;
        let request = encode_join_request(local_address);
        write_frame(&mut stream, &request).map_err(JoinAttempt::Error)?;
        let reply_bytes = read_frame(&mut stream).map_err(JoinAttempt::Error)?;
        match decode_join_reply(&reply_bytes).map_err(JoinAttempt::Error)? {
            JoinReply::Joined { prev_term, term, index, group_file_bytes } => {
                let mut cursor = std::io::Cursor::new(group_file_bytes);
                let mut version_buf = [0u8; 8];
                cursor.read_exact(&mut version_buf).map_err(|e| JoinAttempt::Error(e.into()))?;
                let version = u64::from_le_bytes(version_buf);
                let mut len_buf = [0u8; 4];
                cursor.read_exact(&mut len_buf).map_err(|e| JoinAttempt::Error(e.into()))?;
                let len = u32::from_le_bytes(len_buf) as usize;
                let mut body = vec![0u8; len];
                cursor.read_exact(&mut body).map_err(|e| JoinAttempt::Error(e.into()))?;
                let text = String::from_utf8(body).map_err(|_| JoinAttempt::Error(ReplicationError::Corruption("non-utf8 group file".into())))?;
                let group_file = parse_group_properties(&text, version).map_err(JoinAttempt::Error)?;
                info!(leader = %addr, "joined group");
                Ok(JoinOutcome { prev_term, term, index, group_file })
            }
            JoinReply::Address { leader_address } => Err(JoinAttempt::Redirect(leader_address)),
            JoinReply::Error { code } => Err(JoinAttempt::Error(join_error_to_replication_error(code))),
        }
    }
}

enum JoinAttempt {
    Redirect(String),
    Error(ReplicationError),
}

fn join_error_to_replication_error(code: JoinErrorCode) -> ReplicationError {
    match code {
        JoinErrorCode::UnknownOperation => ReplicationError::UnknownOperation(0),
        JoinErrorCode::InvalidAddress => ReplicationError::InvalidAddress("rejected by peer".into()),
        JoinErrorCode::NoLeader => ReplicationError::NoLeader,
        JoinErrorCode::NoAcceptor => ReplicationError::CommitConflict("no control-message acceptor installed".into()),
        JoinErrorCode::VersionMismatch => ReplicationError::VersionMismatch { expected: 0, actual: 0 },
        JoinErrorCode::UnknownMember => ReplicationError::UnknownMember(0),
        JoinErrorCode::NotLeader => ReplicationError::NotLeader,
        JoinErrorCode::NoConsensus => ReplicationError::NoConsensus,
        JoinErrorCode::Success => ReplicationError::Corruption("SUCCESS code carried no payload".into()),
    }
}

fn parse_group_properties(text: &str, expected_version: u64) -> ReplicationResult<GroupFileContents> {
    // Reuses the same `key = value` grammar as the on-disk roster file.
    let mut version = None;
    let mut group_id = None;
    let mut members = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| ReplicationError::Corruption("malformed group line".into()))?;
        let key = key.trim();
        let value = value.trim();
        match key {
            "version" => version = Some(value.parse::<u64>().map_err(|_| ReplicationError::Corruption("bad version".into()))?),
            "groupId" => group_id = Some(value.parse::<u64>().map_err(|_| ReplicationError::Corruption("bad groupId".into()))?),
            id => {
                let member_id = id.parse::<u64>().map_err(|_| ReplicationError::Corruption("bad member id".into()))?;
                let (address, role) = value.split_once('|').ok_or_else(|| ReplicationError::Corruption("malformed member".into()))?;
                members.push(crate::group_file::Member {
                    member_id,
                    address: address.trim().to_string(),
                    role: match role.trim() {
                        "NORMAL" => crate::group_file::Role::Normal,
                        "STANDBY" => crate::group_file::Role::Standby,
                        "OBSERVER" => crate::group_file::Role::Observer,
                        other => return Err(ReplicationError::Corruption(format!("bad role {other}"))),
                    },
                });
            }
        }
    }
    let version = version.ok_or_else(|| ReplicationError::Corruption("missing version".into()))?;
    if version != expected_version {
        return Err(ReplicationError::VersionMismatch { expected: expected_version, actual: version });
    }
    Ok(GroupFileContents {
        version,
        group_id: group_id.ok_or_else(|| ReplicationError::Corruption("missing groupId".into()))?,
        members,
    })
}

/// A single accepted join connection on the listener side: reads the join
/// request, asks `handler` to process it, writes the reply.
pub fn serve_join_connection(mut stream: TcpStream, handler: impl FnOnce(String) -> JoinReply) -> ReplicationResult<()> {
    let request = read_frame(&mut stream)?;
    let address = crate::channel::decode_join_request(&request)?;
    let reply = handler(address);
    write_frame(&mut stream, &crate::channel::encode_join_reply(&reply))
}

/// Accept loop for a join listener socket. Runs until the listener errors
/// or is closed by dropping it from another thread.
pub fn run_join_listener(listener: TcpListener, handler: impl Fn(String) -> JoinReply + Send + Sync + 'static) {
    let handler = std::sync::Arc::new(handler);
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let handler = handler.clone();
                std::thread::spawn(move || {
                    if let Err(e) = serve_join_connection(stream, move |addr| handler(addr)) {
                        warn!(error = %e, "join connection failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "join listener accept failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_is_followed_once() {
        // A bare unit test for the control-flow rule: a second redirect in
        // a row is treated as "no leader" rather than looping forever.
        let joiner = GroupJoiner::new(Duration::from_millis(50), Duration::from_millis(50));
        let result = joiner.join(&["127.0.0.1:1".to_string()], "127.0.0.1:9");
        assert!(result.is_err());
    }
}
