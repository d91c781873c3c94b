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

//! Wire protocol (spec.md §6): length-prefixed frames, each carrying an
//! opcode byte and typed little-endian fields. [`Channel`] is the capability
//! trait a peer connection implements; [`Controller`] implements it too so
//! tests can wire two controllers together without sockets (spec.md §9).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dotdb_common::Term;

use crate::error::{JoinErrorCode, ReplicationError, ReplicationResult};
use crate::group_file::Role;

pub const OP_NOP: u8 = 0;
/// Carried on its own join listener socket, distinct from the peer channel
/// opcodes below (spec.md §6: "join: opcode 1").
pub const OP_JOIN: u8 = 1;
pub const OP_REQUEST_VOTE: u8 = 2;
pub const OP_REQUEST_VOTE_REPLY: u8 = 3;
pub const OP_QUERY_TERMS: u8 = 4;
pub const OP_QUERY_TERMS_REPLY: u8 = 5;
pub const OP_QUERY_DATA: u8 = 6;
pub const OP_QUERY_DATA_REPLY: u8 = 7;
pub const OP_WRITE_DATA: u8 = 8;
pub const OP_WRITE_DATA_REPLY: u8 = 9;
pub const OP_SYNC_COMMIT: u8 = 10;
pub const OP_SYNC_COMMIT_REPLY: u8 = 11;
pub const OP_SNAPSHOT_SCORE: u8 = 12;
pub const OP_SNAPSHOT_SCORE_REPLY: u8 = 13;
pub const OP_UPDATE_ROLE: u8 = 14;
pub const OP_UPDATE_ROLE_REPLY: u8 = 15;
pub const OP_GROUP_VERSION: u8 = 16;
pub const OP_GROUP_VERSION_REPLY: u8 = 17;
pub const OP_JOINED: u8 = 100;
pub const OP_ADDRESS: u8 = 101;
pub const OP_ERROR: u8 = 102;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: u64,
    pub highest_term: Term,
    pub highest_position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteReply {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTerms {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermRangeEntry {
    pub prev_term: Term,
    pub term: Term,
    pub start_position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryData {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub prev_term: Term,
    pub term: Term,
    pub position: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteData {
    pub prev_term: Term,
    pub term: Term,
    pub index: u64,
    pub highest_index: u64,
    pub commit_index: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteDataReply {
    pub term: Term,
    pub highest_index: u64,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCommit {
    pub prev_term: Term,
    pub term: Term,
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCommitReply {
    pub group_version: u64,
    pub term: Term,
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotScore {
    pub active_sessions: u32,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRole {
    pub group_version: u64,
    pub member_id: u64,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRoleReply {
    pub group_version: u64,
    pub member_id: u64,
    pub error_code: u8,
}

/// Capability trait a peer connection (or, for loopback tests, the
/// [`crate::controller::Controller`] itself) implements. spec.md §9.
pub trait Channel: Send + Sync {
    fn nop(&self) -> ReplicationResult<()>;
    fn request_vote(&self, req: RequestVote) -> ReplicationResult<RequestVoteReply>;
    fn query_terms(&self, req: QueryTerms) -> ReplicationResult<Vec<TermRangeEntry>>;
    fn query_data(&self, req: QueryData) -> ReplicationResult<Vec<DataChunk>>;
    fn write_data(&self, req: WriteData) -> ReplicationResult<WriteDataReply>;
    fn sync_commit(&self, req: SyncCommit) -> ReplicationResult<SyncCommitReply>;
    fn snapshot_score(&self) -> ReplicationResult<SnapshotScore>;
    fn update_role(&self, req: UpdateRole) -> ReplicationResult<UpdateRoleReply>;
    fn group_version(&self, version: u64) -> ReplicationResult<u64>;
}

/// A `Channel` backed by a real TCP connection, reconnecting lazily on the
/// next call after a failure (spec.md §4.7 "network failures yield
/// reconnection at the Channel layer").
pub struct TcpChannel {
    address: String,
    timeout: Duration,
    stream: parking_lot::Mutex<Option<TcpStream>>,
}

impl TcpChannel {
    pub fn new(address: String, timeout: Duration) -> Self {
        Self {
            address,
            timeout,
            stream: parking_lot::Mutex::new(None),
        }
    }

    fn with_stream<T>(&self, f: impl FnOnce(&mut TcpStream) -> ReplicationResult<T>) -> ReplicationResult<T> {
        let mut guard = self.stream.lock();
        if guard.is_none() {
            let stream = TcpStream::connect(&self.address)?;
            stream.set_read_timeout(Some(self.timeout))?;
            stream.set_write_timeout(Some(self.timeout))?;
            stream.set_nodelay(true)?;
            *guard = Some(stream);
        }
        let result = f(guard.as_mut().unwrap());
        if result.is_err() {
            // Drop the stream so the next call reconnects.
            *guard = None;
        }
        result
    }

    fn roundtrip(&self, request: &[u8]) -> ReplicationResult<Vec<u8>> {
        self.with_stream(|stream| {
            write_frame(stream, request)?;
            read_frame(stream)
        })
    }
}

impl Channel for TcpChannel {
    fn nop(&self) -> ReplicationResult<()> {
        self.roundtrip(&[OP_NOP]).map(|_| ())
    }

    fn request_vote(&self, req: RequestVote) -> ReplicationResult<RequestVoteReply> {
        let mut buf = vec![OP_REQUEST_VOTE];
        buf.write_u64::<LittleEndian>(req.term.0)?;
        buf.write_u64::<LittleEndian>(req.candidate_id)?;
        buf.write_u64::<LittleEndian>(req.highest_term.0)?;
        buf.write_u64::<LittleEndian>(req.highest_position)?;
        let reply = self.roundtrip(&buf)?;
        decode_request_vote_reply(&reply)
    }

    fn query_terms(&self, req: QueryTerms) -> ReplicationResult<Vec<TermRangeEntry>> {
        let mut buf = vec![OP_QUERY_TERMS];
        buf.write_u64::<LittleEndian>(req.start)?;
        buf.write_u64::<LittleEndian>(req.end)?;
        let reply = self.roundtrip(&buf)?;
        decode_query_terms_reply(&reply)
    }

    fn query_data(&self, req: QueryData) -> ReplicationResult<Vec<DataChunk>> {
        let mut buf = vec![OP_QUERY_DATA];
        buf.write_u64::<LittleEndian>(req.start)?;
        buf.write_u64::<LittleEndian>(req.end)?;
        let reply = self.roundtrip(&buf)?;
        decode_query_data_reply(&reply)
    }

    fn write_data(&self, req: WriteData) -> ReplicationResult<WriteDataReply> {
        let mut buf = vec![OP_WRITE_DATA];
        buf.write_u64::<LittleEndian>(req.prev_term.0)?;
        buf.write_u64::<LittleEndian>(req.term.0)?;
        buf.write_u64::<LittleEndian>(req.index)?;
        buf.write_u64::<LittleEndian>(req.highest_index)?;
        buf.write_u64::<LittleEndian>(req.commit_index)?;
        buf.write_u32::<LittleEndian>(req.bytes.len() as u32)?;
        buf.extend_from_slice(&req.bytes);
        let reply = self.roundtrip(&buf)?;
        decode_write_data_reply(&reply)
    }

    fn sync_commit(&self, req: SyncCommit) -> ReplicationResult<SyncCommitReply> {
        let mut buf = vec![OP_SYNC_COMMIT];
        buf.write_u64::<LittleEndian>(req.prev_term.0)?;
        buf.write_u64::<LittleEndian>(req.term.0)?;
        buf.write_u64::<LittleEndian>(req.index)?;
        let reply = self.roundtrip(&buf)?;
        decode_sync_commit_reply(&reply)
    }

    fn snapshot_score(&self) -> ReplicationResult<SnapshotScore> {
        let reply = self.roundtrip(&[OP_SNAPSHOT_SCORE])?;
        decode_snapshot_score(&reply)
    }

    fn update_role(&self, req: UpdateRole) -> ReplicationResult<UpdateRoleReply> {
        let mut buf = vec![OP_UPDATE_ROLE];
        buf.write_u64::<LittleEndian>(req.group_version)?;
        buf.write_u64::<LittleEndian>(req.member_id)?;
        buf.push(role_to_byte(req.role));
        let reply = self.roundtrip(&buf)?;
        decode_update_role_reply(&reply)
    }

    fn group_version(&self, version: u64) -> ReplicationResult<u64> {
        let mut buf = vec![OP_GROUP_VERSION];
        buf.write_u64::<LittleEndian>(version)?;
        let reply = self.roundtrip(&buf)?;
        Ok((&reply[1..]).read_u64::<LittleEndian>()?)
    }
}

fn role_to_byte(role: Role) -> u8 {
    role.to_byte()
}

pub fn byte_to_role(b: u8) -> ReplicationResult<Role> {
    Role::from_byte(b)
}

fn decode_request_vote_reply(buf: &[u8]) -> ReplicationResult<RequestVoteReply> {
    let mut cur = &buf[1..];
    let raw = cur.read_u64::<LittleEndian>()?;
    Ok(RequestVoteReply {
        term: Term(raw & !(1 << 63)),
        granted: raw & (1 << 63) != 0,
    })
}

fn decode_query_terms_reply(buf: &[u8]) -> ReplicationResult<Vec<TermRangeEntry>> {
    let mut cur = &buf[1..];
    let count = cur.read_u32::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(TermRangeEntry {
            prev_term: Term(cur.read_u64::<LittleEndian>()?),
            term: Term(cur.read_u64::<LittleEndian>()?),
            start_position: cur.read_u64::<LittleEndian>()?,
        });
    }
    Ok(out)
}

fn decode_query_data_reply(buf: &[u8]) -> ReplicationResult<Vec<DataChunk>> {
    let mut cur = &buf[1..];
    let count = cur.read_u32::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let prev_term = Term(cur.read_u64::<LittleEndian>()?);
        let term = Term(cur.read_u64::<LittleEndian>()?);
        let position = cur.read_u64::<LittleEndian>()?;
        let len = cur.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        cur.read_exact(&mut bytes)?;
        out.push(DataChunk { prev_term, term, position, bytes });
    }
    Ok(out)
}

fn decode_write_data_reply(buf: &[u8]) -> ReplicationResult<WriteDataReply> {
    let mut cur = &buf[1..];
    let term = Term(cur.read_u64::<LittleEndian>()?);
    let highest_index = cur.read_u64::<LittleEndian>()?;
    let accepted = cur.read_u8()? != 0;
    Ok(WriteDataReply { term, highest_index, accepted })
}

fn decode_sync_commit_reply(buf: &[u8]) -> ReplicationResult<SyncCommitReply> {
    let mut cur = &buf[1..];
    Ok(SyncCommitReply {
        group_version: cur.read_u64::<LittleEndian>()?,
        term: Term(cur.read_u64::<LittleEndian>()?),
        index: cur.read_u64::<LittleEndian>()?,
    })
}

fn decode_snapshot_score(buf: &[u8]) -> ReplicationResult<SnapshotScore> {
    let mut cur = &buf[1..];
    Ok(SnapshotScore {
        active_sessions: cur.read_u32::<LittleEndian>()?,
        weight: cur.read_u32::<LittleEndian>()?,
    })
}

fn decode_update_role_reply(buf: &[u8]) -> ReplicationResult<UpdateRoleReply> {
    let mut cur = &buf[1..];
    Ok(UpdateRoleReply {
        group_version: cur.read_u64::<LittleEndian>()?,
        member_id: cur.read_u64::<LittleEndian>()?,
        error_code: cur.read_u8()?,
    })
}

// The decoders/encoders below are the listener-side counterparts of the
// request encoders/reply decoders above: a peer connection reads a request
// with these and replies with the matching encoder.

pub fn decode_request_vote(buf: &[u8]) -> ReplicationResult<RequestVote> {
    let mut cur = &buf[1..];
    Ok(RequestVote {
        term: Term(cur.read_u64::<LittleEndian>()?),
        candidate_id: cur.read_u64::<LittleEndian>()?,
        highest_term: Term(cur.read_u64::<LittleEndian>()?),
        highest_position: cur.read_u64::<LittleEndian>()?,
    })
}

pub fn encode_request_vote_reply(reply: &RequestVoteReply) -> Vec<u8> {
    let mut buf = vec![OP_REQUEST_VOTE_REPLY];
    let raw = reply.term.0 | if reply.granted { 1 << 63 } else { 0 };
    buf.write_u64::<LittleEndian>(raw).unwrap();
    buf
}

pub fn decode_query_terms(buf: &[u8]) -> ReplicationResult<QueryTerms> {
    let mut cur = &buf[1..];
    Ok(QueryTerms {
        start: cur.read_u64::<LittleEndian>()?,
        end: cur.read_u64::<LittleEndian>()?,
    })
}

pub fn encode_query_terms_reply(entries: &[TermRangeEntry]) -> Vec<u8> {
    let mut buf = vec![OP_QUERY_TERMS_REPLY];
    buf.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
    for entry in entries {
        buf.write_u64::<LittleEndian>(entry.prev_term.0).unwrap();
        buf.write_u64::<LittleEndian>(entry.term.0).unwrap();
        buf.write_u64::<LittleEndian>(entry.start_position).unwrap();
    }
    buf
}

pub fn decode_query_data(buf: &[u8]) -> ReplicationResult<QueryData> {
    let mut cur = &buf[1..];
    Ok(QueryData {
        start: cur.read_u64::<LittleEndian>()?,
        end: cur.read_u64::<LittleEndian>()?,
    })
}

pub fn encode_query_data_reply(chunks: &[DataChunk]) -> Vec<u8> {
    let mut buf = vec![OP_QUERY_DATA_REPLY];
    buf.write_u32::<LittleEndian>(chunks.len() as u32).unwrap();
    for chunk in chunks {
        buf.write_u64::<LittleEndian>(chunk.prev_term.0).unwrap();
        buf.write_u64::<LittleEndian>(chunk.term.0).unwrap();
        buf.write_u64::<LittleEndian>(chunk.position).unwrap();
        buf.write_u32::<LittleEndian>(chunk.bytes.len() as u32).unwrap();
        buf.extend_from_slice(&chunk.bytes);
    }
    buf
}

pub fn decode_write_data(buf: &[u8]) -> ReplicationResult<WriteData> {
    let mut cur = &buf[1..];
    let prev_term = Term(cur.read_u64::<LittleEndian>()?);
    let term = Term(cur.read_u64::<LittleEndian>()?);
    let index = cur.read_u64::<LittleEndian>()?;
    let highest_index = cur.read_u64::<LittleEndian>()?;
    let commit_index = cur.read_u64::<LittleEndian>()?;
    let len = cur.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes)?;
    Ok(WriteData { prev_term, term, index, highest_index, commit_index, bytes })
}

pub fn encode_write_data_reply(reply: &WriteDataReply) -> Vec<u8> {
    let mut buf = vec![OP_WRITE_DATA_REPLY];
    buf.write_u64::<LittleEndian>(reply.term.0).unwrap();
    buf.write_u64::<LittleEndian>(reply.highest_index).unwrap();
    buf.push(reply.accepted as u8);
    buf
}

pub fn decode_sync_commit(buf: &[u8]) -> ReplicationResult<SyncCommit> {
    let mut cur = &buf[1..];
    Ok(SyncCommit {
        prev_term: Term(cur.read_u64::<LittleEndian>()?),
        term: Term(cur.read_u64::<LittleEndian>()?),
        index: cur.read_u64::<LittleEndian>()?,
    })
}

pub fn encode_sync_commit_reply(reply: &SyncCommitReply) -> Vec<u8> {
    let mut buf = vec![OP_SYNC_COMMIT_REPLY];
    buf.write_u64::<LittleEndian>(reply.group_version).unwrap();
    buf.write_u64::<LittleEndian>(reply.term.0).unwrap();
    buf.write_u64::<LittleEndian>(reply.index).unwrap();
    buf
}

pub fn encode_snapshot_score_reply(score: &SnapshotScore) -> Vec<u8> {
    let mut buf = vec![OP_SNAPSHOT_SCORE_REPLY];
    buf.write_u32::<LittleEndian>(score.active_sessions).unwrap();
    buf.write_u32::<LittleEndian>(score.weight).unwrap();
    buf
}

pub fn decode_update_role(buf: &[u8]) -> ReplicationResult<UpdateRole> {
    let mut cur = &buf[1..];
    Ok(UpdateRole {
        group_version: cur.read_u64::<LittleEndian>()?,
        member_id: cur.read_u64::<LittleEndian>()?,
        role: byte_to_role(cur.read_u8()?)?,
    })
}

pub fn encode_update_role_reply(reply: &UpdateRoleReply) -> Vec<u8> {
    let mut buf = vec![OP_UPDATE_ROLE_REPLY];
    buf.write_u64::<LittleEndian>(reply.group_version).unwrap();
    buf.write_u64::<LittleEndian>(reply.member_id).unwrap();
    buf.push(reply.error_code);
    buf
}

pub fn decode_group_version_request(buf: &[u8]) -> ReplicationResult<u64> {
    let mut cur = &buf[1..];
    Ok(cur.read_u64::<LittleEndian>()?)
}

pub fn encode_group_version_reply(version: u64) -> Vec<u8> {
    let mut buf = vec![OP_GROUP_VERSION_REPLY];
    buf.write_u64::<LittleEndian>(version).unwrap();
    buf
}

/// A join request/reply pair, carried on its own listener socket rather
/// than the peer-to-peer channel (spec.md §6).
pub enum JoinReply {
    Joined { prev_term: Term, term: Term, index: u64, group_file_bytes: Vec<u8> },
    Address { leader_address: String },
    Error { code: JoinErrorCode },
}

pub fn encode_join_request(address: &str) -> Vec<u8> {
    let mut buf = vec![OP_JOIN];
    buf.write_u32::<LittleEndian>(address.len() as u32).unwrap();
    buf.extend_from_slice(address.as_bytes());
    buf
}

pub fn decode_join_request(buf: &[u8]) -> ReplicationResult<String> {
    let mut cur = &buf[1..];
    let len = cur.read_u32::<LittleEndian>()? as usize;
    let mut addr = vec![0u8; len];
    cur.read_exact(&mut addr)?;
    String::from_utf8(addr).map_err(|_| ReplicationError::InvalidAddress("non-utf8 address".into()))
}

pub fn encode_join_reply(reply: &JoinReply) -> Vec<u8> {
    let mut buf = Vec::new();
    match reply {
        JoinReply::Joined { prev_term, term, index, group_file_bytes } => {
            buf.push(OP_JOINED);
            buf.write_u64::<LittleEndian>(prev_term.0).unwrap();
            buf.write_u64::<LittleEndian>(term.0).unwrap();
            buf.write_u64::<LittleEndian>(*index).unwrap();
            buf.write_u32::<LittleEndian>(group_file_bytes.len() as u32).unwrap();
            buf.extend_from_slice(group_file_bytes);
        }
        JoinReply::Address { leader_address } => {
            buf.push(OP_ADDRESS);
            buf.write_u32::<LittleEndian>(leader_address.len() as u32).unwrap();
            buf.extend_from_slice(leader_address.as_bytes());
        }
        JoinReply::Error { code } => {
            buf.push(OP_ERROR);
            buf.push(*code as u8);
        }
    }
    buf
}

pub fn decode_join_reply(buf: &[u8]) -> ReplicationResult<JoinReply> {
    if buf.is_empty() {
        return Err(ReplicationError::Corruption("empty join reply".into()));
    }
    let mut cur = &buf[1..];
    match buf[0] {
        OP_JOINED => {
            let prev_term = Term(cur.read_u64::<LittleEndian>()?);
            let term = Term(cur.read_u64::<LittleEndian>()?);
            let index = cur.read_u64::<LittleEndian>()?;
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let mut bytes = vec![0u8; len];
            cur.read_exact(&mut bytes)?;
            Ok(JoinReply::Joined { prev_term, term, index, group_file_bytes: bytes })
        }
        OP_ADDRESS => {
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let mut addr = vec![0u8; len];
            cur.read_exact(&mut addr)?;
            Ok(JoinReply::Address {
                leader_address: String::from_utf8(addr).map_err(|_| ReplicationError::Corruption("non-utf8 leader address".into()))?,
            })
        }
        OP_ERROR => {
            let code = JoinErrorCode::from_u8(cur.read_u8()?).ok_or(ReplicationError::UnknownOperation(buf.get(1).copied().unwrap_or(0)))?;
            Ok(JoinReply::Error { code })
        }
        other => Err(ReplicationError::UnknownOperation(other)),
    }
}

/// Write a length-prefixed frame: `u32-le length` then `payload`.
pub fn write_frame(stream: &mut impl Write, payload: &[u8]) -> ReplicationResult<()> {
    stream.write_u32::<LittleEndian>(payload.len() as u32)?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

/// Read a length-prefixed frame written by [`write_frame`].
pub fn read_frame(stream: &mut impl Read) -> ReplicationResult<Vec<u8>> {
    let len = stream.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_request_round_trips() {
        let encoded = encode_join_request("127.0.0.1:4001");
        assert_eq!(encoded[0], OP_JOIN);
        let decoded = decode_join_request(&encoded).unwrap();
        assert_eq!(decoded, "127.0.0.1:4001");
    }

    #[test]
    fn join_reply_joined_round_trips() {
        let reply = JoinReply::Joined {
            prev_term: Term(1),
            term: Term(2),
            index: 42,
            group_file_bytes: vec![1, 2, 3, 4],
        };
        let encoded = encode_join_reply(&reply);
        match decode_join_reply(&encoded).unwrap() {
            JoinReply::Joined { prev_term, term, index, group_file_bytes } => {
                assert_eq!(prev_term, Term(1));
                assert_eq!(term, Term(2));
                assert_eq!(index, 42);
                assert_eq!(group_file_bytes, vec![1, 2, 3, 4]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn join_reply_error_round_trips() {
        let reply = JoinReply::Error { code: JoinErrorCode::NoLeader };
        let encoded = encode_join_reply(&reply);
        match decode_join_reply(&encoded).unwrap() {
            JoinReply::Error { code } => assert_eq!(code, JoinErrorCode::NoLeader),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn request_vote_round_trips_through_listener_decoders() {
        let req = RequestVote { term: Term(3), candidate_id: 7, highest_term: Term(2), highest_position: 99 };
        let mut buf = vec![OP_REQUEST_VOTE];
        buf.write_u64::<LittleEndian>(req.term.0).unwrap();
        buf.write_u64::<LittleEndian>(req.candidate_id).unwrap();
        buf.write_u64::<LittleEndian>(req.highest_term.0).unwrap();
        buf.write_u64::<LittleEndian>(req.highest_position).unwrap();
        let decoded = decode_request_vote(&buf).unwrap();
        assert_eq!(decoded, req);

        let reply = RequestVoteReply { term: Term(3), granted: true };
        let encoded = encode_request_vote_reply(&reply);
        let decoded_reply = decode_request_vote_reply(&encoded).unwrap();
        assert_eq!(decoded_reply, reply);
    }

    #[test]
    fn write_data_round_trips_through_listener_decoders() {
        let req = WriteData {
            prev_term: Term(1),
            term: Term(2),
            index: 10,
            highest_index: 15,
            commit_index: 5,
            bytes: vec![9, 8, 7, 6, 5],
        };
        let mut buf = vec![OP_WRITE_DATA];
        buf.write_u64::<LittleEndian>(req.prev_term.0).unwrap();
        buf.write_u64::<LittleEndian>(req.term.0).unwrap();
        buf.write_u64::<LittleEndian>(req.index).unwrap();
        buf.write_u64::<LittleEndian>(req.highest_index).unwrap();
        buf.write_u64::<LittleEndian>(req.commit_index).unwrap();
        buf.write_u32::<LittleEndian>(req.bytes.len() as u32).unwrap();
        buf.extend_from_slice(&req.bytes);
        assert_eq!(decode_write_data(&buf).unwrap(), req);

        let reply = WriteDataReply { term: Term(2), highest_index: 15, accepted: true };
        let encoded = encode_write_data_reply(&reply);
        assert_eq!(decode_write_data_reply(&encoded).unwrap(), reply);
    }

    #[test]
    fn query_terms_reply_round_trips_through_listener_encoder() {
        let entries = vec![TermRangeEntry { prev_term: Term(0), term: Term(1), start_position: 0 }, TermRangeEntry { prev_term: Term(1), term: Term(2), start_position: 100 }];
        let encoded = encode_query_terms_reply(&entries);
        let decoded = decode_query_terms_reply(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn update_role_round_trips_through_listener_decoders() {
        let req = UpdateRole { group_version: 4, member_id: 2, role: Role::Standby };
        let mut buf = vec![OP_UPDATE_ROLE];
        buf.write_u64::<LittleEndian>(req.group_version).unwrap();
        buf.write_u64::<LittleEndian>(req.member_id).unwrap();
        buf.push(role_to_byte(req.role));
        assert_eq!(decode_update_role(&buf).unwrap(), req);
    }

    #[test]
    fn frame_round_trips_over_a_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_frame(&mut cursor).unwrap();
        assert_eq!(payload, b"hello");
    }
}
