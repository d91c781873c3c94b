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

//! Persisted group roster: a UTF-8 `key = value` properties file, replaced
//! atomically by the classic `.new` / rename-over-current / delete-`.old`
//! dance so a crash mid-write never corrupts the live roster.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{info, warn};

use crate::error::{ReplicationError, ReplicationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Normal,
    Standby,
    Observer,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Normal => "NORMAL",
            Role::Standby => "STANDBY",
            Role::Observer => "OBSERVER",
        }
    }

    fn parse(s: &str) -> ReplicationResult<Self> {
        match s {
            "NORMAL" => Ok(Role::Normal),
            "STANDBY" => Ok(Role::Standby),
            "OBSERVER" => Ok(Role::Observer),
            other => Err(ReplicationError::Corruption(format!("unknown role {other}"))),
        }
    }

    /// Consensus peers are NORMAL+STANDBY; observers don't vote and are
    /// excluded from commit-quorum math.
    pub fn is_consensus(&self) -> bool {
        !matches!(self, Role::Observer)
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Role::Normal => 0,
            Role::Standby => 1,
            Role::Observer => 2,
        }
    }

    pub fn from_byte(b: u8) -> ReplicationResult<Self> {
        Ok(match b {
            0 => Role::Normal,
            1 => Role::Standby,
            2 => Role::Observer,
            other => return Err(ReplicationError::Corruption(format!("bad role byte {other}"))),
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub member_id: u64,
    pub address: String,
    pub role: Role,
}

/// A control message proposed against the roster and carried over the
/// replicated log (spec.md §4.6, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupControlMessage {
    Join { version: u64, nonce: u64, address: String },
    UpdateRole { version: u64, member_id: u64, role: Role },
    RemovePeer { version: u64, member_id: u64 },
}

impl GroupControlMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            GroupControlMessage::Join { .. } => 1,
            GroupControlMessage::UpdateRole { .. } => 2,
            GroupControlMessage::RemovePeer { .. } => 3,
        }
    }

    /// Serialize for carriage as a replicated-log entry (spec.md §4.6/§6):
    /// `{opcode u8}` followed by the variant's typed little-endian fields,
    /// matching the rest of this crate's hand-rolled wire conventions.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.opcode());
        match self {
            GroupControlMessage::Join { version, nonce, address } => {
                buf.write_u64::<LittleEndian>(*version).unwrap();
                buf.write_u64::<LittleEndian>(*nonce).unwrap();
                buf.write_u32::<LittleEndian>(address.len() as u32).unwrap();
                buf.extend_from_slice(address.as_bytes());
            }
            GroupControlMessage::UpdateRole { version, member_id, role } => {
                buf.write_u64::<LittleEndian>(*version).unwrap();
                buf.write_u64::<LittleEndian>(*member_id).unwrap();
                buf.push(role.to_byte());
            }
            GroupControlMessage::RemovePeer { version, member_id } => {
                buf.write_u64::<LittleEndian>(*version).unwrap();
                buf.write_u64::<LittleEndian>(*member_id).unwrap();
            }
        }
        buf
    }

    /// Inverse of [`Self::encode`].
    pub fn decode(buf: &[u8]) -> ReplicationResult<Self> {
        if buf.is_empty() {
            return Err(ReplicationError::Corruption("empty control message".into()));
        }
        let mut cur = &buf[1..];
        Ok(match buf[0] {
            1 => {
                let version = cur.read_u64::<LittleEndian>()?;
                let nonce = cur.read_u64::<LittleEndian>()?;
                let len = cur.read_u32::<LittleEndian>()? as usize;
                let mut addr = vec![0u8; len];
                cur.read_exact(&mut addr)?;
                let address = String::from_utf8(addr).map_err(|_| ReplicationError::Corruption("non-utf8 address in control message".into()))?;
                GroupControlMessage::Join { version, nonce, address }
            }
            2 => {
                let version = cur.read_u64::<LittleEndian>()?;
                let member_id = cur.read_u64::<LittleEndian>()?;
                let role = Role::from_byte(cur.read_u8()?)?;
                GroupControlMessage::UpdateRole { version, member_id, role }
            }
            3 => {
                let version = cur.read_u64::<LittleEndian>()?;
                let member_id = cur.read_u64::<LittleEndian>()?;
                GroupControlMessage::RemovePeer { version, member_id }
            }
            other => return Err(ReplicationError::UnknownOperation(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFileContents {
    pub version: u64,
    pub group_id: u64,
    pub members: Vec<Member>,
}

impl GroupFileContents {
    fn to_properties(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("version = {}\n", self.version));
        out.push_str(&format!("groupId = {}\n", self.group_id));
        for m in &self.members {
            out.push_str(&format!("{} = {} | {}\n", m.member_id, m.address, m.role));
        }
        out
    }

    fn from_properties(text: &str) -> ReplicationResult<Self> {
        let mut version = None;
        let mut group_id = None;
        let mut members = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ReplicationError::Corruption(format!("malformed group file line: {line}")))?;
            let key = key.trim();
            let value = value.trim();
            match key {
                "version" => version = Some(value.parse::<u64>().map_err(|_| ReplicationError::Corruption("bad version".into()))?),
                "groupId" => group_id = Some(value.parse::<u64>().map_err(|_| ReplicationError::Corruption("bad groupId".into()))?),
                member_id_str => {
                    let member_id = member_id_str.parse::<u64>().map_err(|_| ReplicationError::Corruption(format!("bad member id {member_id_str}")))?;
                    let (address, role) = value.split_once('|').ok_or_else(|| ReplicationError::Corruption(format!("malformed member line: {line}")))?;
                    members.push(Member {
                        member_id,
                        address: address.trim().to_string(),
                        role: Role::parse(role.trim())?,
                    });
                }
            }
        }
        Ok(Self {
            version: version.ok_or_else(|| ReplicationError::Corruption("missing version".into()))?,
            group_id: group_id.ok_or_else(|| ReplicationError::Corruption("missing groupId".into()))?,
            members,
        })
    }
}

type JoinCallback = Box<dyn FnOnce(GroupFileContents) + Send>;

/// The live, versioned roster plus pending-proposal callbacks.
pub struct GroupFile {
    path: PathBuf,
    contents: GroupFileContents,
    pending: BTreeMap<u64, JoinCallback>,
    local_member_id: u64,
}

impl GroupFile {
    /// Open (or recover) the roster at `path`. Recovery examines the
    /// `.new`/`.old` siblings of `path` per spec.md §3/§4.6.
    pub fn open(path: &Path, local_member_id: u64, bootstrap: impl FnOnce() -> GroupFileContents) -> ReplicationResult<Self> {
        let new_path = Self::new_path(path);
        let old_path = Self::old_path(path);

        if !path.exists() {
            if new_path.exists() {
                info!("recovering group file from .new after crash before rename");
                fs::rename(&new_path, path)?;
            } else if old_path.exists() {
                info!("recovering group file from .old after crash during rename");
                fs::rename(&old_path, path)?;
            }
        } else {
            // A crash after the final rename but before deleting `.old`
            // leaves a harmless leftover; clean it up.
            let _ = fs::remove_file(&old_path);
            let _ = fs::remove_file(&new_path);
        }

        let contents = if path.exists() {
            match fs::read_to_string(path).map_err(ReplicationError::from).and_then(|t| GroupFileContents::from_properties(&t)) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "group file parse failed, attempting .old recovery");
                    if old_path.exists() {
                        let text = fs::read_to_string(&old_path)?;
                        GroupFileContents::from_properties(&text)?
                    } else {
                        return Err(e);
                    }
                }
            }
        } else {
            let contents = bootstrap();
            let gf = Self {
                path: path.to_path_buf(),
                contents,
                pending: BTreeMap::new(),
                local_member_id,
            };
            gf.write_atomic()?;
            return Ok(gf);
        };

        Ok(Self {
            path: path.to_path_buf(),
            contents,
            pending: BTreeMap::new(),
            local_member_id,
        })
    }

    fn new_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_os_string();
        s.push(".new");
        PathBuf::from(s)
    }

    fn old_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_os_string();
        s.push(".old");
        PathBuf::from(s)
    }

    fn write_atomic(&self) -> ReplicationResult<()> {
        let new_path = Self::new_path(&self.path);
        let old_path = Self::old_path(&self.path);
        {
            let mut f = fs::File::create(&new_path)?;
            f.write_all(self.contents.to_properties().as_bytes())?;
            f.sync_all()?;
        }
        if self.path.exists() {
            fs::rename(&self.path, &old_path)?;
        }
        fs::rename(&new_path, &self.path)?;
        let _ = fs::remove_file(&old_path);
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.contents.version
    }

    pub fn group_id(&self) -> u64 {
        self.contents.group_id
    }

    pub fn members(&self) -> &[Member] {
        &self.contents.members
    }

    pub fn consensus_peers(&self) -> impl Iterator<Item = &Member> {
        self.contents.members.iter().filter(|m| m.role.is_consensus())
    }

    pub fn snapshot(&self) -> GroupFileContents {
        self.contents.clone()
    }

    /// Serialize `{version, length, content}` to `out`, spec.md §4.6.
    pub fn write_to(&self, out: &mut impl Write) -> ReplicationResult<()> {
        let body = self.contents.to_properties();
        let bytes = body.as_bytes();
        out.write_all(&self.contents.version.to_le_bytes())?;
        out.write_all(&(bytes.len() as u32).to_le_bytes())?;
        out.write_all(bytes)?;
        Ok(())
    }

    /// Read `{version, length, content}` from `input`, accepting only a
    /// strictly newer version than the one currently held.
    pub fn read_from(&mut self, input: &mut impl std::io::Read) -> ReplicationResult<bool> {
        let mut version_buf = [0u8; 8];
        input.read_exact(&mut version_buf)?;
        let version = u64::from_le_bytes(version_buf);
        let mut len_buf = [0u8; 4];
        input.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        input.read_exact(&mut body)?;
        if version <= self.contents.version {
            return Ok(false);
        }
        let text = String::from_utf8(body).map_err(|_| ReplicationError::Corruption("non-utf8 group file body".into()))?;
        let new_contents = GroupFileContents::from_properties(&text)?;
        self.contents = new_contents;
        self.write_atomic()?;
        Ok(true)
    }

    /// Construct a join control message and register `on_applied` to run
    /// once the exact message is applied after replication accepts it.
    pub fn propose_join(&mut self, address: String, nonce: u64, on_applied: impl FnOnce(GroupFileContents) + Send + 'static) -> GroupControlMessage {
        let msg = GroupControlMessage::Join {
            version: self.contents.version,
            nonce,
            address,
        };
        self.pending.insert(nonce, Box::new(on_applied));
        msg
    }

    pub fn propose_update_role(&self, member_id: u64, role: Role) -> GroupControlMessage {
        GroupControlMessage::UpdateRole {
            version: self.contents.version,
            member_id,
            role,
        }
    }

    pub fn propose_remove_peer(&self, member_id: u64) -> ReplicationResult<GroupControlMessage> {
        if member_id == self.local_member_id {
            return Err(ReplicationError::CannotRemoveSelf);
        }
        Ok(GroupControlMessage::RemovePeer { version: self.contents.version, member_id })
    }

    /// Apply a committed control message. Invoked by the controller once
    /// the message's log index is known durable/committed.
    pub fn apply(&mut self, message: &GroupControlMessage) -> ReplicationResult<()> {
        match message {
            GroupControlMessage::Join { version, nonce, address } => {
                if *version != self.contents.version {
                    return Err(ReplicationError::VersionMismatch { expected: self.contents.version, actual: *version });
                }
                let member_id = self.contents.version + 1;
                self.contents.members.push(Member {
                    member_id,
                    address: address.clone(),
                    role: Role::Observer,
                });
                self.contents.version += 1;
                self.write_atomic()?;
                info!(member_id, address = %address, "applied join");
                if let Some(cb) = self.pending.remove(nonce) {
                    cb(self.contents.clone());
                }
                Ok(())
            }
            GroupControlMessage::UpdateRole { version, member_id, role } => {
                if *version != self.contents.version {
                    return Err(ReplicationError::VersionMismatch { expected: self.contents.version, actual: *version });
                }
                let member = self.contents.members.iter_mut().find(|m| m.member_id == *member_id).ok_or(ReplicationError::UnknownMember(*member_id))?;
                member.role = *role;
                self.contents.version += 1;
                self.write_atomic()?;
                Ok(())
            }
            GroupControlMessage::RemovePeer { version, member_id } => {
                if *member_id == self.local_member_id {
                    return Err(ReplicationError::CannotRemoveSelf);
                }
                if *version != self.contents.version {
                    return Err(ReplicationError::VersionMismatch { expected: self.contents.version, actual: *version });
                }
                let before = self.contents.members.len();
                self.contents.members.retain(|m| m.member_id != *member_id);
                if self.contents.members.len() == before {
                    return Err(ReplicationError::UnknownMember(*member_id));
                }
                self.contents.version += 1;
                self.write_atomic()?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bootstrap() -> GroupFileContents {
        GroupFileContents {
            version: 2,
            group_id: 42,
            members: vec![
                Member { member_id: 1, address: "127.0.0.1:4001".into(), role: Role::Normal },
                Member { member_id: 2, address: "127.0.0.1:4002".into(), role: Role::Normal },
            ],
        }
    }

    #[test]
    fn join_then_apply_adds_observer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group");
        let mut gf = GroupFile::open(&path, 1, bootstrap).unwrap();
        let applied = std::sync::Arc::new(std::sync::Mutex::new(None));
        let applied2 = applied.clone();
        let msg = gf.propose_join("127.0.0.1:5000".into(), 7, move |snap| {
            *applied2.lock().unwrap() = Some(snap);
        });
        gf.apply(&msg).unwrap();
        assert_eq!(gf.version(), 3);
        assert_eq!(gf.members().last().unwrap().member_id, 3);
        assert!(applied.lock().unwrap().is_some());
    }

    #[test]
    fn write_to_read_from_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group");
        let gf = GroupFile::open(&path, 1, bootstrap).unwrap();
        let mut buf = Vec::new();
        gf.write_to(&mut buf).unwrap();

        let path2 = dir.path().join("group2");
        let mut gf2 = GroupFile::open(&path2, 1, || GroupFileContents { version: 0, group_id: 0, members: vec![] }).unwrap();
        assert!(gf2.read_from(&mut buf.as_slice()).unwrap());
        assert_eq!(gf2.version(), gf.version());
        assert_eq!(gf2.members(), gf.members());

        // A second application of the same (now stale) buffer is a no-op.
        assert!(!gf2.read_from(&mut buf.as_slice()).unwrap());
    }

    #[test]
    fn crash_after_new_before_rename_recovers_old() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group");
        {
            let _gf = GroupFile::open(&path, 1, bootstrap).unwrap();
        }
        // Simulate a crash: write `.new` but never rename over the live file.
        fs::write(GroupFile::new_path(&path), b"version = 99\ngroupId = 42\n").unwrap();
        let gf = GroupFile::open(&path, 1, bootstrap).unwrap();
        assert_eq!(gf.version(), 2);
        assert!(!GroupFile::new_path(&path).exists());
    }

    #[test]
    fn control_message_encode_decode_round_trips_each_variant() {
        let join = GroupControlMessage::Join { version: 3, nonce: 9, address: "127.0.0.1:5000".into() };
        assert_eq!(GroupControlMessage::decode(&join.encode()).unwrap(), join);

        let update_role = GroupControlMessage::UpdateRole { version: 4, member_id: 2, role: Role::Standby };
        assert_eq!(GroupControlMessage::decode(&update_role.encode()).unwrap(), update_role);

        let remove = GroupControlMessage::RemovePeer { version: 5, member_id: 7 };
        assert_eq!(GroupControlMessage::decode(&remove.encode()).unwrap(), remove);
    }

    #[test]
    fn cannot_remove_local_member() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group");
        let gf = GroupFile::open(&path, 1, bootstrap).unwrap();
        assert!(matches!(gf.propose_remove_peer(1), Err(ReplicationError::CannotRemoveSelf)));
    }
}
