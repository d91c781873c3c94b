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

//! A single term's segmented append log.
//!
//! Segment files are named `base.term.file-start-position` (spec.md §6) and
//! are anchored to the term's own `start_position`: segment index `i` covers
//! the byte range `[start + i*segment_size, start + (i+1)*segment_size)`.
//! Within a term, writes need not arrive contiguously (a leader's RPCs can
//! race or be retried out of order), so a term tracks the set of byte
//! extents it has actually received rather than a single write cursor.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use dotdb_common::Term;

use crate::error::{ReplicationError, ReplicationResult};

struct Segment {
    file_start: u64,
    file: File,
}

/// Append-only log covering one replication term.
pub struct TermLog {
    term: Term,
    prev_term: Term,
    start_position: u64,
    end_position: Option<u64>,
    segment_size: u64,
    dir: PathBuf,
    base_name: String,
    segments: Vec<Segment>,
    /// Disjoint, merged `(start, end)` byte extents actually written.
    extents: Vec<(u64, u64)>,
    durable_position: u64,
}

impl TermLog {
    pub fn create(dir: &Path, base_name: &str, prev_term: Term, term: Term, start_position: u64, segment_size: u64) -> ReplicationResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            term,
            prev_term,
            start_position,
            end_position: None,
            segment_size,
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            segments: Vec::new(),
            extents: Vec::new(),
            durable_position: start_position,
        })
    }

    /// Re-open a term log whose segment files already exist on disk,
    /// reconstructing its extents from file lengths.
    pub fn reopen(dir: &Path, base_name: &str, prev_term: Term, term: Term, start_position: u64, end_position: Option<u64>, segment_size: u64) -> ReplicationResult<Self> {
        let mut log = Self {
            term,
            prev_term,
            start_position,
            end_position,
            segment_size,
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            segments: Vec::new(),
            extents: Vec::new(),
            durable_position: start_position,
        };
        let prefix = format!("{}.{}.", base_name, term.0);
        let mut file_starts = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(rest) = name.strip_prefix(&prefix) {
                    if let Ok(fs) = rest.parse::<u64>() {
                        file_starts.push(fs);
                    }
                }
            }
        }
        file_starts.sort_unstable();
        for file_start in file_starts {
            let path = log.segment_path(file_start);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let len = file.metadata()?.len();
            if len > 0 {
                log.extents.push((file_start, file_start + len));
            }
            log.segments.push(Segment { file_start, file });
        }
        log.merge_extents();
        log.durable_position = log.highest_written_position();
        Ok(log)
    }

    fn segment_path(&self, file_start: u64) -> PathBuf {
        self.dir.join(format!("{}.{}.{}", self.base_name, self.term.0, file_start))
    }

    fn segment_index_for(&self, position: u64) -> u64 {
        (position - self.start_position) / self.segment_size
    }

    fn file_start_for(&self, position: u64) -> u64 {
        self.start_position + self.segment_index_for(position) * self.segment_size
    }

    fn segment_mut(&mut self, file_start: u64) -> io::Result<&mut File> {
        if let Some(idx) = self.segments.iter().position(|s| s.file_start == file_start) {
            return Ok(&mut self.segments[idx].file);
        }
        let path = self.segment_path(file_start);
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        self.segments.push(Segment { file_start, file });
        self.segments.sort_by_key(|s| s.file_start);
        Ok(&mut self.segments.iter_mut().find(|s| s.file_start == file_start).unwrap().file)
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn prev_term(&self) -> Term {
        self.prev_term
    }

    pub fn start_position(&self) -> u64 {
        self.start_position
    }

    pub fn end_position(&self) -> Option<u64> {
        self.end_position
    }

    pub fn set_end_position(&mut self, position: u64) {
        self.end_position = Some(self.end_position.map_or(position, |e| e.min(position)));
    }

    pub fn is_closed(&self) -> bool {
        self.end_position.is_some()
    }

    pub fn extents(&self) -> &[(u64, u64)] {
        &self.extents
    }

    pub fn durable_position(&self) -> u64 {
        self.durable_position
    }

    /// Highest position such that every byte below it within this term has
    /// actually been written (i.e. the leading contiguous extent from
    /// `start_position`), ignoring any later, disjoint extents.
    pub fn contiguous_write_position(&self) -> u64 {
        match self.extents.first() {
            Some(&(s, e)) if s == self.start_position => e,
            _ => self.start_position,
        }
    }

    /// Highest position this term has written any byte up to, across all
    /// (possibly disjoint) extents.
    pub fn highest_written_position(&self) -> u64 {
        self.extents.last().map(|&(_, e)| e).unwrap_or(self.start_position)
    }

    fn merge_extents(&mut self) {
        self.extents.sort_by_key(|&(s, _)| s);
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.extents.len());
        for &(s, e) in &self.extents {
            if let Some(last) = merged.last_mut() {
                if s <= last.1 {
                    last.1 = last.1.max(e);
                    continue;
                }
            }
            merged.push((s, e));
        }
        self.extents = merged;
    }

    /// Write `bytes` at absolute position `position` (must fall within this
    /// term's span). May straddle multiple segment files.
    pub fn write(&mut self, position: u64, bytes: &[u8]) -> ReplicationResult<()> {
        if position < self.start_position {
            return Err(ReplicationError::Corruption(format!("write position {} precedes term {} start {}", position, self.term, self.start_position)));
        }
        if let Some(end) = self.end_position {
            if position + bytes.len() as u64 > end {
                return Err(ReplicationError::CommitConflict(format!("write extends past closed term {} end {}", self.term, end)));
            }
        }
        let mut offset = position;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let file_start = self.file_start_for(offset);
            let seg_offset = offset - file_start;
            let room = (self.segment_size - seg_offset) as usize;
            let chunk_len = remaining.len().min(room);
            let (chunk, rest) = remaining.split_at(chunk_len);
            let file = self.segment_mut(file_start)?;
            file.write_all_at(chunk, seg_offset)?;
            offset += chunk_len as u64;
            remaining = rest;
        }
        self.extents.push((position, position + bytes.len() as u64));
        self.merge_extents();
        Ok(())
    }

    pub fn read(&mut self, position: u64, len: usize) -> ReplicationResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut offset = position;
        let mut written = 0usize;
        while written < len {
            let file_start = self.file_start_for(offset);
            let seg_offset = offset - file_start;
            let room = (self.segment_size - seg_offset) as usize;
            let chunk_len = (len - written).min(room);
            let file = self.segment_mut(file_start)?;
            file.read_exact_at(&mut out[written..written + chunk_len], seg_offset)?;
            offset += chunk_len as u64;
            written += chunk_len;
        }
        Ok(out)
    }

    /// Fsync every segment touched up to `position`, recording the new
    /// durable mark if it advances.
    pub fn sync(&mut self, position: u64) -> ReplicationResult<bool> {
        for seg in &self.segments {
            if seg.file_start < position {
                seg.file.sync_data()?;
            }
        }
        if position > self.durable_position {
            self.durable_position = position;
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete whole segment files entirely before `position`; a segment
    /// partially covered by `position` is retained in full.
    pub fn compact(&mut self, position: u64) -> ReplicationResult<()> {
        let mut kept = Vec::with_capacity(self.segments.len());
        for seg in self.segments.drain(..) {
            if seg.file_start + self.segment_size <= position {
                std::fs::remove_file(self.segment_path(seg.file_start))?;
            } else {
                kept.push(seg);
            }
        }
        self.segments = kept;
        self.extents.retain(|&(_, e)| e > position);
        if let Some(first) = self.extents.first_mut() {
            if first.0 < position {
                first.0 = position;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut log = TermLog::create(dir.path(), "state", Term(0), Term(1), 0, 1024).unwrap();
        log.write(0, b"hello world").unwrap();
        assert_eq!(log.read(0, 11).unwrap(), b"hello world");
        assert_eq!(log.contiguous_write_position(), 11);
    }

    #[test]
    fn disjoint_extents_leave_a_gap() {
        let dir = TempDir::new().unwrap();
        let mut log = TermLog::create(dir.path(), "state", Term(1), Term(2), 500, 1024).unwrap();
        log.write(500, &[0u8; 10]).unwrap();
        log.write(600, &[0u8; 10]).unwrap();
        assert_eq!(log.extents(), &[(500, 510), (600, 610)]);
        assert_eq!(log.contiguous_write_position(), 510);
        assert_eq!(log.highest_written_position(), 610);
    }

    #[test]
    fn write_spanning_segments() {
        let dir = TempDir::new().unwrap();
        let mut log = TermLog::create(dir.path(), "state", Term(0), Term(1), 0, 8).unwrap();
        let data: Vec<u8> = (0..20u8).collect();
        log.write(0, &data).unwrap();
        assert_eq!(log.read(0, 20).unwrap(), data);
        assert_eq!(log.segments.len(), 3);
    }

    #[test]
    fn reopen_reconstructs_extents() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = TermLog::create(dir.path(), "state", Term(0), Term(1), 0, 1024).unwrap();
            log.write(0, b"abc").unwrap();
        }
        let log = TermLog::reopen(dir.path(), "state", Term(0), Term(1), 0, None, 1024).unwrap();
        assert_eq!(log.extents(), &[(0, 3)]);
    }
}
