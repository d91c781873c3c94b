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

//! Collection of [`TermLog`]s ordered by start position, plus the durable
//! metadata file (`current-term`, `voted-for`, `commit-position`,
//! `durable-position`) written atomically by rename.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dotdb_common::Term;
use tracing::{debug, info, warn};

use crate::error::{ReplicationError, ReplicationResult};
use crate::term_log::TermLog;

const METADATA_MAGIC: u32 = 0x4454_4C4D; // "DTLM"

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogMetadata {
    pub current_term: Term,
    pub voted_for: Option<u64>,
    pub commit_position: u64,
    pub durable_position: u64,
}

impl LogMetadata {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40);
        buf.write_u32::<LittleEndian>(METADATA_MAGIC).unwrap();
        buf.write_u64::<LittleEndian>(self.current_term.0).unwrap();
        buf.write_i64::<LittleEndian>(self.voted_for.map(|v| v as i64).unwrap_or(-1)).unwrap();
        buf.write_u64::<LittleEndian>(self.commit_position).unwrap();
        buf.write_u64::<LittleEndian>(self.durable_position).unwrap();
        let checksum = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(checksum).unwrap();
        buf
    }

    fn decode(bytes: &[u8]) -> ReplicationResult<Self> {
        if bytes.len() < 40 {
            return Err(ReplicationError::Corruption("metadata file truncated".into()));
        }
        let mut cur = bytes;
        let magic = cur.read_u32::<LittleEndian>().unwrap();
        if magic != METADATA_MAGIC {
            return Err(ReplicationError::Corruption("bad metadata magic".into()));
        }
        let body_end = bytes.len() - 4;
        let checksum_expected = (&bytes[body_end..]).read_u32::<LittleEndian>().unwrap();
        let checksum_actual = crc32fast::hash(&bytes[..body_end]);
        if checksum_actual != checksum_expected {
            return Err(ReplicationError::Corruption("metadata checksum mismatch".into()));
        }
        let term = cur.read_u64::<LittleEndian>().unwrap();
        let voted_raw = cur.read_i64::<LittleEndian>().unwrap();
        let commit_position = cur.read_u64::<LittleEndian>().unwrap();
        let durable_position = cur.read_u64::<LittleEndian>().unwrap();
        Ok(Self {
            current_term: Term(term),
            voted_for: if voted_raw < 0 { None } else { Some(voted_raw as u64) },
            commit_position,
            durable_position,
        })
    }
}

/// The full replicated log: a set of per-term segmented logs plus the
/// metadata required to resume an election and commit tracking after
/// restart.
pub struct StateLog {
    dir: PathBuf,
    base_name: String,
    segment_size: u64,
    terms: Vec<TermLog>,
    metadata: LogMetadata,
    contiguous_position: u64,
}

impl StateLog {
    pub fn open(dir: &Path, base_name: &str, segment_size: u64) -> ReplicationResult<Self> {
        fs::create_dir_all(dir)?;
        let metadata = Self::read_metadata(dir)?.unwrap_or_default();
        let mut log = Self {
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            segment_size,
            terms: Vec::new(),
            metadata,
            contiguous_position: 0,
        };
        log.reload_terms()?;
        Ok(log)
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(format!("{}.meta", self.base_name))
    }

    fn read_metadata(dir: &Path) -> ReplicationResult<Option<LogMetadata>> {
        // Metadata files are written elsewhere with a fixed base name; this
        // helper is only used before `self` exists, so look for any
        // `*.meta` file in the directory.
        if !dir.exists() {
            return Ok(None);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".meta") {
                let mut buf = Vec::new();
                File::open(entry.path())?.read_to_end(&mut buf)?;
                return Ok(Some(LogMetadata::decode(&buf)?));
            }
        }
        Ok(None)
    }

    /// Rediscover term logs already on disk by scanning segment file names
    /// (`base.term.start`), grouping by term, and reopening each.
    fn reload_terms(&mut self) -> ReplicationResult<()> {
        let mut by_term: std::collections::BTreeMap<u64, Vec<u64>> = std::collections::BTreeMap::new();
        if self.dir.exists() {
            let prefix = format!("{}.", self.base_name);
            for entry in fs::read_dir(&self.dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy().to_string();
                if let Some(rest) = name.strip_prefix(&prefix) {
                    let parts: Vec<&str> = rest.splitn(2, '.').collect();
                    if parts.len() == 2 {
                        if let (Ok(term), Ok(file_start)) = (parts[0].parse::<u64>(), parts[1].parse::<u64>()) {
                            by_term.entry(term).or_default().push(file_start);
                        }
                    }
                }
            }
        }
        for (term, mut starts) in by_term {
            starts.sort_unstable();
            let start_position = starts[0];
            let log = TermLog::reopen(&self.dir, &self.base_name, Term(0), Term(term), start_position, None, self.segment_size)?;
            self.terms.push(log);
        }
        self.terms.sort_by_key(|t| t.start_position());
        self.contiguous_position = self.recompute_contiguous(0);
        Ok(())
    }

    pub fn commit_position(&self) -> u64 {
        self.metadata.commit_position
    }

    pub fn durable_position(&self) -> u64 {
        self.metadata.durable_position
    }

    pub fn current_term(&self) -> Term {
        self.metadata.current_term
    }

    pub fn voted_for(&self) -> Option<u64> {
        self.metadata.voted_for
    }

    pub fn contiguous_position(&self) -> u64 {
        self.contiguous_position
    }

    /// Persist `(current-term, voted-for)` atomically (write `.new`, rename
    /// over the live file), so a crash never observes a torn pair.
    pub fn persist_term_vote(&mut self, term: Term, voted_for: Option<u64>) -> ReplicationResult<()> {
        self.metadata.current_term = term;
        self.metadata.voted_for = voted_for;
        self.persist_metadata()
    }

    fn persist_metadata(&self) -> ReplicationResult<()> {
        let path = self.metadata_path();
        let tmp = path.with_extension("meta.new");
        {
            let mut f = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
            f.write_all(&self.metadata.encode())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn covering_index(&self, position: u64) -> Option<usize> {
        self.terms.iter().position(|t| t.start_position() <= position && position < t.end_position().unwrap_or(u64::MAX))
    }

    fn highest_position(&self) -> u64 {
        self.terms.iter().map(|t| t.highest_written_position()).max().unwrap_or(0)
    }

    /// Define a new term per spec.md §4.5's define-term rules. Returns
    /// `Ok(())` on success; a below-commit-position conflict surfaces as
    /// [`ReplicationError::CommitConflict`], which callers treat as
    /// non-fatal (resync and retry).
    pub fn define_term(&mut self, prev_term: Term, term: Term, start_position: u64) -> ReplicationResult<()> {
        if start_position > 0 {
            match self.covering_index(start_position - 1) {
                Some(idx) if self.terms[idx].term() != prev_term => {
                    return Err(ReplicationError::CommitConflict(format!(
                        "term {} expected previous term {}, found {} covering position {}",
                        term,
                        prev_term,
                        self.terms[idx].term(),
                        start_position - 1
                    )));
                }
                _ => {}
            }
        }

        if let Some(idx) = self.terms.iter().position(|t| t.term() == term) {
            // Re-defining the same term at a further position (a later RPC
            // for an already-open term). Must not move the start backwards.
            if self.terms[idx].start_position() > start_position {
                return Err(ReplicationError::CommitConflict(format!("term {} already started at {} > {}", term, self.terms[idx].start_position(), start_position)));
            }
            return Ok(());
        }

        // Truncate/evict any existing term whose span starts at or after
        // this new term's start: the new, higher term supersedes it.
        let mut i = 0;
        while i < self.terms.len() {
            if self.terms[i].start_position() >= start_position {
                if self.terms[i].term() >= term {
                    return Err(ReplicationError::CommitConflict(format!("cannot supersede term {} with non-newer term {}", self.terms[i].term(), term)));
                }
                if self.terms[i].start_position() < self.metadata.commit_position {
                    return Err(ReplicationError::CommitConflict(format!("term {} start {} is below commit position {}", self.terms[i].term(), self.terms[i].start_position(), self.metadata.commit_position)));
                }
                let removed = self.terms.remove(i);
                self.delete_term_files(removed.term());
                info!(term = removed.term().0, "evicted superseded term");
            } else {
                i += 1;
            }
        }

        // Close the term that used to cover `start_position`, if any, and
        // never below the commit position.
        if start_position > 0 {
            if let Some(idx) = self.covering_index(start_position - 1) {
                if start_position < self.metadata.commit_position {
                    return Err(ReplicationError::CommitConflict(format!("term {} define at {} is below commit position {}", term, start_position, self.metadata.commit_position)));
                }
                self.terms[idx].set_end_position(start_position);
            }
        }

        let log = TermLog::create(&self.dir, &self.base_name, prev_term, term, start_position, self.segment_size)?;
        self.terms.push(log);
        self.terms.sort_by_key(|t| t.start_position());
        debug!(term = term.0, start = start_position, "defined term");
        Ok(())
    }

    fn delete_term_files(&self, term: Term) {
        if let Ok(entries) = fs::read_dir(&self.dir) {
            let prefix = format!("{}.{}.", self.base_name, term.0);
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    pub fn write(&mut self, term: Term, position: u64, bytes: &[u8]) -> ReplicationResult<()> {
        let log = self.terms.iter_mut().find(|t| t.term() == term).ok_or(ReplicationError::UnknownTerm(term))?;
        log.write(position, bytes)?;
        self.contiguous_position = self.recompute_contiguous(self.contiguous_position);
        Ok(())
    }

    pub fn read(&mut self, term: Term, position: u64, len: usize) -> ReplicationResult<Vec<u8>> {
        let log = self.terms.iter_mut().find(|t| t.term() == term).ok_or(ReplicationError::UnknownTerm(term))?;
        log.read(position, len)
    }

    fn recompute_contiguous(&self, from: u64) -> u64 {
        let mut collector = Vec::new();
        self.missing_ranges_from(from, &mut collector)
    }

    /// Walk terms in start-position order and emit `(start, end)` gaps
    /// between `from` and the highest known written position. Returns the
    /// advanced contiguous position (frozen at the first gap).
    pub fn check_for_missing_data(&self, from: u64, collector: &mut Vec<(u64, u64)>) -> u64 {
        self.missing_ranges_from(from, collector)
    }

    fn missing_ranges_from(&self, from: u64, collector: &mut Vec<(u64, u64)>) -> u64 {
        let mut extents: Vec<(u64, u64)> = self.terms.iter().flat_map(|t| t.extents().iter().copied()).collect();
        extents.sort_by_key(|&(s, _)| s);

        let mut expected = from;
        let mut contiguous = from;
        let mut frozen = false;
        for (s, e) in extents {
            if e <= expected {
                continue;
            }
            let clipped_start = s.max(expected);
            if clipped_start > expected {
                collector.push((expected, clipped_start));
                frozen = true;
            }
            if !frozen {
                contiguous = e;
            }
            expected = e.max(expected);
        }
        contiguous
    }

    /// Advance the commit target. A majority-accepted position; does not by
    /// itself imply durability.
    pub fn commit(&mut self, position: u64) -> ReplicationResult<bool> {
        if position > self.metadata.commit_position {
            self.metadata.commit_position = position;
            self.persist_metadata()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Force an fsync of segment bytes up to `position` within `term`,
    /// recording the synced position for durable-quorum computation.
    pub fn sync_commit(&mut self, _prev_term: Term, term: Term, position: u64) -> ReplicationResult<bool> {
        let log = self.terms.iter_mut().find(|t| t.term() == term).ok_or(ReplicationError::UnknownTerm(term))?;
        log.sync(position)
    }

    /// Mark that a quorum has fsynced up to `position`. Returns true if the
    /// durable mark advanced.
    pub fn commit_durable(&mut self, position: u64) -> ReplicationResult<bool> {
        if position > self.metadata.durable_position {
            self.metadata.durable_position = position.min(self.metadata.commit_position);
            self.persist_metadata()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn highest_durable_position(&self) -> u64 {
        self.metadata.durable_position
    }

    /// `(highest-term, highest-position)` used by the vote-grant
    /// up-to-date comparison.
    pub fn highest_term_and_position(&self) -> (Term, u64) {
        let highest = self.highest_position();
        let term = self.terms.iter().filter(|t| t.start_position() <= highest).max_by_key(|t| t.start_position()).map(|t| t.term()).unwrap_or(Term(0));
        (term, highest)
    }

    /// Delete segment files entirely before `position`; partially covered
    /// segments are retained whole. Terms left empty are dropped.
    pub fn compact(&mut self, position: u64) -> ReplicationResult<()> {
        for log in &mut self.terms {
            log.compact(position)?;
        }
        self.terms.retain(|t| t.highest_written_position() > t.start_position() || t.end_position().is_none());
        if let Some(first) = self.terms.first_mut() {
            if first.start_position() < position && first.extents().first().map(|&(s, _)| s).unwrap_or(first.start_position()) >= position {
                warn!(position, "compaction advanced lowest term's effective start");
            }
        }
        Ok(())
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// Term boundaries `(prev_term, term, start_position)` for every term
    /// log whose span overlaps `[start, end)`, ordered by start position.
    /// Backs the `query-terms` RPC so a follower that rejected a
    /// `write-data` on a term conflict can reconcile its own term history
    /// against the leader's.
    pub fn terms_overlapping(&self, start: u64, end: u64) -> Vec<(Term, Term, u64)> {
        let mut matches: Vec<(Term, Term, u64)> = self
            .terms
            .iter()
            .filter(|t| t.start_position() < end && t.end_position().unwrap_or(u64::MAX) > start)
            .map(|t| (t.prev_term(), t.term(), t.start_position()))
            .collect();
        matches.sort_by_key(|&(_, _, start_position)| start_position);
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_data_detection_matches_scenario() {
        let dir = TempDir::new().unwrap();
        let mut log = StateLog::open(dir.path(), "state", 4096).unwrap();
        log.define_term(Term(0), Term(1), 0).unwrap();
        log.write(Term(1), 0, &vec![0u8; 100]).unwrap();
        log.define_term(Term(1), Term(2), 500).unwrap();
        log.write(Term(2), 500, &vec![0u8; 10]).unwrap();
        log.define_term(Term(2), Term(2), 600).unwrap();
        log.write(Term(2), 600, &vec![0u8; 10]).unwrap();

        let mut ranges = Vec::new();
        let contiguous = log.check_for_missing_data(100, &mut ranges);
        assert_eq!(contiguous, 100);
        assert_eq!(ranges, vec![(100, 500), (510, 600)]);
    }

    #[test]
    fn figure_7_log_d_convergence() {
        let dir = TempDir::new().unwrap();
        let mut log = StateLog::open(dir.path(), "state", 4096).unwrap();
        // Peer D holds terms [1,1,1,4,4,5,5,6,6,6,7,7] at positions 1..=12.
        let terms = [1u64, 1, 1, 4, 4, 5, 5, 6, 6, 6, 7, 7];
        let mut prev = Term(0);
        let mut pos = 1u64;
        let mut i = 0;
        while i < terms.len() {
            let t = terms[i];
            let start = pos;
            let mut run = 0u64;
            while i < terms.len() && terms[i] == t {
                run += 1;
                i += 1;
            }
            log.define_term(prev, Term(t), start).unwrap();
            log.write(Term(t), start, &vec![0u8; run as usize]).unwrap();
            pos += run;
            prev = Term(t);
        }

        // Leader now writes term 8 starting at position 11, overwriting the
        // tail that used to belong to term 7.
        log.define_term(Term(6), Term(8), 11).unwrap();
        log.write(Term(8), 11, &[0u8]).unwrap();

        assert!(log.terms.iter().all(|t| t.term() != Term(7)));
        let (term, highest) = log.highest_term_and_position();
        assert_eq!(term, Term(8));
        assert_eq!(highest, 12);
    }

    #[test]
    fn commit_and_durable_positions_are_monotone() {
        let dir = TempDir::new().unwrap();
        let mut log = StateLog::open(dir.path(), "state", 4096).unwrap();
        log.define_term(Term(0), Term(1), 0).unwrap();
        log.write(Term(1), 0, &vec![0u8; 50]).unwrap();
        assert!(log.commit(50).unwrap());
        assert!(!log.commit(10).unwrap());
        log.sync_commit(Term(0), Term(1), 50).unwrap();
        assert!(log.commit_durable(50).unwrap());
        assert!(log.durable_position() <= log.commit_position());
    }

    #[test]
    fn terms_overlapping_returns_boundaries_in_range() {
        let dir = TempDir::new().unwrap();
        let mut log = StateLog::open(dir.path(), "state", 4096).unwrap();
        log.define_term(Term(0), Term(1), 0).unwrap();
        log.write(Term(1), 0, &vec![0u8; 100]).unwrap();
        log.define_term(Term(1), Term(2), 100).unwrap();
        log.write(Term(2), 100, &vec![0u8; 50]).unwrap();

        let entries = log.terms_overlapping(50, 120);
        assert_eq!(entries, vec![(Term(0), Term(1), 0), (Term(1), Term(2), 100)]);
    }

    #[test]
    fn metadata_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = StateLog::open(dir.path(), "state", 4096).unwrap();
            log.persist_term_vote(Term(5), Some(3)).unwrap();
        }
        let log = StateLog::open(dir.path(), "state", 4096).unwrap();
        assert_eq!(log.current_term(), Term(5));
        assert_eq!(log.voted_for(), Some(3));
    }
}
