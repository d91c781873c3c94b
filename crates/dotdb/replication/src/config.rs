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

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the replication log and controller, following the same
/// struct-literal-with-`Default` convention as `dotdb_core::StorageConfig`.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Directory holding per-term segment files and the metadata file.
    pub log_dir: PathBuf,
    /// Directory holding the group roster file (and its `.new`/`.old` pair).
    pub group_dir: PathBuf,
    /// Maximum size of a single segment file before a new one is opened.
    pub segment_size: u64,
    /// Election timeout range, spec.md §4.7: uniformly random in [lo, hi).
    pub election_timeout: (Duration, Duration),
    /// Missing-data repair task delay range, spec.md §4.7: [400, 600) ms.
    pub missing_data_delay: (Duration, Duration),
    /// Minimum spacing between `query-terms` requests for the same gap.
    pub query_terms_rate_limit: Duration,
    /// Join/snapshot-reply/connect timeouts, spec.md §4.7.
    pub join_timeout: Duration,
    pub snapshot_reply_timeout: Duration,
    pub connect_timeout: Duration,
    /// This member's own id and address, used to exclude self from repair
    /// peer selection and to reject self-removal proposals.
    pub local_member_id: u64,
    pub local_address: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./dotdb/replication/log"),
            group_dir: PathBuf::from("./dotdb/replication"),
            segment_size: 64 * 1024 * 1024,
            election_timeout: (Duration::from_millis(200), Duration::from_millis(300)),
            missing_data_delay: (Duration::from_millis(400), Duration::from_millis(600)),
            query_terms_rate_limit: Duration::from_millis(1),
            join_timeout: Duration::from_secs(2),
            snapshot_reply_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(500),
            local_member_id: 1,
            local_address: "127.0.0.1:0".to_string(),
        }
    }
}
