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

//! Raft-style replication layer: per-term segmented logs with missing-range
//! repair, a versioned group roster, and the controller driving election,
//! replication, and commit (spec.md §4.5-§4.7).

pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod group_file;
pub mod join;
pub mod scheduler;
pub mod snapshot;
pub mod state_log;
pub mod term_log;

pub use channel::Channel;
pub use config::ReplicationConfig;
pub use controller::{Controller, ControlMessageAcceptor, Mode};
pub use error::{ReplicationError, ReplicationResult};
pub use group_file::{GroupControlMessage, GroupFile, GroupFileContents, Member, Role};
pub use scheduler::Scheduler;
pub use state_log::StateLog;
pub use term_log::TermLog;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group_file::GroupFileContents;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn make_controller(dir: &std::path::Path, member_id: u64, members: Vec<Member>) -> Arc<Controller> {
        let mut config = ReplicationConfig::default();
        config.local_member_id = member_id;
        config.election_timeout = (Duration::from_secs(3600), Duration::from_secs(3601));
        config.missing_data_delay = (Duration::from_secs(3600), Duration::from_secs(3601));
        let state_log = StateLog::open(&dir.join(format!("log-{member_id}")), "state", 4096).unwrap();
        let group_path = dir.join(format!("group-{member_id}"));
        let group = GroupFile::open(&group_path, member_id, || GroupFileContents { version: 2, group_id: 1, members: members.clone() }).unwrap();
        let scheduler = Scheduler::new(2);
        Controller::new(config, state_log, group, scheduler)
    }

    #[test]
    fn controller_channel_impl_carries_a_vote_request() {
        let dir = TempDir::new().unwrap();
        let members = vec![
            Member { member_id: 1, address: "a".into(), role: Role::Normal },
            Member { member_id: 2, address: "b".into(), role: Role::Normal },
        ];
        let c1 = make_controller(dir.path(), 1, members.clone());
        let c2 = make_controller(dir.path(), 2, members.clone());

        // Wire each controller's peer set to the other's own Channel impl,
        // with no socket in between.
        let c2_for_1 = c2.clone();
        c1.refresh_peers(move |_| c2_for_1.clone() as Arc<dyn Channel>);
        let c1_for_2 = c1.clone();
        c2.refresh_peers(move |_| c1_for_2.clone() as Arc<dyn Channel>);

        c1.start();
        c2.start();

        let channel_to_c2: Arc<dyn Channel> = c2.clone();
        let reply = channel_to_c2
            .request_vote(channel::RequestVote {
                term: dotdb_common::Term(1),
                candidate_id: 1,
                highest_term: dotdb_common::Term(0),
                highest_position: 0,
            })
            .unwrap();
        assert!(reply.granted);
        assert_eq!(c2.current_term(), dotdb_common::Term(1));

        c1.shutdown();
        c2.shutdown();
    }
}
