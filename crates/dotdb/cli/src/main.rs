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

//! dotdb operator CLI: open a database directory, inspect row locks,
//! trigger checkpoints and compaction passes, and bootstrap/join/inspect a
//! replication group.

use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotdb_common::{IndexId, TransactionId};
use dotdb_core::fs::{FileSystemLayout, LayoutConfig};
use dotdb_core::recovery::{CheckpointConfig, CheckpointManager};
use dotdb_core::storage_engine::commit_lock::CommitLock;
use dotdb_core::storage_engine::file_format::FileFormat;
use dotdb_core::storage_engine::lib::StorageConfig;
use dotdb_core::storage_engine::lock::{LockManager, UpgradeRule};
use dotdb_core::storage_engine::page_manager::PageManager;
use dotdb_core::compaction::{CompactionManager, CompactionManagerConfig, CompactionTask};
use dotdb_replication::channel::{Channel, TcpChannel};
use dotdb_replication::join::{run_join_listener, GroupJoiner};
use dotdb_replication::{Controller, GroupFile, GroupFileContents, Member, ReplicationConfig, Role, Scheduler, StateLog};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dotdb")]
#[command(about = "dotdb storage engine operator CLI")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open (creating if absent) a database directory and report page stats
    Open {
        #[arg(long, short = 'd')]
        data_dir: PathBuf,
    },
    /// Acquire then release a single row lock, reporting how the request resolved
    Lock {
        #[arg(long, short = 'd')]
        data_dir: PathBuf,
        /// Index this key belongs to
        #[arg(long)]
        index: u64,
        /// Lock key, taken as raw bytes of the given string
        #[arg(long)]
        key: String,
        /// Requesting transaction id
        #[arg(long)]
        txn: u64,
        /// Lock mode to request
        #[arg(long, default_value = "shared")]
        mode: LockModeArg,
    },
    /// Create a checkpoint of every open undo log
    Checkpoint {
        #[arg(long, short = 'd')]
        data_dir: PathBuf,
    },
    /// List existing checkpoints, newest first
    Checkpoints {
        #[arg(long, short = 'd')]
        data_dir: PathBuf,
    },
    /// Run a single compaction pass and report whether it reclaimed pages
    Compact {
        #[arg(long, short = 'd')]
        data_dir: PathBuf,
        /// Target page count to compact down to
        #[arg(long)]
        target_pages: u64,
    },
    /// Replication group roster operations
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Bootstrap a brand-new single-member group roster
    Init {
        #[arg(long, short = 'g')]
        group_dir: PathBuf,
        #[arg(long)]
        member_id: u64,
        #[arg(long)]
        address: String,
    },
    /// Print the roster at `group_dir`
    Show {
        #[arg(long, short = 'g')]
        group_dir: PathBuf,
    },
    /// Join an existing group via one of its seed addresses
    Join {
        #[arg(long, short = 'g')]
        group_dir: PathBuf,
        #[arg(long)]
        member_id: u64,
        #[arg(long)]
        local_address: String,
        /// Comma-separated seed addresses to try in turn
        #[arg(long, value_delimiter = ',')]
        seeds: Vec<String>,
        #[arg(long, default_value_t = 2)]
        timeout_secs: u64,
    },
    /// Run this member's controller: binds the peer wire protocol and the
    /// join listener and serves both until killed.
    Serve {
        #[arg(long, short = 'g')]
        group_dir: PathBuf,
        #[arg(long, short = 'l')]
        log_dir: PathBuf,
        #[arg(long)]
        member_id: u64,
        /// Address this member's peers connect to; must match this
        /// member's address in the group roster
        #[arg(long)]
        listen: String,
        /// Address the join listener binds to, for nodes not yet in the
        /// roster
        #[arg(long)]
        join_listen: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum LockModeArg {
    Shared,
    Upgradable,
    Exclusive,
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Open { data_dir } => cmd_open(&data_dir),
        Commands::Lock { data_dir, index, key, txn, mode } => cmd_lock(&data_dir, index, &key, txn, mode),
        Commands::Checkpoint { data_dir } => cmd_checkpoint(&data_dir),
        Commands::Checkpoints { data_dir } => cmd_checkpoints(&data_dir),
        Commands::Compact { data_dir, target_pages } => cmd_compact(&data_dir, target_pages),
        Commands::Group { command } => match command {
            GroupCommands::Init { group_dir, member_id, address } => cmd_group_init(&group_dir, member_id, &address),
            GroupCommands::Show { group_dir } => cmd_group_show(&group_dir),
            GroupCommands::Join { group_dir, member_id, local_address, seeds, timeout_secs } => cmd_group_join(&group_dir, member_id, &local_address, &seeds, timeout_secs),
            GroupCommands::Serve { group_dir, log_dir, member_id, listen, join_listen } => cmd_group_serve(&group_dir, &log_dir, member_id, &listen, &join_listen),
        },
    };

    if let Err(e) = result {
        error!("command failed: {}", e);
        process::exit(1);
    }
}

fn storage_config(data_dir: &PathBuf) -> StorageConfig {
    StorageConfig { path: data_dir.clone(), ..StorageConfig::default() }
}

fn open_page_manager(data_dir: &PathBuf) -> anyhow::Result<(Arc<Mutex<PageManager>>, StorageConfig)> {
    std::fs::create_dir_all(data_dir)?;
    let config = storage_config(data_dir);
    let file_format = FileFormat::new(config.clone());
    let commit_lock = Arc::new(CommitLock::new());
    let page_manager = PageManager::new(Arc::new(Mutex::new(file_format)), commit_lock, config.page_size, config.page_limit);
    Ok((Arc::new(Mutex::new(page_manager)), config))
}

fn cmd_open(data_dir: &PathBuf) -> anyhow::Result<()> {
    let (page_manager, config) = open_page_manager(data_dir)?;
    let pm = page_manager.lock().unwrap();
    let total = pm.total_pages()?;
    println!("opened {}", data_dir.display());
    println!("  page size:     {}", config.page_size);
    println!("  total pages:   {total}");
    println!("  free pages:    {}", pm.free_pages_count());
    println!("  reserve pages: {}", pm.reserve_count());
    info!(dir = %data_dir.display(), total, "opened database");
    Ok(())
}

fn cmd_lock(data_dir: &PathBuf, index: u64, key: &str, txn: u64, mode: LockModeArg) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let manager = LockManager::new(16, UpgradeRule::Strict);
    let txn = TransactionId(txn);
    let index_id = IndexId(index);
    let key = key.as_bytes();

    let result = match mode {
        LockModeArg::Shared => manager.lock_shared(txn, index_id, key, Some(Duration::from_secs(1)))?,
        LockModeArg::Upgradable => manager.lock_upgradable(txn, index_id, key, Some(Duration::from_secs(1)))?,
        LockModeArg::Exclusive => manager.lock_exclusive(txn, index_id, key, Some(Duration::from_secs(1)))?,
    };
    println!("{result:?}");
    let stats = manager.statistics();
    println!("active locks: {}, waiting: {}", stats.active_locks, stats.waiting_requests);
    manager.release_all(txn)?;
    Ok(())
}

fn checkpoint_manager(data_dir: &PathBuf) -> anyhow::Result<CheckpointManager> {
    let layout = FileSystemLayout::new(LayoutConfig { base_path: data_dir.clone(), ..LayoutConfig::default() })?;
    Ok(CheckpointManager::new(layout, CheckpointConfig::default()))
}

fn cmd_checkpoint(data_dir: &PathBuf) -> anyhow::Result<()> {
    let mut manager = checkpoint_manager(data_dir)?;
    let metadata = manager.create_checkpoint()?;
    println!("checkpoint {} created, {} undo log descriptor(s), {} bytes", metadata.id, metadata.descriptor_count, metadata.size);
    info!(id = metadata.id, descriptors = metadata.descriptor_count, "created checkpoint");
    Ok(())
}

fn cmd_checkpoints(data_dir: &PathBuf) -> anyhow::Result<()> {
    let manager = checkpoint_manager(data_dir)?;
    let checkpoints = manager.list_checkpoints()?;
    if checkpoints.is_empty() {
        println!("no checkpoints found in {}", data_dir.display());
    } else {
        for c in checkpoints {
            println!("checkpoint {} at lsn {} ({} descriptors, {} bytes)", c.id, c.log_sequence_number, c.descriptor_count, c.size);
        }
    }
    Ok(())
}

fn cmd_compact(data_dir: &PathBuf, target_pages: u64) -> anyhow::Result<()> {
    let (page_manager, _) = open_page_manager(data_dir)?;
    let manager = CompactionManager::new(CompactionManagerConfig { enable_background_compaction: false, ..CompactionManagerConfig::default() }, page_manager);
    let task = CompactionTask {
        id: 1,
        target_page_count: target_pages,
        estimated_reclaimed_pages: 0,
        priority: 0,
        created_at: std::time::SystemTime::now(),
    };
    let result = manager.execute(task);
    if result.success {
        println!("compaction pass {} reclaimed {} page(s) in {:?}", result.task_id, result.pages_reclaimed, result.duration);
    } else {
        println!("compaction pass {} failed: {}", result.task_id, result.error_message.as_deref().unwrap_or("unknown error"));
    }
    Ok(())
}

fn cmd_group_init(group_dir: &PathBuf, member_id: u64, address: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(group_dir)?;
    let path = group_dir.join("group");
    let address = address.to_string();
    let group = GroupFile::open(&path, member_id, move || GroupFileContents {
        version: 1,
        group_id: member_id,
        members: vec![Member { member_id, address, role: Role::Normal }],
    })?;
    println!("group {} bootstrapped at {}, version {}", group.group_id(), path.display(), group.version());
    Ok(())
}

fn cmd_group_show(group_dir: &PathBuf) -> anyhow::Result<()> {
    let path = group_dir.join("group");
    let group = GroupFile::open(&path, 0, || GroupFileContents { version: 1, group_id: 0, members: Vec::new() })?;
    println!("group {} (version {})", group.group_id(), group.version());
    for m in group.members() {
        println!("  {:>3}  {:<24} {}", m.member_id, m.address, m.role);
    }
    Ok(())
}

fn cmd_group_serve(group_dir: &PathBuf, log_dir: &PathBuf, member_id: u64, listen: &str, join_listen: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(group_dir)?;
    std::fs::create_dir_all(log_dir)?;
    let group_path = group_dir.join("group");
    let group = GroupFile::open(&group_path, member_id, || GroupFileContents { version: 1, group_id: member_id, members: Vec::new() })?;
    if group.members().is_empty() {
        anyhow::bail!("no group roster at {}; run `group init` or `group join` first", group_path.display());
    }

    let config = ReplicationConfig {
        log_dir: log_dir.clone(),
        group_dir: group_dir.clone(),
        local_member_id: member_id,
        local_address: listen.to_string(),
        ..ReplicationConfig::default()
    };
    let state_log = StateLog::open(log_dir, "state", config.segment_size)?;
    let scheduler = Scheduler::new(4);
    let controller = Controller::new(config.clone(), state_log, group, scheduler);

    let peer_addresses: std::collections::HashMap<u64, String> = controller.group_snapshot().members.into_iter().map(|m| (m.member_id, m.address)).collect();
    let connect_timeout = config.connect_timeout;
    controller.refresh_peers(move |id| {
        let address = peer_addresses.get(&id).cloned().unwrap_or_default();
        Arc::new(TcpChannel::new(address, connect_timeout)) as Arc<dyn Channel>
    });
    controller.start();

    let peer_listener = std::net::TcpListener::bind(listen)?;
    let controller_for_peers = controller.clone();
    let peer_thread = std::thread::spawn(move || {
        controller_for_peers.run_peer_listener(peer_listener);
    });

    let join_listener = std::net::TcpListener::bind(join_listen)?;
    let join_timeout = config.join_timeout;
    let controller_for_join = controller.clone();
    let join_thread = std::thread::spawn(move || {
        run_join_listener(join_listener, move |addr| controller_for_join.handle_join(addr, join_timeout));
    });

    info!(member_id, listen, join_listen, "controller serving");
    println!("serving member {member_id}: peers on {listen}, joins on {join_listen}");
    peer_thread.join().map_err(|_| anyhow::anyhow!("peer listener thread panicked"))?;
    join_thread.join().map_err(|_| anyhow::anyhow!("join listener thread panicked"))?;
    Ok(())
}

fn cmd_group_join(group_dir: &PathBuf, member_id: u64, local_address: &str, seeds: &[String], timeout_secs: u64) -> anyhow::Result<()> {
    let joiner = GroupJoiner::new(Duration::from_secs(timeout_secs), Duration::from_secs(timeout_secs));
    let outcome = joiner.join(seeds, local_address)?;
    std::fs::create_dir_all(group_dir)?;
    let path = group_dir.join("group");
    let contents = outcome.group_file.clone();
    let group = GroupFile::open(&path, member_id, move || contents)?;
    println!("joined group {} at term {} (index {})", group.group_id(), outcome.term, outcome.index);
    for m in group.members() {
        println!("  {:>3}  {:<24} {}", m.member_id, m.address, m.role);
    }
    info!(member_id, term = %outcome.term, "joined replication group");
    Ok(())
}
