// Copyright 2025 The Quilt Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Soak driver: runs concurrent transfer sessions against an in-process
//! cluster while crashing coordinators and shard nodes, then audits the
//! survivors. Money is conserved or the run fails.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use quilt::applier;
use quilt::clock::Timestamp;
use quilt::cluster::LocalCluster;
use quilt::command::{Operation, StatementReply};
use quilt::coordinator::{resume_all, CoordinatorError};
use quilt::data::{DocKey, Document, FieldSet, Namespace, Value};
use quilt::fault::{FaultPoint, NoopFaults, ScriptedFaults};
use quilt::ledger::{FileLedger, MemoryLedger, TransactionLedger};
use quilt::reaper::SessionReaper;
use quilt::router::{Router, RouterError};
use quilt::routing::ShardId;
use quilt::shard::Keyspace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Number of shard nodes in the cluster.
    #[arg(long = "cluster.shards", default_value_t = 3)]
    shards: usize,
    /// Snapshot path for the transaction ledger; in-memory when absent.
    #[arg(long = "ledger.path")]
    ledger_path: Option<String>,
    /// Concurrent transfer sessions.
    #[arg(long = "soak.sessions", default_value_t = 4)]
    sessions: usize,
    /// Transfers each session runs to completion.
    #[arg(long = "soak.transfers", default_value_t = 200)]
    transfers: usize,
    /// Accounts in the shared namespace.
    #[arg(long = "soak.accounts", default_value_t = 64)]
    accounts: usize,
    /// A session's every n-th transfer commits under an injected
    /// coordinator crash and is settled by recovery.
    #[arg(long = "soak.fault-every", default_value_t = 23)]
    fault_every: usize,
    /// A session's every n-th transfer reboots a random shard node first.
    #[arg(long = "soak.crash-every", default_value_t = 41)]
    crash_every: usize,
    /// Sweep interval of each shard's background transaction reaper.
    #[arg(long = "reap.interval-ms", default_value_t = 50)]
    reap_interval_ms: u64,
}

const INITIAL_BALANCE: i64 = 100;

fn ns() -> Namespace {
    Namespace::from("bank.accounts")
}

fn account_key(index: usize) -> DocKey {
    DocKey::from(format!("acct-{index:04}").as_str())
}

#[derive(Debug, Default, Serialize)]
struct WorkerStats {
    committed: u64,
    conflict_retries: u64,
    transient_retries: u64,
    faulted_commits: u64,
    shard_crashes: u64,
    resumed_decisions: u64,
    /// Commits a recovery pass drove to completion first.
    raced_by_recovery: u64,
    failed: u64,
}

impl WorkerStats {
    fn absorb(&mut self, other: WorkerStats) {
        self.committed += other.committed;
        self.conflict_retries += other.conflict_retries;
        self.transient_retries += other.transient_retries;
        self.faulted_commits += other.faulted_commits;
        self.shard_crashes += other.shard_crashes;
        self.resumed_decisions += other.resumed_decisions;
        self.raced_by_recovery += other.raced_by_recovery;
        self.failed += other.failed;
    }
}

#[derive(Debug, Serialize)]
struct SoakReport {
    shards: usize,
    accounts: usize,
    sessions: usize,
    transfers_per_session: usize,
    #[serde(flatten)]
    stats: WorkerStats,
    reaped_transactions: u64,
    leftover_coordinators: usize,
    total_balance: i64,
    expected_balance: i64,
    conserved: bool,
    oplog_replay_matches: bool,
}

async fn read_balance(session: &mut Router, key: &DocKey) -> Result<i64, RouterError> {
    let reply = session.execute(&ns(), Operation::Get { key: key.clone() }).await?;
    let doc = match reply {
        StatementReply::Doc(doc) => doc,
        StatementReply::Done => None,
    };
    Ok(doc
        .expect("seeded account missing")
        .get("balance")
        .and_then(Value::as_int)
        .expect("account without balance"))
}

async fn set_balance(session: &mut Router, key: &DocKey, balance: i64) -> Result<(), RouterError> {
    let mut set = FieldSet::new();
    set.insert("balance".into(), Value::Int(balance));
    session.execute(&ns(), Operation::UpdateSet { key: key.clone(), set }).await?;
    Ok(())
}

async fn run_transfer(
    session: &mut Router,
    from: &DocKey,
    to: &DocKey,
    amount: i64,
) -> Result<Timestamp, RouterError> {
    session.begin().await;
    let from_balance = read_balance(session, from).await?;
    let to_balance = read_balance(session, to).await?;
    set_balance(session, from, from_balance - amount).await?;
    set_balance(session, to, to_balance + amount).await?;
    session.commit().await
}

async fn run_session(cluster: Arc<LocalCluster>, worker: usize, args: Arc<Args>) -> WorkerStats {
    let mut rng = StdRng::from_entropy();
    let mut stats = WorkerStats::default();
    let mut session = cluster.session();

    for transfer in 1..=args.transfers {
        let from = rng.gen_range(0..args.accounts);
        let to = (from + rng.gen_range(1..args.accounts)) % args.accounts;
        let from = account_key(from);
        let to = account_key(to);
        let amount = rng.gen_range(1..10);

        if transfer % args.crash_every == 0 {
            let victim = ShardId::new(format!("s{}", rng.gen_range(0..args.shards)));
            if let Err(err) = cluster.crash_shard(&victim).await {
                warn!("worker {worker}: crash of {victim} failed: {err}");
            } else {
                stats.shard_crashes += 1;
            }
        }

        if transfer % args.fault_every == 0 {
            stats.faulted_commits += 1;
            run_faulted_transfer(&cluster, &mut rng, &mut stats, &from, &to, amount).await;
            continue;
        }

        let mut attempts = 0;
        loop {
            match run_transfer(&mut session, &from, &to, amount).await {
                Ok(_) => {
                    stats.committed += 1;
                    break;
                },
                Err(RouterError::TransactionAborted { .. }) if attempts < 100 => {
                    attempts += 1;
                    stats.conflict_retries += 1;
                },
                Err(err) if err.is_transient() && attempts < 100 => {
                    attempts += 1;
                    stats.transient_retries += 1;
                },
                Err(RouterError::Coordinator(CoordinatorError::LostCoordinator { .. })) => {
                    // A concurrent recovery pass finished this commit.
                    stats.raced_by_recovery += 1;
                    break;
                },
                Err(err) => {
                    warn!("worker {worker}: transfer failed: {err}");
                    stats.failed += 1;
                    break;
                },
            }
        }
    }

    session.finish().await;
    stats
}

/// Commits one transfer under a coordinator that crashes at a random durable
/// boundary, then runs recovery to settle whatever the crash left behind.
async fn run_faulted_transfer(
    cluster: &LocalCluster,
    rng: &mut StdRng,
    stats: &mut WorkerStats,
    from: &DocKey,
    to: &DocKey,
    amount: i64,
) {
    let points = [
        FaultPoint::BeforeParticipantListWrite,
        FaultPoint::BeforePrepareSend,
        FaultPoint::BeforeDecisionWrite,
        FaultPoint::BeforeNotify,
        FaultPoint::BeforeCoordinatorDelete,
    ];
    let point = points[rng.gen_range(0..points.len())];
    let faults = Arc::new(ScriptedFaults::new());
    faults.arm(point, 1);

    let mut session = cluster.session_with(faults);
    match run_transfer(&mut session, from, to, amount).await {
        Err(RouterError::Coordinator(CoordinatorError::Fault(fault))) => {
            info!("injected coordinator crash at {:?}", fault.point)
        },
        // Statement-level trouble can end the attempt before the armed
        // boundary is reached; recovery below still settles the leftovers.
        other => info!("faulted transfer ended early: {other:?}"),
    }
    session.finish().await;

    match resume_all(&cluster.coordinator(Arc::new(NoopFaults))).await {
        Ok(resumed) => stats.resumed_decisions += resumed.len() as u64,
        Err(err) => warn!("recovery sweep failed: {err}"),
    }
}

async fn seed_accounts(cluster: &LocalCluster, accounts: usize) {
    let mut session = cluster.session();
    session.begin().await;
    for index in 0..accounts {
        let doc = Document::new(account_key(index)).with("balance", INITIAL_BALANCE);
        session.execute(&ns(), Operation::Insert { doc }).await.unwrap();
    }
    session.commit().await.unwrap();
    session.finish().await;
}

async fn audit_balances(cluster: &LocalCluster, accounts: usize) -> i64 {
    let mut total = 0;
    for index in 0..accounts {
        let doc = cluster.read(&ns(), &account_key(index)).await.unwrap();
        total += doc.and_then(|doc| doc.get("balance").and_then(Value::as_int)).unwrap_or(0);
    }
    total
}

/// Replays each shard's recorded operations onto an empty keyspace and
/// compares with the live one.
async fn audit_oplogs(cluster: &LocalCluster, shards: usize) -> bool {
    let mut matches = true;
    for index in 0..shards {
        let shard = ShardId::new(format!("s{index}"));
        let node = cluster.node(&shard).unwrap();
        let ops = node.oplog_ops();

        let mut rebuilt = Keyspace::new();
        match applier::apply(&mut rebuilt, &ops) {
            Ok(stats) => {
                let collection = node.collection_uuid(&ns()).await.unwrap();
                let replayed = rebuilt.dump(collection).unwrap();
                let live = node.dump(&ns()).await.unwrap();
                if replayed != live {
                    warn!("shard {shard}: oplog replay diverges from live state");
                    matches = false;
                }
                info!(
                    "shard {shard}: replayed {} operations, {} benign overlaps",
                    ops.len(),
                    stats.benign()
                );
            },
            Err(err) => {
                warn!("shard {shard}: oplog replay failed: {err}");
                matches = false;
            },
        }
    }
    matches
}

async fn reap_everything(cluster: &LocalCluster, shards: usize) -> u64 {
    let mut reaped = 0;
    for index in 0..shards {
        let shard = ShardId::new(format!("s{index}"));
        let reaper = SessionReaper::new(
            shard,
            cluster.ledger().clone(),
            cluster.registry().clone(),
            Duration::from_secs(60),
        );
        reaped += reaper.sweep_once().await.unwrap() as u64;
    }
    reaped
}

#[tokio::main]
async fn main() {
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_level(true).with_file(true).with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Arc::new(Args::parse());
    assert!(args.shards >= 1 && args.accounts >= 2, "need at least one shard and two accounts");

    let ledger: Arc<dyn TransactionLedger> = match &args.ledger_path {
        Some(path) => Arc::new(FileLedger::open(path).await.unwrap()),
        None => Arc::new(MemoryLedger::new()),
    };

    let names: Vec<String> = (0..args.shards).map(|index| format!("s{index}")).collect();
    let shards: Vec<&str> = names.iter().map(String::as_str).collect();
    let cluster = Arc::new(LocalCluster::new(ledger, &shards));

    info!("starting {} shard cluster", args.shards);
    cluster.create_collection(ns(), ShardId::new("s0")).await.unwrap();
    let per_shard = args.accounts.div_ceil(args.shards);
    for index in 1..args.shards {
        let at = account_key(index * per_shard);
        cluster.split(&ns(), at, ShardId::new(format!("s{index}"))).await.unwrap();
    }
    seed_accounts(&cluster, args.accounts).await;
    info!("seeded {} accounts of {INITIAL_BALANCE} across {} shards", args.accounts, args.shards);

    let reapers: Vec<_> = (0..args.shards)
        .map(|index| {
            SessionReaper::new(
                ShardId::new(format!("s{index}")),
                cluster.ledger().clone(),
                cluster.registry().clone(),
                Duration::from_millis(args.reap_interval_ms),
            )
            .start()
        })
        .collect();

    let workers: Vec<_> = (0..args.sessions)
        .map(|worker| tokio::spawn(run_session(cluster.clone(), worker, args.clone())))
        .collect();
    let mut stats = WorkerStats::default();
    for worker in workers {
        stats.absorb(worker.await.unwrap());
    }

    // Settle anything the last crashes left behind, then stop the background
    // reapers so the closing sweep below is deterministic.
    let settled = resume_all(&cluster.coordinator(Arc::new(NoopFaults))).await.unwrap();
    stats.resumed_decisions += settled.len() as u64;
    drop(reapers);

    let total_balance = audit_balances(&cluster, args.accounts).await;
    let expected_balance = args.accounts as i64 * INITIAL_BALANCE;
    let oplog_replay_matches = audit_oplogs(&cluster, args.shards).await;
    let reaped_transactions = reap_everything(&cluster, args.shards).await;
    let leftover_coordinators = cluster.ledger().coordinators().await.unwrap().len();

    let report = SoakReport {
        shards: args.shards,
        accounts: args.accounts,
        sessions: args.sessions,
        transfers_per_session: args.transfers,
        stats,
        reaped_transactions,
        leftover_coordinators,
        total_balance,
        expected_balance,
        conserved: total_balance == expected_balance,
        oplog_replay_matches,
    };
    println!("{}", serde_json::to_string_pretty(&report).unwrap());

    if !report.conserved || !report.oplog_replay_matches || report.leftover_coordinators != 0 {
        std::process::exit(1);
    }
}
