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

//! Startup recovery. A transaction whose coordinator crashed is stuck in
//! whatever phase its document last persisted; resuming means handing every
//! such document back to a live coordinator. Participants never re-vote past
//! a recorded decision because the decision rides in the document itself.

use tracing::debug;

use super::{Coordinator, CoordinatorError, Result};
use crate::txn::{TxnDecision, TxnId};

/// Re-drives every persisted coordinator document to completion and returns
/// the decisions reached. Safe to run while other coordinators are live: a
/// document someone else is still driving makes exactly one of the two lose
/// its compare-and-swap, and the loser is skipped here.
pub async fn resume_all(coordinator: &Coordinator) -> Result<Vec<(TxnId, TxnDecision)>> {
    let docs = coordinator.ledger().coordinators().await.map_err(CoordinatorError::Ledger)?;
    let mut resolved = Vec::with_capacity(docs.len());
    for doc in docs {
        let txn = doc.txn;
        debug!("resuming transaction {txn} at {:?}", doc.phase);
        match coordinator.drive(doc).await {
            Ok(decision) => resolved.push((txn, decision)),
            Err(CoordinatorError::LostCoordinator { .. }) => {
                debug!("transaction {txn} taken over during resume");
            },
            Err(err) => return Err(err),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assertor::*;
    use async_trait::async_trait;

    use super::*;
    use crate::clock::Clock;
    use crate::command::{
        AbortRequest,
        ClientError,
        CommitRequest,
        ParticipantClient,
        PrepareRequest,
        PrepareVote,
        StatementReply,
        StatementRequest,
    };
    use crate::coordinator::CoordinatorConfig;
    use crate::fault::{FaultPoint, NoopFaults, ScriptedFaults};
    use crate::ledger::{MemoryLedger, TransactionLedger};
    use crate::routing::ShardId;
    use crate::txn::{ParticipantShard, SessionId};

    /// Promises everything and remembers what it was told.
    #[derive(Default)]
    struct PliantShards {
        clock: Clock,
        prepares: spin::Mutex<Vec<ShardId>>,
        commits: spin::Mutex<Vec<ShardId>>,
        aborts: spin::Mutex<Vec<ShardId>>,
    }

    #[async_trait]
    impl ParticipantClient for PliantShards {
        async fn statement(&self, shard: &ShardId, _request: StatementRequest) -> Result<StatementReply, ClientError> {
            unreachable!("no statements expected for {shard}")
        }

        async fn prepare(&self, shard: &ShardId, _request: PrepareRequest) -> Result<PrepareVote, ClientError> {
            self.prepares.lock().push(shard.clone());
            Ok(PrepareVote::Prepared { prepare_ts: self.clock.now() })
        }

        async fn commit(&self, shard: &ShardId, _request: CommitRequest) -> Result<(), ClientError> {
            self.commits.lock().push(shard.clone());
            Ok(())
        }

        async fn abort(&self, shard: &ShardId, _request: AbortRequest) -> Result<(), ClientError> {
            self.aborts.lock().push(shard.clone());
            Ok(())
        }
    }

    fn participants() -> Vec<ParticipantShard> {
        vec![ParticipantShard::writer(ShardId::from("s0")), ParticipantShard::writer(ShardId::from("s1"))]
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            participant_timeout: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            verify_participants: false,
        }
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn test_resume_after_crash_at_every_durable_boundary() {
        // A crash before the decision is durable re-runs prepare; a crash
        // after never does, because the decision rides in the document.
        let points = [
            (FaultPoint::BeforePrepareSend, 2),
            (FaultPoint::BeforeDecisionWrite, 4),
            (FaultPoint::BeforeNotify, 2),
            (FaultPoint::BeforeCoordinatorDelete, 2),
        ];
        for (point, expected_prepares) in points {
            let ledger = Arc::new(MemoryLedger::new());
            let client = Arc::new(PliantShards::default());
            let faults = ScriptedFaults::new();
            faults.arm(point, 1);
            let crashing =
                Coordinator::new(ledger.clone(), client.clone(), Clock::new(), Arc::new(faults), config());

            let txn = TxnId::new(SessionId::random(), 1);
            let outcome = crashing.run(txn, participants()).await;
            assert_that!(matches!(outcome, Err(CoordinatorError::Fault(_)))).is_equal_to(true);

            let fresh =
                Coordinator::new(ledger.clone(), client.clone(), Clock::new(), Arc::new(NoopFaults), config());
            let resolved = resume_all(&fresh).await.unwrap();
            assert_that!(resolved.len()).is_equal_to(1);
            assert_that!(resolved[0].0).is_equal_to(txn);
            assert_that!(resolved[0].1.is_commit()).is_equal_to(true);

            // Whether notification ran before or after the crash, each
            // participant hears the commit exactly once.
            assert_that!(client.prepares.lock().len()).is_equal_to(expected_prepares);
            assert_that!(client.commits.lock().len()).is_equal_to(2);
            assert_that!(client.aborts.lock().len()).is_equal_to(0);
            assert_that!(ledger.coordinators().await.unwrap().len()).is_equal_to(0);
        }
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn test_crash_before_participant_list_leaves_nothing_to_resume() {
        let ledger = Arc::new(MemoryLedger::new());
        let client = Arc::new(PliantShards::default());
        let faults = ScriptedFaults::new();
        faults.arm(FaultPoint::BeforeParticipantListWrite, 1);
        let crashing = Coordinator::new(ledger.clone(), client.clone(), Clock::new(), Arc::new(faults), config());

        let txn = TxnId::new(SessionId::random(), 1);
        let outcome = crashing.run(txn, participants()).await;
        assert_that!(matches!(outcome, Err(CoordinatorError::Fault(_)))).is_equal_to(true);

        // Nothing durable, nothing to resume: the transaction aborts by
        // default when its participants get superseded or reaped.
        let fresh = Coordinator::new(ledger.clone(), client, Clock::new(), Arc::new(NoopFaults), config());
        let resolved = resume_all(&fresh).await.unwrap();
        assert_that!(resolved.len()).is_equal_to(0);
        assert_that!(ledger.coordinators().await.unwrap().len()).is_equal_to(0);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn test_resume_with_empty_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let coordinator = Coordinator::new(
            ledger,
            Arc::new(PliantShards::default()),
            Clock::new(),
            Arc::new(NoopFaults),
            config(),
        );
        let resolved = resume_all(&coordinator).await.unwrap();
        assert_that!(resolved.len()).is_equal_to(0);
    }
}
