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

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use super::{CoordinatorConfig, CoordinatorError, Result};
use crate::clock::{Clock, Timestamp};
use crate::command::{
    AbortReason,
    AbortRequest,
    CommitRequest,
    ParticipantClient,
    PrepareRequest,
    PrepareVote,
    ShardError,
};
use crate::fault::{FaultController, FaultPoint};
use crate::ledger::{LedgerError, TransactionLedger};
use crate::retry::Backoff;
use crate::routing::ShardId;
use crate::timer;
use crate::txn::{CoordinatorDoc, CoordinatorPhase, ParticipantShard, TxnDecision, TxnId};

/// Drives transactions through prepare, decision and notification. One
/// instance serves any number of transactions; per-transaction state lives
/// entirely in the ledger document.
#[derive(Clone)]
pub struct Coordinator {
    ledger: Arc<dyn TransactionLedger>,
    client: Arc<dyn ParticipantClient>,
    clock: Clock,
    faults: Arc<dyn FaultController>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        ledger: Arc<dyn TransactionLedger>,
        client: Arc<dyn ParticipantClient>,
        clock: Clock,
        faults: Arc<dyn FaultController>,
        config: CoordinatorConfig,
    ) -> Self {
        Self { ledger, client, clock, faults, config }
    }

    pub(crate) fn ledger(&self) -> &dyn TransactionLedger {
        self.ledger.as_ref()
    }

    /// Resolves a transaction across its participants and returns the
    /// decision. Calling again for the same transaction reattaches to the
    /// persisted document, so a retried commit converges on one decision.
    pub async fn run(&self, txn: TxnId, participants: Vec<ParticipantShard>) -> Result<TxnDecision> {
        if participants.iter().all(|p| p.read_only) {
            // Nothing was written anywhere, so there is nothing a crash
            // could leave half-done: commit straight away, no durable
            // coordinator state, no prepare round.
            let decision = TxnDecision::Commit { commit_ts: self.clock.now() };
            let doc = CoordinatorDoc::new(txn, participants);
            self.notify_participants(&doc, decision).await;
            debug!("read-only transaction {txn} resolved: {decision}");
            return Ok(decision);
        }

        self.faults.enter(FaultPoint::BeforeParticipantListWrite).await?;
        let doc = CoordinatorDoc::new(txn, participants);
        match self.ledger.insert_coordinator(doc.clone()).await {
            Ok(()) => self.drive(doc).await,
            Err(err) if err.is_phase_conflict() => match self.ledger.coordinator(txn).await {
                Ok(Some(existing)) => {
                    debug!("reattaching to coordinator for {txn} at {:?}", existing.phase);
                    self.drive(existing).await
                },
                Ok(None) => Err(CoordinatorError::LostCoordinator { txn }),
                Err(err) => Err(CoordinatorError::Ledger(err)),
            },
            Err(err) => Err(CoordinatorError::Ledger(err)),
        }
    }

    /// Advances a persisted document to completion, from whatever phase it
    /// holds. Every transition is a compare-and-swap against that phase, so
    /// two instances driving the same transaction cannot diverge: one of
    /// them loses with [CoordinatorError::LostCoordinator].
    pub(crate) async fn drive(&self, mut doc: CoordinatorDoc) -> Result<TxnDecision> {
        if doc.phase == CoordinatorPhase::ParticipantsWritten {
            if self.config.verify_participants {
                self.verify(&doc);
            }
            self.faults.enter(FaultPoint::BeforePrepareSend).await?;
            self.advance(&mut doc, CoordinatorPhase::Preparing).await?;
        }
        if doc.phase == CoordinatorPhase::Preparing && doc.decision.is_none() {
            let decision = self.prepare_round(&doc).await;
            self.faults.enter(FaultPoint::BeforeDecisionWrite).await?;
            self.record_decision(&mut doc, decision).await?;
        }
        let decision = match doc.decision {
            Some(decision) => decision,
            // A document past Preparing always carries its decision.
            None => return Err(CoordinatorError::LostCoordinator { txn: doc.txn }),
        };
        if doc.phase == CoordinatorPhase::DecisionWritten {
            self.faults.enter(FaultPoint::BeforeNotify).await?;
            self.notify_participants(&doc, decision).await;
            self.advance(&mut doc, CoordinatorPhase::Done).await?;
        }
        self.faults.enter(FaultPoint::BeforeCoordinatorDelete).await?;
        self.ledger
            .delete_coordinator(doc.txn, CoordinatorPhase::Done)
            .await
            .map_err(|err| self.lost(doc.txn, err))?;
        debug!("transaction {} resolved: {decision}", doc.txn);
        Ok(decision)
    }

    fn verify(&self, doc: &CoordinatorDoc) {
        let mut shards: Vec<_> = doc.participants.iter().map(|p| &p.shard).collect();
        shards.sort();
        shards.dedup();
        if shards.len() != doc.participants.len() {
            warn!("transaction {} lists duplicate participants: {:?}", doc.txn, doc.participants);
        }
    }

    async fn advance(&self, doc: &mut CoordinatorDoc, phase: CoordinatorPhase) -> Result<()> {
        let expected = doc.phase;
        doc.phase = phase;
        self.ledger.update_coordinator(doc.clone(), expected).await.map_err(|err| self.lost(doc.txn, err))
    }

    async fn record_decision(&self, doc: &mut CoordinatorDoc, decision: TxnDecision) -> Result<()> {
        let expected = doc.phase;
        if !doc.decide(decision) {
            return Err(CoordinatorError::LostCoordinator { txn: doc.txn });
        }
        self.ledger.update_coordinator(doc.clone(), expected).await.map_err(|err| self.lost(doc.txn, err))
    }

    fn lost(&self, txn: TxnId, err: LedgerError) -> CoordinatorError {
        if err.is_phase_conflict() {
            warn!("coordinator for {txn} lost its document: {err}");
            CoordinatorError::LostCoordinator { txn }
        } else {
            CoordinatorError::Ledger(err)
        }
    }

    /// One prepare round across the writing participants. Commits only if
    /// every writer promises; the first abort vote settles the round and the
    /// remaining calls are torn down.
    async fn prepare_round(&self, doc: &CoordinatorDoc) -> TxnDecision {
        let txn = doc.txn;
        let mut pending: FuturesUnordered<_> = doc
            .writers()
            .map(|p| {
                let shard = p.shard.clone();
                async move {
                    let vote = self.prepare_one(&shard, txn).await;
                    (shard, vote)
                }
            })
            .collect();
        let mut max_prepared = Timestamp::zero();
        while let Some((shard, vote)) = pending.next().await {
            match vote {
                PrepareVote::Prepared { prepare_ts } => {
                    max_prepared = max_prepared.max(prepare_ts);
                },
                PrepareVote::Abort { reason } => {
                    debug!("shard {shard} voted abort for {txn}: {reason:?}");
                    return TxnDecision::Abort;
                },
            }
        }
        TxnDecision::Commit { commit_ts: self.clock.update(max_prepared) }
    }

    /// Prepares one participant, retrying transport failures until it
    /// answers. A vote is a durable promise on the participant side, so
    /// asking again is safe and returns the same vote.
    async fn prepare_one(&self, shard: &ShardId, txn: TxnId) -> PrepareVote {
        let mut backoff = Backoff::new(self.config.retry_backoff, self.config.max_backoff);
        loop {
            let attempt =
                timer::timeout(self.config.participant_timeout, self.client.prepare(shard, PrepareRequest { txn }))
                    .await;
            match attempt {
                Ok(Ok(vote)) => return vote,
                Ok(Err(err)) => match err.into_shard_error() {
                    Ok(refusal) => {
                        // A participant that answers prepare with an error
                        // cannot be promising anything.
                        warn!("shard {shard} failed prepare of {txn}: {refusal}");
                        return PrepareVote::Abort { reason: AbortReason::AlreadyAborted };
                    },
                    Err(transport) => {
                        debug!("retrying prepare of {txn} on {shard}: {transport}");
                        backoff.pause().await;
                    },
                },
                Err(_elapsed) => {
                    debug!("retrying prepare of {txn} on {shard}: timed out");
                    backoff.pause().await;
                },
            }
        }
    }

    /// Delivers the decision to every participant, read-only ones included.
    /// Notification is mandatory forward progress: transport failures retry
    /// without bound, participant refusals are final and logged.
    async fn notify_participants(&self, doc: &CoordinatorDoc, decision: TxnDecision) {
        let mut pending: FuturesUnordered<_> =
            doc.participants.iter().map(|p| self.notify_one(&p.shard, doc.txn, decision)).collect();
        while pending.next().await.is_some() {}
    }

    async fn notify_one(&self, shard: &ShardId, txn: TxnId, decision: TxnDecision) {
        let mut backoff = Backoff::new(self.config.retry_backoff, self.config.max_backoff);
        loop {
            let attempt = match decision {
                TxnDecision::Commit { commit_ts } => {
                    timer::timeout(
                        self.config.participant_timeout,
                        self.client.commit(shard, CommitRequest { txn, commit_ts }),
                    )
                    .await
                },
                TxnDecision::Abort => {
                    timer::timeout(self.config.participant_timeout, self.client.abort(shard, AbortRequest { txn }))
                        .await
                },
            };
            match attempt {
                Ok(Ok(())) => return,
                Ok(Err(err)) => match err.into_shard_error() {
                    Ok(ShardError::NoSuchTransaction { .. }) => {
                        // The participant never made a promise and forgot
                        // the transaction; for it the outcome is already
                        // settled.
                        debug!("shard {shard} holds nothing of {txn} to {decision}");
                        return;
                    },
                    Ok(refusal) => {
                        warn!("shard {shard} refused {decision} of {txn}: {refusal}");
                        return;
                    },
                    Err(transport) => {
                        debug!("retrying {decision} of {txn} on {shard}: {transport}");
                        backoff.pause().await;
                    },
                },
                Err(_elapsed) => {
                    debug!("retrying {decision} of {txn} on {shard}: timed out");
                    backoff.pause().await;
                },
            }
        }
    }
}
