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

//! The session-side face of transactions. A [Router] owns one session,
//! numbers its transactions and statements, routes each statement by key,
//! and decides what staleness means: before the transaction touches its
//! first shard a stale table is refreshed invisibly under a bounded budget,
//! afterwards staleness poisons the whole transaction and the client retries
//! it under a fresh number.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{Clock, Timestamp};
use crate::command::{
    AbortRequest,
    ClientError,
    Operation,
    ParticipantClient,
    ShardError,
    StatementReply,
    StatementRequest,
};
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::data::Namespace;
use crate::ledger::SessionRegistry;
use crate::retry::Budget;
use crate::routing::{RoutingCache, RoutingError, ShardId};
use crate::txn::{ParticipantShard, SessionId, StatementId, TxnDecision, TxnId, TxnNumber};

pub type Result<T, E = RouterError> = std::result::Result<T, E>;

/// Error label that tells a client to retry the whole transaction under a
/// fresh transaction number.
pub const TRANSIENT_TXN_LABEL: &str = "TransientTransactionError";

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no transaction in progress on this session")]
    NoTransaction,
    /// Routing never settled within the refresh budget. The transaction was
    /// aborted everywhere before this surfaced; carries [TRANSIENT_TXN_LABEL].
    #[error("routing refresh budget of {attempts} attempts exhausted: {last}")]
    RetryBudgetExhausted {
        attempts: u32,
        #[source]
        last: ShardError,
    },
    #[error("transaction {txn} aborted")]
    TransactionAborted { txn: TxnId },
    /// The transaction cannot continue but a retry under a fresh number may
    /// succeed. Carries [TRANSIENT_TXN_LABEL].
    #[error("transaction must be retried: {source}")]
    Transient {
        #[source]
        source: ClientError,
    },
    /// Statement-level refusal; the transaction itself is still open.
    #[error(transparent)]
    Shard(ShardError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl RouterError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RouterError::Transient { .. }
                | RouterError::TransactionAborted { .. }
                | RouterError::RetryBudgetExhausted { .. }
        )
    }

    pub fn labels(&self) -> &'static [&'static str] {
        if self.is_transient() {
            &[TRANSIENT_TXN_LABEL]
        } else {
            &[]
        }
    }

    fn ends_transaction(&self) -> bool {
        matches!(
            self,
            RouterError::Transient { .. }
                | RouterError::TransactionAborted { .. }
                | RouterError::RetryBudgetExhausted { .. }
        )
    }
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Invisible routing refreshes allowed per transaction before the
    /// router gives up on a namespace that will not settle.
    pub stale_retry_budget: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { stale_retry_budget: 10 }
    }
}

struct Attempt {
    txn: TxnId,
    next_statement: StatementId,
    /// Shards this transaction touched, in first-contact order. A shard
    /// stays read-only until a write statement succeeds on it.
    participants: Vec<ParticipantShard>,
    budget: Budget,
}

impl Attempt {
    fn contacted(&self, shard: &ShardId) -> bool {
        self.participants.iter().any(|p| p.shard == *shard)
    }

    fn started(&self) -> bool {
        !self.participants.is_empty()
    }

    fn note(&mut self, shard: ShardId, wrote: bool) {
        match self.participants.iter_mut().find(|p| p.shard == shard) {
            Some(participant) => {
                if wrote {
                    participant.read_only = false;
                }
            },
            None => {
                let participant =
                    if wrote { ParticipantShard::writer(shard) } else { ParticipantShard::reader(shard) };
                self.participants.push(participant);
            },
        }
    }
}

pub struct Router {
    session: SessionId,
    number: TxnNumber,
    config: RouterConfig,
    cache: Arc<RoutingCache>,
    client: Arc<dyn ParticipantClient>,
    coordinator: Coordinator,
    registry: Arc<dyn SessionRegistry>,
    clock: Clock,
    attempt: Option<Attempt>,
}

impl Router {
    pub fn new(
        session: SessionId,
        config: RouterConfig,
        cache: Arc<RoutingCache>,
        client: Arc<dyn ParticipantClient>,
        coordinator: Coordinator,
        registry: Arc<dyn SessionRegistry>,
        clock: Clock,
    ) -> Self {
        Self { session, number: 0, config, cache, client, coordinator, registry, clock, attempt: None }
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[inline]
    pub fn current_txn(&self) -> Option<TxnId> {
        self.attempt.as_ref().map(|attempt| attempt.txn)
    }

    /// Opens a transaction under the next number. An unfinished previous
    /// transaction is abandoned with a best-effort abort; participants that
    /// miss it get superseded by the new number anyway.
    pub async fn begin(&mut self) -> TxnId {
        if let Some(stale) = self.attempt.take() {
            debug!("session {}: abandoning {} for a new transaction", self.session, stale.txn);
            self.abort_participants(&stale).await;
        }
        self.number += 1;
        let txn = TxnId::new(self.session, self.number);
        self.attempt = Some(Attempt {
            txn,
            next_statement: 0,
            participants: Vec::new(),
            budget: Budget::new(self.config.stale_retry_budget),
        });
        self.registry.touch(self.session, self.clock.now()).await;
        txn
    }

    pub async fn execute(&mut self, namespace: &Namespace, op: Operation) -> Result<StatementReply> {
        let mut attempt = match self.attempt.take() {
            Some(attempt) => attempt,
            None => return Err(RouterError::NoTransaction),
        };
        let outcome = self.execute_in(&mut attempt, namespace, op).await;
        match outcome {
            Err(err) if err.ends_transaction() => {
                self.abort_participants(&attempt).await;
                Err(err)
            },
            outcome => {
                self.attempt = Some(attempt);
                outcome
            },
        }
    }

    async fn execute_in(
        &self,
        attempt: &mut Attempt,
        namespace: &Namespace,
        op: Operation,
    ) -> Result<StatementReply> {
        let statement_id = attempt.next_statement;
        loop {
            let table = self.cache.get(namespace).await?;
            let shard = table.locate(op.key()).clone();
            let request = StatementRequest {
                txn: attempt.txn,
                statement_id,
                start_transaction: !attempt.contacted(&shard),
                namespace: namespace.clone(),
                routing_version: table.version,
                op: op.clone(),
            };
            match self.client.statement(&shard, request).await {
                Ok(reply) => {
                    attempt.note(shard, !op.is_read_only());
                    attempt.next_statement += 1;
                    self.registry.touch(self.session, self.clock.now()).await;
                    return Ok(reply);
                },
                Err(ClientError::Shard(ShardError::StaleRouting { namespace: stale_ns, got, owned })) => {
                    if attempt.started() {
                        // The transaction already owns state somewhere; a
                        // silent re-route could scatter it across epochs.
                        debug!("session {}: {} hit stale routing mid-transaction", self.session, attempt.txn);
                        let source = ClientError::Shard(ShardError::StaleRouting {
                            namespace: stale_ns,
                            got,
                            owned,
                        });
                        return Err(RouterError::Transient { source });
                    }
                    match attempt.budget.spend() {
                        Some(refresh) => {
                            debug!(
                                "session {}: refreshing {namespace} (attempt {refresh}): \
                                 sent {got}, shard owns {owned}",
                                self.session
                            );
                            self.cache.refresh(namespace).await?;
                        },
                        None => {
                            return Err(RouterError::RetryBudgetExhausted {
                                attempts: attempt.budget.limit(),
                                last: ShardError::StaleRouting { namespace: stale_ns, got, owned },
                            });
                        },
                    }
                },
                Err(ClientError::Shard(err)) if err.is_transient() => {
                    attempt.note(shard, false);
                    return Err(RouterError::Transient { source: ClientError::Shard(err) });
                },
                Err(ClientError::Shard(err)) => {
                    // The shard executed nothing but holds the transaction
                    // open; the statement failed, the transaction did not.
                    attempt.note(shard, false);
                    return Err(RouterError::Shard(err));
                },
                Err(transport) => {
                    // Outcome unknown on that shard: the only safe move is
                    // to retry the whole transaction under a fresh number.
                    attempt.note(shard, false);
                    return Err(RouterError::Transient { source: transport });
                },
            }
        }
    }

    /// Commits through the coordinator. Returns the commit timestamp; an
    /// abort decision surfaces as [RouterError::TransactionAborted] with the
    /// transient label.
    pub async fn commit(&mut self) -> Result<Timestamp> {
        let attempt = match self.attempt.take() {
            Some(attempt) => attempt,
            None => return Err(RouterError::NoTransaction),
        };
        if attempt.participants.is_empty() {
            debug!("session {}: transaction {} committed without participants", self.session, attempt.txn);
            return Ok(self.clock.now());
        }
        let decision = self.coordinator.run(attempt.txn, attempt.participants.clone()).await?;
        self.registry.touch(self.session, self.clock.now()).await;
        match decision {
            TxnDecision::Commit { commit_ts } => Ok(commit_ts),
            TxnDecision::Abort => Err(RouterError::TransactionAborted { txn: attempt.txn }),
        }
    }

    /// Aborts the open transaction on every touched shard, best effort: a
    /// shard that misses the abort gets superseded or reaped later.
    pub async fn abort(&mut self) -> Result<()> {
        let attempt = match self.attempt.take() {
            Some(attempt) => attempt,
            None => return Err(RouterError::NoTransaction),
        };
        self.abort_participants(&attempt).await;
        self.registry.touch(self.session, self.clock.now()).await;
        Ok(())
    }

    /// Ends the session. Once the registry entry is gone, the reaper may
    /// collect whatever transaction state the session left on shards.
    pub async fn finish(mut self) {
        if let Some(attempt) = self.attempt.take() {
            self.abort_participants(&attempt).await;
        }
        self.registry.remove(self.session).await;
        debug!("session {} finished", self.session);
    }

    async fn abort_participants(&self, attempt: &Attempt) {
        for participant in &attempt.participants {
            match self.client.abort(&participant.shard, AbortRequest { txn: attempt.txn }).await {
                Ok(()) => (),
                Err(ClientError::Shard(ShardError::NoSuchTransaction { .. })) => (),
                Err(err) => {
                    warn!("session {}: abort of {} on {} failed: {err}", self.session, attempt.txn, participant.shard);
                },
            }
        }
    }
}
