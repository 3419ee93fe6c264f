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

//! The participant side of the transaction contract. A [ShardNode] executes
//! statements into per-transaction workspaces, persists its promise at
//! prepare before the vote leaves, applies decisions idempotently, and
//! answers redelivered statements from its records instead of re-executing
//! them.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use ignore_result::Ignore;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::store::{Keyspace, StoreError, Versioned};
use crate::clock::{Clock, Timestamp};
use crate::command::{
    AbortReason,
    AbortRequest,
    CommitRequest,
    Operation,
    PrepareRequest,
    PrepareVote,
    ShardError,
    StatementReply,
    StatementRequest,
};
use crate::data::{CollectionUuid, DocKey, Document, Namespace};
use crate::ledger::{LedgerError, TransactionLedger};
use crate::oplog::{Oplog, OplogEntry, RecordedOp};
use crate::routing::{ShardId, ShardVersion};
use crate::txn::{
    ImageEntry,
    ParticipantTxnRecord,
    SessionId,
    StagedWrite,
    TxnId,
    TxnNumber,
    TxnRecordState,
    WriteIntent,
};

pub type Result<T, E = NodeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

struct TxnSlot {
    record: ParticipantTxnRecord,
    workspace: BTreeMap<(CollectionUuid, DocKey), StagedWrite>,
}

impl TxnSlot {
    fn fresh(record: ParticipantTxnRecord) -> Self {
        Self { record, workspace: BTreeMap::new() }
    }
}

#[derive(Default)]
struct NodeState {
    keyspace: Keyspace,
    versions: HashMap<Namespace, ShardVersion>,
    sessions: HashMap<SessionId, TxnNumber>,
    txns: HashMap<TxnId, TxnSlot>,
}

impl NodeState {
    fn check_routing(&self, namespace: &Namespace, got: ShardVersion) -> Result<(), ShardError> {
        match self.versions.get(namespace) {
            None => Err(ShardError::NamespaceNotFound(namespace.clone())),
            Some(owned) if owned.mismatches(&got) => {
                Err(ShardError::StaleRouting { namespace: namespace.clone(), got, owned: *owned })
            },
            Some(_) => Ok(()),
        }
    }

    /// Reads through the transaction's workspace onto committed data.
    fn read_overlay(&self, txn: TxnId, collection: CollectionUuid, key: &DocKey) -> Option<Document> {
        if let Some(slot) = self.txns.get(&txn) {
            if let Some(staged) = slot.workspace.get(&(collection, key.clone())) {
                return match &staged.intent {
                    WriteIntent::Put(doc) => Some(doc.clone()),
                    WriteIntent::Delete => None,
                };
            }
        }
        match self.keyspace.get(collection, key) {
            Ok(versioned) => versioned.map(|v| v.doc.clone()),
            Err(_) => None,
        }
    }

    /// Commit timestamp of the committed version a new write observes. A
    /// repeatedly written key keeps the timestamp of its first observation.
    fn observed_ts(&self, txn: TxnId, collection: CollectionUuid, key: &DocKey) -> Timestamp {
        if let Some(slot) = self.txns.get(&txn) {
            if let Some(staged) = slot.workspace.get(&(collection, key.clone())) {
                return staged.observed_ts;
            }
        }
        match self.keyspace.get(collection, key) {
            Ok(Some(versioned)) => versioned.ts,
            _ => Timestamp::zero(),
        }
    }

    fn stage(&mut self, txn: TxnId, write: StagedWrite) {
        if let Some(slot) = self.txns.get_mut(&txn) {
            let key = (write.collection, write.key.clone());
            match slot.workspace.get_mut(&key) {
                Some(existing) => existing.intent = write.intent,
                None => {
                    slot.workspace.insert(key, write);
                },
            }
        }
    }
}

fn statement_error(namespace: &Namespace, err: StoreError) -> ShardError {
    match err {
        StoreError::DuplicateKey { collection, key } => ShardError::DuplicateKey { collection, key },
        StoreError::NamespaceExists(namespace) => ShardError::NamespaceExists(namespace),
        _ => ShardError::NamespaceNotFound(namespace.clone()),
    }
}

/// The storage-engine state that survives a crash: committed documents and
/// the committed-operation log. Everything else a restarted node needs lives
/// in the ledger.
pub struct DurableParts {
    pub keyspace: Keyspace,
    pub versions: HashMap<Namespace, ShardVersion>,
    pub oplog: Oplog,
}

pub struct ShardNode {
    id: ShardId,
    clock: Clock,
    ledger: Arc<dyn TransactionLedger>,
    oplog: Oplog,
    state: Mutex<NodeState>,
}

impl ShardNode {
    pub fn new(id: ShardId, clock: Clock, ledger: Arc<dyn TransactionLedger>) -> Self {
        Self { id, clock, ledger, oplog: Oplog::new(), state: Mutex::new(NodeState::default()) }
    }

    /// Rebuilds a node after a crash from its surviving storage plus the
    /// ledger. Prepared transactions come back with their staged writes and
    /// will honor whatever decision arrives; transactions that never reached
    /// prepare left no record and are simply forgotten, so their statements
    /// and decisions get [ShardError::NoSuchTransaction].
    pub async fn restore(
        id: ShardId,
        clock: Clock,
        ledger: Arc<dyn TransactionLedger>,
        parts: DurableParts,
    ) -> Result<Self> {
        let records = ledger.records(&id).await?;
        let mut state =
            NodeState { keyspace: parts.keyspace, versions: parts.versions, ..NodeState::default() };
        for record in records {
            let number = state.sessions.entry(record.txn.session).or_insert(record.txn.number);
            *number = (*number).max(record.txn.number);
            state.txns.insert(record.txn, TxnSlot::fresh(record));
        }
        debug!("shard {id}: restored {} transaction records", state.txns.len());
        Ok(Self { id, clock, ledger, oplog: parts.oplog, state: Mutex::new(state) })
    }

    #[inline]
    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub async fn parts(&self) -> DurableParts {
        let state = self.state.lock().await;
        DurableParts { keyspace: state.keyspace.clone(), versions: state.versions.clone(), oplog: self.oplog.clone() }
    }

    /// Installs the routing version this node answers for a namespace.
    pub async fn install_routing(&self, namespace: Namespace, version: ShardVersion) {
        self.state.lock().await.versions.insert(namespace, version);
    }

    pub async fn statement(&self, request: StatementRequest) -> Result<StatementReply> {
        let mut state = self.state.lock().await;
        state.check_routing(&request.namespace, request.routing_version)?;
        self.admit(&mut state, request.txn, request.start_transaction).await?;

        let txn = request.txn;
        let record_state = match state.txns.get(&txn) {
            Some(slot) => slot.record.state,
            None => return Err(ShardError::NoSuchTransaction { txn }.into()),
        };
        match record_state {
            TxnRecordState::Aborted => return Err(ShardError::TransactionAborted { txn }.into()),
            TxnRecordState::Committed => return Err(ShardError::TransactionCommitted { txn }.into()),
            TxnRecordState::Prepared => {
                return Err(ShardError::PreparedTxnInProgress { txn, prepared: txn }.into())
            },
            TxnRecordState::InProgress => (),
        }

        let executed = state.txns.get(&txn).map(|slot| slot.record.has_executed(request.statement_id));
        if executed == Some(true) {
            return self.replay_statement(&state, &request).await;
        }

        let reply = self.execute(&mut state, &request).await?;
        if let Some(slot) = state.txns.get_mut(&txn) {
            slot.record.last_statement_id = Some(request.statement_id);
            slot.record.last_update_ts = self.clock.now();
        }
        Ok(reply)
    }

    /// Serves a redelivered statement from bookkeeping without re-executing
    /// its writes.
    async fn replay_statement(&self, state: &NodeState, request: &StatementRequest) -> Result<StatementReply> {
        let txn = request.txn;
        match &request.op {
            Operation::Insert { .. } | Operation::UpdateSet { .. } | Operation::Delete { .. } => {
                debug!("shard {}: statement {} of {} redelivered", self.id, request.statement_id, txn);
                Ok(StatementReply::Done)
            },
            Operation::Get { key } => {
                let collection = match state.keyspace.resolve(&request.namespace) {
                    Some(collection) => collection,
                    None => return Err(ShardError::NamespaceNotFound(request.namespace.clone()).into()),
                };
                Ok(StatementReply::Doc(state.read_overlay(txn, collection, key)))
            },
            Operation::GetSet { .. } => match self.ledger.image(&self.id, txn, request.statement_id).await? {
                Some(entry) => Ok(StatementReply::Doc(entry.image)),
                None => {
                    // The image is persisted before the original reply, so a
                    // missing one means this shard never acknowledged the
                    // statement under this transaction.
                    warn!("shard {}: no image for redelivered statement {} of {}", self.id, request.statement_id, txn);
                    Err(ShardError::NoSuchTransaction { txn }.into())
                },
            },
        }
    }

    async fn execute(&self, state: &mut NodeState, request: &StatementRequest) -> Result<StatementReply> {
        let txn = request.txn;
        let collection = match state.keyspace.resolve(&request.namespace) {
            Some(collection) => collection,
            None => return Err(ShardError::NamespaceNotFound(request.namespace.clone()).into()),
        };
        match &request.op {
            Operation::Get { key } => Ok(StatementReply::Doc(state.read_overlay(txn, collection, key))),
            Operation::Insert { doc } => {
                if state.read_overlay(txn, collection, &doc.key).is_some() {
                    return Err(ShardError::DuplicateKey { collection, key: doc.key.clone() }.into());
                }
                let observed_ts = state.observed_ts(txn, collection, &doc.key);
                state.stage(txn, StagedWrite {
                    collection,
                    key: doc.key.clone(),
                    observed_ts,
                    intent: WriteIntent::Put(doc.clone()),
                });
                Ok(StatementReply::Done)
            },
            Operation::UpdateSet { key, set } => {
                match state.read_overlay(txn, collection, key) {
                    None => Ok(StatementReply::Done),
                    Some(mut doc) => {
                        doc.apply_set(set);
                        let observed_ts = state.observed_ts(txn, collection, key);
                        state.stage(txn, StagedWrite {
                            collection,
                            key: key.clone(),
                            observed_ts,
                            intent: WriteIntent::Put(doc),
                        });
                        Ok(StatementReply::Done)
                    },
                }
            },
            Operation::Delete { key } => {
                match state.read_overlay(txn, collection, key) {
                    None => Ok(StatementReply::Done),
                    Some(_) => {
                        let observed_ts = state.observed_ts(txn, collection, key);
                        state.stage(txn, StagedWrite {
                            collection,
                            key: key.clone(),
                            observed_ts,
                            intent: WriteIntent::Delete,
                        });
                        Ok(StatementReply::Done)
                    },
                }
            },
            Operation::GetSet { key, set } => {
                let pre = state.read_overlay(txn, collection, key);
                if let Some(doc) = &pre {
                    let mut next = doc.clone();
                    next.apply_set(set);
                    let observed_ts = state.observed_ts(txn, collection, key);
                    state.stage(txn, StagedWrite {
                        collection,
                        key: key.clone(),
                        observed_ts,
                        intent: WriteIntent::Put(next),
                    });
                }
                // Durable before the reply: a redelivery after commit must
                // reproduce this exact pre-image.
                let image = ImageEntry {
                    txn,
                    statement_id: request.statement_id,
                    image: pre.clone(),
                    operation_ts: self.clock.now(),
                };
                self.ledger.put_image(&self.id, image).await?;
                Ok(StatementReply::Doc(pre))
            },
        }
    }

    /// Applies the per-session monotonic number guard and opens a slot for a
    /// first statement. Higher numbers evict lower in-progress transactions;
    /// a prepared one blocks the newcomer until its decision arrives.
    async fn admit(&self, state: &mut NodeState, txn: TxnId, start_transaction: bool) -> Result<()> {
        if let Some(highest) = state.sessions.get(&txn.session).copied() {
            if txn.number < highest {
                return Err(ShardError::NoSuchTransaction { txn }.into());
            }
            if txn.number > highest {
                if !start_transaction {
                    return Err(ShardError::NoSuchTransaction { txn }.into());
                }
                self.supersede(state, txn).await?;
            }
        } else if !start_transaction {
            return Err(ShardError::NoSuchTransaction { txn }.into());
        }
        if !state.txns.contains_key(&txn) {
            if !start_transaction {
                return Err(ShardError::NoSuchTransaction { txn }.into());
            }
            state.sessions.insert(txn.session, txn.number);
            let record = ParticipantTxnRecord::started(txn, self.clock.now());
            state.txns.insert(txn, TxnSlot::fresh(record));
            debug!("shard {}: started transaction {}", self.id, txn);
        }
        Ok(())
    }

    async fn supersede(&self, state: &mut NodeState, txn: TxnId) -> Result<()> {
        let mut defunct = Vec::new();
        for (id, slot) in state.txns.iter() {
            if txn.supersedes(id) {
                match slot.record.state {
                    TxnRecordState::Prepared => {
                        return Err(ShardError::PreparedTxnInProgress { txn, prepared: *id }.into());
                    },
                    TxnRecordState::InProgress => defunct.push(*id),
                    _ => (),
                }
            }
        }
        for id in defunct {
            debug!("shard {}: transaction {} superseded by {}", self.id, id, txn);
            self.abort_slot(state, id).await?;
        }
        Ok(())
    }

    async fn abort_slot(&self, state: &mut NodeState, txn: TxnId) -> Result<()> {
        if let Some(slot) = state.txns.get_mut(&txn) {
            slot.workspace.clear();
            slot.record.state = TxnRecordState::Aborted;
            slot.record.staged.clear();
            slot.record.last_update_ts = self.clock.now();
            self.ledger.put_record(&self.id, slot.record.clone()).await?;
        }
        Ok(())
    }

    pub async fn prepare(&self, request: PrepareRequest) -> Result<PrepareVote> {
        let txn = request.txn;
        let mut state = self.state.lock().await;
        let known = state.txns.get(&txn).map(|slot| (slot.record.state, slot.record.prepared_ts));
        match known {
            None => {
                // This shard holds none of the transaction's writes, so the
                // only safe vote is abort, remembered for later statements
                // and decisions.
                warn!("shard {}: prepare for unknown transaction {}, voting abort", self.id, txn);
                let mut record = ParticipantTxnRecord::started(txn, self.clock.now());
                record.state = TxnRecordState::Aborted;
                self.ledger.put_record(&self.id, record.clone()).await?;
                let number = state.sessions.entry(txn.session).or_insert(txn.number);
                *number = (*number).max(txn.number);
                state.txns.insert(txn, TxnSlot::fresh(record));
                Ok(PrepareVote::Abort { reason: AbortReason::AlreadyAborted })
            },
            Some((TxnRecordState::Prepared, prepared_ts)) | Some((TxnRecordState::Committed, prepared_ts)) => {
                let prepare_ts = prepared_ts.unwrap_or_else(|| self.clock.now());
                Ok(PrepareVote::Prepared { prepare_ts })
            },
            Some((TxnRecordState::Aborted, _)) => Ok(PrepareVote::Abort { reason: AbortReason::AlreadyAborted }),
            Some((TxnRecordState::InProgress, _)) => self.do_prepare(&mut state, txn).await,
        }
    }

    async fn do_prepare(&self, state: &mut NodeState, txn: TxnId) -> Result<PrepareVote> {
        let mut conflicted = false;
        if let Some(slot) = state.txns.get(&txn) {
            for write in slot.workspace.values() {
                let current = match state.keyspace.get(write.collection, &write.key) {
                    Ok(Some(versioned)) => versioned.ts,
                    Ok(None) => Timestamp::zero(),
                    Err(_) => {
                        conflicted = true;
                        break;
                    },
                };
                if current != write.observed_ts {
                    conflicted = true;
                    break;
                }
            }
        }
        if conflicted {
            debug!("shard {}: write conflict at prepare of {}", self.id, txn);
            self.abort_slot(state, txn).await?;
            return Ok(PrepareVote::Abort { reason: AbortReason::WriteConflict });
        }

        let prepare_ts = self.clock.now();
        if let Some(slot) = state.txns.get_mut(&txn) {
            slot.record.state = TxnRecordState::Prepared;
            slot.record.prepared_ts = Some(prepare_ts);
            slot.record.staged = slot.workspace.values().cloned().collect();
            slot.record.last_update_ts = prepare_ts;
            // The promise must be durable before the vote leaves this node.
            self.ledger.put_record(&self.id, slot.record.clone()).await?;
        }
        debug!("shard {}: prepared {} at {}", self.id, txn, prepare_ts);
        Ok(PrepareVote::Prepared { prepare_ts })
    }

    pub async fn commit(&self, request: CommitRequest) -> Result<()> {
        let txn = request.txn;
        let mut state = self.state.lock().await;
        match state.txns.get(&txn).map(|slot| slot.record.state) {
            None => Err(ShardError::NoSuchTransaction { txn }.into()),
            Some(TxnRecordState::Committed) => Ok(()),
            Some(TxnRecordState::Aborted) => Err(ShardError::TransactionAborted { txn }.into()),
            Some(TxnRecordState::InProgress) => {
                // Legal only for read-only participants: they are told the
                // decision without a prepare round.
                let clean = state
                    .txns
                    .get(&txn)
                    .map(|slot| slot.workspace.is_empty() && slot.record.staged.is_empty())
                    .unwrap_or(true);
                if !clean {
                    self.abort_slot(&mut state, txn).await?;
                    return Err(ShardError::TransactionAborted { txn }.into());
                }
                self.finish_commit(&mut state, txn, request.commit_ts, Vec::new()).await
            },
            Some(TxnRecordState::Prepared) => {
                let staged = state.txns.get(&txn).map(|slot| slot.record.staged.clone()).unwrap_or_default();
                self.finish_commit(&mut state, txn, request.commit_ts, staged).await
            },
        }
    }

    async fn finish_commit(
        &self,
        state: &mut NodeState,
        txn: TxnId,
        commit_ts: Timestamp,
        staged: Vec<StagedWrite>,
    ) -> Result<()> {
        let mut ops = Vec::with_capacity(staged.len());
        for write in &staged {
            match &write.intent {
                WriteIntent::Put(doc) => {
                    if let Err(err) = state.keyspace.upsert(write.collection, doc.clone(), commit_ts) {
                        warn!("shard {}: commit of {} cannot apply to {}: {err}", self.id, txn, write.collection);
                        continue;
                    }
                    if write.observed_ts.is_zero() {
                        ops.push(RecordedOp::Insert { collection: write.collection, doc: doc.clone() });
                    } else {
                        ops.push(RecordedOp::UpdateSet {
                            collection: write.collection,
                            key: write.key.clone(),
                            set: doc.fields.clone(),
                        });
                    }
                },
                WriteIntent::Delete => {
                    state.keyspace.remove(write.collection, &write.key).ignore();
                    ops.push(RecordedOp::Delete { collection: write.collection, key: write.key.clone() });
                },
            }
        }
        self.clock.update(commit_ts);
        if !ops.is_empty() {
            self.oplog.append(OplogEntry { ts: commit_ts, ops });
        }
        if let Some(slot) = state.txns.get_mut(&txn) {
            slot.workspace.clear();
            slot.record.state = TxnRecordState::Committed;
            slot.record.staged.clear();
            slot.record.last_update_ts = self.clock.now();
            self.ledger.put_record(&self.id, slot.record.clone()).await?;
        }
        debug!("shard {}: committed {} at {}", self.id, txn, commit_ts);
        Ok(())
    }

    pub async fn abort(&self, request: AbortRequest) -> Result<()> {
        let txn = request.txn;
        let mut state = self.state.lock().await;
        match state.txns.get(&txn).map(|slot| slot.record.state) {
            None => Err(ShardError::NoSuchTransaction { txn }.into()),
            Some(TxnRecordState::Aborted) => Ok(()),
            Some(TxnRecordState::Committed) => Err(ShardError::TransactionCommitted { txn }.into()),
            Some(TxnRecordState::InProgress) | Some(TxnRecordState::Prepared) => {
                self.abort_slot(&mut state, txn).await?;
                debug!("shard {}: aborted {}", self.id, txn);
                Ok(())
            },
        }
    }

    pub async fn create_collection(&self, namespace: Namespace) -> Result<CollectionUuid> {
        let mut state = self.state.lock().await;
        let collection =
            state.keyspace.create(namespace.clone()).map_err(|err| statement_error(&namespace, err))?;
        self.oplog.append(OplogEntry {
            ts: self.clock.now(),
            ops: vec![RecordedOp::Create { collection, namespace }],
        });
        Ok(collection)
    }

    /// Creates a collection under a cluster-assigned uuid, so every shard of
    /// a namespace shares the collection identity.
    pub async fn create_collection_with(&self, collection: CollectionUuid, namespace: Namespace) -> Result<()> {
        let mut state = self.state.lock().await;
        state.keyspace.create_with(collection, namespace.clone()).map_err(|err| statement_error(&namespace, err))?;
        self.oplog.append(OplogEntry {
            ts: self.clock.now(),
            ops: vec![RecordedOp::Create { collection, namespace }],
        });
        Ok(())
    }

    pub async fn drop_collection(&self, namespace: &Namespace) -> Result<()> {
        let mut state = self.state.lock().await;
        let collection = state.keyspace.drop_name(namespace).map_err(|err| statement_error(namespace, err))?;
        self.oplog.append(OplogEntry { ts: self.clock.now(), ops: vec![RecordedOp::Drop { collection }] });
        Ok(())
    }

    pub async fn rename_collection(&self, from: &Namespace, to: Namespace) -> Result<()> {
        let mut state = self.state.lock().await;
        let collection = match state.keyspace.resolve(from) {
            Some(collection) => collection,
            None => return Err(statement_error(from, StoreError::NameNotFound(from.clone())).into()),
        };
        let drop_target = state.keyspace.resolve(&to).filter(|target| *target != collection);
        if let Some(target) = drop_target {
            state.keyspace.drop_uuid(target).map_err(|err| statement_error(&to, err))?;
        }
        state.keyspace.rename_uuid(collection, to.clone()).map_err(|err| statement_error(&to, err))?;
        self.oplog.append(OplogEntry {
            ts: self.clock.now(),
            ops: vec![RecordedOp::Rename { collection, to, drop_target }],
        });
        Ok(())
    }

    /// Committed read outside any transaction.
    pub async fn read(&self, namespace: &Namespace, key: &DocKey) -> Result<Option<Document>> {
        let state = self.state.lock().await;
        let collection = match state.keyspace.resolve(namespace) {
            Some(collection) => collection,
            None => return Err(ShardError::NamespaceNotFound(namespace.clone()).into()),
        };
        match state.keyspace.get(collection, key) {
            Ok(versioned) => Ok(versioned.map(|v| v.doc.clone())),
            Err(err) => Err(statement_error(namespace, err).into()),
        }
    }

    pub async fn dump(&self, namespace: &Namespace) -> Result<Vec<Versioned>> {
        let state = self.state.lock().await;
        let collection = match state.keyspace.resolve(namespace) {
            Some(collection) => collection,
            None => return Err(ShardError::NamespaceNotFound(namespace.clone()).into()),
        };
        state.keyspace.dump(collection).map_err(|err| statement_error(namespace, err).into())
    }

    pub fn oplog_entries(&self) -> Vec<OplogEntry> {
        self.oplog.entries()
    }

    /// The committed log flattened to timestamped operations, ready for
    /// [crate::applier::apply].
    pub fn oplog_ops(&self) -> Vec<(Timestamp, RecordedOp)> {
        self.oplog.flatten()
    }

    /// Moves every document at or above `at` out of this node, for rehoming
    /// after a routing split.
    pub async fn extract_range(&self, namespace: &Namespace, at: &DocKey) -> Result<Vec<(DocKey, Versioned)>> {
        let mut state = self.state.lock().await;
        let collection = match state.keyspace.resolve(namespace) {
            Some(collection) => collection,
            None => return Err(ShardError::NamespaceNotFound(namespace.clone()).into()),
        };
        state.keyspace.extract_range(collection, at).map_err(|err| statement_error(namespace, err).into())
    }

    /// Takes rehomed documents into the committed keyspace. Adoption is not
    /// a write: the documents keep their commit timestamps and enter no
    /// oplog entry here.
    pub async fn adopt_range(
        &self,
        collection: CollectionUuid,
        namespace: Namespace,
        docs: Vec<(DocKey, Versioned)>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.keyspace.create_with(collection, namespace.clone()).map_err(|err| statement_error(&namespace, err))?;
        state.keyspace.adopt(collection, docs).map_err(|err| statement_error(&namespace, err).into())
    }

    pub async fn collection_uuid(&self, namespace: &Namespace) -> Option<CollectionUuid> {
        self.state.lock().await.keyspace.resolve(namespace)
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::data::{FieldSet, Value};
    use crate::ledger::MemoryLedger;
    use crate::txn::StatementId;

    fn ns() -> Namespace {
        Namespace::from("bank.accounts")
    }

    fn set_v(v: i64) -> FieldSet {
        let mut set = FieldSet::new();
        set.insert("v".into(), v.into());
        set
    }

    struct TestShard {
        node: ShardNode,
        ledger: Arc<MemoryLedger>,
        version: ShardVersion,
    }

    impl TestShard {
        async fn bootstrap() -> Self {
            let ledger = Arc::new(MemoryLedger::new());
            let node = ShardNode::new(ShardId::from("s0"), Clock::new(), ledger.clone());
            node.create_collection(ns()).await.unwrap();
            let version = ShardVersion::initial();
            node.install_routing(ns(), version).await;
            Self { node, ledger, version }
        }

        fn request(&self, txn: TxnId, statement_id: StatementId, start: bool, op: Operation) -> StatementRequest {
            StatementRequest {
                txn,
                statement_id,
                start_transaction: start,
                namespace: ns(),
                routing_version: self.version,
                op,
            }
        }

        async fn insert(&self, txn: TxnId, statement_id: StatementId, start: bool, key: &str, v: i64) {
            let op = Operation::Insert { doc: Document::new(key).with("v", v) };
            let reply = self.node.statement(self.request(txn, statement_id, start, op)).await.unwrap();
            assert_that!(reply).is_equal_to(StatementReply::Done);
        }

        async fn commit(&self, txn: TxnId) -> Result<Timestamp> {
            let commit_ts = self.node.clock.now();
            self.node.commit(CommitRequest { txn, commit_ts }).await?;
            Ok(commit_ts)
        }

        async fn record(&self, txn: TxnId) -> ParticipantTxnRecord {
            self.ledger.record(self.node.id(), txn).await.unwrap().unwrap()
        }

        async fn value(&self, key: &str) -> Option<Value> {
            let doc = self.node.read(&ns(), &DocKey::from(key)).await.unwrap();
            doc.and_then(|doc| doc.get("v").cloned())
        }
    }

    fn unwrap_shard_err<T: std::fmt::Debug>(result: Result<T>) -> ShardError {
        match result {
            Err(NodeError::Shard(err)) => err,
            other => panic!("expected shard error, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_statement_prepare_commit() {
        let shard = TestShard::bootstrap().await;
        let txn = TxnId::new(SessionId::random(), 1);
        shard.insert(txn, 0, true, "alice", 100).await;

        // Uncommitted writes are invisible outside the transaction.
        assert_that!(shard.value("alice").await).is_equal_to(None);

        let vote = shard.node.prepare(PrepareRequest { txn }).await.unwrap();
        let prepare_ts = match vote {
            PrepareVote::Prepared { prepare_ts } => prepare_ts,
            PrepareVote::Abort { reason } => panic!("unexpected abort: {reason:?}"),
        };

        let commit_ts = shard.node.clock.update(prepare_ts);
        shard.node.commit(CommitRequest { txn, commit_ts }).await.unwrap();
        assert_that!(shard.value("alice").await).is_equal_to(Some(Value::Int(100)));
        assert_that!(shard.record(txn).await.state).is_equal_to(TxnRecordState::Committed);

        let entries = shard.node.oplog_entries();
        assert_that!(entries.len()).is_equal_to(2);
        assert_that!(entries[1].ts).is_equal_to(commit_ts);
        assert_that!(matches!(entries[1].ops[0], RecordedOp::Insert { .. })).is_equal_to(true);
    }

    #[test_log::test(tokio::test)]
    async fn test_redelivered_statements_replay() {
        let shard = TestShard::bootstrap().await;
        let txn = TxnId::new(SessionId::random(), 1);
        shard.insert(txn, 0, true, "alice", 1).await;

        let getset = Operation::GetSet { key: DocKey::from("alice"), set: set_v(2) };
        let reply = shard.node.statement(shard.request(txn, 1, false, getset.clone())).await.unwrap();
        assert_that!(reply).is_equal_to(StatementReply::Doc(Some(Document::new("alice").with("v", 1i64))));

        let update = Operation::UpdateSet { key: DocKey::from("alice"), set: set_v(3) };
        let reply = shard.node.statement(shard.request(txn, 2, false, update)).await.unwrap();
        assert_that!(reply).is_equal_to(StatementReply::Done);

        // A redelivered insert must not fail with a duplicate key.
        let redelivered = Operation::Insert { doc: Document::new("alice").with("v", 1i64) };
        let reply = shard.node.statement(shard.request(txn, 0, false, redelivered)).await.unwrap();
        assert_that!(reply).is_equal_to(StatementReply::Done);

        // A redelivered retrieve-and-update reproduces its original image,
        // not the current workspace content.
        let reply = shard.node.statement(shard.request(txn, 1, false, getset)).await.unwrap();
        assert_that!(reply).is_equal_to(StatementReply::Doc(Some(Document::new("alice").with("v", 1i64))));

        shard.node.prepare(PrepareRequest { txn }).await.unwrap();
        shard.commit(txn).await.unwrap();
        assert_that!(shard.value("alice").await).is_equal_to(Some(Value::Int(3)));
    }

    #[test_log::test(tokio::test)]
    async fn test_txn_number_monotonic_per_session() {
        let shard = TestShard::bootstrap().await;
        let session = SessionId::random();
        let txn5 = TxnId::new(session, 5);
        shard.insert(txn5, 0, true, "alice", 1).await;

        let stale = TxnId::new(session, 4);
        let op = Operation::Insert { doc: Document::new("bob").with("v", 2i64) };
        let err = unwrap_shard_err(shard.node.statement(shard.request(stale, 0, true, op.clone())).await);
        assert_that!(err).is_equal_to(ShardError::NoSuchTransaction { txn: stale });

        // A higher number without the start flag is an arrival out of order.
        let txn6 = TxnId::new(session, 6);
        let err = unwrap_shard_err(shard.node.statement(shard.request(txn6, 1, false, op.clone())).await);
        assert_that!(err).is_equal_to(ShardError::NoSuchTransaction { txn: txn6 });

        // With the start flag it supersedes: the old transaction aborts.
        let reply = shard.node.statement(shard.request(txn6, 0, true, op)).await.unwrap();
        assert_that!(reply).is_equal_to(StatementReply::Done);
        assert_that!(shard.record(txn5).await.state).is_equal_to(TxnRecordState::Aborted);
        let err = unwrap_shard_err(shard.commit(txn5).await);
        assert_that!(err).is_equal_to(ShardError::TransactionAborted { txn: txn5 });
    }

    #[test_log::test(tokio::test)]
    async fn test_prepared_txn_blocks_successor() {
        let shard = TestShard::bootstrap().await;
        let session = SessionId::random();
        let txn5 = TxnId::new(session, 5);
        shard.insert(txn5, 0, true, "alice", 1).await;
        shard.node.prepare(PrepareRequest { txn: txn5 }).await.unwrap();

        let txn6 = TxnId::new(session, 6);
        let op = Operation::Insert { doc: Document::new("bob").with("v", 2i64) };
        let err = unwrap_shard_err(shard.node.statement(shard.request(txn6, 0, true, op.clone())).await);
        assert_that!(err).is_equal_to(ShardError::PreparedTxnInProgress { txn: txn6, prepared: txn5 });

        // Once the decision lands the successor may proceed.
        shard.commit(txn5).await.unwrap();
        let reply = shard.node.statement(shard.request(txn6, 0, true, op)).await.unwrap();
        assert_that!(reply).is_equal_to(StatementReply::Done);
    }

    #[test_log::test(tokio::test)]
    async fn test_prepare_persists_promise_before_vote() {
        let shard = TestShard::bootstrap().await;
        let txn = TxnId::new(SessionId::random(), 1);
        shard.insert(txn, 0, true, "alice", 1).await;

        let vote = shard.node.prepare(PrepareRequest { txn }).await.unwrap();
        let record = shard.record(txn).await;
        assert_that!(record.state).is_equal_to(TxnRecordState::Prepared);
        assert_that!(record.staged.len()).is_equal_to(1);
        assert_that!(vote).is_equal_to(PrepareVote::Prepared { prepare_ts: record.prepared_ts.unwrap() });

        // Prepare is idempotent and keeps its original timestamp.
        let again = shard.node.prepare(PrepareRequest { txn }).await.unwrap();
        assert_that!(again).is_equal_to(vote);
    }

    #[test_log::test(tokio::test)]
    async fn test_prepare_of_unknown_txn_votes_abort() {
        let shard = TestShard::bootstrap().await;
        let txn = TxnId::new(SessionId::random(), 1);

        let vote = shard.node.prepare(PrepareRequest { txn }).await.unwrap();
        assert_that!(vote).is_equal_to(PrepareVote::Abort { reason: AbortReason::AlreadyAborted });
        assert_that!(shard.record(txn).await.state).is_equal_to(TxnRecordState::Aborted);

        // The vote is remembered against late statements of that transaction.
        let op = Operation::Insert { doc: Document::new("alice").with("v", 1i64) };
        let err = unwrap_shard_err(shard.node.statement(shard.request(txn, 0, true, op)).await);
        assert_that!(err).is_equal_to(ShardError::TransactionAborted { txn });
    }

    #[test_log::test(tokio::test)]
    async fn test_write_conflict_votes_abort() {
        let shard = TestShard::bootstrap().await;
        let seed = TxnId::new(SessionId::random(), 1);
        shard.insert(seed, 0, true, "alice", 1).await;
        shard.node.prepare(PrepareRequest { txn: seed }).await.unwrap();
        shard.commit(seed).await.unwrap();

        let slow = TxnId::new(SessionId::random(), 1);
        let update = Operation::UpdateSet { key: DocKey::from("alice"), set: set_v(10) };
        shard.node.statement(shard.request(slow, 0, true, update)).await.unwrap();

        // Another transaction commits a newer version underneath.
        let fast = TxnId::new(SessionId::random(), 1);
        let update = Operation::UpdateSet { key: DocKey::from("alice"), set: set_v(20) };
        shard.node.statement(shard.request(fast, 0, true, update)).await.unwrap();
        shard.node.prepare(PrepareRequest { txn: fast }).await.unwrap();
        shard.commit(fast).await.unwrap();

        let vote = shard.node.prepare(PrepareRequest { txn: slow }).await.unwrap();
        assert_that!(vote).is_equal_to(PrepareVote::Abort { reason: AbortReason::WriteConflict });
        assert_that!(shard.record(slow).await.state).is_equal_to(TxnRecordState::Aborted);
        assert_that!(shard.value("alice").await).is_equal_to(Some(Value::Int(20)));
    }

    #[test_log::test(tokio::test)]
    async fn test_decisions_are_idempotent() {
        let shard = TestShard::bootstrap().await;
        let txn = TxnId::new(SessionId::random(), 1);
        shard.insert(txn, 0, true, "alice", 1).await;
        shard.node.prepare(PrepareRequest { txn }).await.unwrap();

        let commit_ts = shard.commit(txn).await.unwrap();
        shard.node.commit(CommitRequest { txn, commit_ts }).await.unwrap();
        assert_that!(shard.node.oplog_entries().len()).is_equal_to(2);

        let err = unwrap_shard_err(shard.node.abort(AbortRequest { txn }).await);
        assert_that!(err).is_equal_to(ShardError::TransactionCommitted { txn });
    }

    #[test_log::test(tokio::test)]
    async fn test_abort_discards_workspace() {
        let shard = TestShard::bootstrap().await;
        let txn = TxnId::new(SessionId::random(), 1);
        shard.insert(txn, 0, true, "alice", 1).await;

        shard.node.abort(AbortRequest { txn }).await.unwrap();
        shard.node.abort(AbortRequest { txn }).await.unwrap();
        assert_that!(shard.value("alice").await).is_equal_to(None);

        let err = unwrap_shard_err(shard.commit(txn).await);
        assert_that!(err).is_equal_to(ShardError::TransactionAborted { txn });
    }

    #[test_log::test(tokio::test)]
    async fn test_read_only_participant_commits_without_prepare() {
        let shard = TestShard::bootstrap().await;
        let txn = TxnId::new(SessionId::random(), 1);
        let get = Operation::Get { key: DocKey::from("alice") };
        let reply = shard.node.statement(shard.request(txn, 0, true, get)).await.unwrap();
        assert_that!(reply).is_equal_to(StatementReply::Doc(None));

        shard.commit(txn).await.unwrap();
        assert_that!(shard.record(txn).await.state).is_equal_to(TxnRecordState::Committed);
        assert_that!(shard.node.oplog_entries().len()).is_equal_to(1);
    }

    #[test_log::test(tokio::test)]
    async fn test_commit_of_unprepared_writer_aborts() {
        let shard = TestShard::bootstrap().await;
        let txn = TxnId::new(SessionId::random(), 1);
        shard.insert(txn, 0, true, "alice", 1).await;

        let err = unwrap_shard_err(shard.commit(txn).await);
        assert_that!(err).is_equal_to(ShardError::TransactionAborted { txn });
        assert_that!(shard.value("alice").await).is_equal_to(None);
        assert_that!(shard.record(txn).await.state).is_equal_to(TxnRecordState::Aborted);
    }

    #[test_log::test(tokio::test)]
    async fn test_restore_keeps_prepared_promise() {
        let shard = TestShard::bootstrap().await;
        let prepared = TxnId::new(SessionId::random(), 1);
        shard.insert(prepared, 0, true, "alice", 1).await;
        shard.node.prepare(PrepareRequest { txn: prepared }).await.unwrap();

        let lost = TxnId::new(SessionId::random(), 1);
        shard.insert(lost, 0, true, "bob", 2).await;

        let parts = shard.node.parts().await;
        let restored =
            ShardNode::restore(shard.node.id().clone(), Clock::new(), shard.ledger.clone(), parts).await.unwrap();

        // The prepared transaction still honors the decision.
        let commit_ts = restored.clock.now();
        restored.commit(CommitRequest { txn: prepared, commit_ts }).await.unwrap();
        let doc = restored.read(&ns(), &DocKey::from("alice")).await.unwrap();
        assert_that!(doc.is_some()).is_equal_to(true);

        // The never-prepared transaction died with the process.
        let err = unwrap_shard_err(restored.commit(CommitRequest { txn: lost, commit_ts }).await);
        assert_that!(err).is_equal_to(ShardError::NoSuchTransaction { txn: lost });
        let bob = restored.read(&ns(), &DocKey::from("bob")).await.unwrap();
        assert_that!(bob).is_equal_to(None);
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_routing_rejected_before_execution() {
        let shard = TestShard::bootstrap().await;
        let txn = TxnId::new(SessionId::random(), 1);
        let bumped = shard.version.bump();
        let op = Operation::Insert { doc: Document::new("alice").with("v", 1i64) };
        let request = StatementRequest {
            txn,
            statement_id: 0,
            start_transaction: true,
            namespace: ns(),
            routing_version: bumped,
            op,
        };

        let err = unwrap_shard_err(shard.node.statement(request).await);
        assert_that!(err).is_equal_to(ShardError::StaleRouting {
            namespace: ns(),
            got: bumped,
            owned: shard.version,
        });
    }
}
