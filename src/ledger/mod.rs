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

//! Durable transaction state. The ledger keeps coordinator documents,
//! per-participant transaction records and statement images; coordinator
//! writes are compare-and-swap on the persisted phase so a superseded
//! coordinator instance loses instead of corrupting.

mod file;
mod memory;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::file::FileLedger;
pub use self::memory::{MemoryLedger, MemorySessionRegistry};
use crate::clock::Timestamp;
use crate::routing::ShardId;
use crate::txn::{
    CoordinatorDoc,
    CoordinatorPhase,
    ImageEntry,
    ParticipantTxnRecord,
    SessionId,
    SessionRecord,
    StatementId,
    TxnId,
};

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Compare-and-swap lost: the document is not at the phase the writer
    /// believed. `None` stands for an absent document on either side.
    #[error("coordinator document for {txn} at phase {actual:?}, caller expected {expected:?}")]
    PhaseConflict { txn: TxnId, expected: Option<CoordinatorPhase>, actual: Option<CoordinatorPhase> },
    #[error("ledger io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger snapshot corrupt: {0}")]
    Corrupt(String),
}

impl LedgerError {
    pub fn is_phase_conflict(&self) -> bool {
        matches!(self, LedgerError::PhaseConflict { .. })
    }
}

/// Storage seam for everything transactions persist. One implementation per
/// deployment; shards and coordinators address their slices by [ShardId] and
/// [TxnId].
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    /// Creates the coordinator document. Fails with
    /// [LedgerError::PhaseConflict] if one already exists for the
    /// transaction.
    async fn insert_coordinator(&self, doc: CoordinatorDoc) -> Result<()>;

    /// Replaces the coordinator document if its persisted phase equals
    /// `expected`.
    async fn update_coordinator(&self, doc: CoordinatorDoc, expected: CoordinatorPhase) -> Result<()>;

    /// Deletes the coordinator document if its persisted phase equals
    /// `expected`.
    async fn delete_coordinator(&self, txn: TxnId, expected: CoordinatorPhase) -> Result<()>;

    async fn coordinator(&self, txn: TxnId) -> Result<Option<CoordinatorDoc>>;

    /// All live coordinator documents, for recovery.
    async fn coordinators(&self) -> Result<Vec<CoordinatorDoc>>;

    /// Upserts a participant transaction record.
    async fn put_record(&self, shard: &ShardId, record: ParticipantTxnRecord) -> Result<()>;

    async fn record(&self, shard: &ShardId, txn: TxnId) -> Result<Option<ParticipantTxnRecord>>;

    async fn records(&self, shard: &ShardId) -> Result<Vec<ParticipantTxnRecord>>;

    async fn delete_record(&self, shard: &ShardId, txn: TxnId) -> Result<()>;

    async fn put_image(&self, shard: &ShardId, image: ImageEntry) -> Result<()>;

    async fn image(&self, shard: &ShardId, txn: TxnId, statement_id: StatementId) -> Result<Option<ImageEntry>>;

    async fn images(&self, shard: &ShardId, txn: TxnId) -> Result<Vec<ImageEntry>>;

    async fn delete_images(&self, shard: &ShardId, txn: TxnId) -> Result<()>;
}

/// Registry of live sessions. Owned by the session layer, read by the
/// reaper: transaction state is collectable exactly when the parent session
/// record is gone.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn record(&self, session: SessionId) -> Option<SessionRecord>;

    async fn touch(&self, session: SessionId, now: Timestamp);

    async fn remove(&self, session: SessionId);
}

/// The tables behind every ledger implementation, with the CAS rules in one
/// place. Implementations differ only in how they hold and persist this.
#[derive(Clone, Debug, Default)]
pub(crate) struct LedgerState {
    coordinators: HashMap<TxnId, CoordinatorDoc>,
    records: HashMap<(ShardId, TxnId), ParticipantTxnRecord>,
    images: HashMap<(ShardId, TxnId, StatementId), ImageEntry>,
}

impl LedgerState {
    pub fn insert_coordinator(&mut self, doc: CoordinatorDoc) -> Result<()> {
        if let Some(existing) = self.coordinators.get(&doc.txn) {
            return Err(LedgerError::PhaseConflict {
                txn: doc.txn,
                expected: None,
                actual: Some(existing.phase),
            });
        }
        self.coordinators.insert(doc.txn, doc);
        Ok(())
    }

    pub fn update_coordinator(&mut self, doc: CoordinatorDoc, expected: CoordinatorPhase) -> Result<()> {
        match self.coordinators.get_mut(&doc.txn) {
            None => Err(LedgerError::PhaseConflict { txn: doc.txn, expected: Some(expected), actual: None }),
            Some(existing) if existing.phase != expected => Err(LedgerError::PhaseConflict {
                txn: doc.txn,
                expected: Some(expected),
                actual: Some(existing.phase),
            }),
            Some(existing) => {
                *existing = doc;
                Ok(())
            },
        }
    }

    pub fn delete_coordinator(&mut self, txn: TxnId, expected: CoordinatorPhase) -> Result<()> {
        match self.coordinators.get(&txn) {
            None => Err(LedgerError::PhaseConflict { txn, expected: Some(expected), actual: None }),
            Some(existing) if existing.phase != expected => Err(LedgerError::PhaseConflict {
                txn,
                expected: Some(expected),
                actual: Some(existing.phase),
            }),
            Some(_) => {
                self.coordinators.remove(&txn);
                Ok(())
            },
        }
    }

    pub fn coordinator(&self, txn: TxnId) -> Option<CoordinatorDoc> {
        self.coordinators.get(&txn).cloned()
    }

    pub fn coordinators(&self) -> Vec<CoordinatorDoc> {
        self.coordinators.values().cloned().collect()
    }

    pub fn put_record(&mut self, shard: &ShardId, record: ParticipantTxnRecord) {
        self.records.insert((shard.clone(), record.txn), record);
    }

    pub fn record(&self, shard: &ShardId, txn: TxnId) -> Option<ParticipantTxnRecord> {
        self.records.get(&(shard.clone(), txn)).cloned()
    }

    pub fn records(&self, shard: &ShardId) -> Vec<ParticipantTxnRecord> {
        self.records.iter().filter(|((owner, _), _)| owner == shard).map(|(_, record)| record.clone()).collect()
    }

    pub fn delete_record(&mut self, shard: &ShardId, txn: TxnId) {
        self.records.remove(&(shard.clone(), txn));
    }

    pub fn put_image(&mut self, shard: &ShardId, image: ImageEntry) {
        self.images.insert((shard.clone(), image.txn, image.statement_id), image);
    }

    pub fn image(&self, shard: &ShardId, txn: TxnId, statement_id: StatementId) -> Option<ImageEntry> {
        self.images.get(&(shard.clone(), txn, statement_id)).cloned()
    }

    pub fn images(&self, shard: &ShardId, txn: TxnId) -> Vec<ImageEntry> {
        self.images
            .iter()
            .filter(|((owner, owner_txn, _), _)| owner == shard && *owner_txn == txn)
            .map(|(_, image)| image.clone())
            .collect()
    }

    pub fn delete_images(&mut self, shard: &ShardId, txn: TxnId) {
        self.images.retain(|(owner, owner_txn, _), _| !(owner == shard && *owner_txn == txn));
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            coordinators: self.coordinators.values().cloned().collect(),
            records: self.records.iter().map(|((shard, _), record)| (shard.clone(), record.clone())).collect(),
            images: self.images.iter().map(|((shard, _, _), image)| (shard.clone(), image.clone())).collect(),
        }
    }

    pub fn restore(snapshot: Snapshot) -> Self {
        let mut state = Self::default();
        for doc in snapshot.coordinators {
            state.coordinators.insert(doc.txn, doc);
        }
        for (shard, record) in snapshot.records {
            state.records.insert((shard, record.txn), record);
        }
        for (shard, image) in snapshot.images {
            state.images.insert((shard, image.txn, image.statement_id), image);
        }
        state
    }
}

/// Serialized form of [LedgerState]. Vectors instead of maps so the snapshot
/// stays plain JSON.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    coordinators: Vec<CoordinatorDoc>,
    records: Vec<(ShardId, ParticipantTxnRecord)>,
    images: Vec<(ShardId, ImageEntry)>,
}
