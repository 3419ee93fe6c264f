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

use async_trait::async_trait;
use hashbrown::HashMap;

use super::{LedgerState, Result, SessionRegistry, TransactionLedger};
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

/// Ledger held entirely in process memory. Durable relative to simulated
/// crashes: tests tear down coordinators and shard nodes while the ledger
/// survives, which is exactly the failure model two-phase commit cares
/// about.
#[derive(Default)]
pub struct MemoryLedger {
    state: spin::Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionLedger for MemoryLedger {
    async fn insert_coordinator(&self, doc: CoordinatorDoc) -> Result<()> {
        self.state.lock().insert_coordinator(doc)
    }

    async fn update_coordinator(&self, doc: CoordinatorDoc, expected: CoordinatorPhase) -> Result<()> {
        self.state.lock().update_coordinator(doc, expected)
    }

    async fn delete_coordinator(&self, txn: TxnId, expected: CoordinatorPhase) -> Result<()> {
        self.state.lock().delete_coordinator(txn, expected)
    }

    async fn coordinator(&self, txn: TxnId) -> Result<Option<CoordinatorDoc>> {
        Ok(self.state.lock().coordinator(txn))
    }

    async fn coordinators(&self) -> Result<Vec<CoordinatorDoc>> {
        Ok(self.state.lock().coordinators())
    }

    async fn put_record(&self, shard: &ShardId, record: ParticipantTxnRecord) -> Result<()> {
        self.state.lock().put_record(shard, record);
        Ok(())
    }

    async fn record(&self, shard: &ShardId, txn: TxnId) -> Result<Option<ParticipantTxnRecord>> {
        Ok(self.state.lock().record(shard, txn))
    }

    async fn records(&self, shard: &ShardId) -> Result<Vec<ParticipantTxnRecord>> {
        Ok(self.state.lock().records(shard))
    }

    async fn delete_record(&self, shard: &ShardId, txn: TxnId) -> Result<()> {
        self.state.lock().delete_record(shard, txn);
        Ok(())
    }

    async fn put_image(&self, shard: &ShardId, image: ImageEntry) -> Result<()> {
        self.state.lock().put_image(shard, image);
        Ok(())
    }

    async fn image(&self, shard: &ShardId, txn: TxnId, statement_id: StatementId) -> Result<Option<ImageEntry>> {
        Ok(self.state.lock().image(shard, txn, statement_id))
    }

    async fn images(&self, shard: &ShardId, txn: TxnId) -> Result<Vec<ImageEntry>> {
        Ok(self.state.lock().images(shard, txn))
    }

    async fn delete_images(&self, shard: &ShardId, txn: TxnId) -> Result<()> {
        self.state.lock().delete_images(shard, txn);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionRegistry {
    sessions: spin::Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRegistry for MemorySessionRegistry {
    async fn record(&self, session: SessionId) -> Option<SessionRecord> {
        self.sessions.lock().get(&session).cloned()
    }

    async fn touch(&self, session: SessionId, now: Timestamp) {
        self.sessions.lock().insert(session, SessionRecord { session, last_use_ts: now });
    }

    async fn remove(&self, session: SessionId) {
        self.sessions.lock().remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::txn::{ParticipantShard, TxnDecision};

    fn coordinator_doc(txn: TxnId) -> CoordinatorDoc {
        CoordinatorDoc::new(txn, vec![ParticipantShard::writer(ShardId::new("s0"))])
    }

    #[test_log::test(tokio::test)]
    async fn test_coordinator_cas() {
        let ledger = MemoryLedger::new();
        let txn = TxnId::new(SessionId::random(), 1);
        let doc = coordinator_doc(txn);

        ledger.insert_coordinator(doc.clone()).await.unwrap();
        let duplicate = ledger.insert_coordinator(doc.clone()).await.unwrap_err();
        assert_that!(duplicate.is_phase_conflict()).is_equal_to(true);

        let mut preparing = doc.clone();
        preparing.phase = CoordinatorPhase::Preparing;
        ledger.update_coordinator(preparing.clone(), CoordinatorPhase::ParticipantsWritten).await.unwrap();

        // A stale writer still expecting the initial phase loses.
        let stale = ledger.update_coordinator(doc.clone(), CoordinatorPhase::ParticipantsWritten).await.unwrap_err();
        assert_that!(stale.is_phase_conflict()).is_equal_to(true);

        let mut decided = preparing.clone();
        assert_that!(decided.decide(TxnDecision::Abort)).is_equal_to(true);
        ledger.update_coordinator(decided.clone(), CoordinatorPhase::Preparing).await.unwrap();

        let read = ledger.coordinator(txn).await.unwrap().unwrap();
        assert_that!(read.decision).is_equal_to(Some(TxnDecision::Abort));

        let wrong_delete = ledger.delete_coordinator(txn, CoordinatorPhase::Done).await.unwrap_err();
        assert_that!(wrong_delete.is_phase_conflict()).is_equal_to(true);
        let mut done = decided.clone();
        done.phase = CoordinatorPhase::Done;
        ledger.update_coordinator(done, CoordinatorPhase::DecisionWritten).await.unwrap();
        ledger.delete_coordinator(txn, CoordinatorPhase::Done).await.unwrap();
        assert_that!(ledger.coordinator(txn).await.unwrap()).is_equal_to(None);
    }

    #[test_log::test(tokio::test)]
    async fn test_records_scoped_by_shard() {
        let ledger = MemoryLedger::new();
        let (s0, s1) = (ShardId::new("s0"), ShardId::new("s1"));
        let txn = TxnId::new(SessionId::random(), 1);

        ledger.put_record(&s0, ParticipantTxnRecord::started(txn, Timestamp::zero())).await.unwrap();
        assert_that!(ledger.record(&s0, txn).await.unwrap().is_some()).is_equal_to(true);
        assert_that!(ledger.record(&s1, txn).await.unwrap().is_none()).is_equal_to(true);
        assert_that!(ledger.records(&s0).await.unwrap().len()).is_equal_to(1);
        assert_that!(ledger.records(&s1).await.unwrap().len()).is_equal_to(0);

        ledger.delete_record(&s0, txn).await.unwrap();
        assert_that!(ledger.records(&s0).await.unwrap().len()).is_equal_to(0);
    }

    #[test_log::test(tokio::test)]
    async fn test_images_keyed_by_statement() {
        let ledger = MemoryLedger::new();
        let shard = ShardId::new("s0");
        let txn = TxnId::new(SessionId::random(), 1);

        for statement_id in [2u32, 5] {
            let image = ImageEntry { txn, statement_id, image: None, operation_ts: Timestamp::zero() };
            ledger.put_image(&shard, image).await.unwrap();
        }
        assert_that!(ledger.image(&shard, txn, 2).await.unwrap().is_some()).is_equal_to(true);
        assert_that!(ledger.image(&shard, txn, 3).await.unwrap().is_none()).is_equal_to(true);
        assert_that!(ledger.images(&shard, txn).await.unwrap().len()).is_equal_to(2);

        ledger.delete_images(&shard, txn).await.unwrap();
        assert_that!(ledger.images(&shard, txn).await.unwrap().len()).is_equal_to(0);
    }

    #[test_log::test(tokio::test)]
    async fn test_session_registry() {
        let registry = MemorySessionRegistry::new();
        let session = SessionId::random();
        assert_that!(registry.record(session).await.is_none()).is_equal_to(true);

        registry.touch(session, Timestamp { physical: 10, logical: 0 }).await;
        let record = registry.record(session).await.unwrap();
        assert_that!(record.last_use_ts).is_equal_to(Timestamp { physical: 10, logical: 0 });

        registry.remove(session).await;
        assert_that!(registry.record(session).await.is_none()).is_equal_to(true);
    }
}
