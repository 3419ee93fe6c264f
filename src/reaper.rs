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

//! Garbage collection for transaction state. Participant records double as
//! the replay memory of their session, so they stay as long as the session
//! lives; once the session record disappears from the registry nothing can
//! legally retry those transactions, and the reaper collects them. Prepared
//! records are the exception: they hold staged writes a pending decision
//! still needs, and are skipped until that decision lands.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use tokio::select;
use tracing::{debug, warn};

use crate::ledger::{LedgerError, SessionRegistry, TransactionLedger};
use crate::routing::ShardId;
use crate::timer::Timer;
use crate::txn::{SessionId, TxnRecordState};
use crate::utils::{self, DropOwner};

pub struct SessionReaper {
    shard: ShardId,
    ledger: Arc<dyn TransactionLedger>,
    registry: Arc<dyn SessionRegistry>,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(
        shard: ShardId,
        ledger: Arc<dyn TransactionLedger>,
        registry: Arc<dyn SessionRegistry>,
        interval: Duration,
    ) -> Self {
        Self { shard, ledger, registry, interval }
    }

    /// Collects every transaction whose parent session record is gone.
    /// Returns how many were reaped.
    pub async fn sweep_once(&self) -> Result<usize, LedgerError> {
        let records = self.ledger.records(&self.shard).await?;
        let mut live: HashMap<SessionId, bool> = HashMap::new();
        let mut reaped = 0;
        for record in records {
            if record.state == TxnRecordState::Prepared {
                // An undecided promise. The staged writes in this record are
                // what a commit decision will apply; it outlives its session
                // until the coordinator resolves it.
                continue;
            }
            let session = record.txn.session;
            let alive = match live.get(&session) {
                Some(alive) => *alive,
                None => {
                    let alive = self.registry.record(session).await.is_some();
                    live.insert(session, alive);
                    alive
                },
            };
            if alive {
                continue;
            }
            // Images first: if the record outlives a partial sweep, the next
            // one retries the whole transaction.
            self.ledger.delete_images(&self.shard, record.txn).await?;
            self.ledger.delete_record(&self.shard, record.txn).await?;
            debug!("shard {}: reaped {} of dead session {session}", self.shard, record.txn);
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Sweeps on an interval until the returned handle drops.
    pub fn start(self) -> DropOwner {
        let (owner, mut watcher) = utils::drop_watcher();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = watcher.dropped() => break,
                    _ = Timer::after(self.interval) => match self.sweep_once().await {
                        Ok(0) => (),
                        Ok(reaped) => debug!("shard {}: swept {reaped} dead transactions", self.shard),
                        Err(err) => warn!("shard {}: sweep failed: {err}", self.shard),
                    },
                }
            }
            debug!("shard {}: reaper stopped", self.shard);
        });
        owner
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::clock::Timestamp;
    use crate::data::Document;
    use crate::ledger::{MemoryLedger, MemorySessionRegistry};
    use crate::txn::{ImageEntry, ParticipantTxnRecord, TxnId, TxnRecordState};

    fn shard() -> ShardId {
        ShardId::from("s0")
    }

    fn now() -> Timestamp {
        Timestamp { physical: 100, logical: 0 }
    }

    async fn committed_record(ledger: &MemoryLedger, txn: TxnId) {
        let mut record = ParticipantTxnRecord::started(txn, now());
        record.state = TxnRecordState::Committed;
        ledger.put_record(&shard(), record).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_sweep_collects_only_dead_sessions() {
        let ledger = Arc::new(MemoryLedger::new());
        let registry = Arc::new(MemorySessionRegistry::new());

        let live = SessionId::random();
        registry.touch(live, now()).await;
        let live_txn = TxnId::new(live, 1);
        committed_record(&ledger, live_txn).await;

        let dead_txn = TxnId::new(SessionId::random(), 4);
        committed_record(&ledger, dead_txn).await;
        ledger
            .put_image(&shard(), ImageEntry {
                txn: dead_txn,
                statement_id: 0,
                image: Some(Document::new("alice")),
                operation_ts: now(),
            })
            .await
            .unwrap();

        let reaper =
            SessionReaper::new(shard(), ledger.clone(), registry.clone(), Duration::from_secs(60));
        assert_that!(reaper.sweep_once().await.unwrap()).is_equal_to(1);

        // The live session keeps its replay memory however old it is.
        assert_that!(ledger.record(&shard(), live_txn).await.unwrap().is_some()).is_equal_to(true);
        assert_that!(ledger.record(&shard(), dead_txn).await.unwrap().is_none()).is_equal_to(true);
        assert_that!(ledger.images(&shard(), dead_txn).await.unwrap()).is_empty();

        // Nothing left to collect.
        assert_that!(reaper.sweep_once().await.unwrap()).is_equal_to(0);
    }

    #[test_log::test(tokio::test)]
    async fn test_session_removal_releases_its_transactions() {
        let ledger = Arc::new(MemoryLedger::new());
        let registry = Arc::new(MemorySessionRegistry::new());

        let session = SessionId::random();
        registry.touch(session, now()).await;
        for number in 1..=3 {
            committed_record(&ledger, TxnId::new(session, number)).await;
        }

        let reaper =
            SessionReaper::new(shard(), ledger.clone(), registry.clone(), Duration::from_secs(60));
        assert_that!(reaper.sweep_once().await.unwrap()).is_equal_to(0);

        registry.remove(session).await;
        assert_that!(reaper.sweep_once().await.unwrap()).is_equal_to(3);
        assert_that!(ledger.records(&shard()).await.unwrap()).is_empty();
    }

    #[test_log::test(tokio::test)]
    async fn test_prepared_transactions_outlive_their_session() {
        let ledger = Arc::new(MemoryLedger::new());
        let registry = Arc::new(MemorySessionRegistry::new());

        let txn = TxnId::new(SessionId::random(), 1);
        let mut record = ParticipantTxnRecord::started(txn, now());
        record.state = TxnRecordState::Prepared;
        record.prepared_ts = Some(now());
        ledger.put_record(&shard(), record).await.unwrap();

        // The session is gone but the promise is undecided: not reapable.
        let reaper =
            SessionReaper::new(shard(), ledger.clone(), registry.clone(), Duration::from_secs(60));
        assert_that!(reaper.sweep_once().await.unwrap()).is_equal_to(0);
        assert_that!(ledger.record(&shard(), txn).await.unwrap().is_some()).is_equal_to(true);

        // Once the decision lands the record reaps like any other.
        let mut decided = ledger.record(&shard(), txn).await.unwrap().unwrap();
        decided.state = TxnRecordState::Committed;
        decided.staged.clear();
        ledger.put_record(&shard(), decided).await.unwrap();
        assert_that!(reaper.sweep_once().await.unwrap()).is_equal_to(1);
        assert_that!(ledger.records(&shard()).await.unwrap()).is_empty();
    }

    #[test_log::test(tokio::test)]
    async fn test_background_reaper_stops_with_its_handle() {
        let ledger = Arc::new(MemoryLedger::new());
        let registry = Arc::new(MemorySessionRegistry::new());
        committed_record(&ledger, TxnId::new(SessionId::random(), 1)).await;

        let reaper =
            SessionReaper::new(shard(), ledger.clone(), registry.clone(), Duration::from_millis(5));
        let handle = reaper.start();

        Timer::after(Duration::from_millis(50)).await;
        assert_that!(ledger.records(&shard()).await.unwrap()).is_empty();

        drop(handle);
        Timer::after(Duration::from_millis(10)).await;
        committed_record(&ledger, TxnId::new(SessionId::random(), 1)).await;
        Timer::after(Duration::from_millis(50)).await;
        assert_that!(ledger.records(&shard()).await.unwrap().len()).is_equal_to(1);
    }
}
