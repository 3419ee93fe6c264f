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

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{LedgerError, LedgerState, Result, Snapshot, TransactionLedger};
use crate::routing::ShardId;
use crate::txn::{CoordinatorDoc, CoordinatorPhase, ImageEntry, ParticipantTxnRecord, StatementId, TxnId};

/// Ledger persisted as a JSON snapshot. Every mutation rewrites the snapshot
/// through a temporary file, fsyncs and renames, so the file on disk is
/// always a complete snapshot of some accepted state. Memory and disk move
/// together: a mutation that fails to persist is not applied.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl FileLedger {
    /// Opens the snapshot at `path`, starting empty if it does not exist. A
    /// snapshot that no longer parses is moved aside to `<path>.corrupt` and
    /// the open fails; wiping transaction state silently is not an option.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => {
                    let state = LedgerState::restore(snapshot);
                    debug!("loaded ledger snapshot from {}", path.display());
                    state
                },
                Err(err) => {
                    let quarantine = path.with_extension("corrupt");
                    warn!(
                        "ledger snapshot {} does not parse, moving to {}: {err}",
                        path.display(),
                        quarantine.display()
                    );
                    fs::rename(&path, &quarantine).await?;
                    return Err(LedgerError::Corrupt(err.to_string()));
                },
            },
            Err(err) if err.kind() == ErrorKind::NotFound => LedgerState::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, state: Mutex::new(state) })
    }

    async fn persist(&self, state: &LedgerState) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(&state.snapshot()).map_err(|err| LedgerError::Corrupt(err.to_string()))?;
        let staging = self.path.with_extension("tmp");
        let mut file = fs::File::create(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    async fn mutate(&self, mutation: impl FnOnce(&mut LedgerState) -> Result<()>) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        mutation(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl TransactionLedger for FileLedger {
    async fn insert_coordinator(&self, doc: CoordinatorDoc) -> Result<()> {
        self.mutate(|state| state.insert_coordinator(doc)).await
    }

    async fn update_coordinator(&self, doc: CoordinatorDoc, expected: CoordinatorPhase) -> Result<()> {
        self.mutate(|state| state.update_coordinator(doc, expected)).await
    }

    async fn delete_coordinator(&self, txn: TxnId, expected: CoordinatorPhase) -> Result<()> {
        self.mutate(|state| state.delete_coordinator(txn, expected)).await
    }

    async fn coordinator(&self, txn: TxnId) -> Result<Option<CoordinatorDoc>> {
        Ok(self.state.lock().await.coordinator(txn))
    }

    async fn coordinators(&self) -> Result<Vec<CoordinatorDoc>> {
        Ok(self.state.lock().await.coordinators())
    }

    async fn put_record(&self, shard: &ShardId, record: ParticipantTxnRecord) -> Result<()> {
        self.mutate(|state| {
            state.put_record(shard, record);
            Ok(())
        })
        .await
    }

    async fn record(&self, shard: &ShardId, txn: TxnId) -> Result<Option<ParticipantTxnRecord>> {
        Ok(self.state.lock().await.record(shard, txn))
    }

    async fn records(&self, shard: &ShardId) -> Result<Vec<ParticipantTxnRecord>> {
        Ok(self.state.lock().await.records(shard))
    }

    async fn delete_record(&self, shard: &ShardId, txn: TxnId) -> Result<()> {
        self.mutate(|state| {
            state.delete_record(shard, txn);
            Ok(())
        })
        .await
    }

    async fn put_image(&self, shard: &ShardId, image: ImageEntry) -> Result<()> {
        self.mutate(|state| {
            state.put_image(shard, image);
            Ok(())
        })
        .await
    }

    async fn image(&self, shard: &ShardId, txn: TxnId, statement_id: StatementId) -> Result<Option<ImageEntry>> {
        Ok(self.state.lock().await.image(shard, txn, statement_id))
    }

    async fn images(&self, shard: &ShardId, txn: TxnId) -> Result<Vec<ImageEntry>> {
        Ok(self.state.lock().await.images(shard, txn))
    }

    async fn delete_images(&self, shard: &ShardId, txn: TxnId) -> Result<()> {
        self.mutate(|state| {
            state.delete_images(shard, txn);
            Ok(())
        })
        .await
    }
}
