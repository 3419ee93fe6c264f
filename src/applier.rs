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

//! Replays committed-operation logs into a keyspace. Replay must converge no
//! matter how much of the log already ran, so a closed set of benign
//! outcomes is absorbed and counted; any other failure stops the replay at
//! its index. The set is closed on purpose: widening it hides real
//! divergence between a copy and its source.

use thiserror::Error;
use tracing::debug;

use crate::clock::Timestamp;
use crate::oplog::RecordedOp;
use crate::shard::{Keyspace, StoreError};

pub type Result<T, E = ApplyError> = std::result::Result<T, E>;

/// Replay stopped at `index`. The keyspace holds everything before it.
#[derive(Debug, Error)]
#[error("cannot apply operation {index}: {source}")]
pub struct ApplyError {
    pub index: usize,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: usize,
    /// Drops and renames whose collection was already gone.
    pub collection_gone: usize,
    /// Inserts finding an existing document, applied as replacements.
    pub replaced: usize,
    /// Updates and deletes finding no document.
    pub missing: usize,
}

impl ApplyStats {
    pub fn benign(&self) -> usize {
        self.collection_gone + self.replaced + self.missing
    }
}

/// Applies operations in order onto `keyspace`.
///
/// Creates are replay-safe through uuid addressing rather than through the
/// benign set: recreating an existing uuid refreshes its name and keeps its
/// documents. A create whose name is held by a *different* collection fails;
/// a log with that shape needs a fresh copy, not a replay.
pub fn apply(keyspace: &mut Keyspace, ops: &[(Timestamp, RecordedOp)]) -> Result<ApplyStats> {
    let mut stats = ApplyStats::default();
    for (index, (ts, op)) in ops.iter().enumerate() {
        match op {
            RecordedOp::Create { collection, namespace } => {
                keyspace
                    .create_with(*collection, namespace.clone())
                    .map_err(|source| ApplyError { index, source })?;
                stats.applied += 1;
            },
            RecordedOp::Drop { collection } => match keyspace.drop_uuid(*collection) {
                Ok(()) => stats.applied += 1,
                Err(StoreError::NamespaceGone(_)) => stats.collection_gone += 1,
                Err(source) => return Err(ApplyError { index, source }),
            },
            RecordedOp::Rename { collection, to, drop_target } => {
                if let Some(target) = drop_target {
                    match keyspace.drop_uuid(*target) {
                        Ok(()) | Err(StoreError::NamespaceGone(_)) => (),
                        Err(source) => return Err(ApplyError { index, source }),
                    }
                }
                match keyspace.rename_uuid(*collection, to.clone()) {
                    Ok(()) => stats.applied += 1,
                    Err(StoreError::NamespaceGone(_)) => stats.collection_gone += 1,
                    Err(source) => return Err(ApplyError { index, source }),
                }
            },
            RecordedOp::Insert { collection, doc } => {
                match keyspace.insert(*collection, doc.clone(), *ts) {
                    Ok(()) => stats.applied += 1,
                    Err(StoreError::DuplicateKey { .. }) => {
                        keyspace
                            .upsert(*collection, doc.clone(), *ts)
                            .map_err(|source| ApplyError { index, source })?;
                        stats.replaced += 1;
                    },
                    Err(source) => return Err(ApplyError { index, source }),
                }
            },
            RecordedOp::UpdateSet { collection, key, set } => {
                match keyspace.update_set(*collection, key, set, *ts) {
                    Ok(()) => stats.applied += 1,
                    Err(StoreError::DocumentMissing { .. }) => stats.missing += 1,
                    Err(source) => return Err(ApplyError { index, source }),
                }
            },
            RecordedOp::Delete { collection, key } => match keyspace.remove(*collection, key) {
                Ok(true) => stats.applied += 1,
                Ok(false) => stats.missing += 1,
                Err(source) => return Err(ApplyError { index, source }),
            },
        }
    }
    if stats.benign() != 0 {
        debug!(
            "replayed {} operations: {} applied, {} gone, {} replaced, {} missing",
            ops.len(),
            stats.applied,
            stats.collection_gone,
            stats.replaced,
            stats.missing
        );
    }
    Ok(stats)
}
