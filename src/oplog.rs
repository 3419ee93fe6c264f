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

//! The committed-operation log of a shard. Operations capture collection
//! uuids at record time, so replay is immune to name reuse; the applier
//! replays slices of this log and must converge no matter how often a prefix
//! already ran.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::data::{CollectionUuid, DocKey, Document, FieldSet, Namespace};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RecordedOp {
    Create {
        collection: CollectionUuid,
        namespace: Namespace,
    },
    Drop {
        collection: CollectionUuid,
    },
    /// Rename resolved at record time: the collection to rename and, when
    /// the target name was occupied, the uuid of the collection that was
    /// dropped to make way.
    Rename {
        collection: CollectionUuid,
        to: Namespace,
        drop_target: Option<CollectionUuid>,
    },
    Insert {
        collection: CollectionUuid,
        doc: Document,
    },
    UpdateSet {
        collection: CollectionUuid,
        key: DocKey,
        set: FieldSet,
    },
    Delete {
        collection: CollectionUuid,
        key: DocKey,
    },
}

impl RecordedOp {
    pub fn collection(&self) -> CollectionUuid {
        match self {
            RecordedOp::Create { collection, .. }
            | RecordedOp::Drop { collection }
            | RecordedOp::Rename { collection, .. }
            | RecordedOp::Insert { collection, .. }
            | RecordedOp::UpdateSet { collection, .. }
            | RecordedOp::Delete { collection, .. } => *collection,
        }
    }
}

/// Operations committed together, stamped with their commit timestamp. One
/// entry per committed transaction or standalone DDL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: Timestamp,
    pub ops: Vec<RecordedOp>,
}

/// Append-only in process. Readers take snapshots; the log itself never
/// rewrites history.
#[derive(Debug, Default)]
pub struct Oplog {
    entries: spin::Mutex<Vec<OplogEntry>>,
}

impl Oplog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: OplogEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<OplogEntry> {
        self.entries.lock().clone()
    }

    /// The log flattened to operations in commit order, the applier's input.
    pub fn flatten(&self) -> Vec<(Timestamp, RecordedOp)> {
        self.entries
            .lock()
            .iter()
            .flat_map(|entry| entry.ops.iter().map(move |op| (entry.ts, op.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Clone for Oplog {
    fn clone(&self) -> Self {
        Self { entries: spin::Mutex::new(self.entries()) }
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn test_flatten_keeps_commit_order() {
        let oplog = Oplog::new();
        let coll = CollectionUuid::random();
        oplog.append(OplogEntry {
            ts: Timestamp { physical: 1, logical: 0 },
            ops: vec![RecordedOp::Create { collection: coll, namespace: Namespace::from("a.b") }],
        });
        oplog.append(OplogEntry {
            ts: Timestamp { physical: 2, logical: 0 },
            ops: vec![
                RecordedOp::Insert { collection: coll, doc: Document::new("k1") },
                RecordedOp::Delete { collection: coll, key: DocKey::from("k1") },
            ],
        });

        let flat = oplog.flatten();
        assert_that!(flat.len()).is_equal_to(3);
        assert_that!(flat[0].0).is_equal_to(Timestamp { physical: 1, logical: 0 });
        assert_that!(flat[1].0).is_equal_to(Timestamp { physical: 2, logical: 0 });
        assert_that!(matches!(flat[2].1, RecordedOp::Delete { .. })).is_equal_to(true);
        assert_that!(oplog.len()).is_equal_to(2);
    }
}
