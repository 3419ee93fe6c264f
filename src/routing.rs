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

//! Shard routing: versioned key-range tables, a swap-on-refresh cache for
//! routers, and the authority seam they refresh from. Staleness is a version
//! comparison, never wall clock.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use compact_str::CompactString;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::data::{DocKey, Namespace};

pub type Result<T, E = RoutingError> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(CompactString);

impl ShardId {
    pub fn new(id: impl Into<CompactString>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of a namespace's routing table. The epoch names a table lineage
/// (dropped and recreated namespaces start a new one); major increments on
/// every ownership change within a lineage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardVersion {
    pub epoch: Uuid,
    pub major: u32,
}

impl ShardVersion {
    pub fn initial() -> Self {
        Self { epoch: Uuid::new_v4(), major: 1 }
    }

    pub fn bump(&self) -> Self {
        Self { epoch: self.epoch, major: self.major + 1 }
    }

    /// Mismatch in either component means the holder of `self` and the
    /// holder of `other` are not talking about the same table.
    pub fn mismatches(&self, other: &ShardVersion) -> bool {
        self.epoch != other.epoch || self.major != other.major
    }
}

impl std::fmt::Display for ShardVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.epoch, self.major)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub start: DocKey,
    pub shard: ShardId,
}

/// Key-range partition of one namespace. Chunks are sorted by start key and
/// the first chunk always starts at [DocKey::MIN], so every key lands
/// somewhere.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingTable {
    pub namespace: Namespace,
    pub version: ShardVersion,
    chunks: Vec<Chunk>,
}

impl RoutingTable {
    /// A fresh single-chunk table owning the whole key range.
    pub fn single(namespace: Namespace, shard: ShardId) -> Self {
        Self {
            namespace,
            version: ShardVersion::initial(),
            chunks: vec![Chunk { start: DocKey::MIN, shard }],
        }
    }

    pub fn locate(&self, key: &DocKey) -> &ShardId {
        let index = self.chunks.partition_point(|chunk| chunk.start <= *key);
        &self.chunks[index.saturating_sub(1)].shard
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Splits the chunk containing `at` and hands the upper part to `to`,
    /// bumping the major version. Splitting at an existing boundary rehomes
    /// that chunk instead.
    pub fn split(&self, at: DocKey, to: ShardId) -> Self {
        let mut chunks = self.chunks.clone();
        match chunks.binary_search_by(|chunk| chunk.start.cmp(&at)) {
            Ok(index) => chunks[index].shard = to,
            Err(index) => chunks.insert(index, Chunk { start: at, shard: to }),
        }
        Self { namespace: self.namespace.clone(), version: self.version.bump(), chunks }
    }
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("namespace {0} is not sharded")]
    UnknownNamespace(Namespace),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Source of authoritative routing tables.
#[async_trait]
pub trait RoutingAuthority: Send + Sync {
    async fn load(&self, namespace: &Namespace) -> Result<RoutingTable>;
}

#[derive(Debug)]
struct Slot {
    table: ArcSwap<RoutingTable>,
}

/// Router-side cache. Reads are lock-free once a namespace has a slot;
/// refreshes swap the slot in place so concurrent readers keep a coherent
/// table.
pub struct RoutingCache {
    authority: Arc<dyn RoutingAuthority>,
    slots: spin::Mutex<HashMap<Namespace, Arc<Slot>>>,
}

impl RoutingCache {
    pub fn new(authority: Arc<dyn RoutingAuthority>) -> Self {
        Self { authority, slots: spin::Mutex::default() }
    }

    fn slot(&self, namespace: &Namespace) -> Option<Arc<Slot>> {
        self.slots.lock().get(namespace).cloned()
    }

    pub async fn get(&self, namespace: &Namespace) -> Result<Arc<RoutingTable>> {
        if let Some(slot) = self.slot(namespace) {
            return Ok(slot.table.load_full());
        }
        self.refresh(namespace).await
    }

    pub async fn refresh(&self, namespace: &Namespace) -> Result<Arc<RoutingTable>> {
        let table = Arc::new(self.authority.load(namespace).await?);
        let mut slots = self.slots.lock();
        match slots.get(namespace) {
            Some(slot) => slot.table.store(table.clone()),
            None => {
                let slot = Arc::new(Slot { table: ArcSwap::new(table.clone()) });
                slots.insert(namespace.clone(), slot);
            },
        }
        Ok(table)
    }
}

/// Authority backed by in-process state. The cluster publishes tables here;
/// routers refresh from it.
#[derive(Default)]
pub struct MemoryAuthority {
    tables: spin::Mutex<HashMap<Namespace, RoutingTable>>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, table: RoutingTable) {
        self.tables.lock().insert(table.namespace.clone(), table);
    }

    pub fn table(&self, namespace: &Namespace) -> Option<RoutingTable> {
        self.tables.lock().get(namespace).cloned()
    }
}

#[async_trait]
impl RoutingAuthority for MemoryAuthority {
    async fn load(&self, namespace: &Namespace) -> Result<RoutingTable> {
        match self.tables.lock().get(namespace) {
            Some(table) => Ok(table.clone()),
            None => Err(RoutingError::UnknownNamespace(namespace.clone())),
        }
    }
}
