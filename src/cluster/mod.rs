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

//! An in-process cluster: shard nodes, routing authority, session registry
//! and transaction ledger wired together behind the same seams a networked
//! deployment would use. Requests still cross the [ParticipantClient]
//! boundary, so delivery failures and node crashes are scriptable.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hashbrown::HashMap;
use tracing::debug;

use crate::clock::Clock;
use crate::command::{
    AbortRequest,
    ClientError,
    CommitRequest,
    ParticipantClient,
    PrepareRequest,
    PrepareVote,
    StatementReply,
    StatementRequest,
};
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::data::{CollectionUuid, DocKey, Document, Namespace};
use crate::fault::{FaultController, NoopFaults};
use crate::ledger::{MemorySessionRegistry, TransactionLedger};
use crate::router::{Router, RouterConfig};
use crate::routing::{MemoryAuthority, RoutingCache, RoutingTable, ShardId};
use crate::shard::{NodeError, ShardNode};
use crate::txn::SessionId;

#[derive(Default)]
struct Nodes {
    shards: spin::Mutex<HashMap<ShardId, Arc<ShardNode>>>,
}

impl Nodes {
    fn get(&self, shard: &ShardId) -> Option<Arc<ShardNode>> {
        self.shards.lock().get(shard).cloned()
    }

    fn insert(&self, node: Arc<ShardNode>) {
        self.shards.lock().insert(node.id().clone(), node);
    }

    fn all(&self) -> Vec<Arc<ShardNode>> {
        self.shards.lock().values().cloned().collect()
    }
}

/// Loopback transport to the cluster's nodes. Deliveries can be severed per
/// shard to stand in for partitions and lost replies.
pub struct LocalParticipantClient {
    nodes: Arc<Nodes>,
    severed: spin::Mutex<HashMap<ShardId, u32>>,
}

impl LocalParticipantClient {
    fn new(nodes: Arc<Nodes>) -> Self {
        Self { nodes, severed: spin::Mutex::default() }
    }

    /// Makes the next `failures` deliveries to `shard` fail with a transport
    /// error before reaching the node.
    pub fn sever(&self, shard: &ShardId, failures: u32) {
        if failures > 0 {
            self.severed.lock().insert(shard.clone(), failures);
        }
    }

    fn deliverable(&self, shard: &ShardId) -> Result<Arc<ShardNode>, ClientError> {
        {
            let mut severed = self.severed.lock();
            if let Some(remaining) = severed.get_mut(shard) {
                *remaining -= 1;
                if *remaining == 0 {
                    severed.remove(shard);
                }
                return Err(ClientError::transport(shard.clone(), "link severed"));
            }
        }
        match self.nodes.get(shard) {
            Some(node) => Ok(node),
            None => Err(ClientError::transport(shard.clone(), "shard offline")),
        }
    }

    fn convert(shard: &ShardId, err: NodeError) -> ClientError {
        match err {
            NodeError::Shard(err) => ClientError::Shard(err),
            // A node that cannot reach its ledger looks no different from an
            // unreachable node: the outcome is unknown, callers retry.
            NodeError::Ledger(err) => ClientError::transport(shard.clone(), err.to_string()),
        }
    }
}

#[async_trait]
impl ParticipantClient for LocalParticipantClient {
    async fn statement(&self, shard: &ShardId, request: StatementRequest) -> Result<StatementReply, ClientError> {
        let node = self.deliverable(shard)?;
        node.statement(request).await.map_err(|err| Self::convert(shard, err))
    }

    async fn prepare(&self, shard: &ShardId, request: PrepareRequest) -> Result<PrepareVote, ClientError> {
        let node = self.deliverable(shard)?;
        node.prepare(request).await.map_err(|err| Self::convert(shard, err))
    }

    async fn commit(&self, shard: &ShardId, request: CommitRequest) -> Result<(), ClientError> {
        let node = self.deliverable(shard)?;
        node.commit(request).await.map_err(|err| Self::convert(shard, err))
    }

    async fn abort(&self, shard: &ShardId, request: AbortRequest) -> Result<(), ClientError> {
        let node = self.deliverable(shard)?;
        node.abort(request).await.map_err(|err| Self::convert(shard, err))
    }
}

pub struct LocalCluster {
    clock: Clock,
    ledger: Arc<dyn TransactionLedger>,
    authority: Arc<MemoryAuthority>,
    cache: Arc<RoutingCache>,
    registry: Arc<MemorySessionRegistry>,
    nodes: Arc<Nodes>,
    client: Arc<LocalParticipantClient>,
}

impl LocalCluster {
    pub fn new(ledger: Arc<dyn TransactionLedger>, shards: &[&str]) -> Self {
        let clock = Clock::new();
        let nodes = Arc::new(Nodes::default());
        for id in shards {
            let shard = ShardId::from(*id);
            nodes.insert(Arc::new(ShardNode::new(shard, clock.clone(), ledger.clone())));
        }
        let authority = Arc::new(MemoryAuthority::new());
        let cache = Arc::new(RoutingCache::new(authority.clone()));
        let client = Arc::new(LocalParticipantClient::new(nodes.clone()));
        Self {
            clock,
            ledger,
            authority,
            cache,
            registry: Arc::new(MemorySessionRegistry::new()),
            nodes,
            client,
        }
    }

    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[inline]
    pub fn ledger(&self) -> &Arc<dyn TransactionLedger> {
        &self.ledger
    }

    #[inline]
    pub fn client(&self) -> &Arc<LocalParticipantClient> {
        &self.client
    }

    #[inline]
    pub fn registry(&self) -> &Arc<MemorySessionRegistry> {
        &self.registry
    }

    pub fn node(&self, shard: &ShardId) -> Option<Arc<ShardNode>> {
        self.nodes.get(shard)
    }

    /// Creates a collection on every node under one shared uuid and routes
    /// the whole namespace to `home`.
    pub async fn create_collection(&self, namespace: Namespace, home: ShardId) -> Result<CollectionUuid> {
        let collection = CollectionUuid::random();
        for node in self.nodes.all() {
            node.create_collection_with(collection, namespace.clone()).await?;
        }
        let table = RoutingTable::single(namespace.clone(), home);
        for node in self.nodes.all() {
            node.install_routing(namespace.clone(), table.version).await;
        }
        self.authority.publish(table);
        Ok(collection)
    }

    /// Splits a namespace at `at`, rehoming the upper part of the containing
    /// chunk to `to`. Nodes learn the bumped version before the authority
    /// publishes it, so a refreshed table is always acceptable to its shards.
    pub async fn split(&self, namespace: &Namespace, at: DocKey, to: ShardId) -> Result<()> {
        let table = self
            .authority
            .table(namespace)
            .ok_or_else(|| anyhow!("namespace {namespace} is not sharded"))?;
        let source_id = table.locate(&at).clone();
        let split = table.split(at.clone(), to.clone());
        let boundary = split.chunks().iter().find(|chunk| chunk.start > at).map(|chunk| chunk.start.clone());

        let source = self.nodes.get(&source_id).ok_or_else(|| anyhow!("unknown shard {source_id}"))?;
        let target = self.nodes.get(&to).ok_or_else(|| anyhow!("unknown shard {to}"))?;
        let collection = source
            .collection_uuid(namespace)
            .await
            .ok_or_else(|| anyhow!("{namespace} missing on {source_id}"))?;

        let extracted = source.extract_range(namespace, &at).await?;
        let (moved, kept): (Vec<_>, Vec<_>) = extracted
            .into_iter()
            .partition(|(key, _)| boundary.as_ref().map_or(true, |boundary| key < boundary));
        if !kept.is_empty() {
            // The source keeps owning ranges above the split target's chunk.
            source.adopt_range(collection, namespace.clone(), kept).await?;
        }
        debug!("splitting {namespace} at {at}: {} documents move {source_id} -> {to}", moved.len());
        target.adopt_range(collection, namespace.clone(), moved).await?;

        for node in self.nodes.all() {
            node.install_routing(namespace.clone(), split.version).await;
        }
        self.authority.publish(split);
        Ok(())
    }

    /// Reboots a shard node as a crash would: durable storage survives,
    /// everything else is rebuilt from the ledger.
    pub async fn crash_shard(&self, shard: &ShardId) -> Result<()> {
        let node = self.nodes.get(shard).ok_or_else(|| anyhow!("unknown shard {shard}"))?;
        let parts = node.parts().await;
        let restored = ShardNode::restore(shard.clone(), self.clock.clone(), self.ledger.clone(), parts).await?;
        self.nodes.insert(Arc::new(restored));
        debug!("shard {shard} rebooted");
        Ok(())
    }

    pub fn coordinator(&self, faults: Arc<dyn FaultController>) -> Coordinator {
        Coordinator::new(
            self.ledger.clone(),
            self.client.clone(),
            self.clock.clone(),
            faults,
            CoordinatorConfig::default(),
        )
    }

    /// Opens a fresh session against this cluster.
    pub fn session(&self) -> Router {
        self.session_with(Arc::new(NoopFaults))
    }

    /// A session whose commits run under the given fault controller.
    pub fn session_with(&self, faults: Arc<dyn FaultController>) -> Router {
        Router::new(
            SessionId::random(),
            RouterConfig::default(),
            self.cache.clone(),
            self.client.clone(),
            self.coordinator(faults),
            self.registry.clone(),
            self.clock.clone(),
        )
    }

    /// Committed read through current routing, outside any transaction.
    pub async fn read(&self, namespace: &Namespace, key: &DocKey) -> Result<Option<Document>> {
        let table = self
            .authority
            .table(namespace)
            .ok_or_else(|| anyhow!("namespace {namespace} is not sharded"))?;
        let shard = table.locate(key).clone();
        let node = self.nodes.get(&shard).ok_or_else(|| anyhow!("unknown shard {shard}"))?;
        Ok(node.read(namespace, key).await?)
    }
}
