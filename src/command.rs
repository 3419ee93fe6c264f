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

//! The command surface between routers, coordinators and shards, as plain
//! sum types. Transaction markers ride in the request types themselves, so
//! a request without a [TxnId] cannot be constructed.

use async_trait::async_trait;
use compact_str::CompactString;
use thiserror::Error;

use crate::clock::Timestamp;
use crate::data::{CollectionUuid, DocKey, Document, FieldSet, Namespace};
use crate::routing::{ShardId, ShardVersion};
use crate::txn::{StatementId, TxnId};

/// Statement payloads. Single-key by construction; the routing key is the
/// document key.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Insert { doc: Document },
    UpdateSet { key: DocKey, set: FieldSet },
    Delete { key: DocKey },
    Get { key: DocKey },
    /// Retrieve-and-update: applies `set` and replies with the pre-image.
    GetSet { key: DocKey, set: FieldSet },
}

impl Operation {
    pub fn key(&self) -> &DocKey {
        match self {
            Operation::Insert { doc } => &doc.key,
            Operation::UpdateSet { key, .. } => key,
            Operation::Delete { key } => key,
            Operation::Get { key } => key,
            Operation::GetSet { key, .. } => key,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Operation::Get { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatementRequest {
    pub txn: TxnId,
    pub statement_id: StatementId,
    /// Set on the first statement a transaction sends to the target shard.
    /// Without it an unknown transaction is an error, not a fresh start.
    pub start_transaction: bool,
    pub namespace: Namespace,
    pub routing_version: ShardVersion,
    pub op: Operation,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatementReply {
    /// Write acknowledged.
    Done,
    /// Reply of [Operation::Get] and [Operation::GetSet].
    Doc(Option<Document>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PrepareRequest {
    pub txn: TxnId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    WriteConflict,
    Superseded,
    AlreadyAborted,
}

/// A participant's answer to prepare. Voting abort is a successful reply;
/// transport failures stay [ClientError::Transport] and are never votes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PrepareVote {
    Prepared { prepare_ts: Timestamp },
    Abort { reason: AbortReason },
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitRequest {
    pub txn: TxnId,
    pub commit_ts: Timestamp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AbortRequest {
    pub txn: TxnId,
}

/// Errors a shard declares about a request it did receive and examine.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ShardError {
    #[error("stale routing for {namespace}: request at {got}, shard owns {owned}")]
    StaleRouting { namespace: Namespace, got: ShardVersion, owned: ShardVersion },
    #[error("no transaction {txn}")]
    NoSuchTransaction { txn: TxnId },
    #[error("transaction {prepared} is prepared on this shard; {txn} must wait for its decision")]
    PreparedTxnInProgress { txn: TxnId, prepared: TxnId },
    #[error("transaction {txn} was aborted on this shard")]
    TransactionAborted { txn: TxnId },
    #[error("transaction {txn} already committed on this shard")]
    TransactionCommitted { txn: TxnId },
    #[error("duplicate key {key} in collection {collection}")]
    DuplicateKey { collection: CollectionUuid, key: DocKey },
    #[error("namespace {0} does not exist on this shard")]
    NamespaceNotFound(Namespace),
    #[error("namespace {0} already exists on this shard")]
    NamespaceExists(Namespace),
}

impl ShardError {
    /// Whether retrying the whole transaction under a fresh txnNumber may
    /// succeed. This is the `TransientTransactionError` contract; staleness
    /// is deliberately excluded because the router resolves it in place.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShardError::NoSuchTransaction { .. }
                | ShardError::PreparedTxnInProgress { .. }
                | ShardError::TransactionAborted { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ClientError {
    /// Delivery failed or the reply was lost; the outcome on the shard is
    /// unknown.
    #[error("transport to {shard}: {reason}")]
    Transport { shard: ShardId, reason: CompactString },
    #[error(transparent)]
    Shard(#[from] ShardError),
}

impl ClientError {
    pub fn transport(shard: impl Into<ShardId>, reason: impl Into<CompactString>) -> Self {
        Self::Transport { shard: shard.into(), reason: reason.into() }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport { .. })
    }

    /// Splits out the shard-declared error, keeping transport errors intact.
    pub fn into_shard_error(self) -> Result<ShardError, Self> {
        match self {
            ClientError::Shard(err) => Ok(err),
            other => Err(other),
        }
    }
}

/// Transport seam to participant shards. Delivery is at-least-once: callers
/// retry [ClientError::Transport] and every request is idempotent on the
/// receiving side.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    async fn statement(&self, shard: &ShardId, request: StatementRequest) -> Result<StatementReply, ClientError>;
    async fn prepare(&self, shard: &ShardId, request: PrepareRequest) -> Result<PrepareVote, ClientError>;
    async fn commit(&self, shard: &ShardId, request: CommitRequest) -> Result<(), ClientError>;
    async fn abort(&self, shard: &ShardId, request: AbortRequest) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use assertor::*;
    use test_case::test_case;

    use super::*;
    use crate::txn::SessionId;

    fn txn() -> TxnId {
        TxnId::new(SessionId::random(), 1)
    }

    #[test]
    fn test_operation_key() {
        let doc = Document::new("k1").with("v", 1i64);
        assert_that!(Operation::Insert { doc: doc.clone() }.key()).is_equal_to(&DocKey::from("k1"));
        assert_that!(Operation::Get { key: DocKey::from("k2") }.key()).is_equal_to(&DocKey::from("k2"));
        assert_that!(Operation::Insert { doc }.is_read_only()).is_equal_to(false);
        assert_that!(Operation::Get { key: DocKey::from("k2") }.is_read_only()).is_equal_to(true);
    }

    #[test_case(ShardError::NoSuchTransaction { txn: txn() }, true; "no such transaction")]
    #[test_case(ShardError::TransactionAborted { txn: txn() }, true; "transaction aborted")]
    #[test_case(ShardError::PreparedTxnInProgress { txn: txn(), prepared: txn() }, true; "prepared in progress")]
    #[test_case(ShardError::TransactionCommitted { txn: txn() }, false; "transaction committed")]
    #[test_case(ShardError::NamespaceNotFound(Namespace::from("a.b")), false; "namespace not found")]
    #[test_case(ShardError::NamespaceExists(Namespace::from("a.b")), false; "namespace exists")]
    fn test_transient_errors(err: ShardError, transient: bool) {
        assert_that!(err.is_transient()).is_equal_to(transient);
    }

    #[test]
    fn test_client_error_split() {
        let transport = ClientError::transport(ShardId::new("s0"), "connection reset");
        assert_that!(transport.is_transport()).is_equal_to(true);
        assert_that!(transport.into_shard_error().is_err()).is_equal_to(true);

        let shard = ClientError::from(ShardError::NoSuchTransaction { txn: txn() });
        assert_that!(shard.is_transport()).is_equal_to(false);
        assert_that!(shard.into_shard_error().is_ok()).is_equal_to(true);
    }
}
