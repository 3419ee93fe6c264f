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

//! Transaction identity and the records persisted on its behalf: the
//! coordinator document driving two-phase commit and the per-participant
//! bookkeeping that makes statements and decisions idempotent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Timestamp;
use crate::data::{CollectionUuid, DocKey, Document};
use crate::routing::ShardId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic per session. A higher number supersedes all lower ones.
pub type TxnNumber = i64;

/// Assigned by the router, monotonic within a transaction, so participants
/// can recognize redelivered statements.
pub type StatementId = u32;

/// Identity of one transaction attempt. `internal` is set for transactions
/// the system starts on behalf of a client operation; they share the parent
/// session's lifetime but are distinct transactions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub session: SessionId,
    pub number: TxnNumber,
    pub internal: Option<Uuid>,
}

impl TxnId {
    pub fn new(session: SessionId, number: TxnNumber) -> Self {
        Self { session, number, internal: None }
    }

    pub fn internal(session: SessionId, number: TxnNumber) -> Self {
        Self { session, number, internal: Some(Uuid::new_v4()) }
    }

    /// Whether this transaction makes `other` defunct on a participant.
    pub fn supersedes(&self, other: &TxnId) -> bool {
        self.session == other.session && self.number > other.number
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.internal {
            None => write!(f, "{}:{}", self.session, self.number),
            Some(uuid) => write!(f, "{}:{}:{}", self.session, self.number, uuid),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantShard {
    pub shard: ShardId,
    pub read_only: bool,
}

impl ParticipantShard {
    pub fn writer(shard: ShardId) -> Self {
        Self { shard, read_only: false }
    }

    pub fn reader(shard: ShardId) -> Self {
        Self { shard, read_only: true }
    }
}

/// Outcome of two-phase commit. A commit timestamp cannot exist without a
/// commit decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnDecision {
    Commit { commit_ts: Timestamp },
    Abort,
}

impl TxnDecision {
    pub fn is_commit(&self) -> bool {
        matches!(self, TxnDecision::Commit { .. })
    }

    pub fn commit_ts(&self) -> Option<Timestamp> {
        match self {
            TxnDecision::Commit { commit_ts } => Some(*commit_ts),
            TxnDecision::Abort => None,
        }
    }
}

impl std::fmt::Display for TxnDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxnDecision::Commit { commit_ts } => write!(f, "commit@{commit_ts}"),
            TxnDecision::Abort => write!(f, "abort"),
        }
    }
}

/// Persisted coordinator phases. The pre-durable state has no phase: a
/// coordinator that never reached [CoordinatorPhase::ParticipantsWritten]
/// left nothing behind and its transaction aborts by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CoordinatorPhase {
    ParticipantsWritten,
    Preparing,
    DecisionWritten,
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorDoc {
    pub txn: TxnId,
    /// Write-once at creation. Prepares and notifications fan out to exactly
    /// this set.
    pub participants: Vec<ParticipantShard>,
    pub phase: CoordinatorPhase,
    pub decision: Option<TxnDecision>,
}

impl CoordinatorDoc {
    pub fn new(txn: TxnId, participants: Vec<ParticipantShard>) -> Self {
        Self { txn, participants, phase: CoordinatorPhase::ParticipantsWritten, decision: None }
    }

    pub fn writers(&self) -> impl Iterator<Item = &ParticipantShard> {
        self.participants.iter().filter(|p| !p.read_only)
    }

    /// Records the decision and advances to [CoordinatorPhase::DecisionWritten].
    /// The decision is write-once: recording the same decision again is a
    /// no-op, a different one is refused.
    pub fn decide(&mut self, decision: TxnDecision) -> bool {
        match self.decision {
            None => {
                self.decision = Some(decision);
                self.phase = CoordinatorPhase::DecisionWritten;
                true
            },
            Some(existing) => existing == decision,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnRecordState {
    InProgress,
    Prepared,
    Committed,
    Aborted,
}

impl TxnRecordState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnRecordState::Committed | TxnRecordState::Aborted)
    }
}

/// A write staged by a statement, kept in the participant's workspace until
/// the decision and persisted inside the prepared record so a restarted
/// participant can still apply it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagedWrite {
    pub collection: CollectionUuid,
    pub key: DocKey,
    /// Commit timestamp of the version this statement observed, zero when
    /// the document did not exist. Prepare revalidates it.
    pub observed_ts: Timestamp,
    pub intent: WriteIntent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteIntent {
    Put(Document),
    Delete,
}

/// Per-participant transaction bookkeeping. Outlives commit and abort:
/// answers "have I executed statement N" and "what was decided" for the
/// whole life of the owning session, until the reaper collects it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantTxnRecord {
    pub txn: TxnId,
    pub state: TxnRecordState,
    pub last_statement_id: Option<StatementId>,
    pub prepared_ts: Option<Timestamp>,
    pub staged: Vec<StagedWrite>,
    pub last_update_ts: Timestamp,
}

impl ParticipantTxnRecord {
    pub fn started(txn: TxnId, now: Timestamp) -> Self {
        Self {
            txn,
            state: TxnRecordState::InProgress,
            last_statement_id: None,
            prepared_ts: None,
            staged: Vec::new(),
            last_update_ts: now,
        }
    }

    pub fn has_executed(&self, statement_id: StatementId) -> bool {
        self.last_statement_id.map(|last| statement_id <= last).unwrap_or(false)
    }
}

/// Pre-image captured by a retrieve-and-update statement so a redelivered
/// statement reproduces its original reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub txn: TxnId,
    pub statement_id: StatementId,
    pub image: Option<Document>,
    pub operation_ts: Timestamp,
}

/// Entry of the session registry. Owned by the session layer; transaction
/// state is reapable exactly when the parent entry is gone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: SessionId,
    pub last_use_ts: Timestamp,
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    fn shard(name: &str) -> ShardId {
        ShardId::new(name)
    }

    #[test]
    fn test_txn_id_supersedes() {
        let session = SessionId::random();
        let txn5 = TxnId::new(session, 5);
        let txn6 = TxnId::new(session, 6);
        assert_that!(txn6.supersedes(&txn5)).is_equal_to(true);
        assert_that!(txn5.supersedes(&txn6)).is_equal_to(false);
        assert_that!(txn5.supersedes(&txn5)).is_equal_to(false);

        let other = TxnId::new(SessionId::random(), 9);
        assert_that!(other.supersedes(&txn5)).is_equal_to(false);
    }

    #[test]
    fn test_internal_txn_distinct() {
        let session = SessionId::random();
        let a = TxnId::internal(session, 3);
        let b = TxnId::internal(session, 3);
        assert_that!(a == b).is_equal_to(false);
        assert_that!(a.supersedes(&b)).is_equal_to(false);
    }

    #[test]
    fn test_decision_write_once() {
        let txn = TxnId::new(SessionId::random(), 1);
        let mut doc = CoordinatorDoc::new(txn, vec![ParticipantShard::writer(shard("s0"))]);
        assert_that!(doc.decision).is_equal_to(None);

        let commit = TxnDecision::Commit { commit_ts: Timestamp { physical: 7, logical: 0 } };
        assert_that!(doc.decide(commit)).is_equal_to(true);
        assert_that!(doc.phase).is_equal_to(CoordinatorPhase::DecisionWritten);

        assert_that!(doc.decide(commit)).is_equal_to(true);
        assert_that!(doc.decide(TxnDecision::Abort)).is_equal_to(false);
        assert_that!(doc.decision).is_equal_to(Some(commit));
    }

    #[test]
    fn test_writers_skip_read_only() {
        let txn = TxnId::new(SessionId::random(), 1);
        let doc = CoordinatorDoc::new(txn, vec![
            ParticipantShard::writer(shard("s0")),
            ParticipantShard::reader(shard("s1")),
            ParticipantShard::writer(shard("s2")),
        ]);
        let writers: Vec<_> = doc.writers().map(|p| p.shard.clone()).collect();
        assert_that!(writers).is_equal_to(vec![shard("s0"), shard("s2")]);
    }

    #[test]
    fn test_record_statement_dedup() {
        let txn = TxnId::new(SessionId::random(), 1);
        let mut record = ParticipantTxnRecord::started(txn, Timestamp::zero());
        assert_that!(record.has_executed(0)).is_equal_to(false);

        record.last_statement_id = Some(3);
        assert_that!(record.has_executed(3)).is_equal_to(true);
        assert_that!(record.has_executed(2)).is_equal_to(true);
        assert_that!(record.has_executed(4)).is_equal_to(false);
    }

    #[test]
    fn test_phase_ordering() {
        assert_that!(CoordinatorPhase::ParticipantsWritten).is_less_than(CoordinatorPhase::Preparing);
        assert_that!(CoordinatorPhase::Preparing).is_less_than(CoordinatorPhase::DecisionWritten);
        assert_that!(CoordinatorPhase::DecisionWritten).is_less_than(CoordinatorPhase::Done);
    }
}
