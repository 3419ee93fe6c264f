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

//! Two-phase commit driven off a persisted state machine. The coordinator
//! writes its participant list and its decision through compare-and-swap
//! phase transitions, so after a crash any process holding the ledger can
//! resume the transaction from its last durable phase, and a superseded
//! instance loses the swap instead of diverging.

mod driver;
mod recovery;

use std::time::Duration;

use thiserror::Error;

pub use self::driver::Coordinator;
pub use self::recovery::resume_all;
use crate::fault::InjectedFault;
use crate::ledger::LedgerError;
use crate::txn::TxnId;

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A compare-and-swap on the coordinator document failed: another
    /// instance owns the transaction now. The decision, if any, is whatever
    /// that instance persisted.
    #[error("coordinator for {txn} superseded")]
    LostCoordinator { txn: TxnId },
    #[error(transparent)]
    Ledger(LedgerError),
    #[error(transparent)]
    Fault(#[from] InjectedFault),
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Per-attempt timeout for one participant call. Timed-out calls retry;
    /// the decision never regresses because of a slow shard.
    pub participant_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    /// Check the participant list for structural problems before spending a
    /// prepare round on it.
    pub verify_participants: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            participant_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            verify_participants: false,
        }
    }
}
