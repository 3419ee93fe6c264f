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

//! Fault injection for coordinator crash points. Controllers are plain values
//! handed to each coordinator instance, so concurrent tests script faults
//! independently without shared global state.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use thiserror::Error;

/// Boundaries where a coordinator can be made to fail as if the process
/// crashed right there. Each sits immediately before a durable write or a
/// side effect, which is where crash recovery has to prove itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    BeforeParticipantListWrite,
    BeforePrepareSend,
    BeforeDecisionWrite,
    BeforeNotify,
    BeforeCoordinatorDelete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("injected fault at {point:?}")]
pub struct InjectedFault {
    pub point: FaultPoint,
}

#[async_trait]
pub trait FaultController: Send + Sync {
    /// Called on entry to `point`. An error makes the caller unwind without
    /// advancing, simulating a crash at that boundary.
    async fn enter(&self, point: FaultPoint) -> Result<(), InjectedFault>;
}

/// Production controller: never faults.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopFaults;

#[async_trait]
impl FaultController for NoopFaults {
    async fn enter(&self, _point: FaultPoint) -> Result<(), InjectedFault> {
        Ok(())
    }
}

/// Scripted controller: every armed point trips a fixed number of times and
/// then passes. Shared by clone, so a test keeps arming while a coordinator
/// under test keeps running.
#[derive(Clone, Debug, Default)]
pub struct ScriptedFaults {
    table: Arc<spin::Mutex<HashMap<FaultPoint, u32>>>,
}

impl ScriptedFaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, point: FaultPoint, times: u32) {
        self.table.lock().insert(point, times);
    }

    pub fn armed(&self, point: FaultPoint) -> u32 {
        self.table.lock().get(&point).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FaultController for ScriptedFaults {
    async fn enter(&self, point: FaultPoint) -> Result<(), InjectedFault> {
        let mut table = self.table.lock();
        match table.get_mut(&point) {
            Some(times) if *times > 0 => {
                *times -= 1;
                Err(InjectedFault { point })
            },
            _ => Ok(()),
        }
    }
}
