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

//! Quilt stitches independently failing shards into one transactional
//! surface. Sessions route statements by key and discover participants as
//! they go; participants stage writes and promise prepared transactions
//! durably; a two-phase coordinator turns the promises into a single
//! decision that survives crashes on either side of the commit point.

pub mod applier;
pub mod clock;
pub mod cluster;
pub mod command;
pub mod coordinator;
pub mod data;
pub mod fault;
pub mod ledger;
pub mod oplog;
pub mod reaper;
pub mod retry;
pub mod router;
pub mod routing;
pub mod shard;
pub mod timer;
pub mod txn;
pub mod utils;
