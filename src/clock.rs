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

use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use static_assertions::{assert_impl_all, assert_not_impl_any};

/// Hybrid logical timestamp. Physical nanoseconds since unix epoch plus a
/// logical counter to order events within the same nanosecond and to absorb
/// timestamps observed from peers whose clocks run ahead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub physical: u64,
    pub logical: u32,
}

impl Timestamp {
    pub const fn zero() -> Self {
        Self { physical: 0, logical: 0 }
    }

    pub const fn is_zero(&self) -> bool {
        self.physical == 0 && self.logical == 0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.physical, self.logical)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self { physical: self.physical + rhs.as_nanos() as u64, logical: self.logical }
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self { physical: self.physical - rhs.as_nanos() as u64, logical: self.logical }
    }
}

#[derive(Clone)]
pub struct Clock {
    inner: Arc<SystemTimeClock>,
}

impl Clock {
    pub fn new() -> Self {
        Self { inner: Arc::new(SystemTimeClock::new()) }
    }

    pub fn now(&self) -> Timestamp {
        self.inner.now()
    }

    /// Folds a timestamp observed from a peer into this clock and returns a
    /// fresh timestamp strictly greater than both the observation and every
    /// timestamp this clock handed out before.
    pub fn update(&self, observed: Timestamp) -> Timestamp {
        self.inner.update(observed)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn system_time_now() -> Timestamp {
    let now = SystemTime::now();
    let elapsed = now.duration_since(SystemTime::UNIX_EPOCH).unwrap();
    Timestamp { physical: elapsed.as_nanos() as u64, logical: 0 }
}

struct SystemTimeClock {
    mutex: spin::Mutex<Timestamp>,
}

assert_impl_all!(SystemTimeClock: Send, Sync);
assert_not_impl_any!(SystemTimeClock: Clone, Copy);

impl SystemTimeClock {
    fn new() -> Self {
        let now = system_time_now();
        Self { mutex: spin::Mutex::new(now) }
    }

    fn now(&self) -> Timestamp {
        let mut now = system_time_now();
        let mut cache = self.mutex.lock();
        if now <= *cache {
            cache.logical += 1;
            now = *cache;
        } else {
            *cache = now;
        }
        now
    }

    fn update(&self, observed: Timestamp) -> Timestamp {
        let mut now = system_time_now();
        let mut cache = self.mutex.lock();
        if observed > *cache {
            *cache = observed;
        }
        if now <= *cache {
            cache.logical += 1;
            now = *cache;
        } else {
            *cache = now;
        }
        now
    }
}
