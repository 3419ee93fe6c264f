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

//! Retry policies as explicit values. Every retry loop owns either a
//! [Backoff] (unbounded, for steps that must eventually succeed, e.g.
//! driving a persisted decision to its participants) or a [Budget] (bounded,
//! for steps that must eventually give up, e.g. routing refreshes). The
//! distinction is visible at the callsite instead of buried in loop shape.

use std::time::Duration;

use rand::Rng;

use crate::timer::Timer;

/// Unbounded pause-and-grow retry. Delay grows by half after every pause up
/// to a cap, with a small random jitter to spread concurrent retriers.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { delay: initial.min(max), max_delay: max, attempts: 0 }
    }

    /// Completed pauses so far.
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[inline]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn pause(&mut self) {
        let jitter = rand::thread_rng().gen_range(0..=self.delay.as_millis() as u64 / 4);
        Timer::after(self.delay + Duration::from_millis(jitter)).await;
        self.attempts += 1;
        let grown = self.delay + Duration::from_millis(self.delay.as_millis() as u64 / 2);
        self.delay = grown.min(self.max_delay);
    }
}

/// Fixed attempt budget. [Budget::spend] hands out attempt numbers until the
/// limit is reached and `None` forever after.
#[derive(Clone, Copy, Debug)]
pub struct Budget {
    limit: u32,
    used: u32,
}

impl Budget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    #[inline]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    #[inline]
    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn spend(&mut self) -> Option<u32> {
        if self.used >= self.limit {
            return None;
        }
        self.used += 1;
        Some(self.used)
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;
    use test_case::test_case;

    use super::*;

    #[test_case(0; "empty budget")]
    #[test_case(1; "single attempt")]
    #[test_case(5; "several attempts")]
    fn test_budget_exhausts(limit: u32) {
        let mut budget = Budget::new(limit);
        for i in 1..=limit {
            assert_that!(budget.spend()).is_equal_to(Some(i));
        }
        assert_that!(budget.spend()).is_equal_to(None);
        assert_that!(budget.spend()).is_equal_to(None);
        assert_that!(budget.used()).is_equal_to(limit);
    }

    #[test_log::test(tokio::test)]
    async fn test_backoff_grows_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(2), Duration::from_millis(5));
        for _ in 0..5 {
            backoff.pause().await;
        }
        assert_that!(backoff.attempts()).is_equal_to(5);
        assert_that!(backoff.delay()).is_equal_to(Duration::from_millis(5));
    }

    #[test_log::test(tokio::test)]
    async fn test_backoff_initial_capped() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_millis(3));
        assert_that!(backoff.delay()).is_equal_to(Duration::from_millis(3));
    }
}
