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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_io::Timer as IoTimer;
use futures::future::{self, Either};
use thiserror::Error;

enum Inner {
    Ready(Instant),
    Timer(IoTimer),
}

pub struct Timer {
    inner: Inner,
}

impl Timer {
    pub fn ready() -> Timer {
        Self { inner: Inner::Ready(Instant::now()) }
    }

    pub fn after(duration: Duration) -> Timer {
        if duration.is_zero() {
            return Self::ready();
        }
        Self { inner: Inner::Timer(IoTimer::after(duration)) }
    }
}

impl Future for Timer {
    type Output = Instant;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Ready(instant) => Poll::Ready(*instant),
            Inner::Timer(timer) => {
                let timer = unsafe { Pin::new_unchecked(timer) };
                timer.poll(cx)
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
#[error("future timed out after {limit:?}")]
pub struct Elapsed {
    pub limit: Duration,
}

/// Bounds a future with a deadline. The future is dropped on expiry, so this
/// only suits attempts that are safe to abandon and reissue.
pub async fn timeout<F: Future>(limit: Duration, future: F) -> Result<F::Output, Elapsed> {
    futures::pin_mut!(future);
    match future::select(future, Timer::after(limit)).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(_) => Err(Elapsed { limit }),
    }
}
