// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.
//!
//! [`Retry`] describes a retry operation: exponential backoff with full
//! jitter, a backoff clamp, and a bound on either the number of tries or the
//! total duration. The operation itself decides which errors are permanent
//! via [`RetryResult`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// The result of a single attempt of a retryable operation.
pub enum RetryResult<T, E> {
    /// The operation succeeded; stop retrying.
    Ok(T),
    /// The operation failed transiently; retry if the policy allows.
    RetryableErr(E),
    /// The operation failed permanently; stop retrying.
    FatalErr(E),
}

impl<T, E> From<Result<T, E>> for RetryResult<T, E> {
    fn from(res: Result<T, E>) -> Self {
        match res {
            Ok(t) => RetryResult::Ok(t),
            Err(e) => RetryResult::RetryableErr(e),
        }
    }
}

/// Configures a retry operation.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    /// The backoff applied after the first failed try.
    pub initial_backoff: Duration,
    /// The multiplier applied to the backoff after each failed try.
    pub factor: f64,
    /// The maximum backoff between tries.
    pub clamp_backoff: Duration,
    /// The maximum number of tries, if bounded.
    pub max_tries: Option<usize>,
    /// The maximum total duration, if bounded.
    pub max_duration: Option<Duration>,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::from_secs(8),
            max_tries: None,
            max_duration: None,
        }
    }
}

impl Retry {
    /// Sets the initial backoff.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Sets the backoff clamp.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Bounds the number of tries.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    /// Bounds the total duration of the operation.
    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    /// Retries the asynchronous, fallible operation `f` according to the
    /// policy, sleeping between tries.
    ///
    /// The last error is returned when the policy is exhausted.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = RetryResult<T, E>>,
    {
        let start = Instant::now();
        let mut backoff = self.initial_backoff;
        let mut i = 0;
        loop {
            let state = RetryState { i };
            match f(state).await {
                RetryResult::Ok(t) => return Ok(t),
                RetryResult::FatalErr(e) => return Err(e),
                RetryResult::RetryableErr(e) => {
                    i += 1;
                    if let Some(max_tries) = self.max_tries {
                        if i >= max_tries {
                            return Err(e);
                        }
                    }
                    // Full jitter: sleep a uniformly random fraction of the
                    // current backoff, so herds of retrying clients spread
                    // out.
                    let jittered = backoff.mul_f64(rand::thread_rng().gen_range(0.0..=1.0));
                    if let Some(max_duration) = self.max_duration {
                        if start.elapsed() + jittered >= max_duration {
                            return Err(e);
                        }
                    }
                    tokio::time::sleep(jittered).await;
                    backoff = backoff.mul_f64(self.factor).min(self.clamp_backoff);
                }
            }
        }
    }
}

/// The state of a retry operation, handed to each attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// The attempt number, starting at zero.
    pub i: usize,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let tries = Arc::new(AtomicUsize::new(0));
        let res: Result<usize, &str> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(5)
            .retry_async(|_state| {
                let tries = Arc::clone(&tries);
                async move {
                    if tries.fetch_add(1, Ordering::SeqCst) < 2 {
                        RetryResult::RetryableErr("not yet")
                    } else {
                        RetryResult::Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(7));
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_short_circuits() {
        let tries = Arc::new(AtomicUsize::new(0));
        let res: Result<(), &str> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(5)
            .retry_async(|_state| {
                let tries = Arc::clone(&tries);
                async move {
                    tries.fetch_add(1, Ordering::SeqCst);
                    RetryResult::FatalErr("nope")
                }
            })
            .await;
        assert_eq!(res, Err("nope"));
        assert_eq!(tries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn max_tries_exhausts() {
        let res: Result<(), usize> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(3)
            .retry_async(|state| async move { RetryResult::RetryableErr(state.i) })
            .await;
        assert_eq!(res, Err(2));
    }
}
