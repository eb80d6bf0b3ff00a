// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tokio task utilities.
//!
//! Tasks must be named: the name shows up in tracing spans and makes hung
//! task dumps legible. Use [`spawn`] instead of `tokio::spawn` everywhere.

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

/// Spawns a named task onto the current tokio runtime.
///
/// The name closure is only invoked when the task is actually spawned, so
/// callers can format names without paying for it on hot paths that never
/// spawn.
#[track_caller]
pub fn spawn<N, S, F>(name: N, fut: F) -> JoinHandle<F::Output>
where
    N: FnOnce() -> S,
    S: AsRef<str>,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name().as_ref().to_string();
    let span = tracing::debug_span!("task", name = %name);
    tokio::spawn(fut.instrument(span))
}

/// Extension methods for [`JoinHandle`].
pub trait JoinHandleExt<T> {
    /// Converts the handle into one that aborts the task on drop.
    fn abort_on_drop(self) -> AbortOnDropHandle<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDropHandle<T> {
        AbortOnDropHandle(self)
    }
}

/// A [`JoinHandle`] that aborts its task when dropped.
///
/// Owning one of these ties the task's lifetime to the owning structure,
/// which is how connection and flusher tasks are torn down.
#[derive(Debug)]
pub struct AbortOnDropHandle<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDropHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Deref for AbortOnDropHandle<T> {
    type Target = JoinHandle<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn abort_on_drop_aborts() {
        let finished = Arc::new(AtomicBool::new(false));
        let handle = spawn(|| "sleeper", {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                finished.store(true, Ordering::SeqCst);
            }
        })
        .abort_on_drop();
        drop(handle);
        // Give the runtime a tick to process the abort.
        tokio::task::yield_now().await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn awaiting_returns_value() {
        let handle = spawn(|| "answer", async { 42 }).abort_on_drop();
        assert_eq!(handle.await.unwrap(), 42);
    }
}
