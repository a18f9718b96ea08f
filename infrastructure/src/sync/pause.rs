use std::future::Future;
use std::pin::Pin;
use std::sync::atomic;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

/// A manual-reset gate shared by a supervisor and its workers.
///
/// While paused, any future wrapped with [`PauseToken::attach`] stops making
/// progress at its next poll; `resume` wakes them all. Callers that need to
/// stay cancellable while held at the gate should select over the pausable
/// future and a cancellation token: pausing never blocks cancellation.
#[derive(Debug, Default, Clone)]
pub struct PauseToken(Arc<PauseFlag>);

#[derive(Debug, Default)]
struct PauseFlag {
    set: AtomicBool,
    waker: AtomicWaker,
}

#[pin_project::pin_project]
pub struct PausableFuture<'a, F> {
    #[pin]
    inner: F,
    flag: &'a PauseFlag,
}

/// Resolves once the gate is open. Used at action entry points.
pub struct ReadyFuture<'a>(&'a PauseFlag);

impl PauseToken {
    pub fn pause(&self) {
        self.0.set.store(true, atomic::Ordering::Release);
    }

    pub fn resume(&self) {
        self.0.set.store(false, atomic::Ordering::Release);
        self.0.waker.wake();
    }

    pub fn is_paused(&self) -> bool {
        self.0.set.load(atomic::Ordering::Acquire)
    }

    pub fn attach<F>(&self, future: F) -> PausableFuture<'_, F>
    where
        F: Future,
    {
        PausableFuture {
            inner: future,
            flag: &self.0,
        }
    }

    /// Wait until not paused.
    pub fn wait_ready(&self) -> ReadyFuture<'_> {
        ReadyFuture(&self.0)
    }
}

impl<'a, F> Future for PausableFuture<'a, F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.flag.set.load(atomic::Ordering::Acquire) {
            return self.project().inner.poll(cx);
        }

        self.flag.waker.register(cx.waker());

        // Need to check condition **after** `register` to avoid a race
        // condition that would result in lost notifications.
        if !self.flag.set.load(atomic::Ordering::Acquire) {
            self.project().inner.poll(cx)
        } else {
            Poll::Pending
        }
    }
}

impl Future for ReadyFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.0.set.load(atomic::Ordering::Acquire) {
            return Poll::Ready(());
        }

        self.0.waker.register(cx.waker());

        if !self.0.set.load(atomic::Ordering::Acquire) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn gate_holds_and_releases() {
        let token = PauseToken::default();
        token.pause();
        assert!(token.is_paused());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        token.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_wins_over_pause() {
        let token = PauseToken::default();
        let cancel = tokio_util::sync::CancellationToken::new();
        token.pause();

        let held = {
            let token = token.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.wait_ready() => "resumed",
                    _ = cancel.cancelled() => "cancelled",
                }
            })
        };
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), held).await.unwrap().unwrap();
        assert_eq!(outcome, "cancelled");
    }
}
