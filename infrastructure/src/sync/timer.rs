use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Run `f` every `interval` until it breaks or `cancel` fires.
///
/// This is the cooperative periodic task: one long-running future that
/// awaits on a cancellation-capable sleep, not a detached timer.
pub async fn run<T, F, Fut>(interval: Duration, cancel: CancellationToken, mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<T>>,
{
    let mut interval = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break None,
        }

        if let ControlFlow::Break(ret) = f().await {
            break Some(ret);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn breaks_out_with_value() {
        let hits = Arc::new(AtomicU32::new(0));
        let counted = hits.clone();
        let got = run(Duration::from_secs(300), CancellationToken::new(), move || {
            let hits = counted.clone();
            async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 2 {
                    ControlFlow::Break("done")
                } else {
                    ControlFlow::Continue(())
                }
            }
        })
        .await;
        assert_eq!(got, Some("done"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(run(Duration::from_secs(300), cancel, || async {
                ControlFlow::<()>::Continue(())
            }))
        };
        cancel.cancel();
        let got = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(got, None);
    }
}
