use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

/// Bounded fan-out over `items`: at most `width` tasks in flight, one error
/// channel drained by this function after the last worker completes. The
/// sender is dropped before draining so the drain loop terminates exactly
/// when every worker has reported.
pub async fn run_pool<T, F, Fut>(width: usize, items: Vec<T>, work: F) -> Vec<anyhow::Error>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(width.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let work = Arc::new(work);

    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        let work = work.clone();
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            if let Err(err) = work(item).await {
                let _ = tx.send(err);
            }
        }));
    }
    drop(tx);

    for handle in handles {
        let _ = handle.await;
    }

    let mut errors = Vec::new();
    while let Ok(err) = rx.try_recv() {
        errors.push(err);
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn pool_runs_every_item_and_collects_errors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let errors = run_pool(4, (0..100).collect(), move |i: i32| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                if i % 10 == 0 {
                    anyhow::bail!("item {i} failed");
                }
                Ok(())
            }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(errors.len(), 10);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let inflight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (inflight2, peak2) = (inflight.clone(), peak.clone());
        let errors = run_pool(8, (0..64).collect(), move |_: i32| {
            let inflight = inflight2.clone();
            let peak = peak2.clone();
            async move {
                let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert!(errors.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 8);
    }
}
