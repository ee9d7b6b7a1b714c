//! Unifies cron-style and fixed-interval scheduling into one "run every
//! period, skip if the previous run hasn't finished" abstraction, as a
//! reusable spawner instead of an inlined `loop { select! { .. } }` per
//! background job.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runs `task` every `period`, skipping a tick if the previous invocation
/// is still running rather than queueing ticks up. Returns a handle that,
/// when dropped, does not stop the task; call `.abort()` explicitly to
/// stop it.
pub fn every<F, Fut>(period: Duration, task: F) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if running.swap(true, Ordering::SeqCst) {
                log::debug!("timer: skipping tick, previous run still in progress");
                continue;
            }
            let running = running.clone();
            task().await;
            running.store(false, Ordering::SeqCst);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_once_per_tick_when_task_completes_quickly() {
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let handle = every(Duration::from_millis(10), move || {
            let c3 = c2.clone();
            async move {
                c3.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(55)).await;
        handle.abort();
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn skips_tick_while_previous_run_still_in_flight() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let c2 = concurrent.clone();
        let m2 = max_concurrent.clone();
        let handle = every(Duration::from_millis(5), move || {
            let concurrent = c2.clone();
            let max_concurrent = m2.clone();
            async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(90)).await;
        handle.abort();
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
