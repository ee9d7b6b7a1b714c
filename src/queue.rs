//! Bounded-concurrency priority queue used by the Position Monitor so a
//! scan cycle can enqueue work and return immediately instead of awaiting
//! every venue call in line. Items drain emergency-first, then oldest-first,
//! through a fixed number of concurrent workers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

struct Entry<T> {
    emergency: bool,
    age_secs: i64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.emergency == other.emergency && self.age_secs == other.age_secs
    }
}
impl<T> Eq for Entry<T> {}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.emergency.cmp(&other.emergency).then(self.age_secs.cmp(&other.age_secs))
    }
}

/// Enqueue-and-forget priority queue: `push` never awaits the work itself,
/// a single background dispatcher drains the heap under a `Semaphore`
/// concurrency cap and hands each item to its own worker task.
pub struct PriorityQueue<T> {
    heap: Arc<Mutex<BinaryHeap<Entry<T>>>>,
    notify: Arc<Notify>,
}

impl<T: Send + 'static> PriorityQueue<T> {
    pub fn spawn<F, Fut>(concurrency: usize, worker: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let heap: Arc<Mutex<BinaryHeap<Entry<T>>>> = Arc::new(Mutex::new(BinaryHeap::new()));
        let notify = Arc::new(Notify::new());
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let worker = Arc::new(worker);

        let dispatch_heap = heap.clone();
        let dispatch_notify = notify.clone();
        tokio::spawn(async move {
            loop {
                let item = loop {
                    if let Some(entry) = dispatch_heap.lock().unwrap().pop() {
                        break entry.item;
                    }
                    dispatch_notify.notified().await;
                };
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
                let worker = worker.clone();
                tokio::spawn(async move {
                    worker(item).await;
                    drop(permit);
                });
            }
        });

        PriorityQueue { heap, notify }
    }

    /// Enqueues `item` and returns immediately. `emergency` items drain
    /// before any non-emergency item; ties broken oldest (`age_secs`) first.
    pub fn push(&self, item: T, emergency: bool, age_secs: i64) {
        self.heap.lock().unwrap().push(Entry { emergency, age_secs, item });
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[tokio::test]
    async fn drains_emergency_then_oldest_first() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let queue: PriorityQueue<i32> = PriorityQueue::spawn(1, move |item| {
            let seen = seen_clone.clone();
            async move {
                seen.lock().unwrap().push(item);
            }
        });
        queue.push(1, false, 5);
        queue.push(2, false, 50);
        queue.push(3, true, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn respects_concurrency_cap() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let concurrent_clone = concurrent.clone();
        let max_seen_clone = max_seen.clone();
        let queue: PriorityQueue<i32> = PriorityQueue::spawn(2, move |_item| {
            let concurrent = concurrent_clone.clone();
            let max_seen = max_seen_clone.clone();
            async move {
                let now = concurrent.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                concurrent.fetch_sub(1, AtomicOrdering::SeqCst);
            }
        });
        for i in 0..6 {
            queue.push(i, false, i as i64);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(max_seen.load(AtomicOrdering::SeqCst), 2);
    }
}
