use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Shared pending-queue the dispatch loops pull work from.
///
/// Multi-producer, multi-consumer. `pop` waits up to its timeout and returns
/// `None` on expiry, so consumers can interleave liveness checks with queue
/// polling. Items re-admitted after a worker crash go to the back; pop order
/// across consumers is therefore not FIFO once retries happen.
#[derive(Debug, Default)]
pub struct PendingQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> PendingQueue<T> {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append an item and wake one waiting consumer.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Remove the front item, waiting up to `timeout` for one to appear.
    pub async fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            let notified = self.notify.notified();
            // A push may have landed between the check and the registration.
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.items.lock().pop_front();
            }
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn pop_returns_pushed_item() {
        let queue = PendingQueue::new();
        queue.push(7u64);
        assert_eq!(queue.pop(Duration::from_millis(10)).await, Some(7));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let queue: PendingQueue<u64> = PendingQueue::new();
        let started = std::time::Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(50)).await, None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn pop_wakes_on_concurrent_push() {
        let queue = Arc::new(PendingQueue::new());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(1u64);
        });
        assert_eq!(queue.pop(Duration::from_secs(2)).await, Some(1));
    }

    #[tokio::test]
    async fn each_item_is_delivered_exactly_once() {
        let queue = Arc::new(PendingQueue::new());
        for i in 0..100u64 {
            queue.push(i);
        }

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = queue.pop(Duration::from_millis(20)).await {
                    seen.push(item);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
